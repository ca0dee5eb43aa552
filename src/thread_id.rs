//! Composite thread-ID parsing and percent-encoded path segments (§4.1).
//!
//! A composite thread ID has the shape `adapter:channelKey:threadKey`, where
//! `threadKey` may itself contain colons. Some adapters define the channel
//! boundary further in (Discord's 4-segment IDs); those adapters supply a
//! `channel_id_from_thread_id` hook consulted during parsing.

use std::borrow::Cow;

/// Bytes percent-encoded when turning a channel/thread key into a path
/// segment. Deliberately not the `percent-encoding` crate's default set —
/// this one targets filesystem-unsafe characters specifically.
const UNSAFE_BYTES: &[u8] = b"/\\:*?\"<>|%";

fn is_unsafe(byte: u8) -> bool {
    UNSAFE_BYTES.contains(&byte)
}

/// Percent-encode a path segment: any unsafe byte becomes `%HH` (uppercase hex).
///
/// Operates byte-wise, not char-wise: any byte outside the ASCII range is
/// also percent-encoded, even though none of them are in `UNSAFE_BYTES`.
/// `byte as char` only round-trips for bytes `< 0x80` — reusing it for a
/// UTF-8 continuation byte would reinterpret that byte as its own lone
/// Unicode scalar value and re-encode it as a different, longer sequence.
pub fn encode(segment: &str) -> Cow<'_, str> {
    if segment.bytes().all(|b| b.is_ascii() && !is_unsafe(b)) {
        return Cow::Borrowed(segment);
    }
    let mut out = String::with_capacity(segment.len() + 8);
    for byte in segment.bytes() {
        if is_unsafe(byte) || !byte.is_ascii() {
            out.push('%');
            out.push_str(&format!("{byte:02X}"));
        } else {
            out.push(byte as char);
        }
    }
    Cow::Owned(out)
}

/// Inverse of [`encode`]. Malformed `%` escapes (not followed by two hex
/// digits) are passed through literally rather than rejected — this mirrors
/// the forgiving behavior of the teacher's other hand-written sanitizers.
pub fn decode(segment: &str) -> Cow<'_, str> {
    if !segment.contains('%') {
        return Cow::Borrowed(segment);
    }
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3])
                && let Ok(byte) = u8::from_str_radix(hex, 16)
            {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}

/// Parsed composite-ID metadata (§3 `ThreadMeta`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMeta {
    pub adapter: String,
    /// Prefixed form, e.g. `discord:123456`.
    pub channel_id: String,
    /// Prefixed form, e.g. `discord:123456:789`.
    pub thread_id: String,
    /// Unprefixed path-segment form, e.g. `123456`.
    pub channel_key: String,
    /// Unprefixed path-segment form, e.g. `789`.
    pub thread_key: String,
    pub is_dm: Option<bool>,
}

/// Adapter hook used to locate the channel/thread boundary for adapters
/// whose channel id spans more than the first colon-delimited segment
/// (e.g. Discord: `discord:guildId:channelId:threadKey`).
pub trait ChannelBoundary {
    /// Given the full composite thread ID, return the prefixed channel id
    /// (everything up to and including the segment that identifies the
    /// channel). `None` falls back to the default two-colon split.
    fn channel_id_from_thread_id(&self, composite: &str) -> Option<String>;
}

/// Parse a composite thread ID into its parts.
///
/// Without a `boundary` hook, the channel id is the first two colon-
/// separated segments (`adapter:channelKey`) and everything after the
/// second colon is `threadKey`.
pub fn parse_thread_id(
    adapter: &str,
    composite: &str,
    boundary: Option<&dyn ChannelBoundary>,
) -> ThreadMeta {
    let channel_id = boundary
        .and_then(|b| b.channel_id_from_thread_id(composite))
        .unwrap_or_else(|| default_channel_id(composite));

    let channel_key = channel_id
        .strip_prefix(adapter)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(channel_id.as_str())
        .to_string();

    let thread_key = composite
        .strip_prefix(&channel_id)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or("")
        .to_string();

    ThreadMeta {
        adapter: adapter.to_string(),
        thread_id: composite.to_string(),
        channel_id,
        channel_key,
        thread_key,
        is_dm: None,
    }
}

fn default_channel_id(composite: &str) -> String {
    let mut indices = composite.match_indices(':').map(|(i, _)| i);
    match indices.next() {
        Some(first) => match indices.next() {
            Some(second) => composite[..second].to_string(),
            None => composite.to_string(),
        },
        None => composite.to_string(),
    }
}

impl ThreadMeta {
    /// The filesystem path segment for this channel (percent-encoded).
    pub fn channel_path_segment(&self) -> Cow<'_, str> {
        encode(&self.channel_key)
    }

    /// The filesystem path segment for this thread (percent-encoded).
    pub fn thread_path_segment(&self) -> Cow<'_, str> {
        encode(&self.thread_key)
    }

    /// Prefix used by `Orchestrator::broadcast_command` to match every
    /// thread within this channel, e.g. `"discord:123:"`.
    pub fn channel_prefix(&self) -> String {
        format!("{}:", self.channel_id)
    }
}

/// `<dataDir>/<adapter>/<enc(channelKey)>` — the channel directory.
pub fn channel_dir(data_dir: &std::path::Path, meta: &ThreadMeta) -> std::path::PathBuf {
    data_dir
        .join(&meta.adapter)
        .join(meta.channel_path_segment().as_ref())
}

/// `<channelDir>/<enc(threadKey)>` — the thread directory.
pub fn thread_dir(data_dir: &std::path::Path, meta: &ThreadMeta) -> std::path::PathBuf {
    channel_dir(data_dir, meta).join(meta.thread_path_segment().as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let samples = [
            "plain",
            "has/slash",
            "weird:chars*?\"<>|%mix",
            "",
            "percent%25already",
        ];
        for s in samples {
            let encoded = encode(s);
            assert!(!encoded.bytes().any(is_unsafe), "unsafe byte survived encoding of {s:?}");
            assert_eq!(decode(&encoded), s, "round trip failed for {s:?}");
        }
    }

    #[test]
    fn encode_decode_round_trip_non_ascii() {
        let samples = ["café", "émoji 🎉 chan", "日本語チャンネル"];
        for s in samples {
            let encoded = encode(s);
            assert!(encoded.is_ascii(), "non-ASCII byte survived encoding of {s:?}");
            assert_eq!(decode(&encoded), s, "round trip failed for {s:?}");
        }
    }

    #[test]
    fn parses_two_segment_default() {
        let meta = parse_thread_id("adapter", "adapter:C:T", None);
        assert_eq!(meta.channel_key, "C");
        assert_eq!(meta.thread_key, "T");
        assert_eq!(meta.channel_id, "adapter:C");
    }

    #[test]
    fn thread_key_may_contain_colons() {
        let meta = parse_thread_id("slack", "slack:C1:T1:extra", None);
        assert_eq!(meta.channel_key, "C1");
        assert_eq!(meta.thread_key, "T1:extra");
    }

    struct DiscordBoundary;
    impl ChannelBoundary for DiscordBoundary {
        fn channel_id_from_thread_id(&self, composite: &str) -> Option<String> {
            // discord:guild:channel:thread -> channel id is first 3 segments
            let mut indices = composite.match_indices(':').map(|(i, _)| i);
            indices.next()?;
            indices.next()?;
            let third = indices.next()?;
            Some(composite[..third].to_string())
        }
    }

    #[test]
    fn discord_style_four_segment_boundary() {
        let meta = parse_thread_id(
            "discord",
            "discord:guild1:chan1:thread1",
            Some(&DiscordBoundary),
        );
        assert_eq!(meta.channel_key, "guild1:chan1");
        assert_eq!(meta.thread_key, "thread1");
        assert_eq!(meta.channel_prefix(), "discord:guild1:chan1:");
    }

    #[test]
    fn broadcast_prefix_matches_siblings() {
        let t1 = parse_thread_id("slack", "slack:C1:T1", None);
        let t2 = parse_thread_id("slack", "slack:C1:T2", None);
        let t3 = parse_thread_id("slack", "slack:C2:T3", None);
        let prefix = t1.channel_prefix();
        assert!(t1.thread_id.starts_with(&prefix));
        assert!(t2.thread_id.starts_with(&prefix));
        assert!(!t3.thread_id.starts_with(&prefix));
    }
}
