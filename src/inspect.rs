//! Signed inspect URLs (§6): `baseUrl + "/inspect/" + encodeURIComponent(threadId) +
//! "?sig=" + hmacSha256Hex(secret, threadId)`, verified in constant time.

use crate::config::InspectConfig;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// JS `encodeURIComponent`'s unreserved set: everything else gets `%HH`.
/// Deliberately distinct from [`thread_id::encode`](crate::thread_id::encode),
/// which targets filesystem-unsafe bytes rather than URL-unsafe ones — a
/// thread id containing a space or `#` must still round-trip through a URL.
fn encode_uri_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Build the signed inspect link for `thread_id`, or `None` if inspect is
/// not configured.
pub fn inspect_url(config: Option<&InspectConfig>, thread_id: &str) -> Option<String> {
    let config = config?;
    let sig = sign(&config.secret, thread_id);
    Some(format!(
        "{}/inspect/{}?sig={sig}",
        config.base_url.trim_end_matches('/'),
        encode_uri_component(thread_id)
    ))
}

/// Hex-encoded HMAC-SHA256 of `thread_id` under `secret`.
pub fn sign(secret: &str, thread_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(thread_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex-encoded signature against `thread_id` under `secret`, in
/// constant time with respect to the signature bytes.
pub fn verify(secret: &str, thread_id: &str, sig_hex: &str) -> bool {
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(thread_id.as_bytes());
    mac.verify_slice(&sig_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_url_is_none_without_config() {
        assert_eq!(inspect_url(None, "slack:C:T"), None);
    }

    #[test]
    fn inspect_url_contains_encoded_thread_id_and_signature() {
        let config = InspectConfig {
            base_url: "https://inspect.example.com".to_string(),
            secret: "s3cret".to_string(),
        };
        let url = inspect_url(Some(&config), "slack:C/weird:T").unwrap();
        assert!(url.starts_with("https://inspect.example.com/inspect/"));
        assert!(url.contains(&encode_uri_component("slack:C/weird:T")));
        assert!(url.contains("?sig="));
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let sig = sign("s3cret", "slack:C:T");
        assert!(verify("s3cret", "slack:C:T", &sig));
    }

    #[test]
    fn verify_rejects_wrong_secret_or_thread_id() {
        let sig = sign("s3cret", "slack:C:T");
        assert!(!verify("wrong", "slack:C:T", &sig));
        assert!(!verify("s3cret", "slack:C:other", &sig));
    }

    #[test]
    fn verify_rejects_malformed_hex() {
        assert!(!verify("s3cret", "slack:C:T", "not-hex"));
    }

    #[test]
    fn encode_uri_component_escapes_bytes_path_encoding_would_leave_alone() {
        // A space and `#` are untouched by the filesystem-path encoder
        // (`thread_id::encode`'s unsafe set) but must still be escaped here.
        let encoded = encode_uri_component("room #1 chat");
        assert!(!encoded.contains(' '));
        assert!(!encoded.contains('#'));
        assert_eq!(encoded, "room%20%231%20chat");
    }
}
