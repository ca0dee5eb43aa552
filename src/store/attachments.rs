//! Attachment download, filename sanitization, and MIME sniffing (§4.2,
//! §8 "Image MIME detection").

use crate::LogAttachment;
use std::path::Path;

/// Replace any character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Download `url` into `thread_dir/attachments/<ts>_<sanitized filename>`.
/// `local` in the returned [`LogAttachment`] is relative to `channel_dir`.
pub async fn download_attachment(
    client: &reqwest::Client,
    channel_dir: &Path,
    thread_attachments_dir_rel: &Path,
    thread_attachments_dir_abs: &Path,
    url: &str,
    filename: &str,
) -> anyhow::Result<LogAttachment> {
    tokio::fs::create_dir_all(thread_attachments_dir_abs).await?;

    let response = client.get(url).send().await?.error_for_status()?;
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = response.bytes().await?;

    let ts = chrono::Utc::now().timestamp_millis();
    let safe_name = sanitize_filename(filename);
    let file_name = format!("{ts}_{safe_name}");
    let abs_path = thread_attachments_dir_abs.join(&file_name);
    tokio::fs::write(&abs_path, &bytes).await?;

    let rel_path = thread_attachments_dir_rel.join(&file_name);
    let _ = channel_dir; // retained for symmetry with store::thread_dir callers
    Ok(LogAttachment {
        original: url.to_string(),
        local: rel_path.to_string_lossy().replace('\\', "/"),
        mime_type,
    })
}

/// An attachment as returned to the caller of `loadAttachments`: either an
/// inline image (base64 + detected MIME) or a file-path reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedAttachment {
    Image { data: String, mime_type: String },
    FilePath(std::path::PathBuf),
}

/// Read `channel_dir/<entry.local>` and classify it: declared-image
/// attachments whose magic bytes confirm PNG/JPEG/GIF/WEBP come back as
/// inline base64 images with the *detected* MIME type (never trusting the
/// adapter-reported one); everything else comes back as an absolute path.
pub async fn load_attachment(channel_dir: &Path, entry: &LogAttachment) -> Option<LoadedAttachment> {
    let path = channel_dir.join(&entry.local);
    let bytes = tokio::fs::read(&path).await.ok()?;

    let declared_image = entry
        .mime_type
        .as_deref()
        .is_some_and(|m| m.starts_with("image/"));

    if declared_image
        && let Some(detected) = sniff_image_mime(&bytes)
    {
        use base64::Engine as _;
        let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
        return Some(LoadedAttachment::Image {
            data,
            mime_type: detected.to_string(),
        });
    }

    Some(LoadedAttachment::FilePath(
        path.canonicalize().unwrap_or(path),
    ))
}

/// Sniff magic bytes for PNG, JPEG, GIF, or WEBP. Returns `None` for
/// anything else, including truncated buffers.
fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n";
    const JPEG: &[u8] = b"\xFF\xD8\xFF";
    const GIF87: &[u8] = b"GIF87a";
    const GIF89: &[u8] = b"GIF89a";

    if bytes.starts_with(PNG) {
        return Some("image/png");
    }
    if bytes.starts_with(JPEG) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(GIF87) || bytes.starts_with(GIF89) {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_filename("my file (1).png"), "my_file__1_.png");
        assert_eq!(sanitize_filename("safe-name_1.2.jpg"), "safe-name_1.2.jpg");
    }

    #[test]
    fn sniffs_png_even_with_wrong_declared_mime() {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        assert_eq!(sniff_image_mime(&bytes), Some("image/png"));
    }

    #[test]
    fn sniffs_webp() {
        let mut bytes = b"RIFF".to_vec();
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(b"WEBP");
        assert_eq!(sniff_image_mime(&bytes), Some("image/webp"));
    }

    #[test]
    fn non_image_bytes_are_not_sniffed() {
        assert_eq!(sniff_image_mime(b"not an image at all"), None);
    }

    #[tokio::test]
    async fn load_attachment_rejects_mismatched_claim() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("fake.png"), b"not actually a png")
            .await
            .unwrap();
        let entry = LogAttachment {
            original: "http://example.com/fake.png".to_string(),
            local: "fake.png".to_string(),
            mime_type: Some("image/png".to_string()),
        };
        let loaded = load_attachment(dir.path(), &entry).await.unwrap();
        // Magic bytes don't match, so it falls back to a file-path reference.
        assert!(matches!(loaded, LoadedAttachment::FilePath(_)));
    }
}
