//! Thread Store (§4.2): append-only channel log, atomic per-thread context
//! snapshot, and attachment handling rooted at a single `dataDir`.

pub mod attachments;
pub mod context;
pub mod log;

pub use attachments::LoadedAttachment;
pub use log::ChannelMeta;

use crate::error::Result;
use crate::thread_id::{ThreadMeta, channel_dir, thread_dir};
use crate::{AgentMessage, InboundAttachment, LogAttachment, LogEntry};
use std::path::PathBuf;

/// Attachments loaded for one prompt: images ready for the agent's image
/// argument, and file paths appended to the prompt text.
#[derive(Debug, Clone, Default)]
pub struct PromptAttachments {
    pub images: Vec<(String, String)>,
    pub file_paths: Vec<PathBuf>,
}

/// Filesystem-backed thread store rooted at `data_dir`.
pub struct ThreadStore {
    data_dir: PathBuf,
    http: reqwest::Client,
}

impl ThreadStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            http: reqwest::Client::new(),
        }
    }

    pub fn channel_dir(&self, meta: &ThreadMeta) -> PathBuf {
        channel_dir(&self.data_dir, meta)
    }

    pub fn thread_dir(&self, meta: &ThreadMeta) -> PathBuf {
        thread_dir(&self.data_dir, meta)
    }

    /// Append a `LogEntry` for a real user message, downloading any
    /// attachments first. Ensures channel/thread directories and the
    /// channel `meta.json` placeholder exist. Download failures are logged
    /// and do not abort the append (§4.2 failure semantics).
    pub async fn log_message(
        &self,
        meta: &ThreadMeta,
        message_id: &str,
        user_id: &str,
        user_name: &str,
        user_handle: Option<&str>,
        text: &str,
        inbound_attachments: Vec<InboundAttachment>,
    ) -> Result<LogEntry> {
        let channel_dir = self.channel_dir(meta);
        let thread_dir = self.thread_dir(meta);
        tokio::fs::create_dir_all(&thread_dir)
            .await
            .map_err(|source| crate::error::StoreError::Write {
                path: thread_dir.display().to_string(),
                source,
            })?;
        log::ensure_meta_placeholder(&channel_dir, &meta.adapter, &meta.channel_key).await?;

        let mut attachments = Vec::new();
        if !inbound_attachments.is_empty() {
            let thread_attachments_rel = PathBuf::from(meta.thread_path_segment().as_ref()).join("attachments");
            let thread_attachments_abs = thread_dir.join("attachments");
            for attachment in &inbound_attachments {
                match attachments::download_attachment(
                    &self.http,
                    &channel_dir,
                    &thread_attachments_rel,
                    &thread_attachments_abs,
                    &attachment.url,
                    &attachment.filename,
                )
                .await
                {
                    Ok(logged) => attachments.push(logged),
                    Err(err) => {
                        tracing::warn!(url = %attachment.url, %err, "attachment download failed");
                    }
                }
            }
        }

        let entry = LogEntry {
            date: chrono::Utc::now(),
            message_id: message_id.to_string(),
            thread_id: meta.thread_id.clone(),
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            user_handle: user_handle.map(str::to_string),
            text: text.to_string(),
            is_bot: false,
            attachments: if attachments.is_empty() { None } else { Some(attachments) },
        };
        log::append_log_entry(&channel_dir, &entry).await?;
        Ok(entry)
    }

    /// Passive append: no download, used for channel-wide observational
    /// messages that don't belong to the addressed thread.
    pub async fn log_channel_message(
        &self,
        meta: &ThreadMeta,
        message_id: &str,
        user_id: &str,
        user_name: &str,
        text: &str,
    ) -> Result<LogEntry> {
        let channel_dir = self.channel_dir(meta);
        log::ensure_meta_placeholder(&channel_dir, &meta.adapter, &meta.channel_key).await?;
        let entry = LogEntry {
            date: chrono::Utc::now(),
            message_id: message_id.to_string(),
            thread_id: meta.thread_id.clone(),
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            user_handle: None,
            text: text.to_string(),
            is_bot: false,
            attachments: None,
        };
        log::append_log_entry(&channel_dir, &entry).await?;
        Ok(entry)
    }

    /// Append a bot-authored `LogEntry` with a synthetic `bot-<ts>` message id.
    pub async fn log_bot_response(&self, meta: &ThreadMeta, text: &str) -> Result<LogEntry> {
        let channel_dir = self.channel_dir(meta);
        log::ensure_meta_placeholder(&channel_dir, &meta.adapter, &meta.channel_key).await?;
        let entry = LogEntry {
            date: chrono::Utc::now(),
            message_id: format!("bot-{}", chrono::Utc::now().timestamp_millis()),
            thread_id: meta.thread_id.clone(),
            user_id: "bot".to_string(),
            user_name: "bot".to_string(),
            user_handle: None,
            text: text.to_string(),
            is_bot: true,
            attachments: None,
        };
        log::append_log_entry(&channel_dir, &entry).await?;
        Ok(entry)
    }

    /// Asynchronously enrich the channel `meta.json` once the adapter has
    /// resolved channel name / DM status. Failures are logged and swallowed.
    pub async fn enrich_channel_meta(&self, meta: &ThreadMeta, name: Option<String>, is_dm: Option<bool>) {
        let channel_dir = self.channel_dir(meta);
        if let Err(err) = log::enrich_meta(&channel_dir, name, is_dm).await {
            tracing::warn!(%err, channel = %meta.channel_id, "channel meta enrichment failed");
        }
    }

    /// Load the thread's message list with trailing-error repair applied.
    pub async fn load_context(&self, meta: &ThreadMeta) -> Vec<AgentMessage> {
        context::load_context(&self.thread_dir(meta)).await
    }

    /// Atomically persist the thread's message list.
    pub async fn save_context(&self, meta: &ThreadMeta, messages: &[AgentMessage]) -> Result<()> {
        context::save_context(&self.thread_dir(meta), messages).await
    }

    /// Resolve images and file paths for a prompt's attachments by scanning
    /// `log.jsonl` for the most recent entry matching `message_id`.
    pub async fn load_attachments(&self, meta: &ThreadMeta, message_id: &str) -> PromptAttachments {
        let channel_dir = self.channel_dir(meta);
        let Some(entry) = log::find_log_entry(&channel_dir, message_id).await else {
            return PromptAttachments::default();
        };
        let mut result = PromptAttachments::default();
        for attachment in entry.attachments.into_iter().flatten() {
            match attachments::load_attachment(&channel_dir, &attachment).await {
                Some(LoadedAttachment::Image { data, mime_type }) => result.images.push((data, mime_type)),
                Some(LoadedAttachment::FilePath(path)) => result.file_paths.push(path),
                None => {
                    tracing::warn!(local = %attachment.local, "attachment file missing or unreadable");
                }
            }
        }
        result
    }

    /// Download an attachment directly, independent of a logged message
    /// (used e.g. by `downloadAttachment` callers outside the log path).
    pub async fn download_attachment(
        &self,
        meta: &ThreadMeta,
        url: &str,
        filename: &str,
    ) -> anyhow::Result<LogAttachment> {
        let channel_dir = self.channel_dir(meta);
        let thread_dir = self.thread_dir(meta);
        let thread_attachments_rel = PathBuf::from(meta.thread_path_segment().as_ref()).join("attachments");
        attachments::download_attachment(
            &self.http,
            &channel_dir,
            &thread_attachments_rel,
            &thread_dir.join("attachments"),
            url,
            filename,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_id::parse_thread_id;

    #[tokio::test]
    async fn log_message_is_append_only_and_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThreadStore::new(dir.path().to_path_buf());
        let meta = parse_thread_id("slack", "slack:C1:T1", None);

        for i in 0..3 {
            store
                .log_message(&meta, &format!("m{i}"), "u1", "Alice", None, "hi", vec![])
                .await
                .unwrap();
        }

        let log_path = store.channel_dir(&meta).join("log.jsonl");
        let raw = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert!(store.channel_dir(&meta).join("meta.json").exists());
        assert!(store.thread_dir(&meta).exists());
    }

    #[tokio::test]
    async fn bot_response_has_synthetic_id_and_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThreadStore::new(dir.path().to_path_buf());
        let meta = parse_thread_id("slack", "slack:C1:T1", None);
        let entry = store.log_bot_response(&meta, "done").await.unwrap();
        assert!(entry.message_id.starts_with("bot-"));
        assert!(entry.is_bot);
    }

    #[tokio::test]
    async fn save_and_load_context_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThreadStore::new(dir.path().to_path_buf());
        let meta = parse_thread_id("slack", "slack:C1:T1", None);
        let messages = vec![crate::AgentMessage::User {
            content: crate::UserContent::Text("hi".to_string()),
        }];
        store.save_context(&meta, &messages).await.unwrap();
        let loaded = store.load_context(&meta).await;
        assert_eq!(loaded, messages);
    }
}
