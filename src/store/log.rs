//! Append-only channel log (`log.jsonl`) and channel `meta.json`.

use crate::error::{Result, StoreError};
use crate::LogEntry;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Channel-level metadata, written once as a placeholder on first message
/// and optionally enriched later once the adapter resolves channel info.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelMeta {
    pub adapter: String,
    pub channel_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_dm: Option<bool>,
}

/// Append one line to `channel_dir/log.jsonl`. Each line is a single
/// `write` syscall worth of bytes so concurrent writers from other threads
/// in the same channel never interleave partial lines (§5 shared-resource
/// policy).
pub async fn append_log_entry(channel_dir: &Path, entry: &LogEntry) -> Result<()> {
    tokio::fs::create_dir_all(channel_dir)
        .await
        .map_err(|source| StoreError::Write {
            path: channel_dir.display().to_string(),
            source,
        })?;

    let mut line = serde_json::to_string(entry).map_err(|source| StoreError::MalformedLogEntry {
        path: channel_dir.join("log.jsonl").display().to_string(),
        source,
    })?;
    line.push('\n');

    let path = channel_dir.join("log.jsonl");
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|source| StoreError::Write {
            path: path.display().to_string(),
            source,
        })?;
    file.write_all(line.as_bytes())
        .await
        .map_err(|source| StoreError::Write {
            path: path.display().to_string(),
            source,
        })?;
    Ok(())
}

/// Write a placeholder `meta.json` if one doesn't already exist. Never
/// overwrites an existing file — enrichment happens via [`enrich_meta`].
pub async fn ensure_meta_placeholder(channel_dir: &Path, adapter: &str, channel_key: &str) -> Result<()> {
    let path = channel_dir.join("meta.json");
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(());
    }
    let meta = ChannelMeta {
        adapter: adapter.to_string(),
        channel_key: channel_key.to_string(),
        name: None,
        is_dm: None,
    };
    write_meta(channel_dir, &meta).await
}

/// Overwrite `meta.json` with enriched channel info (name, DM flag), once
/// the chat adapter has resolved it. Failures here are logged and
/// swallowed by the caller — enrichment is best-effort.
pub async fn enrich_meta(channel_dir: &Path, name: Option<String>, is_dm: Option<bool>) -> Result<()> {
    let path = channel_dir.join("meta.json");
    let mut meta: ChannelMeta = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::MalformedLogEntry {
            path: path.display().to_string(),
            source,
        })?,
        Err(_) => return Ok(()),
    };
    if name.is_some() {
        meta.name = name;
    }
    if is_dm.is_some() {
        meta.is_dm = is_dm;
    }
    write_meta(channel_dir, &meta).await
}

async fn write_meta(channel_dir: &Path, meta: &ChannelMeta) -> Result<()> {
    tokio::fs::create_dir_all(channel_dir)
        .await
        .map_err(|source| StoreError::Write {
            path: channel_dir.display().to_string(),
            source,
        })?;
    let path = channel_dir.join("meta.json");
    let body = serde_json::to_string_pretty(meta).map_err(|source| StoreError::MalformedLogEntry {
        path: path.display().to_string(),
        source,
    })?;
    tokio::fs::write(&path, body)
        .await
        .map_err(|source| StoreError::Write {
            path: path.display().to_string(),
            source,
        })
}

/// Scan `channel_dir/log.jsonl` from tail to head for the most recent entry
/// with the given message id. Tolerates a partial final line (the writer may
/// be mid-append in another process).
pub async fn find_log_entry(channel_dir: &Path, message_id: &str) -> Option<LogEntry> {
    let path = channel_dir.join("log.jsonl");
    let raw = tokio::fs::read_to_string(&path).await.ok()?;
    raw.lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<LogEntry>(line).ok())
        .find(|entry| entry.message_id == message_id)
}
