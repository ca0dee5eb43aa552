//! Atomic per-thread context snapshot (`context.jsonl`) with trailing-error
//! repair (§4.2, §8 "Context atomicity" / "Trailing-error repair").

use crate::error::{Result, StoreError};
use crate::{AgentMessage, StopReason};
use std::path::Path;

/// Load `context.jsonl` for a thread, applying trailing-error repair.
/// Returns `[]` if the file is missing or malformed — a corrupt context
/// file is never fatal (§7).
pub async fn load_context(thread_dir: &Path) -> Vec<AgentMessage> {
    let path = thread_dir.join("context.jsonl");
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "failed to read context.jsonl");
            return Vec::new();
        }
    };

    let mut messages = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AgentMessage>(line) {
            Ok(message) => messages.push(message),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "malformed context.jsonl, discarding");
                return Vec::new();
            }
        }
    }

    repair_trailing_errors(messages)
}

/// Strip any trailing `(user, assistant with stop_reason=error)` pair,
/// iterated until the tail is clean. Two back-to-back error-assistants with
/// no intervening user leave the second one in place (§9 open question).
fn repair_trailing_errors(mut messages: Vec<AgentMessage>) -> Vec<AgentMessage> {
    loop {
        let len = messages.len();
        if len < 2 {
            break;
        }
        let is_error_assistant = matches!(
            &messages[len - 1],
            AgentMessage::Assistant {
                stop_reason: StopReason::Error,
                ..
            }
        );
        let preceded_by_user = messages[len - 2].is_user();
        if is_error_assistant && preceded_by_user {
            messages.truncate(len - 2);
        } else {
            break;
        }
    }
    messages
}

/// Serialize `messages` to `context.jsonl.tmp` then atomically rename over
/// `context.jsonl`. A crash mid-write never corrupts the prior good file.
pub async fn save_context(thread_dir: &Path, messages: &[AgentMessage]) -> Result<()> {
    tokio::fs::create_dir_all(thread_dir)
        .await
        .map_err(|source| StoreError::Write {
            path: thread_dir.display().to_string(),
            source,
        })?;

    let tmp_path = thread_dir.join("context.jsonl.tmp");
    let final_path = thread_dir.join("context.jsonl");

    let mut body = String::new();
    for message in messages {
        let line = serde_json::to_string(message).map_err(|source| StoreError::MalformedLogEntry {
            path: tmp_path.display().to_string(),
            source,
        })?;
        body.push_str(&line);
        body.push('\n');
    }

    tokio::fs::write(&tmp_path, body)
        .await
        .map_err(|source| StoreError::Write {
            path: tmp_path.display().to_string(),
            source,
        })?;
    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .map_err(|source| StoreError::Write {
            path: final_path.display().to_string(),
            source,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Usage;

    fn user(text: &str) -> AgentMessage {
        AgentMessage::User {
            content: crate::UserContent::Text(text.to_string()),
        }
    }

    fn assistant(stop_reason: StopReason) -> AgentMessage {
        AgentMessage::Assistant {
            content: vec![],
            model: "test".to_string(),
            usage: Usage::default(),
            stop_reason,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let messages = load_context(dir.path()).await;
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let messages = vec![user("hi"), assistant(StopReason::EndTurn)];
        save_context(dir.path(), &messages).await.unwrap();
        let loaded = load_context(dir.path()).await;
        assert_eq!(loaded, messages);
    }

    #[tokio::test]
    async fn garbage_tmp_file_does_not_affect_loaded_context() {
        let dir = tempfile::tempdir().unwrap();
        let messages = vec![user("hi"), assistant(StopReason::EndTurn)];
        save_context(dir.path(), &messages).await.unwrap();

        // Simulate a crash mid-write: tmp file full of garbage, rename never happened.
        tokio::fs::write(dir.path().join("context.jsonl.tmp"), b"not json at all")
            .await
            .unwrap();

        let loaded = load_context(dir.path()).await;
        assert_eq!(loaded, messages);
    }

    #[test]
    fn trailing_error_pair_is_stripped_iteratively() {
        let messages = vec![
            user("q1"),
            assistant(StopReason::EndTurn),
            user("q2"),
            assistant(StopReason::Error),
            user("q3"),
            assistant(StopReason::Error),
        ];
        let repaired = repair_trailing_errors(messages);
        assert_eq!(repaired.len(), 2);
        assert!(repaired[0].is_user());
        assert!(matches!(
            &repaired[1],
            AgentMessage::Assistant { stop_reason: StopReason::EndTurn, .. }
        ));
    }

    #[test]
    fn back_to_back_errors_without_user_stop_at_second() {
        let messages = vec![
            user("q1"),
            assistant(StopReason::Error),
            assistant(StopReason::Error),
        ];
        let repaired = repair_trailing_errors(messages);
        // Tail is [assistant-error, assistant-error]; second_last isn't a
        // user, so the second pop is skipped and the list is unchanged.
        assert_eq!(repaired.len(), 3);
    }
}
