//! guppy-core: the runtime core of a multi-tenant chat agent.
//!
//! Owns per-thread conversational state, drives an LLM agent per thread with
//! serialized prompting, and wakes agents on schedules or external triggers.
//! Chat-platform adapters, the LLM agent runner, tool implementations, and
//! the HTTP inspect front-end are external collaborators consumed through
//! the traits in [`chat`] and [`actor::Agent`].

pub mod actor;
pub mod chat;
pub mod compaction;
pub mod config;
pub mod error;
pub mod events;
pub mod inspect;
pub mod orchestrator;
pub mod store;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod thread_id;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Token usage reported by the agent for one assistant turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub cost: Option<Cost>,
}

/// Monetary cost breakdown for a turn, in the provider's billing currency.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Cost {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub total: f64,
}

/// Why an assistant turn ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    EndTurn,
    ToolUse,
    Aborted,
    Error,
    #[serde(other)]
    Other,
}

/// A block of user-authored content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserBlock {
    Text { text: String },
    Image { data: String, mime_type: String },
}

/// A block of assistant-authored content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    Text { text: String },
    Thinking { text: String },
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
}

/// A block of tool-result content returned to the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultBlock {
    Text { text: String },
    Image { data: String, mime_type: String },
}

/// Either plain string content or a sequence of content blocks — user
/// messages may be produced either way by the agent runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<UserBlock>),
}

impl UserContent {
    /// Concatenated text of this content, ignoring image blocks.
    pub fn text(&self) -> String {
        match self {
            UserContent::Text(s) => s.clone(),
            UserContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    UserBlock::Text { text } => Some(text.as_str()),
                    UserBlock::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// One line of `context.jsonl` (§3 `AgentMessage`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum AgentMessage {
    User {
        content: UserContent,
    },
    Assistant {
        content: Vec<AssistantBlock>,
        model: String,
        usage: Usage,
        stop_reason: StopReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    ToolResult {
        tool_call_id: String,
        content: Vec<ToolResultBlock>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl AgentMessage {
    pub fn is_user(&self) -> bool {
        matches!(self, AgentMessage::User { .. })
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, AgentMessage::Assistant { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, AgentMessage::ToolResult { .. })
    }

    /// Whether this message is a non-error, non-aborted assistant turn with
    /// usage accounting — used by the compaction engine's context-token scan.
    pub fn completed_usage(&self) -> Option<&Usage> {
        match self {
            AgentMessage::Assistant {
                usage,
                stop_reason: StopReason::Stop | StopReason::EndTurn | StopReason::ToolUse,
                ..
            } => Some(usage),
            _ => None,
        }
    }
}

/// One line of `log.jsonl` (§3 `LogEntry`). Strictly append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub date: chrono::DateTime<chrono::Utc>,
    pub message_id: String,
    pub thread_id: String,
    pub user_id: String,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_handle: Option<String>,
    pub text: String,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<LogAttachment>>,
}

/// An attachment as recorded in a `LogEntry`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogAttachment {
    pub original: String,
    pub local: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// The target of a dispatched event (§3 `GuppyEvent`): either an existing
/// thread or a channel to post to (creating a new thread).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum EventTarget {
    Thread { thread_id: String },
    Channel { channel_id: String },
}

/// A scheduled event file under `events/*.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuppyEvent {
    Immediate {
        text: String,
        target: EventTarget,
    },
    OneShot {
        text: String,
        target: EventTarget,
        at: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    Periodic {
        text: String,
        target: EventTarget,
        schedule: String,
        timezone: String,
    },
}

impl GuppyEvent {
    pub fn text(&self) -> &str {
        match self {
            GuppyEvent::Immediate { text, .. }
            | GuppyEvent::OneShot { text, .. }
            | GuppyEvent::Periodic { text, .. } => text,
        }
    }

    pub fn target(&self) -> &EventTarget {
        match self {
            GuppyEvent::Immediate { target, .. }
            | GuppyEvent::OneShot { target, .. }
            | GuppyEvent::Periodic { target, .. } => target,
        }
    }

    /// The `scheduleInfo` segment of the dispatched `[EVENT:...]` prefix (§4.4).
    pub fn schedule_info(&self) -> String {
        match self {
            GuppyEvent::Immediate { .. } => "immediate".to_string(),
            GuppyEvent::OneShot { at, .. } => at.clone(),
            GuppyEvent::Periodic { schedule, .. } => schedule.clone(),
        }
    }
}

/// An inbound file attachment reference, as delivered by the chat layer
/// before it has been downloaded to disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundAttachment {
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}
