//! Top-level error types for guppy-core.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Compaction(#[from] CompactionError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: std::sync::Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Thread store errors (these always propagate — see §4.2/§7 of the design
/// notes for which store operations instead log-and-swallow).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed log entry in {path}: {source}")]
    MalformedLogEntry {
        path: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Compaction engine errors. Per §4.3, compaction failures never propagate to
/// the caller — `CompactionEngine::compact` always returns the original list
/// on failure and logs via `tracing::warn!` instead of returning `Err`. This
/// type exists for the internal steps that can fail before that boundary.
#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    #[error("summarization call failed: {0}")]
    SummarizationFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Event bus errors.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("malformed event file {path}: {source}")]
    Malformed {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid cron expression {expr}: {source}")]
    InvalidCron {
        expr: String,
        source: cron::error::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
