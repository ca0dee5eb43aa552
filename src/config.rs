//! Runtime configuration, loaded from TOML with environment overrides and
//! hot-reloadable via `arc_swap`.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level settings. `compaction` and `inspect` are wrapped so a running
/// orchestrator can swap them in without restart, mirroring the
/// `RuntimeConfig` field-per-`ArcSwap` pattern.
#[derive(Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub max_queue_depth: arc_swap::ArcSwap<usize>,
    pub compaction: arc_swap::ArcSwap<CompactionSettings>,
    pub inspect: arc_swap::ArcSwap<Option<InspectConfig>>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("data_dir", &self.data_dir)
            .field("max_queue_depth", &**self.max_queue_depth.load())
            .field("compaction", &**self.compaction.load())
            .finish_non_exhaustive()
    }
}

/// On-disk representation of `Settings`, loaded via the `config`/`toml` crates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsFile {
    pub data_dir: Option<PathBuf>,
    pub max_queue_depth: usize,
    pub compaction: CompactionSettings,
    pub inspect: Option<InspectConfig>,
}

impl Default for SettingsFile {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_queue_depth: default_max_queue_depth(),
            compaction: CompactionSettings::default(),
            inspect: None,
        }
    }
}

fn default_max_queue_depth() -> usize {
    20
}

/// Compaction thresholds. Defaults match §4.3 of the design notes exactly so
/// a missing config file still produces spec-correct behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    pub enabled: bool,
    pub reserve_tokens: u64,
    pub keep_recent_tokens: u64,
    /// Falls back to the model's own window when unset.
    pub context_window: Option<u64>,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reserve_tokens: 16384,
            keep_recent_tokens: 20000,
            context_window: None,
        }
    }
}

/// Signed-inspect-link configuration (§6). When absent, `ThreadActor` never
/// appends an inspect link to a finished run's status message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectConfig {
    pub base_url: String,
    pub secret: String,
}

impl Settings {
    /// Load configuration from a TOML file, falling back to built-in
    /// defaults for any field the file omits. A missing file is not an
    /// error — it is treated the same as an empty file.
    pub fn load(path: &Path) -> Result<Self> {
        let file: SettingsFile = if path.exists() {
            let builder = config::Config::builder()
                .add_source(config::File::from(path))
                .build()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            builder
                .try_deserialize()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?
        } else {
            SettingsFile::default()
        };

        let data_dir = file.data_dir.unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join("guppy"))
                .unwrap_or_else(|| PathBuf::from("./data"))
        });
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        Ok(Self {
            data_dir,
            max_queue_depth: arc_swap::ArcSwap::from_pointee(file.max_queue_depth),
            compaction: arc_swap::ArcSwap::from_pointee(file.compaction),
            inspect: arc_swap::ArcSwap::from_pointee(file.inspect),
        })
    }

    /// Settings with built-in defaults only, rooted at `data_dir`. Used by
    /// tests and by callers that manage configuration themselves.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            max_queue_depth: arc_swap::ArcSwap::from_pointee(default_max_queue_depth()),
            compaction: arc_swap::ArcSwap::from_pointee(CompactionSettings::default()),
            inspect: arc_swap::ArcSwap::from_pointee(None),
        }
    }

    /// Replace the compaction thresholds, e.g. after an on-disk config
    /// change is detected. Takes effect for the next run of every actor.
    pub fn set_compaction(&self, settings: CompactionSettings) {
        self.compaction.store(std::sync::Arc::new(settings));
    }

    /// Replace the inspect-link configuration.
    pub fn set_inspect(&self, inspect: Option<InspectConfig>) {
        self.inspect.store(std::sync::Arc::new(inspect));
    }
}
