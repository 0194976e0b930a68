//! Engine configuration.
//!
//! Every section has defaults, so an empty document is a valid
//! configuration. Durations are plain milliseconds.
//!
//! ```toml
//! [store]
//! namespace = "dda"
//!
//! [persistence]
//! debounce_ms = 500
//! auto_save_interval_ms = 30000
//!
//! [sync]
//! channel_name = "dda-state-sync"
//! policy = "newest-timestamp"
//!
//! [history]
//! max_history_size = 20
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, StateError};

/// Default debounce before the persistence plugin saves.
pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;

/// Default bound on each key's undo stack.
pub const DEFAULT_MAX_HISTORY_SIZE: usize = 50;

/// Default broadcast channel name for cross-context sync.
pub const DEFAULT_CHANNEL_NAME: &str = "dda-state-sync";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub persistence: PersistenceConfig,
    pub sync: SyncConfig,
    pub history: HistoryConfig,
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| StateError::Config(e.to_string()))
    }

    /// Load from a `.toml` or `.json` file, chosen by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            Some("toml") => Self::from_toml_str(&contents),
            other => Err(StateError::Config(format!(
                "unsupported config extension {other:?} for {}",
                path.display()
            ))),
        }
    }
}

/// Store-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Prefix every storage key with `"{namespace}:"`.
    pub namespace: Option<String>,
    /// Buffered events per watch stream before a slow reader lags.
    pub watch_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            watch_capacity: 1024,
        }
    }
}

impl StoreConfig {
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }
}

/// Persistence plugin settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Quiet period after the last change before saving.
    ///
    /// Every change restarts the timer.
    pub debounce_ms: u64,

    /// Save on a fixed period regardless of activity.
    pub auto_save_interval_ms: Option<u64>,

    /// Save immediately when the host reports it is hidden.
    pub save_on_hide: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            auto_save_interval_ms: None,
            save_on_hide: true,
        }
    }
}

impl PersistenceConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn auto_save_interval(&self) -> Option<Duration> {
        self.auto_save_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// How a context treats a remote value for a key it also writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Apply every remote value in arrival order.
    #[default]
    LastWriteWins,
    /// Drop remote values stamped earlier than the last one applied for
    /// the same key.
    NewestTimestamp,
}

/// Cross-context sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub channel_name: String,
    pub policy: ConflictPolicy,
    /// Messages buffered per context on the shared channel.
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            policy: ConflictPolicy::default(),
            channel_capacity: 256,
        }
    }
}

/// Undo history settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_history_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_history_size: DEFAULT_MAX_HISTORY_SIZE,
        }
    }
}
