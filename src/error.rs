//! Error types for the state engine.
//!
//! One enum covers every failure the engine surfaces: validation rejections
//! from a slice, storage failures from an adapter, store-level hydration
//! failures and registry misuse (duplicate keys, duplicate plugins).

use thiserror::Error;

/// Errors that can occur while reading, writing or coordinating state.
#[derive(Debug, Error)]
pub enum StateError {
    /// The slice's validator rejected a candidate value. The slice keeps its
    /// previous value.
    #[error("validation failed for {key}: {reason}")]
    Validation { key: String, reason: String },

    /// The physical backend ran out of space (after eviction, if any).
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The backend cannot be reached or opened.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A backend transaction failed to commit.
    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    /// Store-level hydration failed. Slices still fall back to their defaults.
    #[error("hydration failed: {0}")]
    Hydration(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A slice with this key is already registered.
    #[error("slice already registered: {0}")]
    DuplicateSlice(String),

    /// No slice is registered under this key (or it has another value type).
    #[error("slice not found: {0}")]
    SliceNotFound(String),

    /// A plugin with this name is already installed.
    #[error("plugin already installed: {0}")]
    DuplicatePlugin(String),

    /// No plugin is installed under this name.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Database error from SQLx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for state operations.
pub type Result<T> = std::result::Result<T, StateError>;

impl StateError {
    /// Create a validation error for `key`.
    pub fn validation(key: impl Into<String>, reason: impl Into<String>) -> Self {
        StateError::Validation {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error came from a storage backend.
    ///
    /// Storage errors never roll back an in-memory commit; callers that see
    /// one can surface it as a non-blocking notification.
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            StateError::QuotaExceeded(_)
                | StateError::StorageUnavailable(_)
                | StateError::TransactionFailed(_)
                | StateError::Database(_)
                | StateError::Io(_)
        )
    }

    /// Returns true if this is a validation rejection.
    pub fn is_validation_error(&self) -> bool {
        matches!(self, StateError::Validation { .. })
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for StateError {
    fn from(err: toml::de::Error) -> Self {
        StateError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = StateError::validation("ui.theme", "expected one of light, dark, system");
        assert!(err.to_string().contains("ui.theme"));
        assert!(err.to_string().contains("expected one of"));
        assert!(err.is_validation_error());
    }

    #[test]
    fn test_storage_errors() {
        assert!(StateError::QuotaExceeded("full".to_string()).is_storage_error());
        assert!(StateError::StorageUnavailable("gone".to_string()).is_storage_error());
        assert!(StateError::TransactionFailed("abort".to_string()).is_storage_error());
        assert!(!StateError::validation("k", "bad").is_storage_error());
        assert!(!StateError::DuplicateSlice("k".to_string()).is_storage_error());
    }

    #[test]
    fn test_from_serde_json() {
        let err: StateError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, StateError::Serialization(_)));
    }
}
