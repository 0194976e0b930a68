//! Storage adapters - the uniform persistence seam under every slice.
//!
//! Every backend, whatever its native synchronicity or capacity, is exposed
//! through the async [`StorageAdapter`] trait so the store can treat them
//! interchangeably:
//!
//! - [`MemoryAdapter`]: in-process map, for tests and non-persistent runs
//! - [`FlatAdapter`]: synchronous string-keyed store with a strict byte quota
//! - [`SqliteAdapter`]: transactional record store with recency indexing
//! - [`NamespacedAdapter`]: prefixes keys so several stores can share one backend

use async_trait::async_trait;

use crate::error::{Result, StateError};
use crate::value::StateValue;

pub mod flat;
pub mod memory;
pub mod namespaced;
pub mod sqlite;

pub use flat::{FileBackend, FlatAdapter, FlatBackend, QuotaMemoryBackend, DEFAULT_FLAT_CAPACITY};
pub use memory::MemoryAdapter;
pub use namespaced::NamespacedAdapter;
pub use sqlite::{SqliteAdapter, StorageEstimate, StoredRecord};

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Validate that a key is well-formed.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StateError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(StateError::InvalidKey(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

/// The persistence interface used by slices and the store.
///
/// All methods are async regardless of the backend. Code should depend on
/// this trait, not on specific implementations.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Short backend name used in logs.
    fn kind(&self) -> &'static str;

    /// Read a value. Returns `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<StateValue>>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: &StateValue) -> Result<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Delete every key this adapter can see.
    async fn clear(&self) -> Result<()>;

    /// List every key this adapter can see.
    async fn get_all_keys(&self) -> Result<Vec<String>>;

    /// Check if a key exists.
    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}
