//! In-memory storage adapter.
//!
//! This adapter is NOT durable - data is lost on process exit. Use it for
//! tests and for stores that never need to survive a restart.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::{validate_key, StorageAdapter};
use crate::value::StateValue;

/// In-memory implementation of [`StorageAdapter`].
///
/// Cloning shares the underlying map, so two stores built from clones of
/// one adapter see the same "physical" storage.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    data: Arc<RwLock<BTreeMap<String, StateValue>>>,
}

impl MemoryAdapter {
    /// Create a new empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of entries.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if the adapter is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<StateValue>> {
        validate_key(key)?;
        Ok(self.data.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &StateValue) -> Result<()> {
        validate_key(key)?;
        self.data.write().insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.data.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.data.write().clear();
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        Ok(self.data.read().keys().cloned().collect())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.data.read().contains_key(key))
    }
}
