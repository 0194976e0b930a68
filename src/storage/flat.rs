//! Flat string-keyed storage with a strict capacity.
//!
//! A [`FlatBackend`] is a synchronous map from string keys to string values
//! with a hard byte quota, the shape of a browser-style local store or a
//! settings file. [`FlatAdapter`] JSON-encodes [`StateValue`]s on each call
//! and exposes the backend through the async [`StorageAdapter`] interface.
//!
//! When a write exceeds the quota the adapter evicts roughly a tenth of the
//! keys and retries once. Eviction is FIFO by enumeration order, not LRU:
//! backends here enumerate in insertion order, so the oldest-inserted keys go
//! first regardless of how recently they were read.

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};
use crate::storage::{validate_key, StorageAdapter};
use crate::value::StateValue;

/// Default quota, matching the ~5MB budget of browser local storage.
pub const DEFAULT_FLAT_CAPACITY: usize = 5 * 1024 * 1024;

/// Fraction of keys removed by one eviction pass.
const DEFAULT_EVICTION_RATIO: f64 = 0.1;

/// Synchronous, string-only storage with a capacity limit.
///
/// `set_item` must fail with [`StateError::QuotaExceeded`] when the write
/// would exceed capacity, leaving the previous contents intact. `keys`
/// enumerates in insertion order.
pub trait FlatBackend: Send + Sync {
    /// Read the raw string stored under `key`.
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`.
    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key`. Missing keys are ignored.
    fn remove_item(&self, key: &str) -> Result<()>;

    /// Delete everything.
    fn clear(&self) -> Result<()>;

    /// All keys, oldest insertion first.
    fn keys(&self) -> Result<Vec<String>>;

    /// Bytes currently used (keys plus values).
    fn used_bytes(&self) -> usize;

    /// Hard limit in bytes.
    fn capacity(&self) -> usize;

    /// True if calls do blocking I/O and should stay off async workers.
    fn blocks(&self) -> bool {
        false
    }
}

fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

fn used_by(map: &IndexMap<String, String>) -> usize {
    map.iter().map(|(k, v)| entry_size(k, v)).sum()
}

/// Check that replacing `key` with `value` stays within `capacity`.
fn check_quota(map: &IndexMap<String, String>, key: &str, value: &str, capacity: usize) -> Result<()> {
    let current = used_by(map);
    let replaced = map.get(key).map(|old| entry_size(key, old)).unwrap_or(0);
    let needed = current - replaced + entry_size(key, value);
    if needed > capacity {
        return Err(StateError::QuotaExceeded(format!(
            "writing {key} needs {needed} bytes, capacity is {capacity}"
        )));
    }
    Ok(())
}

/// In-process flat backend with an enforced quota.
pub struct QuotaMemoryBackend {
    items: Mutex<IndexMap<String, String>>,
    capacity: usize,
}

impl QuotaMemoryBackend {
    /// Create a backend with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(IndexMap::new()),
            capacity,
        }
    }
}

impl Default for QuotaMemoryBackend {
    fn default() -> Self {
        Self::new(DEFAULT_FLAT_CAPACITY)
    }
}

impl FlatBackend for QuotaMemoryBackend {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self.items.lock();
        check_quota(&items, key, value, self.capacity)?;
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.items.lock().shift_remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.items.lock().clear();
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.items.lock().keys().cloned().collect())
    }

    fn used_bytes(&self) -> usize {
        used_by(&self.items.lock())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Flat backend persisted as a single JSON object on disk.
///
/// Every mutation rewrites the whole file through a temporary file and an
/// atomic rename, so a crash mid-write leaves the previous contents.
pub struct FileBackend {
    path: PathBuf,
    items: Mutex<IndexMap<String, String>>,
    capacity: usize,
}

impl FileBackend {
    /// Open or create the backing file at `path`.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let items = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                IndexMap::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            IndexMap::new()
        };
        info!(path = %path.display(), keys = items.len(), "opened flat file store");

        Ok(Self {
            path,
            items: Mutex::new(items),
            capacity,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, items: &IndexMap<String, String>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(serde_json::to_string(items)?.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        debug!(path = %self.path.display(), keys = items.len(), "flushed flat file store");
        Ok(())
    }

    /// Apply `change` to a copy of the map, flush it, then swap it in.
    fn mutate(&self, change: impl FnOnce(&mut IndexMap<String, String>) -> Result<()>) -> Result<()> {
        let mut items = self.items.lock();
        let mut next = items.clone();
        change(&mut next)?;
        self.flush(&next)?;
        *items = next;
        Ok(())
    }
}

impl FlatBackend for FileBackend {
    fn blocks(&self) -> bool {
        true
    }

    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let capacity = self.capacity;
        self.mutate(|items| {
            check_quota(items, key, value, capacity)?;
            items.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        if !self.items.lock().contains_key(key) {
            return Ok(());
        }
        self.mutate(|items| {
            items.shift_remove(key);
            Ok(())
        })
    }

    fn clear(&self) -> Result<()> {
        self.mutate(|items| {
            items.clear();
            Ok(())
        })
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.items.lock().keys().cloned().collect())
    }

    fn used_bytes(&self) -> usize {
        used_by(&self.items.lock())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Async adapter over a [`FlatBackend`].
///
/// Calls into a backend that reports [`FlatBackend::blocks`] run on the
/// blocking thread pool; others run inline.
pub struct FlatAdapter<B> {
    backend: Arc<B>,
    eviction_ratio: f64,
}

impl<B: FlatBackend + 'static> FlatAdapter<B> {
    /// Wrap a backend with the default eviction ratio (10%).
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            eviction_ratio: DEFAULT_EVICTION_RATIO,
        }
    }

    /// Override the fraction of keys removed per eviction pass.
    pub fn with_eviction_ratio(mut self, ratio: f64) -> Self {
        self.eviction_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Access the wrapped backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn run<R, F>(&self, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&B) -> Result<R> + Send + 'static,
    {
        if !self.backend.blocks() {
            return op(self.backend.as_ref());
        }
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || op(backend.as_ref()))
            .await
            .map_err(|err| StateError::StorageUnavailable(format!("flat storage task failed: {err}")))?
    }
}

/// Remove the first `ceil(ratio * n)` keys in enumeration order (at least
/// one). Returns the number removed.
fn evict<B: FlatBackend>(backend: &B, ratio: f64) -> Result<usize> {
    let keys = backend.keys()?;
    let count = ((keys.len() as f64 * ratio).ceil() as usize).max(1).min(keys.len());
    for key in keys.iter().take(count) {
        backend.remove_item(key)?;
    }
    warn!(
        evicted = count,
        remaining = keys.len() - count,
        used = backend.used_bytes(),
        capacity = backend.capacity(),
        "flat storage quota exceeded, evicted oldest keys"
    );
    Ok(count)
}

#[async_trait]
impl<B: FlatBackend + 'static> StorageAdapter for FlatAdapter<B> {
    fn kind(&self) -> &'static str {
        "flat"
    }

    async fn get(&self, key: &str) -> Result<Option<StateValue>> {
        validate_key(key)?;
        let key = key.to_string();
        match self.run(move |backend| backend.get_item(&key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &StateValue) -> Result<()> {
        validate_key(key)?;
        let key = key.to_string();
        let encoded = serde_json::to_string(value)?;
        let ratio = self.eviction_ratio;
        self.run(move |backend| match backend.set_item(&key, &encoded) {
            Err(StateError::QuotaExceeded(_)) => {
                evict(backend, ratio)?;
                backend.set_item(&key, &encoded)
            }
            other => other,
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let key = key.to_string();
        self.run(move |backend| backend.remove_item(&key)).await
    }

    async fn clear(&self) -> Result<()> {
        self.run(|backend| backend.clear()).await
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        self.run(|backend| backend.keys()).await
    }

    async fn has(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let key = key.to_string();
        self.run(move |backend| Ok(backend.get_item(&key)?.is_some())).await
    }
}
