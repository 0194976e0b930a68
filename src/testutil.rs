//! Instrumented storage adapters for tests.
//!
//! Feature-gated behind `testutil` so it never ships in production builds.
//! Integration tests enable it through the crate's own dev-dependency.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::{Result, StateError};
use crate::storage::{MemoryAdapter, StorageAdapter};
use crate::value::StateValue;

/// Counts calls on a wrapped adapter. Clones share the counters.
#[derive(Clone)]
pub struct CountingAdapter<A> {
    inner: A,
    gets: Arc<AtomicUsize>,
    sets: Arc<AtomicUsize>,
    removes: Arc<AtomicUsize>,
}

impl<A: StorageAdapter> CountingAdapter<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            gets: Arc::default(),
            sets: Arc::default(),
            removes: Arc::default(),
        }
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: StorageAdapter> StorageAdapter for CountingAdapter<A> {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn get(&self, key: &str) -> Result<Option<StateValue>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &StateValue) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        self.inner.get_all_keys().await
    }
}

/// An adapter whose every operation fails as if the backend were gone.
#[derive(Clone, Default)]
pub struct FailingAdapter;

impl FailingAdapter {
    pub fn new() -> Self {
        Self
    }

    fn unavailable<T>() -> Result<T> {
        Err(StateError::StorageUnavailable("backend offline".to_string()))
    }
}

#[async_trait]
impl StorageAdapter for FailingAdapter {
    fn kind(&self) -> &'static str {
        "failing"
    }

    async fn get(&self, _key: &str) -> Result<Option<StateValue>> {
        Self::unavailable()
    }

    async fn set(&self, _key: &str, _value: &StateValue) -> Result<()> {
        Self::unavailable()
    }

    async fn remove(&self, _key: &str) -> Result<()> {
        Self::unavailable()
    }

    async fn clear(&self) -> Result<()> {
        Self::unavailable()
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        Self::unavailable()
    }
}

/// Memory adapter that logs every operation in order and can hold reads
/// until released, to observe what happens while hydration is pending.
#[derive(Clone)]
pub struct RecordingAdapter {
    inner: MemoryAdapter,
    log: Arc<Mutex<Vec<String>>>,
    read_permits: Option<Arc<Semaphore>>,
}

impl RecordingAdapter {
    /// Reads complete immediately.
    pub fn new(inner: MemoryAdapter) -> Self {
        Self {
            inner,
            log: Arc::default(),
            read_permits: None,
        }
    }

    /// Reads block until [`release_reads`](Self::release_reads).
    pub fn with_held_reads(inner: MemoryAdapter) -> Self {
        Self {
            read_permits: Some(Arc::new(Semaphore::new(0))),
            ..Self::new(inner)
        }
    }

    /// Let `n` held reads complete.
    pub fn release_reads(&self, n: usize) {
        if let Some(permits) = &self.read_permits {
            permits.add_permits(n);
        }
    }

    /// Operations so far, e.g. `get ui.theme` or `set ui.theme="dark"`.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl StorageAdapter for RecordingAdapter {
    fn kind(&self) -> &'static str {
        "recording"
    }

    async fn get(&self, key: &str) -> Result<Option<StateValue>> {
        if let Some(permits) = &self.read_permits {
            permits
                .acquire()
                .await
                .map_err(|e| StateError::StorageUnavailable(e.to_string()))?
                .forget();
        }
        self.log.lock().push(format!("get {key}"));
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &StateValue) -> Result<()> {
        self.log.lock().push(format!("set {key}={value}"));
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.log.lock().push(format!("remove {key}"));
        self.inner.remove(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.log.lock().push("clear".to_string());
        self.inner.clear().await
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        self.inner.get_all_keys().await
    }
}
