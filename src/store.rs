//! The state store: registry of slices, middleware pipeline, plugin
//! registry and global change stream.
//!
//! [`StateStore`] is a cheap `Clone` handle. Construct one at startup,
//! register slices on it, and call [`StateStore::shutdown`] when done.
//! Plugins keep a [`WeakStateStore`] so they never keep the store alive.
//!
//! Every slice registered here gets an internal forwarder subscribed to it.
//! The forwarder erases the event's value type and runs the store pipeline:
//!
//! 1. bump the global event counter;
//! 2. `before_change` of each middleware in order, stopping at the first
//!    that returns `false`;
//! 3. global listeners (plugins included), then watch streams;
//! 4. `after_change` of each middleware in order.
//!
//! The slice has already committed and persisted the value by step 2, so a
//! veto only suppresses steps 3 and 4.

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{Result, StateError};
use crate::event::{dispatch_guarded, source, ChangeEvent, ListenerId};
use crate::middleware::Middleware;
use crate::plugin::Plugin;
use crate::slice::{ErasedSlice, SliceConfig, StateSlice};
use crate::storage::{MemoryAdapter, NamespacedAdapter, StorageAdapter};
use crate::value::{SliceValue, StateValue};
use crate::watch::{WatchSender, WatchStream};

type GlobalListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct SliceEntry {
    erased: Arc<dyn ErasedSlice>,
    typed: Arc<dyn Any + Send + Sync>,
    forwarder: ListenerId,
}

struct StoreInner {
    storage: Arc<dyn StorageAdapter>,
    slices: RwLock<IndexMap<String, SliceEntry>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
    listeners: RwLock<Vec<(ListenerId, GlobalListener)>>,
    next_listener: AtomicU64,
    event_count: AtomicU64,
    hydrate_started: AtomicBool,
    ready: watch::Sender<bool>,
    watchers: WatchSender,
}

impl StoreInner {
    fn dispatch(&self, event: &ChangeEvent) {
        self.event_count.fetch_add(1, Ordering::Relaxed);

        let middleware: Vec<Arc<dyn Middleware>> = self.middleware.read().clone();
        for mw in &middleware {
            let mut proceed = true;
            dispatch_guarded(&event.key, mw.name(), || match mw.before_change(event) {
                Ok(verdict) => proceed = verdict,
                Err(err) => {
                    warn!(key = %event.key, middleware = mw.name(), error = %err, "before_change failed");
                }
            });
            if !proceed {
                debug!(key = %event.key, middleware = mw.name(), "notification vetoed");
                return;
            }
        }

        let listeners: Vec<GlobalListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            dispatch_guarded(&event.key, "global listener", || listener(event));
        }
        self.watchers.send(event.clone());

        for mw in &middleware {
            dispatch_guarded(&event.key, mw.name(), || {
                if let Err(err) = mw.after_change(event) {
                    warn!(key = %event.key, middleware = mw.name(), error = %err, "after_change failed");
                }
            });
        }
    }
}

/// Handle to a state store.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

/// Non-owning handle to a state store.
#[derive(Clone)]
pub struct WeakStateStore {
    inner: Weak<StoreInner>,
}

impl WeakStateStore {
    /// The store, if it is still alive.
    pub fn upgrade(&self) -> Option<StateStore> {
        self.inner.upgrade().map(|inner| StateStore { inner })
    }
}

impl StateStore {
    /// Create a store over `storage` with default settings.
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self::with_config(storage, &StoreConfig::default())
    }

    /// Create a store, namespacing storage keys if configured.
    pub fn with_config(storage: Arc<dyn StorageAdapter>, config: &StoreConfig) -> Self {
        let storage: Arc<dyn StorageAdapter> = match &config.namespace {
            Some(namespace) => Arc::new(NamespacedAdapter::new(storage, namespace)),
            None => storage,
        };
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(StoreInner {
                storage,
                slices: RwLock::new(IndexMap::new()),
                middleware: RwLock::new(Vec::new()),
                plugins: Mutex::new(Vec::new()),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                event_count: AtomicU64::new(0),
                hydrate_started: AtomicBool::new(false),
                ready,
                watchers: WatchSender::new(config.watch_capacity.max(1)),
            }),
        }
    }

    /// Create a store backed by a fresh in-memory adapter.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAdapter::new()))
    }

    pub fn downgrade(&self) -> WeakStateStore {
        WeakStateStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The storage adapter slices persist to (namespaced if configured).
    pub fn storage(&self) -> Arc<dyn StorageAdapter> {
        Arc::clone(&self.inner.storage)
    }

    // =========================================================================
    // Slices
    // =========================================================================

    /// Create and register a slice.
    ///
    /// Fails with [`StateError::DuplicateSlice`] if the key is taken. A
    /// persistent slice starts hydrating immediately, so this must be called
    /// within a Tokio runtime.
    pub fn register_slice<T: SliceValue>(&self, config: SliceConfig<T>) -> Result<Arc<StateSlice<T>>> {
        let mut slices = self.inner.slices.write();
        if slices.contains_key(config.key()) {
            return Err(StateError::DuplicateSlice(config.key().to_string()));
        }

        let slice = StateSlice::new(config, Some(Arc::clone(&self.inner.storage)))?;
        let weak = Arc::downgrade(&self.inner);
        let forwarder = slice.subscribe(move |event: &ChangeEvent<T>| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match event.to_json() {
                Ok(event) => inner.dispatch(&event),
                Err(err) => warn!(key = %event.key, error = %err, "could not forward change event"),
            }
        });

        let key = slice.key().to_string();
        debug!(
            key = %key,
            persistent = slice.config().is_persistent(),
            sync = slice.config().syncs_across_instances(),
            "slice registered"
        );
        slices.insert(
            key,
            SliceEntry {
                erased: Arc::clone(&slice) as Arc<dyn ErasedSlice>,
                typed: Arc::clone(&slice) as Arc<dyn Any + Send + Sync>,
                forwarder,
            },
        );
        Ok(slice)
    }

    /// Look up a slice by key. `None` if absent or registered with another
    /// value type.
    pub fn get_slice<T: SliceValue>(&self, key: &str) -> Option<Arc<StateSlice<T>>> {
        let typed = Arc::clone(&self.inner.slices.read().get(key)?.typed);
        match typed.downcast::<StateSlice<T>>() {
            Ok(slice) => Some(slice),
            Err(_) => {
                debug!(key, "slice registered with a different value type");
                None
            }
        }
    }

    pub fn has_slice(&self, key: &str) -> bool {
        self.inner.slices.read().contains_key(key)
    }

    /// Registered keys in registration order.
    pub fn slice_keys(&self) -> Vec<String> {
        self.inner.slices.read().keys().cloned().collect()
    }

    /// Dispose a slice and forget it. Its stored value is left in place.
    pub fn unregister_slice(&self, key: &str) -> Result<()> {
        let entry = self
            .inner
            .slices
            .write()
            .shift_remove(key)
            .ok_or_else(|| StateError::SliceNotFound(key.to_string()))?;
        entry.erased.unsubscribe(entry.forwarder);
        entry.erased.dispose();
        debug!(key, "slice unregistered");
        Ok(())
    }

    pub(crate) fn erased_slice(&self, key: &str) -> Option<Arc<dyn ErasedSlice>> {
        self.inner
            .slices
            .read()
            .get(key)
            .map(|entry| Arc::clone(&entry.erased))
    }

    fn erased_slices(&self) -> Vec<Arc<dyn ErasedSlice>> {
        self.inner
            .slices
            .read()
            .values()
            .map(|entry| Arc::clone(&entry.erased))
            .collect()
    }

    /// Write a JSON value to a slice without knowing its type.
    pub async fn set_slice_value(&self, key: &str, value: StateValue, source: &str) -> Result<()> {
        let slice = self
            .erased_slice(key)
            .ok_or_else(|| StateError::SliceNotFound(key.to_string()))?;
        slice.set_value_json(value, source).await
    }

    /// True if the slice under `key` is broadcast across contexts.
    pub fn slice_syncs(&self, key: &str) -> bool {
        self.erased_slice(key)
            .is_some_and(|slice| slice.syncs_across_instances())
    }

    // =========================================================================
    // Bulk load / save
    // =========================================================================

    /// Mark the store ready once storage is reachable and every registered
    /// slice has finished hydrating.
    ///
    /// Runs once; later calls log a warning and return immediately. If
    /// storage cannot be enumerated the call fails with
    /// [`StateError::Hydration`] and may be retried. Slices keep their own
    /// fallback defaults either way.
    pub async fn hydrate(&self) -> Result<()> {
        if self.inner.hydrate_started.swap(true, Ordering::SeqCst) {
            warn!("state store already hydrated");
            return Ok(());
        }

        let stored_keys = match self.inner.storage.get_all_keys().await {
            Ok(keys) => keys,
            Err(err) => {
                self.inner.hydrate_started.store(false, Ordering::SeqCst);
                return Err(StateError::Hydration(err.to_string()));
            }
        };

        let slices = self.erased_slices();
        for slice in &slices {
            slice.wait_for_initialization().await;
        }

        self.inner.ready.send_replace(true);
        info!(
            slices = slices.len(),
            stored_keys = stored_keys.len(),
            backend = self.inner.storage.kind(),
            "state store hydrated"
        );
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Wait until [`hydrate`](Self::hydrate) has completed.
    pub async fn wait_until_ready(&self) {
        let mut rx = self.inner.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Write every persistent slice to storage.
    ///
    /// A failing slice is logged and skipped. Returns how many were written.
    pub async fn dehydrate(&self) -> usize {
        let mut written = 0;
        for slice in self.erased_slices() {
            if !slice.is_persistent() {
                continue;
            }
            match slice.persist().await {
                Ok(()) => written += 1,
                Err(err) => warn!(key = slice.key(), error = %err, "failed to persist slice"),
            }
        }
        debug!(written, "state store dehydrated");
        written
    }

    /// Reset every slice to its default, then clear storage (only this
    /// store's namespace when one is configured).
    pub async fn reset(&self) -> Result<()> {
        for slice in self.erased_slices() {
            if let Err(err) = slice.reset().await {
                warn!(key = slice.key(), error = %err, "failed to reset slice");
            }
        }
        self.inner.storage.clear().await?;
        info!("state store reset");
        Ok(())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Current value of every slice.
    pub fn export_state(&self) -> Result<StateSnapshot> {
        let mut values = BTreeMap::new();
        for slice in self.erased_slices() {
            values.insert(slice.key().to_string(), slice.value_json()?);
        }
        Ok(StateSnapshot { values })
    }

    /// Apply a snapshot. Unknown keys are skipped and slices missing from
    /// the snapshot keep their value. A value that does not fit its slice is
    /// logged and skipped. Returns how many keys were applied.
    pub async fn import_state(&self, snapshot: &StateSnapshot) -> usize {
        let mut applied = 0;
        for (key, value) in &snapshot.values {
            let Some(slice) = self.erased_slice(key) else {
                debug!(key = %key, "snapshot key has no slice, skipping");
                continue;
            };
            match slice.set_value_json(value.clone(), source::IMPORT).await {
                Ok(()) => applied += 1,
                Err(err) => warn!(key = %key, error = %err, "snapshot value rejected"),
            }
        }
        info!(applied, total = snapshot.len(), "snapshot imported");
        applied
    }

    // =========================================================================
    // Middleware, plugins and listeners
    // =========================================================================

    /// Append a middleware to the pipeline.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        debug!(middleware = middleware.name(), "middleware added");
        self.inner.middleware.write().push(middleware);
    }

    /// Remove the middleware registered under `name`. Returns false if
    /// there was none.
    pub fn remove_middleware(&self, name: &str) -> bool {
        let mut middleware = self.inner.middleware.write();
        let before = middleware.len();
        middleware.retain(|mw| mw.name() != name);
        middleware.len() != before
    }

    /// Install a plugin. Names are unique per store.
    pub fn install_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let name = plugin.name().to_string();
        if self.plugin_names().contains(&name) {
            return Err(StateError::DuplicatePlugin(name));
        }
        plugin.install(self)?;

        let mut plugins = self.inner.plugins.lock();
        if plugins.iter().any(|p| p.name() == name) {
            drop(plugins);
            if let Err(err) = plugin.uninstall(self) {
                warn!(plugin = %name, error = %err, "failed to roll back duplicate plugin");
            }
            return Err(StateError::DuplicatePlugin(name));
        }
        plugins.push(plugin);
        info!(plugin = %name, "plugin installed");
        Ok(())
    }

    /// Uninstall the plugin registered under `name`, releasing its tasks.
    pub fn uninstall_plugin(&self, name: &str) -> Result<()> {
        let plugin = {
            let mut plugins = self.inner.plugins.lock();
            let index = plugins
                .iter()
                .position(|p| p.name() == name)
                .ok_or_else(|| StateError::PluginNotFound(name.to_string()))?;
            plugins.remove(index)
        };
        plugin.uninstall(self)?;
        info!(plugin = name, "plugin uninstalled");
        Ok(())
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.inner
            .plugins
            .lock()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Listen to every change that passes the middleware pipeline.
    pub fn on_state_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Stop a listener. Returns false if it was not registered.
    pub fn off_state_change(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Stream of notified changes whose key matches `pattern` (exact, or a
    /// prefix when it ends with `*`).
    pub fn watch(&self, pattern: impl Into<String>) -> WatchStream {
        self.inner.watchers.subscribe(pattern)
    }

    /// Changes forwarded from slices since the store was created, vetoed
    /// ones included.
    pub fn event_count(&self) -> u64 {
        self.inner.event_count.load(Ordering::Relaxed)
    }

    /// Uninstall every plugin (last installed first) and dispose every
    /// slice. Storage is left as is; call [`dehydrate`](Self::dehydrate)
    /// first to flush.
    pub fn shutdown(&self) {
        let plugins: Vec<Arc<dyn Plugin>> = self.inner.plugins.lock().drain(..).rev().collect();
        for plugin in plugins {
            if let Err(err) = plugin.uninstall(self) {
                warn!(plugin = plugin.name(), error = %err, "plugin failed to uninstall");
            }
        }

        let slices: Vec<SliceEntry> = self.inner.slices.write().drain(..).map(|(_, e)| e).collect();
        for entry in &slices {
            entry.erased.unsubscribe(entry.forwarder);
            entry.erased.dispose();
        }
        self.inner.listeners.write().clear();
        info!(slices = slices.len(), "state store shut down");
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.inner.storage.kind())
            .field("slices", &self.slice_keys())
            .field("plugins", &self.plugin_names())
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Flat key to value map of every slice's value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSnapshot {
    values: BTreeMap<String, StateValue>,
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: StateValue) {
        self.values.insert(key.into(), value);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Write the snapshot as pretty-printed JSON.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl FromIterator<(String, StateValue)> for StateSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, StateValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::FnMiddleware;
    use crate::testutil::FailingAdapter;
    use crate::validate::NumberRange;
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn recorder(store: &StateStore) -> Arc<Mutex<Vec<ChangeEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.on_state_change(move |event| sink.lock().push(event.clone()));
        seen
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let store = StateStore::in_memory();
        let slice = store
            .register_slice(SliceConfig::new("plot.window", 1024u32))
            .unwrap();

        assert!(store.has_slice("plot.window"));
        assert_eq!(store.slice_keys(), vec!["plot.window"]);

        let again = store.get_slice::<u32>("plot.window").unwrap();
        assert!(Arc::ptr_eq(&slice, &again));
        assert!(store.get_slice::<String>("plot.window").is_none());
        assert!(store.get_slice::<u32>("missing").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let store = StateStore::in_memory();
        store.register_slice(SliceConfig::new("k", 0u8)).unwrap();
        let err = store.register_slice(SliceConfig::new("k", 1u8)).err().unwrap();
        assert!(matches!(err, StateError::DuplicateSlice(key) if key == "k"));
    }

    #[tokio::test]
    async fn test_forwarder_reaches_global_listeners() {
        let store = StateStore::in_memory();
        let seen = recorder(&store);
        let slice = store.register_slice(SliceConfig::new("ui.theme", "system".to_string())).unwrap();

        slice.set_value("dark".to_string()).await.unwrap();

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "ui.theme");
        assert_eq!(events[0].new_value, json!("dark"));
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_veto_suppresses_notification_not_commit() {
        let store = StateStore::in_memory();
        let seen = recorder(&store);
        let after_calls = Arc::new(Mutex::new(0));
        let after_sink = Arc::clone(&after_calls);
        store.add_middleware(Arc::new(
            FnMiddleware::new("freeze")
                .before(|_| Ok(false))
                .after(move |_| {
                    *after_sink.lock() += 1;
                    Ok(())
                }),
        ));
        let slice = store
            .register_slice(SliceConfig::new("k", 0u32).persistent(true))
            .unwrap();
        slice.wait_for_initialization().await;

        slice.set_value(5).await.unwrap();

        assert_eq!(slice.get_value(), 5);
        assert_eq!(store.storage().get("k").await.unwrap(), Some(json!(5)));
        assert!(seen.lock().is_empty());
        assert_eq!(*after_calls.lock(), 0);
        assert_eq!(store.event_count(), 1);

        assert!(store.remove_middleware("freeze"));
        assert!(!store.remove_middleware("freeze"));
        slice.set_value(6).await.unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_middleware_errors_and_panics_continue() {
        let store = StateStore::in_memory();
        let seen = recorder(&store);
        store.add_middleware(Arc::new(
            FnMiddleware::new("broken").before(|e| Err(StateError::validation(&e.key, "bad"))),
        ));
        store.add_middleware(Arc::new(FnMiddleware::new("panics").before(|_| panic!("middleware bug"))));
        store.on_state_change(|_| panic!("listener bug"));
        let late = recorder(&store);

        let slice = store.register_slice(SliceConfig::new("k", 0u32)).unwrap();
        slice.set_value(1).await.unwrap();

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(late.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_off_state_change() {
        let store = StateStore::in_memory();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let id = store.on_state_change(move |_| *sink.lock() += 1);
        let slice = store.register_slice(SliceConfig::new("k", 0u32)).unwrap();

        slice.set_value(1).await.unwrap();
        assert!(store.off_state_change(id));
        slice.set_value(2).await.unwrap();

        assert_eq!(*count.lock(), 1);
        assert!(!store.off_state_change(id));
    }

    #[tokio::test]
    async fn test_unregister_stops_forwarding_and_keeps_storage() {
        let store = StateStore::in_memory();
        let seen = recorder(&store);
        let slice = store
            .register_slice(SliceConfig::new("k", 0u32).persistent(true))
            .unwrap();
        slice.set_value(3).await.unwrap();

        store.unregister_slice("k").unwrap();
        assert!(!store.has_slice("k"));
        assert!(matches!(store.unregister_slice("k"), Err(StateError::SliceNotFound(_))));

        slice.set_value(4).await.unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(store.storage().get("k").await.unwrap(), Some(json!(4)));
    }

    #[tokio::test]
    async fn test_hydrate_is_one_shot() {
        let storage = MemoryAdapter::new();
        storage.set("ui.theme", &json!("dark")).await.unwrap();
        let store = StateStore::new(Arc::new(storage));
        let slice = store
            .register_slice(SliceConfig::new("ui.theme", "system".to_string()).persistent(true))
            .unwrap();

        assert!(!store.is_ready());
        store.hydrate().await.unwrap();
        assert!(store.is_ready());
        assert_eq!(slice.get_value(), "dark");

        store.hydrate().await.unwrap();
        store.wait_until_ready().await;
    }

    #[tokio::test]
    async fn test_hydrate_failure_is_reported_and_retryable() {
        let store = StateStore::new(Arc::new(FailingAdapter::new()));
        let slice = store
            .register_slice(SliceConfig::new("k", 7u32).persistent(true))
            .unwrap();

        let err = store.hydrate().await.unwrap_err();
        assert!(matches!(err, StateError::Hydration(_)));
        assert!(!store.is_ready());

        slice.wait_for_initialization().await;
        assert_eq!(slice.get_value(), 7);
        assert!(matches!(store.hydrate().await, Err(StateError::Hydration(_))));
    }

    #[tokio::test]
    async fn test_dehydrate_writes_persistent_slices_only() {
        let store = StateStore::in_memory();
        let persistent = store
            .register_slice(SliceConfig::new("a", 1u32).persistent(true))
            .unwrap();
        store.register_slice(SliceConfig::new("b", 2u32)).unwrap();
        persistent.wait_for_initialization().await;

        assert_eq!(store.dehydrate().await, 1);
        let storage = store.storage();
        assert_eq!(storage.get("a").await.unwrap(), Some(json!(1)));
        assert!(!storage.has("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_dehydrate_before_hydration_keeps_stored_value() {
        let shared = Arc::new(MemoryAdapter::new());
        shared.set("ui.theme", &json!("dark")).await.unwrap();
        let store = StateStore::new(shared.clone());
        let theme = store
            .register_slice(SliceConfig::new("ui.theme", "system".to_string()).persistent(true))
            .unwrap();

        assert_eq!(store.dehydrate().await, 1);
        theme.wait_for_initialization().await;

        assert_eq!(theme.get_value(), "dark");
        assert_eq!(shared.get("ui.theme").await.unwrap(), Some(json!("dark")));
    }

    #[tokio::test]
    async fn test_reset_clears_namespace_only() {
        let shared = Arc::new(MemoryAdapter::new());
        shared.set("other", &json!(true)).await.unwrap();
        let store = StateStore::with_config(shared.clone(), &StoreConfig::with_namespace("dda"));
        let slice = store
            .register_slice(SliceConfig::new("k", 0u32).persistent(true))
            .unwrap();
        slice.set_value(9).await.unwrap();
        assert_eq!(shared.get("dda:k").await.unwrap(), Some(json!(9)));

        store.reset().await.unwrap();

        assert_eq!(slice.get_value(), 0);
        assert!(!shared.has("dda:k").await.unwrap());
        assert_eq!(shared.get("other").await.unwrap(), Some(json!(true)));
    }

    #[tokio::test]
    async fn test_export_import() {
        let store = StateStore::in_memory();
        let window = store
            .register_slice(SliceConfig::new("plot.window", 1024u32).validator(NumberRange::new(64, 8192)))
            .unwrap();
        let theme = store
            .register_slice(SliceConfig::new("ui.theme", "system".to_string()))
            .unwrap();
        theme.set_value("dark".to_string()).await.unwrap();

        let exported = store.export_state().unwrap();
        assert_eq!(exported.get("ui.theme"), Some(&json!("dark")));
        assert_eq!(exported.get("plot.window"), Some(&json!(1024)));

        let seen = recorder(&store);
        let snapshot: StateSnapshot = [
            ("plot.window".to_string(), json!(99_999)),
            ("ui.theme".to_string(), json!("light")),
            ("unknown".to_string(), json!(1)),
        ]
        .into_iter()
        .collect();

        assert_eq!(store.import_state(&snapshot).await, 1);
        assert_eq!(window.get_value(), 1024);
        assert_eq!(theme.get_value(), "light");
        assert!(seen.lock()[0].is_from(source::IMPORT));
    }

    #[tokio::test]
    async fn test_snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let mut snapshot = StateSnapshot::new();
        snapshot.insert("ui.theme", json!("dark"));
        snapshot.insert("plot.channels", json!(["F3", "C4"]));

        snapshot.save_to_file(&path).unwrap();
        let raw: StateValue = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["ui.theme"], "dark");

        assert_eq!(StateSnapshot::load_from_file(&path).unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_set_slice_value_untyped() {
        let store = StateStore::in_memory();
        let slice = store.register_slice(SliceConfig::new("k", 0u32)).unwrap();

        store.set_slice_value("k", json!(4), source::CROSS_TAB).await.unwrap();
        assert_eq!(slice.get_value(), 4);

        let err = store.set_slice_value("k", json!("four"), source::DIRECT).await.unwrap_err();
        assert!(matches!(err, StateError::Serialization(_)));
        assert!(matches!(
            store.set_slice_value("nope", json!(1), source::DIRECT).await,
            Err(StateError::SliceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_pattern() {
        let store = StateStore::in_memory();
        let mut plots = store.watch("plot.*");
        let theme = store.register_slice(SliceConfig::new("ui.theme", "system".to_string())).unwrap();
        let zoom = store.register_slice(SliceConfig::new("plot.zoom", 1u32)).unwrap();

        theme.set_value("dark".to_string()).await.unwrap();
        zoom.set_value(2).await.unwrap();

        let event = plots.next().await.unwrap();
        assert_eq!(event.key, "plot.zoom");
        assert_eq!(event.new_value, json!(2));
    }

    #[tokio::test]
    async fn test_weak_handle_and_shutdown() {
        let store = StateStore::in_memory();
        let weak = store.downgrade();
        let slice = store.register_slice(SliceConfig::new("k", 0u32)).unwrap();
        slice.subscribe(|_| {});

        assert!(weak.upgrade().is_some());
        store.shutdown();
        assert!(store.slice_keys().is_empty());
        assert_eq!(slice.listener_count(), 0);

        drop(store);
        assert!(weak.upgrade().is_none());
    }
}
