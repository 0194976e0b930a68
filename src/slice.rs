//! State slices - one key, one value, its subscribers and its policies.
//!
//! A slice owns the authoritative in-memory value. Writes go through a
//! per-slice gate: validation, a deep-equality short-circuit, commit,
//! optional debug history, best-effort persistence, then synchronous
//! notification of subscribers in subscription order.
//!
//! # Hydration ordering
//!
//! A persistent slice starts reading its stored value as soon as it is
//! constructed. The read holds the write gate until it resolves, so every
//! `set_value` issued before hydration finishes waits for it and then runs
//! in call order (the gate is a fair FIFO lock). `get_value` never waits: it
//! returns the default until hydration overwrites it in place.
//!
//! # Best-effort persistence
//!
//! The in-memory value is authoritative. If the storage write behind a
//! committed change fails, the failure is logged and the change stands; it
//! is never rolled back and never reported to the `set_value` caller.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{Result, StateError};
use crate::event::{dispatch_guarded, source, ChangeEvent, ListenerId};
use crate::storage::{validate_key, StorageAdapter};
use crate::transform::{JsonTransformer, Transformer};
use crate::validate::Validator;
use crate::value::{values_equal, SliceValue, StateValue};

/// Default bound on a slice's debug history.
pub const DEFAULT_MAX_HISTORY: usize = 100;

/// Callback invoked with every committed change of a slice.
pub type Listener<T> = Arc<dyn Fn(&ChangeEvent<T>) + Send + Sync>;

/// Immutable descriptor of a slice, built once per key.
pub struct SliceConfig<T> {
    key: String,
    default_value: T,
    validator: Option<Arc<dyn Validator<T>>>,
    transformer: Option<Arc<dyn Transformer<T>>>,
    persistent: bool,
    sync_across_instances: bool,
    debug_enabled: bool,
    max_history: usize,
}

impl<T: SliceValue> SliceConfig<T> {
    /// A non-persistent, non-synced slice with no validator.
    pub fn new(key: impl Into<String>, default_value: T) -> Self {
        Self {
            key: key.into(),
            default_value,
            validator: None,
            transformer: None,
            persistent: false,
            sync_across_instances: false,
            debug_enabled: false,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    /// Reject values the validator does not accept.
    pub fn validator(mut self, validator: impl Validator<T> + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Convert values through `transformer` on their way to and from storage.
    pub fn transformer(mut self, transformer: impl Transformer<T> + 'static) -> Self {
        self.transformer = Some(Arc::new(transformer));
        self
    }

    /// Load from and write to storage.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Let the sync plugin broadcast and apply this slice across contexts.
    pub fn sync_across_instances(mut self, sync: bool) -> Self {
        self.sync_across_instances = sync;
        self
    }

    /// Record committed changes in the slice's debug history.
    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug_enabled = enabled;
        self
    }

    /// Bound on the debug history; the oldest entries are dropped first.
    pub fn max_history(mut self, max: usize) -> Self {
        self.max_history = max;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn default_value(&self) -> &T {
        &self.default_value
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn syncs_across_instances(&self) -> bool {
        self.sync_across_instances
    }

    pub fn is_debug_enabled(&self) -> bool {
        self.debug_enabled
    }
}

impl<T: fmt::Debug> fmt::Debug for SliceConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceConfig")
            .field("key", &self.key)
            .field("default_value", &self.default_value)
            .field("validator", &self.validator.is_some())
            .field("transformer", &self.transformer.is_some())
            .field("persistent", &self.persistent)
            .field("sync_across_instances", &self.sync_across_instances)
            .field("debug_enabled", &self.debug_enabled)
            .field("max_history", &self.max_history)
            .finish()
    }
}

/// Runtime state of one key.
pub struct StateSlice<T> {
    config: SliceConfig<T>,
    storage: Option<Arc<dyn StorageAdapter>>,
    value: RwLock<T>,
    history: Mutex<VecDeque<ChangeEvent<T>>>,
    listeners: RwLock<Vec<(ListenerId, Listener<T>)>>,
    next_listener: AtomicU64,
    write_gate: Arc<tokio::sync::Mutex<()>>,
    initialized: watch::Sender<bool>,
}

impl<T: SliceValue> StateSlice<T> {
    /// Create a slice. A persistent slice with storage starts hydrating
    /// immediately.
    ///
    /// # Panics
    ///
    /// A persistent slice must be created within a Tokio runtime context.
    pub fn new(config: SliceConfig<T>, storage: Option<Arc<dyn StorageAdapter>>) -> Result<Arc<Self>> {
        validate_key(&config.key)?;
        let hydrating = config.persistent && storage.is_some();
        let (initialized, _) = watch::channel(!hydrating);

        let slice = Arc::new(Self {
            value: RwLock::new(config.default_value.clone()),
            config,
            storage,
            history: Mutex::new(VecDeque::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
            initialized,
        });

        if hydrating {
            // Taken before anyone else can see the slice, so no write can
            // slip in ahead of the stored value.
            if let Ok(gate) = Arc::clone(&slice.write_gate).try_lock_owned() {
                let hydrating_slice = Arc::clone(&slice);
                tokio::spawn(async move { hydrating_slice.hydrate(gate).await });
            }
        }

        Ok(slice)
    }

    /// The slice's key.
    pub fn key(&self) -> &str {
        &self.config.key
    }

    /// The slice's configuration.
    pub fn config(&self) -> &SliceConfig<T> {
        &self.config
    }

    /// The last committed value.
    pub fn get_value(&self) -> T {
        self.value.read().clone()
    }

    /// Set a new value, tagged as a direct write.
    pub async fn set_value(&self, value: T) -> Result<()> {
        self.set_value_from(value, source::DIRECT).await
    }

    /// Set a new value with an explicit event source tag.
    ///
    /// Fails with [`StateError::Validation`] if the validator rejects the
    /// value. Setting a value equal to the current one is a no-op.
    pub async fn set_value_from(&self, value: T, source: impl Into<String>) -> Result<()> {
        self.apply(value, source.into(), true).await
    }

    /// Return to the default value and delete the stored entry.
    pub async fn reset(&self) -> Result<()> {
        self.apply(self.config.default_value.clone(), source::RESET.to_string(), false)
            .await?;
        if let (true, Some(storage)) = (self.config.persistent, &self.storage) {
            if let Err(err) = storage.remove(&self.config.key).await {
                warn!(key = %self.config.key, error = %err, "failed to remove stored value on reset");
            }
        }
        Ok(())
    }

    /// Register a listener. Listeners run synchronously, in subscription
    /// order, after every committed change.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChangeEvent<T>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Recorded changes, oldest first. Empty unless debug is enabled.
    pub fn history(&self) -> Vec<ChangeEvent<T>> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// True once hydration has finished (immediately for non-persistent
    /// slices).
    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    /// Wait until hydration has finished.
    pub async fn wait_for_initialization(&self) {
        let mut rx = self.initialized.subscribe();
        // The sender lives as long as `self`, so this only ends on `true`.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Write the current value to storage through the transformer.
    ///
    /// Takes the write gate, so it waits for hydration and for any write
    /// already queued, and never stores a value older than one committed
    /// before it.
    pub async fn persist(&self) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let _gate = self.write_gate.lock().await;
        let stored = self.encode(&self.get_value())?;
        storage.set(&self.config.key, &stored).await
    }

    /// Drop all listeners and history. Storage is left untouched.
    pub fn dispose(&self) {
        self.listeners.write().clear();
        self.history.lock().clear();
        debug!(key = %self.config.key, "slice disposed");
    }

    fn encode(&self, value: &T) -> Result<StateValue> {
        match &self.config.transformer {
            Some(transformer) => transformer.serialize(value),
            None => JsonTransformer.serialize(value),
        }
    }

    fn decode(&self, stored: StateValue) -> Result<T> {
        match &self.config.transformer {
            Some(transformer) => transformer.deserialize(stored),
            None => JsonTransformer.deserialize(stored),
        }
    }

    fn check(&self, value: &T) -> Result<()> {
        match &self.config.validator {
            Some(validator) => validator
                .check(value)
                .map_err(|reason| StateError::validation(&self.config.key, reason)),
            None => Ok(()),
        }
    }

    async fn apply(&self, value: T, source: String, validate: bool) -> Result<()> {
        let _gate = self.write_gate.lock().await;

        if validate {
            self.check(&value)?;
        }
        let Some(event) = self.commit(value, source) else {
            return Ok(());
        };

        if self.config.persistent {
            if let Err(err) = self.write_through(&event.new_value).await {
                warn!(
                    key = %self.config.key,
                    error = %err,
                    "persisting slice failed, keeping in-memory value"
                );
            }
        }

        self.notify(&event);
        Ok(())
    }

    /// Swap in `value` unless it is deep-equal to the current one, recording
    /// history.
    fn commit(&self, value: T, source: String) -> Option<ChangeEvent<T>> {
        let old_value = {
            let mut current = self.value.write();
            if values_equal(&*current, &value) {
                return None;
            }
            std::mem::replace(&mut *current, value.clone())
        };

        let event = ChangeEvent::new(self.config.key.clone(), old_value, value, source);
        if self.config.debug_enabled && self.config.max_history > 0 {
            let mut history = self.history.lock();
            while history.len() >= self.config.max_history {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        Some(event)
    }

    async fn write_through(&self, value: &T) -> Result<()> {
        match &self.storage {
            Some(storage) => {
                let stored = self.encode(value)?;
                storage.set(&self.config.key, &stored).await
            }
            None => Ok(()),
        }
    }

    fn notify(&self, event: &ChangeEvent<T>) {
        let listeners: Vec<Listener<T>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            dispatch_guarded(&self.config.key, "slice listener", || listener(event));
        }
    }

    async fn hydrate(self: Arc<Self>, gate: OwnedMutexGuard<()>) {
        let key = self.config.key.clone();
        if let Some(storage) = &self.storage {
            match storage.get(&key).await {
                Ok(Some(stored)) => match self.decode(stored).and_then(|v| self.check(&v).map(|_| v)) {
                    Ok(value) => {
                        if let Some(event) = self.commit(value, source::INITIAL.to_string()) {
                            debug!(key = %key, backend = storage.kind(), "hydrated slice from storage");
                            self.notify(&event);
                        }
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "stored value unusable, keeping default");
                    }
                },
                Ok(None) => debug!(key = %key, "no stored value, keeping default"),
                Err(err) => {
                    warn!(key = %key, error = %err, "hydration read failed, keeping default");
                }
            }
        }
        self.initialized.send_replace(true);
        drop(gate);
    }
}

/// Type-erased view of a slice, used by the store and plugins.
#[async_trait]
pub(crate) trait ErasedSlice: Send + Sync {
    fn key(&self) -> &str;
    fn is_persistent(&self) -> bool;
    fn syncs_across_instances(&self) -> bool;
    fn is_initialized(&self) -> bool;
    fn value_json(&self) -> Result<StateValue>;
    fn unsubscribe(&self, id: ListenerId) -> bool;
    fn dispose(&self);
    async fn set_value_json(&self, value: StateValue, source: &str) -> Result<()>;
    async fn persist(&self) -> Result<()>;
    async fn reset(&self) -> Result<()>;
    async fn wait_for_initialization(&self);
}

#[async_trait]
impl<T: SliceValue> ErasedSlice for StateSlice<T> {
    fn key(&self) -> &str {
        &self.config.key
    }

    fn is_persistent(&self) -> bool {
        self.config.persistent
    }

    fn syncs_across_instances(&self) -> bool {
        self.config.sync_across_instances
    }

    fn is_initialized(&self) -> bool {
        StateSlice::is_initialized(self)
    }

    fn value_json(&self) -> Result<StateValue> {
        Ok(serde_json::to_value(&*self.value.read())?)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        StateSlice::unsubscribe(self, id)
    }

    fn dispose(&self) {
        StateSlice::dispose(self)
    }

    async fn set_value_json(&self, value: StateValue, source: &str) -> Result<()> {
        let value: T = serde_json::from_value(value)?;
        self.set_value_from(value, source).await
    }

    async fn persist(&self) -> Result<()> {
        StateSlice::persist(self).await
    }

    async fn reset(&self) -> Result<()> {
        StateSlice::reset(self).await
    }

    async fn wait_for_initialization(&self) {
        StateSlice::wait_for_initialization(self).await
    }
}
