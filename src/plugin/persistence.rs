//! Debounced autosave.
//!
//! Every change notified by the store restarts a debounce timer; when the
//! timer fires the plugin calls [`StateStore::dehydrate`]. Hosts report
//! visibility changes through [`PersistencePlugin::handle_lifecycle`] to
//! flush immediately, and an optional fixed interval saves regardless of
//! activity.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PersistenceConfig;
use crate::error::{Result, StateError};
use crate::event::ListenerId;
use crate::plugin::Plugin;
use crate::store::{StateStore, WeakStateStore};

const NAME: &str = "persistence";

/// Host lifecycle transitions the plugin reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Visible,
    /// The host lost visibility (window hidden, app backgrounded).
    Hidden,
    /// The host is about to exit.
    Terminating,
}

#[derive(Default)]
struct Shared {
    store: Mutex<Option<WeakStateStore>>,
    pending: Mutex<Option<JoinHandle<()>>>,
    save_count: AtomicU64,
}

impl Shared {
    fn store(&self) -> Option<StateStore> {
        self.store.lock().as_ref().and_then(WeakStateStore::upgrade)
    }

    async fn save(&self, reason: &'static str) -> usize {
        let Some(store) = self.store() else {
            debug!(reason, "store gone, skipping save");
            return 0;
        };
        let written = store.dehydrate().await;
        self.save_count.fetch_add(1, Ordering::Relaxed);
        debug!(reason, written, "state saved");
        written
    }

    /// Abort any pending debounce and start a new one.
    fn restart_debounce(self: &Arc<Self>, config: &PersistenceConfig) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no tokio runtime, cannot schedule save");
            return;
        };
        let shared = Arc::clone(self);
        let delay = config.debounce();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            shared.save("debounce").await;
        });
        if let Some(previous) = self.pending.lock().replace(task) {
            previous.abort();
        }
    }

    fn cancel_debounce(&self) {
        if let Some(pending) = self.pending.lock().take() {
            pending.abort();
        }
    }
}

#[derive(Default)]
struct Installation {
    listener: Option<ListenerId>,
    cancel: Option<CancellationToken>,
    interval: Option<JoinHandle<()>>,
}

/// Saves the store after changes settle.
pub struct PersistencePlugin {
    config: PersistenceConfig,
    shared: Arc<Shared>,
    installation: Mutex<Installation>,
}

impl PersistencePlugin {
    pub fn new(config: PersistenceConfig) -> Self {
        Self {
            config,
            shared: Arc::default(),
            installation: Mutex::default(),
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Cancel any pending debounce and save now.
    ///
    /// Returns the number of slices written.
    pub async fn force_save(&self) -> usize {
        self.shared.cancel_debounce();
        self.shared.save("forced").await
    }

    /// React to a host lifecycle change.
    ///
    /// `Terminating` always saves; `Hidden` saves if `save_on_hide` is set.
    pub async fn handle_lifecycle(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Terminating => {
                self.force_save().await;
            }
            LifecycleEvent::Hidden if self.config.save_on_hide => {
                self.force_save().await;
            }
            _ => {}
        }
    }

    /// True while a debounced save is waiting to fire.
    pub fn has_pending_save(&self) -> bool {
        self.shared
            .pending
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Completed saves since creation.
    pub fn save_count(&self) -> u64 {
        self.shared.save_count.load(Ordering::Relaxed)
    }

    fn spawn_interval(&self, token: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.config.auto_save_interval()?;
        let shared = Arc::clone(&self.shared);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("autosave interval stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        shared.save("interval").await;
                    }
                }
            }
        }))
    }
}

impl Default for PersistencePlugin {
    fn default() -> Self {
        Self::new(PersistenceConfig::default())
    }
}

impl Plugin for PersistencePlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn install(&self, store: &StateStore) -> Result<()> {
        let mut installation = self.installation.lock();
        if installation.listener.is_some() {
            return Err(StateError::DuplicatePlugin(NAME.to_string()));
        }
        *self.shared.store.lock() = Some(store.downgrade());

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        installation.listener = Some(store.on_state_change(move |_| shared.restart_debounce(&config)));

        let token = CancellationToken::new();
        installation.interval = self.spawn_interval(token.clone());
        installation.cancel = Some(token);

        info!(
            debounce_ms = self.config.debounce_ms,
            auto_save_interval_ms = ?self.config.auto_save_interval_ms,
            "persistence plugin installed"
        );
        Ok(())
    }

    fn uninstall(&self, store: &StateStore) -> Result<()> {
        let mut installation = self.installation.lock();
        if let Some(listener) = installation.listener.take() {
            store.off_state_change(listener);
        }
        if let Some(token) = installation.cancel.take() {
            token.cancel();
        }
        if let Some(interval) = installation.interval.take() {
            interval.abort();
        }
        self.shared.cancel_debounce();
        *self.shared.store.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::SliceConfig;
    use serde_json::json;
    use std::time::Duration;

    fn quick(debounce_ms: u64) -> PersistenceConfig {
        PersistenceConfig {
            debounce_ms,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_changes() {
        let store = StateStore::in_memory();
        let plugin = Arc::new(PersistencePlugin::new(quick(1000)));
        store.install_plugin(plugin.clone()).unwrap();
        let slice = store.register_slice(SliceConfig::new("k", 0u32)).unwrap();

        for i in 1..=5 {
            slice.set_value(i).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(plugin.save_count(), 0);
        assert!(plugin.has_pending_save());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(plugin.save_count(), 1);
        assert!(!plugin.has_pending_save());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_save_cancels_pending() {
        let store = StateStore::in_memory();
        let plugin = Arc::new(PersistencePlugin::new(quick(1000)));
        store.install_plugin(plugin.clone()).unwrap();
        let slice = store
            .register_slice(SliceConfig::new("k", 0u32).persistent(true))
            .unwrap();
        slice.wait_for_initialization().await;
        slice.set_value(1).await.unwrap();

        assert_eq!(plugin.force_save().await, 1);
        assert_eq!(plugin.save_count(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(plugin.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_events() {
        let store = StateStore::in_memory();
        let plugin = Arc::new(PersistencePlugin::new(PersistenceConfig {
            save_on_hide: false,
            ..Default::default()
        }));
        store.install_plugin(plugin.clone()).unwrap();

        plugin.handle_lifecycle(LifecycleEvent::Visible).await;
        plugin.handle_lifecycle(LifecycleEvent::Hidden).await;
        assert_eq!(plugin.save_count(), 0);

        plugin.handle_lifecycle(LifecycleEvent::Terminating).await;
        assert_eq!(plugin.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_saves_without_activity() {
        let store = StateStore::in_memory();
        let plugin = Arc::new(PersistencePlugin::new(PersistenceConfig {
            auto_save_interval_ms: Some(10_000),
            ..Default::default()
        }));
        store.install_plugin(plugin.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(35_000)).await;
        assert_eq!(plugin.save_count(), 3);

        store.uninstall_plugin(NAME).unwrap();
        tokio::time::sleep(Duration::from_millis(35_000)).await;
        assert_eq!(plugin.save_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uninstall_drops_pending_save() {
        let store = StateStore::in_memory();
        let plugin = Arc::new(PersistencePlugin::new(quick(1000)));
        store.install_plugin(plugin.clone()).unwrap();
        let slice = store
            .register_slice(SliceConfig::new("k", 0u32).persistent(true))
            .unwrap();
        slice.set_value(1).await.unwrap();

        store.uninstall_plugin(NAME).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(plugin.save_count(), 0);
        assert_eq!(store.storage().get("k").await.unwrap(), Some(json!(1)));
        assert!(store.plugin_names().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_install_rejected() {
        let store = StateStore::in_memory();
        store.install_plugin(Arc::new(PersistencePlugin::default())).unwrap();
        let err = store
            .install_plugin(Arc::new(PersistencePlugin::default()))
            .unwrap_err();
        assert!(matches!(err, StateError::DuplicatePlugin(_)));
    }
}
