//! # dda-state
//!
//! Reactive, persisted, cross-context state engine for the DDA desktop
//! application.
//!
//! Application state lives in typed, independently keyed **slices** held by
//! a [`StateStore`]:
//!
//! - **Validated writes**: each slice can reject values before they commit
//! - **Best-effort persistence**: slices hydrate from and write through to a
//!   pluggable [`StorageAdapter`]; a failed write never rolls back memory
//! - **Change events**: per-slice subscribers, global listeners, middleware
//!   and async [`WatchStream`]s
//! - **Plugins**: debounced autosave, cross-context sync, per-key undo
//!
//! ## Storage adapters
//!
//! - [`MemoryAdapter`]: in-memory map (tests, ephemeral state)
//! - [`FlatAdapter`]: string-valued key/value backend with a byte quota and
//!   FIFO eviction
//! - [`SqliteAdapter`]: embedded SQLite with timestamps, cleanup and usage
//!   estimates
//! - [`NamespacedAdapter`]: prefixes keys so several stores share a backend
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dda_state::{OneOf, SliceConfig, StateStore};
//!
//! #[tokio::main]
//! async fn main() -> dda_state::Result<()> {
//!     let store = StateStore::in_memory();
//!
//!     let theme = store.register_slice(
//!         SliceConfig::new("ui.theme", "system".to_string())
//!             .validator(OneOf::new(["light", "dark", "system"].map(String::from)))
//!             .persistent(true),
//!     )?;
//!     store.hydrate().await?;
//!
//!     theme.subscribe(|event| println!("{} -> {}", event.old_value, event.new_value));
//!     theme.set_value("dark".to_string()).await?;
//!     assert!(theme.set_value("purple".to_string()).await.is_err());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Plugins
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dda_state::{
//!     BroadcastHub, EngineConfig, HistoryPlugin, PersistencePlugin, SliceConfig, StateStore,
//!     SqliteAdapter, SyncPlugin,
//! };
//!
//! #[tokio::main]
//! async fn main() -> dda_state::Result<()> {
//!     let config = EngineConfig::from_toml_str("[persistence]\ndebounce_ms = 500")?;
//!     let storage = Arc::new(SqliteAdapter::open("state.db").await?);
//!     let store = StateStore::with_config(storage, &config.store);
//!
//!     let hub = BroadcastHub::new();
//!     let persistence = Arc::new(PersistencePlugin::new(config.persistence.clone()));
//!     let history = Arc::new(HistoryPlugin::new(config.history.clone()));
//!     store.install_plugin(persistence.clone())?;
//!     store.install_plugin(history.clone())?;
//!     store.install_plugin(Arc::new(SyncPlugin::new(hub, config.sync.clone())))?;
//!
//!     let zoom = store.register_slice(
//!         SliceConfig::new("plot.zoom", 1.0f64).persistent(true).sync_across_instances(true),
//!     )?;
//!     zoom.set_value(2.0).await?;
//!     history.undo("plot.zoom").await?;
//!
//!     persistence.force_save().await;
//!     store.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod middleware;
pub mod plugin;
pub mod slice;
pub mod storage;
pub mod store;
pub mod transform;
pub mod validate;
pub mod value;
pub mod watch;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

// Re-export main types
pub use config::{ConflictPolicy, EngineConfig, HistoryConfig, PersistenceConfig, StoreConfig, SyncConfig};
pub use error::{Result, StateError};
pub use event::{source, ChangeEvent, ListenerId};
pub use middleware::{FnMiddleware, LoggingMiddleware, Middleware};
pub use plugin::{
    BroadcastChannel, BroadcastHub, HistoryPlugin, LifecycleEvent, PersistencePlugin, Plugin, SyncMessage,
    SyncPlugin,
};
pub use slice::{SliceConfig, StateSlice};
pub use storage::{
    FileBackend, FlatAdapter, FlatBackend, MemoryAdapter, NamespacedAdapter, QuotaMemoryBackend, SqliteAdapter,
    StorageAdapter, StorageEstimate,
};
pub use store::{StateSnapshot, StateStore, WeakStateStore};
pub use transform::{transformer_fn, JsonTransformer, Transformer, VersionedTransformer};
pub use validate::{predicate, AllOf, MaxEncodedSize, NumberRange, OneOf, Validator};
pub use value::{deep_equal, values_equal, SliceValue, StateValue};
pub use watch::WatchStream;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{Result, StateError};
    pub use crate::event::{source, ChangeEvent};
    pub use crate::plugin::Plugin;
    pub use crate::slice::{SliceConfig, StateSlice};
    pub use crate::storage::{MemoryAdapter, StorageAdapter};
    pub use crate::store::StateStore;
    pub use crate::validate::Validator;
    pub use crate::value::{SliceValue, StateValue};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_store_basic() {
        let store = StateStore::in_memory();
        let slice = store.register_slice(SliceConfig::new("/test", 0u32)).unwrap();

        slice.set_value(7).await.unwrap();
        assert_eq!(store.get_slice::<u32>("/test").unwrap().get_value(), 7);
    }

    #[tokio::test]
    async fn test_handles_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<StateStore>();
        assert_send_sync::<WeakStateStore>();
        assert_send_sync::<StateSlice<String>>();
        assert_send_sync::<Arc<dyn StorageAdapter>>();
        assert_send_sync::<SqliteAdapter>();
    }
}
