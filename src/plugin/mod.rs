//! Store plugins.
//!
//! A plugin hooks into a [`StateStore`] on install, usually by registering
//! a global change listener and starting background tasks, and releases
//! all of it on uninstall. Plugins hold only a [`WeakStateStore`] so they
//! never keep a store alive.
//!
//! [`WeakStateStore`]: crate::store::WeakStateStore

pub mod history;
pub mod persistence;
pub mod sync;

pub use history::HistoryPlugin;
pub use persistence::{LifecycleEvent, PersistencePlugin};
pub use sync::{BroadcastChannel, BroadcastHub, SyncEvent, SyncMessage, SyncPlugin};

use crate::error::Result;
use crate::store::StateStore;

/// Extension installed on a store.
pub trait Plugin: Send + Sync {
    /// Unique name within a store.
    fn name(&self) -> &str;

    /// Attach to `store`. Called once per installation.
    fn install(&self, store: &StateStore) -> Result<()>;

    /// Detach from `store`, stopping listeners and background tasks.
    fn uninstall(&self, store: &StateStore) -> Result<()>;
}
