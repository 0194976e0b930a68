//! Change events emitted by slices and forwarded by the store.

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

use crate::error::Result;
use crate::value::{now_millis, SliceValue, StateValue};

/// Well-known `source` tags.
///
/// The tag is opaque to the engine; consumers and plugins use it to avoid
/// feedback loops (a value received from another context must not be
/// broadcast back).
pub mod source {
    /// A local write through `set_value`.
    pub const DIRECT: &str = "direct";
    /// A value applied from another execution context.
    pub const CROSS_TAB: &str = "cross-tab";
    /// A value loaded from storage during hydration.
    pub const INITIAL: &str = "initial";
    /// A value restored by the history plugin.
    pub const UNDO: &str = "undo";
    /// A value restored from a snapshot.
    pub const IMPORT: &str = "import";
    /// A slice returning to its default.
    pub const RESET: &str = "reset";
}

/// A committed change to one slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent<T = StateValue> {
    /// Key of the slice that changed.
    pub key: String,
    /// Value before the change.
    pub old_value: T,
    /// Value after the change.
    pub new_value: T,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Origin tag, see [`source`].
    pub source: String,
}

impl<T> ChangeEvent<T> {
    /// Create an event stamped with the current time.
    pub fn new(key: impl Into<String>, old_value: T, new_value: T, source: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            old_value,
            new_value,
            timestamp: now_millis(),
            source: source.into(),
        }
    }

    /// True if the event carries the given source tag.
    pub fn is_from(&self, tag: &str) -> bool {
        self.source == tag
    }
}

impl<T: SliceValue> ChangeEvent<T> {
    /// Erase the value type, producing the store-level event.
    pub fn to_json(&self) -> Result<ChangeEvent<StateValue>> {
        Ok(ChangeEvent {
            key: self.key.clone(),
            old_value: serde_json::to_value(&self.old_value)?,
            new_value: serde_json::to_value(&self.new_value)?,
            timestamp: self.timestamp,
            source: self.source.clone(),
        })
    }
}

/// Handle returned by `subscribe`-style calls; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

/// Run one handler, containing a panic so the remaining handlers still run.
///
/// Returns false if the handler panicked.
pub(crate) fn dispatch_guarded<F: FnOnce()>(key: &str, handler: &str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(key, handler, panic = %message, "change handler panicked");
            false
        }
    }
}
