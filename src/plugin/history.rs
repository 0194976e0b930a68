//! Per-key undo.
//!
//! Each notified change pushes the value it replaced onto the key's stack.
//! [`HistoryPlugin::undo`] pops that value and writes it back through the
//! slice, tagged `undo`. Undo writes are not recorded, so repeated undo
//! walks further back instead of toggling. There is no redo.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::HistoryConfig;
use crate::error::{Result, StateError};
use crate::event::{source, ListenerId};
use crate::plugin::Plugin;
use crate::store::{StateStore, WeakStateStore};
use crate::value::StateValue;

const NAME: &str = "history";

type Stacks = HashMap<String, VecDeque<StateValue>>;

/// Undo stacks for every slice of a store.
pub struct HistoryPlugin {
    max_history_size: usize,
    stacks: Arc<Mutex<Stacks>>,
    store: Mutex<Option<WeakStateStore>>,
    listener: Mutex<Option<ListenerId>>,
}

impl HistoryPlugin {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            max_history_size: config.max_history_size,
            stacks: Arc::default(),
            store: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Restore the value `key` had before its last recorded change.
    ///
    /// Returns `Ok(false)` if there is nothing to undo. If the slice rejects
    /// the restored value it stays on the stack and the error is returned.
    pub async fn undo(&self, key: &str) -> Result<bool> {
        let store = self
            .store
            .lock()
            .as_ref()
            .and_then(WeakStateStore::upgrade)
            .ok_or_else(|| StateError::PluginNotFound(NAME.to_string()))?;

        let Some(previous) = self.stacks.lock().get_mut(key).and_then(VecDeque::pop_back) else {
            return Ok(false);
        };

        if let Err(err) = store.set_slice_value(key, previous.clone(), source::UNDO).await {
            self.push(key, previous);
            return Err(err);
        }
        debug!(key, remaining = self.depth(key), "undo applied");
        Ok(true)
    }

    pub fn can_undo(&self, key: &str) -> bool {
        self.depth(key) > 0
    }

    /// Number of undoable steps for `key`.
    pub fn depth(&self, key: &str) -> usize {
        self.stacks.lock().get(key).map_or(0, VecDeque::len)
    }

    /// Forget the stack for `key`, or every stack if `None`.
    pub fn clear(&self, key: Option<&str>) {
        let mut stacks = self.stacks.lock();
        match key {
            Some(key) => {
                stacks.remove(key);
            }
            None => stacks.clear(),
        }
    }

    fn push(&self, key: &str, value: StateValue) {
        record(&self.stacks, self.max_history_size, key, value);
    }
}

fn record(stacks: &Mutex<Stacks>, max: usize, key: &str, value: StateValue) {
    if max == 0 {
        return;
    }
    let mut stacks = stacks.lock();
    let stack = stacks.entry(key.to_string()).or_default();
    while stack.len() >= max {
        stack.pop_front();
    }
    stack.push_back(value);
}

impl Default for HistoryPlugin {
    fn default() -> Self {
        Self::new(HistoryConfig::default())
    }
}

impl Plugin for HistoryPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn install(&self, store: &StateStore) -> Result<()> {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Err(StateError::DuplicatePlugin(NAME.to_string()));
        }
        *self.store.lock() = Some(store.downgrade());

        let stacks = Arc::clone(&self.stacks);
        let max = self.max_history_size;
        *listener = Some(store.on_state_change(move |event| {
            if event.is_from(source::UNDO) || event.is_from(source::INITIAL) {
                return;
            }
            record(&stacks, max, &event.key, event.old_value.clone());
        }));
        info!(max_history_size = self.max_history_size, "history plugin installed");
        Ok(())
    }

    fn uninstall(&self, store: &StateStore) -> Result<()> {
        if let Some(listener) = self.listener.lock().take() {
            store.off_state_change(listener);
        }
        *self.store.lock() = None;
        self.stacks.lock().clear();
        debug!("history plugin uninstalled");
        Ok(())
    }
}
