//! Cross-context synchronization.
//!
//! Contexts (stores) that share a [`BroadcastHub`] exchange change events
//! over a named channel. Each message is JSON text:
//!
//! ```json
//! {"type":"state-change","event":{"key":"ui.theme","newValue":"dark","timestamp":1700000000000,"source":"cross-tab"}}
//! ```
//!
//! A context never receives its own posts. Only slices configured with
//! `sync_across_instances` are broadcast, and values that arrived from
//! another context (or from storage during hydration) are never posted back
//! out. A received value is applied to whichever local slice has its key.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConflictPolicy, SyncConfig};
use crate::error::{Result, StateError};
use crate::event::{source, ChangeEvent, ListenerId};
use crate::plugin::Plugin;
use crate::store::{StateStore, WeakStateStore};
use crate::value::StateValue;

const NAME: &str = "sync";

/// Change carried between contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub key: String,
    pub new_value: StateValue,
    pub timestamp: u64,
    pub source: String,
}

/// Message posted on a sync channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncMessage {
    StateChange { event: SyncEvent },
}

impl SyncMessage {
    /// Wrap a local event for broadcast, tagged as coming from another
    /// context.
    pub fn state_change(event: &ChangeEvent) -> Self {
        SyncMessage::StateChange {
            event: SyncEvent {
                key: event.key.clone(),
                new_value: event.new_value.clone(),
                timestamp: event.timestamp,
                source: source::CROSS_TAB.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    origin: u64,
    payload: Arc<str>,
}

/// Named broadcast channels shared by every context in a process.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Envelope>>>>,
    next_origin: Arc<AtomicU64>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join channel `name`, creating it with `capacity` if it is new.
    pub fn open(&self, name: &str, capacity: usize) -> BroadcastChannel {
        let sender = self
            .channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(capacity.max(1)).0)
            .clone();
        BroadcastChannel {
            name: name.to_string(),
            origin: self.next_origin.fetch_add(1, Ordering::Relaxed),
            receiver: sender.subscribe(),
            sender,
        }
    }

    /// Contexts currently joined to `name`.
    pub fn member_count(&self, name: &str) -> usize {
        self.channels
            .lock()
            .get(name)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

/// One context's membership in a hub channel.
pub struct BroadcastChannel {
    name: String,
    origin: u64,
    sender: broadcast::Sender<Envelope>,
    receiver: broadcast::Receiver<Envelope>,
}

impl BroadcastChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post to every other member.
    pub fn post(&self, message: &SyncMessage) -> Result<()> {
        self.outbox().post(message)
    }

    /// Next message from another member. `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => {
                    if let Some(message) = self.accept(envelope) {
                        return Some(message);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.name, skipped, "sync channel lagged, messages dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next message already queued, if any.
    pub fn try_recv(&mut self) -> Option<SyncMessage> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => {
                    if let Some(message) = self.accept(envelope) {
                        return Some(message);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(channel = %self.name, skipped, "sync channel lagged, messages dropped");
                }
                Err(_) => return None,
            }
        }
    }

    fn outbox(&self) -> Outbox {
        Outbox {
            origin: self.origin,
            sender: self.sender.clone(),
        }
    }

    fn accept(&self, envelope: Envelope) -> Option<SyncMessage> {
        if envelope.origin == self.origin {
            return None;
        }
        match serde_json::from_str(&envelope.payload) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(channel = %self.name, error = %err, "malformed sync message");
                None
            }
        }
    }
}

#[derive(Clone)]
struct Outbox {
    origin: u64,
    sender: broadcast::Sender<Envelope>,
}

impl Outbox {
    fn post(&self, message: &SyncMessage) -> Result<()> {
        let payload: Arc<str> = serde_json::to_string(message)?.into();
        // Sending with no other members is not an error.
        let _ = self.sender.send(Envelope {
            origin: self.origin,
            payload,
        });
        Ok(())
    }
}

#[derive(Default)]
struct Installation {
    listener: Option<ListenerId>,
    cancel: Option<CancellationToken>,
    receiver: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    applied: AtomicU64,
    dropped: AtomicU64,
}

/// Broadcasts local changes and applies remote ones.
pub struct SyncPlugin {
    hub: BroadcastHub,
    config: SyncConfig,
    last_applied: Arc<Mutex<HashMap<String, u64>>>,
    counters: Arc<Counters>,
    installation: Mutex<Installation>,
}

impl SyncPlugin {
    pub fn new(hub: BroadcastHub, config: SyncConfig) -> Self {
        Self {
            hub,
            config,
            last_applied: Arc::default(),
            counters: Arc::default(),
            installation: Mutex::default(),
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.config.policy
    }

    /// Messages posted by this context.
    pub fn sent_count(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }

    /// Remote values applied to local slices.
    pub fn applied_count(&self) -> u64 {
        self.counters.applied.load(Ordering::Relaxed)
    }

    /// Remote values discarded as stale under [`ConflictPolicy::NewestTimestamp`].
    pub fn dropped_count(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    fn spawn_receiver(
        &self,
        store: WeakStateStore,
        mut channel: BroadcastChannel,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let policy = self.config.policy;
        let last_applied = Arc::clone(&self.last_applied);
        let counters = Arc::clone(&self.counters);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    message = channel.recv() => message,
                };
                let Some(SyncMessage::StateChange { event }) = message else {
                    break;
                };
                let Some(store) = store.upgrade() else {
                    break;
                };
                apply_remote(&store, event, policy, &last_applied, &counters).await;
            }
            debug!(channel = %channel.name(), "sync receiver stopped");
        })
    }
}

async fn apply_remote(
    store: &StateStore,
    event: SyncEvent,
    policy: ConflictPolicy,
    last_applied: &Mutex<HashMap<String, u64>>,
    counters: &Counters,
) {
    if !store.has_slice(&event.key) {
        debug!(key = %event.key, "no slice for remote change");
        return;
    }
    if policy == ConflictPolicy::NewestTimestamp {
        let mut seen = last_applied.lock();
        match seen.get(&event.key) {
            Some(latest) if *latest > event.timestamp => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(key = %event.key, timestamp = event.timestamp, latest, "stale remote change dropped");
                return;
            }
            _ => {
                seen.insert(event.key.clone(), event.timestamp);
            }
        }
    }
    match store
        .set_slice_value(&event.key, event.new_value, source::CROSS_TAB)
        .await
    {
        Ok(()) => {
            counters.applied.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => warn!(key = %event.key, error = %err, "remote change rejected"),
    }
}

impl Plugin for SyncPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn install(&self, store: &StateStore) -> Result<()> {
        let mut installation = self.installation.lock();
        if installation.listener.is_some() {
            return Err(StateError::DuplicatePlugin(NAME.to_string()));
        }

        let channel = self.hub.open(&self.config.channel_name, self.config.channel_capacity);
        let outbox = channel.outbox();
        let weak = store.downgrade();
        let policy = self.config.policy;
        let last_applied = Arc::clone(&self.last_applied);
        let counters = Arc::clone(&self.counters);
        installation.listener = Some(store.on_state_change(move |event| {
            if event.is_from(source::CROSS_TAB) || event.is_from(source::INITIAL) {
                return;
            }
            let Some(store) = weak.upgrade() else {
                return;
            };
            if !store.slice_syncs(&event.key) {
                return;
            }
            if policy == ConflictPolicy::NewestTimestamp {
                last_applied.lock().insert(event.key.clone(), event.timestamp);
            }
            match outbox.post(&SyncMessage::state_change(event)) {
                Ok(()) => {
                    counters.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => warn!(key = %event.key, error = %err, "failed to broadcast change"),
            }
        }));

        let token = CancellationToken::new();
        installation.receiver = Some(self.spawn_receiver(store.downgrade(), channel, token.clone()));
        installation.cancel = Some(token);

        info!(channel = %self.config.channel_name, policy = ?self.config.policy, "sync plugin installed");
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
        if let Some(receiver) = installation.receiver.take() {
            receiver.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::SliceConfig;
    use serde_json::json;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    #[test]
    fn test_wire_format() {
        let event = ChangeEvent::new("ui.theme", json!("system"), json!("dark"), source::DIRECT);
        let wire = serde_json::to_value(SyncMessage::state_change(&event)).unwrap();

        assert_eq!(wire["type"], "state-change");
        assert_eq!(wire["event"]["key"], "ui.theme");
        assert_eq!(wire["event"]["newValue"], "dark");
        assert_eq!(wire["event"]["source"], "cross-tab");
        assert_eq!(wire["event"]["timestamp"], event.timestamp);
        assert!(wire["event"].get("oldValue").is_none());
    }

    #[tokio::test]
    async fn test_channel_skips_own_posts() {
        let hub = BroadcastHub::new();
        let mut a = hub.open("state", 16);
        let mut b = hub.open("state", 16);
        let mut other = hub.open("other", 16);
        assert_eq!(hub.member_count("state"), 2);

        let event = ChangeEvent::new("k", json!(0), json!(1), source::DIRECT);
        a.post(&SyncMessage::state_change(&event)).unwrap();

        assert!(a.try_recv().is_none());
        assert!(other.try_recv().is_none());
        let SyncMessage::StateChange { event: received } = b.try_recv().unwrap();
        assert_eq!(received.new_value, json!(1));
    }

    #[tokio::test]
    async fn test_malformed_message_ignored() {
        let hub = BroadcastHub::new();
        let a = hub.open("state", 16);
        let mut b = hub.open("state", 16);
        let _ = a.sender.send(Envelope {
            origin: 999,
            payload: Arc::from("{\"type\":\"hello\"}"),
        });
        assert!(b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_newest_timestamp_drops_stale() {
        let hub = BroadcastHub::new();
        let store = StateStore::in_memory();
        let plugin = Arc::new(SyncPlugin::new(
            hub.clone(),
            SyncConfig {
                policy: ConflictPolicy::NewestTimestamp,
                ..Default::default()
            },
        ));
        store.install_plugin(plugin.clone()).unwrap();
        let slice = store
            .register_slice(SliceConfig::new("k", 0u32).sync_across_instances(true))
            .unwrap();
        let mut changes = store.watch("k");

        let remote = hub.open(&SyncConfig::default().channel_name, 16);
        let post = |value: u32, timestamp: u64| {
            remote
                .post(&SyncMessage::StateChange {
                    event: SyncEvent {
                        key: "k".into(),
                        new_value: json!(value),
                        timestamp,
                        source: source::CROSS_TAB.into(),
                    },
                })
                .unwrap()
        };

        post(5, 2_000);
        post(3, 1_000);
        post(7, 3_000);

        for expected in [5u32, 7] {
            let event = tokio::time::timeout(Duration::from_secs(1), changes.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.new_value, json!(expected));
        }
        assert_eq!(slice.get_value(), 7);
        assert_eq!(plugin.applied_count(), 2);
        assert_eq!(plugin.dropped_count(), 1);
        assert_eq!(plugin.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_change_applies_by_key() {
        let hub = BroadcastHub::new();
        let store = StateStore::in_memory();
        let plugin = Arc::new(SyncPlugin::new(hub.clone(), SyncConfig::default()));
        store.install_plugin(plugin.clone()).unwrap();
        let local = store.register_slice(SliceConfig::new("local", 0u32)).unwrap();
        let mut changes = store.watch("*");

        let remote = hub.open(&SyncConfig::default().channel_name, 16);
        for key in ["missing", "local"] {
            let event = ChangeEvent::new(key, json!(0), json!(4), source::DIRECT);
            remote.post(&SyncMessage::state_change(&event)).unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(1), changes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key, "local");
        assert!(event.is_from(source::CROSS_TAB));
        assert_eq!(local.get_value(), 4);
        assert_eq!(plugin.applied_count(), 1);
        assert_eq!(plugin.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_unsynced_slice_not_broadcast() {
        let hub = BroadcastHub::new();
        let store = StateStore::in_memory();
        let plugin = Arc::new(SyncPlugin::new(hub.clone(), SyncConfig::default()));
        store.install_plugin(plugin.clone()).unwrap();
        let mut observer = hub.open(&SyncConfig::default().channel_name, 16);

        let local = store.register_slice(SliceConfig::new("local", 0u32)).unwrap();
        let shared = store
            .register_slice(SliceConfig::new("shared", 0u32).sync_across_instances(true))
            .unwrap();
        local.set_value(1).await.unwrap();
        shared.set_value(2).await.unwrap();
        shared.set_value_from(3, source::CROSS_TAB).await.unwrap();

        let SyncMessage::StateChange { event } = observer.try_recv().unwrap();
        assert_eq!(event.key, "shared");
        assert_eq!(event.new_value, json!(2));
        assert!(observer.try_recv().is_none());
        assert_eq!(plugin.sent_count(), 1);

        store.uninstall_plugin("sync").unwrap();
        shared.set_value(4).await.unwrap();
        assert!(observer.try_recv().is_none());
    }
}
