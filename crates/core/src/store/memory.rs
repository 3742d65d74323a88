// In-process implementation of the collection store contract.
//
// Any number of `Lifecycle`s can share one `MemoryStore`, which makes it a
// stand-in for several processes attached to the same remote store.
// `set_unavailable(true)` makes every command fail with `StoreUnavailable`;
// `drop_listeners` severs live subscriptions the way a killed connection would.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use super::{CollectionStore, ListenerSession};
use crate::error::{MapError, Result};

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<String, HashMap<String, String>>,
    channels: HashMap<String, HashMap<u64, mpsc::UnboundedSender<String>>>,
    next_listener_id: u64,
    unavailable: bool,
    deletions: u64,
}

/// Shared in-memory collection store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle the simulated outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Deliver `payload` to every listener on `channel`. Returns the number
    /// of receivers, like PUBLISH.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        let state = self.lock();
        state
            .channels
            .get(channel)
            .map(|listeners| {
                listeners.values().filter(|tx| tx.send(payload.to_string()).is_ok()).count()
            })
            .unwrap_or(0)
    }

    /// Cut every listener on `channel`, as if the store had closed their
    /// connections. Works during a simulated outage. Returns how many were cut.
    pub fn drop_listeners(&self, channel: &str) -> usize {
        self.lock().channels.remove(channel).map_or(0, |listeners| listeners.len())
    }

    /// Number of `delete_collection` calls that removed an existing collection.
    pub fn deletions(&self) -> u64 {
        self.lock().deletions
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_state<T>(&self, apply: impl FnOnce(&mut MemoryState) -> T) -> Result<T> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(MapError::unavailable("memory store is offline"));
        }
        Ok(apply(&mut state))
    }

    fn unregister(&self, channel: &str, listener_id: u64) {
        let mut state = self.lock();
        if let Some(listeners) = state.channels.get_mut(channel) {
            listeners.remove(&listener_id);
            if listeners.is_empty() {
                state.channels.remove(channel);
            }
        }
    }
}

impl CollectionStore for MemoryStore {
    type Listener = MemoryListener;

    async fn field_count(&self, name: &str) -> Result<usize> {
        self.with_state(|s| s.collections.get(name).map_or(0, HashMap::len))
    }

    async fn field_exists(&self, name: &str, key: &str) -> Result<bool> {
        self.with_state(|s| s.collections.get(name).is_some_and(|c| c.contains_key(key)))
    }

    async fn field_get(&self, name: &str, key: &str) -> Result<Option<String>> {
        self.with_state(|s| s.collections.get(name).and_then(|c| c.get(key).cloned()))
    }

    async fn field_replace(&self, name: &str, key: &str, value: &str) -> Result<Option<String>> {
        self.with_state(|s| {
            s.collections
                .entry(name.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string())
        })
    }

    async fn field_set_many(&self, name: &str, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.with_state(|s| {
            s.collections.entry(name.to_string()).or_default().extend(entries.iter().cloned());
        })
    }

    async fn field_take(&self, name: &str, key: &str) -> Result<Option<String>> {
        self.with_state(|s| {
            let collection = s.collections.get_mut(name)?;
            let previous = collection.remove(key);
            // An emptied hash stops existing, as it does in Redis.
            if collection.is_empty() {
                s.collections.remove(name);
            }
            previous
        })
    }

    async fn all_fields(&self, name: &str) -> Result<HashSet<String>> {
        self.with_state(|s| {
            s.collections.get(name).map(|c| c.keys().cloned().collect()).unwrap_or_default()
        })
    }

    async fn all_values(&self, name: &str) -> Result<Vec<String>> {
        self.with_state(|s| {
            s.collections.get(name).map(|c| c.values().cloned().collect()).unwrap_or_default()
        })
    }

    async fn all_entries(&self, name: &str) -> Result<HashMap<String, String>> {
        self.with_state(|s| s.collections.get(name).cloned().unwrap_or_default())
    }

    async fn delete_collection(&self, name: &str) -> Result<bool> {
        self.with_state(|s| {
            let existed = s.collections.remove(name).is_some();
            if existed {
                s.deletions += 1;
            }
            existed
        })
    }

    async fn subscriber_count(&self, channel: &str) -> Result<usize> {
        self.with_state(|s| s.channels.get(channel).map_or(0, HashMap::len))
    }

    async fn listen(&self, channel: &str) -> Result<MemoryListener> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener_id = self.with_state(|s| {
            let id = s.next_listener_id;
            s.next_listener_id += 1;
            s.channels.entry(channel.to_string()).or_default().insert(id, tx);
            id
        })?;
        Ok(MemoryListener {
            store: self.clone(),
            channel: channel.to_string(),
            listener_id,
            messages: rx,
            registered: true,
        })
    }
}

/// Listening session on a [`MemoryStore`] channel. Dropping it without
/// calling `serve` releases the subscription, like a closed connection.
#[derive(Debug)]
pub struct MemoryListener {
    store: MemoryStore,
    channel: String,
    listener_id: u64,
    messages: mpsc::UnboundedReceiver<String>,
    registered: bool,
}

impl MemoryListener {
    fn release(&mut self) {
        if std::mem::take(&mut self.registered) {
            self.store.unregister(&self.channel, self.listener_id);
        }
    }
}

impl ListenerSession for MemoryListener {
    async fn serve(mut self, mut stop: oneshot::Receiver<()>) -> Result<u64> {
        let mut seen = 0u64;
        loop {
            tokio::select! {
                _ = &mut stop => break,
                message = self.messages.recv() => match message {
                    Some(payload) => {
                        seen += 1;
                        trace!(channel = %self.channel, %payload, "ignoring liveness channel payload");
                    }
                    None => {
                        self.release();
                        return Err(MapError::subscription(&self.channel, "connection dropped by the store"));
                    }
                },
            }
        }
        // The subscription goes away either way; an outage only changes
        // what the unsubscribe reports.
        let reachable = self.store.with_state(|_| ());
        self.release();
        reachable.map(|_| seen)
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.release();
    }
}
