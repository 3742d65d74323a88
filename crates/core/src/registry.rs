// Subscription registry: the distributed liveness signal.
//
// Every live handle keeps one subscription open on a channel named after
// its collection. The store's own pub/sub bookkeeping then counts attached
// handles across all processes, with no extra remote writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bookkeeping::retry_delay;
use crate::error::{MapError, Result};
use crate::handle::{Liveness, LivenessCell};
use crate::identity::HandleId;
use crate::store::{CollectionStore, ListenerSession};

/// Result of a distributed subscriber count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberCount {
    Known(usize),
    /// The store could not answer; callers must assume the collection is
    /// still referenced.
    Unknown,
}

struct SubscriptionRecord {
    channel: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<u64>>,
    opened_at: DateTime<Utc>,
}

/// Open liveness subscriptions keyed by handle identity.
pub struct SubscriptionRegistry<S: CollectionStore> {
    store: S,
    close_timeout: Duration,
    records: Mutex<HashMap<HandleId, SubscriptionRecord>>,
}

impl<S: CollectionStore> SubscriptionRegistry<S> {
    /// `close_timeout` bounds how long `close_subscription` waits for the
    /// listener to confirm its unsubscribe.
    pub fn new(store: S, close_timeout: Duration) -> Self {
        Self { store, close_timeout, records: Mutex::new(HashMap::new()) }
    }

    /// Subscribe `id` to channel `name` on a dedicated connection. The
    /// subscription is confirmed before this returns; listening then
    /// continues on its own task, which re-subscribes if the store drops
    /// the connection. The returned cell follows that task's view.
    pub async fn open_subscription(&self, name: &str, id: HandleId) -> Result<Arc<LivenessCell>> {
        let session =
            self.store.listen(name).await.map_err(|error| MapError::subscription(name, error))?;

        let liveness = Arc::new(LivenessCell::new(Liveness::Tracked));
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(
            self.store.clone(),
            name.to_string(),
            id,
            session,
            stop_rx,
            liveness.clone(),
        ));
        let record =
            SubscriptionRecord { channel: name.to_string(), stop, task, opened_at: Utc::now() };

        if let Some(stale) = self.lock().insert(id, record) {
            // Identities are unique, so this only happens on misuse.
            warn!(handle = %id, channel = %stale.channel, "replaced an existing subscription");
            let _ = stale.stop.send(());
        }
        debug!(handle = %id, channel = %name, "liveness subscription opened");
        Ok(liveness)
    }

    /// Unsubscribe `id`. Returns `Ok(false)` when nothing was open, so
    /// closing twice is harmless.
    ///
    /// On error the listener task has been aborted, which drops its
    /// connection; the store releases the subscription when it notices.
    pub async fn close_subscription(&self, id: HandleId) -> Result<bool> {
        let Some(record) = self.lock().remove(&id) else {
            return Ok(false);
        };
        let SubscriptionRecord { channel, stop, mut task, opened_at } = record;
        let _ = stop.send(());

        match timeout(self.close_timeout, &mut task).await {
            Ok(Ok(Ok(seen))) => {
                let held_for = Utc::now() - opened_at;
                debug!(
                    handle = %id,
                    %channel,
                    seen,
                    held_ms = held_for.num_milliseconds(),
                    "liveness subscription closed"
                );
                Ok(true)
            }
            Ok(Ok(Err(error))) => Err(MapError::subscription(&channel, error)),
            Ok(Err(join_error)) => Err(MapError::subscription(&channel, join_error)),
            Err(_) => {
                task.abort();
                Err(MapError::subscription(&channel, "unsubscribe was not confirmed in time"))
            }
        }
    }

    /// Ask the store how many parties listen on `name`, using `store`.
    /// Failures are logged and reported as [`SubscriberCount::Unknown`].
    pub async fn count_subscribers(&self, store: &S, name: &str) -> SubscriberCount {
        match store.subscriber_count(name).await {
            Ok(count) => SubscriberCount::Known(count),
            Err(error) => {
                warn!(collection = %name, %error, "subscriber count unavailable");
                SubscriberCount::Unknown
            }
        }
    }

    pub fn is_open(&self, id: HandleId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn open_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<HandleId, SubscriptionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keep `channel` subscribed for `id` until `stop` fires.
///
/// A session that ends on its own means the store dropped the connection.
/// The handle is then reported [`Liveness::Lost`] and the subscription is
/// re-opened with backoff; once it is back the handle is tracked again.
async fn supervise<S: CollectionStore>(
    store: S,
    channel: String,
    id: HandleId,
    first: S::Listener,
    mut stop: oneshot::Receiver<()>,
    liveness: Arc<LivenessCell>,
) -> Result<u64> {
    let mut seen = 0u64;
    let mut session = Some(first);
    let mut failures = 0u32;

    loop {
        let listener = match session.take() {
            Some(listener) => listener,
            None => {
                tokio::select! {
                    _ = &mut stop => return Ok(seen),
                    () = tokio::time::sleep(retry_delay(failures)) => {}
                }
                match store.listen(&channel).await {
                    Ok(listener) => {
                        info!(handle = %id, %channel, failures, "liveness subscription restored");
                        liveness.set(Liveness::Tracked);
                        failures = 0;
                        listener
                    }
                    Err(error) => {
                        failures += 1;
                        warn!(handle = %id, %channel, %error, failures, "re-subscribe failed");
                        continue;
                    }
                }
            }
        };

        let (inner_stop, inner_stop_rx) = oneshot::channel();
        let serving = listener.serve(inner_stop_rx);
        tokio::pin!(serving);
        tokio::select! {
            _ = &mut stop => {
                let _ = inner_stop.send(());
                return serving.await.map(|n| seen + n);
            }
            ended = &mut serving => {
                let error = match ended {
                    Ok(n) => {
                        seen += n;
                        MapError::subscription(&channel, "listening session ended")
                    }
                    Err(error) => error,
                };
                liveness.set(Liveness::Lost);
                failures = 1;
                warn!(handle = %id, %channel, %error, "liveness subscription lost; re-subscribing");
            }
        }
    }
}

impl<S: CollectionStore> Drop for SubscriptionRegistry<S> {
    fn drop(&mut self) {
        for (_, record) in self.lock().drain() {
            let _ = record.stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry(store: &MemoryStore) -> SubscriptionRegistry<MemoryStore> {
        SubscriptionRegistry::new(store.clone(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn open_subscription_is_counted_immediately() {
        let store = MemoryStore::new();
        let subs = registry(&store);
        let id = HandleId::new();

        subs.open_subscription("orders", id).await.unwrap();
        assert!(subs.is_open(id));
        assert_eq!(subs.count_subscribers(&store, "orders").await, SubscriberCount::Known(1));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let store = MemoryStore::new();
        let subs = registry(&store);
        let id = HandleId::new();
        subs.open_subscription("orders", id).await.unwrap();

        assert!(subs.close_subscription(id).await.unwrap());
        assert!(!subs.close_subscription(id).await.unwrap());
        assert_eq!(subs.count_subscribers(&store, "orders").await, SubscriberCount::Known(0));
        assert_eq!(subs.open_count(), 0);
    }

    #[tokio::test]
    async fn counts_span_registries_sharing_a_store() {
        let store = MemoryStore::new();
        let process_a = registry(&store);
        let process_b = registry(&store);
        let (a, b) = (HandleId::new(), HandleId::new());

        process_a.open_subscription("shared", a).await.unwrap();
        process_b.open_subscription("shared", b).await.unwrap();
        assert_eq!(process_a.count_subscribers(&store, "shared").await, SubscriberCount::Known(2));

        process_a.close_subscription(a).await.unwrap();
        assert_eq!(process_b.count_subscribers(&store, "shared").await, SubscriberCount::Known(1));
    }

    #[tokio::test]
    async fn open_failure_is_a_subscription_failure() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let subs = registry(&store);

        let error = subs.open_subscription("orders", HandleId::new()).await.unwrap_err();
        assert!(matches!(error, MapError::SubscriptionFailure { ref channel, .. } if channel == "orders"));
        assert_eq!(subs.open_count(), 0);
    }

    #[tokio::test]
    async fn count_failure_is_unknown_not_zero() {
        let store = MemoryStore::new();
        let subs = registry(&store);
        store.set_unavailable(true);
        assert_eq!(subs.count_subscribers(&store, "orders").await, SubscriberCount::Unknown);
    }

    #[tokio::test]
    async fn failed_unsubscribe_is_reported_and_forgotten() {
        let store = MemoryStore::new();
        let subs = registry(&store);
        let id = HandleId::new();
        subs.open_subscription("orders", id).await.unwrap();

        store.set_unavailable(true);
        assert!(subs.close_subscription(id).await.is_err());
        assert!(!subs.is_open(id));

        store.set_unavailable(false);
        assert_eq!(subs.count_subscribers(&store, "orders").await, SubscriberCount::Known(0));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_subscription_is_restored_with_backoff() {
        let store = MemoryStore::new();
        let subs = registry(&store);
        let id = HandleId::new();
        let liveness = subs.open_subscription("orders", id).await.unwrap();
        assert_eq!(liveness.get(), Liveness::Tracked);

        store.set_unavailable(true);
        assert_eq!(store.drop_listeners("orders"), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(liveness.get(), Liveness::Lost);

        // Re-subscribe attempts keep failing while the store is down.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(liveness.get(), Liveness::Lost);

        store.set_unavailable(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(liveness.get(), Liveness::Tracked);
        assert_eq!(subs.count_subscribers(&store, "orders").await, SubscriberCount::Known(1));

        assert!(subs.close_subscription(id).await.unwrap());
        assert_eq!(subs.count_subscribers(&store, "orders").await, SubscriberCount::Known(0));
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_re_subscribing_succeeds() {
        let store = MemoryStore::new();
        let subs = registry(&store);
        let id = HandleId::new();
        let liveness = subs.open_subscription("orders", id).await.unwrap();

        store.drop_listeners("orders");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(liveness.get(), Liveness::Lost);

        assert!(subs.close_subscription(id).await.unwrap());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(subs.count_subscribers(&store, "orders").await, SubscriberCount::Known(0));
    }
}
