// Process-wide attachment state for one store.
//
// A `Lifecycle` owns the subscription registry, the cleanup bookkeeping and
// the single detector task. Create one per process per store location at
// startup and open every handle through it.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bookkeeping::Bookkeeping;
use crate::config::MapConfig;
use crate::coordinator::{CleanupCoordinator, CleanupStats};
use crate::detector::{run_detector, Observer};
use crate::error::Result;
use crate::handle::{Liveness, LivenessCell, SharedMap};
use crate::identity::HandleId;
use crate::registry::SubscriptionRegistry;
use crate::store::{CollectionStore, RedisStore};

/// Entry point for opening shared collections.
///
/// Cheap to clone. Must be created inside a tokio runtime; the detector
/// runs as a task on that runtime.
pub struct Lifecycle<S: CollectionStore = RedisStore> {
    shared: Arc<Shared<S>>,
}

struct Shared<S: CollectionStore> {
    store: S,
    config: MapConfig,
    subscriptions: Arc<SubscriptionRegistry<S>>,
    bookkeeping: Arc<Bookkeeping<S>>,
    coordinator: CleanupCoordinator<S>,
    queue: mpsc::UnboundedSender<HandleId>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: CollectionStore> Clone for Lifecycle<S> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl Lifecycle<RedisStore> {
    /// Connect to the Redis server described by `config`.
    pub async fn connect(config: MapConfig) -> Result<Self> {
        let store = RedisStore::connect(&config).await?;
        Ok(Self::with_store(store, config))
    }
}

impl<S: CollectionStore> Lifecycle<S> {
    /// Start the detector over an already connected store.
    pub fn with_store(store: S, config: MapConfig) -> Self {
        let subscriptions =
            Arc::new(SubscriptionRegistry::new(store.clone(), config.command_timeout() * 2));
        let bookkeeping = Arc::new(Bookkeeping::default());
        let coordinator = CleanupCoordinator::new(
            subscriptions.clone(),
            bookkeeping.clone(),
            config.cleanup_grace(),
            config.max_cleanup_attempts,
        );
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(run_detector(
            coordinator.clone(),
            queue_rx,
            config.poll_interval(),
            shutdown_rx,
        ));

        Self {
            shared: Arc::new(Shared {
                store,
                config,
                subscriptions,
                bookkeeping,
                coordinator,
                queue,
                shutdown_tx,
                worker: Mutex::new(Some(worker)),
            }),
        }
    }

    /// Attach to the collection called `name`.
    ///
    /// The handle is tracked before this returns. If the liveness
    /// subscription cannot be opened the handle is still returned, marked
    /// [`Liveness::Degraded`].
    pub async fn open(&self, name: impl Into<String>) -> SharedMap<S> {
        self.attach(HandleId::new(), name.into()).await
    }

    /// Attach to a fresh collection named after the new handle's identity.
    pub async fn open_anonymous(&self) -> SharedMap<S> {
        let id = HandleId::new();
        self.attach(id, id.default_collection_name()).await
    }

    async fn attach(&self, id: HandleId, name: String) -> SharedMap<S> {
        let shared = &self.shared;
        shared.bookkeeping.register(id, &name, shared.store.clone());
        // Built before the first await so a cancelled open still gets cleaned up.
        let observer = Observer::new(id, shared.queue.clone(), shared.bookkeeping.clone());

        let liveness = match shared.subscriptions.open_subscription(&name, id).await {
            Ok(liveness) => liveness,
            Err(error) => {
                warn!(handle = %id, collection = %name, %error, "liveness tracking degraded");
                Arc::new(LivenessCell::new(Liveness::Degraded))
            }
        };
        debug!(handle = %id, collection = %name, liveness = ?liveness.get(), "handle attached");
        SharedMap::new(id, name, shared.store.clone(), liveness, observer)
    }

    /// Distributed reference count for `name`: handles attached in any process.
    pub async fn subscriber_count(&self, name: &str) -> Result<usize> {
        self.shared.store.subscriber_count(name).await
    }

    pub fn stats(&self) -> CleanupStats {
        self.shared.coordinator.stats()
    }

    pub fn config(&self) -> &MapConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &S {
        &self.shared.store
    }

    /// Stop the detector after it has processed everything already queued.
    /// Handles dropped afterwards are not cleaned up.
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        let worker = self.shared.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if let Err(error) = worker.await {
                warn!(%error, "unreachability detector panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::MemoryStore;

    fn fast_config() -> MapConfig {
        MapConfig {
            poll_interval_ms: 5,
            cleanup_grace_ms: 0,
            command_timeout_ms: 500,
            ..MapConfig::default()
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        done()
    }

    #[tokio::test]
    async fn open_tracks_handle_before_returning() {
        let lifecycle = Lifecycle::with_store(MemoryStore::new(), fast_config());
        let map = lifecycle.open("orders").await;

        assert_eq!(map.liveness(), Liveness::Tracked);
        assert_eq!(lifecycle.subscriber_count("orders").await.unwrap(), 1);
        let stats = lifecycle.stats();
        assert_eq!((stats.tracked_handles, stats.open_subscriptions), (1, 1));
    }

    #[tokio::test]
    async fn anonymous_handle_uses_identity_as_name() {
        let lifecycle = Lifecycle::with_store(MemoryStore::new(), fast_config());
        let map = lifecycle.open_anonymous().await;
        assert_eq!(map.name(), map.id().default_collection_name());
    }

    #[tokio::test]
    async fn put_returns_previous_and_remove_returns_value() {
        let lifecycle = Lifecycle::with_store(MemoryStore::new(), fast_config());
        let map = lifecycle.open("orders").await;

        assert_eq!(map.put("one", "1").await.unwrap(), None);
        assert_eq!(map.put("one", "first").await.unwrap().as_deref(), Some("1"));
        assert_eq!(map.get("one").await.unwrap().as_deref(), Some("first"));
        assert!(map.contains_key("one").await.unwrap());
        assert!(map.contains_value("first").await.unwrap());
        assert!(!map.contains_value("1").await.unwrap());

        assert_eq!(map.remove("one").await.unwrap().as_deref(), Some("first"));
        assert_eq!(map.remove("one").await.unwrap(), None);
        assert!(map.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn bulk_reads_and_clear() {
        let lifecycle = Lifecycle::with_store(MemoryStore::new(), fast_config());
        let map = lifecycle.open("orders").await;
        map.put_all([("a", "1"), ("b", "2"), ("c", "2")]).await.unwrap();

        assert_eq!(map.size().await.unwrap(), 3);
        let keys = map.keys().await.unwrap();
        assert!(keys.contains("a") && keys.contains("b") && keys.contains("c"));
        let mut values = map.values().await.unwrap();
        values.sort();
        assert_eq!(values, vec!["1", "2", "2"]);
        assert_eq!(map.entries().await.unwrap().get("b").map(String::as_str), Some("2"));

        map.clear().await.unwrap();
        assert_eq!(map.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn crud_propagates_store_outage() {
        let store = MemoryStore::new();
        let lifecycle = Lifecycle::with_store(store.clone(), fast_config());
        let map = lifecycle.open("orders").await;
        store.set_unavailable(true);

        assert!(map.size().await.is_err());
        assert!(map.get("k").await.is_err());
        assert!(map.put("k", "v").await.is_err());
        assert!(map.keys().await.is_err());
        store.set_unavailable(false);
    }

    #[tokio::test]
    async fn open_during_outage_is_degraded_not_failed() {
        let store = MemoryStore::new();
        let lifecycle = Lifecycle::with_store(store.clone(), fast_config());
        store.set_unavailable(true);
        let map = lifecycle.open("orders").await;
        store.set_unavailable(false);

        assert_eq!(map.liveness(), Liveness::Degraded);
        map.put("k", "v").await.unwrap();
        assert_eq!(lifecycle.subscriber_count("orders").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clones_share_one_attachment() {
        let store = MemoryStore::new();
        let lifecycle = Lifecycle::with_store(store.clone(), fast_config());
        let map = lifecycle.open("orders").await;
        map.put("k", "v").await.unwrap();
        let clone = map.clone();
        assert_eq!(clone.local_clones(), 2);
        assert_eq!(clone.id(), map.id());

        drop(map);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(clone.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(lifecycle.stats().deleted, 0);

        drop(clone);
        assert!(wait_for(|| lifecycle.stats().deleted == 1).await);
        assert_eq!(store.field_count("orders").await.unwrap(), 0);
        assert_eq!(lifecycle.stats().tracked_handles, 0);
    }

    #[tokio::test]
    async fn shutdown_finishes_queued_cleanups() {
        let store = MemoryStore::new();
        let config = MapConfig { poll_interval_ms: 60_000, ..fast_config() };
        let lifecycle = Lifecycle::with_store(store.clone(), config);
        let map = lifecycle.open("orders").await;
        map.put("k", "v").await.unwrap();
        // Let the detector consume its immediate first tick.
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(map);

        lifecycle.shutdown().await;
        assert_eq!(store.field_count("orders").await.unwrap(), 0);
        assert_eq!(lifecycle.stats().deleted, 1);
    }
}
