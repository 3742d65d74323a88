// Unreachability detector.
//
// Every handle owns an `Observer`. When the last clone of the handle is
// dropped the observer's `Drop` runs exactly once, marks the bookkeeping
// entry queued and pushes the identity onto the delivery queue. It never
// holds the handle itself. A single detector task per lifecycle polls the
// queue on a fixed interval and hands each identity, plus any retry that
// has come due, to the cleanup coordinator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::bookkeeping::Bookkeeping;
use crate::coordinator::CleanupCoordinator;
use crate::identity::HandleId;
use crate::store::CollectionStore;

/// Lifecycle observer tied to one handle.
pub struct Observer<S: CollectionStore> {
    id: HandleId,
    queue: UnboundedSender<HandleId>,
    bookkeeping: Arc<Bookkeeping<S>>,
}

impl<S: CollectionStore> Observer<S> {
    pub(crate) fn new(
        id: HandleId,
        queue: UnboundedSender<HandleId>,
        bookkeeping: Arc<Bookkeeping<S>>,
    ) -> Self {
        Self { id, queue, bookkeeping }
    }
}

impl<S: CollectionStore> Drop for Observer<S> {
    fn drop(&mut self) {
        self.bookkeeping.mark_queued(self.id);
        if self.queue.send(self.id).is_err() {
            // Detector already stopped; nothing will clean this handle up.
            debug!(handle = %self.id, "delivery queue closed, cleanup skipped");
        } else {
            trace!(handle = %self.id, "handle unreachable, cleanup queued");
        }
    }
}

/// Drain everything currently queued. The flag reports whether every
/// sender is gone.
fn drain_queue(queue: &mut UnboundedReceiver<HandleId>) -> (Vec<HandleId>, bool) {
    let mut delivered = Vec::new();
    loop {
        match queue.try_recv() {
            Ok(id) => delivered.push(id),
            Err(TryRecvError::Empty) => return (delivered, false),
            Err(TryRecvError::Disconnected) => return (delivered, true),
        }
    }
}

/// Detector loop. Exits after a shutdown request (finishing what is
/// already queued) or once the queue is closed and no retries remain.
pub(crate) async fn run_detector<S: CollectionStore>(
    coordinator: CleanupCoordinator<S>,
    mut queue: UnboundedReceiver<HandleId>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut watch_shutdown = true;
    debug!(poll_ms = poll_interval.as_millis() as u64, "unreachability detector started");

    loop {
        let stopping = tokio::select! {
            _ = ticker.tick() => false,
            changed = shutdown.changed(), if watch_shutdown => match changed {
                Ok(()) => *shutdown.borrow(),
                Err(_) => {
                    watch_shutdown = false;
                    false
                }
            },
        };

        let (delivered, closed) = drain_queue(&mut queue);
        for id in delivered {
            coordinator.run(id).await;
        }
        for id in coordinator.bookkeeping().due_retries(Instant::now()) {
            coordinator.run(id).await;
        }

        if stopping {
            let pending = coordinator.bookkeeping().pending_retries();
            info!(pending_retries = pending, "unreachability detector stopped");
            return;
        }
        if closed && coordinator.bookkeeping().pending_retries() == 0 {
            debug!("all handles and lifecycles dropped, detector exiting");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SubscriptionRegistry;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    #[test]
    fn drop_queues_identity_exactly_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let book: Arc<Bookkeeping<MemoryStore>> = Arc::new(Bookkeeping::default());
        let id = HandleId::new();
        book.register(id, "orders", MemoryStore::new());

        let observer = Observer::new(id, tx, book.clone());
        assert!(rx.try_recv().is_err());
        drop(observer);

        assert_eq!(rx.try_recv().unwrap(), id);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
        assert_eq!(book.state(id), Some(crate::bookkeeping::EntryState::Queued));
    }

    #[test]
    fn drain_reports_closed_queue() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (a, b) = (HandleId::new(), HandleId::new());
        tx.send(a).unwrap();
        tx.send(b).unwrap();
        assert_eq!(drain_queue(&mut rx), (vec![a, b], false));
        drop(tx);
        assert_eq!(drain_queue(&mut rx), (vec![], true));
    }

    #[tokio::test]
    async fn detector_cleans_dropped_handles_and_stops_on_shutdown() {
        let store = MemoryStore::new();
        let subs = Arc::new(SubscriptionRegistry::new(store.clone(), Duration::from_secs(1)));
        let book = Arc::new(Bookkeeping::default());
        let coordinator = CleanupCoordinator::new(subs.clone(), book.clone(), Duration::ZERO, 3);
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(run_detector(
            coordinator.clone(),
            rx,
            Duration::from_millis(5),
            shutdown_rx,
        ));

        let id = HandleId::new();
        book.register(id, "orders", store.clone());
        subs.open_subscription("orders", id).await.unwrap();
        store.field_replace("orders", "k", "v").await.unwrap();
        drop(Observer::new(id, tx.clone(), book.clone()));

        for _ in 0..200 {
            if coordinator.stats().deleted == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(coordinator.stats().deleted, 1);
        assert_eq!(store.field_count("orders").await.unwrap(), 0);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("detector should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn detector_exits_when_everything_is_dropped() {
        let store = MemoryStore::new();
        let subs = Arc::new(SubscriptionRegistry::new(store.clone(), Duration::from_secs(1)));
        let book = Arc::new(Bookkeeping::default());
        let coordinator = CleanupCoordinator::new(subs, book, Duration::ZERO, 3);
        let (tx, rx) = mpsc::unbounded_channel::<HandleId>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker =
            tokio::spawn(run_detector(coordinator, rx, Duration::from_millis(5), shutdown_rx));

        drop(shutdown_tx);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("detector should exit")
            .unwrap();
    }
}
