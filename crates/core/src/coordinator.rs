// Cleanup coordinator: the only place a collection is ever deleted.
//
// For one departed handle:
//   1. close its liveness subscription (so it does not count itself)
//   2. count the remaining subscribers on the collection's channel
//   3. if none, wait out the grace period and count again
//   4. delete the collection only if both counts were zero
//   5. forget the handle's bookkeeping
//
// There is no distributed lock. Two handles leaving at once may both see
// zero and both delete, which is harmless because delete is idempotent. A
// handle attaching between another handle's steps 1 and 4 can still lose
// the data it just found; the grace recount narrows that window but does
// not close it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bookkeeping::{Bookkeeping, CleanupTicket};
use crate::identity::HandleId;
use crate::registry::{SubscriberCount, SubscriptionRegistry};
use crate::store::CollectionStore;

/// What one cleanup attempt concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// No subscribers remained and the collection was removed.
    Deleted,
    /// Other handles are still attached; the data stays.
    Retained { subscribers: usize },
    /// No subscribers remained but the collection was already gone,
    /// typically removed by a concurrent cleanup. Benign.
    AlreadyGone,
    /// Liveness could not be determined or the delete failed; another
    /// attempt is scheduled.
    Deferred { retry_in: Duration },
    /// Deferred too many times; the entry was dropped without deleting.
    Abandoned,
    /// No live bookkeeping entry for this identity.
    Untracked,
}

/// Cumulative cleanup counters plus current registry sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub deleted: u64,
    pub retained: u64,
    pub already_gone: u64,
    pub deferred: u64,
    pub abandoned: u64,
    pub tracked_handles: usize,
    pub open_subscriptions: usize,
    pub pending_retries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    deleted: AtomicU64,
    retained: AtomicU64,
    already_gone: AtomicU64,
    deferred: AtomicU64,
    abandoned: AtomicU64,
}

/// Decides and performs deletion for departed handles.
pub struct CleanupCoordinator<S: CollectionStore> {
    subscriptions: Arc<SubscriptionRegistry<S>>,
    bookkeeping: Arc<Bookkeeping<S>>,
    grace: Duration,
    max_attempts: u32,
    counters: Arc<Counters>,
}

impl<S: CollectionStore> Clone for CleanupCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            subscriptions: self.subscriptions.clone(),
            bookkeeping: self.bookkeeping.clone(),
            grace: self.grace,
            max_attempts: self.max_attempts,
            counters: self.counters.clone(),
        }
    }
}

enum Verdict {
    Delete,
    Keep(usize),
    Unsure,
}

impl<S: CollectionStore> CleanupCoordinator<S> {
    pub fn new(
        subscriptions: Arc<SubscriptionRegistry<S>>,
        bookkeeping: Arc<Bookkeeping<S>>,
        grace: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            subscriptions,
            bookkeeping,
            grace,
            max_attempts: max_attempts.max(1),
            counters: Arc::default(),
        }
    }

    /// Run one cleanup attempt for `id`.
    pub async fn run(&self, id: HandleId) -> CleanupOutcome {
        let Some(ticket) = self.bookkeeping.begin_attempt(id) else {
            debug!(handle = %id, "no pending cleanup for handle");
            return CleanupOutcome::Untracked;
        };

        let outcome = match self.attempt(&ticket).await {
            Some(outcome) => {
                self.bookkeeping.remove(id);
                outcome
            }
            None => self.defer(&ticket),
        };
        self.record(&ticket, outcome);
        outcome
    }

    /// `None` means the attempt could not reach a safe decision.
    async fn attempt(&self, ticket: &CleanupTicket<S>) -> Option<CleanupOutcome> {
        let CleanupTicket { id, name, store, .. } = ticket;

        if let Err(error) = self.subscriptions.close_subscription(*id).await {
            // Our own subscription may still be counted; try again later.
            warn!(handle = %id, collection = %name, %error, "failed to retire subscription");
            return None;
        }

        match self.verdict(store, name).await {
            Verdict::Keep(subscribers) => Some(CleanupOutcome::Retained { subscribers }),
            Verdict::Unsure => None,
            Verdict::Delete => match store.delete_collection(name).await {
                Ok(true) => Some(CleanupOutcome::Deleted),
                Ok(false) => Some(CleanupOutcome::AlreadyGone),
                Err(error) => {
                    warn!(handle = %id, collection = %name, %error, "failed to delete collection");
                    None
                }
            },
        }
    }

    async fn verdict(&self, store: &S, name: &str) -> Verdict {
        match self.subscriptions.count_subscribers(store, name).await {
            SubscriberCount::Unknown => return Verdict::Unsure,
            SubscriberCount::Known(0) => {}
            SubscriberCount::Known(n) => return Verdict::Keep(n),
        }
        if self.grace.is_zero() {
            return Verdict::Delete;
        }

        tokio::time::sleep(self.grace).await;
        match self.subscriptions.count_subscribers(store, name).await {
            SubscriberCount::Unknown => Verdict::Unsure,
            SubscriberCount::Known(0) => Verdict::Delete,
            SubscriberCount::Known(n) => {
                debug!(collection = %name, subscribers = n, "handle attached during grace period");
                Verdict::Keep(n)
            }
        }
    }

    fn defer(&self, ticket: &CleanupTicket<S>) -> CleanupOutcome {
        match self.bookkeeping.schedule_retry(ticket.id, self.max_attempts) {
            Some(retry_in) => CleanupOutcome::Deferred { retry_in },
            None => CleanupOutcome::Abandoned,
        }
    }

    fn record(&self, ticket: &CleanupTicket<S>, outcome: CleanupOutcome) {
        let CleanupTicket { id, name, attempt, registered_at, .. } = ticket;
        let lived_ms = (chrono::Utc::now() - *registered_at).num_milliseconds();
        let counters = &self.counters;
        match outcome {
            CleanupOutcome::Deleted => {
                counters.deleted.fetch_add(1, Ordering::Relaxed);
                info!(handle = %id, collection = %name, attempt, lived_ms, "last handle gone, collection deleted");
            }
            CleanupOutcome::Retained { subscribers } => {
                counters.retained.fetch_add(1, Ordering::Relaxed);
                debug!(handle = %id, collection = %name, subscribers, "collection still attached elsewhere");
            }
            CleanupOutcome::AlreadyGone => {
                counters.already_gone.fetch_add(1, Ordering::Relaxed);
                debug!(handle = %id, collection = %name, "collection already deleted by a concurrent cleanup");
            }
            CleanupOutcome::Deferred { retry_in } => {
                counters.deferred.fetch_add(1, Ordering::Relaxed);
                warn!(handle = %id, collection = %name, attempt, retry_ms = retry_in.as_millis() as u64, "cleanup deferred");
            }
            CleanupOutcome::Abandoned => {
                counters.abandoned.fetch_add(1, Ordering::Relaxed);
                error!(handle = %id, collection = %name, attempt, "cleanup abandoned, collection left in place");
            }
            CleanupOutcome::Untracked => {}
        }
    }

    pub fn stats(&self) -> CleanupStats {
        let c = &self.counters;
        CleanupStats {
            deleted: c.deleted.load(Ordering::Relaxed),
            retained: c.retained.load(Ordering::Relaxed),
            already_gone: c.already_gone.load(Ordering::Relaxed),
            deferred: c.deferred.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            tracked_handles: self.bookkeeping.len(),
            open_subscriptions: self.subscriptions.open_count(),
            pending_retries: self.bookkeeping.pending_retries(),
        }
    }

    pub(crate) fn bookkeeping(&self) -> &Bookkeeping<S> {
        &self.bookkeeping
    }
}
