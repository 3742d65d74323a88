// Per-handle cleanup bookkeeping.
//
// Each entry carries only what cleanup needs once the handle is gone: the
// collection name and a store connection. Entries never point back at the
// handle, otherwise the handle could never become unreachable.
//
// Entry states:
//   registered → queued → delivered            (handle dropped, cleanup ran)
//   delivered → delivered (retry scheduled)     (cleanup deferred)

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::identity::HandleId;

const BASE_RETRY_DELAY_MS: u64 = 250;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Where an entry is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Handle is alive.
    Registered,
    /// Handle became unreachable; its identity sits on the delivery queue.
    Queued,
    /// The detector handed the entry to the coordinator.
    Delivered,
}

#[derive(Debug)]
struct CleanupEntry<S> {
    name: String,
    store: S,
    state: EntryState,
    attempts: u32,
    registered_at: DateTime<Utc>,
    retry_at: Option<Instant>,
}

/// Plain data handed to one cleanup attempt.
#[derive(Debug, Clone)]
pub struct CleanupTicket<S> {
    pub id: HandleId,
    pub name: String,
    pub store: S,
    pub attempt: u32,
    pub registered_at: DateTime<Utc>,
}

/// Process-wide map of identity to cleanup entry.
#[derive(Debug)]
pub struct Bookkeeping<S> {
    entries: Mutex<HashMap<HandleId, CleanupEntry<S>>>,
}

impl<S> Default for Bookkeeping<S> {
    fn default() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }
}

impl<S: Clone> Bookkeeping<S> {
    pub fn register(&self, id: HandleId, name: &str, store: S) {
        self.lock().insert(
            id,
            CleanupEntry {
                name: name.to_string(),
                store,
                state: EntryState::Registered,
                attempts: 0,
                registered_at: Utc::now(),
                retry_at: None,
            },
        );
    }

    /// Record that the handle's unreachability event was enqueued.
    pub fn mark_queued(&self, id: HandleId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.state = EntryState::Queued;
        }
    }

    /// Start a cleanup attempt. Returns `None` for unknown identities and
    /// for entries whose handle is still alive.
    pub fn begin_attempt(&self, id: HandleId) -> Option<CleanupTicket<S>> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id)?;
        if entry.state == EntryState::Registered {
            return None;
        }
        entry.state = EntryState::Delivered;
        entry.attempts += 1;
        entry.retry_at = None;
        Some(CleanupTicket {
            id,
            name: entry.name.clone(),
            store: entry.store.clone(),
            attempt: entry.attempts,
            registered_at: entry.registered_at,
        })
    }

    /// Schedule another attempt with exponential backoff. Returns the delay,
    /// or `None` when the entry is unknown or out of attempts (in which case
    /// it is removed).
    pub fn schedule_retry(&self, id: HandleId, max_attempts: u32) -> Option<Duration> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id)?;
        if entry.attempts >= max_attempts {
            entries.remove(&id);
            return None;
        }
        let delay = retry_delay(entry.attempts);
        entry.retry_at = Some(Instant::now() + delay);
        Some(delay)
    }

    /// Identities whose scheduled retry is due at `now`.
    pub fn due_retries(&self, now: Instant) -> Vec<HandleId> {
        let entries = self.lock();
        let mut due: Vec<(Instant, HandleId)> = entries
            .iter()
            .filter_map(|(id, entry)| entry.retry_at.filter(|at| *at <= now).map(|at| (at, *id)))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn remove(&self, id: HandleId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn state(&self, id: HandleId) -> Option<EntryState> {
        self.lock().get(&id).map(|entry| entry.state)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn pending_retries(&self) -> usize {
        self.lock().values().filter(|entry| entry.retry_at.is_some()).count()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<HandleId, CleanupEntry<S>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Backoff before attempt `attempts + 1`: 250ms, 500ms, 1s, ... capped at 30s.
pub fn retry_delay(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    let millis = BASE_RETRY_DELAY_MS.saturating_mul(1 << exponent).min(MAX_RETRY_DELAY_MS);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book_with(id: HandleId) -> Bookkeeping<&'static str> {
        let book = Bookkeeping::default();
        book.register(id, "orders", "conn");
        book
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        assert_eq!(retry_delay(1), Duration::from_millis(250));
        assert_eq!(retry_delay(2), Duration::from_millis(500));
        assert_eq!(retry_delay(3), Duration::from_millis(1_000));
        assert_eq!(retry_delay(20), Duration::from_millis(30_000));
    }

    #[test]
    fn live_entries_cannot_start_cleanup() {
        let id = HandleId::new();
        let book = book_with(id);
        assert_eq!(book.state(id), Some(EntryState::Registered));
        assert!(book.begin_attempt(id).is_none());
        assert!(book.begin_attempt(HandleId::new()).is_none());
    }

    #[test]
    fn queued_entry_moves_to_delivered() {
        let id = HandleId::new();
        let book = book_with(id);
        book.mark_queued(id);
        assert_eq!(book.state(id), Some(EntryState::Queued));

        let ticket = book.begin_attempt(id).expect("queued entry should start");
        assert_eq!(ticket.name, "orders");
        assert_eq!(ticket.store, "conn");
        assert_eq!(ticket.attempt, 1);
        assert_eq!(book.state(id), Some(EntryState::Delivered));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_become_due_after_backoff() {
        let id = HandleId::new();
        let book = book_with(id);
        book.mark_queued(id);
        book.begin_attempt(id).unwrap();

        let delay = book.schedule_retry(id, 3).expect("retry should be scheduled");
        assert_eq!(delay, Duration::from_millis(250));
        assert_eq!(book.pending_retries(), 1);
        assert!(book.due_retries(Instant::now()).is_empty());

        tokio::time::advance(delay).await;
        assert_eq!(book.due_retries(Instant::now()), vec![id]);

        let ticket = book.begin_attempt(id).unwrap();
        assert_eq!(ticket.attempt, 2);
        assert_eq!(book.pending_retries(), 0);
    }

    #[test]
    fn exhausted_entries_are_dropped() {
        let id = HandleId::new();
        let book = book_with(id);
        book.mark_queued(id);
        book.begin_attempt(id).unwrap();
        assert!(book.schedule_retry(id, 1).is_none());
        assert_eq!(book.len(), 0);
    }
}
