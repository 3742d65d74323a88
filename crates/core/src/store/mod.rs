// Remote collection store contract.
//
// The protocol needs two things from the store: hash-like field commands
// against a named collection, and pub/sub with an introspectable
// subscriber count per channel. `RedisStore` is the production backend;
// `MemoryStore` implements the same contract in-process.

pub mod memory;
pub mod redis_store;

use std::collections::{HashMap, HashSet};
use std::future::Future;

use tokio::sync::oneshot;

use crate::error::Result;

pub use self::memory::{MemoryListener, MemoryStore};
pub use self::redis_store::{RedisListener, RedisStore};

/// Hash-collection and pub/sub commands consumed by the handle and cleanup.
///
/// Implementations are cheap to clone; a clone shares the underlying
/// connection. All methods return `Send` futures so cleanup can run on a
/// multi-threaded runtime.
pub trait CollectionStore: Clone + Send + Sync + 'static {
    type Listener: ListenerSession;

    /// Number of fields in the collection (0 when it does not exist).
    fn field_count(&self, name: &str) -> impl Future<Output = Result<usize>> + Send;

    fn field_exists(&self, name: &str, key: &str) -> impl Future<Output = Result<bool>> + Send;

    fn field_get(
        &self,
        name: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Set a field and return the value it replaced, as one atomic step.
    fn field_replace(
        &self,
        name: &str,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Set many fields in a single command. An empty slice is a no-op.
    fn field_set_many(
        &self,
        name: &str,
        entries: &[(String, String)],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete a field and return the value it held, as one atomic step.
    fn field_take(
        &self,
        name: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    fn all_fields(&self, name: &str) -> impl Future<Output = Result<HashSet<String>>> + Send;

    fn all_values(&self, name: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn all_entries(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<HashMap<String, String>>> + Send;

    /// Delete the whole collection. Returns whether anything was removed;
    /// deleting an absent collection succeeds with `false`.
    fn delete_collection(&self, name: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Subscribers currently listening on `channel`, across all processes.
    fn subscriber_count(&self, channel: &str) -> impl Future<Output = Result<usize>> + Send;

    /// Open a dedicated listening session subscribed to `channel`. The
    /// subscription is confirmed by the store before this resolves.
    fn listen(&self, channel: &str) -> impl Future<Output = Result<Self::Listener>> + Send;
}

/// A dedicated pub/sub session owned by one subscription record.
pub trait ListenerSession: Send + 'static {
    /// Hold the subscription open, discarding any published payloads,
    /// until `stop` resolves or its sender is dropped. Then unsubscribe
    /// and release the connection. Resolves to the number of messages
    /// observed while listening.
    fn serve(self, stop: oneshot::Receiver<()>) -> impl Future<Output = Result<u64>> + Send;
}
