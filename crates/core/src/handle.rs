// Local handle onto a named shared collection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::detector::Observer;
use crate::error::Result;
use crate::identity::HandleId;
use crate::store::{CollectionStore, RedisStore};

/// Whether the handle's attachment is visible to other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Liveness {
    /// The liveness subscription is open; other processes count this handle.
    Tracked,
    /// The subscription could not be opened. The handle works, but other
    /// processes do not know it exists and may delete the collection.
    Degraded,
    /// The store dropped the subscription after it was opened. Until it is
    /// re-established other processes do not count this handle.
    Lost,
}

/// Liveness shared between a handle and the task supervising its
/// subscription.
#[derive(Debug)]
pub struct LivenessCell(AtomicU8);

impl LivenessCell {
    pub(crate) fn new(liveness: Liveness) -> Self {
        Self(AtomicU8::new(liveness as u8))
    }

    pub fn get(&self) -> Liveness {
        match self.0.load(Ordering::Acquire) {
            0 => Liveness::Tracked,
            1 => Liveness::Degraded,
            _ => Liveness::Lost,
        }
    }

    pub(crate) fn set(&self, liveness: Liveness) {
        self.0.store(liveness as u8, Ordering::Release);
    }
}

/// One attachment to a named collection in the remote store.
///
/// Clones share the attachment. When the last clone is dropped the handle
/// is unreachable: its subscription is retired in the background and, if no
/// other handle in any process is attached, the collection is deleted.
///
/// Every operation goes straight to the store; nothing is cached locally,
/// so writes through one handle are visible through every other handle on
/// the same name. Store failures are returned, never papered over with
/// empty results.
pub struct SharedMap<S: CollectionStore = RedisStore> {
    inner: Arc<HandleInner<S>>,
}

struct HandleInner<S: CollectionStore> {
    id: HandleId,
    name: String,
    store: S,
    liveness: Arc<LivenessCell>,
    _observer: Observer<S>,
}

impl<S: CollectionStore> Clone for SharedMap<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S: CollectionStore> fmt::Debug for SharedMap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMap")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("liveness", &self.inner.liveness.get())
            .finish()
    }
}

impl<S: CollectionStore> SharedMap<S> {
    pub(crate) fn new(
        id: HandleId,
        name: String,
        store: S,
        liveness: Arc<LivenessCell>,
        observer: Observer<S>,
    ) -> Self {
        Self { inner: Arc::new(HandleInner { id, name, store, liveness, _observer: observer }) }
    }

    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// Name of the shared collection (and of its liveness channel).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current liveness. Changes to [`Liveness::Lost`] and back while the
    /// subscription is being re-established after the store dropped it.
    pub fn liveness(&self) -> Liveness {
        self.inner.liveness.get()
    }

    pub async fn size(&self) -> Result<usize> {
        self.inner.store.field_count(self.name()).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.size().await? == 0)
    }

    pub async fn contains_key(&self, key: &str) -> Result<bool> {
        self.inner.store.field_exists(self.name(), key).await
    }

    /// Linear scan over all values.
    pub async fn contains_value(&self, value: &str) -> Result<bool> {
        Ok(self.values().await?.iter().any(|v| v == value))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.store.field_get(self.name(), key).await
    }

    /// Store `value` under `key`, returning the value it replaced.
    pub async fn put(&self, key: &str, value: &str) -> Result<Option<String>> {
        self.inner.store.field_replace(self.name(), key, value).await
    }

    pub async fn put_all<I, K, V>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entries: Vec<(String, String)> =
            entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.inner.store.field_set_many(self.name(), &entries).await
    }

    /// Remove `key`, returning the value it held.
    pub async fn remove(&self, key: &str) -> Result<Option<String>> {
        self.inner.store.field_take(self.name(), key).await
    }

    /// Remove every entry. Other handles on the same name see it empty too.
    pub async fn clear(&self) -> Result<()> {
        self.inner.store.delete_collection(self.name()).await.map(|_| ())
    }

    pub async fn keys(&self) -> Result<HashSet<String>> {
        self.inner.store.all_fields(self.name()).await
    }

    pub async fn values(&self) -> Result<Vec<String>> {
        self.inner.store.all_values(self.name()).await
    }

    pub async fn entries(&self) -> Result<HashMap<String, String>> {
        self.inner.store.all_entries(self.name()).await
    }

    /// Whether both handles currently see the same entries.
    pub async fn same_contents<T: CollectionStore>(&self, other: &SharedMap<T>) -> Result<bool> {
        Ok(self.entries().await? == other.entries().await?)
    }

    /// Number of live clones of this attachment in this process.
    pub fn local_clones(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}
