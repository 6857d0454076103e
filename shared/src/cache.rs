//! Stale-while-revalidate read path.
//!
//! Reads are answered from a bounded in-memory LRU, then from the local
//! store, and never wait on the network. When the answer is missing or older
//! than the staleness window a background fetch is started (at most one per
//! key) and its result is written back wholesale.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::reconciler::PendingOverlay;
use crate::remote::{DispatchError, RemoteApi, RemoteRecord};
use crate::store::{CacheRecord, Collection, LocalStore};

const DEFAULT_CAPACITY: usize = 1_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUpdate {
    pub collection: Collection,
    /// `None` for a whole-collection refresh.
    pub id: Option<String>,
}

type RecordKey = (Collection, String);
type RefreshKey = (Collection, Option<String>);

struct CacheInner {
    store: LocalStore,
    remote: Arc<dyn RemoteApi>,
    memory: Mutex<LruCache<RecordKey, CacheRecord>>,
    overlay: Arc<PendingOverlay>,
    stale_after: Duration,
    in_flight: Mutex<HashSet<RefreshKey>>,
    updates: broadcast::Sender<CacheUpdate>,
}

#[derive(Clone)]
pub struct ReadCache {
    inner: Arc<CacheInner>,
}

impl ReadCache {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteApi>, stale_after: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(DEFAULT_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        let (updates, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(CacheInner {
                store,
                remote,
                memory: Mutex::new(LruCache::new(capacity)),
                overlay: Arc::new(PendingOverlay::default()),
                stale_after,
                in_flight: Mutex::new(HashSet::new()),
                updates,
            }),
        }
    }

    pub(crate) fn overlay(&self) -> Arc<PendingOverlay> {
        Arc::clone(&self.inner.overlay)
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.inner.updates.subscribe()
    }

    fn memory(&self) -> MutexGuard<'_, LruCache<RecordKey, CacheRecord>> {
        self.inner.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, collection: &Collection, id: Option<&str>) {
        let update = CacheUpdate {
            collection: collection.clone(),
            id: id.map(str::to_string),
        };
        if self.inner.updates.send(update).is_err() {
            trace!("no subscribers for cache update");
        }
    }

    /// Local copy only, no network.
    pub async fn get(&self, collection: &Collection, id: &str) -> Option<CacheRecord> {
        let key = (collection.clone(), id.to_string());
        if let Some(record) = self.memory().get(&key) {
            return Some(record.clone());
        }
        let record = self.inner.store.get(collection, id).await?;
        self.memory().put(key, record.clone());
        Some(record)
    }

    pub fn is_stale(&self, record: &CacheRecord) -> bool {
        record.is_stale(self.inner.store.now(), self.inner.stale_after)
    }

    /// Returns whatever is cached right now and revalidates in the
    /// background when that is missing or stale.
    pub async fn read(&self, collection: &Collection, id: &str) -> Option<CacheRecord> {
        let record = self.get(collection, id).await;
        let needs_refresh = record.as_ref().map_or(true, |r| self.is_stale(r));
        if needs_refresh && collection.is_entity() && !id.starts_with("local-") {
            self.spawn_refresh(collection.clone(), Some(id.to_string()));
        }
        record
    }

    /// Listing counterpart of [`read`](Self::read).
    pub async fn read_collection(&self, collection: &Collection) -> Vec<CacheRecord> {
        let records = self.inner.store.get_all(collection).await;
        let needs_refresh = records.is_empty() || records.iter().any(|r| self.is_stale(r));
        if needs_refresh && collection.is_entity() {
            self.spawn_refresh(collection.clone(), None);
        }
        records
    }

    fn spawn_refresh(&self, collection: Collection, id: Option<String>) {
        let key = (collection, id);
        {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !in_flight.insert(key.clone()) {
                return;
            }
        }

        let cache = self.clone();
        tokio::spawn(async move {
            let (collection, id) = &key;
            let result = match id {
                Some(id) => cache.refresh(collection, id).await.map(|_| ()),
                None => cache.refresh_collection(collection).await.map(|_| ()),
            };
            if let Err(e) = result {
                debug!(%collection, ?id, error = %e, "revalidation failed, keeping cached copy");
            }
            cache
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        });
    }

    async fn write(&self, record: CacheRecord) {
        let key = (record.collection.clone(), record.id.clone());
        self.inner.store.put_record(record.clone()).await;
        self.memory().put(key, record.clone());
        self.notify(&record.collection, Some(&record.id));
    }

    async fn remove(&self, collection: &Collection, id: &str) {
        self.inner.store.delete(collection, id).await;
        self.memory().pop(&(collection.clone(), id.to_string()));
        self.notify(collection, Some(id));
    }

    /// Stores an authoritative copy. Pending optimistic changes for the same
    /// record are replayed on top of it.
    pub async fn put_server(&self, record: RemoteRecord) {
        let now = self.inner.store.now();
        let tracked = self.inner.overlay.is_tracked(&record.collection, &record.id);
        let payload = self
            .inner
            .overlay
            .rebase(&record.collection, &record.id, record.payload);
        let mut cached = CacheRecord::new(record.collection, record.id, payload, now);
        if !tracked {
            cached = cached.with_etag(record.etag);
        }
        self.write(cached).await;
    }

    /// Writes (or with `None`, deletes) a locally computed value.
    pub async fn put_local(&self, collection: Collection, id: &str, payload: Option<Value>) {
        match payload {
            Some(payload) => {
                let record = CacheRecord::new(collection, id, payload, self.inner.store.now());
                self.write(record).await;
            }
            None => self.remove(&collection, id).await,
        }
    }

    /// Drops the in-memory copy; the store keeps its record.
    pub fn invalidate(&self, collection: &Collection, id: &str) {
        self.memory().pop(&(collection.clone(), id.to_string()));
    }

    /// Fetches one record now. A record the server no longer has is removed
    /// locally unless it still has pending local changes.
    pub async fn refresh(&self, collection: &Collection, id: &str) -> Result<Option<CacheRecord>, DispatchError> {
        match self.inner.remote.fetch(collection, id).await? {
            Some(record) => {
                self.put_server(record).await;
                Ok(self.get(collection, id).await)
            }
            None => {
                if !self.inner.overlay.is_tracked(collection, id) {
                    warn!(%collection, id, "record gone on server, removing local copy");
                    self.remove(collection, id).await;
                }
                Ok(None)
            }
        }
    }

    /// Fetches a listing and upserts every record in it.
    pub async fn refresh_collection(&self, collection: &Collection) -> Result<usize, DispatchError> {
        let records = self.inner.remote.fetch_collection(collection).await?;
        let count = records.len();
        for record in records {
            self.put_server(record).await;
        }
        debug!(%collection, count, "collection refreshed");
        self.notify(collection, None);
        Ok(count)
    }
}
