//! Durable local store.
//!
//! A schema-less, collection-partitioned key-value layer. Every record is a
//! [`CacheRecord`] keyed by `(collection, id)` and written wholesale.
//!
//! [`LocalStore`] is a best-effort facade over a [`KvBackend`]: when the
//! backend fails (quota, not initialized, I/O) the call is absorbed, a
//! warning is logged and an in-memory fallback takes over for that record.
//! Callers never see storage errors from the facade.

mod memory;
#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

pub use self::memory::MemoryBackend;
#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteBackend;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::{SharedClock, SystemClock, UnixTimeMs};

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_PREFIX_LENGTH: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupted record {collection}/{id}: {reason}")]
    Corrupted {
        collection: String,
        id: String,
        reason: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Named partition of the store. One per entity kind, plus the sync
/// engine's own bookkeeping namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Collection {
    Reports,
    Topics,
    Comments,
    Places,
    Drafts,
    Outbox,
    Cache,
    Custom(String),
}

impl Collection {
    pub fn prefix(&self) -> &str {
        match self {
            Collection::Reports => "reports",
            Collection::Topics => "topics",
            Collection::Comments => "comments",
            Collection::Places => "places",
            Collection::Drafts => "drafts",
            Collection::Outbox => "outbox",
            Collection::Cache => "cache",
            Collection::Custom(s) => s.as_str(),
        }
    }

    pub fn from_prefix(prefix: &str) -> Result<Self, StoreError> {
        Ok(match prefix {
            "reports" => Collection::Reports,
            "topics" => Collection::Topics,
            "comments" => Collection::Comments,
            "places" => Collection::Places,
            "drafts" => Collection::Drafts,
            "outbox" => Collection::Outbox,
            "cache" => Collection::Cache,
            other => Collection::custom(other)?,
        })
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, StoreError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(StoreError::InvalidKey {
                key: prefix,
                reason: "custom collection cannot be empty".to_string(),
            });
        }
        if prefix.len() > MAX_PREFIX_LENGTH {
            return Err(StoreError::InvalidKey {
                key: prefix,
                reason: format!(
                    "custom collection exceeds maximum length of {} bytes",
                    MAX_PREFIX_LENGTH
                ),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(StoreError::InvalidKey {
                key: prefix,
                reason: "custom collection contains invalid characters".to_string(),
            });
        }
        Ok(Collection::Custom(prefix))
    }

    /// Collections holding server entities, as opposed to engine bookkeeping.
    pub fn is_entity(&self) -> bool {
        !matches!(self, Collection::Drafts | Collection::Outbox)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl TryFrom<String> for Collection {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Collection::from_prefix(&value)
    }
}

impl From<Collection> for String {
    fn from(value: Collection) -> Self {
        value.prefix().to_string()
    }
}

pub fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.trim().is_empty() {
        return Err(StoreError::InvalidKey {
            key: key.to_string(),
            reason: "key cannot be empty".to_string(),
        });
    }

    if key.len() > MAX_KEY_LENGTH {
        return Err(StoreError::InvalidKey {
            key: key.chars().take(50).collect::<String>() + "...",
            reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
        });
    }

    if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
        return Err(StoreError::InvalidKey {
            key: key.to_string(),
            reason: "key cannot contain path traversal sequences".to_string(),
        });
    }

    if key.chars().any(char::is_control) {
        return Err(StoreError::InvalidKey {
            key: key.escape_default().to_string(),
            reason: "key contains control characters".to_string(),
        });
    }

    Ok(())
}

/// One stored record. Unique per `(collection, id)`, replaced wholesale on
/// every write and never partially merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub collection: Collection,
    pub id: String,
    pub payload: serde_json::Value,
    pub fetched_at: UnixTimeMs,
    pub etag: Option<String>,
}

impl CacheRecord {
    /// Builds a record whose etag is the blake3 hash of the payload.
    pub fn new(
        collection: Collection,
        id: impl Into<String>,
        payload: serde_json::Value,
        fetched_at: UnixTimeMs,
    ) -> Self {
        let etag = Some(content_hash(&payload));
        Self {
            collection,
            id: id.into(),
            payload,
            fetched_at,
            etag,
        }
    }

    #[must_use]
    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        if etag.is_some() {
            self.etag = etag;
        }
        self
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| StoreError::Corrupted {
            collection: self.collection.to_string(),
            id: self.id.clone(),
            reason: e.to_string(),
        })
    }

    pub fn is_stale(&self, now: UnixTimeMs, max_age: std::time::Duration) -> bool {
        now.elapsed_since(self.fetched_at) >= max_age
    }
}

pub fn content_hash(payload: &serde_json::Value) -> String {
    // serde_json::Value serializes maps in key order, so this is canonical
    let bytes = payload.to_string();
    hex::encode(blake3::hash(bytes.as_bytes()).as_bytes())
}

/// Storage engine behind the [`LocalStore`] facade.
///
/// Each call is transactional for a single record. `get_all` returns a
/// snapshot and must be safe to call while other tasks write.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn put(&self, record: CacheRecord) -> Result<(), StoreError>;
    async fn get(&self, collection: &Collection, id: &str) -> Result<Option<CacheRecord>, StoreError>;
    async fn get_all(&self, collection: &Collection) -> Result<Vec<CacheRecord>, StoreError>;
    async fn delete(&self, collection: &Collection, id: &str) -> Result<bool, StoreError>;
    async fn clear(&self, collection: &Collection) -> Result<usize, StoreError>;
}

struct StoreInner {
    backend: Option<Arc<dyn KvBackend>>,
    fallback: MemoryBackend,
    /// Ids deleted while the backend was failing; hides stale backend rows.
    tombstones: Mutex<HashSet<(Collection, String)>>,
    degraded: AtomicBool,
    writers: Mutex<HashMap<Collection, Arc<tokio::sync::Mutex<()>>>>,
    clock: SharedClock,
}

/// Cheap-to-clone handle on the local store.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStore")
            .field("durable", &self.inner.backend.is_some())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl LocalStore {
    pub fn new(backend: Arc<dyn KvBackend>, clock: SharedClock) -> Self {
        Self::build(Some(backend), clock)
    }

    /// Store with no durable backend at all; everything lives in memory.
    pub fn memory_only(clock: SharedClock) -> Self {
        Self::build(None, clock)
    }

    /// Opens the SQLite file at `path`, degrading to memory-only when the
    /// file cannot be opened.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn open_sqlite(path: &std::path::Path, clock: SharedClock) -> Self {
        match SqliteBackend::open(path) {
            Ok(backend) => {
                info!(path = %path.display(), "local store opened");
                Self::new(Arc::new(backend), clock)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "local store unavailable, running memory-only");
                let store = Self::memory_only(clock);
                store.inner.degraded.store(true, Ordering::Relaxed);
                store
            }
        }
    }

    fn build(backend: Option<Arc<dyn KvBackend>>, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend,
                fallback: MemoryBackend::new(),
                tombstones: Mutex::new(HashSet::new()),
                degraded: AtomicBool::new(false),
                writers: Mutex::new(HashMap::new()),
                clock,
            }),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.inner.backend.is_some() && !self.is_degraded()
    }

    /// True once any backend call has failed.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Relaxed)
    }

    pub fn now(&self) -> UnixTimeMs {
        self.inner.clock.now()
    }

    pub fn clock(&self) -> SharedClock {
        Arc::clone(&self.inner.clock)
    }

    fn writer(&self, collection: &Collection) -> Arc<tokio::sync::Mutex<()>> {
        let mut writers = self
            .inner
            .writers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(writers.entry(collection.clone()).or_default())
    }

    fn mark_degraded(&self, op: &'static str, collection: &Collection, error: &StoreError) {
        let was = self.inner.degraded.swap(true, Ordering::Relaxed);
        if was {
            warn!(op, %collection, %error, "local store write absorbed");
        } else {
            warn!(op, %collection, %error, "local store degraded, falling back to memory");
        }
    }

    fn tombstones(&self) -> std::sync::MutexGuard<'_, HashSet<(Collection, String)>> {
        self.inner
            .tombstones
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Writes `payload` under `(collection, id)` stamped with the current time.
    pub async fn put(&self, collection: Collection, id: &str, payload: serde_json::Value) {
        let record = CacheRecord::new(collection, id, payload, self.now());
        self.put_record(record).await;
    }

    /// Writes a fully built record, replacing whatever was there.
    pub async fn put_record(&self, record: CacheRecord) {
        if let Err(e) = validate_key(&record.id) {
            warn!(collection = %record.collection, error = %e, "refusing to store record");
            return;
        }

        let writer = self.writer(&record.collection);
        let _guard = writer.lock().await;

        let collection = record.collection.clone();
        let id = record.id.clone();
        self.tombstones().remove(&(collection.clone(), id.clone()));

        let Some(backend) = &self.inner.backend else {
            self.inner.fallback.insert(record).await;
            return;
        };

        match backend.put(record.clone()).await {
            Ok(()) => {
                if self.is_degraded() {
                    self.inner.fallback.remove(&collection, &id).await;
                }
            }
            Err(e) => {
                self.mark_degraded("put", &collection, &e);
                self.inner.fallback.insert(record).await;
            }
        }
    }

    pub async fn get(&self, collection: &Collection, id: &str) -> Option<CacheRecord> {
        if let Some(record) = self.inner.fallback.lookup(collection, id).await {
            return Some(record);
        }
        if self.tombstones().contains(&(collection.clone(), id.to_string())) {
            return None;
        }
        let backend = self.inner.backend.as_ref()?;
        match backend.get(collection, id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(%collection, id, error = %e, "local store read failed");
                None
            }
        }
    }

    /// Snapshot of every record in `collection`, ordered by id.
    pub async fn get_all(&self, collection: &Collection) -> Vec<CacheRecord> {
        let mut merged: BTreeMap<String, CacheRecord> = BTreeMap::new();

        if let Some(backend) = &self.inner.backend {
            match backend.get_all(collection).await {
                Ok(records) => {
                    merged.extend(records.into_iter().map(|r| (r.id.clone(), r)));
                }
                Err(e) => {
                    warn!(%collection, error = %e, "local store scan failed");
                }
            }
        }

        {
            let tombstones = self.tombstones();
            merged.retain(|id, _| !tombstones.contains(&(collection.clone(), id.clone())));
        }

        let records = self.inner.fallback.records(collection).await;
        merged.extend(records.into_iter().map(|r| (r.id.clone(), r)));

        merged.into_values().collect()
    }

    pub async fn delete(&self, collection: &Collection, id: &str) {
        let writer = self.writer(collection);
        let _guard = writer.lock().await;

        self.inner.fallback.remove(collection, id).await;
        if let Some(backend) = &self.inner.backend {
            if let Err(e) = backend.delete(collection, id).await {
                self.mark_degraded("delete", collection, &e);
                self.tombstones()
                    .insert((collection.clone(), id.to_string()));
            }
        }
    }

    pub async fn clear(&self, collection: &Collection) {
        let writer = self.writer(collection);
        let _guard = writer.lock().await;

        self.inner.fallback.remove_all(collection).await;
        if let Some(backend) = &self.inner.backend {
            if let Err(e) = backend.clear(collection).await {
                self.mark_degraded("clear", collection, &e);
            }
        }
        self.tombstones().retain(|(c, _)| c != collection);
    }

    pub fn typed<T>(&self, collection: Collection) -> TypedCollection<T> {
        TypedCollection {
            store: self.clone(),
            collection,
            _phantom: PhantomData,
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::memory_only(Arc::new(SystemClock))
    }
}

/// Serde view over one collection.
pub struct TypedCollection<T> {
    store: LocalStore,
    collection: Collection,
    _phantom: PhantomData<T>,
}

impl<T> Clone for TypedCollection<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            collection: self.collection.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> TypedCollection<T> {
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub async fn put(&self, id: &str, value: &T) -> Result<(), StoreError> {
        let payload = serde_json::to_value(value)?;
        self.store.put(self.collection.clone(), id, payload).await;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<T> {
        let record = self.store.get(&self.collection, id).await?;
        match record.deserialize() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(collection = %self.collection, id, error = %e, "skipping unreadable record");
                None
            }
        }
    }

    /// Every readable value; corrupted records are logged and skipped.
    pub async fn all(&self) -> Vec<T> {
        self.store
            .get_all(&self.collection)
            .await
            .into_iter()
            .filter_map(|record| match record.deserialize() {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(collection = %self.collection, id = %record.id, error = %e, "skipping unreadable record");
                    None
                }
            })
            .collect()
    }

    pub async fn delete(&self, id: &str) {
        self.store.delete(&self.collection, id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    /// Backend that fails every call once `failing` is set.
    struct FailableBackend {
        inner: MemoryBackend,
        failing: AtomicBool,
    }

    impl FailableBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                failing: AtomicBool::new(false),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::QuotaExceeded("Injected failure".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KvBackend for FailableBackend {
        async fn put(&self, record: CacheRecord) -> Result<(), StoreError> {
            self.check()?;
            self.inner.put(record).await
        }

        async fn get(&self, collection: &Collection, id: &str) -> Result<Option<CacheRecord>, StoreError> {
            self.check()?;
            self.inner.get(collection, id).await
        }

        async fn get_all(&self, collection: &Collection) -> Result<Vec<CacheRecord>, StoreError> {
            self.check()?;
            self.inner.get_all(collection).await
        }

        async fn delete(&self, collection: &Collection, id: &str) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.delete(collection, id).await
        }

        async fn clear(&self, collection: &Collection) -> Result<usize, StoreError> {
            self.check()?;
            self.inner.clear(collection).await
        }
    }

    fn clock() -> SharedClock {
        Arc::new(ManualClock::new(UnixTimeMs(1_700_000_000_000)))
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("valid-key_123").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("   ").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("key\x01value").is_err());
        assert!(validate_key(&"a".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_collection_prefix_round_trip() {
        for collection in [
            Collection::Reports,
            Collection::Topics,
            Collection::Comments,
            Collection::Places,
            Collection::Drafts,
            Collection::Outbox,
            Collection::Cache,
        ] {
            assert_eq!(Collection::from_prefix(collection.prefix()).unwrap(), collection);
        }
        assert_eq!(
            Collection::from_prefix("events").unwrap(),
            Collection::Custom("events".into())
        );
        assert!(Collection::custom("bad name!").is_err());
    }

    #[test]
    fn test_etag_is_content_hash() {
        let a = CacheRecord::new(Collection::Topics, "1", json!({"likes": 3}), UnixTimeMs(0));
        let b = CacheRecord::new(Collection::Topics, "1", json!({"likes": 3}), UnixTimeMs(99));
        let c = CacheRecord::new(Collection::Topics, "1", json!({"likes": 4}), UnixTimeMs(0));
        assert_eq!(a.etag, b.etag);
        assert_ne!(a.etag, c.etag);
        assert_eq!(a.etag.as_deref().map(str::len), Some(64));
    }

    #[tokio::test]
    async fn test_put_overwrites_wholesale() {
        let store = LocalStore::memory_only(clock());
        store
            .put(Collection::Reports, "r1", json!({"title": "a", "status": "open"}))
            .await;
        store.put(Collection::Reports, "r1", json!({"title": "b"})).await;

        let record = store.get(&Collection::Reports, "r1").await.unwrap();
        assert_eq!(record.payload, json!({"title": "b"}));
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let store = LocalStore::memory_only(clock());
        store.put(Collection::Reports, "1", json!(1)).await;
        store.put(Collection::Topics, "1", json!(2)).await;

        store.clear(&Collection::Reports).await;
        assert!(store.get(&Collection::Reports, "1").await.is_none());
        assert_eq!(store.get_all(&Collection::Topics).await.len(), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_to_memory() {
        let backend = Arc::new(FailableBackend::new());
        let store = LocalStore::new(backend.clone(), clock());

        store.put(Collection::Topics, "t1", json!({"v": 1})).await;
        assert!(!store.is_degraded());

        backend.set_failing(true);
        store.put(Collection::Topics, "t2", json!({"v": 2})).await;
        assert!(store.is_degraded());

        // The failed write is still readable from memory
        let record = store.get(&Collection::Topics, "t2").await.unwrap();
        assert_eq!(record.payload, json!({"v": 2}));

        // Reads from the broken backend come back empty instead of erroring
        assert!(store.get(&Collection::Topics, "t1").await.is_none());
        assert_eq!(store.get_all(&Collection::Topics).await.len(), 1);

        backend.set_failing(false);
        assert_eq!(store.get_all(&Collection::Topics).await.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_while_degraded_hides_backend_row() {
        let backend = Arc::new(FailableBackend::new());
        let store = LocalStore::new(backend.clone(), clock());
        store.put(Collection::Outbox, "op-1", json!({})).await;

        backend.set_failing(true);
        store.delete(&Collection::Outbox, "op-1").await;
        backend.set_failing(false);

        assert!(store.get(&Collection::Outbox, "op-1").await.is_none());
        assert!(store.get_all(&Collection::Outbox).await.is_empty());
    }

    #[tokio::test]
    async fn test_typed_collection_skips_corrupted() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Topic {
            title: String,
        }

        let store = LocalStore::memory_only(clock());
        let topics = store.typed::<Topic>(Collection::Topics);
        topics
            .put("1", &Topic { title: "Parking".into() })
            .await
            .unwrap();
        store.put(Collection::Topics, "2", json!({"unexpected": true})).await;

        let all = topics.all().await;
        assert_eq!(all, vec![Topic { title: "Parking".into() }]);
        assert!(topics.get("2").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_key_is_not_stored() {
        let store = LocalStore::memory_only(clock());
        store.put(Collection::Cache, "../x", json!(null)).await;
        assert!(store.get_all(&Collection::Cache).await.is_empty());
    }
}
