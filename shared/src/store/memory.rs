use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{CacheRecord, Collection, KvBackend, StoreError};

/// Volatile backend; also the facade's fallback when the durable one fails.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    collections: RwLock<HashMap<Collection, BTreeMap<String, CacheRecord>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: CacheRecord) {
        let mut collections = self.collections.write().await;
        collections
            .entry(record.collection.clone())
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub async fn lookup(&self, collection: &Collection, id: &str) -> Option<CacheRecord> {
        let collections = self.collections.read().await;
        collections.get(collection).and_then(|c| c.get(id)).cloned()
    }

    pub async fn records(&self, collection: &Collection) -> Vec<CacheRecord> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn remove(&self, collection: &Collection, id: &str) -> bool {
        let mut collections = self.collections.write().await;
        collections
            .get_mut(collection)
            .and_then(|c| c.remove(id))
            .is_some()
    }

    pub async fn remove_all(&self, collection: &Collection) -> usize {
        let mut collections = self.collections.write().await;
        collections.remove(collection).map_or(0, |c| c.len())
    }
}

// Never fails; the `Result`s only satisfy the trait.
#[async_trait]
impl KvBackend for MemoryBackend {
    async fn put(&self, record: CacheRecord) -> Result<(), StoreError> {
        self.insert(record).await;
        Ok(())
    }

    async fn get(&self, collection: &Collection, id: &str) -> Result<Option<CacheRecord>, StoreError> {
        Ok(self.lookup(collection, id).await)
    }

    async fn get_all(&self, collection: &Collection) -> Result<Vec<CacheRecord>, StoreError> {
        Ok(self.records(collection).await)
    }

    async fn delete(&self, collection: &Collection, id: &str) -> Result<bool, StoreError> {
        Ok(self.remove(collection, id).await)
    }

    async fn clear(&self, collection: &Collection) -> Result<usize, StoreError> {
        Ok(self.remove_all(collection).await)
    }
}
