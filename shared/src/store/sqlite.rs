use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;

use super::{CacheRecord, Collection, KvBackend, StoreError};
use crate::clock::UnixTimeMs;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    payload TEXT NOT NULL,
    fetched_at INTEGER NOT NULL,
    etag TEXT,
    PRIMARY KEY (collection, id)
);
"#;

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DiskFull =>
            {
                StoreError::QuotaExceeded(e.to_string())
            }
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

/// SQLite file backend. Queries run on the blocking pool, one connection
/// behind a mutex.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("sqlite task failed: {e}")))?
    }
}

fn row_to_record(
    collection: &Collection,
    id: String,
    payload: &str,
    fetched_at: i64,
    etag: Option<String>,
) -> Result<CacheRecord, StoreError> {
    let payload = serde_json::from_str(payload).map_err(|e| StoreError::Corrupted {
        collection: collection.to_string(),
        id: id.clone(),
        reason: e.to_string(),
    })?;
    Ok(CacheRecord {
        collection: collection.clone(),
        id,
        payload,
        fetched_at: UnixTimeMs(u64::try_from(fetched_at).unwrap_or_default()),
        etag,
    })
}

#[async_trait]
impl KvBackend for SqliteBackend {
    async fn put(&self, record: CacheRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&record.payload)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO records (collection, id, payload, fetched_at, etag)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(collection, id) DO UPDATE SET
                     payload = excluded.payload,
                     fetched_at = excluded.fetched_at,
                     etag = excluded.etag",
                params![
                    record.collection.prefix(),
                    record.id,
                    payload,
                    i64::try_from(record.fetched_at.0).unwrap_or(i64::MAX),
                    record.etag,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, collection: &Collection, id: &str) -> Result<Option<CacheRecord>, StoreError> {
        let collection = collection.clone();
        let id = id.to_string();
        self.run(move |conn| {
            let row: Option<(String, i64, Option<String>)> = conn
                .query_row(
                    "SELECT payload, fetched_at, etag FROM records
                     WHERE collection = ?1 AND id = ?2",
                    params![collection.prefix(), id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            row.map(|(payload, fetched_at, etag)| {
                row_to_record(&collection, id, &payload, fetched_at, etag)
            })
            .transpose()
        })
        .await
    }

    async fn get_all(&self, collection: &Collection) -> Result<Vec<CacheRecord>, StoreError> {
        let collection = collection.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, payload, fetched_at, etag FROM records
                 WHERE collection = ?1
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![collection.prefix()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (id, payload, fetched_at, etag) = row?;
                match row_to_record(&collection, id, &payload, fetched_at, etag) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(error = %e, "skipping corrupted row"),
                }
            }
            Ok(records)
        })
        .await
    }

    async fn delete(&self, collection: &Collection, id: &str) -> Result<bool, StoreError> {
        let collection = collection.clone();
        let id = id.to_string();
        self.run(move |conn| {
            let affected = conn.execute(
                "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                params![collection.prefix(), id],
            )?;
            Ok(affected > 0)
        })
        .await
    }

    async fn clear(&self, collection: &Collection) -> Result<usize, StoreError> {
        let collection = collection.clone();
        self.run(move |conn| {
            let affected = conn.execute(
                "DELETE FROM records WHERE collection = ?1",
                params![collection.prefix()],
            )?;
            Ok(affected)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend
                .put(CacheRecord::new(
                    Collection::Reports,
                    "r-1",
                    json!({"title": "Graffiti"}),
                    UnixTimeMs(1_700_000_000_000),
                ))
                .await
                .unwrap();
        }

        let backend = SqliteBackend::open(&path).unwrap();
        let record = backend.get(&Collection::Reports, "r-1").await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"title": "Graffiti"}));
        assert_eq!(record.fetched_at, UnixTimeMs(1_700_000_000_000));
        assert!(record.etag.is_some());
    }

    #[tokio::test]
    async fn test_upsert_replaces_row() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for version in 1..=3 {
            backend
                .put(CacheRecord::new(
                    Collection::Topics,
                    "t",
                    json!({"version": version}),
                    UnixTimeMs(version),
                ))
                .await
                .unwrap();
        }

        let all = backend.get_all(&Collection::Topics).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload, json!({"version": 3}));
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for id in ["a", "b"] {
            backend
                .put(CacheRecord::new(Collection::Outbox, id, json!({}), UnixTimeMs(0)))
                .await
                .unwrap();
        }
        backend
            .put(CacheRecord::new(Collection::Drafts, "a", json!({}), UnixTimeMs(0)))
            .await
            .unwrap();

        assert!(backend.delete(&Collection::Outbox, "a").await.unwrap());
        assert!(!backend.delete(&Collection::Outbox, "a").await.unwrap());
        assert_eq!(backend.clear(&Collection::Outbox).await.unwrap(), 1);
        assert!(backend.get(&Collection::Drafts, "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupted_rows_are_skipped_in_scan() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .put(CacheRecord::new(Collection::Cache, "good", json!(1), UnixTimeMs(0)))
            .await
            .unwrap();
        backend
            .run(|conn| {
                conn.execute(
                    "INSERT INTO records (collection, id, payload, fetched_at, etag)
                     VALUES ('cache', 'bad', '{not json', 0, NULL)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let all = backend.get_all(&Collection::Cache).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(matches!(
            backend.get(&Collection::Cache, "bad").await,
            Err(StoreError::Corrupted { .. })
        ));
    }
}
