// Durable artifact index
//
// SQLite tables recording which backend holds each artifact, uploads that
// are staged but not yet visible, and generated cache tokens. The index is
// the read path's first stop and the retention sweeper's work list.

use crate::error::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// A committed artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub cache: String,
    pub store_hash: String,
    pub narinfo_key: String,
    pub nar_key: String,
    /// Name of the backend holding both documents
    pub backend: String,
    pub nar_bytes: u64,
    pub narinfo_bytes: u64,
    /// Unix seconds
    pub created_at: i64,
}

/// A payload written ahead of its narinfo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub cache: String,
    pub nar_key: String,
    pub backend: String,
    pub bytes: u64,
    pub created_at: i64,
}

/// Handle to the index database, cheap to clone
#[derive(Clone)]
pub struct ArtifactIndex {
    conn: Arc<Mutex<Connection>>,
}

impl ArtifactIndex {
    /// Open (or create) the index database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - SQLite file; parent directories are created
    ///
    /// # Returns
    ///
    /// * `Ok(ArtifactIndex)` with the schema in place
    /// * `Err(CacheServerError)` if the file cannot be opened
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!("Opening artifact index at {:?}", path);
        Self::with_connection(Connection::open(path)?)
    }

    /// Open a private in-memory index
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS artifacts (
                cache TEXT NOT NULL,
                store_hash TEXT NOT NULL,
                narinfo_key TEXT NOT NULL,
                nar_key TEXT NOT NULL,
                backend TEXT NOT NULL,
                nar_bytes INTEGER NOT NULL,
                narinfo_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (cache, store_hash)
             );
             CREATE INDEX IF NOT EXISTS idx_artifacts_nar ON artifacts(cache, nar_key);
             CREATE INDEX IF NOT EXISTS idx_artifacts_created ON artifacts(cache, created_at);
             CREATE TABLE IF NOT EXISTS pending (
                cache TEXT NOT NULL,
                nar_key TEXT NOT NULL,
                backend TEXT NOT NULL,
                bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (cache, nar_key)
             );
             CREATE TABLE IF NOT EXISTS cache_tokens (
                cache TEXT PRIMARY KEY,
                token TEXT NOT NULL
             );",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await??;
        Ok(result)
    }

    /// Record a staged payload
    pub async fn insert_pending(&self, record: PendingRecord) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO pending (cache, nar_key, backend, bytes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.cache,
                    record.nar_key,
                    record.backend,
                    record.bytes as i64,
                    record.created_at
                ],
            )
            .map(|_| ())
        })
        .await
    }

    /// Look up a staged payload
    pub async fn pending(&self, cache: &str, nar_key: &str) -> Result<Option<PendingRecord>> {
        let (cache, nar_key) = (cache.to_string(), nar_key.to_string());
        self.call(move |conn| {
            conn.query_row(
                "SELECT cache, nar_key, backend, bytes, created_at FROM pending
                 WHERE cache = ?1 AND nar_key = ?2",
                params![cache, nar_key],
                pending_from_row,
            )
            .optional()
        })
        .await
    }

    /// Forget a staged payload
    ///
    /// # Returns
    ///
    /// * `Ok(true)` if a row was removed
    pub async fn remove_pending(&self, cache: &str, nar_key: &str) -> Result<bool> {
        let (cache, nar_key) = (cache.to_string(), nar_key.to_string());
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM pending WHERE cache = ?1 AND nar_key = ?2",
                params![cache, nar_key],
            )
            .map(|n| n > 0)
        })
        .await
    }

    /// Staged payloads created before `before`
    pub async fn stale_pending(&self, cache: &str, before: i64) -> Result<Vec<PendingRecord>> {
        let cache = cache.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT cache, nar_key, backend, bytes, created_at FROM pending
                 WHERE cache = ?1 AND created_at < ?2 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![cache, before], pending_from_row)?;
            let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    /// Make an artifact visible, consuming its pending row in the same
    /// transaction
    pub async fn complete(&self, record: ArtifactRecord) -> Result<()> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO artifacts
                 (cache, store_hash, narinfo_key, nar_key, backend, nar_bytes, narinfo_bytes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.cache,
                    record.store_hash,
                    record.narinfo_key,
                    record.nar_key,
                    record.backend,
                    record.nar_bytes as i64,
                    record.narinfo_bytes as i64,
                    record.created_at
                ],
            )?;
            tx.execute(
                "DELETE FROM pending WHERE cache = ?1 AND nar_key = ?2",
                params![record.cache, record.nar_key],
            )?;
            tx.commit()
        })
        .await
    }

    /// Committed artifact by store hash
    pub async fn artifact(&self, cache: &str, store_hash: &str) -> Result<Option<ArtifactRecord>> {
        let (cache, store_hash) = (cache.to_string(), store_hash.to_string());
        self.call(move |conn| {
            conn.query_row(
                "SELECT cache, store_hash, narinfo_key, nar_key, backend, nar_bytes, narinfo_bytes, created_at
                 FROM artifacts WHERE cache = ?1 AND store_hash = ?2",
                params![cache, store_hash],
                artifact_from_row,
            )
            .optional()
        })
        .await
    }

    /// Committed artifact owning a payload key
    pub async fn artifact_by_nar(&self, cache: &str, nar_key: &str) -> Result<Option<ArtifactRecord>> {
        let (cache, nar_key) = (cache.to_string(), nar_key.to_string());
        self.call(move |conn| {
            conn.query_row(
                "SELECT cache, store_hash, narinfo_key, nar_key, backend, nar_bytes, narinfo_bytes, created_at
                 FROM artifacts WHERE cache = ?1 AND nar_key = ?2 LIMIT 1",
                params![cache, nar_key],
                artifact_from_row,
            )
            .optional()
        })
        .await
    }

    /// Number of committed artifacts sharing a payload key
    pub async fn nar_references(&self, cache: &str, nar_key: &str) -> Result<u64> {
        let (cache, nar_key) = (cache.to_string(), nar_key.to_string());
        self.call(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM artifacts WHERE cache = ?1 AND nar_key = ?2",
                params![cache, nar_key],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
        })
        .await
    }

    /// Backend recorded for a storage key of a committed artifact
    pub async fn backend_for_key(&self, cache: &str, key: &str) -> Result<Option<String>> {
        let (cache, key) = (cache.to_string(), key.to_string());
        self.call(move |conn| {
            conn.query_row(
                "SELECT backend FROM artifacts
                 WHERE cache = ?1 AND (narinfo_key = ?2 OR nar_key = ?2) LIMIT 1",
                params![cache, key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    /// Point rows for `key` at `backend` after a search found it there
    ///
    /// # Returns
    ///
    /// * `Ok(n)` with the number of rows updated; 0 when no row knows the key
    pub async fn repair_backend(&self, cache: &str, key: &str, backend: &str) -> Result<usize> {
        let (cache, key, backend) = (cache.to_string(), key.to_string(), backend.to_string());
        self.call(move |conn| {
            conn.execute(
                "UPDATE artifacts SET backend = ?3
                 WHERE cache = ?1 AND (narinfo_key = ?2 OR nar_key = ?2)",
                params![cache, key, backend],
            )
        })
        .await
    }

    /// Drop a committed artifact row
    pub async fn remove_artifact(&self, cache: &str, store_hash: &str) -> Result<bool> {
        let (cache, store_hash) = (cache.to_string(), store_hash.to_string());
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM artifacts WHERE cache = ?1 AND store_hash = ?2",
                params![cache, store_hash],
            )
            .map(|n| n > 0)
        })
        .await
    }

    /// Artifacts created before `before`, oldest first
    pub async fn created_before(&self, cache: &str, before: i64) -> Result<Vec<ArtifactRecord>> {
        let cache = cache.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT cache, store_hash, narinfo_key, nar_key, backend, nar_bytes, narinfo_bytes, created_at
                 FROM artifacts WHERE cache = ?1 AND created_at < ?2 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![cache, before], artifact_from_row)?;
            let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    /// Subset of `hashes` committed in `cache`
    pub async fn present(&self, cache: &str, hashes: Vec<String>) -> Result<HashSet<String>> {
        let cache = cache.to_string();
        self.call(move |conn| {
            let mut stmt =
                conn.prepare("SELECT 1 FROM artifacts WHERE cache = ?1 AND store_hash = ?2")?;
            let mut found = HashSet::new();
            for hash in hashes {
                if stmt.exists(params![cache, hash])? {
                    found.insert(hash);
                }
            }
            Ok(found)
        })
        .await
    }

    /// Number of committed artifacts in `cache`
    pub async fn count(&self, cache: &str) -> Result<u64> {
        let cache = cache.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM artifacts WHERE cache = ?1",
                params![cache],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
        })
        .await
    }

    /// Stored token of `cache`, inserting `generated` when none exists
    pub async fn token_or_insert(&self, cache: &str, generated: String) -> Result<String> {
        let cache = cache.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO cache_tokens (cache, token) VALUES (?1, ?2)",
                params![cache, generated],
            )?;
            conn.query_row(
                "SELECT token FROM cache_tokens WHERE cache = ?1",
                params![cache],
                |row| row.get(0),
            )
        })
        .await
    }
}

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<ArtifactRecord> {
    Ok(ArtifactRecord {
        cache: row.get(0)?,
        store_hash: row.get(1)?,
        narinfo_key: row.get(2)?,
        nar_key: row.get(3)?,
        backend: row.get(4)?,
        nar_bytes: row.get::<_, i64>(5)? as u64,
        narinfo_bytes: row.get::<_, i64>(6)? as u64,
        created_at: row.get(7)?,
    })
}

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingRecord> {
    Ok(PendingRecord {
        cache: row.get(0)?,
        nar_key: row.get(1)?,
        backend: row.get(2)?,
        bytes: row.get::<_, i64>(3)? as u64,
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: &str, created_at: i64) -> ArtifactRecord {
        ArtifactRecord {
            cache: "main".to_string(),
            store_hash: hash.to_string(),
            narinfo_key: format!("{}.narinfo", hash),
            nar_key: format!("nar/{}.nar", hash),
            backend: "a".to_string(),
            nar_bytes: 10,
            narinfo_bytes: 5,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_complete_consumes_pending() {
        let index = ArtifactIndex::open_in_memory().unwrap();
        index
            .insert_pending(PendingRecord {
                cache: "main".to_string(),
                nar_key: "nar/h1.nar".to_string(),
                backend: "a".to_string(),
                bytes: 10,
                created_at: 100,
            })
            .await
            .unwrap();
        assert!(index.pending("main", "nar/h1.nar").await.unwrap().is_some());

        index.complete(record("h1", 100)).await.unwrap();
        assert!(index.pending("main", "nar/h1.nar").await.unwrap().is_none());
        assert_eq!(
            index.backend_for_key("main", "h1.narinfo").await.unwrap(),
            Some("a".to_string())
        );
        assert_eq!(
            index.backend_for_key("main", "nar/h1.nar").await.unwrap(),
            Some("a".to_string())
        );
        assert_eq!(index.backend_for_key("other", "h1.narinfo").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_created_before_and_repair() {
        let index = ArtifactIndex::open_in_memory().unwrap();
        index.complete(record("old", 10)).await.unwrap();
        index.complete(record("new", 1000)).await.unwrap();

        let expired = index.created_before("main", 500).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].store_hash, "old");

        assert_eq!(index.repair_backend("main", "old.narinfo", "b").await.unwrap(), 1);
        assert_eq!(index.artifact("main", "old").await.unwrap().unwrap().backend, "b");
        assert_eq!(index.repair_backend("main", "unknown.narinfo", "b").await.unwrap(), 0);

        assert!(index.remove_artifact("main", "old").await.unwrap());
        assert!(!index.remove_artifact("main", "old").await.unwrap());
        assert_eq!(index.count("main").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nar_references_count_sharing_artifacts() {
        let index = ArtifactIndex::open_in_memory().unwrap();
        let mut other = record("h2", 1);
        other.nar_key = "nar/h1.nar".to_string();
        index.complete(record("h1", 1)).await.unwrap();
        index.complete(other).await.unwrap();

        assert_eq!(index.nar_references("main", "nar/h1.nar").await.unwrap(), 2);
        index.remove_artifact("main", "h1").await.unwrap();
        assert_eq!(index.nar_references("main", "nar/h1.nar").await.unwrap(), 1);
        assert_eq!(index.nar_references("main", "nar/none.nar").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_present_and_tokens() {
        let index = ArtifactIndex::open_in_memory().unwrap();
        index.complete(record("h1", 1)).await.unwrap();

        let found = index
            .present("main", vec!["h1".to_string(), "h2".to_string()])
            .await
            .unwrap();
        assert!(found.contains("h1"));
        assert!(!found.contains("h2"));

        let first = index.token_or_insert("main", "t1".to_string()).await.unwrap();
        let second = index.token_or_insert("main", "t2".to_string()).await.unwrap();
        assert_eq!(first, "t1");
        assert_eq!(second, "t1");
    }
}
