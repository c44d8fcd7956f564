// Storage strategy engine
//
// Owns the backends of one cache instance. Writes are placed by the
// configured strategy; reads are resolved through the artifact index and
// fall back to probing backends in list order.

use super::index::ArtifactIndex;
use super::strategy::{self, Candidate, StorageStrategy, StrategyState};
use super::StorageDriver;
use crate::config::{CacheConfig, ServerConfig, StorageKind};
use crate::error::{CacheServerError, Result};
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Position of a backend in its engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendRef(usize);

impl BackendRef {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Backoff applied to retryable write failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Snapshot of one backend for stats
#[derive(Debug, Clone, Serialize)]
pub struct BackendUsage {
    pub name: String,
    pub kind: StorageKind,
    pub usage_bytes: u64,
    pub quota_bytes: Option<u64>,
    pub split: u8,
}

struct BackendSlot {
    name: String,
    driver: StorageDriver,
    weight: u8,
    quota: Option<u64>,
    usage: AtomicU64,
}

/// Backends and placement policy of one cache instance
pub struct StorageEngine {
    cache: String,
    slots: Vec<BackendSlot>,
    strategy: StorageStrategy,
    state: StrategyState,
    index: ArtifactIndex,
    retry: RetryPolicy,
}

impl StorageEngine {
    /// Create an engine without backends
    pub fn new(cache: String, strategy: StorageStrategy, index: ArtifactIndex) -> Self {
        Self {
            cache,
            slots: Vec::new(),
            strategy,
            state: StrategyState::new(),
            index,
            retry: RetryPolicy::default(),
        }
    }

    /// Build the engine for a configured cache
    pub fn from_config(cache: &CacheConfig, server: &ServerConfig, index: ArtifactIndex) -> Result<Self> {
        let mut engine = Self::new(cache.name.clone(), cache.strategy(server), index);
        for storage in &cache.storages {
            let driver = StorageDriver::from_config(storage, &cache.name)?;
            let quota = storage.quota.or_else(|| driver.implicit_ceiling());
            engine.add_backend(storage.name.clone(), driver, storage.split, quota);
        }
        engine.validate()?;
        Ok(engine)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Append a backend; list order decides ties and in-order placement
    pub fn add_backend(&mut self, name: String, driver: StorageDriver, split: Option<u8>, quota: Option<u64>) {
        self.slots.push(BackendSlot {
            name,
            driver,
            weight: split.unwrap_or(0),
            quota,
            usage: AtomicU64::new(0),
        });
    }

    /// Reject configurations the strategy cannot serve
    pub fn validate(&self) -> Result<()> {
        if self.slots.is_empty() {
            return Err(CacheServerError::ConfigInvalid(format!(
                "Cache '{}' has no storage backends",
                self.cache
            )));
        }
        if self.strategy == StorageStrategy::Split {
            let weights: Vec<Option<u8>> = self.slots.iter().map(|s| Some(s.weight)).collect();
            strategy::validate_split_weights(&weights)?;
        }
        Ok(())
    }

    pub fn cache(&self) -> &str {
        &self.cache
    }

    pub fn strategy(&self) -> StorageStrategy {
        self.strategy
    }

    pub fn index(&self) -> &ArtifactIndex {
        &self.index
    }

    pub fn backend_count(&self) -> usize {
        self.slots.len()
    }

    pub fn backend(&self, name: &str) -> Option<BackendRef> {
        self.slots.iter().position(|s| s.name == name).map(BackendRef)
    }

    pub fn backend_name(&self, backend: BackendRef) -> &str {
        &self.slots[backend.0].name
    }

    pub fn usage_bytes(&self, backend: BackendRef) -> u64 {
        self.slots[backend.0].usage.load(Ordering::SeqCst)
    }

    /// Per backend usage snapshot
    pub fn usage(&self) -> Vec<BackendUsage> {
        self.slots
            .iter()
            .map(|slot| BackendUsage {
                name: slot.name.clone(),
                kind: slot.driver.kind(),
                usage_bytes: slot.usage.load(Ordering::SeqCst),
                quota_bytes: slot.quota,
                split: slot.weight,
            })
            .collect()
    }

    /// Pick the backend for a new write of `size` bytes
    ///
    /// # Arguments
    ///
    /// * `size` - Bytes about to be written, checked against quotas
    /// * `excluded` - Backends that already failed during this request
    pub fn choose_backend_for_write(&self, size: u64, excluded: &[BackendRef]) -> Result<BackendRef> {
        let candidates: Vec<Candidate> = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| Candidate {
                usage: slot.usage.load(Ordering::SeqCst),
                quota: slot.quota,
                weight: slot.weight,
                excluded: excluded.contains(&BackendRef(i)),
            })
            .collect();

        strategy::choose(self.strategy, &self.state, &candidates, size)
            .map(BackendRef)
            .ok_or_else(|| {
                CacheServerError::BackendUnavailable(format!(
                    "No backend of cache '{}' can take {} bytes",
                    self.cache, size
                ))
            })
    }

    /// Write a new key wherever the strategy places it
    ///
    /// In-order and least-used move on to the next eligible backend when the
    /// chosen one stays unavailable after retries.
    pub async fn write_new(&self, key: &str, bytes: Bytes) -> Result<BackendRef> {
        let size = bytes.len() as u64;
        let mut excluded = Vec::new();

        loop {
            let backend = self.choose_backend_for_write(size, &excluded)?;
            match self.write_to(backend, key, bytes.clone()).await {
                Ok(()) => return Ok(backend),
                Err(e) if e.is_retryable() && self.strategy.falls_back() => {
                    warn!(
                        "Backend {} of cache {} unavailable, falling back: {}",
                        self.backend_name(backend),
                        self.cache,
                        e
                    );
                    excluded.push(backend);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write `key` to a specific backend, retrying transient failures
    ///
    /// Overwriting a key replaces its share of the usage counter.
    pub async fn write_to(&self, backend: BackendRef, key: &str, bytes: Bytes) -> Result<()> {
        let slot = &self.slots[backend.0];
        let size = bytes.len() as u64;
        let attempts = self.retry.attempts.max(1);

        let replaced = match slot.driver.size(key).await {
            Ok(previous) => previous.unwrap_or(0),
            Err(e) => {
                debug!("Could not size {} on {} before writing: {}", key, slot.name, e);
                0
            }
        };

        let mut attempt = 0;
        loop {
            match slot.driver.write(key, bytes.clone()).await {
                Ok(()) => {
                    let _ = slot.usage.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |u| {
                        Some(u.saturating_sub(replaced) + size)
                    });
                    debug!("Stored {} ({} bytes) on {}", key, size, slot.name);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.retry.base_delay * 2u32.pow(attempt);
                    debug!(
                        "Write of {} to {} failed ({}), retrying in {:?}",
                        key, slot.name, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn read_from(&self, backend: BackendRef, key: &str) -> Result<Bytes> {
        self.slots[backend.0].driver.read(key).await
    }

    pub async fn exists_on(&self, backend: BackendRef, key: &str) -> Result<bool> {
        self.slots[backend.0].driver.exists(key).await
    }

    /// Delete `key` from a backend, releasing `size` bytes of usage
    pub async fn delete_from(&self, backend: BackendRef, key: &str, size: u64) -> Result<()> {
        let slot = &self.slots[backend.0];
        slot.driver.delete(key).await?;
        let _ = slot
            .usage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |u| Some(u.saturating_sub(size)));
        Ok(())
    }

    async fn indexed_backend(&self, key: &str) -> Result<Option<BackendRef>> {
        let name = self.index.backend_for_key(&self.cache, key).await?;
        Ok(name.and_then(|name| {
            let backend = self.backend(&name);
            if backend.is_none() {
                warn!("Index names unknown backend {} for {}", name, key);
            }
            backend
        }))
    }

    /// Find the backend holding `key`
    ///
    /// Index hits are trusted; misses search every backend in list order and
    /// repair the index when the key turns up.
    pub async fn locate_backend_for_read(&self, key: &str) -> Result<BackendRef> {
        if let Some(backend) = self.indexed_backend(key).await? {
            return Ok(backend);
        }
        self.search(key, None).await
    }

    /// Read `key` from wherever it lives
    pub async fn read(&self, key: &str) -> Result<(BackendRef, Bytes)> {
        let mut skip = None;
        if let Some(backend) = self.indexed_backend(key).await? {
            match self.read_from(backend, key).await {
                Ok(bytes) => return Ok((backend, bytes)),
                Err(CacheServerError::NotFound(_)) => {
                    debug!("Index entry for {} on {} is stale", key, self.backend_name(backend));
                    skip = Some(backend);
                }
                Err(e) => return Err(e),
            }
        }

        let backend = self.search(key, skip).await?;
        let bytes = self.read_from(backend, key).await?;
        Ok((backend, bytes))
    }

    async fn search(&self, key: &str, skip: Option<BackendRef>) -> Result<BackendRef> {
        let mut failure = None;

        for (i, slot) in self.slots.iter().enumerate() {
            let backend = BackendRef(i);
            if Some(backend) == skip {
                continue;
            }
            match slot.driver.exists(key).await {
                Ok(true) => {
                    let repaired = self.index.repair_backend(&self.cache, key, &slot.name).await?;
                    if repaired > 0 {
                        info!("Repaired index entry for {} to {}", key, slot.name);
                    }
                    return Ok(backend);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Lookup of {} on {} failed: {}", key, slot.name, e);
                    failure = Some(e);
                }
            }
        }

        Err(failure.unwrap_or_else(|| CacheServerError::NotFound(key.to_string())))
    }

    /// Resync usage counters from the media
    pub async fn reconcile_usage(&self) {
        for slot in &self.slots {
            match slot.driver.used_bytes().await {
                Ok(used) => {
                    let previous = slot.usage.swap(used, Ordering::SeqCst);
                    if previous != used {
                        debug!(
                            "Reconciled usage of {} from {} to {} bytes",
                            slot.name, previous, used
                        );
                    }
                }
                Err(e) => warn!("Could not measure usage of {}: {}", slot.name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::index::ArtifactRecord;
    use crate::storage::LocalDriver;
    use tempfile::TempDir;

    fn engine(strategy: StorageStrategy, dirs: &[&TempDir]) -> StorageEngine {
        let mut engine = StorageEngine::new(
            "main".to_string(),
            strategy,
            ArtifactIndex::open_in_memory().unwrap(),
        )
        .with_retry(RetryPolicy {
            attempts: 2,
            base_delay: Duration::from_millis(1),
        });
        for (i, dir) in dirs.iter().enumerate() {
            engine.add_backend(
                format!("b{}", i),
                StorageDriver::Local(LocalDriver::new(dir.path())),
                None,
                None,
            );
        }
        engine
    }

    fn broken_driver(dir: &TempDir) -> StorageDriver {
        // A regular file where a directory is expected
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        StorageDriver::Local(LocalDriver::new(file.join("root")))
    }

    #[tokio::test]
    async fn test_round_robin_placement() {
        let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap()];
        let engine = engine(StorageStrategy::RoundRobin, &[&dirs[0], &dirs[1], &dirs[2]]);

        for i in 0..6 {
            let backend = engine
                .write_new(&format!("nar/key{:04}.nar", i), Bytes::from_static(b"data"))
                .await
                .unwrap();
            assert_eq!(backend.index(), i % 3);
        }
    }

    #[tokio::test]
    async fn test_least_used_usage_grows_after_write() {
        let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap()];
        let engine = engine(StorageStrategy::LeastUsed, &[&dirs[0], &dirs[1]]);

        let first = engine.write_new("nar/aaaa.nar", Bytes::from(vec![0u8; 100])).await.unwrap();
        assert_eq!(first.index(), 0);
        assert_eq!(engine.usage_bytes(first), 100);

        let second = engine.write_new("nar/bbbb.nar", Bytes::from(vec![0u8; 10])).await.unwrap();
        assert_eq!(second.index(), 1);

        let third = engine.write_new("nar/cccc.nar", Bytes::from(vec![0u8; 10])).await.unwrap();
        assert_eq!(third.index(), 1);
        assert_eq!(engine.usage_bytes(third), 20);
    }

    #[tokio::test]
    async fn test_in_order_falls_back_when_unavailable() {
        let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap()];
        let mut engine = engine(StorageStrategy::InOrder, &[&dirs[1]]);
        engine.slots.insert(
            0,
            BackendSlot {
                name: "broken".to_string(),
                driver: broken_driver(&dirs[0]),
                weight: 0,
                quota: None,
                usage: AtomicU64::new(0),
            },
        );

        let backend = engine.write_new("nar/dddd.nar", Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(engine.backend_name(backend), "b0");
    }

    #[tokio::test]
    async fn test_round_robin_does_not_fall_back() {
        let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap()];
        let mut engine = engine(StorageStrategy::RoundRobin, &[]);
        engine.add_backend("broken".to_string(), broken_driver(&dirs[0]), None, None);
        engine.add_backend(
            "ok".to_string(),
            StorageDriver::Local(LocalDriver::new(dirs[1].path())),
            None,
            None,
        );

        let result = engine.write_new("nar/eeee.nar", Bytes::from_static(b"data")).await;
        assert!(matches!(result, Err(CacheServerError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_read_searches_and_repairs_stale_index() {
        let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap()];
        let engine = engine(StorageStrategy::RoundRobin, &[&dirs[0], &dirs[1]]);
        let key = "ffff.narinfo";

        // Written to b1 while the index claims b0
        engine.write_to(BackendRef(1), key, Bytes::from_static(b"doc")).await.unwrap();
        engine
            .index()
            .complete(ArtifactRecord {
                cache: "main".to_string(),
                store_hash: "ffff".to_string(),
                narinfo_key: key.to_string(),
                nar_key: "nar/ffff.nar".to_string(),
                backend: "b0".to_string(),
                nar_bytes: 0,
                narinfo_bytes: 3,
                created_at: 0,
            })
            .await
            .unwrap();

        let (backend, bytes) = engine.read(key).await.unwrap();
        assert_eq!(backend.index(), 1);
        assert_eq!(bytes, Bytes::from_static(b"doc"));
        assert_eq!(
            engine.index().backend_for_key("main", key).await.unwrap(),
            Some("b1".to_string())
        );
        assert_eq!(engine.locate_backend_for_read(key).await.unwrap().index(), 1);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let dirs = [TempDir::new().unwrap()];
        let engine = engine(StorageStrategy::RoundRobin, &[&dirs[0]]);
        assert!(matches!(
            engine.locate_backend_for_read("gggg.narinfo").await,
            Err(CacheServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_and_delete_track_usage() {
        let dirs = [TempDir::new().unwrap()];
        let engine = engine(StorageStrategy::RoundRobin, &[&dirs[0]]);
        let backend = engine.write_new("nar/hhhh.nar", Bytes::from(vec![1u8; 64])).await.unwrap();

        engine.slots[0].usage.store(0, Ordering::SeqCst);
        engine.reconcile_usage().await;
        assert_eq!(engine.usage_bytes(backend), 64);

        engine.delete_from(backend, "nar/hhhh.nar", 64).await.unwrap();
        assert_eq!(engine.usage_bytes(backend), 0);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_double_count_usage() {
        let dirs = [TempDir::new().unwrap()];
        let engine = engine(StorageStrategy::RoundRobin, &[&dirs[0]]);
        let backend = BackendRef(0);

        engine.write_to(backend, "iiii.narinfo", Bytes::from(vec![1u8; 40])).await.unwrap();
        engine.write_to(backend, "iiii.narinfo", Bytes::from(vec![1u8; 40])).await.unwrap();
        assert_eq!(engine.usage_bytes(backend), 40);

        engine.write_to(backend, "iiii.narinfo", Bytes::from(vec![1u8; 25])).await.unwrap();
        assert_eq!(engine.usage_bytes(backend), 25);

        engine.reconcile_usage().await;
        assert_eq!(engine.usage_bytes(backend), 25);
    }

    #[test]
    fn test_split_engine_requires_weights() {
        let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap()];
        let mut engine = engine(StorageStrategy::Split, &[]);
        engine.add_backend(
            "a".to_string(),
            StorageDriver::Local(LocalDriver::new(dirs[0].path())),
            Some(40),
            None,
        );
        engine.add_backend(
            "b".to_string(),
            StorageDriver::Local(LocalDriver::new(dirs[1].path())),
            Some(50),
            None,
        );
        assert!(matches!(engine.validate(), Err(CacheServerError::ConfigInvalid(_))));
    }
}
