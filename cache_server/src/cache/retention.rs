// Retention sweeper
//
// One background loop per cache instance. Each tick removes artifacts older
// than the retention window, drops staged payloads whose narinfo never
// arrived, forgets abandoned multipart sessions and resyncs the backend
// usage counters.

use super::store::ArtifactStore;
use crate::error::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Seconds a staged payload may wait for its narinfo
pub const PENDING_GRACE: i64 = 3600;

/// Default tick interval
pub const GARBAGE_COLLECTION_INTERVAL: Duration = Duration::from_secs(3600);

const SECONDS_PER_DAY: i64 = 86_400;

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deleted: usize,
    pub failed: usize,
    pub pending_removed: usize,
    pub uploads_expired: usize,
}

/// Expires artifacts of one cache instance
pub struct RetentionSweeper {
    store: Arc<ArtifactStore>,
    retention_days: u32,
}

impl RetentionSweeper {
    pub fn new(store: Arc<ArtifactStore>, retention_days: u32) -> Self {
        Self {
            store,
            retention_days,
        }
    }

    /// Whether an artifact created at `created_at` has expired at `now`
    pub fn is_expired(&self, created_at: i64, now: i64) -> bool {
        self.retention_days > 0
            && created_at + i64::from(self.retention_days) * SECONDS_PER_DAY < now
    }

    /// Run one sweep at unix time `now`
    ///
    /// A failing artifact is logged and left for the next tick; it never
    /// stops the rest of the sweep.
    pub async fn sweep_once(&self, now: i64) -> Result<SweepReport> {
        let cache = self.store.cache();
        let mut report = SweepReport::default();

        if self.retention_days > 0 {
            let cutoff = now - i64::from(self.retention_days) * SECONDS_PER_DAY;
            let expired = self.store.index().created_before(cache, cutoff).await?;
            for record in expired {
                match self.store.delete_record(&record).await {
                    Ok(()) => report.deleted += 1,
                    Err(e) => {
                        warn!(
                            "Could not expire {} from cache {}: {}",
                            record.store_hash, cache, e
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        let stale = self
            .store
            .index()
            .stale_pending(cache, now - PENDING_GRACE)
            .await?;
        for pending in stale {
            match self.store.discard_pending(&pending).await {
                Ok(()) => report.pending_removed += 1,
                Err(e) => {
                    warn!(
                        "Could not discard staged payload {} of cache {}: {}",
                        pending.nar_key, cache, e
                    );
                    report.failed += 1;
                }
            }
        }

        report.uploads_expired = self.store.uploads().expire(now - PENDING_GRACE);

        self.store.engine().reconcile_usage().await;

        if report.deleted > 0 || report.pending_removed > 0 {
            info!(
                "Sweep of cache {} removed {} artifacts and {} staged payloads",
                cache, report.deleted, report.pending_removed
            );
        } else {
            debug!("Sweep of cache {} found nothing to remove", cache);
        }
        Ok(report)
    }

    /// Run the sweeper every `interval` until the handle is aborted
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = chrono::Utc::now().timestamp();
                if let Err(e) = self.sweep_once(now).await {
                    warn!("Sweep of cache {} failed: {}", self.store.cache(), e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NarinfoSigner;
    use crate::storage::{
        ArtifactIndex, LocalDriver, PendingRecord, StorageDriver, StorageEngine, StorageStrategy,
    };
    use crate::types::{nix32, sha256_nix32, NarInfo, StoreHash};
    use bytes::Bytes;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Arc<ArtifactStore> {
        let mut engine = StorageEngine::new(
            "main".to_string(),
            StorageStrategy::RoundRobin,
            ArtifactIndex::open_in_memory().unwrap(),
        );
        engine.add_backend(
            "local".to_string(),
            StorageDriver::Local(LocalDriver::new(dir.path())),
            None,
            None,
        );
        Arc::new(ArtifactStore::new(
            engine,
            NarinfoSigner::generate("main.localhost-1".to_string()),
        ))
    }

    async fn upload(store: &ArtifactStore, seed: &str) -> StoreHash {
        let payload = format!("payload of {}", seed).into_bytes();
        let hash = StoreHash::parse(&nix32::encode(&Sha256::digest(seed.as_bytes())[..20])).unwrap();
        let info = NarInfo::new(
            format!("/nix/store/{}-{}", hash, seed),
            format!("nar/{}.nar", nix32::encode(&Sha256::digest(&payload))),
            sha256_nix32(&payload),
            payload.len() as u64,
        );
        store.put(&hash, info, Bytes::from(payload)).await.unwrap();
        hash
    }

    #[tokio::test]
    async fn test_expired_artifacts_are_removed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let hash = upload(&store, "old").await;
        let sweeper = RetentionSweeper::new(store.clone(), 7);

        let now = chrono::Utc::now().timestamp();
        let report = sweeper.sweep_once(now + 6 * SECONDS_PER_DAY).await.unwrap();
        assert_eq!(report.deleted, 0);
        assert!(store.exists(&hash).await.unwrap());

        let report = sweeper.sweep_once(now + 8 * SECONDS_PER_DAY).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!store.exists(&hash).await.unwrap());
        assert_eq!(store.engine().usage()[0].usage_bytes, 0);
    }

    #[tokio::test]
    async fn test_zero_retention_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let hash = upload(&store, "forever").await;
        let sweeper = RetentionSweeper::new(store.clone(), 0);

        let far_future = chrono::Utc::now().timestamp() + 10_000 * SECONDS_PER_DAY;
        let report = sweeper.sweep_once(far_future).await.unwrap();
        assert_eq!(report.deleted, 0);
        assert!(store.exists(&hash).await.unwrap());
        assert!(!sweeper.is_expired(0, far_future));
    }

    #[tokio::test]
    async fn test_missing_files_do_not_stop_the_sweep() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let first = upload(&store, "first").await;
        let second = upload(&store, "second").await;

        // Payload removed behind the index's back
        let record = store.index().artifact("main", first.as_str()).await.unwrap().unwrap();
        let backend = store.engine().backend("local").unwrap();
        store.engine().delete_from(backend, &record.nar_key, 0).await.unwrap();

        let sweeper = RetentionSweeper::new(store.clone(), 1);
        let report = sweeper
            .sweep_once(chrono::Utc::now().timestamp() + 2 * SECONDS_PER_DAY)
            .await
            .unwrap();
        assert_eq!(report.deleted, 2);
        assert!(!store.exists(&first).await.unwrap());
        assert!(!store.exists(&second).await.unwrap());
    }

    #[tokio::test]
    async fn test_abandoned_multipart_sessions_expire() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.uploads().create(crate::types::Compression::Xz);
        let sweeper = RetentionSweeper::new(store.clone(), 7);

        let now = chrono::Utc::now().timestamp();
        assert_eq!(sweeper.sweep_once(now).await.unwrap().uploads_expired, 0);
        assert_eq!(store.uploads().len(), 1);

        let report = sweeper.sweep_once(now + PENDING_GRACE + 1).await.unwrap();
        assert_eq!(report.uploads_expired, 1);
        assert!(store.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_stale_staged_payloads_are_discarded() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let backend = store.engine().backend("local").unwrap();
        store
            .engine()
            .write_to(backend, "nar/staged.nar", Bytes::from_static(b"half"))
            .await
            .unwrap();
        store
            .index()
            .insert_pending(PendingRecord {
                cache: "main".to_string(),
                nar_key: "nar/staged.nar".to_string(),
                backend: "local".to_string(),
                bytes: 4,
                created_at: 1_000,
            })
            .await
            .unwrap();

        let sweeper = RetentionSweeper::new(store.clone(), 7);
        let report = sweeper.sweep_once(1_000 + PENDING_GRACE - 1).await.unwrap();
        assert_eq!(report.pending_removed, 0);

        let report = sweeper.sweep_once(1_000 + PENDING_GRACE + 1).await.unwrap();
        assert_eq!(report.pending_removed, 1);
        assert!(!store.engine().exists_on(backend, "nar/staged.nar").await.unwrap());
        assert!(store.index().pending("main", "nar/staged.nar").await.unwrap().is_none());
    }
}
