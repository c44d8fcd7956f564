// Cache module for the cache server
//
// A cache instance bundles the configuration of one named cache with its
// artifact store and request metrics. The registry maps instance names to
// instances for the server wide API and the deploy relay.

use crate::config::{CacheConfig, ServerConfig};
use crate::crypto::{default_key_name, NarinfoSigner};
use crate::error::{CacheServerError, Result};
use crate::storage::{ArtifactIndex, StorageEngine};
use crate::types::{CacheAccess, DEFAULT_CACHE_PRIORITY};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub mod metrics;
pub mod multipart;
pub mod retention;
pub mod store;

pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use multipart::{AssembledUpload, CompletedPart, MultipartUploads, NarInfoCreate, UploadHandle};
pub use retention::{RetentionSweeper, SweepReport, PENDING_GRACE};
pub use store::{ArtifactStore, PutOutcome};

/// One named binary cache
pub struct CacheInstance {
    pub name: String,
    /// Shared secret required for uploads, and reads of private caches
    pub token: String,
    pub retention_days: u32,
    pub port: u16,
    pub access: CacheAccess,
    pub priority: u32,
    pub store: Arc<ArtifactStore>,
    pub metrics: CacheMetrics,
}

impl CacheInstance {
    /// Build an instance from its configuration
    ///
    /// The signing key comes from the cache, then from the server block, and
    /// is otherwise generated once and kept under `cache-dir/keys`.
    pub async fn from_config(cache: &CacheConfig, server: &ServerConfig, index: ArtifactIndex) -> Result<Self> {
        let engine = StorageEngine::from_config(cache, server, index.clone())?;

        let signer = match (&cache.signing_key, server.key.is_empty()) {
            (Some(secret), _) => NarinfoSigner::from_nix_secret(secret)?,
            (None, false) => NarinfoSigner::from_nix_secret(&server.key)?,
            (None, true) => {
                let path = server
                    .cache_dir
                    .join("keys")
                    .join(format!("{}.secret", cache.name));
                let key_name = default_key_name(&cache.name, &server.hostname);
                tokio::task::spawn_blocking(move || NarinfoSigner::load_or_generate(&path, &key_name))
                    .await??
            }
        };

        let token = match &cache.token {
            Some(token) => token.clone(),
            None => {
                index
                    .token_or_insert(&cache.name, uuid::Uuid::new_v4().simple().to_string())
                    .await?
            }
        };

        info!(
            "Cache {} ready with {} backends ({} strategy), signing as {}",
            cache.name,
            engine.backend_count(),
            engine.strategy(),
            signer.key_name()
        );

        Ok(Self::new(
            cache.name.clone(),
            token,
            cache.retention_days(server),
            cache.port(server),
            cache.access,
            cache.priority.unwrap_or(DEFAULT_CACHE_PRIORITY),
            ArtifactStore::new(engine, signer).with_upload_limit(server.max_upload_size),
        ))
    }

    pub fn new(
        name: String,
        token: String,
        retention_days: u32,
        port: u16,
        access: CacheAccess,
        priority: u32,
        store: ArtifactStore,
    ) -> Self {
        Self {
            name,
            token,
            retention_days,
            port,
            access,
            priority,
            store: Arc::new(store),
            metrics: CacheMetrics::new(),
        }
    }

    pub fn is_public(&self) -> bool {
        self.access == CacheAccess::Public
    }

    /// Sweeper bound to this instance's store and retention
    pub fn sweeper(&self) -> RetentionSweeper {
        RetentionSweeper::new(self.store.clone(), self.retention_days)
    }
}

/// Instance name to auth key mapping consumed by the deploy relay
pub trait AuthKeyLookup: Send + Sync {
    fn auth_key(&self, instance: &str) -> Option<String>;
}

/// Every cache instance of this server, by name
#[derive(Default, Clone)]
pub struct CacheRegistry {
    instances: BTreeMap<String, Arc<CacheInstance>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured instance
    pub async fn from_config(caches: &[CacheConfig], server: &ServerConfig, index: &ArtifactIndex) -> Result<Self> {
        let mut registry = Self::new();
        for cache in caches {
            let instance = CacheInstance::from_config(cache, server, index.clone()).await?;
            registry.insert(instance)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, instance: CacheInstance) -> Result<Arc<CacheInstance>> {
        if self.instances.contains_key(&instance.name) {
            return Err(CacheServerError::ConfigInvalid(format!(
                "Duplicate cache name: {}",
                instance.name
            )));
        }
        let instance = Arc::new(instance);
        self.instances.insert(instance.name.clone(), instance.clone());
        Ok(instance)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CacheInstance>> {
        self.instances.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CacheInstance>> {
        self.instances.values()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl AuthKeyLookup for CacheRegistry {
    fn auth_key(&self, instance: &str) -> Option<String> {
        self.instances.get(instance).map(|i| i.token.clone())
    }
}
