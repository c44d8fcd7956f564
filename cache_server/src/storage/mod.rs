// Storage module for the cache server
//
// This module defines the storage driver contract, the per instance strategy
// engine built on top of it, and the durable read index.

use crate::config::{StorageConfig, StorageKind};
use crate::error::{CacheServerError, Result};
use bytes::Bytes;
use std::path::PathBuf;

pub mod engine;
pub mod index;
pub mod inflight;
pub mod local;
pub mod s3;
pub mod strategy;

pub use engine::{BackendRef, BackendUsage, RetryPolicy, StorageEngine};
pub use index::{ArtifactIndex, ArtifactRecord, PendingRecord};
pub use inflight::{InflightRegistry, WritePermit};
pub use local::LocalDriver;
pub use s3::{S3Driver, S3Settings};
pub use strategy::{StorageStrategy, StrategyState};

/// One physical storage medium
///
/// Errors are classified as `NotFound`, `BackendUnavailable` (retryable) or
/// `PermissionDenied`.
#[derive(Debug, Clone)]
pub enum StorageDriver {
    Local(LocalDriver),
    S3(S3Driver),
}

impl StorageDriver {
    /// Build the driver for a configured storage of `cache`
    ///
    /// Each cache gets its own subtree under the configured root.
    pub fn from_config(storage: &StorageConfig, cache: &str) -> Result<Self> {
        let missing = |field: &str| {
            CacheServerError::ConfigInvalid(format!(
                "Storage '{}' is missing required configuration '{}'",
                storage.name, field
            ))
        };
        let root = storage.root.clone().ok_or_else(|| missing("root"))?;

        match storage.kind {
            StorageKind::Local => Ok(StorageDriver::Local(LocalDriver::new(
                PathBuf::from(root).join(cache),
            ))),
            StorageKind::S3 => {
                let settings = S3Settings {
                    bucket: storage.s3_bucket.clone().ok_or_else(|| missing("s3_bucket"))?,
                    region: storage.s3_region.clone().ok_or_else(|| missing("s3_region"))?,
                    access_key: storage
                        .s3_access_key
                        .clone()
                        .ok_or_else(|| missing("s3_access_key"))?,
                    secret_key: storage
                        .s3_secret_key
                        .clone()
                        .ok_or_else(|| missing("s3_secret_key"))?,
                    endpoint: storage.s3_endpoint.clone(),
                    prefix: format!("{}/{}", root.trim_matches('/'), cache),
                };
                Ok(StorageDriver::S3(S3Driver::connect(&settings)?))
            }
        }
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            StorageDriver::Local(_) => StorageKind::Local,
            StorageDriver::S3(_) => StorageKind::S3,
        }
    }

    pub async fn write(&self, key: &str, bytes: Bytes) -> Result<()> {
        match self {
            StorageDriver::Local(driver) => driver.write(key, bytes).await,
            StorageDriver::S3(driver) => driver.write(key, bytes).await,
        }
    }

    pub async fn read(&self, key: &str) -> Result<Bytes> {
        match self {
            StorageDriver::Local(driver) => driver.read(key).await,
            StorageDriver::S3(driver) => driver.read(key).await,
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            StorageDriver::Local(driver) => driver.exists(key).await,
            StorageDriver::S3(driver) => driver.exists(key).await,
        }
    }

    /// Stored size of `key`, `None` when absent
    pub async fn size(&self, key: &str) -> Result<Option<u64>> {
        match self {
            StorageDriver::Local(driver) => driver.size(key).await,
            StorageDriver::S3(driver) => driver.size(key).await,
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        match self {
            StorageDriver::Local(driver) => driver.delete(key).await,
            StorageDriver::S3(driver) => driver.delete(key).await,
        }
    }

    pub async fn used_bytes(&self) -> Result<u64> {
        match self {
            StorageDriver::Local(driver) => driver.used_bytes().await,
            StorageDriver::S3(driver) => driver.used_bytes().await,
        }
    }

    /// Ceiling applied when the storage has no configured quota
    pub fn implicit_ceiling(&self) -> Option<u64> {
        match self {
            StorageDriver::Local(driver) => driver.disk_ceiling(),
            StorageDriver::S3(_) => None,
        }
    }
}
