// S3 compatible object store driver

use crate::error::{CacheServerError, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::ObjectStore;
use std::fmt;
use std::sync::Arc;

/// Connection settings of one bucket
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: Option<String>,
    pub prefix: String,
}

/// Storage driver over an S3 bucket
#[derive(Clone)]
pub struct S3Driver {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl fmt::Debug for S3Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Driver")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl S3Driver {
    /// Connect to a bucket
    pub fn connect(settings: &S3Settings) -> Result<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region)
            .with_access_key_id(&settings.access_key)
            .with_secret_access_key(&settings.secret_key);

        if let Some(endpoint) = &settings.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build().map_err(|e| {
            CacheServerError::ConfigInvalid(format!(
                "Failed to configure bucket {}: {}",
                settings.bucket, e
            ))
        })?;

        Ok(Self::with_store(
            Arc::new(store),
            settings.bucket.clone(),
            settings.prefix.clone(),
        ))
    }

    /// Wrap an existing object store
    pub fn with_store(store: Arc<dyn ObjectStore>, bucket: String, prefix: String) -> Self {
        Self {
            store,
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn location(&self, key: &str) -> Path {
        if self.prefix.is_empty() {
            Path::from(key)
        } else {
            Path::from(format!("{}/{}", self.prefix, key))
        }
    }

    pub async fn write(&self, key: &str, bytes: Bytes) -> Result<()> {
        self.store.put(&self.location(key), bytes).await?;
        Ok(())
    }

    pub async fn read(&self, key: &str) -> Result<Bytes> {
        let result = self.store.get(&self.location(key)).await?;
        Ok(result.bytes().await?)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.size(key).await?.is_some())
    }

    pub async fn size(&self, key: &str) -> Result<Option<u64>> {
        match self.store.head(&self.location(key)).await {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        // S3 deletes of missing objects succeed, so check first
        if !self.exists(key).await? {
            return Err(CacheServerError::NotFound(key.to_string()));
        }
        self.store.delete(&self.location(key)).await?;
        Ok(())
    }

    pub async fn used_bytes(&self) -> Result<u64> {
        let prefix = (!self.prefix.is_empty()).then(|| Path::from(self.prefix.as_str()));
        let total = self
            .store
            .list(prefix.as_ref())
            .try_fold(0u64, |acc, meta| async move { Ok(acc + meta.size as u64) })
            .await?;
        Ok(total)
    }
}
