// Artifact store
//
// Content addressed put/get/exists/delete for one cache instance. Uploads
// arrive in two halves: the payload is staged first (invisible), then the
// narinfo is signed, written next to it and the index row flips to complete.

use super::multipart::MultipartUploads;
use crate::crypto::NarinfoSigner;
use crate::error::{CacheServerError, Result};
use crate::storage::{
    ArtifactIndex, ArtifactRecord, BackendRef, InflightRegistry, PendingRecord, StorageEngine,
    WritePermit,
};
use crate::types::{same_sha256, Compression, NarFile, NarInfo, StoreHash};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// The content was already present; nothing was written
    AlreadyPresent,
}

/// Keys written during one upload, deleted again unless committed
///
/// Dropping an uncommitted transaction (an aborted task) spawns the rollback
/// and releases the admission permit only once it has finished.
struct WriteTxn {
    engine: Arc<StorageEngine>,
    written: Vec<(BackendRef, String, u64)>,
    permit: Option<WritePermit>,
    done: bool,
}

impl WriteTxn {
    fn new(engine: Arc<StorageEngine>, permit: WritePermit) -> Self {
        Self {
            engine,
            written: Vec::new(),
            permit: Some(permit),
            done: false,
        }
    }

    fn record(&mut self, backend: BackendRef, key: String, size: u64) {
        self.written.push((backend, key, size));
    }

    fn commit(mut self) {
        self.done = true;
    }

    async fn rollback(mut self) {
        self.done = true;
        let written = std::mem::take(&mut self.written);
        undo_writes(&self.engine, written).await;
    }
}

impl Drop for WriteTxn {
    fn drop(&mut self) {
        if self.done || self.written.is_empty() {
            return;
        }

        let engine = self.engine.clone();
        let written = std::mem::take(&mut self.written);
        let permit = self.permit.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    undo_writes(&engine, written).await;
                    drop(permit);
                });
            }
            Err(_) => warn!(
                "Upload to cache {} abandoned outside a runtime; {} keys left for the sweeper",
                engine.cache(),
                written.len()
            ),
        }
    }
}

async fn undo_writes(engine: &StorageEngine, written: Vec<(BackendRef, String, u64)>) {
    for (backend, key, size) in written.into_iter().rev() {
        match engine.delete_from(backend, &key, size).await {
            Ok(()) | Err(CacheServerError::NotFound(_)) => {
                debug!("Rolled back {} on {}", key, engine.backend_name(backend))
            }
            Err(e) => warn!(
                "Rollback of {} on {} failed: {}",
                key,
                engine.backend_name(backend),
                e
            ),
        }
    }
}

/// Where a payload referenced by a narinfo lives
struct PayloadSource {
    backend: String,
    bytes: u64,
}

/// Per cache facade over the strategy engine and the index
pub struct ArtifactStore {
    cache: String,
    engine: Arc<StorageEngine>,
    index: ArtifactIndex,
    signer: Arc<NarinfoSigner>,
    inflight: InflightRegistry,
    uploads: MultipartUploads,
}

impl ArtifactStore {
    pub fn new(engine: StorageEngine, signer: NarinfoSigner) -> Self {
        Self {
            cache: engine.cache().to_string(),
            index: engine.index().clone(),
            engine: Arc::new(engine),
            signer: Arc::new(signer),
            inflight: InflightRegistry::new(),
            uploads: MultipartUploads::new(usize::MAX),
        }
    }

    /// Bound the assembled size of multipart uploads
    pub fn with_upload_limit(mut self, limit: usize) -> Self {
        self.uploads = MultipartUploads::new(limit);
        self
    }

    pub fn cache(&self) -> &str {
        &self.cache
    }

    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    pub fn index(&self) -> &ArtifactIndex {
        &self.index
    }

    pub fn signer(&self) -> &NarinfoSigner {
        &self.signer
    }

    pub fn inflight(&self) -> &InflightRegistry {
        &self.inflight
    }

    pub fn uploads(&self) -> &MultipartUploads {
        &self.uploads
    }

    /// Store a payload ahead of its narinfo
    ///
    /// The body must hash to the file hash in its name, otherwise the upload
    /// is rejected as corrupt before anything is written. Once admitted the
    /// write and its pending row run in their own task, so a dropped request
    /// never leaves one without the other.
    pub async fn stage_payload(&self, file: &NarFile, payload: Bytes) -> Result<PutOutcome> {
        file.verify(&payload)?;

        let key = file.key();
        let permit = self.inflight.admit(&key).await;

        if self.index.artifact_by_nar(&self.cache, &key).await?.is_some()
            || self.index.pending(&self.cache, &key).await?.is_some()
        {
            debug!("Payload {} already present in {}", key, self.cache);
            return Ok(PutOutcome::AlreadyPresent);
        }

        let engine = self.engine.clone();
        let index = self.index.clone();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let size = payload.len() as u64;
            let mut txn = WriteTxn::new(engine.clone(), permit);
            let backend = engine.write_new(&key, payload).await?;
            txn.record(backend, key.clone(), size);

            let pending = PendingRecord {
                cache,
                nar_key: key.clone(),
                backend: engine.backend_name(backend).to_string(),
                bytes: size,
                created_at: chrono::Utc::now().timestamp(),
            };
            if let Err(e) = index.insert_pending(pending).await {
                txn.rollback().await;
                return Err(e);
            }

            txn.commit();
            debug!(
                "Staged {} ({} bytes) on {}",
                key,
                size,
                engine.backend_name(backend)
            );
            Ok(PutOutcome::Stored)
        })
        .await?
    }

    /// Staged payload, or one already committed for another store path
    async fn payload_source(&self, nar_key: &str) -> Result<PayloadSource> {
        if let Some(pending) = self.index.pending(&self.cache, nar_key).await? {
            return Ok(PayloadSource {
                backend: pending.backend,
                bytes: pending.bytes,
            });
        }
        if let Some(record) = self.index.artifact_by_nar(&self.cache, nar_key).await? {
            debug!("Payload {} shared with {}", nar_key, record.store_hash);
            return Ok(PayloadSource {
                backend: record.backend,
                bytes: record.nar_bytes,
            });
        }
        Err(CacheServerError::Corrupt(format!(
            "Payload {} has not been uploaded",
            nar_key
        )))
    }

    /// Sign a narinfo and publish it next to its payload
    ///
    /// The payload is either staged or already committed under another store
    /// path. Declared sizes and hashes are checked against it first; an
    /// uncompressed payload is read back so NarHash and NarSize are verified
    /// too.
    pub async fn commit_narinfo(&self, hash: &StoreHash, mut info: NarInfo) -> Result<PutOutcome> {
        if info.store_hash()? != *hash {
            return Err(CacheServerError::Corrupt(format!(
                "Narinfo for {} uploaded as {}",
                info.store_path, hash
            )));
        }

        let file = NarFile::parse(info.nar_file()?)?;
        if info.compression != file.compression() {
            return Err(CacheServerError::Corrupt(format!(
                "Compression {} does not match payload {}",
                info.compression,
                file.file_name()
            )));
        }
        if let Some(declared) = &info.file_hash {
            if !file_hash_matches(declared, &file) {
                return Err(CacheServerError::Corrupt(format!(
                    "FileHash {} does not match payload {}",
                    declared,
                    file.file_name()
                )));
            }
        }

        let permit = self.inflight.admit(hash.as_str()).await;
        if self.index.artifact(&self.cache, hash.as_str()).await?.is_some() {
            debug!("Artifact {} already present in {}", hash, self.cache);
            return Ok(PutOutcome::AlreadyPresent);
        }

        let nar_key = file.key();
        let payload_permit = self.inflight.admit(&nar_key).await;
        let source = self.payload_source(&nar_key).await?;

        match info.file_size {
            Some(size) if size != source.bytes => {
                return Err(CacheServerError::Corrupt(format!(
                    "FileSize {} does not match uploaded {} bytes",
                    size, source.bytes
                )));
            }
            Some(_) => {}
            None => info.file_size = Some(source.bytes),
        }

        let backend = self.engine.backend(&source.backend).ok_or_else(|| {
            CacheServerError::Internal(format!(
                "Payload {} stored on unknown backend {}",
                nar_key, source.backend
            ))
        })?;

        if info.compression == Compression::None {
            if info.nar_size != source.bytes {
                return Err(CacheServerError::Corrupt(format!(
                    "NarSize {} does not match uploaded {} bytes",
                    info.nar_size, source.bytes
                )));
            }
            let payload = self.engine.read_from(backend, &nar_key).await?;
            if !same_sha256(&info.nar_hash, &payload) {
                return Err(CacheServerError::Corrupt(format!(
                    "NarHash {} does not match payload",
                    info.nar_hash
                )));
            }
        }

        self.signer.sign_narinfo(&mut info);
        let document = Bytes::from(info.to_string());
        let narinfo_key = hash.narinfo_key();
        let narinfo_bytes = document.len() as u64;
        let record = ArtifactRecord {
            cache: self.cache.clone(),
            store_hash: hash.to_string(),
            narinfo_key: narinfo_key.clone(),
            nar_key,
            backend: source.backend,
            nar_bytes: source.bytes,
            narinfo_bytes,
            created_at: chrono::Utc::now().timestamp(),
        };

        // The document and its index row land together even if the request goes away
        let engine = self.engine.clone();
        let index = self.index.clone();
        tokio::spawn(async move {
            let _payload_permit = payload_permit;
            let mut txn = WriteTxn::new(engine.clone(), permit);
            engine.write_to(backend, &narinfo_key, document).await?;
            txn.record(backend, narinfo_key, narinfo_bytes);

            if let Err(e) = index.complete(record).await {
                txn.rollback().await;
                return Err(e);
            }
            txn.commit();
            Ok(())
        })
        .await??;

        info!("Stored {} in cache {}", info.store_path, self.cache);
        Ok(PutOutcome::Stored)
    }

    /// Store metadata and payload of one artifact
    ///
    /// Both land on the same backend. Any mismatch between the declared hashes
    /// and the payload rejects the upload and leaves nothing behind.
    pub async fn put(&self, hash: &StoreHash, info: NarInfo, payload: Bytes) -> Result<PutOutcome> {
        if info.store_hash()? != *hash {
            return Err(CacheServerError::Corrupt(format!(
                "Narinfo for {} uploaded as {}",
                info.store_path, hash
            )));
        }
        if let Some(declared) = &info.file_hash {
            if !same_sha256(declared, &payload) {
                return Err(CacheServerError::Corrupt(format!(
                    "FileHash {} does not match payload",
                    declared
                )));
            }
        }
        if info.compression == Compression::None
            && (info.nar_size != payload.len() as u64 || !same_sha256(&info.nar_hash, &payload))
        {
            return Err(CacheServerError::Corrupt(format!(
                "NarHash {} does not match payload",
                info.nar_hash
            )));
        }

        if self.exists(hash).await? {
            return Ok(PutOutcome::AlreadyPresent);
        }

        let file = NarFile::parse(info.nar_file()?)?;
        let staged = self.stage_payload(&file, payload).await?;

        match self.commit_narinfo(hash, info).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if staged == PutOutcome::Stored {
                    if let Some(pending) = self.index.pending(&self.cache, &file.key()).await? {
                        self.discard_pending(&pending).await?;
                    }
                }
                Err(e)
            }
        }
    }

    /// Signed narinfo of a committed artifact
    pub async fn get_narinfo(&self, hash: &StoreHash) -> Result<NarInfo> {
        let key = hash.narinfo_key();
        let (backend, bytes) = self.engine.read(&key).await?;

        let text = String::from_utf8(bytes.to_vec())
            .map_err(|_| CacheServerError::Corrupt(format!("Narinfo {} is not UTF-8", key)))?;
        let info = NarInfo::parse(&text)?;

        if self.index.artifact(&self.cache, hash.as_str()).await?.is_none() {
            self.adopt(hash, &info, backend, bytes.len() as u64).await?;
        }

        Ok(info)
    }

    /// Payload of a committed artifact
    pub async fn get_payload(&self, file: &NarFile) -> Result<Bytes> {
        let key = file.key();
        if self.index.pending(&self.cache, &key).await?.is_some() {
            return Err(CacheServerError::NotFound(key));
        }
        let (_, bytes) = self.engine.read(&key).await?;
        Ok(bytes)
    }

    /// Metadata and payload of one artifact
    pub async fn get(&self, hash: &StoreHash) -> Result<(NarInfo, Bytes)> {
        let info = self.get_narinfo(hash).await?;
        let file = NarFile::parse(info.nar_file()?)?;
        let payload = self.get_payload(&file).await?;
        Ok((info, payload))
    }

    /// Whether the artifact is committed and retrievable
    pub async fn exists(&self, hash: &StoreHash) -> Result<bool> {
        if self.index.artifact(&self.cache, hash.as_str()).await?.is_some() {
            return Ok(true);
        }
        match self.engine.locate_backend_for_read(&hash.narinfo_key()).await {
            Ok(_) => Ok(true),
            Err(CacheServerError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether a committed payload exists
    pub async fn payload_exists(&self, file: &NarFile) -> Result<bool> {
        let key = file.key();
        if self.index.pending(&self.cache, &key).await?.is_some() {
            return Ok(false);
        }
        match self.engine.locate_backend_for_read(&key).await {
            Ok(_) => Ok(true),
            Err(CacheServerError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove an artifact; removing a missing artifact is not an error
    ///
    /// # Returns
    ///
    /// * `Ok(true)` if an index entry was removed
    pub async fn delete(&self, hash: &StoreHash) -> Result<bool> {
        match self.index.artifact(&self.cache, hash.as_str()).await? {
            Some(record) => {
                self.delete_record(&record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete both documents of an indexed artifact, then its row
    ///
    /// A payload other artifacts still reference is kept.
    pub async fn delete_record(&self, record: &ArtifactRecord) -> Result<()> {
        let _permit = self.inflight.admit(&record.nar_key).await;
        let shared = self.index.nar_references(&self.cache, &record.nar_key).await? > 1;

        match self.engine.backend(&record.backend) {
            Some(backend) => {
                // Narinfo first so nothing ever points at a missing payload
                let mut keys = vec![(&record.narinfo_key, record.narinfo_bytes)];
                if shared {
                    debug!("Keeping {} for other artifacts", record.nar_key);
                } else {
                    keys.push((&record.nar_key, record.nar_bytes));
                }
                for (key, size) in keys {
                    match self.engine.delete_from(backend, key, size).await {
                        Ok(()) | Err(CacheServerError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            None => warn!(
                "Artifact {} recorded on unknown backend {}, dropping index entry only",
                record.store_hash, record.backend
            ),
        }

        self.index.remove_artifact(&self.cache, &record.store_hash).await?;
        debug!("Deleted {} from cache {}", record.store_hash, self.cache);
        Ok(())
    }

    /// Delete a staged payload that never got its narinfo
    pub async fn discard_pending(&self, pending: &PendingRecord) -> Result<()> {
        let _permit = self.inflight.admit(&pending.nar_key).await;
        // A commit may have claimed it while we waited
        if self.index.pending(&self.cache, &pending.nar_key).await?.is_none() {
            return Ok(());
        }

        if let Some(backend) = self.engine.backend(&pending.backend) {
            match self
                .engine
                .delete_from(backend, &pending.nar_key, pending.bytes)
                .await
            {
                Ok(()) | Err(CacheServerError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.index.remove_pending(&self.cache, &pending.nar_key).await?;
        Ok(())
    }

    /// Hashes from `hashes` this cache does not hold
    pub async fn missing(&self, hashes: Vec<String>) -> Result<Vec<String>> {
        let present = self.index.present(&self.cache, hashes.clone()).await?;
        Ok(hashes
            .into_iter()
            .filter(|hash| !present.contains(hash))
            .collect())
    }

    /// Index a narinfo found on a backend without an index row
    async fn adopt(&self, hash: &StoreHash, info: &NarInfo, backend: BackendRef, narinfo_bytes: u64) -> Result<()> {
        let nar_key = match info.nar_file() {
            Ok(file) => format!("nar/{}", file),
            Err(_) => return Ok(()),
        };

        let record = ArtifactRecord {
            cache: self.cache.clone(),
            store_hash: hash.to_string(),
            narinfo_key: hash.narinfo_key(),
            nar_key,
            backend: self.engine.backend_name(backend).to_string(),
            nar_bytes: info.file_size.unwrap_or(info.nar_size),
            narinfo_bytes,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.index.complete(record).await?;
        info!("Indexed unrecorded artifact {} in cache {}", hash, self.cache);
        Ok(())
    }
}

fn file_hash_matches(declared: &str, file: &NarFile) -> bool {
    match declared.strip_prefix("sha256:") {
        Some(value) => value.eq_ignore_ascii_case(file.file_hash()),
        None => false,
    }
}
