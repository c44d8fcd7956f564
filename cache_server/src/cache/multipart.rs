// Multipart NAR uploads
//
// Cachix clients send large payloads in parts: they open a session, PUT each
// part to the upload URL handed out for it, then complete the session with
// the narinfo fields. Parts stay in memory until the session completes or is
// aborted, and the assembled payload is bounded by the upload limit.

use crate::error::{CacheServerError, Result};
use crate::types::{Compression, NarFile, NarInfo, StoreHash, STORE_DIR};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// Handles for one open session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadHandle {
    pub nar_id: Uuid,
    pub upload_id: Uuid,
}

/// Part reference sent on completion
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    #[serde(default)]
    pub e_tag: Option<String>,
}

/// Narinfo fields of a completed upload, as Cachix names them
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarInfoCreate {
    pub c_store_hash: String,
    pub c_store_suffix: String,
    pub c_file_hash: String,
    pub c_file_size: u64,
    pub c_nar_hash: String,
    pub c_nar_size: u64,
    #[serde(default)]
    pub c_references: Vec<String>,
    #[serde(default)]
    pub c_deriver: Option<String>,
}

impl NarInfoCreate {
    /// Narinfo for a payload stored with `compression`
    pub fn into_narinfo(self, compression: Compression) -> Result<(StoreHash, NarInfo)> {
        let hash = StoreHash::parse(&self.c_store_hash)?;
        let file_hash = self
            .c_file_hash
            .strip_prefix("sha256:")
            .unwrap_or(&self.c_file_hash)
            .to_string();
        let file = NarFile::parse(&format!("{}.nar{}", file_hash, compression.extension()))?;

        let nar_hash = if self.c_nar_hash.starts_with("sha256:") {
            self.c_nar_hash
        } else {
            format!("sha256:{}", self.c_nar_hash)
        };

        let mut info = NarInfo::new(
            format!("{}/{}-{}", STORE_DIR, hash, self.c_store_suffix),
            file.key(),
            nar_hash,
            self.c_nar_size,
        );
        info.compression = compression;
        info.file_hash = Some(format!("sha256:{}", file_hash));
        info.file_size = Some(self.c_file_size);
        info.references = self.c_references;
        info.deriver = self
            .c_deriver
            .filter(|d| !d.is_empty() && d != "unknown-deriver");
        Ok((hash, info))
    }
}

/// A session's payload, assembled in part order
#[derive(Debug)]
pub struct AssembledUpload {
    pub compression: Compression,
    pub payload: Bytes,
}

struct Part {
    bytes: Bytes,
    etag: String,
}

struct Session {
    upload_id: Uuid,
    compression: Compression,
    parts: BTreeMap<u32, Part>,
    size: usize,
    created_at: i64,
}

/// Open multipart sessions of one cache
pub struct MultipartUploads {
    sessions: DashMap<Uuid, Session>,
    max_size: usize,
}

impl MultipartUploads {
    pub fn new(max_size: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_size,
        }
    }

    /// Open a session for a payload compressed with `compression`
    pub fn create(&self, compression: Compression) -> UploadHandle {
        let handle = UploadHandle {
            nar_id: Uuid::new_v4(),
            upload_id: Uuid::new_v4(),
        };
        self.sessions.insert(
            handle.nar_id,
            Session {
                upload_id: handle.upload_id,
                compression,
                parts: BTreeMap::new(),
                size: 0,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        debug!("Opened multipart upload {}", handle.nar_id);
        handle
    }

    /// Whether `upload_id` opens the session `nar_id`
    pub fn is_open(&self, nar_id: &Uuid, upload_id: &Uuid) -> bool {
        self.sessions
            .get(nar_id)
            .map(|s| s.upload_id == *upload_id)
            .unwrap_or(false)
    }

    /// Store one part, replacing an earlier upload of the same number
    ///
    /// # Returns
    ///
    /// * `Ok(etag)` identifying the stored part
    pub fn put_part(&self, handle: UploadHandle, part_number: u32, bytes: Bytes) -> Result<String> {
        if part_number == 0 {
            return Err(CacheServerError::InvalidRequest(
                "Part numbers start at 1".to_string(),
            ));
        }

        let mut session = self.session_mut(&handle)?;
        let replaced = session
            .parts
            .get(&part_number)
            .map(|p| p.bytes.len())
            .unwrap_or(0);
        let size = session.size - replaced + bytes.len();
        if size > self.max_size {
            return Err(CacheServerError::InvalidRequest(format!(
                "Upload {} exceeds {} bytes",
                handle.nar_id, self.max_size
            )));
        }

        let etag = format!("\"{}\"", hex::encode(Sha256::digest(&bytes)));
        session.parts.insert(
            part_number,
            Part {
                bytes,
                etag: etag.clone(),
            },
        );
        session.size = size;
        Ok(etag)
    }

    /// Close a session and join its parts
    ///
    /// With a non-empty `parts` list only the listed parts are joined, in
    /// list order, and each must have been uploaded with a matching ETag.
    pub fn complete(&self, handle: UploadHandle, parts: &[CompletedPart]) -> Result<AssembledUpload> {
        let session = {
            let session = self.session_mut(&handle)?;
            for part in parts {
                let stored = session.parts.get(&part.part_number).ok_or_else(|| {
                    CacheServerError::InvalidRequest(format!(
                        "Part {} of upload {} was never sent",
                        part.part_number, handle.nar_id
                    ))
                })?;
                if let Some(etag) = &part.e_tag {
                    if etag.trim_matches('"') != stored.etag.trim_matches('"') {
                        return Err(CacheServerError::Corrupt(format!(
                            "ETag of part {} does not match",
                            part.part_number
                        )));
                    }
                }
            }
            drop(session);
            self.sessions
                .remove(&handle.nar_id)
                .map(|(_, s)| s)
                .ok_or_else(|| unknown(&handle))?
        };

        let mut payload = BytesMut::with_capacity(session.size);
        if parts.is_empty() {
            for part in session.parts.values() {
                payload.extend_from_slice(&part.bytes);
            }
        } else {
            for part in parts {
                if let Some(stored) = session.parts.get(&part.part_number) {
                    payload.extend_from_slice(&stored.bytes);
                }
            }
        }

        debug!(
            "Completed multipart upload {} with {} bytes",
            handle.nar_id,
            payload.len()
        );
        Ok(AssembledUpload {
            compression: session.compression,
            payload: payload.freeze(),
        })
    }

    /// Drop a session and its parts
    pub fn abort(&self, handle: UploadHandle) -> Result<()> {
        self.session_mut(&handle)?;
        self.sessions.remove(&handle.nar_id);
        debug!("Aborted multipart upload {}", handle.nar_id);
        Ok(())
    }

    /// Drop sessions opened before `before`
    pub fn expire(&self, before: i64) -> usize {
        let open = self.sessions.len();
        self.sessions.retain(|_, s| s.created_at >= before);
        open - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn session_mut(
        &self,
        handle: &UploadHandle,
    ) -> Result<dashmap::mapref::one::RefMut<'_, Uuid, Session>> {
        match self.sessions.get_mut(&handle.nar_id) {
            Some(session) if session.upload_id == handle.upload_id => Ok(session),
            _ => Err(unknown(handle)),
        }
    }
}

fn unknown(handle: &UploadHandle) -> CacheServerError {
    CacheServerError::NotFound(format!("Multipart upload {}", handle.nar_id))
}
