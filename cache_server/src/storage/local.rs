// Local filesystem driver
//
// Keys map onto a two level fan-out tree under the root:
// `nar/1w1f...nar.xz` is stored at `<root>/nar/1w/1f/1w1f...nar.xz`.
// Writes go to a temporary sibling and are renamed into place.

use crate::error::{CacheServerError, Result};
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::{debug, warn};

/// Fraction of the disk the driver may fill when no quota is configured
const MAX_DISK_USAGE_PERCENT: u64 = 95;

const TEMP_SUFFIX: &str = ".tmp";

/// Storage driver over a directory tree
#[derive(Debug, Clone)]
pub struct LocalDriver {
    root: PathBuf,
}

impl LocalDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a storage key to its file path
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('/')
            && key
                .split('/')
                .all(|part| !part.is_empty() && part != "." && part != "..")
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/'));
        if !valid {
            return Err(CacheServerError::InvalidRequest(format!(
                "Invalid storage key: {}",
                key
            )));
        }

        let (dir, name) = match key.rsplit_once('/') {
            Some((dir, name)) => (Some(dir), name),
            None => (None, key),
        };

        let mut path = self.root.clone();
        if let Some(dir) = dir {
            path.push(dir);
        }
        if name.len() >= 4 {
            path.push(&name[..2]);
            path.push(&name[2..4]);
        }
        path.push(name);
        Ok(path)
    }

    /// Write `bytes` under `key`, replacing any previous value
    ///
    /// Runs to completion on the blocking pool once started, so a dropped
    /// caller never leaves a half written file or temp sibling behind.
    pub async fn write(&self, key: &str, bytes: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        let len = bytes.len();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes)).await??;
        debug!("Wrote {} bytes under {}", len, key);
        Ok(())
    }

    pub async fn read(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CacheServerError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.size(key).await?.is_some())
    }

    /// Size of a stored key, `None` when absent
    pub async fn size(&self, key: &str) -> Result<Option<u64>> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CacheServerError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Bytes held under the root, excluding unfinished writes
    pub async fn used_bytes(&self) -> Result<u64> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || tree_size(&root)).await?
    }

    /// Default ceiling derived from the disk holding the root
    pub fn disk_ceiling(&self) -> Option<u64> {
        let disks = Disks::new_with_refreshed_list();
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());

        disks
            .list()
            .iter()
            .filter(|disk| root.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.total_space() / 100 * MAX_DISK_USAGE_PERCENT)
    }
}

/// Temporary file removed on drop unless persisted
///
/// A write cancelled between creating the file and renaming it leaves
/// nothing behind.
struct TempFile {
    path: PathBuf,
    persisted: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn persist(mut self) {
        self.persisted = true;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed unfinished write {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", self.path.display(), e),
        }
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CacheServerError::Internal(format!("No parent for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = TempFile::new(parent.join(format!(
        ".{}.{}{}",
        file_name,
        uuid::Uuid::new_v4(),
        TEMP_SUFFIX
    )));

    std::fs::write(temp.path(), bytes)?;
    std::fs::rename(temp.path(), path)?;
    temp.persist();
    Ok(())
}

fn tree_size(dir: &Path) -> Result<u64> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut total = 0;
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += tree_size(&entry.path())?;
        } else if file_type.is_file() {
            if entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => total += meta.len(),
                Err(e) => warn!("Skipping {}: {}", entry.path().display(), e),
            }
        }
    }
    Ok(total)
}
