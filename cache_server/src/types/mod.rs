// Types module for the cache server
//
// Wire level types of the Nix binary cache protocol: store hashes, payload
// file names, compression, the cache-info document and narinfo metadata.

use crate::error::{CacheServerError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub mod narinfo;
pub mod nix32;

pub use narinfo::{NarInfo, NARINFO_CONTENT_TYPE};

/// Store directory served by every cache
pub const STORE_DIR: &str = "/nix/store";

/// Priority advertised in nix-cache-info
pub const DEFAULT_CACHE_PRIORITY: u32 = 30;

/// Length of a store path hash in nix base32
pub const STORE_HASH_LEN: usize = 32;

/// Hash part of a store path, the primary key of an artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoreHash(String);

impl StoreHash {
    /// Validate and wrap a store hash
    pub fn parse(hash: &str) -> Result<Self> {
        if hash.len() != STORE_HASH_LEN || !nix32::is_valid(hash) {
            return Err(CacheServerError::InvalidRequest(format!(
                "Invalid store hash: {}",
                hash
            )));
        }
        Ok(Self(hash.to_string()))
    }

    /// Parse the `<hash>.narinfo` request path segment
    pub fn from_narinfo_file(file: &str) -> Result<Self> {
        let hash = file.strip_suffix(".narinfo").ok_or_else(|| {
            CacheServerError::NotFound(format!("Not a narinfo path: {}", file))
        })?;
        Self::parse(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Storage key of the narinfo document
    pub fn narinfo_key(&self) -> String {
        format!("{}.narinfo", self.0)
    }
}

impl TryFrom<String> for StoreHash {
    type Error = CacheServerError;

    fn try_from(value: String) -> Result<Self> {
        StoreHash::parse(&value)
    }
}

impl From<StoreHash> for String {
    fn from(hash: StoreHash) -> Self {
        hash.0
    }
}

impl fmt::Display for StoreHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload compression advertised in narinfo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Xz,
    Zstd,
    Bzip2,
}

impl Compression {
    /// File extension appended after `.nar`
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Xz => ".xz",
            Compression::Zstd => ".zst",
            Compression::Bzip2 => ".bz2",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "" => Some(Compression::None),
            ".xz" => Some(Compression::Xz),
            ".zst" => Some(Compression::Zstd),
            ".bz2" => Some(Compression::Bzip2),
            _ => None,
        }
    }
}

impl FromStr for Compression {
    type Err = CacheServerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Compression::None),
            "xz" => Ok(Compression::Xz),
            "zstd" => Ok(Compression::Zstd),
            "bzip2" => Ok(Compression::Bzip2),
            other => Err(CacheServerError::InvalidRequest(format!(
                "Unsupported compression: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::None => "none",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
            Compression::Bzip2 => "bzip2",
        };
        f.write_str(name)
    }
}

/// Payload file name, `<filehash>.nar[.ext]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NarFile {
    file_hash: String,
    compression: Compression,
}

impl NarFile {
    /// Parse the file segment of a `/nar/<file>` path
    pub fn parse(file: &str) -> Result<Self> {
        let (hash, rest) = file.split_once(".nar").ok_or_else(|| {
            CacheServerError::NotFound(format!("Not a nar path: {}", file))
        })?;

        let hash_ok = match hash.len() {
            52 => nix32::is_valid(hash),
            64 => hash.chars().all(|c| c.is_ascii_hexdigit()),
            _ => false,
        };
        if !hash_ok {
            return Err(CacheServerError::InvalidRequest(format!(
                "Invalid nar file hash: {}",
                hash
            )));
        }

        let compression = Compression::from_extension(rest).ok_or_else(|| {
            CacheServerError::InvalidRequest(format!("Unknown nar extension: {}", rest))
        })?;

        Ok(Self {
            file_hash: hash.to_string(),
            compression,
        })
    }

    pub fn file_hash(&self) -> &str {
        &self.file_hash
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Storage key of the payload
    pub fn key(&self) -> String {
        format!("nar/{}", self.file_name())
    }

    pub fn file_name(&self) -> String {
        format!("{}.nar{}", self.file_hash, self.compression.extension())
    }

    /// Check that `bytes` hash to the file hash in the name
    pub fn verify(&self, bytes: &[u8]) -> Result<()> {
        let digest = Sha256::digest(bytes);
        let actual = if self.file_hash.len() == 64 {
            hex::encode(digest)
        } else {
            nix32::encode(&digest)
        };

        if actual != self.file_hash {
            return Err(CacheServerError::Corrupt(format!(
                "Payload hash {} does not match declared {}",
                actual, self.file_hash
            )));
        }
        Ok(())
    }
}

/// `sha256:<nix32>` digest of a byte string
pub fn sha256_nix32(bytes: &[u8]) -> String {
    format!("sha256:{}", nix32::encode(&Sha256::digest(bytes)))
}

/// Compare a narinfo `sha256:` hash with the value derived from a payload
pub fn same_sha256(declared: &str, bytes: &[u8]) -> bool {
    let digest = Sha256::digest(bytes);
    match declared.strip_prefix("sha256:") {
        Some(value) if value.len() == 64 => value.eq_ignore_ascii_case(&hex::encode(digest)),
        Some(value) => value == nix32::encode(&digest),
        None => false,
    }
}

/// Body of `/nix-cache-info`
pub fn cache_info(priority: u32) -> String {
    format!(
        "StoreDir: {}\nWantMassQuery: 1\nPriority: {}\n",
        STORE_DIR, priority
    )
}

/// Who may read from a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheAccess {
    #[default]
    Public,
    Private,
}
