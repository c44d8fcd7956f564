// Narinfo metadata documents
//
// A narinfo is a `Key: value` line document. Known keys are kept in typed
// fields and re-emitted in canonical order; unknown keys are carried through
// untouched after them.

use super::{Compression, StoreHash, STORE_DIR};
use crate::error::{CacheServerError, Result};
use std::fmt;

/// Content type served for narinfo documents
pub const NARINFO_CONTENT_TYPE: &str = "text/x-nix-narinfo";

/// Parsed narinfo document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarInfo {
    pub store_path: String,
    pub url: String,
    pub compression: Compression,
    pub file_hash: Option<String>,
    pub file_size: Option<u64>,
    pub nar_hash: String,
    pub nar_size: u64,
    /// Reference basenames, as written on the References line
    pub references: Vec<String>,
    pub deriver: Option<String>,
    pub system: Option<String>,
    pub sigs: Vec<String>,
    pub ca: Option<String>,
    extra: Vec<(String, String)>,
}

impl NarInfo {
    /// Start a document for a store path and its payload location
    pub fn new(store_path: impl Into<String>, url: impl Into<String>, nar_hash: impl Into<String>, nar_size: u64) -> Self {
        Self {
            store_path: store_path.into(),
            url: url.into(),
            compression: Compression::None,
            file_hash: None,
            file_size: None,
            nar_hash: nar_hash.into(),
            nar_size,
            references: Vec::new(),
            deriver: None,
            system: None,
            sigs: Vec::new(),
            ca: None,
            extra: Vec::new(),
        }
    }

    /// Parse a narinfo document
    pub fn parse(text: &str) -> Result<Self> {
        let mut store_path = None;
        let mut url = None;
        let mut compression = None;
        let mut file_hash = None;
        let mut file_size = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = Vec::new();
        let mut deriver = None;
        let mut system = None;
        let mut sigs = Vec::new();
        let mut ca = None;
        let mut extra = Vec::new();

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }

            let (key, value) = line.split_once(':').ok_or_else(|| {
                CacheServerError::InvalidRequest(format!("Malformed narinfo line: {}", line))
            })?;
            let value = value.trim().to_string();

            match key.trim() {
                "StorePath" => store_path = Some(value),
                "URL" => url = Some(value),
                "Compression" => compression = Some(value.parse::<Compression>()?),
                "FileHash" => file_hash = Some(value),
                "FileSize" => file_size = Some(parse_size("FileSize", &value)?),
                "NarHash" => nar_hash = Some(value),
                "NarSize" => nar_size = Some(parse_size("NarSize", &value)?),
                "References" => {
                    references = value.split_whitespace().map(str::to_string).collect();
                }
                "Deriver" if !value.is_empty() => deriver = Some(value),
                "Deriver" => {}
                "System" => system = Some(value),
                "Sig" => sigs.push(value),
                "CA" => ca = Some(value),
                other => extra.push((other.to_string(), value)),
            }
        }

        let missing = |field: &str| CacheServerError::InvalidRequest(format!("Narinfo is missing {}", field));

        let info = Self {
            store_path: store_path.ok_or_else(|| missing("StorePath"))?,
            url: url.ok_or_else(|| missing("URL"))?,
            compression: compression.unwrap_or(Compression::Bzip2),
            file_hash,
            file_size,
            nar_hash: nar_hash.ok_or_else(|| missing("NarHash"))?,
            nar_size: nar_size.ok_or_else(|| missing("NarSize"))?,
            references,
            deriver,
            system,
            sigs,
            ca,
            extra,
        };

        info.store_hash()?;
        Ok(info)
    }

    /// Hash component of the store path
    pub fn store_hash(&self) -> Result<StoreHash> {
        let base = self
            .store_path
            .strip_prefix(STORE_DIR)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                CacheServerError::InvalidRequest(format!(
                    "Store path {} is outside {}",
                    self.store_path, STORE_DIR
                ))
            })?;

        let hash = base.split('-').next().unwrap_or_default();
        StoreHash::parse(hash)
    }

    /// Payload file name referenced by the URL field, without the `nar/` prefix
    pub fn nar_file(&self) -> Result<&str> {
        self.url
            .strip_prefix("nar/")
            .filter(|file| !file.is_empty() && !file.contains('/'))
            .ok_or_else(|| {
                CacheServerError::InvalidRequest(format!("Unsupported narinfo URL: {}", self.url))
            })
    }

    /// Signature fingerprint: `1;<path>;<narhash>;<narsize>;<refs>`
    pub fn fingerprint(&self) -> String {
        let refs = self
            .references
            .iter()
            .map(|r| format!("{}/{}", STORE_DIR, r))
            .collect::<Vec<_>>()
            .join(",");

        format!(
            "1;{};{};{};{}",
            self.store_path, self.nar_hash, self.nar_size, refs
        )
    }
}

fn parse_size(field: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| CacheServerError::InvalidRequest(format!("Invalid {}: {}", field, value)))
}

impl fmt::Display for NarInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StorePath: {}", self.store_path)?;
        writeln!(f, "URL: {}", self.url)?;
        writeln!(f, "Compression: {}", self.compression)?;
        if let Some(file_hash) = &self.file_hash {
            writeln!(f, "FileHash: {}", file_hash)?;
        }
        if let Some(file_size) = self.file_size {
            writeln!(f, "FileSize: {}", file_size)?;
        }
        writeln!(f, "NarHash: {}", self.nar_hash)?;
        writeln!(f, "NarSize: {}", self.nar_size)?;
        writeln!(f, "References: {}", self.references.join(" "))?;
        if let Some(deriver) = &self.deriver {
            writeln!(f, "Deriver: {}", deriver)?;
        }
        if let Some(system) = &self.system {
            writeln!(f, "System: {}", system)?;
        }
        for sig in &self.sigs {
            writeln!(f, "Sig: {}", sig)?;
        }
        if let Some(ca) = &self.ca {
            writeln!(f, "CA: {}", ca)?;
        }
        for (key, value) in &self.extra {
            writeln!(f, "{}: {}", key, value)?;
        }
        Ok(())
    }
}
