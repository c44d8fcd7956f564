// Configuration module for the cache server
//
// This module loads the YAML configuration, applies defaults and validates
// it before any listener is bound.

use crate::crypto::NarinfoSigner;
use crate::error::{CacheServerError, Result};
use crate::storage::strategy::{validate_split_weights, StorageStrategy};
use crate::types::CacheAccess;
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cache server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Process wide settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Cache instances served by this process
    #[serde(default)]
    pub caches: Vec<CacheConfig>,
    /// Deploy relay workspaces, validated only
    #[serde(default)]
    pub workspaces: Vec<WorkspaceConfig>,
    /// Deploy relay agents, validated only
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// Server block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Directory for generated keys and local state
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// SQLite index path
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Host name other nodes and clients use to reach us
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Interface every listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Disable the DHT entirely
    #[serde(default)]
    pub standalone: bool,
    #[serde(default = "default_dht_port")]
    pub dht_port: u16,
    #[serde(default = "default_hostname")]
    pub dht_bootstrap_host: String,
    #[serde(default = "default_dht_bootstrap_port")]
    pub dht_bootstrap_port: u16,
    /// Port of the server wide API
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Port reserved for the deploy relay
    #[serde(default = "default_deploy_port")]
    pub deploy_port: u16,
    /// Default signing key in Nix secret key format
    #[serde(default)]
    pub key: String,
    /// Retention in days for caches that do not set one; 0 keeps forever
    #[serde(default = "default_retention")]
    pub default_retention: u32,
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default)]
    pub default_storage_strategy: StorageStrategy,
    /// Retention sweep interval in seconds
    #[serde(default = "default_gc_interval")]
    pub gc_interval: u64,
    /// Timeout for DHT lookups and proxied fetches in milliseconds
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout: u64,
    /// DHT republish interval in seconds
    #[serde(default = "default_announce_interval")]
    pub announce_interval: u64,
    /// Largest accepted upload body in bytes
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: usize,
}

/// One cache instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    pub name: String,
    /// Upload token; generated and stored in the index when absent
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub retention: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub access: CacheAccess,
    #[serde(default)]
    pub storage_strategy: Option<StorageStrategy>,
    /// Signing key in Nix secret key format
    #[serde(default)]
    pub signing_key: Option<String>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub storages: Vec<StorageConfig>,
}

/// Backend media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    S3,
}

/// One storage backend of a cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StorageKind,
    /// Directory for local storage, key prefix for S3
    #[serde(default)]
    pub root: Option<String>,
    /// Percentage of writes for the split strategy
    #[serde(default)]
    pub split: Option<u8>,
    /// Byte ceiling used by in-order and least-used
    #[serde(default)]
    pub quota: Option<u64>,
    #[serde(default)]
    pub s3_bucket: Option<String>,
    #[serde(default)]
    pub s3_region: Option<String>,
    #[serde(default)]
    pub s3_access_key: Option<String>,
    #[serde(default)]
    pub s3_secret_key: Option<String>,
    /// Endpoint of an S3 compatible service
    #[serde(default)]
    pub s3_endpoint: Option<String>,
}

/// Deploy relay workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub name: String,
    pub cache: String,
}

/// Deploy relay agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub workspace: String,
}

// Default values
fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/cache-server")
}

fn default_database() -> PathBuf {
    PathBuf::from("/var/lib/cache-server/db.sqlite")
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_dht_port() -> u16 {
    4222
}

fn default_dht_bootstrap_port() -> u16 {
    4223
}

fn default_server_port() -> u16 {
    5000
}

fn default_deploy_port() -> u16 {
    5001
}

fn default_retention() -> u32 {
    4
}

fn default_port() -> u16 {
    8080
}

fn default_gc_interval() -> u64 {
    3600
}

fn default_remote_timeout() -> u64 {
    5000
}

fn default_announce_interval() -> u64 {
    600
}

fn default_max_upload_size() -> usize {
    1024 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            database: default_database(),
            hostname: default_hostname(),
            bind_address: default_bind_address(),
            standalone: false,
            dht_port: default_dht_port(),
            dht_bootstrap_host: default_hostname(),
            dht_bootstrap_port: default_dht_bootstrap_port(),
            server_port: default_server_port(),
            deploy_port: default_deploy_port(),
            key: String::new(),
            default_retention: default_retention(),
            default_port: default_port(),
            default_storage_strategy: StorageStrategy::default(),
            gc_interval: default_gc_interval(),
            remote_timeout: default_remote_timeout(),
            announce_interval: default_announce_interval(),
            max_upload_size: default_max_upload_size(),
        }
    }
}

impl ServerConfig {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval.max(1))
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval.max(1))
    }

    /// Whether the bootstrap address is our own DHT listener
    pub fn is_bootstrap_self(&self) -> bool {
        self.dht_bootstrap_host == self.hostname && self.dht_bootstrap_port == self.dht_port
    }
}

impl CacheConfig {
    pub fn retention_days(&self, server: &ServerConfig) -> u32 {
        self.retention.unwrap_or(server.default_retention)
    }

    pub fn port(&self, server: &ServerConfig) -> u16 {
        self.port.unwrap_or(server.default_port)
    }

    pub fn strategy(&self, server: &ServerConfig) -> StorageStrategy {
        self.storage_strategy
            .unwrap_or(server.default_storage_strategy)
    }
}

impl Config {
    /// Load and validate configuration from a YAML file
    ///
    /// Values can be overridden with `CACHE_SERVER__<SECTION>__<KEY>`
    /// environment variables.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml).required(true))
            .add_source(Environment::with_prefix("CACHE_SERVER").separator("__"))
            .build()
            .map_err(|e| {
                CacheServerError::ConfigInvalid(format!(
                    "Failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(File::from_str(text, FileFormat::Yaml))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the whole configuration, reporting every problem at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if !self.server.key.is_empty() {
            if let Err(e) = NarinfoSigner::from_nix_secret(&self.server.key) {
                errors.push(format!("Server 'key': {}", e));
            }
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        ports.insert(self.server.server_port);
        if !self.server.standalone {
            ports.insert(self.server.dht_port);
        }

        for (i, cache) in self.caches.iter().enumerate() {
            if cache.name.is_empty()
                || !cache
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                errors.push(format!("Cache at index {} has an invalid name '{}'", i, cache.name));
            }
            if !names.insert(cache.name.as_str()) {
                errors.push(format!("Duplicate cache name: {}", cache.name));
            }

            // Port 0 binds an ephemeral port and never collides
            let port = cache.port(&self.server);
            if port != 0 && !ports.insert(port) {
                errors.push(format!("Cache '{}': port {} is already in use", cache.name, port));
            }

            if let Some(key) = &cache.signing_key {
                if let Err(e) = NarinfoSigner::from_nix_secret(key) {
                    errors.push(format!("Cache '{}': signing-key: {}", cache.name, e));
                }
            }

            self.validate_storages(cache, &mut errors);
        }

        let workspace_names: HashSet<&str> =
            self.workspaces.iter().map(|w| w.name.as_str()).collect();
        for workspace in &self.workspaces {
            if !names.contains(workspace.cache.as_str()) {
                errors.push(format!(
                    "Workspace '{}' references unknown cache '{}'",
                    workspace.name, workspace.cache
                ));
            }
        }
        for agent in &self.agents {
            if !workspace_names.contains(agent.workspace.as_str()) {
                errors.push(format!(
                    "Agent '{}' references unknown workspace '{}'",
                    agent.name, agent.workspace
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CacheServerError::ConfigInvalid(errors.join("; ")))
        }
    }

    fn validate_storages(&self, cache: &CacheConfig, errors: &mut Vec<String>) {
        if cache.storages.is_empty() {
            errors.push(format!("Cache '{}' has no storages", cache.name));
            return;
        }

        let mut storage_names = HashSet::new();
        for storage in &cache.storages {
            if !storage_names.insert(storage.name.as_str()) {
                errors.push(format!(
                    "Cache '{}': Duplicate storage name: {}",
                    cache.name, storage.name
                ));
            }

            for field in storage.missing_fields() {
                errors.push(format!(
                    "Cache '{}': Storage '{}' is missing required configuration '{}'",
                    cache.name, storage.name, field
                ));
            }
        }

        if cache.strategy(&self.server) == StorageStrategy::Split {
            let weights: Vec<Option<u8>> = cache.storages.iter().map(|s| s.split).collect();
            if let Err(e) = validate_split_weights(&weights) {
                errors.push(format!("Cache '{}': {}", cache.name, e));
            }
        }
    }
}

impl StorageConfig {
    /// Required fields for this storage type that are not set
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.root.is_none() {
            missing.push("root");
        }
        if self.kind == StorageKind::S3 {
            if self.s3_bucket.is_none() {
                missing.push("s3_bucket");
            }
            if self.s3_region.is_none() {
                missing.push("s3_region");
            }
            if self.s3_access_key.is_none() {
                missing.push("s3_access_key");
            }
            if self.s3_secret_key.is_none() {
                missing.push("s3_secret_key");
            }
        }
        missing
    }
}
