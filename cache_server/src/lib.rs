// Cache Server Library
//
// A self-hostable Nix binary cache with pluggable storage backends,
// retention sweeping and DHT based discovery of peer nodes serving the
// same cache.

pub mod api;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod network;
pub mod runtime;
pub mod storage;
pub mod types;

pub use error::{CacheServerError, Result};
pub use runtime::CacheServer;
