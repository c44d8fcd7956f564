// Remote proxy
//
// On a local miss, fetches the document from another node serving the same
// cache instance. Forwarded requests carry a marker header and are never
// forwarded again.

use crate::error::Result;
use crate::network::{DiscoveryNode, RemoteLookup};
use crate::types::{NarFile, NarInfo, StoreHash};
use axum::http::{header, HeaderMap};
use bytes::Bytes;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Marks a request as already proxied by a peer
pub const FORWARDED_HEADER: &str = "x-cache-server-forwarded";

pub struct RemoteProxy {
    discovery: Arc<DiscoveryNode>,
    client: reqwest::Client,
    timeout: Duration,
}

impl RemoteProxy {
    pub fn new(discovery: Arc<DiscoveryNode>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            discovery,
            client,
            timeout,
        })
    }

    /// Whether `headers` belong to a request a peer already forwarded
    pub fn is_forwarded(headers: &HeaderMap) -> bool {
        headers.contains_key(FORWARDED_HEADER)
    }

    async fn locate(&self, cache: &str) -> Option<Url> {
        match self.discovery.resolve(cache).await {
            RemoteLookup::Found(announcement) => match Url::parse(&announcement.base_url()) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("Ignoring announcement with bad address {}: {}", announcement.address, e);
                    None
                }
            },
            RemoteLookup::NotFound => None,
            RemoteLookup::Degraded => {
                debug!("Discovery degraded, serving local miss for {}", cache);
                None
            }
        }
    }

    /// GET `path` from the node serving `cache`, `None` on any miss
    async fn fetch(&self, cache: &str, path: &str, headers: &HeaderMap) -> Option<Bytes> {
        // Discovery and transfer share one bound
        match tokio::time::timeout(self.timeout, self.fetch_unbounded(cache, path, headers)).await {
            Ok(body) => body,
            Err(_) => {
                warn!("Proxy fetch of {} for cache {} timed out", path, cache);
                None
            }
        }
    }

    async fn fetch_unbounded(&self, cache: &str, path: &str, headers: &HeaderMap) -> Option<Bytes> {
        let base = self.locate(cache).await?;
        let url = base.join(path).ok()?;

        let mut request = self.client.get(url.clone()).header(FORWARDED_HEADER, "1");
        if let Some(auth) = headers.get(header::AUTHORIZATION) {
            request = request.header(header::AUTHORIZATION, auth.clone());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Proxy request to {} failed: {}", url, e);
                return None;
            }
        };

        match response.status() {
            StatusCode::OK => match response.bytes().await {
                Ok(body) => Some(body),
                Err(e) => {
                    warn!("Proxy body from {} failed: {}", url, e);
                    None
                }
            },
            StatusCode::NOT_FOUND => None,
            status => {
                debug!("Remote {} answered {}", url, status);
                None
            }
        }
    }

    /// Narinfo for `hash` from a remote node, unsigned by us
    pub async fn narinfo(&self, cache: &str, hash: &StoreHash, headers: &HeaderMap) -> Option<NarInfo> {
        let body = self.fetch(cache, &hash.narinfo_key(), headers).await?;
        let text = String::from_utf8(body.to_vec()).ok()?;
        match NarInfo::parse(&text) {
            Ok(info) if info.store_hash().ok().as_ref() == Some(hash) => Some(info),
            Ok(info) => {
                warn!("Remote narinfo for {} describes {}", hash, info.store_path);
                None
            }
            Err(e) => {
                warn!("Remote narinfo for {} is invalid: {}", hash, e);
                None
            }
        }
    }

    /// Payload from a remote node, checked against its file hash
    pub async fn nar(&self, cache: &str, file: &NarFile, headers: &HeaderMap) -> Option<Bytes> {
        let body = self.fetch(cache, &file.key(), headers).await?;
        match file.verify(&body) {
            Ok(()) => Some(body),
            Err(e) => {
                warn!("Discarding remote payload {}: {}", file.file_name(), e);
                None
            }
        }
    }
}
