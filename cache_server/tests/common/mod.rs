#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use cache_server::api::{cache_router, CacheState};
use cache_server::cache::{CacheInstance, CacheRegistry};
use cache_server::config::Config;
use cache_server::storage::ArtifactIndex;
use cache_server::types::{nix32, sha256_nix32, NarInfo, StoreHash};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;

pub const TOKEN: &str = "upload-secret";

/// An upload: narinfo plus the payload it points at
pub struct Artifact {
    pub hash: StoreHash,
    pub info: NarInfo,
    pub payload: Vec<u8>,
}

impl Artifact {
    pub fn new(seed: &str, payload: Vec<u8>) -> Self {
        let hash = StoreHash::parse(&nix32::encode(&Sha256::digest(seed.as_bytes())[..20])).unwrap();
        let file_hash = nix32::encode(&Sha256::digest(&payload));
        let mut info = NarInfo::new(
            format!("/nix/store/{}-{}", hash, seed),
            format!("nar/{}.nar", file_hash),
            sha256_nix32(&payload),
            payload.len() as u64,
        );
        info.file_hash = Some(format!("sha256:{}", file_hash));
        info.file_size = Some(payload.len() as u64);
        Self { hash, info, payload }
    }

    /// Distinct pseudo random payload of `size` bytes
    pub fn sized(seed: &str, size: usize) -> Self {
        let mut payload = Vec::with_capacity(size);
        let mut block = Sha256::digest(seed.as_bytes());
        while payload.len() < size {
            payload.extend_from_slice(&block);
            block = Sha256::digest(block);
        }
        payload.truncate(size);
        Self::new(seed, payload)
    }

    pub fn narinfo_path(&self) -> String {
        format!("/{}", self.hash.narinfo_key())
    }

    pub fn nar_path(&self) -> String {
        format!("/{}", self.info.url)
    }
}

/// Config with one public cache `main` over the given storages block
pub fn config(root: &Path, cache_extra: &str, storages: &str) -> Config {
    let yaml = format!(
        r#"
server:
  cache-dir: {root}/state
  database: {root}/db.sqlite
  hostname: 127.0.0.1
  standalone: true
caches:
  - name: main
    token: {token}
{cache_extra}
    storages:
{storages}
"#,
        root = root.display(),
        token = TOKEN,
        cache_extra = cache_extra,
        storages = storages,
    );
    Config::from_yaml(&yaml).unwrap()
}

pub fn local_storage(root: &Path, name: &str) -> String {
    format!(
        "      - name: {name}\n        type: local\n        root: {root}/{name}\n",
        name = name,
        root = root.display()
    )
}

pub async fn instance(config: &Config) -> Arc<CacheInstance> {
    let index = ArtifactIndex::open(&config.server.database).unwrap();
    let registry = CacheRegistry::from_config(&config.caches, &config.server, &index)
        .await
        .unwrap();
    registry.get("main").unwrap()
}

pub fn router(instance: Arc<CacheInstance>) -> Router {
    router_with_siblings(instance, Vec::new())
}

/// Router that falls back to other caches of the same server
pub fn router_with_siblings(instance: Arc<CacheInstance>, siblings: Vec<Arc<CacheInstance>>) -> Router {
    cache_router(Arc::new(CacheState {
        instance,
        proxy: None,
        siblings,
        max_upload_size: 64 * 1024 * 1024,
    }))
}

pub async fn registry(config: &Config) -> Arc<CacheRegistry> {
    let index = ArtifactIndex::open(&config.server.database).unwrap();
    Arc::new(
        CacheRegistry::from_config(&config.caches, &config.server, &index)
            .await
            .unwrap(),
    )
}

pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, body.to_vec())
}

pub async fn get(router: &Router, path: &str, token: Option<&str>) -> (StatusCode, Vec<u8>) {
    let mut request = Request::builder().method("GET").uri(path);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    send(router, request.body(Body::empty()).unwrap()).await
}

pub async fn head(router: &Router, path: &str) -> StatusCode {
    let request = Request::builder().method("HEAD").uri(path);
    send(router, request.body(Body::empty()).unwrap()).await.0
}

pub async fn post_json(router: &Router, path: &str, token: Option<&str>, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
    let mut request = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    send(router, request.body(Body::from(body.to_string())).unwrap()).await
}

pub async fn put(router: &Router, path: &str, token: Option<&str>, body: Vec<u8>) -> StatusCode {
    let mut request = Request::builder().method("PUT").uri(path);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    send(router, request.body(Body::from(body)).unwrap()).await.0
}

/// Upload payload then narinfo, returning both statuses
pub async fn upload(router: &Router, artifact: &Artifact) -> (StatusCode, StatusCode) {
    let nar = put(router, &artifact.nar_path(), Some(TOKEN), artifact.payload.clone()).await;
    let narinfo = put(
        router,
        &artifact.narinfo_path(),
        Some(TOKEN),
        artifact.info.to_string().into_bytes(),
    )
    .await;
    (nar, narinfo)
}
