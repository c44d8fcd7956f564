// Binary cache protocol handlers
//
// One router per cache instance, bound to the instance's port. Reads are
// open unless the cache is private; uploads always need the cache token.

use super::proxy::RemoteProxy;
use crate::cache::{CacheInstance, PutOutcome, UploadHandle};
use crate::crypto::is_authorized;
use crate::error::{CacheServerError, Result};
use crate::types::{cache_info, NarFile, NarInfo, StoreHash, NARINFO_CONTENT_TYPE};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use uuid::Uuid;

const CACHE_INFO_CONTENT_TYPE: &str = "text/x-nix-cache-info";
const NAR_CONTENT_TYPE: &str = "application/x-nix-nar";

/// Shared state of one instance router
pub struct CacheState {
    pub instance: Arc<CacheInstance>,
    /// Absent in standalone mode
    pub proxy: Option<RemoteProxy>,
    /// Other caches of this server, consulted on a local miss
    pub siblings: Vec<Arc<CacheInstance>>,
    pub max_upload_size: usize,
}

impl CacheState {
    fn remote(&self, headers: &HeaderMap) -> Option<&RemoteProxy> {
        if RemoteProxy::is_forwarded(headers) {
            return None;
        }
        self.proxy.as_ref()
    }

    /// Public siblings only; a private cache never answers for another
    fn siblings(&self) -> impl Iterator<Item = &Arc<CacheInstance>> {
        self.siblings
            .iter()
            .filter(|sibling| sibling.is_public() && sibling.name != self.instance.name)
    }

    async fn sibling_narinfo(&self, hash: &StoreHash) -> Option<NarInfo> {
        for sibling in self.siblings() {
            match sibling.store.get_narinfo(hash).await {
                Ok(info) => {
                    debug!("Found {} in cache {}", hash, sibling.name);
                    return Some(info);
                }
                Err(CacheServerError::NotFound(_)) => {}
                Err(e) => warn!("Lookup of {} in cache {} failed: {}", hash, sibling.name, e),
            }
        }
        None
    }

    async fn sibling_has_narinfo(&self, hash: &StoreHash) -> bool {
        for sibling in self.siblings() {
            match sibling.store.exists(hash).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!("Lookup of {} in cache {} failed: {}", hash, sibling.name, e),
            }
        }
        false
    }

    async fn sibling_payload(&self, file: &NarFile) -> Option<Bytes> {
        for sibling in self.siblings() {
            match sibling.store.get_payload(file).await {
                Ok(body) => return Some(body),
                Err(CacheServerError::NotFound(_)) => {}
                Err(e) => warn!("Read of {} from cache {} failed: {}", file.key(), sibling.name, e),
            }
        }
        None
    }

    async fn sibling_has_payload(&self, file: &NarFile) -> bool {
        for sibling in self.siblings() {
            match sibling.store.payload_exists(file).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!("Lookup of {} in cache {} failed: {}", file.key(), sibling.name, e),
            }
        }
        false
    }
}

/// Query of a multipart part upload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartQuery {
    pub upload_id: Uuid,
    #[serde(default = "first_part")]
    pub part_number: u32,
}

fn first_part() -> u32 {
    1
}

/// Router implementing the binary cache HTTP contract
pub fn cache_router(state: Arc<CacheState>) -> Router {
    let limit = state.max_upload_size;
    Router::new()
        .route("/nix-cache-info", get(get_cache_info))
        .route("/nar/:file", get(get_nar).put(put_nar))
        .route("/:file", get(get_narinfo).put(put_file))
        .layer(DefaultBodyLimit::max(limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn authorize_read(instance: &CacheInstance, headers: &HeaderMap) -> Result<()> {
    if instance.is_public() || is_authorized(headers, &instance.token) {
        Ok(())
    } else {
        Err(CacheServerError::Unauthorized(format!(
            "Cache {} is private",
            instance.name
        )))
    }
}

fn authorize_write(instance: &CacheInstance, headers: &HeaderMap) -> Result<()> {
    if is_authorized(headers, &instance.token) {
        Ok(())
    } else {
        Err(CacheServerError::Unauthorized(format!(
            "Upload to cache {} needs its token",
            instance.name
        )))
    }
}

fn narinfo_response(info: &NarInfo) -> Response {
    ([(header::CONTENT_TYPE, NARINFO_CONTENT_TYPE)], info.to_string()).into_response()
}

fn nar_response(body: Bytes) -> Response {
    ([(header::CONTENT_TYPE, NAR_CONTENT_TYPE)], body).into_response()
}

fn upload_response(outcome: PutOutcome) -> Response {
    match outcome {
        PutOutcome::Stored => StatusCode::CREATED.into_response(),
        PutOutcome::AlreadyPresent => StatusCode::OK.into_response(),
    }
}

async fn get_cache_info(State(state): State<Arc<CacheState>>) -> Response {
    (
        [(header::CONTENT_TYPE, CACHE_INFO_CONTENT_TYPE)],
        cache_info(state.instance.priority),
    )
        .into_response()
}

async fn get_narinfo(
    State(state): State<Arc<CacheState>>,
    method: Method,
    headers: HeaderMap,
    Path(file): Path<String>,
) -> Result<Response> {
    let started = Instant::now();
    let instance = &state.instance;
    authorize_read(instance, &headers)?;
    let hash = StoreHash::from_narinfo_file(&file)?;

    if method == Method::HEAD {
        if instance.store.exists(&hash).await? {
            instance.metrics.record(true, false, started.elapsed());
            return Ok(StatusCode::OK.into_response());
        }
        if state.sibling_has_narinfo(&hash).await {
            instance.metrics.record(true, true, started.elapsed());
            return Ok(StatusCode::OK.into_response());
        }
    } else {
        match instance.store.get_narinfo(&hash).await {
            Ok(info) => {
                instance.metrics.record(true, false, started.elapsed());
                return Ok(narinfo_response(&info));
            }
            Err(CacheServerError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        if let Some(mut info) = state.sibling_narinfo(&hash).await {
            instance.store.signer().sign_narinfo(&mut info);
            instance.metrics.record(true, true, started.elapsed());
            return Ok(narinfo_response(&info));
        }
    }

    if let Some(proxy) = state.remote(&headers) {
        if let Some(mut info) = proxy.narinfo(&instance.name, &hash, &headers).await {
            instance.store.signer().sign_narinfo(&mut info);
            instance.metrics.record(true, true, started.elapsed());
            debug!("Served {} from a remote node", hash);
            return Ok(narinfo_response(&info));
        }
    }

    instance.metrics.record(false, false, started.elapsed());
    Err(CacheServerError::NotFound(hash.narinfo_key()))
}

/// Narinfo upload, or one part of a multipart upload named by its id
async fn put_file(
    State(state): State<Arc<CacheState>>,
    headers: HeaderMap,
    Path(file): Path<String>,
    query: Option<Query<PartQuery>>,
    body: Bytes,
) -> Result<Response> {
    match Uuid::parse_str(&file) {
        Ok(nar_id) => put_part(&state, nar_id, query.map(|Query(q)| q), body),
        Err(_) => put_narinfo(&state, &headers, &file, body).await,
    }
}

/// The upload id in the query authorizes the part
fn put_part(state: &CacheState, nar_id: Uuid, query: Option<PartQuery>, body: Bytes) -> Result<Response> {
    let query = query.ok_or_else(|| {
        CacheServerError::InvalidRequest(format!("Part of {} without uploadId", nar_id))
    })?;
    let handle = UploadHandle {
        nar_id,
        upload_id: query.upload_id,
    };
    let etag = state
        .instance
        .store
        .uploads()
        .put_part(handle, query.part_number, body)?;
    Ok((StatusCode::OK, [(header::ETAG, etag)]).into_response())
}

async fn put_narinfo(state: &CacheState, headers: &HeaderMap, file: &str, body: Bytes) -> Result<Response> {
    let instance = &state.instance;
    authorize_write(instance, headers)?;
    let hash = StoreHash::from_narinfo_file(file)?;

    let text = std::str::from_utf8(&body)
        .map_err(|_| CacheServerError::InvalidRequest("Narinfo is not UTF-8".to_string()))?;
    let info = NarInfo::parse(text)?;

    let outcome = instance.store.commit_narinfo(&hash, info).await?;
    Ok(upload_response(outcome))
}

async fn get_nar(
    State(state): State<Arc<CacheState>>,
    method: Method,
    headers: HeaderMap,
    Path(file): Path<String>,
) -> Result<Response> {
    let started = Instant::now();
    let instance = &state.instance;
    authorize_read(instance, &headers)?;
    let file = NarFile::parse(&file)?;

    if method == Method::HEAD {
        if instance.store.payload_exists(&file).await? {
            instance.metrics.record(true, false, started.elapsed());
            return Ok(StatusCode::OK.into_response());
        }
        if state.sibling_has_payload(&file).await {
            instance.metrics.record(true, true, started.elapsed());
            return Ok(StatusCode::OK.into_response());
        }
    } else {
        match instance.store.get_payload(&file).await {
            Ok(body) => {
                instance.metrics.record(true, false, started.elapsed());
                return Ok(nar_response(body));
            }
            Err(CacheServerError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        if let Some(body) = state.sibling_payload(&file).await {
            instance.metrics.record(true, true, started.elapsed());
            return Ok(nar_response(body));
        }
    }

    if let Some(proxy) = state.remote(&headers) {
        if let Some(body) = proxy.nar(&instance.name, &file, &headers).await {
            instance.metrics.record(true, true, started.elapsed());
            return Ok(nar_response(body));
        }
    }

    instance.metrics.record(false, false, started.elapsed());
    Err(CacheServerError::NotFound(file.key()))
}

async fn put_nar(
    State(state): State<Arc<CacheState>>,
    headers: HeaderMap,
    Path(file): Path<String>,
    body: Bytes,
) -> Result<Response> {
    let instance = &state.instance;
    authorize_write(instance, &headers)?;
    let file = NarFile::parse(&file)?;

    let outcome = instance.store.stage_payload(&file, body).await?;
    Ok(upload_response(outcome))
}
