// Server wide API
//
// Cachix compatible cache metadata, multipart uploads, health and stats,
// served on the server port for every instance.

use super::cache::PartQuery;
use crate::cache::{CacheInstance, CacheRegistry, CompletedPart, MetricsSnapshot, NarInfoCreate, PutOutcome, UploadHandle};
use crate::crypto::is_authorized;
use crate::error::{CacheServerError, Result};
use crate::storage::BackendUsage;
use crate::types::Compression;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

pub struct ServerState {
    pub registry: Arc<CacheRegistry>,
    /// Host name used in advertised cache URIs
    pub hostname: String,
    /// Ports the cache listeners actually bound, by cache name
    pub ports: BTreeMap<String, u16>,
}

impl ServerState {
    fn instance(&self, name: &str) -> Result<Arc<CacheInstance>> {
        self.registry
            .get(name)
            .ok_or_else(|| CacheServerError::NotFound(format!("Cache {} does not exist", name)))
    }

    fn cache_uri(&self, instance: &CacheInstance) -> String {
        let port = self.ports.get(&instance.name).copied().unwrap_or(instance.port);
        format!("http://{}:{}", self.hostname, port)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheDetails {
    pub name: String,
    pub uri: String,
    pub is_public: bool,
    pub permission: String,
    pub preferred_compression_method: String,
    pub public_signing_keys: Vec<String>,
    pub github_username: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartCreated {
    pub nar_id: Uuid,
    pub upload_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUrl {
    pub upload_url: String,
}

#[derive(Debug, Deserialize)]
struct CreateQuery {
    compression: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    upload_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteRequest {
    #[serde(default)]
    parts: Vec<CompletedPart>,
    nar_info_create: NarInfoCreate,
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub cache: String,
    pub artifacts: u64,
    pub metrics: MetricsSnapshot,
    pub backends: Vec<BackendUsage>,
}

pub fn server_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/cache/:name", get(cache_details))
        .route("/api/v1/cache/:name/narinfo", post(missing_narinfo))
        .route("/api/v1/cache/:name/stats", get(cache_stats))
        .route("/api/v1/cache/:name/multipart-nar", post(create_multipart))
        .route("/api/v1/cache/:name/multipart-nar/:nar_id", post(part_url))
        .route("/api/v1/cache/:name/multipart-nar/:nar_id/complete", post(complete_multipart))
        .route("/api/v1/cache/:name/multipart-nar/:nar_id/abort", post(abort_multipart))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

fn require_read(instance: &CacheInstance, headers: &HeaderMap) -> Result<()> {
    if instance.is_public() || is_authorized(headers, &instance.token) {
        Ok(())
    } else {
        Err(CacheServerError::Unauthorized(format!(
            "Cache {} is private",
            instance.name
        )))
    }
}

async fn cache_details(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<CacheDetails>> {
    let instance = state.instance(&name)?;
    require_read(&instance, &headers)?;

    let permission = if is_authorized(&headers, &instance.token) {
        "Write"
    } else {
        "Read"
    };

    Ok(Json(CacheDetails {
        name: instance.name.clone(),
        uri: state.cache_uri(&instance),
        is_public: instance.is_public(),
        permission: permission.to_string(),
        preferred_compression_method: "XZ".to_string(),
        public_signing_keys: vec![instance.store.signer().public_key()],
        github_username: String::new(),
    }))
}

fn require_write(instance: &CacheInstance, headers: &HeaderMap) -> Result<()> {
    if is_authorized(headers, &instance.token) {
        Ok(())
    } else {
        Err(CacheServerError::Unauthorized(format!(
            "Cache {} needs its token",
            instance.name
        )))
    }
}

async fn missing_narinfo(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(hashes): Json<Vec<String>>,
) -> Result<Json<Vec<String>>> {
    let instance = state.instance(&name)?;
    require_write(&instance, &headers)?;

    let missing = instance.store.missing(hashes).await?;
    Ok(Json(missing))
}

async fn cache_stats(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<CacheStats>> {
    let instance = state.instance(&name)?;
    require_read(&instance, &headers)?;

    Ok(Json(CacheStats {
        cache: instance.name.clone(),
        artifacts: instance.store.index().count(&instance.name).await?,
        metrics: instance.metrics.snapshot(),
        backends: instance.store.engine().usage(),
    }))
}

/// Compression names Cachix clients send; xz when omitted
fn upload_compression(name: Option<&str>) -> Result<Compression> {
    match name.unwrap_or("xz") {
        "zst" => Ok(Compression::Zstd),
        "bz2" => Ok(Compression::Bzip2),
        other => other.parse(),
    }
}

async fn create_multipart(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(query): Query<CreateQuery>,
) -> Result<Json<MultipartCreated>> {
    let instance = state.instance(&name)?;
    require_write(&instance, &headers)?;

    let compression = upload_compression(query.compression.as_deref())?;
    let handle = instance.store.uploads().create(compression);
    Ok(Json(MultipartCreated {
        nar_id: handle.nar_id,
        upload_id: handle.upload_id,
    }))
}

async fn part_url(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path((name, nar_id)): Path<(String, Uuid)>,
    Query(query): Query<PartQuery>,
) -> Result<Json<PartUrl>> {
    let instance = state.instance(&name)?;
    require_write(&instance, &headers)?;

    if !instance.store.uploads().is_open(&nar_id, &query.upload_id) {
        return Err(CacheServerError::NotFound(format!(
            "Multipart upload {} is not open",
            nar_id
        )));
    }

    Ok(Json(PartUrl {
        upload_url: format!(
            "{}/{}?uploadId={}&partNumber={}",
            state.cache_uri(&instance),
            nar_id,
            query.upload_id,
            query.part_number
        ),
    }))
}

async fn complete_multipart(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path((name, nar_id)): Path<(String, Uuid)>,
    Query(query): Query<SessionQuery>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<serde_json::Value>> {
    let instance = state.instance(&name)?;
    require_write(&instance, &headers)?;

    let handle = UploadHandle {
        nar_id,
        upload_id: query.upload_id,
    };
    let upload = instance.store.uploads().complete(handle, &request.parts)?;
    let (hash, narinfo) = request.nar_info_create.into_narinfo(upload.compression)?;
    let store_path = narinfo.store_path.clone();

    let outcome = instance.store.put(&hash, narinfo, upload.payload).await?;
    if outcome == PutOutcome::Stored {
        info!("Multipart upload {} committed {}", nar_id, store_path);
    }
    Ok(Json(serde_json::json!({})))
}

async fn abort_multipart(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path((name, nar_id)): Path<(String, Uuid)>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<serde_json::Value>> {
    let instance = state.instance(&name)?;
    require_write(&instance, &headers)?;

    instance.store.uploads().abort(UploadHandle {
        nar_id,
        upload_id: query.upload_id,
    })?;
    Ok(Json(serde_json::json!({})))
}
