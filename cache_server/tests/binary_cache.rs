mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::Engine as _;
use cache_server::api::{server_router, ServerState};
use cache_server::config::Config;
use cache_server::types::{nix32, NarInfo};
use common::{get, head, post_json, put, upload, Artifact, TOKEN};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn stored_bytes(instance: &Arc<cache_server::cache::CacheInstance>) -> u64 {
    instance.store.engine().usage().iter().map(|u| u.usage_bytes).sum()
}

#[tokio::test]
async fn test_miss_then_upload_then_hit() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), "", &common::local_storage(dir.path(), "disk"));
    let instance = common::instance(&config).await;
    let router = common::router(instance.clone());
    let artifact = Artifact::sized("hello-2.12", 10 * 1024);

    let (status, body) = get(&router, "/nix-cache-info", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().starts_with("StoreDir: /nix/store\n"));

    assert_eq!(get(&router, &artifact.narinfo_path(), None).await.0, StatusCode::NOT_FOUND);

    assert_eq!(upload(&router, &artifact).await, (StatusCode::CREATED, StatusCode::CREATED));

    let (status, body) = get(&router, &artifact.narinfo_path(), None).await;
    assert_eq!(status, StatusCode::OK);
    let served = NarInfo::parse(std::str::from_utf8(&body).unwrap()).unwrap();
    assert_eq!(served.nar_hash, artifact.info.nar_hash);
    assert!(instance.store.signer().verify_narinfo(&served));

    let (status, body) = get(&router, &artifact.nar_path(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, artifact.payload);

    // Uploading the same artifact again changes nothing
    assert_eq!(upload(&router, &artifact).await, (StatusCode::OK, StatusCode::OK));
    assert_eq!(instance.store.index().count("main").await.unwrap(), 1);
}

#[tokio::test]
async fn test_unauthorized_upload_has_no_side_effects() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), "", &common::local_storage(dir.path(), "disk"));
    let instance = common::instance(&config).await;
    let router = common::router(instance.clone());
    let artifact = Artifact::sized("unauthorized", 4096);

    let status = put(&router, &artifact.nar_path(), None, artifact.payload.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let status = put(&router, &artifact.nar_path(), Some("wrong"), artifact.payload.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let status = put(
        &router,
        &artifact.narinfo_path(),
        Some("wrong"),
        artifact.info.to_string().into_bytes(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert_eq!(get(&router, &artifact.nar_path(), None).await.0, StatusCode::NOT_FOUND);
    assert_eq!(get(&router, &artifact.narinfo_path(), None).await.0, StatusCode::NOT_FOUND);
    assert_eq!(instance.store.index().count("main").await.unwrap(), 0);
    assert_eq!(stored_bytes(&instance), 0);
}

#[tokio::test]
async fn test_corrupt_payload_is_rejected_without_residue() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), "", &common::local_storage(dir.path(), "disk"));
    let instance = common::instance(&config).await;
    let router = common::router(instance.clone());
    let artifact = Artifact::sized("corrupt", 4096);

    let mut tampered = artifact.payload.clone();
    tampered[10] ^= 0xff;
    let status = put(&router, &artifact.nar_path(), Some(TOKEN), tampered).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Narinfo without a staged payload cannot commit
    let status = put(
        &router,
        &artifact.narinfo_path(),
        Some(TOKEN),
        artifact.info.to_string().into_bytes(),
    )
    .await;
    assert_ne!(status, StatusCode::CREATED);

    assert_eq!(get(&router, &artifact.nar_path(), None).await.0, StatusCode::NOT_FOUND);
    assert_eq!(get(&router, &artifact.narinfo_path(), None).await.0, StatusCode::NOT_FOUND);
    assert_eq!(stored_bytes(&instance), 0);
}

#[tokio::test]
async fn test_private_cache_requires_token_for_reads() {
    let dir = TempDir::new().unwrap();
    let config = common::config(
        dir.path(),
        "    access: private\n",
        &common::local_storage(dir.path(), "disk"),
    );
    let instance = common::instance(&config).await;
    let router = common::router(instance);
    let artifact = Artifact::sized("private", 2048);
    assert_eq!(upload(&router, &artifact).await.1, StatusCode::CREATED);

    // Cache info stays open so clients can read the priority
    assert_eq!(get(&router, "/nix-cache-info", None).await.0, StatusCode::OK);
    assert_eq!(get(&router, &artifact.narinfo_path(), None).await.0, StatusCode::UNAUTHORIZED);
    assert_eq!(get(&router, &artifact.nar_path(), None).await.0, StatusCode::UNAUTHORIZED);
    assert_eq!(get(&router, &artifact.narinfo_path(), Some(TOKEN)).await.0, StatusCode::OK);

    // Basic auth carries the token as its password
    let basic = base64::engine::general_purpose::STANDARD.encode(format!("nix:{}", TOKEN));
    let request = Request::builder()
        .method("GET")
        .uri(artifact.nar_path())
        .header(header::AUTHORIZATION, format!("Basic {}", basic))
        .body(Body::empty())
        .unwrap();
    let (status, body) = common::send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, artifact.payload);
}

#[tokio::test]
async fn test_split_strategy_distributes_exactly() {
    let dir = TempDir::new().unwrap();
    let storages = format!(
        "{}        split: 40\n{}        split: 60\n",
        common::local_storage(dir.path(), "small"),
        common::local_storage(dir.path(), "large")
    );
    let config = common::config(dir.path(), "    storage-strategy: split\n", &storages);
    let instance = common::instance(&config).await;
    let router = common::router(instance.clone());

    let mut placed: HashMap<String, usize> = HashMap::new();
    for i in 0..100 {
        let artifact = Artifact::sized(&format!("split-{}", i), 10 * 1024);
        assert_eq!(upload(&router, &artifact).await, (StatusCode::CREATED, StatusCode::CREATED));
        let record = instance
            .store
            .index()
            .artifact("main", artifact.hash.as_str())
            .await
            .unwrap()
            .unwrap();
        *placed.entry(record.backend).or_default() += 1;
    }

    assert_eq!(placed.get("small"), Some(&40));
    assert_eq!(placed.get("large"), Some(&60));
}

#[tokio::test]
async fn test_expired_artifacts_are_swept() {
    let dir = TempDir::new().unwrap();
    let config = common::config(
        dir.path(),
        "    retention: 7\n",
        &common::local_storage(dir.path(), "disk"),
    );
    let instance = common::instance(&config).await;
    let router = common::router(instance.clone());
    let artifact = Artifact::sized("short-lived", 4096);
    assert_eq!(upload(&router, &artifact).await.1, StatusCode::CREATED);

    let now = chrono::Utc::now().timestamp();
    let sweeper = instance.sweeper();

    let report = sweeper.sweep_once(now + 6 * 86_400).await.unwrap();
    assert_eq!(report.deleted, 0);
    assert_eq!(get(&router, &artifact.narinfo_path(), None).await.0, StatusCode::OK);

    let report = sweeper.sweep_once(now + 8 * 86_400).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(get(&router, &artifact.narinfo_path(), None).await.0, StatusCode::NOT_FOUND);
    assert_eq!(get(&router, &artifact.nar_path(), None).await.0, StatusCode::NOT_FOUND);
    assert_eq!(stored_bytes(&instance), 0);
}

#[tokio::test]
async fn test_head_reports_presence_without_body() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), "", &common::local_storage(dir.path(), "disk"));
    let instance = common::instance(&config).await;
    let router = common::router(instance.clone());
    let artifact = Artifact::sized("head", 2048);

    assert_eq!(head(&router, &artifact.narinfo_path()).await, StatusCode::NOT_FOUND);
    assert_eq!(head(&router, &artifact.nar_path()).await, StatusCode::NOT_FOUND);

    // A staged payload stays invisible until its narinfo commits
    let status = put(&router, &artifact.nar_path(), Some(TOKEN), artifact.payload.clone()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(head(&router, &artifact.nar_path()).await, StatusCode::NOT_FOUND);

    assert_eq!(upload(&router, &artifact).await.1, StatusCode::CREATED);
    let request = Request::builder()
        .method("HEAD")
        .uri(artifact.narinfo_path())
        .body(Body::empty())
        .unwrap();
    let (status, body) = common::send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(head(&router, &artifact.nar_path()).await, StatusCode::OK);

    let snapshot = instance.metrics.snapshot();
    assert_eq!(snapshot.hit_count, 2);
    assert_eq!(snapshot.miss_count, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_uploads_of_one_artifact_store_it_once() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), "", &common::local_storage(dir.path(), "disk"));
    let instance = common::instance(&config).await;
    let router = common::router(instance.clone());
    let artifact = Artifact::sized("contended", 256 * 1024);

    let (first, second) = futures::join!(upload(&router, &artifact), upload(&router, &artifact));
    let mut nar = [first.0, second.0];
    let mut narinfo = [first.1, second.1];
    nar.sort();
    narinfo.sort();
    assert_eq!(nar, [StatusCode::OK, StatusCode::CREATED]);
    assert_eq!(narinfo, [StatusCode::OK, StatusCode::CREATED]);

    assert_eq!(instance.store.index().count("main").await.unwrap(), 1);
    let (status, body) = get(&router, &artifact.nar_path(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, artifact.payload);
    let narinfo_bytes = artifact.info.to_string().len() as u64;
    assert!(stored_bytes(&instance) >= artifact.payload.len() as u64 + narinfo_bytes);
    assert!(stored_bytes(&instance) < 2 * artifact.payload.len() as u64);
}

/// A storage whose root sits below a regular file, so every write fails
fn unwritable_storage(root: &Path, name: &str) -> String {
    let blocker = root.join(format!("{}-blocker", name));
    std::fs::write(&blocker, b"not a directory").unwrap();
    format!(
        "      - name: {name}\n        type: local\n        root: {root}/data\n",
        name = name,
        root = blocker.display()
    )
}

async fn assert_upload_falls_back(strategy: &str) {
    let dir = TempDir::new().unwrap();
    let storages = format!(
        "{}{}",
        unwritable_storage(dir.path(), "broken"),
        common::local_storage(dir.path(), "spare")
    );
    let config = common::config(dir.path(), &format!("    storage-strategy: {}\n", strategy), &storages);
    let instance = common::instance(&config).await;
    let router = common::router(instance.clone());
    let artifact = Artifact::sized(&format!("fallback-{}", strategy), 4096);

    assert_eq!(upload(&router, &artifact).await, (StatusCode::CREATED, StatusCode::CREATED));
    let record = instance
        .store
        .index()
        .artifact("main", artifact.hash.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.backend, "spare");

    let (status, body) = get(&router, &artifact.nar_path(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, artifact.payload);
    assert_eq!(get(&router, &artifact.narinfo_path(), None).await.0, StatusCode::OK);
}

#[tokio::test]
async fn test_in_order_upload_falls_back_to_next_backend() {
    assert_upload_falls_back("in-order").await;
}

#[tokio::test]
async fn test_least_used_upload_falls_back_to_next_backend() {
    assert_upload_falls_back("least-used").await;
}

#[tokio::test]
async fn test_narinfo_with_wrong_nar_hash_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), "", &common::local_storage(dir.path(), "disk"));
    let instance = common::instance(&config).await;
    let router = common::router(instance.clone());
    let artifact = Artifact::sized("forged-hash", 4096);

    let status = put(&router, &artifact.nar_path(), Some(TOKEN), artifact.payload.clone()).await;
    assert_eq!(status, StatusCode::CREATED);

    let mut forged = artifact.info.clone();
    forged.nar_hash = Artifact::sized("something else", 4096).info.nar_hash;
    let status = put(&router, &artifact.narinfo_path(), Some(TOKEN), forged.to_string().into_bytes()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut resized = artifact.info.clone();
    resized.nar_size = 1;
    let status = put(&router, &artifact.narinfo_path(), Some(TOKEN), resized.to_string().into_bytes()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(get(&router, &artifact.narinfo_path(), None).await.0, StatusCode::NOT_FOUND);
    assert_eq!(get(&router, &artifact.nar_path(), None).await.0, StatusCode::NOT_FOUND);

    // The honest narinfo still commits against the staged payload
    let status = put(
        &router,
        &artifact.narinfo_path(),
        Some(TOKEN),
        artifact.info.to_string().into_bytes(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_shared_payload_serves_both_store_paths() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), "", &common::local_storage(dir.path(), "disk"));
    let instance = common::instance(&config).await;
    let router = common::router(instance.clone());
    let payload = Artifact::sized("shared-bytes", 8192).payload;
    let first = Artifact::new("shared-first", payload.clone());
    let second = Artifact::new("shared-second", payload.clone());
    assert_eq!(first.nar_path(), second.nar_path());

    assert_eq!(upload(&router, &first).await, (StatusCode::CREATED, StatusCode::CREATED));
    assert_eq!(upload(&router, &second).await, (StatusCode::OK, StatusCode::CREATED));
    assert_eq!(instance.store.index().count("main").await.unwrap(), 2);

    assert!(instance.store.delete(&first.hash).await.unwrap());
    assert_eq!(get(&router, &first.narinfo_path(), None).await.0, StatusCode::NOT_FOUND);
    assert_eq!(get(&router, &second.narinfo_path(), None).await.0, StatusCode::OK);
    assert_eq!(get(&router, &second.nar_path(), None).await.1, payload);

    assert!(instance.store.delete(&second.hash).await.unwrap());
    assert_eq!(get(&router, &second.nar_path(), None).await.0, StatusCode::NOT_FOUND);
    assert_eq!(stored_bytes(&instance), 0);
}

#[tokio::test]
async fn test_multipart_upload_commits_artifact() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), "", &common::local_storage(dir.path(), "disk"));
    let registry = common::registry(&config).await;
    let instance = registry.get("main").unwrap();
    let cache = common::router(instance.clone());
    let api = server_router(Arc::new(ServerState {
        registry: registry.clone(),
        hostname: "127.0.0.1".to_string(),
        ports: BTreeMap::from([("main".to_string(), 18_080)]),
    }));
    let artifact = Artifact::sized("multipart", 40 * 1024);
    let file_hash = nix32::encode(&Sha256::digest(&artifact.payload));

    let (status, _) = post_json(&api, "/api/v1/cache/main/multipart-nar?compression=xz", None, serde_json::json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = post_json(
        &api,
        "/api/v1/cache/main/multipart-nar?compression=xz",
        Some(TOKEN),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let nar_id = created["narId"].as_str().unwrap().to_string();
    let upload_id = created["uploadId"].as_str().unwrap().to_string();

    let mut parts = Vec::new();
    for (i, chunk) in artifact.payload.chunks(16 * 1024).enumerate() {
        let (status, body) = post_json(
            &api,
            &format!(
                "/api/v1/cache/main/multipart-nar/{}?uploadId={}&partNumber={}",
                nar_id,
                upload_id,
                i + 1
            ),
            Some(TOKEN),
            serde_json::json!({"contentMD5": ""}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let url: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let url = url::Url::parse(url["uploadUrl"].as_str().unwrap()).unwrap();
        assert_eq!(url.port(), Some(18_080));

        let request = Request::builder()
            .method("PUT")
            .uri(format!("{}?{}", url.path(), url.query().unwrap()))
            .body(Body::from(chunk.to_vec()))
            .unwrap();
        let response = tower::ServiceExt::oneshot(cache.clone(), request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let etag = response.headers()[header::ETAG].to_str().unwrap().to_string();
        parts.push(serde_json::json!({"partNumber": i + 1, "eTag": etag}));
    }
    assert_eq!(parts.len(), 3);

    let suffix = artifact.info.store_path.rsplit_once('-').unwrap().1.to_string();
    let (status, _) = post_json(
        &api,
        &format!("/api/v1/cache/main/multipart-nar/{}/complete?uploadId={}", nar_id, upload_id),
        Some(TOKEN),
        serde_json::json!({
            "parts": parts,
            "narInfoCreate": {
                "cStoreHash": artifact.hash.as_str(),
                "cStoreSuffix": suffix,
                "cFileHash": file_hash,
                "cFileSize": artifact.payload.len(),
                "cNarHash": artifact.info.nar_hash,
                "cNarSize": 123_456,
                "cReferences": [],
                "cDeriver": "unknown-deriver",
            },
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(instance.store.uploads().is_empty());

    let (status, body) = get(&cache, &artifact.narinfo_path(), None).await;
    assert_eq!(status, StatusCode::OK);
    let served = NarInfo::parse(std::str::from_utf8(&body).unwrap()).unwrap();
    assert_eq!(served.url, format!("nar/{}.nar.xz", file_hash));
    assert_eq!(served.nar_size, 123_456);
    assert!(served.deriver.is_none());
    assert!(instance.store.signer().verify_narinfo(&served));

    let (status, body) = get(&cache, &format!("/{}", served.url), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, artifact.payload);
}

#[tokio::test]
async fn test_aborted_multipart_upload_is_forgotten() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), "", &common::local_storage(dir.path(), "disk"));
    let registry = common::registry(&config).await;
    let instance = registry.get("main").unwrap();
    let cache = common::router(instance.clone());
    let api = server_router(Arc::new(ServerState {
        registry: registry.clone(),
        hostname: "127.0.0.1".to_string(),
        ports: BTreeMap::new(),
    }));

    let (_, body) = post_json(&api, "/api/v1/cache/main/multipart-nar?compression=zst", Some(TOKEN), serde_json::json!({})).await;
    let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let nar_id = created["narId"].as_str().unwrap().to_string();
    let upload_id = created["uploadId"].as_str().unwrap().to_string();

    // The upload id is what authorizes a part
    let status = put(&cache, &format!("/{}?uploadId={}&partNumber=1", nar_id, nar_id), None, b"part".to_vec()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let status = put(&cache, &format!("/{}?uploadId={}&partNumber=1", nar_id, upload_id), None, b"part".to_vec()).await;
    assert_eq!(status, StatusCode::OK);

    let path = format!("/api/v1/cache/main/multipart-nar/{}/abort?uploadId={}", nar_id, upload_id);
    assert_eq!(post_json(&api, &path, Some(TOKEN), serde_json::json!({})).await.0, StatusCode::OK);
    assert!(instance.store.uploads().is_empty());
    assert_eq!(post_json(&api, &path, Some(TOKEN), serde_json::json!({})).await.0, StatusCode::NOT_FOUND);

    let status = put(&cache, &format!("/{}?uploadId={}&partNumber=2", nar_id, upload_id), None, b"late".to_vec()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(stored_bytes(&instance), 0);
}

fn sibling_config(root: &Path) -> Config {
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
    storages:
{main}
  - name: other
    token: {token}
    storages:
{other}
  - name: secret
    token: {token}
    access: private
    storages:
{secret}
"#,
        root = root.display(),
        token = TOKEN,
        main = common::local_storage(root, "main-disk"),
        other = common::local_storage(root, "other-disk"),
        secret = common::local_storage(root, "secret-disk"),
    );
    Config::from_yaml(&yaml).unwrap()
}

#[tokio::test]
async fn test_miss_is_served_from_public_sibling_cache() {
    let dir = TempDir::new().unwrap();
    let config = sibling_config(dir.path());
    let registry = common::registry(&config).await;
    let siblings: Vec<_> = registry.iter().cloned().collect();
    let main_instance = registry.get("main").unwrap();
    let main = common::router_with_siblings(main_instance.clone(), siblings);
    let other = common::router(registry.get("other").unwrap());
    let secret = common::router(registry.get("secret").unwrap());

    let shared = Artifact::sized("sibling-public", 4096);
    let hidden = Artifact::sized("sibling-private", 4096);
    assert_eq!(upload(&other, &shared).await.1, StatusCode::CREATED);
    assert_eq!(upload(&secret, &hidden).await.1, StatusCode::CREATED);

    let (status, body) = get(&main, &shared.narinfo_path(), None).await;
    assert_eq!(status, StatusCode::OK);
    let served = NarInfo::parse(std::str::from_utf8(&body).unwrap()).unwrap();
    assert!(main_instance.store.signer().verify_narinfo(&served));
    assert_eq!(get(&main, &shared.nar_path(), None).await.1, shared.payload);
    assert_eq!(head(&main, &shared.narinfo_path()).await, StatusCode::OK);
    assert_eq!(head(&main, &shared.nar_path()).await, StatusCode::OK);

    // Private caches never answer for their siblings
    assert_eq!(get(&main, &hidden.narinfo_path(), None).await.0, StatusCode::NOT_FOUND);
    assert_eq!(get(&main, &hidden.nar_path(), None).await.0, StatusCode::NOT_FOUND);

    // Served, not copied
    assert_eq!(main_instance.store.index().count("main").await.unwrap(), 0);
    assert_eq!(main_instance.metrics.snapshot().remote_hit_count, 4);
}
