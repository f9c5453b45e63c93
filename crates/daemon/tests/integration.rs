use std::sync::Arc;

use dbsnap_core::{BackupType, Catalog, Record};
use dbsnap_daemon::{build_router, AppState, DEFAULT_MAX_UPLOAD_BYTES};
use dbsnap_pipeline::{PipelineOptions, SnapshotService};
use dbsnap_storage::sqlite_store::SqliteStore;
use dbsnap_storage::{FsObjectStore, MemoryRelationalStore};
use tokio::sync::Mutex;

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    source: Arc<MemoryRelationalStore>,
    service: SnapshotService,
    restore_gate: Arc<Mutex<()>>,
    _tmp: tempfile::TempDir,
    _handle: tokio::task::JoinHandle<()>,
}

fn seed(source: &MemoryRelationalStore) {
    source.seed(
        "profiles",
        vec![
            Record::new()
                .with("id", "p-1")
                .with("role", "admin")
                .with("created_at", "2024-01-01T00:00:00Z"),
            Record::new()
                .with("id", "p-2")
                .with("role", "Tech Lead")
                .with("created_at", "2024-02-01T00:00:00Z"),
        ],
    );
    source.seed(
        "skill_categories",
        vec![Record::new().with("id", 1).with("name", "Backend")],
    );
    source.seed(
        "skills",
        vec![
            Record::new().with("id", 1).with("category_id", 1),
            Record::new().with("id", 2).with("category_id", 1),
        ],
    );
}

async fn start_server(api_token: Option<String>) -> TestServer {
    start_server_with_limit(api_token, DEFAULT_MAX_UPLOAD_BYTES).await
}

async fn start_server_with_limit(
    api_token: Option<String>,
    max_upload_bytes: usize,
) -> TestServer {
    let tmp = tempfile::tempdir().unwrap();
    let catalog = Catalog::shipped().unwrap();
    let source = Arc::new(MemoryRelationalStore::new());
    for table in catalog.names() {
        source.create_table(table);
    }
    seed(&source);

    let service = SnapshotService::new(
        Arc::new(catalog),
        source.clone(),
        Arc::new(FsObjectStore::new(tmp.path().join("backups")).unwrap()),
        Arc::new(SqliteStore::new(tmp.path().join("metadata.db")).unwrap()),
        PipelineOptions::default(),
    );
    let restore_gate = Arc::new(Mutex::new(()));
    let state = AppState {
        service: service.clone(),
        restore_gate: restore_gate.clone(),
        api_token,
        max_upload_bytes,
    };
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        source,
        service,
        restore_gate,
        _tmp: tmp,
        _handle: handle,
    }
}

async fn create_backup(srv: &TestServer) -> String {
    let resp = srv
        .client
        .post(format!("{}/api/v1/backups", srv.base_url))
        .header("x-dbsnap-principal", "user-42")
        .json(&serde_json::json!({"type": "manual"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    body["id"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn test_healthz() {
    let srv = start_server(None).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/healthz", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_and_list_backups() {
    let srv = start_server(None).await;
    let id = create_backup(&srv).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/backups", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Vec<serde_json::Value> = resp.json().await.unwrap();
    assert_eq!(body.len(), 1);
    assert_eq!(body[0]["id"], id);
    assert_eq!(body[0]["backup_type"], "manual");
    assert_eq!(body[0]["created_by"], "user-42");
    assert_eq!(body[0]["record_count"], 5);
}

#[tokio::test]
async fn test_backup_detail() {
    let srv = start_server(None).await;
    let id = create_backup(&srv).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/backups/{id}", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], id);
    assert_eq!(body["metadata"]["table_counts"]["skills"], 2);

    let resp = srv
        .client
        .get(format!(
            "{}/api/v1/backups/{}",
            srv.base_url,
            uuid::Uuid::new_v4()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = srv
        .client
        .get(format!("{}/api/v1/backups/not-a-uuid", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_download_is_zstd_document() {
    let srv = start_server(None).await;
    let id = create_backup(&srv).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/backups/{id}/download", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let ct = resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(ct, "application/zstd");
    let cd = resp
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(cd.contains(".json.zst"));

    let bytes = resp.bytes().await.unwrap();
    let json = zstd::decode_all(&bytes[..]).unwrap();
    let doc: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(doc["formatVersion"], "2.0");
    assert_eq!(doc["tables"]["skills"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_restore_stored_backup() {
    let srv = start_server(None).await;
    let id = create_backup(&srv).await;
    srv.source
        .seed("skills", vec![Record::new().with("id", 3).with("category_id", 1)]);

    let resp = srv
        .client
        .post(format!(
            "{}/api/v1/backups/{id}/restore?mode=replace",
            srv.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let report: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(report["errors"].as_array().unwrap().len(), 0);
    assert_eq!(srv.source.count("skills"), 2);

    // Roles are folded on the way back in.
    let profiles = srv.source.rows("profiles");
    assert!(profiles
        .iter()
        .any(|p| p.role() == Some("tech_lead")));
}

#[tokio::test]
async fn test_restore_upload_accepts_raw_and_zstd() {
    let srv = start_server(None).await;
    let document = serde_json::json!({
        "formatVersion": "2.0",
        "createdAt": "2024-01-01T00:00:00.000Z",
        "tables": {
            "skills": [{"id": 10, "category_id": 1}]
        }
    });
    let raw = serde_json::to_vec(&document).unwrap();

    let resp = srv
        .client
        .post(format!("{}/api/v1/restore?mode=merge", srv.base_url))
        .body(raw.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(srv.source.count("skills"), 3);

    let compressed = zstd::encode_all(raw.as_slice(), 3).unwrap();
    let resp = srv
        .client
        .post(format!("{}/api/v1/restore?mode=merge", srv.base_url))
        .body(compressed)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let report: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(report["success"][0]["table"], "skills");
    assert_eq!(report["success"][0]["mode"], "merge");
    assert_eq!(srv.source.count("skills"), 3);
}

#[tokio::test]
async fn test_restore_rejects_invalid_document() {
    let srv = start_server(None).await;

    let resp = srv
        .client
        .post(format!("{}/api/v1/restore", srv.base_url))
        .body(r#"{"formatVersion":"2.0","tables":{}}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(srv.source.count("skills"), 2);

    let resp = srv
        .client
        .post(format!("{}/api/v1/restore?mode=sideways", srv.base_url))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_concurrent_restore_conflicts() {
    let srv = start_server(None).await;
    let id = create_backup(&srv).await;
    let running = srv.restore_gate.lock().await;

    let resp = srv
        .client
        .post(format!("{}/api/v1/backups/{id}/restore", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    drop(running);
    let resp = srv
        .client
        .post(format!("{}/api/v1/backups/{id}/restore", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_unattended_backup_owned_by_admin() {
    let srv = start_server(None).await;
    let resp = srv
        .client
        .post(format!("{}/api/v1/backups", srv.base_url))
        .json(&serde_json::json!({"type": "auto"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let autos = srv
        .service
        .metadata()
        .list_backups(Some(BackupType::Auto))
        .await
        .unwrap();
    assert_eq!(autos.len(), 1);
    assert_eq!(autos[0].created_by.as_deref(), Some("p-1"));
}

#[tokio::test]
async fn test_api_auth_rejected_without_token() {
    let srv = start_server(Some("secret-token".to_string())).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/backups", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = srv
        .client
        .post(format!("{}/api/v1/restore", srv.base_url))
        .header("Authorization", "Bearer wrong")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_api_auth_accepted_with_token() {
    let srv = start_server(Some("secret-token".to_string())).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/backups", srv.base_url))
        .header("Authorization", "Bearer secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

fn profiles_document(count: usize, padding: usize) -> Vec<u8> {
    let profiles: Vec<serde_json::Value> = (0..count)
        .map(|i| {
            serde_json::json!({
                "id": format!("bulk-{i}"),
                "role": "employee",
                "bio": "x".repeat(padding),
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "formatVersion": "2.0",
        "createdAt": "2024-01-01T00:00:00.000Z",
        "tables": { "profiles": profiles }
    }))
    .unwrap()
}

#[tokio::test]
async fn test_restore_upload_larger_than_two_megabytes() {
    let srv = start_server(None).await;
    let document = profiles_document(6000, 600);
    assert!(document.len() > 3 * 1024 * 1024);

    let resp = srv
        .client
        .post(format!("{}/api/v1/restore?mode=replace", srv.base_url))
        .body(document)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let report: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(report["errors"].as_array().unwrap().len(), 0);
    assert_eq!(srv.source.count("profiles"), 6000);
}

#[tokio::test]
async fn test_restore_upload_over_limit_is_rejected() {
    let srv = start_server_with_limit(None, 64 * 1024).await;

    let raw = profiles_document(200, 600);
    assert!(raw.len() > 64 * 1024);
    let resp = srv
        .client
        .post(format!("{}/api/v1/restore", srv.base_url))
        .body(raw)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 413);

    // Small on the wire, large once inflated.
    let inflated = profiles_document(2000, 500);
    let compressed = zstd::encode_all(inflated.as_slice(), 19).unwrap();
    assert!(compressed.len() < 64 * 1024);
    let resp = srv
        .client
        .post(format!("{}/api/v1/restore", srv.base_url))
        .body(compressed)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 413);
    assert_eq!(srv.source.count("profiles"), 2);
}
