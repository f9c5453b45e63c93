use std::io::Read;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dbsnap_core::{BackupEntry, BackupType, RestoreMode, RunReport};
use dbsnap_pipeline::{BackupError, BackupOutcome, RestoreError, SnapshotService};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const PRINCIPAL_HEADER: &str = "x-dbsnap-principal";

/// Largest snapshot `/api/v1/restore` accepts, before and after decompression.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Clone)]
pub struct AppState {
    pub service: SnapshotService,
    /// Held for the whole of a restore; a second restore is turned away.
    pub restore_gate: Arc<Mutex<()>>,
    pub api_token: Option<String>,
    pub max_upload_bytes: usize,
}

pub fn build_router(state: AppState) -> Router {
    let upload_limit = state.max_upload_bytes;
    Router::new()
        .route("/api/v1/healthz", get(healthz))
        .route("/api/v1/backups", get(list_backups).post(create_backup))
        .route("/api/v1/backups/{id}", get(backup_detail))
        .route("/api/v1/backups/{id}/download", get(download_backup))
        .route("/api/v1/backups/{id}/restore", post(restore_stored))
        .route(
            "/api/v1/restore",
            post(restore_upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { status: "ok" })
}

fn require_api_auth(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.api_token else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

fn parse_id(id: &str) -> Result<Uuid, StatusCode> {
    Uuid::parse_str(id).map_err(|_| StatusCode::BAD_REQUEST)
}

async fn list_backups(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<BackupEntry>>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let entries = state
        .service
        .metadata()
        .list_backups(None)
        .await
        .map_err(|e| {
            error!(error = %format!("{e:#}"), "listing backups failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
struct CreateBackupRequest {
    #[serde(rename = "type", default = "manual")]
    backup_type: BackupType,
}

fn manual() -> BackupType {
    BackupType::Manual
}

async fn create_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateBackupRequest>,
) -> Result<Json<BackupOutcome>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let principal = headers
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned);

    match state.service.run_backup(request.backup_type, principal).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(BackupError::NoOwner) => {
            warn!("backup refused: no owner to record");
            Err(StatusCode::UNPROCESSABLE_ENTITY)
        }
        Err(e) => {
            error!(error = %e, "backup failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn backup_detail(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BackupEntry>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let entry = state
        .service
        .metadata()
        .get_backup(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(entry))
}

async fn download_backup(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let entry = state
        .service
        .metadata()
        .get_backup(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let bytes = state
        .service
        .objects()
        .get(&entry.storage_path)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let compressed =
        zstd::encode_all(bytes.as_slice(), 3).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename={}.json.zst",
        entry.backup_name
    ))
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let mut response = compressed.into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zstd"),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct RestoreParams {
    #[serde(default)]
    mode: RestoreMode,
}

async fn restore_stored(
    Path(id): Path<String>,
    Query(params): Query<RestoreParams>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RunReport>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let _running = state
        .restore_gate
        .try_lock()
        .map_err(|_| StatusCode::CONFLICT)?;

    info!(backup_id = %id, mode = %params.mode, "restoring stored snapshot");
    match state.service.restore_backup(id, params.mode).await {
        Ok(report) => Ok(Json(report)),
        Err(RestoreError::Format(e)) => {
            warn!(backup_id = %id, error = %e, "stored snapshot is not a valid document");
            Err(StatusCode::BAD_REQUEST)
        }
        Err(RestoreError::NotFound(_) | RestoreError::MissingObject { .. }) => {
            Err(StatusCode::NOT_FOUND)
        }
        Err(RestoreError::Storage(e)) => {
            error!(backup_id = %id, error = %format!("{e:#}"), "restore failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn restore_upload(
    Query(params): Query<RestoreParams>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RunReport>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let document = if body.starts_with(&ZSTD_MAGIC) {
        decompress_capped(&body, state.max_upload_bytes)?
    } else {
        body.to_vec()
    };
    let _running = state
        .restore_gate
        .try_lock()
        .map_err(|_| StatusCode::CONFLICT)?;

    info!(mode = %params.mode, bytes = document.len(), "restoring uploaded snapshot");
    let report = state
        .service
        .run_restore(&document, params.mode)
        .await
        .map_err(|e| {
            warn!(error = %e, "uploaded snapshot rejected");
            StatusCode::BAD_REQUEST
        })?;
    Ok(Json(report))
}

/// Inflates a zstd upload, refusing output past `limit` bytes.
fn decompress_capped(body: &[u8], limit: usize) -> Result<Vec<u8>, StatusCode> {
    let decoder = zstd::stream::read::Decoder::new(body).map_err(|_| StatusCode::BAD_REQUEST)?;
    let mut document = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut document)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    if document.len() > limit {
        warn!(limit, "decompressed snapshot exceeds the upload limit");
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }
    Ok(document)
}
