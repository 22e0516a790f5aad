//! HTTP surface.
//!
//! Accepts uploads, exposes task observation/cancellation/download, and rings
//! the worker wake signal when new work lands. All handlers speak JSON except
//! the multipart upload endpoints and the octet-stream download.
//!
//! Admission rules for uploads, enforced in order: supported extension,
//! size cap, concurrency cap, parameter ranges. Error responses are
//! `{"status":"error","detail":"…"}` with the mapped status code.

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::extract::multipart::Field;
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::from_fn;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, warn};

use crate::config::{SUPPORTED_EXTENSIONS, ServerConfig};
use crate::error::Error;
use crate::metrics;
use crate::store::TaskStore;
use crate::task::{
    AudioLevel, CompressParams, ProtectParams, TaskParams, TaskRecord, TaskStatus, short_uid,
};
use crate::worker::WakeSignal;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TaskStore>,
    pub config: Arc<ServerConfig>,
    pub wake: Arc<WakeSignal>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: &'static str,
    detail: String,
}

/// Handler-level error with its HTTP status.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::ServerBusy(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            status: "error",
            detail: self.message,
        });
        (self.status, body).into_response()
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let body_cap = state.config.max_video_size_bytes() as usize + 16 * 1024 * 1024;

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/upload", post(upload))
        .route("/strip-metadata", post(strip_metadata))
        .route("/compress-video", post(compress_video))
        .route("/task/{id}", get(task_status))
        .route("/tasks", get(list_tasks))
        .route("/download/{id}", get(download))
        .route("/cancel/{id}", post(cancel))
        .route("/cleanup", post(cleanup))
        .route_layer(from_fn(metrics::track_http_metrics))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_cap))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(
                    DefaultMakeSpan::new()
                        .level(Level::INFO)
                        .include_headers(false),
                )
                .on_response(DefaultOnResponse::new().level(Level::INFO))
                .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
        )
}

async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "name": "mirage",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "queue_stats": state.store.stats(),
        "endpoints": {
            "upload": "/upload",
            "strip_metadata": "/strip-metadata",
            "compress_video": "/compress-video",
            "task_status": "/task/{task_id}",
            "task_list": "/tasks",
            "download": "/download/{task_id}",
            "cancel": "/cancel/{task_id}",
            "stats": "/stats",
            "health": "/health",
        },
    }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.store.stats();
    Json(json!({
        "status": "healthy",
        "queue_size": stats.total,
        "processing": stats.processing,
    }))
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "success",
        "queue": state.store.stats(),
        "config": {
            "max_concurrent_tasks": state.config.max_concurrent_tasks,
            "max_video_size_gb": state.config.max_video_size_gb,
        },
    }))
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    epsilon: Option<f32>,
    #[serde(default, alias = "video_strength")]
    strength: Option<f32>,
    #[serde(default)]
    audio_level: Option<String>,
    #[serde(default, alias = "every_n_frames")]
    every_n: Option<u32>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, AppError> {
    let cfg = &state.config;

    let audio_level = match query.audio_level.as_deref() {
        Some(raw) => AudioLevel::parse(raw)?,
        None => cfg.default_audio_level,
    };
    let params = TaskParams::Protect(ProtectParams {
        epsilon: query.epsilon.unwrap_or(cfg.default_epsilon),
        strength: query.strength.unwrap_or(cfg.default_strength),
        every_n: query.every_n.unwrap_or(cfg.default_every_n),
        audio_level,
    });

    let record = admit_upload(
        &state,
        &headers,
        multipart,
        params,
        query.user_id,
        query.notes,
    )
    .await?;

    metrics::record_upload("protect");
    Ok(Json(json!({
        "status": "success",
        "task_id": record.id,
        "message": "video queued for protection",
        "task": record.public(),
    })))
}

async fn strip_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, AppError> {
    let record = admit_upload(
        &state,
        &headers,
        multipart,
        TaskParams::StripMetadata,
        None,
        None,
    )
    .await?;

    metrics::record_upload("strip_metadata");
    Ok(Json(json!({
        "status": "success",
        "task_id": record.id,
        "message": "video queued for metadata strip",
    })))
}

#[derive(Debug, Deserialize)]
struct CompressQuery {
    #[serde(default = "default_target_mb")]
    target_size_mb: u64,
}

fn default_target_mb() -> u64 {
    50
}

async fn compress_video(
    State(state): State<AppState>,
    Query(query): Query<CompressQuery>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, AppError> {
    let params = TaskParams::Compress(CompressParams {
        target_mb: query.target_size_mb,
    });
    let record = admit_upload(&state, &headers, multipart, params, None, None).await?;

    metrics::record_upload("compress");
    Ok(Json(json!({
        "status": "success",
        "task_id": record.id,
        "target_size_mb": query.target_size_mb,
        "message": "video queued for compression",
    })))
}

/// Run the admission checks in their documented order, stream the body to the
/// input directory and create the task record.
async fn admit_upload(
    state: &AppState,
    headers: &HeaderMap,
    mut multipart: Multipart,
    params: TaskParams,
    user_id: Option<String>,
    notes: Option<String>,
) -> Result<TaskRecord, AppError> {
    let cfg = &state.config;

    // A declared-oversize body is refused before any of it is read; reading
    // the multipart headers out of a body the client may never finish
    // sending would hang the admission path.
    let cap = cfg.max_video_size_bytes();
    if let Some(declared) = content_length(headers)
        && declared > cap
    {
        return Err(Error::PayloadTooLarge(format!(
            "upload of {declared} bytes exceeds the {} GiB cap",
            cfg.max_video_size_gb
        ))
        .into());
    }

    let field = next_file_field(&mut multipart).await?;
    let original_name = field
        .file_name()
        .and_then(|name| Path::new(name).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| AppError::bad_request("multipart field 'file' needs a filename"))?;

    validate_extension(&original_name)?;

    // Concurrency cap.
    let processing = state.store.stats().processing;
    if processing >= cfg.max_concurrent_tasks {
        return Err(Error::ServerBusy(format!(
            "server busy: {processing} videos processing, try again later"
        ))
        .into());
    }

    // Parameter ranges.
    params.validate()?;

    // Accepted: stream to disk under a fresh name the task will own. The
    // byte cap still applies while streaming for bodies with no usable
    // Content-Length.
    let stored_name = format!("{}_{original_name}", short_uid());
    let input_path = cfg.input_dir().join(&stored_name);
    let written = save_field(field, &input_path, cap).await?;
    info!(file = %stored_name, bytes = written, "upload stored");

    let record = state
        .store
        .create(TaskRecord::new(stored_name, params, user_id, notes))?;
    state.wake.notify();
    info!(task_id = %record.id, kind = ?record.kind(), "task created");
    Ok(record)
}

/// Pull the upload out of the multipart stream. The file must be the first
/// field, named `file` or at least carrying a filename.
async fn next_file_field(multipart: &mut Multipart) -> Result<Field<'_>, AppError> {
    let field = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {err}")))?
        .ok_or_else(|| AppError::bad_request("missing multipart field 'file'"))?;

    if field.name() == Some("file") || field.file_name().is_some() {
        Ok(field)
    } else {
        Err(AppError::bad_request("expected multipart field 'file'"))
    }
}

fn validate_extension(filename: &str) -> Result<(), AppError> {
    let ext = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    match ext {
        Some(ext) if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        other => Err(AppError::bad_request(format!(
            "unsupported format: {} (supported: {})",
            other.as_deref().unwrap_or("<none>"),
            SUPPORTED_EXTENSIONS.join(", ")
        ))),
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Stream the field to `path`, enforcing the byte cap. An overrun removes the
/// partial file so nothing remains in the input directory.
async fn save_field(mut field: Field<'_>, path: &Path, cap: u64) -> Result<u64, AppError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|err| AppError::from(Error::Internal(format!("cannot store upload: {err}"))))?;

    let mut written: u64 = 0;
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                drop(file);
                let _ = tokio::fs::remove_file(path).await;
                return Err(AppError::bad_request(format!("upload aborted: {err}")));
            }
        };

        written += chunk.len() as u64;
        if written > cap {
            drop(file);
            let _ = tokio::fs::remove_file(path).await;
            return Err(Error::PayloadTooLarge(format!(
                "upload exceeds the {} byte cap",
                cap
            ))
            .into());
        }

        if let Err(err) = file.write_all(&chunk).await {
            drop(file);
            let _ = tokio::fs::remove_file(path).await;
            return Err(Error::Internal(format!("write failed: {err}")).into());
        }
    }

    if let Err(err) = file.flush().await {
        let _ = tokio::fs::remove_file(path).await;
        return Err(Error::Internal(format!("flush failed: {err}")).into());
    }
    Ok(written)
}

async fn task_status(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let task = state
        .store
        .get(&id)
        .ok_or_else(|| AppError::not_found(format!("task not found: {id}")))?;
    Ok(Json(json!({
        "status": "success",
        "task": task.public(),
    })))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default = "default_list_limit")]
    limit: usize,
}

fn default_list_limit() -> usize {
    50
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut tasks = match (&query.user_id, &query.status) {
        (Some(user_id), _) => state.store.list_by_user(user_id),
        (None, Some(status)) => state.store.list_all(Some(parse_status(status)?)),
        (None, None) => state.store.list_all(None),
    };

    // Newest first.
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    tasks.truncate(query.limit);

    Ok(Json(json!({
        "status": "success",
        "count": tasks.len(),
        "tasks": tasks.iter().map(TaskRecord::public).collect::<Vec<_>>(),
    })))
}

fn parse_status(raw: &str) -> Result<TaskStatus, AppError> {
    match raw {
        "pending" => Ok(TaskStatus::Pending),
        "processing" => Ok(TaskStatus::Processing),
        "completed" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        "cancelled" => Ok(TaskStatus::Cancelled),
        other => Err(AppError::bad_request(format!("unknown status '{other}'"))),
    }
}

async fn download(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Response, AppError> {
    let task = state
        .store
        .get(&id)
        .ok_or_else(|| AppError::not_found(format!("task not found: {id}")))?;

    if task.status != TaskStatus::Completed {
        return Err(AppError::bad_request(format!(
            "video not ready, status: {}",
            task.status
        )));
    }
    let output_name = task
        .output_name
        .as_deref()
        .ok_or_else(|| AppError::not_found("output file not recorded"))?;

    let path = state.config.output_dir().join(output_name);
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| AppError::not_found(format!("output file was removed: {output_name}")))?;

    info!(task_id = %id, file = %output_name, "output downloaded");
    let body = Body::from_stream(ReaderStream::new(file));
    let disposition = format!("attachment; filename=\"{output_name}\"");
    Ok((
        [
            (header::CONTENT_TYPE, "video/mp4".to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn cancel(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let cancelled = state.store.cancel(&id)?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("task {} cancelled", cancelled.id),
    })))
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    #[serde(default)]
    days: Option<i64>,
}

async fn cleanup(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let days = query.days.unwrap_or(state.config.auto_cleanup_days);
    if days < 0 {
        return Err(AppError::bad_request("days must be non-negative"));
    }
    let deleted = state.store.cleanup(days).inspect_err(|err| {
        warn!(%err, "cleanup failed");
    })?;
    Ok(Json(json!({
        "status": "success",
        "deleted_tasks": deleted,
        "message": format!("deleted {deleted} old tasks"),
    })))
}
