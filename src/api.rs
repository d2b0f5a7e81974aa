//! HTTP JSON façade.
//!
//! Serves the search, indexing, model-management, and settings endpoints
//! on localhost. Every error body carries `{"error": <string>}`; statuses
//! follow the usual mapping (400 invalid input, 404 missing, 409 conflict,
//! 503 subsystem not ready, 500 otherwise).

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, Path as UrlPath, Query, State as AxumState};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use crate::error::Error;
use crate::indexer::IngestJob;
use crate::models::{ProgressEvent, ProgressStatus};
use crate::search::{datefilter, SearchFilters, SearchResultItem, FAVORITE_TAG};
use crate::state::AppState;
use crate::store::keys;

/// Idle SSE subscribers are dropped after ten minutes.
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

// ---- Request / Response types ----

#[derive(Deserialize)]
struct SearchRequest {
    query: Option<String>,
    filters: Option<SearchFilters>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Deserialize)]
struct TagQuery {
    tag: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

#[derive(Deserialize)]
struct BrowseQuery {
    folder: String,
    #[serde(default = "default_browse_limit")]
    limit: usize,
}

#[derive(Deserialize)]
struct BlurQuery {
    blurred: bool,
}

#[derive(Deserialize)]
struct DownloadRequest {
    repo: Option<String>,
}

#[derive(Deserialize)]
struct TokenRequest {
    token: String,
}

#[derive(Deserialize)]
struct AddFolderRequest {
    #[serde(rename = "folderPath")]
    folder_path: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn default_limit() -> usize {
    50
}

fn default_browse_limit() -> usize {
    100
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(e: Error) -> ApiError {
    let status = match &e {
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::AuthFailed => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse { error: e.to_string() }))
}

fn internal(msg: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
}

fn not_found(what: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Not found: {}", what),
        }),
    )
}

// ---- Search ----

async fn api_search(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(body): Json<SearchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let raw_query = body.query.unwrap_or_default().trim().to_string();
    let mut filters = body.filters.unwrap_or_default();

    // Natural-language dates in the query override filter dates and are
    // stripped before embedding.
    let parsed = datefilter::parse(&raw_query);
    if let Some(from) = parsed.date_from {
        filters.date_from = Some(from.format("%Y-%m-%d").to_string());
    }
    if let Some(to) = parsed.date_to {
        filters.date_to = Some(to.format("%Y-%m-%d").to_string());
    }
    let query = parsed.clean_query;

    let limit = body
        .limit
        .filter(|&l| l > 0)
        .unwrap_or(50)
        .min(state.config.search_limit);
    let offset = body.offset.unwrap_or(0);

    let results = state
        .search
        .search_by_text(&query, &filters, limit, offset)
        .map_err(error_response)?;
    let total = state.db.count_indexed().map_err(error_response)?;

    Ok(Json(json!({
        "results": results,
        "count": results.len(),
        "totalCount": total,
        "query": query,
    })))
}

async fn api_search_image(
    AxumState(state): AxumState<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| internal(format!("Malformed multipart body: {}", e)))?
    {
        if field.name() == Some("file") {
            let name = field.file_name().unwrap_or("query.jpg").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| internal(format!("Failed to read upload: {}", e)))?;
            upload = Some((name, bytes.to_vec()));
            break;
        }
    }
    let Some((file_name, bytes)) = upload else {
        return Err(error_response(Error::InvalidInput(
            "No image file provided".to_string(),
        )));
    };
    if bytes.is_empty() {
        return Err(error_response(Error::InvalidInput(
            "No image file provided".to_string(),
        )));
    }

    let ext = Path::new(&file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("jpg")
        .to_lowercase();
    let temp_path = std::env::temp_dir().join(format!(
        "lumina_query_{}_{}.{}",
        std::process::id(),
        chrono::Local::now().timestamp_nanos_opt().unwrap_or_default(),
        ext
    ));
    std::fs::write(&temp_path, &bytes).map_err(|e| internal(e))?;

    let limit = 50.min(state.config.search_limit);
    let result = state
        .search
        .search_by_image(&temp_path, &SearchFilters::default(), limit, 0);
    let _ = std::fs::remove_file(&temp_path);

    let results = result.map_err(error_response)?;
    Ok(Json(json!({ "results": results, "count": results.len() })))
}

async fn api_search_tags(
    AxumState(state): AxumState<Arc<AppState>>,
    Query(params): Query<TagQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let results = state
        .search
        .search_by_tag(&params.tag, params.limit)
        .map_err(error_response)?;
    Ok(Json(json!({
        "results": results,
        "count": results.len(),
        "tag": params.tag,
    })))
}

async fn api_browse_folder(
    AxumState(state): AxumState<Arc<AppState>>,
    Query(params): Query<BrowseQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let results = state
        .search
        .browse_folder(&params.folder, params.limit)
        .map_err(error_response)?;
    Ok(Json(json!({
        "results": results,
        "count": results.len(),
        "folder": params.folder,
    })))
}

// ---- Images ----

async fn api_image_metadata(
    AxumState(state): AxumState<Arc<AppState>>,
    UrlPath(id): UrlPath<i64>,
) -> Result<Json<SearchResultItem>, ApiError> {
    let record = state
        .db
        .find_by_id(id)
        .map_err(error_response)?
        .ok_or_else(|| not_found(&format!("image {}", id)))?;
    Ok(Json(crate::search::to_result_item(&record, 0.0)))
}

async fn api_image_thumb(
    AxumState(state): AxumState<Arc<AppState>>,
    UrlPath(id): UrlPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .db
        .find_by_id(id)
        .map_err(error_response)?
        .ok_or_else(|| not_found(&format!("image {}", id)))?;

    // Thumbnail first, original bytes as the fallback.
    if let Some(thumb) = record.thumb_path.as_deref() {
        if let Ok(bytes) = std::fs::read(thumb) {
            return Ok(([(header::CONTENT_TYPE, "image/jpeg".to_string())], bytes));
        }
    }
    serve_original(&record.file_path)
}

async fn api_image_full(
    AxumState(state): AxumState<Arc<AppState>>,
    UrlPath(id): UrlPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .db
        .find_by_id(id)
        .map_err(error_response)?
        .ok_or_else(|| not_found(&format!("image {}", id)))?;
    serve_original(&record.file_path)
}

fn serve_original(
    file_path: &str,
) -> Result<([(header::HeaderName, String); 1], Vec<u8>), ApiError> {
    let path = Path::new(file_path);
    if !path.exists() {
        return Err(not_found(file_path));
    }
    let bytes = std::fs::read(path).map_err(internal)?;
    Ok(([(header::CONTENT_TYPE, mime_for_path(path).to_string())], bytes))
}

fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => "image/jpeg",
    }
}

async fn api_update_tags(
    AxumState(state): AxumState<Arc<AppState>>,
    UrlPath(id): UrlPath<i64>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut record = state
        .db
        .find_by_id(id)
        .map_err(error_response)?
        .ok_or_else(|| not_found(&format!("image {}", id)))?;

    // The reserved favorite tag is denormalized into the boolean column,
    // which stays authoritative.
    if let Some(tags) = body.get("tags").and_then(|t| t.as_array()) {
        record.is_favorite = tags.iter().any(|t| t.as_str() == Some(FAVORITE_TAG));
    }
    record.extra_json = Some(body.to_string());
    state.db.save(record).map_err(error_response)?;
    Ok(Json(json!({ "status": "updated" })))
}

async fn api_toggle_blur(
    AxumState(state): AxumState<Arc<AppState>>,
    UrlPath(id): UrlPath<i64>,
    Query(params): Query<BlurQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut record = state
        .db
        .find_by_id(id)
        .map_err(error_response)?
        .ok_or_else(|| not_found(&format!("image {}", id)))?;
    record.is_blurred = params.blurred;
    state.db.save(record).map_err(error_response)?;
    Ok(Json(json!({ "status": "updated", "blurred": params.blurred })))
}

async fn api_delete_image(
    AxumState(state): AxumState<Arc<AppState>>,
    UrlPath(id): UrlPath<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Removes the record and its vector entry, never the source file.
    state
        .db
        .find_by_id(id)
        .map_err(error_response)?
        .ok_or_else(|| not_found(&format!("image {}", id)))?;
    state.index.remove(id);
    state.db.delete(id).map_err(error_response)?;
    Ok(Json(json!({ "status": "deleted", "id": id })))
}

// ---- Indexing ----

async fn api_reindex(
    AxumState(state): AxumState<Arc<AppState>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let roots = state.reindex_roots();
    let display: Vec<String> = roots
        .iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect();

    state
        .jobs
        .try_send(IngestJob::Reindex(roots))
        .map_err(|_| error_response(Error::Conflict("Ingest queue is full".to_string())))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "REINDEX_STARTED",
            "message": format!("Re-indexing started for {} unique folder(s).", display.len()),
            "folders": display,
        })),
    ))
}

async fn api_index_status(
    AxumState(state): AxumState<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(json!({
        "totalIndexed": state.db.count_indexed().map_err(error_response)?,
        "favoritesCount": state.db.count_favorites().map_err(error_response)?,
        "processedCount": state.indexer.processed_count(),
        "errorCount": state.indexer.error_count(),
        "currentFile": state.indexer.current_file(),
        "lastRunTime": state.indexer.last_run_time(),
    })))
}

// ---- Models ----

async fn api_models_download(
    AxumState(state): AxumState<Arc<AppState>>,
    body: Option<Json<DownloadRequest>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let repo = body.and_then(|Json(b)| b.repo);
    state.fetcher.start(repo).map_err(error_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "STARTED",
            "message": "Model download started. Subscribe to /api/models/progress for updates.",
        })),
    ))
}

async fn api_models_status(
    AxumState(state): AxumState<Arc<AppState>>,
) -> Json<crate::models::ModelStatusReport> {
    Json(state.fetcher.status())
}

async fn api_models_progress(
    AxumState(state): AxumState<Arc<AppState>>,
) -> Sse<impl futures_util::Stream<Item = Result<SseEvent, Infallible>>> {
    // Current status goes out immediately on connect.
    let current = state.fetcher.status();
    let initial = SseEvent::default()
        .event("status")
        .json_data(&current)
        .unwrap_or_else(|_| SseEvent::default().event("status").data("{}"));

    let rx = state.fetcher.subscribe();
    let updates = futures_util::stream::unfold((rx, false), |(mut rx, done)| async move {
        if done {
            return None;
        }
        loop {
            match tokio::time::timeout(SSE_IDLE_TIMEOUT, rx.recv()).await {
                // Idle too long or channel closed: drop the subscriber.
                Err(_) => return None,
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                // Lagging subscribers lose events, never block the fetcher.
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Ok(event)) => {
                    let terminal = matches!(
                        event.status,
                        ProgressStatus::Ready | ProgressStatus::Error
                    );
                    let sse = progress_to_sse(&event);
                    return Some((Ok::<_, Infallible>(sse), (rx, terminal)));
                }
            }
        }
    });

    let stream = futures_util::StreamExt::chain(
        futures_util::stream::iter([Ok::<_, Infallible>(initial)]),
        updates,
    );
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn progress_to_sse(event: &ProgressEvent) -> SseEvent {
    SseEvent::default()
        .event("progress")
        .json_data(event)
        .unwrap_or_else(|_| SseEvent::default().event("progress").data("{}"))
}

// ---- Settings ----

async fn api_settings(
    AxumState(state): AxumState<Arc<AppState>>,
) -> Json<serde_json::Value> {
    let has_token = state.fetcher.has_token();
    Json(json!({
        "hasToken": has_token,
        "tokenMasked": if has_token { "hf_****" } else { "" },
    }))
}

async fn api_save_token(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(body): Json<TokenRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .fetcher
        .store_token(body.token.trim())
        .map_err(error_response)?;
    Ok(Json(json!({
        "status": "saved",
        "message": "Token saved and encrypted.",
    })))
}

async fn api_clear_token(
    AxumState(state): AxumState<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.fetcher.clear_token().map_err(error_response)?;
    Ok(Json(json!({ "status": "cleared", "message": "Token removed." })))
}

async fn api_token_status(
    AxumState(state): AxumState<Arc<AppState>>,
) -> Json<serde_json::Value> {
    Json(json!({ "hasToken": state.fetcher.has_token() }))
}

async fn api_advanced_settings(
    AxumState(state): AxumState<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let setting_bool = |key: &str| -> bool {
        state
            .db
            .get_setting(key)
            .ok()
            .flatten()
            .map(|v| v == "true")
            .unwrap_or(true)
    };
    let threshold: f64 = state
        .db
        .get_setting(keys::SEARCH_THRESHOLD)
        .ok()
        .flatten()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.24);

    Ok(Json(json!({
        "exifEnabled": setting_bool(keys::EXIF_ENABLED),
        "exifVisible": setting_bool(keys::EXIF_VISIBLE),
        "mapVisible": setting_bool(keys::MAP_VISIBLE),
        "autoIndexingEnabled": setting_bool(keys::AUTO_INDEXING),
        "searchThreshold": threshold,
    })))
}

async fn api_save_advanced_settings(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(enabled) = body.get("exifEnabled").and_then(|v| v.as_bool()) {
        let was_enabled = state
            .db
            .get_setting(keys::EXIF_ENABLED)
            .map_err(error_response)?
            .map(|v| v == "true")
            .unwrap_or(true);
        state
            .db
            .set_setting(keys::EXIF_ENABLED, &enabled.to_string())
            .map_err(error_response)?;

        // Toggling on queues a metadata pass for records without one.
        if !was_enabled && enabled {
            let missing = state.db.find_paths_missing_exif().map_err(error_response)?;
            tracing::info!("Metadata pass queued for {} records", missing.len());
            for path in missing {
                let _ = state.jobs.try_send(IngestJob::Index(path.into()));
            }
        }
    }
    for (field, key) in [
        ("exifVisible", keys::EXIF_VISIBLE),
        ("mapVisible", keys::MAP_VISIBLE),
        ("autoIndexingEnabled", keys::AUTO_INDEXING),
    ] {
        if let Some(value) = body.get(field).and_then(|v| v.as_bool()) {
            state
                .db
                .set_setting(key, &value.to_string())
                .map_err(error_response)?;
        }
    }
    if let Some(threshold) = body.get("searchThreshold").and_then(|v| v.as_f64()) {
        let clamped = threshold.clamp(0.0, 1.0);
        state
            .db
            .set_setting(keys::SEARCH_THRESHOLD, &clamped.to_string())
            .map_err(error_response)?;
    }
    Ok(Json(json!({ "status": "saved" })))
}

async fn api_list_folders(
    AxumState(state): AxumState<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let folders = state.db.list_folders().map_err(error_response)?;
    let mut out = Vec::with_capacity(folders.len());
    for folder in folders {
        let count = state
            .db
            .count_images_under(&folder.folder_path)
            .unwrap_or(0);
        out.push(json!({
            "id": folder.id,
            "folderPath": folder.folder_path,
            "active": folder.active,
            "addedAt": folder.added_at.map(crate::store::fmt_ts).unwrap_or_default(),
            "imageCount": count,
        }));
    }
    Ok(Json(serde_json::Value::Array(out)))
}

async fn api_add_folder(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(body): Json<AddFolderRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let folder = state
        .watcher
        .add_folder(&body.folder_path)
        .map_err(error_response)?;
    Ok(Json(json!({
        "status": "added",
        "id": folder.id,
        "folderPath": folder.folder_path,
    })))
}

async fn api_remove_folder(
    AxumState(state): AxumState<Arc<AppState>>,
    UrlPath(id): UrlPath<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let folder = state.watcher.remove_folder(id).map_err(error_response)?;
    Ok(Json(json!({
        "status": "removed",
        "folderPath": folder.folder_path,
    })))
}

async fn api_health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

// ---- Router / server ----

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/search", post(api_search))
        .route("/api/search/image", post(api_search_image))
        .route("/api/search/tags", get(api_search_tags))
        .route("/api/search/browse", get(api_browse_folder))
        .route("/api/images/:id", get(api_image_metadata).delete(api_delete_image))
        .route("/api/images/:id/thumb", get(api_image_thumb))
        .route("/api/images/:id/full", get(api_image_full))
        .route("/api/images/:id/tags", patch(api_update_tags))
        .route("/api/images/:id/blur", patch(api_toggle_blur))
        .route("/api/index/reindex", post(api_reindex))
        .route("/api/index/status", get(api_index_status))
        .route("/api/models/download", post(api_models_download))
        .route("/api/models/status", get(api_models_status))
        .route("/api/models/progress", get(api_models_progress))
        .route("/api/models/verify", post(api_models_status))
        .route("/api/settings", get(api_settings))
        .route("/api/settings/token", post(api_save_token).delete(api_clear_token))
        .route("/api/settings/token/status", get(api_token_status))
        .route(
            "/api/settings/advanced",
            get(api_advanced_settings).post(api_save_advanced_settings),
        )
        .route("/api/settings/folders", get(api_list_folders).post(api_add_folder))
        .route("/api/settings/folders/:id", delete(api_remove_folder))
        .with_state(state)
        .layer(cors)
}

/// Binds and serves the API until shutdown.
pub async fn start_server(state: Arc<AppState>) {
    let port = state.config.port;
    let app = build_router(Arc::clone(&state));

    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!("API listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind API server on port {}: {}", port, e);
            return;
        }
    };

    let shutdown_state = Arc::clone(&state);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down...");
        shutdown_state.shutdown();
    });
    if let Err(e) = server.await {
        tracing::error!("API server error: {}", e);
    }
}
