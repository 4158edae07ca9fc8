//! API Routes

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use tower_http::services::ServeDir;

use crate::catalog::{BatchReport, ClipRecord, DateSummary, LocalClip};
use crate::error::{Error, Result};
use crate::models::ApiResponse;
use crate::state::AppState;
use crate::stream_control::StreamStatus;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    let media_dir = ServeDir::new(&state.config.storage_dir);

    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Catalog
        .route("/api/dates", get(list_dates))
        .route("/api/videos/:date", get(list_cloud_clips))
        .route("/api/local/:date", get(list_local_clips))
        // Downloads
        .route("/api/download/:date", post(download_date))
        .route("/api/download/:date/:clip_id", post(download_clip))
        // Live stream
        .route("/api/stream/start", post(stream_start))
        .route("/api/stream/stop", post(stream_stop))
        .route("/api/stream/touch", post(stream_touch))
        .route("/api/stream/status", get(stream_status))
        // Downloaded media (range requests served by ServeDir)
        .nest_service("/media", media_dir)
        .with_state(state)
}

/// Dates arrive as `YYYY-MM-DD` path segments
fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| Error::Validation(format!("invalid date '{}', expected YYYY-MM-DD", raw)))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    /// Defaults to the first device bound to the cloud account
    device_id: Option<String>,
}

/// Resolve the target device: explicit query parameter, else the account's
/// primary device (logging in first if no session exists yet)
async fn resolve_device(state: &AppState, query: StreamQuery) -> Result<String> {
    if let Some(device_id) = query.device_id {
        return Ok(device_id);
    }
    state.session.ensure_authenticated().await?;
    state
        .session
        .primary_device_id()
        .await
        .ok_or_else(|| Error::NotFound("no device bound to the cloud account".to_string()))
}

// ========================================
// Catalog Handlers
// ========================================

async fn list_dates(State(state): State<AppState>) -> Result<Json<ApiResponse<Vec<DateSummary>>>> {
    let dates = state.catalog.available_dates().await?;
    Ok(Json(ApiResponse::success(dates)))
}

async fn list_cloud_clips(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<ApiResponse<Vec<ClipRecord>>>> {
    let date = parse_date(&date)?;
    let clips = state.catalog.list_clips(date).await?;
    Ok(Json(ApiResponse::success(clips)))
}

async fn list_local_clips(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<ApiResponse<Vec<LocalClip>>>> {
    let date = parse_date(&date)?;
    let clips = state.catalog.local_clips(date).await?;
    Ok(Json(ApiResponse::success(clips)))
}

// ========================================
// Download Handlers
// ========================================

async fn download_date(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<ApiResponse<BatchReport>>> {
    let date = parse_date(&date)?;
    let report = state.catalog.download_all_for_date(date).await?;
    Ok(Json(ApiResponse::success(report)))
}

#[derive(Debug, serde::Serialize)]
struct ClipDownloadResult {
    clip_id: String,
    video_path: String,
    thumbnail_path: Option<String>,
}

async fn download_clip(
    State(state): State<AppState>,
    Path((date, clip_id)): Path<(String, String)>,
) -> Result<Json<ApiResponse<ClipDownloadResult>>> {
    let date = parse_date(&date)?;

    let clips = state.catalog.list_clips(date).await?;
    let clip = clips
        .iter()
        .find(|c| c.id == clip_id)
        .ok_or_else(|| Error::NotFound(format!("clip {} on {}", clip_id, date)))?;

    let video_path = state
        .catalog
        .download_clip(date, &clip_id, crate::catalog::ArtifactKind::Video, true)
        .await?;

    let thumbnail_path = if clip.has_thumbnail {
        state
            .catalog
            .download_clip(date, &clip_id, crate::catalog::ArtifactKind::Thumbnail, true)
            .await
            .map(|p| p.display().to_string())
            .ok()
    } else {
        None
    };

    Ok(Json(ApiResponse::success(ClipDownloadResult {
        clip_id,
        video_path: video_path.display().to_string(),
        thumbnail_path,
    })))
}

// ========================================
// Stream Handlers
// ========================================

#[derive(Debug, serde::Serialize)]
struct StreamStartResult {
    device_id: String,
    url: String,
}

async fn stream_start(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Json<ApiResponse<StreamStartResult>>> {
    let device_id = resolve_device(&state, query).await?;
    let url = state.stream.start(&device_id).await?;
    Ok(Json(ApiResponse::success(StreamStartResult {
        device_id,
        url,
    })))
}

async fn stream_stop(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Json<ApiResponse<StreamStatus>>> {
    let device_id = resolve_device(&state, query).await?;
    state.stream.stop(&device_id).await?;
    let status = state.stream.status(&device_id).await;
    Ok(Json(ApiResponse::success(status)))
}

#[derive(Debug, serde::Serialize)]
struct TouchResult {
    device_id: String,
    streaming: bool,
}

async fn stream_touch(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Json<ApiResponse<TouchResult>>> {
    let device_id = resolve_device(&state, query).await?;
    let streaming = state.stream.touch(&device_id).await?;
    Ok(Json(ApiResponse::success(TouchResult {
        device_id,
        streaming,
    })))
}

async fn stream_status(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Json<ApiResponse<StreamStatus>>> {
    let device_id = resolve_device(&state, query).await?;
    let status = state.stream.status(&device_id).await;
    Ok(Json(ApiResponse::success(status)))
}
