//! Status, item and preview endpoints

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::cache::StatusSnapshot;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::types::{MediaItem, MediaPreviews};

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct ThumbnailQuery {
    #[serde(default)]
    pub low_res: bool,
}

#[derive(Debug, Serialize)]
pub struct FrameIndex {
    pub timestamps: Vec<u32>,
    pub seconds_per_frame: Option<u32>,
}

/// GET /api/status
pub async fn status(State(coordinator): State<Coordinator>) -> Json<StatusSnapshot> {
    Json(coordinator.poll_status())
}

/// GET /api/media
pub async fn list_media(State(coordinator): State<Coordinator>) -> Result<Json<MediaPreviews>> {
    Ok(Json(coordinator.previews()?))
}

/// GET /api/media/:id
pub async fn get_media(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
) -> Result<Json<MediaItem>> {
    Ok(Json(coordinator.item(&id)?))
}

/// POST /api/media/delete
pub async fn delete_media(
    State(coordinator): State<Coordinator>,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<DeleteResponse>> {
    let deleted = coordinator.delete(&request.ids)?;
    Ok(Json(DeleteResponse { deleted }))
}

/// GET /api/thumbnail/:id
pub async fn thumbnail(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
    Query(query): Query<ThumbnailQuery>,
) -> Result<impl IntoResponse> {
    let image = coordinator.thumbnail(&id, query.low_res)?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], image))
}

/// GET /api/frames/:id
pub async fn frame_index(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
) -> Result<Json<FrameIndex>> {
    let item = coordinator.item(&id)?;
    let timestamps = coordinator.store().frame_timestamps(&id)?;
    Ok(Json(FrameIndex {
        timestamps,
        seconds_per_frame: item.seconds_per_frame,
    }))
}

/// GET /api/frame/:id/:timestamp
pub async fn frame(
    State(coordinator): State<Coordinator>,
    Path((id, timestamp)): Path<(String, u32)>,
) -> Result<impl IntoResponse> {
    let image = coordinator.frame(&id, timestamp)?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], image))
}
