//! Submission and retry endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::coordinator::Coordinator;
use crate::error::{Error, Result};
use crate::types::{JobKind, MediaType, Submission};

#[derive(Debug, Deserialize)]
pub struct SubmitRemoteRequest {
    pub url: String,
    #[serde(default)]
    pub media_type: MediaType,
}

#[derive(Debug, Deserialize)]
pub struct SubmitLocalRequest {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub id: String,
    pub stages: Vec<JobKind>,
    #[serde(default)]
    pub force_raw_stream: bool,
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub id: String,
    /// Stages that were reset; stages still running are left alone
    pub retried: Vec<JobKind>,
}

#[derive(Debug, Serialize)]
pub struct ExistsResponse {
    pub id: String,
}

/// POST /api/submit/remote
pub async fn submit_remote(
    State(coordinator): State<Coordinator>,
    Json(request): Json<SubmitRemoteRequest>,
) -> Result<(StatusCode, Json<Submission>)> {
    let submission = coordinator.submit_remote(&request.url, request.media_type)?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

/// POST /api/submit/local
pub async fn submit_local(
    State(coordinator): State<Coordinator>,
    Json(request): Json<SubmitLocalRequest>,
) -> Result<(StatusCode, Json<Submission>)> {
    let submission = coordinator.submit_local(&request.path).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

/// GET /api/exists/:resource_id
pub async fn exists(
    State(coordinator): State<Coordinator>,
    Path(resource_id): Path<String>,
) -> Result<Json<ExistsResponse>> {
    coordinator
        .exists(&resource_id)?
        .map(|id| Json(ExistsResponse { id }))
        .ok_or_else(|| Error::not_found(resource_id))
}

/// POST /api/retry
pub async fn retry(
    State(coordinator): State<Coordinator>,
    Json(request): Json<RetryRequest>,
) -> Result<Json<RetryResponse>> {
    if request.stages.is_empty() {
        return Err(Error::InvalidRequest("No stages to retry".to_string()));
    }

    let retried = coordinator.retry(&request.id, &request.stages, request.force_raw_stream)?;
    Ok(Json(RetryResponse {
        id: request.id,
        retried,
    }))
}
