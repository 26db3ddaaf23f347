//! API routes for the media server

pub mod events;
pub mod media;
pub mod settings;
pub mod submit;

use axum::{
    routing::{get, post},
    Router,
};

use crate::coordinator::Coordinator;

/// Build all API routes
pub fn api_routes() -> Router<Coordinator> {
    Router::new()
        // Submission
        .route("/submit/remote", post(submit::submit_remote))
        .route("/submit/local", post(submit::submit_local))
        .route("/exists/:resource_id", get(submit::exists))
        .route("/retry", post(submit::retry))
        // Status and items
        .route("/status", get(media::status))
        .route("/media", get(media::list_media))
        .route("/media/delete", post(media::delete_media))
        .route("/media/:id", get(media::get_media))
        // Previews
        .route("/thumbnail/:id", get(media::thumbnail))
        .route("/frames/:id", get(media::frame_index))
        .route("/frame/:id/:timestamp", get(media::frame))
        // Runtime settings
        .route(
            "/settings",
            get(settings::get_settings).post(settings::update_settings),
        )
        // Observer stream
        .route("/events", get(events::stream_events))
        .route("/info", get(info))
}

/// API info endpoint
async fn info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": "mediaflow",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /api/submit/remote": "Queue a remote video by url or id",
            "POST /api/submit/local": "Queue a local media file",
            "GET /api/exists/:resource_id": "Existing non-failed item for a remote id",
            "POST /api/retry": "Retry the processing and/or metadata stage of an item",
            "GET /api/status": "Processor status and active job progress",
            "GET /api/media": "Items grouped by status",
            "GET /api/media/:id": "One item",
            "POST /api/media/delete": "Delete items",
            "GET /api/thumbnail/:id": "Thumbnail jpeg (?low_res=true)",
            "GET /api/frames/:id": "Preview frame timestamps",
            "GET /api/frame/:id/:timestamp": "Preview frame jpeg",
            "GET /api/settings": "Current runtime settings",
            "POST /api/settings": "Change runtime settings",
            "GET /api/events": "Server-sent worker events"
        }
    }))
}
