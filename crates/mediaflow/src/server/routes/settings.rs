//! Runtime settings endpoints

use axum::{extract::State, Json};

use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::settings::{RuntimeSettings, SettingsUpdate};

/// GET /api/settings
pub async fn get_settings(State(coordinator): State<Coordinator>) -> Json<RuntimeSettings> {
    Json(coordinator.settings())
}

/// POST /api/settings
pub async fn update_settings(
    State(coordinator): State<Coordinator>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<RuntimeSettings>> {
    Ok(Json(coordinator.update_settings(update)?))
}
