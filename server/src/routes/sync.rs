//! Sync trigger routes.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Serialize;

use crate::error::Result;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct BackgroundSyncResponse {
    /// Pulls queued by this request
    pub scheduled: usize,
}

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/sync/background", post(background_sync))
}

/// POST /sync/background - Queue a pull of every kind plus due pushes.
async fn background_sync(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<BackgroundSyncResponse>)> {
    let scheduled = state.engine.schedule_background_sync().await?;
    Ok((StatusCode::ACCEPTED, Json(BackgroundSyncResponse { scheduled })))
}
