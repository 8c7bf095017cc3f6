//! Local writes and per-entity sync endpoints used by the web layer.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use ferry_engine::{Fields, LocalId, WriteReceipt};
use serde::Deserialize;

use crate::error::Result;
use crate::queue::Priority;
use crate::sync::{EntityStatus, SyncTicket};
use crate::AppState;

/// Request body for creating an entity.
#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub kind: String,
    pub fields: Fields,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub fields: Fields,
}

/// Optional body of a sync request.
#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    pub priority: Option<Priority>,
}

/// Create entity routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/entities", post(create_entity))
        .route("/entities/{id}", put(update_entity).delete(delete_entity))
        .route("/entities/{id}/status", get(entity_status))
        .route("/entities/{id}/sync", post(request_sync))
}

/// POST /entities - Insert an entity and queue its create.
async fn create_entity(
    State(state): State<AppState>,
    Json(request): Json<CreateRequest>,
) -> Result<(StatusCode, Json<WriteReceipt>)> {
    let receipt = state
        .engine
        .record_create(&request.kind, request.fields)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// PUT /entities/{id} - Replace an entity's fields.
async fn update_entity(
    State(state): State<AppState>,
    Path(id): Path<LocalId>,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<WriteReceipt>> {
    Ok(Json(state.engine.record_update(id, request.fields).await?))
}

/// DELETE /entities/{id}
async fn delete_entity(
    State(state): State<AppState>,
    Path(id): Path<LocalId>,
) -> Result<Json<WriteReceipt>> {
    Ok(Json(state.engine.record_delete(id).await?))
}

async fn entity_status(
    State(state): State<AppState>,
    Path(id): Path<LocalId>,
) -> Result<Json<EntityStatus>> {
    Ok(Json(state.engine.sync_status(id).await?))
}

/// POST /entities/{id}/sync - Push this entity's pending changes now.
///
/// Answers immediately; the ticket tells whether a push was queued.
async fn request_sync(
    State(state): State<AppState>,
    Path(id): Path<LocalId>,
    body: Option<Json<SyncRequest>>,
) -> Result<(StatusCode, Json<SyncTicket>)> {
    let priority = body
        .and_then(|Json(request)| request.priority)
        .unwrap_or(Priority::Interactive);
    let ticket = state.engine.request_sync(id, priority).await?;
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}
