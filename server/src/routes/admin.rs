//! Admin endpoints: conflicts, failed operations and mapping diagnostics.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use ferry_engine::{
    ChangeId, ChangeLogEntry, Committed, ConflictDecision, ConflictId, ConflictRecord,
    ConflictStatus, MappingDiagnostic, Outcome,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ConflictQuery {
    pub status: Option<String>,
}

/// Result of an admin action.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub outcome: Outcome,
    /// Change log entries appended by the action
    pub change_ids: Vec<ChangeId>,
}

impl From<Committed> for ActionResponse {
    fn from(committed: Committed) -> Self {
        Self {
            outcome: committed.outcome,
            change_ids: committed.change_ids,
        }
    }
}

/// Create admin routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/{id}/resolve", post(resolve_conflict))
        .route("/operations/failed", get(list_failed))
        .route("/operations/{id}/retry", post(retry_failed))
        .route("/diagnostics", get(list_diagnostics))
}

/// GET /conflicts?status=unresolved
async fn list_conflicts(
    State(state): State<AppState>,
    Query(query): Query<ConflictQuery>,
) -> Result<Json<Vec<ConflictRecord>>> {
    let status = match query.status.as_deref() {
        None | Some("all") => None,
        Some(raw) => Some(
            ConflictStatus::parse(raw)
                .ok_or_else(|| AppError::BadRequest(format!("unknown conflict status: {raw}")))?,
        ),
    };
    Ok(Json(state.engine.list_conflicts(status).await?))
}

/// POST /conflicts/{id}/resolve
///
/// Body: `{"decision": "take_local"}`, `{"decision": "take_remote"}` or
/// `{"decision": "merged", "fields": {...}}`.
async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<ConflictId>,
    Json(decision): Json<ConflictDecision>,
) -> Result<Json<ActionResponse>> {
    let committed = state.engine.resolve_conflict(id, decision).await?;
    Ok(Json(committed.into()))
}

async fn list_failed(State(state): State<AppState>) -> Result<Json<Vec<ChangeLogEntry>>> {
    Ok(Json(state.engine.list_failed_operations().await?))
}

/// POST /operations/{id}/retry
async fn retry_failed(
    State(state): State<AppState>,
    Path(id): Path<ChangeId>,
) -> Result<Json<ActionResponse>> {
    let committed = state.engine.retry_failed_operation(id).await?;
    Ok(Json(committed.into()))
}

async fn list_diagnostics(State(state): State<AppState>) -> Result<Json<Vec<MappingDiagnostic>>> {
    Ok(Json(state.engine.list_diagnostics().await?))
}
