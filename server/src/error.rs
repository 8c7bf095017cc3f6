//! Unified error handling for the server.

use crate::store::StoreError;
use crate::sync::SyncError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Sync(SyncError::Store(err))
    }
}

impl From<ferry_engine::Error> for AppError {
    fn from(err: ferry_engine::Error) -> Self {
        AppError::Sync(SyncError::Store(StoreError::Engine(err)))
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

fn engine_status(err: &ferry_engine::Error) -> StatusCode {
    use ferry_engine::Error as E;
    match err {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        E::UnknownKind(_) | E::Mapping { .. } | E::CorruptPayload { .. } => {
            StatusCode::BAD_REQUEST
        }
        E::InvalidTransition { .. }
        | E::OutOfOrder { .. }
        | E::InvalidChangeState { .. }
        | E::ConflictAlreadyResolved(_)
        | E::EntityDeleted(_)
        | E::ExternalIdTaken { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::Sync(SyncError::Store(StoreError::Engine(e))) => {
                let status = engine_status(e);
                if status.is_server_error() {
                    tracing::error!("Engine error: {:?}", e);
                } else {
                    tracing::warn!("Engine error: {:?}", e);
                }
                (status, e.to_string(), None)
            }
            AppError::Sync(SyncError::Store(e)) => {
                tracing::error!("Store error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Store error".to_string(),
                    None,
                )
            }
            AppError::Sync(SyncError::Queue(e)) => {
                tracing::warn!("Queue error: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string(), None)
            }
            AppError::Sync(SyncError::Client(e)) => {
                tracing::error!("External API error: {}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    "External API error".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Sync(SyncError::UnknownKind(kind)) => {
                (StatusCode::BAD_REQUEST, format!("unknown entity kind: {kind}"), None)
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
