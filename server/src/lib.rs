//! Ferry Server - keeps a local store in sync with a rate-limited external
//! document store.
//!
//! The deterministic rules live in `ferry-engine`; this crate adds the IO:
//! storage backends, the external API client, the request queue with its
//! worker pool, the sync runtime and an HTTP surface for the web layer and
//! admin tooling.

pub mod client;
pub mod config;
pub mod error;
pub mod queue;
pub mod routes;
pub mod store;
pub mod sync;

use crate::sync::SyncEngine;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: SyncEngine,
}

/// Build the HTTP application.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
