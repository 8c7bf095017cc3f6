//! Ferry Server - sync runtime between the local store and the external
//! document store.

use ferry_server::client::{HttpExternalApi, RateLimitedClient};
use ferry_server::config::Config;
use ferry_server::store::{LocalStore, MemoryStore, PgStore};
use ferry_server::sync::SyncEngine;
use ferry_server::{app, AppState};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long shutdown waits for running sync jobs.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Ferry Server on {}:{}", config.host, config.port);

    let store: Arc<dyn LocalStore> = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            tracing::info!("Running database migrations...");
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let mappings = config.load_mappings()?;
    if mappings.kinds.is_empty() {
        tracing::warn!("No entity mappings configured; nothing will sync");
    }

    let api = HttpExternalApi::new(&config.external_api_url, config.external_api_token.clone())?;
    let client = RateLimitedClient::per_second(
        Arc::new(api),
        config.rate_limit_per_second,
        config.request_timeout,
    );

    let engine = SyncEngine::new(
        store,
        Arc::new(client),
        mappings.mapper(),
        mappings.resolver(config.deployment_mode),
        config.sync_options(),
    );
    engine.start().await?;

    let app = app(AppState {
        engine: engine.clone(),
    });

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
