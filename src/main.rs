//! Cloud Camera Bridge
//!
//! Main entry point.

use std::sync::Arc;

use cloudcam_bridge::{
    catalog::CatalogService, cloud_api::CloudClient, config::AppConfig, session::SessionManager,
    state::AppState, stream_control::StreamController, web_api,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudcam_bridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Cloud Camera Bridge v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    config.validate()?;
    tracing::info!(
        api_base = %config.api_base,
        storage_dir = %config.storage_dir.display(),
        idle_timeout_sec = config.idle_timeout.as_secs(),
        quality = config.stream_quality.as_str(),
        "Configuration loaded"
    );

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Initialize components
    let api = Arc::new(CloudClient::new(config.api_base.clone()));

    let session = Arc::new(SessionManager::new(
        api.clone(),
        config.credentials.clone(),
    ));
    tracing::info!("SessionManager initialized");

    let catalog = Arc::new(CatalogService::new(
        api.clone(),
        session.clone(),
        config.storage_dir.clone(),
        config.list_cache_ttl,
    ));
    tracing::info!("CatalogService initialized");

    let stream = Arc::new(StreamController::new(
        api,
        session.clone(),
        config.stream_quality,
        config.idle_timeout,
    ));
    tracing::info!("StreamController initialized");

    // Create application state
    let state = AppState {
        config,
        session,
        catalog,
        stream,
    };

    let app = web_api::create_router(state.clone())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
