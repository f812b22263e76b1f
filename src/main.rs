//! Bitget Orders Backend - HTTP front for the historical order extraction pipeline.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bitget_orders_backend::{
    api::{create_router, AppState},
    config::PipelineConfig,
    load_env,
    pipeline::PipelineCoordinator,
    scrapers::{BitgetCredentials, BitgetRestClient},
    storage::open_blob_store,
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🚀 Bitget order extraction backend starting");

    let config = PipelineConfig::from_env().context("Invalid pipeline configuration")?;
    info!(
        lookback_days = config.horizon.lookback_days,
        window_days = config.horizon.window_days,
        discovery_concurrency = config.discovery.concurrency,
        extraction_concurrency = config.extraction.concurrency,
        backend = ?config.storage.backend,
        "⚙️ Pipeline configuration loaded"
    );

    let creds = BitgetCredentials::from_env()
        .context("BITGET_API_KEY, BITGET_SECRET_KEY and BITGET_PASSPHRASE must be set")?;
    let source = BitgetRestClient::new(creds, &config.exchange)?;
    let store = open_blob_store(&config.storage)?;

    let listen_addr = config.server.listen_addr.clone();
    let coordinator = Arc::new(PipelineCoordinator::new(config, Arc::new(source), store));
    let app = create_router(AppState::new(coordinator)).layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    info!("🎯 API server listening on {}", listen_addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bitget_orders_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
