//! `geoswipe` server binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use geoswipe::config::ServerConfig;
use geoswipe::server::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::parse();
    let state = AppState::new(config.pipeline_options(), config.workers, config.queue_depth)
        .context("Failed to prepare storage and conversion workers")?;
    info!(
        upload_dir = %config.upload_dir.display(),
        processed_dir = %config.processed_dir.display(),
        workers = config.workers,
        "Storage ready"
    );

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(address = %config.bind, "Listening");

    axum::serve(listener, router(Arc::new(state)))
        .await
        .context("Server error")?;
    Ok(())
}
