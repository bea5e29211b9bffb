use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::{VerifierService, BUS_NAME, OBJECT_PATH};
use engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "voteridd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        liveness_model = %config.liveness_model,
        encoder_model = %config.encoder_model,
        match_threshold = config.match_threshold,
        worker_threads = config.worker_threads,
        bus = ?config.bus,
        "configuration loaded"
    );

    let engine = Arc::new(Engine::new(&config));
    if config.preload {
        engine.preload().await;
    }

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, VerifierService::new(Arc::clone(&engine)))?
        .build()
        .await
        .with_context(|| format!("failed to claim {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "voteridd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("voteridd shutting down");

    Ok(())
}
