//! ---
//! pdk_section: "01-core-functionality"
//! pdk_subsection: "binary"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Binary entrypoint for the paddock replay daemon."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use paddock_common::config::AppConfig;
use paddock_common::logging::init_tracing;
use paddock_metrics::{new_registry, spawn_http_server, ReplayMetrics};
use paddock_net::{RestApiBuilder, WsServerBuilder};
use paddock_replay::ReplayEngine;
use paddock_store::catalog::SessionCatalog;
use paddock_store::{RedisTelemetryStore, TelemetryStore};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "paddock telemetry replay daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/paddock.toml"));
    candidates.push(PathBuf::from("configs/example.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    init_tracing("paddockd", &config.logging)?;
    info!(config = %loaded.source.display(), sessions = config.sessions.len(), "configuration loaded");

    run_daemon(config).await
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let registry = new_registry();
    let replay_metrics =
        ReplayMetrics::new(&registry).context("failed to register replay metrics")?;

    let metrics_server = if config.metrics.enabled {
        Some(spawn_http_server(registry, config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    // An unreachable store here is fatal; after boot, read failures degrade
    // to empty batches.
    let store: Arc<dyn TelemetryStore> = Arc::new(
        RedisTelemetryStore::connect(&config.redis)
            .await
            .context("telemetry store unreachable at startup")?
            .with_metrics(replay_metrics.clone()),
    );
    info!(url = %config.redis.url, "telemetry store connected");

    let catalog = Arc::new(SessionCatalog::load(store.clone(), config.sessions.clone()).await);
    let engine = Arc::new(ReplayEngine::new(
        store,
        catalog.clone(),
        config.replay.clone(),
        Some(replay_metrics),
    ));
    let sweep = engine.spawn_retention_sweep();

    let ws_server = WsServerBuilder::new(config.ws.listen, engine.clone(), catalog.clone())
        .spawn()
        .await?;

    let rest_server = if config.api.enabled {
        Some(
            RestApiBuilder::new(config.api.listen, engine.clone(), catalog.clone())
                .spawn()
                .await?,
        )
    } else {
        info!("rest api disabled by configuration");
        None
    };

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    ws_server.shutdown().await?;
    if let Some(server) = rest_server {
        server.shutdown().await?;
    }
    if let Some(server) = metrics_server {
        if let Err(err) = server.shutdown().await {
            warn!(error = %err, "metrics server shutdown failed");
        }
    }
    sweep.abort();

    info!("shutdown complete");
    Ok(())
}
