//! ---
//! pdk_section: "03-observability"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Metrics collection and export utilities."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the daemon.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let local_addr = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %local_addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_str(encoder.format_type()).unwrap_or_else(|_| {
                    HeaderValue::from_static("text/plain; version=0.0.4")
                }),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the replay engine and the stream store adapter.
#[derive(Clone)]
pub struct ReplayMetrics {
    active_sessions: IntGauge,
    connected_clients: IntGauge,
    batches_emitted: IntCounterVec,
    buffer_refills: IntCounterVec,
    store_read_failures: IntCounter,
    store_read_seconds: Histogram,
}

impl ReplayMetrics {
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let active_sessions = IntGauge::with_opts(Opts::new(
            "paddock_active_replay_sessions",
            "Number of replay sessions currently held in memory",
        ))?;
        registry.register(Box::new(active_sessions.clone()))?;

        let connected_clients = IntGauge::with_opts(Opts::new(
            "paddock_connected_clients",
            "Number of subscribed playback clients",
        ))?;
        registry.register(Box::new(connected_clients.clone()))?;

        let batches_emitted = IntCounterVec::new(
            Opts::new(
                "paddock_batches_emitted_total",
                "Telemetry batches produced per session",
            ),
            &["session"],
        )?;
        registry.register(Box::new(batches_emitted.clone()))?;

        let buffer_refills = IntCounterVec::new(
            Opts::new(
                "paddock_buffer_refills_total",
                "Pre-fetch buffer refills per session",
            ),
            &["session"],
        )?;
        registry.register(Box::new(buffer_refills.clone()))?;

        let store_read_failures = IntCounter::with_opts(Opts::new(
            "paddock_store_read_failures_total",
            "Stream store reads that failed or timed out",
        ))?;
        registry.register(Box::new(store_read_failures.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let store_read_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "paddock_store_read_seconds",
                "Latency of stream store reads",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(store_read_seconds.clone()))?;

        Ok(Self {
            active_sessions,
            connected_clients,
            batches_emitted,
            buffer_refills,
            store_read_failures,
            store_read_seconds,
        })
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.set(count as i64);
    }

    pub fn client_connected(&self) {
        self.connected_clients.inc();
    }

    pub fn client_disconnected(&self) {
        self.connected_clients.dec();
    }

    pub fn record_batch(&self, session: &str) {
        self.batches_emitted.with_label_values(&[session]).inc();
    }

    pub fn record_refill(&self, session: &str) {
        self.buffer_refills.with_label_values(&[session]).inc();
    }

    pub fn record_store_read_failure(&self) {
        self.store_read_failures.inc();
    }

    pub fn observe_store_read(&self, seconds: f64) {
        self.store_read_seconds.observe(seconds);
    }
}
