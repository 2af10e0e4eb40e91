//! OAuth credential server
//!
//! Single-binary service that:
//! 1. Loads configuration and resolves the at-rest encryption key
//! 2. Restores the credential stores from their encrypted files
//! 3. Sweeps stale credentials on a fixed interval
//! 4. Serves health, Prometheus metrics and an admin sweep endpoint
//! 5. Flushes every store to disk on SIGINT/SIGTERM

mod config;
mod metrics;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oauth_engine::{HealthReport, OAuthEngine, spawn_sweep_task};

use crate::config::Config;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    engine: Arc<OAuthEngine>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/sweep", post(sweep_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL, then RUST_LOG, then "info"
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting oauth-server");

    // Recorder must exist before the stores emit their first counter
    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        persistent = config.engine.storage.persistent,
        storage_dir = %config.engine.storage.dir.display(),
        sweep_interval_secs = config.engine.sweep.interval_secs,
        "configuration loaded"
    );

    let engine = OAuthEngine::initialize(config.engine.clone())
        .await
        .context("failed to initialize oauth engine")?;
    let engine = Arc::new(engine);

    let sweeper = spawn_sweep_task(Arc::clone(&engine), config.engine.sweep.interval());

    let app = build_router(
        AppState {
            engine: Arc::clone(&engine),
            prometheus: prometheus_handle,
            started_at: Instant::now(),
        },
        config.server.max_connections,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the signal fires, not when the server starts
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    let drain_timeout = config.server.drain_timeout();
    match tokio::time::timeout(drain_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = drain_timeout.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    sweeper.abort();

    // Persist whatever the last debounce window still holds
    engine
        .flush()
        .await
        .context("failed to flush credential stores on shutdown")?;

    info!("shutdown complete");
    Ok(())
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    uptime_seconds: u64,
    #[serde(flatten)]
    report: HealthReport,
}

/// 200 when the engine reports healthy, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.engine.health().await;
    let status_code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = HealthBody {
        status: if report.healthy { "healthy" } else { "unhealthy" },
        uptime_seconds: state.started_at.elapsed().as_secs(),
        report,
    };
    (status_code, axum::Json(body))
}

/// Prometheus metrics endpoint; refreshes store gauges before rendering.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    metrics::publish_engine_metrics(&state.engine.metrics().await);
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// POST /admin/sweep: run a sweep now and return per-store removal counts.
async fn sweep_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.engine.sweep().await;
    metrics::publish_engine_metrics(&state.engine.metrics().await);
    info!(removed = report.total(), "admin sweep");
    (StatusCode::OK, axum::Json(report))
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
