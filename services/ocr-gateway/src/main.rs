//! OCR gateway
//!
//! Single-binary Rust service that:
//! 1. Loads an OCR.space key pool (durable records or a plain key list)
//! 2. Accepts base64 images on `POST /ocr`
//! 3. Rotates keys on quota rejection and charges the key that succeeded
//! 4. Reports pool health on `/health` and Prometheus series on `/metrics`

mod config;
mod error;
mod handler;
mod metrics;
mod space;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use key_pool::{LeastUsedWithExpiry, QuotaRetryController, RoundRobin, UsageRecorder};
use key_store::{FileCredentialStore, parse_key_list};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::{Config, Strategy};
use crate::handler::{GatewayStats, OcrState};
use crate::space::SpaceOcrClient;

/// Time allowed for in-flight requests to finish after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    ocr: OcrState,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` bounds concurrently served requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ocr", post(ocr_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Assemble the rotation core for the configured strategy.
///
/// Returns the durable store too (least_used only) so it can be reloaded.
async fn build_controller(
    config: &Config,
    http: reqwest::Client,
) -> Result<(QuotaRetryController, Option<Arc<FileCredentialStore>>)> {
    let client = Arc::new(SpaceOcrClient::new(
        http,
        config.ocr.endpoint.clone(),
        config.ocr.language.clone(),
        config.ocr.engine,
    ));

    match config.pool.strategy {
        Strategy::LeastUsed => {
            let path = config
                .pool
                .credentials_path
                .clone()
                .context("least_used strategy needs pool.credentials_path")?;
            let store = Arc::new(
                FileCredentialStore::load(path.clone())
                    .await
                    .with_context(|| format!("failed to load credentials from {}", path.display()))?,
            );
            if store.is_empty().await {
                warn!(path = %path.display(), "credential store is empty, every request will be rejected until keys are provisioned");
            }
            let controller = QuotaRetryController::new(
                Arc::new(LeastUsedWithExpiry::new(store.clone())),
                client,
            )
            .with_recorder(UsageRecorder::new(store.clone()));
            Ok((controller, Some(store)))
        }
        Strategy::RoundRobin => {
            let raw = config
                .pool
                .api_keys
                .as_ref()
                .map(|k| k.expose().as_str())
                .unwrap_or_default();
            let keys = parse_key_list(raw, None);
            if keys.is_empty() {
                warn!("round-robin key list is empty, every request will be rejected");
            }
            let controller = QuotaRetryController::new(Arc::new(RoundRobin::new(keys)), client);
            Ok((controller, None))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting ocr-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
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
        strategy = ?config.pool.strategy,
        endpoint = %config.ocr.endpoint,
        timeout_secs = config.server.timeout_secs,
        "configuration loaded"
    );

    let timeout = Duration::from_secs(config.server.timeout_secs);
    let http = SpaceOcrClient::http_client().context("failed to build HTTP client")?;
    let (controller, store) = build_controller(&config, http).await?;

    if let Some(store) = store {
        tokio::spawn(reload_on_sighup(store));
    }

    let stats = GatewayStats::new();
    let in_flight = stats.in_flight.clone();
    let app_state = AppState {
        ocr: OcrState {
            controller: Arc::new(controller),
            timeout,
            stats,
        },
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
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

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Pool health plus request counters.
/// Returns 200 when the pool is healthy or degraded, 503 when no key is usable.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = &state.ocr.stats;
    let mut body = state.ocr.controller.policy().health().await;

    let status_code = match body.get("status").and_then(|s| s.as_str()) {
        Some("healthy") | Some("degraded") => axum::http::StatusCode::OK,
        _ => axum::http::StatusCode::SERVICE_UNAVAILABLE,
    };

    if let Some(obj) = body.as_object_mut() {
        obj.insert(
            "uptime_seconds".into(),
            stats.started_at.elapsed().as_secs().into(),
        );
        obj.insert(
            "requests_served".into(),
            stats.requests_total.load(Ordering::Relaxed).into(),
        );
        obj.insert(
            "errors_total".into(),
            stats.errors_total.load(Ordering::Relaxed).into(),
        );
        obj.insert(
            "in_flight".into(),
            stats.in_flight.load(Ordering::Relaxed).into(),
        );
    }

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn ocr_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    handler::recognize(&state.ocr, &body, request_id).await
}

/// Re-read the credential file on every SIGHUP.
#[cfg(unix)]
async fn reload_on_sighup(store: Arc<FileCredentialStore>) {
    let mut hangup =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "failed to install SIGHUP handler, credential reload disabled");
                return;
            }
        };
    while hangup.recv().await.is_some() {
        match store.reload().await {
            Ok(keys) => info!(keys, "credential store reloaded on SIGHUP"),
            Err(e) => error!(error = %e, "credential reload failed, keeping previous records"),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_sighup(_store: Arc<FileCredentialStore>) {}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
