//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  - Prometheus text format
//!   GET /healthz  - Liveness check (always 200 if process is running)
//!   GET /readyz   - Readiness check (200 if the active storage driver is available)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::daemon::Services;

/// Gauges sampled from the live services on every scrape.
pub struct Metrics {
    registry: Registry,
    upload_sessions: Gauge,
    upload_statuses: Gauge,
    rate_limiter_keys: Gauge,
    subscribers: Gauge,
    stored_files: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("cryptdrop");
        let upload_sessions = Gauge::default();
        let upload_statuses = Gauge::default();
        let rate_limiter_keys = Gauge::default();
        let subscribers = Gauge::default();
        let stored_files = Gauge::default();

        registry.register(
            "upload_sessions",
            "Chunked uploads currently in progress",
            upload_sessions.clone(),
        );
        registry.register(
            "upload_statuses",
            "Upload status entries held for reporting",
            upload_statuses.clone(),
        );
        registry.register(
            "rate_limiter_keys",
            "Clients tracked by the rate limiter",
            rate_limiter_keys.clone(),
        );
        registry.register(
            "event_subscribers",
            "Connected live event subscribers",
            subscribers.clone(),
        );
        registry.register(
            "stored_files",
            "File records in the metadata store",
            stored_files.clone(),
        );

        Self {
            registry,
            upload_sessions,
            upload_statuses,
            rate_limiter_keys,
            subscribers,
            stored_files,
        }
    }

    pub async fn refresh(&self, services: &Services) {
        self.upload_sessions
            .set(services.pipeline.assembler().len() as i64);
        self.upload_statuses.set(services.status.len() as i64);
        self.rate_limiter_keys.set(services.limiter.len() as i64);
        self.subscribers
            .set(services.publisher.subscriber_count() as i64);
        match services.files.file_count().await {
            Ok(n) => {
                self.stored_files.set(n as i64);
            }
            Err(e) => tracing::warn!("metrics: counting files failed: {e}"),
        }
    }

    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut body = String::new();
        encode(&mut body, &self.registry)?;
        Ok(body)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state of the metrics endpoint
#[derive(Clone)]
pub struct HealthState {
    pub metrics: Arc<Metrics>,
    pub services: Arc<Services>,
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9100")
/// until `cancel` fires.
pub async fn serve(addr: String, state: HealthState, cancel: CancellationToken) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    state.metrics.refresh(&state.services).await;
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness check: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check: returns 200 if the active driver is available, 503 otherwise.
async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    if state.services.drivers.current().is_available().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
    }
}
