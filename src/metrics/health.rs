//! HTTP surface for probes, Prometheus scraping and engine statistics

use crate::metrics::collector::MetricsCollector;
use crate::service::app::AppState;
use crate::service::health::{HealthCheck, HealthStatus};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "matchforge";

/// Bind address of the HTTP surface
#[derive(Debug, Clone)]
pub struct HealthServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct HealthServerState {
    pub metrics_collector: Arc<MetricsCollector>,
    /// Unset until the engine is wired; probes answer 503 meanwhile
    pub app_state: Option<Arc<AppState>>,
}

pub struct HealthServer {
    config: HealthServerConfig,
    state: HealthServerState,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthServer {
    pub fn new(config: HealthServerConfig, metrics_collector: Arc<MetricsCollector>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            state: HealthServerState {
                metrics_collector,
                app_state: None,
            },
            shutdown_tx,
        }
    }

    pub fn with_app_state(mut self, app_state: Arc<AppState>) -> Self {
        self.state.app_state = Some(app_state);
        self
    }

    /// Serve until [`HealthServer::stop`] is called
    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("Invalid health server address")?;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "Health server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, self.create_router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        info!(%addr, "Health server stopped");
        Ok(())
    }

    pub fn create_router(&self) -> Router {
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/alive", get(alive_handler))
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(stats_handler))
            .with_state(self.state.clone())
    }

    pub async fn stop(&self) -> Result<()> {
        if self.shutdown_tx.send(()).is_err() {
            warn!("Health server was not serving");
        }
        Ok(())
    }
}

type JsonResponse = (StatusCode, Json<Value>);

const ENDPOINTS: [&str; 5] = ["/health", "/ready", "/alive", "/metrics", "/stats"];

async fn root_handler() -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": crate::VERSION,
        "endpoints": ENDPOINTS,
    }))
}

fn not_initialized() -> JsonResponse {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "service": SERVICE_NAME,
            "version": crate::VERSION,
            "status": HealthStatus::Unhealthy,
            "error": "engine not initialized",
        })),
    )
}

/// Degraded engines keep taking traffic; only unhealthy ones answer 503
fn status_code(status: &HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn probe(endpoint: &str, result: Result<HealthStatus>) -> JsonResponse {
    let status = result.unwrap_or_else(|e| {
        error!(endpoint, error = %e, "Probe failed");
        HealthStatus::Unhealthy
    });
    (
        status_code(&status),
        Json(json!({
            "service": SERVICE_NAME,
            "version": crate::VERSION,
            "status": status,
        })),
    )
}

/// Full component report
async fn health_handler(State(state): State<HealthServerState>) -> JsonResponse {
    let Some(app_state) = &state.app_state else {
        return not_initialized();
    };
    match HealthCheck::check(app_state.clone()).await {
        Ok(health) => (status_code(&health.status), Json(json!(health))),
        Err(e) => probe("health", Err(e)),
    }
}

async fn ready_handler(State(state): State<HealthServerState>) -> JsonResponse {
    match &state.app_state {
        Some(app_state) => probe("ready", HealthCheck::readiness_check(app_state.clone()).await),
        None => not_initialized(),
    }
}

async fn alive_handler(State(state): State<HealthServerState>) -> JsonResponse {
    match &state.app_state {
        Some(app_state) => probe("alive", HealthCheck::liveness_check(app_state.clone()).await),
        None => not_initialized(),
    }
}

/// Prometheus text exposition of the engine registry
async fn metrics_handler(State(state): State<HealthServerState>) -> Response {
    let families = state.metrics_collector.registry().gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Pool, match and scheduler counters; served even while the engine is stopped
async fn stats_handler(State(state): State<HealthServerState>) -> JsonResponse {
    let Some(app_state) = &state.app_state else {
        return not_initialized();
    };
    let health = match HealthCheck::check(app_state.clone()).await {
        Ok(health) => health,
        Err(e) => return probe("stats", Err(e)),
    };

    let stats = &health.stats;
    (
        StatusCode::OK,
        Json(json!({
            "service": {
                "name": health.service,
                "version": health.version,
                "status": health.status,
            },
            "tickets": {
                "waiting": stats.tickets_waiting,
                "matched": stats.tickets_matched,
            },
            "matches": {
                "active": stats.active_matches,
                "created": stats.matches_created,
                "ended": stats.matches_ended,
            },
            "scheduler": {
                "passes_run": stats.passes_run,
                "external_failures": stats.external_failures,
            },
            "components": health.checks,
            "timestamp": health.timestamp,
        })),
    )
}
