//! API Routes
//!
//! Read-only HTTP endpoints for health checks, metrics and status

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::Metrics;
use crate::classes::ClassTable;
use crate::types::Identity;

/// Shared API state
pub struct ApiState {
    pub identity: Option<Identity>,
    pub table: Arc<ClassTable>,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health_check))
        .route("/status", get(get_status))

        // Metrics
        .route("/metrics", get(get_metrics_prometheus))
        .route("/metrics/json", get(get_metrics_json))

        // Configuration
        .route("/classes", get(get_classes))

        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_api_server(port: u16, state: Arc<ApiState>) -> anyhow::Result<()> {
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("📊 HTTP API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// GET /health - Simple health check
async fn health_check() -> impl IntoResponse {
    "OK"
}

/// GET /status - Identity, installed ports and the last tick
async fn get_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let metrics = &state.metrics;
    let tpu = metrics.tpu_port.load(Ordering::Relaxed);

    let ports = (tpu != 0).then(|| {
        serde_json::json!({
            "tpu": tpu,
            "tpu_quic": metrics.tpu_quic_port.load(Ordering::Relaxed),
        })
    });

    let status = serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": metrics.uptime_secs(),
        "identity": state.identity.as_ref().map(Identity::as_str),
        "ports": ports,
        "last_tick": {
            "at": metrics.last_tick(),
            "nodes": metrics.nodes_seen.load(Ordering::Relaxed),
            "classified": metrics.peers_classified.load(Ordering::Relaxed),
            "skipped": metrics.peers_skipped.load(Ordering::Relaxed),
        },
    });

    Json(status)
}

/// GET /metrics - Prometheus format metrics
async fn get_metrics_prometheus(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.to_prometheus(),
    )
}

/// GET /metrics/json - JSON format metrics
async fn get_metrics_json(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.metrics.to_json())
}

/// GET /classes - Configured traffic classes, highest threshold first
async fn get_classes(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "count": state.table.len(),
        "classes": state.table.classes(),
    }))
}
