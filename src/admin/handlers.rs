//! Admin API handlers.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::AdminState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check handler.
pub async fn health_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: if state.is_healthy() { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    if state.is_healthy() {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Stats response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub sessions: usize,
    pub bridges: Vec<BridgeStats>,
    pub bus: BusStats,
    pub hooks: HookStats,
    pub modules: Vec<String>,
    pub datagram: Vec<DatagramStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStats {
    pub name: String,
    pub sessions: usize,
    pub max_sessions: usize,
    pub dropped_deliveries: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub addresses: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookStats {
    pub handlers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatagramStats {
    pub name: String,
    pub kind: String,
    pub local_addr: Option<String>,
    pub handled: u64,
}

/// Stats handler.
pub async fn stats_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let bridges = state.bridge_stats();
    let gateway = state.gateway();

    let response = StatsResponse {
        uptime_seconds: state.uptime().as_secs(),
        sessions: bridges.iter().map(|b| b.sessions).sum(),
        bridges,
        bus: BusStats {
            addresses: gateway.bus().address_count(),
        },
        hooks: HookStats {
            handlers: gateway.hooks().handler_count(),
        },
        modules: gateway.modules().loaded(),
        datagram: state.datagram_stats(),
    };

    Json(response)
}

/// Metrics handler (Prometheus format).
pub async fn metrics_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    match state.render_metrics() {
        Some(output) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        None => (
            StatusCode::NOT_FOUND,
            [("content-type", "text/plain; charset=utf-8")],
            "metrics disabled\n".to_string(),
        ),
    }
}

/// Readiness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub ready: bool,
}

/// Ready handler (for Kubernetes).
pub async fn ready_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let ready = state.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadyResponse { ready }))
}

/// Live handler (for Kubernetes).
pub async fn live_handler() -> impl IntoResponse {
    StatusCode::OK
}
