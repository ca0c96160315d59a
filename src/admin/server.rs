//! Admin HTTP server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bootstrap::Gateway;
use crate::config::AdminConfig;
use crate::datagram::DatagramService;
use crate::telemetry::Metrics;

use super::handlers::{
    health_handler, live_handler, metrics_handler, ready_handler, stats_handler, BridgeStats, DatagramStats,
};

/// Admin server state.
pub struct AdminState {
    /// Server start time
    start_time: Instant,
    /// Is the server healthy
    healthy: AtomicBool,
    /// Is the server ready
    ready: AtomicBool,
    /// Gateway components (for stats)
    gateway: Arc<Gateway>,
    /// Running datagram services
    services: Arc<[DatagramService]>,
    /// Prometheus recorder, when metrics are enabled
    metrics: Option<Metrics>,
}

impl AdminState {
    pub fn new(gateway: Arc<Gateway>, services: Arc<[DatagramService]>, metrics: Option<Metrics>) -> Self {
        Self {
            start_time: Instant::now(),
            healthy: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            gateway,
            services,
            metrics,
        }
    }

    /// Get uptime.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Check if healthy.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Set health status.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Check if ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Set ready status.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Rendered Prometheus text, if metrics are enabled.
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(Metrics::render)
    }

    /// Per-bridge session counts.
    pub fn bridge_stats(&self) -> Vec<BridgeStats> {
        self.gateway
            .bridges()
            .iter()
            .map(|bridge| BridgeStats {
                name: bridge.name().to_string(),
                sessions: bridge.session_count(),
                max_sessions: bridge.limits().max_sessions,
                dropped_deliveries: bridge.dropped_deliveries(),
            })
            .collect()
    }

    /// Per-service datagram counts.
    pub fn datagram_stats(&self) -> Vec<DatagramStats> {
        self.services
            .iter()
            .map(|service| DatagramStats {
                name: service.name().to_string(),
                kind: service.kind().to_string(),
                local_addr: service.local_addr().map(|a| a.to_string()),
                handled: service.handled(),
            })
            .collect()
    }
}

/// Admin HTTP server.
pub struct AdminServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<AdminState>,
}

impl AdminServer {
    /// Bind the admin server.
    pub async fn bind(config: &AdminConfig, state: Arc<AdminState>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.address).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Build the router.
    fn build_router(&self) -> Router {
        Router::new()
            // Kubernetes-style health endpoints
            .route("/healthz", get(health_handler))
            .route("/livez", get(live_handler))
            .route("/readyz", get(ready_handler))
            // Metrics and stats
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
    }

    /// Run the admin server until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let router = self.build_router();

        info!(address = %self.local_addr, "starting admin server");

        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("admin server shutting down");
            })
            .await?;

        Ok(())
    }
}
