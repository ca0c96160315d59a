use anyhow::{Context as _, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::admin::{AdminServer, AdminState};
use crate::config::Config;
use crate::datagram::DatagramService;
use crate::telemetry::Metrics;
use crate::transport::WebSocketListener;

use super::gateway::Gateway;
use super::shutdown::ShutdownManager;

/// Main eventgate server
///
/// Components:
/// - Gateway: context workers, hooks, modules, bus, bridges
/// - WebSocket listeners: one per bridge
/// - Datagram services: echo or bus feed, each on its own context
/// - Admin server: health, stats and Prometheus metrics
/// - Shutdown manager: graceful drain with configurable timeout
pub struct Server {
    /// Configuration
    config: Arc<Config>,

    /// Shutdown manager
    shutdown: Arc<ShutdownManager>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self> {
        let shutdown = ShutdownManager::new(config.settings.shutdown.drain_timeout);

        Ok(Self {
            config: Arc::new(config),
            shutdown,
        })
    }

    /// Run the server until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let span = info_span!("eventgate", version = env!("CARGO_PKG_VERSION"));
        let result = self.serve(wait_for_signal()).instrument(span).await;

        // Flush tracing
        crate::telemetry::shutdown_tracing();

        result
    }

    /// Run the server until `stop` resolves, then drain.
    pub async fn serve<F>(&self, stop: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        info!(
            bridges = self.config.bridges.len(),
            datagram = self.config.datagram.len(),
            modules = self.config.modules.len(),
            workers = self.config.settings.workers,
            "starting eventgate server"
        );

        let metrics = if self.config.admin.metrics {
            Some(Metrics::install()?)
        } else {
            None
        };

        let gateway = Arc::new(Gateway::new(self.config.clone())?);
        let services: Arc<[DatagramService]> = gateway.start_datagram().await?.into();

        for service in services.iter() {
            info!(
                name = %service.name(),
                kind = service.kind(),
                address = ?service.local_addr(),
                "datagram service configured"
            );
        }

        // Start one WebSocket listener per bridge
        let mut listeners = JoinSet::new();
        for (config, bridge) in self.config.bridges.iter().zip(gateway.bridges()) {
            let listener = WebSocketListener::bind(config.address, &config.prefix, bridge.clone())
                .await
                .with_context(|| format!("failed to bind bridge {} on {}", config.name, config.address))?;

            info!(
                name = %config.name,
                address = %listener.local_addr(),
                prefix = %config.prefix,
                inbound_rules = config.inbound_permitted.len(),
                outbound_rules = config.outbound_permitted.len(),
                "bridge configured"
            );

            let token = self.shutdown.listener_token();
            let name = config.name.clone();
            listeners.spawn(async move {
                if let Err(e) = listener.serve(token).await {
                    error!(bridge = %name, error = %e, "websocket listener failed");
                }
            });
        }

        // Start admin server
        let admin_state = Arc::new(AdminState::new(gateway.clone(), services.clone(), metrics));
        let admin_token = CancellationToken::new();
        let admin_handle = if self.config.admin.health || self.config.admin.metrics {
            let admin = AdminServer::bind(&self.config.admin, admin_state.clone())
                .await
                .with_context(|| format!("failed to bind admin server on {}", self.config.admin.address))?;
            let token = admin_token.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = admin.run(token).await {
                    error!(error = %e, "admin server failed");
                }
            }))
        } else {
            None
        };

        admin_state.set_ready(true);
        metrics::counter!("eventgate_server_starts_total").increment(1);

        info!(
            admin_address = %self.config.admin.address,
            metrics = self.config.admin.metrics,
            health = self.config.admin.health,
            hook_timeout_ms = self.config.settings.hook_timeout.as_millis() as u64,
            drain_timeout_ms = self.config.settings.shutdown.drain_timeout.as_millis() as u64,
            "eventgate server started"
        );

        stop.await;

        info!("shutdown signal received, starting graceful shutdown");
        admin_state.set_ready(false);

        let drained = self
            .shutdown
            .drain(async {
                let closed = gateway.close_sessions("server shutdown").await;
                for service in services.iter() {
                    service.stop().await;
                }
                while listeners.join_next().await.is_some() {}
                info!(sessions = closed, "sessions drained");
            })
            .await;

        if !drained {
            warn!(listeners = listeners.len(), "aborting listeners");
            listeners.abort_all();
        }

        // Stop admin server
        admin_token.cancel();
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }

        info!("eventgate server stopped");

        Ok(())
    }

    /// Get shutdown manager
    pub fn shutdown_manager(&self) -> Arc<ShutdownManager> {
        self.shutdown.clone()
    }
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}
