//! Shared gateway components.
//!
//! Everything a running gateway owns, built once from configuration:
//! - Context pool (worker threads)
//! - Hook chain and module registry
//! - Event bus
//! - Datagram port table
//! - Bus bridges

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::{info, warn};

use crate::bridge::BusBridge;
use crate::bus::EventBus;
use crate::config::Config;
use crate::context::{ContextPool, WorkerConfig};
use crate::datagram::{DatagramService, PortTable};
use crate::hooks::HookChain;
use crate::modules::ModuleRegistry;

/// Gateway components.
///
/// Passed to the admin API and the transports. All fields are shared
/// handles; the pool's worker threads stop when the last handle drops.
pub struct Gateway {
    config: Arc<Config>,
    contexts: Arc<ContextPool>,
    hooks: Arc<HookChain>,
    modules: Arc<ModuleRegistry>,
    bus: Arc<EventBus>,
    ports: Arc<PortTable>,
    bridges: Vec<Arc<BusBridge>>,
}

impl Gateway {
    /// Build the gateway and load the configured modules.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let contexts = ContextPool::new(&WorkerConfig {
            workers: config.settings.workers,
            ..Default::default()
        })
        .context("failed to start context workers")?;
        let contexts = Arc::new(contexts);

        let hooks = Arc::new(HookChain::new(config.settings.hook_timeout));
        let modules = Arc::new(ModuleRegistry::new(hooks.clone()));
        for id in &config.modules {
            modules
                .load(id)
                .with_context(|| format!("failed to load module {id}"))?;
        }

        let bus = EventBus::new();
        let bridges = config
            .bridges
            .iter()
            .map(|bridge| {
                BusBridge::new(
                    bridge,
                    bus.clone(),
                    hooks.clone(),
                    contexts.clone(),
                    config.settings.reply_timeout,
                )
                .with_context(|| format!("invalid bridge {}", bridge.name))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            workers = contexts.workers(),
            bridges = bridges.len(),
            modules = modules.loaded().len(),
            "gateway initialized"
        );

        Ok(Self {
            config,
            contexts,
            hooks,
            modules,
            bus,
            ports: PortTable::new(),
            bridges,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn contexts(&self) -> &Arc<ContextPool> {
        &self.contexts
    }

    pub fn hooks(&self) -> &Arc<HookChain> {
        &self.hooks
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn ports(&self) -> &Arc<PortTable> {
        &self.ports
    }

    pub fn bridges(&self) -> &[Arc<BusBridge>] {
        &self.bridges
    }

    /// Find a bridge by name.
    pub fn bridge(&self, name: &str) -> Option<&Arc<BusBridge>> {
        self.bridges.iter().find(|b| b.name() == name)
    }

    /// Start every configured datagram service. Services already started
    /// are stopped again if a later one fails.
    pub async fn start_datagram(&self) -> Result<Vec<DatagramService>> {
        let mut services = Vec::with_capacity(self.config.datagram.len());

        for config in &self.config.datagram {
            match DatagramService::start(config, self.ports.clone(), &self.contexts, self.bus.clone()).await {
                Ok(service) => services.push(service),
                Err(e) => {
                    for service in &services {
                        service.stop().await;
                    }
                    return Err(e).with_context(|| format!("failed to start datagram service {}", config.name));
                }
            }
        }

        Ok(services)
    }

    /// Close every session on every bridge.
    pub async fn close_sessions(&self, reason: &str) -> usize {
        let mut closed = 0;
        for bridge in &self.bridges {
            let n = bridge.close_all(reason).await;
            if n > 0 {
                warn!(bridge = %bridge.name(), sessions = n, reason, "sessions closed");
            }
            closed += n;
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gateway_from_config() {
        let config = Config::from_yaml(
            r#"
bridges:
  - name: ws
    address: "127.0.0.1:0"
    inbound_permitted: [{}]
    outbound_permitted: [{}]
datagram:
  - name: echo
    listen: "127.0.0.1:0"
    echo: true
modules:
  - eventgate~access-log~1.0
settings:
  workers: 1
"#,
        )
        .unwrap();

        let gateway = Gateway::new(Arc::new(config)).unwrap();
        assert_eq!(gateway.bridges().len(), 1);
        assert!(gateway.bridge("ws").is_some());
        assert!(gateway.bridge("missing").is_none());
        assert!(gateway.modules().is_loaded("eventgate~access-log~1.0"));

        let services = gateway.start_datagram().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].kind(), "echo");
        assert!(services[0].local_addr().is_some());

        for service in &services {
            service.stop().await;
        }
        assert_eq!(gateway.close_sessions("test").await, 0);
    }

    #[tokio::test]
    async fn test_gateway_rejects_unknown_module() {
        let config = Config::from_yaml(
            r#"
bridges:
  - name: ws
    address: "127.0.0.1:0"
modules:
  - acme~missing~1.0
settings:
  workers: 1
"#,
        )
        .unwrap();

        assert!(Gateway::new(Arc::new(config)).is_err());
    }
}
