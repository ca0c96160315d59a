use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn, Instrument};

use super::{DatagramEndpoint, DatagramError, DatagramOptions, DatagramPacket, PortTable};
use crate::bus::{BusMessage, EventBus};
use crate::config::DatagramConfig;
use crate::context::{Context, ContextPool};

/// A listening endpoint whose receive loop runs on its own context.
struct Service {
    name: String,
    endpoint: Arc<DatagramEndpoint>,
    context: Context,
    handled: Arc<AtomicU64>,
}

impl Service {
    async fn start<F>(
        name: &str,
        kind: &'static str,
        ports: Arc<PortTable>,
        listen: SocketAddr,
        options: DatagramOptions,
        contexts: &ContextPool,
        on_packet: F,
    ) -> Result<Self, DatagramError>
    where
        F: Fn(&DatagramEndpoint, DatagramPacket) -> futures::future::BoxFuture<'_, Result<(), DatagramError>>
            + Send
            + Sync
            + 'static,
    {
        let endpoint = Arc::new(DatagramEndpoint::new(ports, options));
        let local_addr = endpoint
            .listen(&listen.ip().to_string(), listen.port())
            .await?;

        let context = contexts.create();
        let handled = Arc::new(AtomicU64::new(0));
        let span = tracing::info_span!("datagram", service = %name, kind, local = %local_addr);

        let run = {
            let endpoint = endpoint.clone();
            let handled = handled.clone();
            async move {
                loop {
                    match endpoint.recv().await {
                        Ok(packet) => {
                            let sender = packet.sender;
                            if let Err(e) = on_packet(&*endpoint, packet).await {
                                warn!(%sender, error = %e, "datagram handling failed");
                            }
                            handled.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(DatagramError::EndpointClosed) => break,
                        Err(e) => {
                            warn!(error = %e, "datagram receive failed");
                            break;
                        }
                    }
                }
                debug!("datagram service stopped");
            }
            .instrument(span)
        };

        if let Err(e) = context.run(run) {
            endpoint.close().await;
            return Err(e.into());
        }

        info!(service = %name, kind, %local_addr, context = %context.id(), "datagram service started");
        Ok(Self {
            name: name.to_string(),
            endpoint,
            context,
            handled,
        })
    }

    async fn stop(&self) {
        self.endpoint.close().await;
        info!(service = %self.name, "datagram service stopped");
    }
}

/// Replies to every datagram with the same payload.
pub struct EchoService {
    inner: Service,
}

impl EchoService {
    /// Bind `listen` and start echoing.
    pub async fn start(
        name: &str,
        ports: Arc<PortTable>,
        listen: SocketAddr,
        options: DatagramOptions,
        contexts: &ContextPool,
    ) -> Result<Self, DatagramError> {
        let inner = Service::start(name, "echo", ports, listen, options, contexts, |endpoint, packet| {
            Box::pin(async move { endpoint.send_to(packet.data, packet.sender).await })
        })
        .await?;
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoint.local_addr()
    }

    /// Context the receive loop runs on.
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Datagrams echoed so far.
    pub fn echoed(&self) -> u64 {
        self.inner.handled.load(Ordering::Relaxed)
    }

    pub async fn stop(&self) {
        self.inner.stop().await
    }
}

/// Publishes every datagram payload on a bus address.
pub struct BusFeed {
    inner: Service,
    address: String,
}

impl BusFeed {
    /// Bind `listen` and publish each payload to `address`.
    pub async fn start(
        name: &str,
        ports: Arc<PortTable>,
        listen: SocketAddr,
        options: DatagramOptions,
        contexts: &ContextPool,
        bus: Arc<EventBus>,
        address: &str,
    ) -> Result<Self, DatagramError> {
        let target = address.to_string();
        let inner = Service::start(name, "bus_feed", ports, listen, options, contexts, move |_, packet| {
            let delivered = bus.publish(BusMessage::new(target.clone(), packet.data));
            debug!(address = %target, sender = %packet.sender, delivered, "datagram published");
            Box::pin(async { Ok(()) })
        })
        .await?;

        Ok(Self {
            inner,
            address: address.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Bus address payloads are published on.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoint.local_addr()
    }

    /// Datagrams published so far.
    pub fn published(&self) -> u64 {
        self.inner.handled.load(Ordering::Relaxed)
    }

    pub async fn stop(&self) {
        self.inner.stop().await
    }
}

/// A configured datagram service.
pub enum DatagramService {
    Echo(EchoService),
    Feed(BusFeed),
}

impl DatagramService {
    /// Start the service described by `config`.
    pub async fn start(
        config: &DatagramConfig,
        ports: Arc<PortTable>,
        contexts: &ContextPool,
        bus: Arc<EventBus>,
    ) -> Result<Self, DatagramError> {
        let options = config.options.clone();
        match &config.bridge_address {
            Some(address) => {
                BusFeed::start(&config.name, ports, config.listen, options, contexts, bus, address)
                    .await
                    .map(Self::Feed)
            }
            None => EchoService::start(&config.name, ports, config.listen, options, contexts)
                .await
                .map(Self::Echo),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Echo(s) => s.name(),
            Self::Feed(s) => s.name(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Echo(_) => "echo",
            Self::Feed(_) => "bus_feed",
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Echo(s) => s.local_addr(),
            Self::Feed(s) => s.local_addr(),
        }
    }

    /// Datagrams handled so far.
    pub fn handled(&self) -> u64 {
        match self {
            Self::Echo(s) => s.echoed(),
            Self::Feed(s) => s.published(),
        }
    }

    pub async fn stop(&self) {
        match self {
            Self::Echo(s) => s.stop().await,
            Self::Feed(s) => s.stop().await,
        }
    }
}
