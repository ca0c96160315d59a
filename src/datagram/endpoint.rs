use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ports::{bind_socket, ListenerId, PortBinding, PortTable};
use super::{DatagramError, DatagramOptions, DatagramPacket};
use crate::telemetry::counters;

/// Multicast membership key: group plus the interface it was joined on.
type Membership = (IpAddr, Option<IpAddr>);

struct Listening {
    binding: Arc<PortBinding>,
    listener: ListenerId,
}

#[derive(Default)]
struct Ephemeral {
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
}

/// A UDP endpoint.
///
/// Endpoints start unbound. `send` works immediately through a lazily bound
/// ephemeral socket; `listen` binds a local port and enables `recv`. After
/// `close` every operation fails with [`DatagramError::EndpointClosed`].
pub struct DatagramEndpoint {
    ports: Arc<PortTable>,
    options: Mutex<DatagramOptions>,
    listening: Mutex<Option<Listening>>,
    inbox: tokio::sync::Mutex<Option<mpsc::Receiver<DatagramPacket>>>,
    ephemeral: Mutex<Ephemeral>,
    memberships: Mutex<BTreeSet<Membership>>,
    closed: CancellationToken,
}

impl DatagramEndpoint {
    /// Create an unbound endpoint whose port claims go through `ports`.
    pub fn new(ports: Arc<PortTable>, options: DatagramOptions) -> Self {
        Self {
            ports,
            options: Mutex::new(options),
            listening: Mutex::new(None),
            inbox: tokio::sync::Mutex::new(None),
            ephemeral: Mutex::new(Ephemeral::default()),
            memberships: Mutex::new(BTreeSet::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Current options.
    pub fn options(&self) -> DatagramOptions {
        self.options.lock().clone()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Address of the listening socket, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening
            .lock()
            .as_ref()
            .map(|l| l.binding.local_addr())
    }

    /// Multicast groups currently joined.
    pub fn memberships(&self) -> Vec<(IpAddr, Option<IpAddr>)> {
        self.memberships.lock().iter().copied().collect()
    }

    /// Listen on `port` on all IPv4 interfaces.
    pub async fn listen_port(&self, port: u16) -> Result<SocketAddr, DatagramError> {
        self.listen("0.0.0.0", port).await
    }

    /// Bind `host:port` and start receiving. Port 0 picks an ephemeral port;
    /// the bound address is returned.
    pub async fn listen(&self, host: &str, port: u16) -> Result<SocketAddr, DatagramError> {
        self.ensure_open()?;
        let addr = resolve(host, port).await?;

        if let Some(current) = self.local_addr() {
            return Err(DatagramError::AddressInUse(current));
        }

        let options = self.options();
        let attachment = self.ports.bind(addr, options.reuse_address)?;
        let binding = attachment.binding;
        let local_addr = binding.local_addr();

        let conflict = {
            let mut listening = self.listening.lock();
            if self.is_closed() {
                Some(DatagramError::EndpointClosed)
            } else if let Some(current) = listening.as_ref() {
                Some(DatagramError::AddressInUse(current.binding.local_addr()))
            } else {
                *listening = Some(Listening {
                    binding: binding.clone(),
                    listener: attachment.listener,
                });
                None
            }
        };
        if let Some(err) = conflict {
            self.ports.release(binding, attachment.listener).await;
            return Err(err);
        }
        *self.inbox.lock().await = Some(attachment.inbox);

        if let Err(e) = self.apply_listen_options(&options) {
            self.abandon_listen().await;
            return Err(e);
        }

        debug!(%local_addr, reuse = options.reuse_address, "datagram endpoint listening");
        Ok(local_addr)
    }

    /// Send one datagram to `host:port`.
    pub async fn send(&self, data: impl Into<Bytes>, host: &str, port: u16) -> Result<(), DatagramError> {
        self.ensure_open()?;
        let target = resolve(host, port).await?;
        self.send_to(data, target).await
    }

    /// Send one datagram to `target`.
    pub async fn send_to(&self, data: impl Into<Bytes>, target: SocketAddr) -> Result<(), DatagramError> {
        self.ensure_open()?;
        let data = data.into();
        let broadcast = self.options.lock().broadcast;

        if !broadcast && is_broadcast(target.ip()) {
            return Err(DatagramError::BroadcastNotEnabled);
        }

        let socket = self.sending_socket(target)?;
        match socket.send_to(&data, target).await {
            Ok(_) => {
                counters::datagram_sent(data.len());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && !broadcast => {
                Err(DatagramError::BroadcastNotEnabled)
            }
            Err(e) => Err(DatagramError::Io(e)),
        }
    }

    /// Wait for the next datagram.
    pub async fn recv(&self) -> Result<DatagramPacket, DatagramError> {
        self.ensure_open()?;

        let mut inbox = self.inbox.lock().await;
        let inbox = inbox.as_mut().ok_or(DatagramError::NotListening)?;

        tokio::select! {
            _ = self.closed.cancelled() => Err(DatagramError::EndpointClosed),
            packet = inbox.recv() => {
                let packet = packet.ok_or(DatagramError::EndpointClosed)?;
                counters::datagram_received(packet.data.len());
                Ok(packet)
            }
        }
    }

    /// Replace the endpoint options. A listening socket picks up the new
    /// broadcast and multicast settings immediately; `reuse_address` only
    /// affects the next `listen`.
    pub fn configure(&self, options: DatagramOptions) -> Result<(), DatagramError> {
        self.ensure_open()?;
        let previous = std::mem::replace(&mut *self.options.lock(), options.clone());

        let socket = match self.listening.lock().as_ref() {
            Some(l) => l.binding.socket().clone(),
            None => {
                let ephemeral = self.ephemeral.lock();
                for socket in ephemeral.v4.iter().chain(ephemeral.v6.iter()) {
                    apply_socket_options(socket, &options)?;
                }
                return Ok(());
            }
        };

        apply_socket_options(&socket, &options)?;

        let old = (previous.multicast_group, previous.multicast_interface);
        let new = (options.multicast_group, options.multicast_interface);
        if old != new {
            if let (Some(group), interface) = old {
                if self.memberships.lock().contains(&(group, interface)) {
                    self.leave_multicast(group, interface)?;
                }
            }
            if let (Some(group), interface) = new {
                self.join_multicast(group, interface)?;
            }
        }
        Ok(())
    }

    /// Join a multicast group on the listening socket.
    pub fn join_multicast(&self, group: IpAddr, interface: Option<IpAddr>) -> Result<(), DatagramError> {
        self.ensure_open()?;
        let socket = self.listening_socket()?;

        if !group.is_multicast() {
            return Err(DatagramError::InvalidAddress(format!("{group} is not a multicast group")));
        }
        if !self.memberships.lock().insert((group, interface)) {
            return Ok(());
        }

        let joined = match (group, interface) {
            (IpAddr::V4(group), None) => socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED),
            (IpAddr::V4(group), Some(IpAddr::V4(iface))) => socket.join_multicast_v4(group, iface),
            (IpAddr::V6(group), None) => socket.join_multicast_v6(&group, 0),
            (group, Some(iface)) => {
                self.memberships.lock().remove(&(group, Some(iface)));
                return Err(DatagramError::InvalidAddress(format!(
                    "interface {iface} does not match group {group}"
                )));
            }
        };

        if let Err(e) = joined {
            self.memberships.lock().remove(&(group, interface));
            return Err(e.into());
        }
        debug!(%group, ?interface, "joined multicast group");
        Ok(())
    }

    /// Leave a multicast group previously joined with the same interface.
    pub fn leave_multicast(&self, group: IpAddr, interface: Option<IpAddr>) -> Result<(), DatagramError> {
        self.ensure_open()?;
        let socket = self.listening_socket()?;

        if !self.memberships.lock().remove(&(group, interface)) {
            return Err(DatagramError::InvalidAddress(format!("not a member of {group}")));
        }

        leave(&socket, group, interface)?;
        debug!(%group, ?interface, "left multicast group");
        Ok(())
    }

    /// Release the socket and fail every later call. Safe to call more than
    /// once.
    pub async fn close(&self) {
        self.closed.cancel();

        let listening = self.listening.lock().take();
        if let Some(Listening { binding, listener }) = listening {
            let memberships = std::mem::take(&mut *self.memberships.lock());
            for (group, interface) in memberships {
                if let Err(e) = leave(binding.socket(), group, interface) {
                    warn!(%group, error = %e, "failed to leave multicast group on close");
                }
            }

            let local_addr = binding.local_addr();
            self.ports.release(binding, listener).await;
            debug!(%local_addr, "datagram endpoint closed");
        }

        *self.ephemeral.lock() = Ephemeral::default();
        self.inbox.lock().await.take();
    }

    fn apply_listen_options(&self, options: &DatagramOptions) -> Result<(), DatagramError> {
        apply_socket_options(&*self.listening_socket()?, options)?;
        if let Some(group) = options.multicast_group {
            self.join_multicast(group, options.multicast_interface)?;
        }
        Ok(())
    }

    /// Undo a `listen` whose socket options could not be applied, so the
    /// port is not left claimed behind the error.
    async fn abandon_listen(&self) {
        self.inbox.lock().await.take();
        let listening = self.listening.lock().take();
        if let Some(Listening { binding, listener }) = listening {
            let memberships = std::mem::take(&mut *self.memberships.lock());
            for (group, interface) in memberships {
                if let Err(e) = leave(binding.socket(), group, interface) {
                    warn!(%group, error = %e, "failed to leave multicast group");
                }
            }
            self.ports.release(binding, listener).await;
        }
    }

    fn ensure_open(&self) -> Result<(), DatagramError> {
        if self.is_closed() {
            Err(DatagramError::EndpointClosed)
        } else {
            Ok(())
        }
    }

    fn listening_socket(&self) -> Result<Arc<UdpSocket>, DatagramError> {
        self.listening
            .lock()
            .as_ref()
            .map(|l| l.binding.socket().clone())
            .ok_or(DatagramError::NotListening)
    }

    fn sending_socket(&self, target: SocketAddr) -> Result<Arc<UdpSocket>, DatagramError> {
        if let Ok(socket) = self.listening_socket() {
            return Ok(socket);
        }

        let mut ephemeral = self.ephemeral.lock();
        let slot = if target.is_ipv4() {
            &mut ephemeral.v4
        } else {
            &mut ephemeral.v6
        };
        if let Some(socket) = slot {
            return Ok(socket.clone());
        }

        let any = if target.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = Arc::new(bind_socket(any)?);
        apply_socket_options(&socket, &self.options.lock())?;
        *slot = Some(socket.clone());
        Ok(socket)
    }
}

impl Drop for DatagramEndpoint {
    fn drop(&mut self) {
        if let Some(Listening { binding, listener }) = self.listening.get_mut().take() {
            self.ports.detach(&binding, listener);
        }
    }
}

impl std::fmt::Debug for DatagramEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramEndpoint")
            .field("local_addr", &self.local_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn leave(socket: &UdpSocket, group: IpAddr, interface: Option<IpAddr>) -> io::Result<()> {
    match (group, interface) {
        (IpAddr::V4(group), Some(IpAddr::V4(iface))) => socket.leave_multicast_v4(group, iface),
        (IpAddr::V4(group), _) => socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED),
        (IpAddr::V6(group), _) => socket.leave_multicast_v6(&group, 0),
    }
}

fn apply_socket_options(socket: &UdpSocket, options: &DatagramOptions) -> io::Result<()> {
    socket.set_broadcast(options.broadcast)?;
    match socket.local_addr()? {
        SocketAddr::V4(_) => {
            socket.set_multicast_loop_v4(options.multicast_loopback)?;
            socket.set_multicast_ttl_v4(options.multicast_ttl)?;
        }
        SocketAddr::V6(_) => {
            socket.set_multicast_loop_v6(options.multicast_loopback)?;
        }
    }
    Ok(())
}

fn is_broadcast(ip: IpAddr) -> bool {
    matches!(ip, IpAddr::V4(v4) if v4.is_broadcast())
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, DatagramError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| DatagramError::InvalidAddress(format!("{host}: {e}")))?
        .next()
        .ok_or_else(|| DatagramError::InvalidAddress(host.to_string()))
}
