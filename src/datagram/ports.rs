//! Process-wide table of bound datagram ports.
//!
//! The OS delivers a unicast datagram to only one of several sockets sharing a
//! port, so reuse is resolved here instead: every endpoint that binds a port
//! with reuse enabled attaches to the same socket, and a single reader task
//! copies each datagram to all attached listeners.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{DatagramError, DatagramPacket};

/// Per-listener inbox capacity; datagrams beyond it are dropped.
const LISTENER_QUEUE: usize = 1024;

/// Largest UDP payload.
const MAX_DATAGRAM: usize = 65_535;

/// Listener identifier within one binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listeners = Mutex<Vec<(ListenerId, mpsc::Sender<DatagramPacket>)>>;

/// One bound OS socket and the listeners attached to it.
pub struct PortBinding {
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    reuse: bool,
    listeners: Arc<Listeners>,
    next_listener: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl PortBinding {
    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The shared socket.
    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn attach(&self) -> (ListenerId, mpsc::Receiver<DatagramPacket>) {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE);
        self.listeners.lock().push((id, tx));
        (id, rx)
    }

    fn start_reader(&self) {
        let socket = self.socket.clone();
        let listeners = self.listeners.clone();
        let local_addr = self.local_addr;

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, sender)) => {
                        let packet = DatagramPacket {
                            sender,
                            data: Bytes::copy_from_slice(&buf[..len]),
                        };
                        trace!(local = %local_addr, %sender, len, "datagram received");
                        fan_out(&listeners, packet);
                    }
                    Err(e) => {
                        // ICMP errors from earlier sends surface here; keep reading.
                        debug!(local = %local_addr, error = %e, "datagram receive error");
                    }
                }
            }
        });

        *self.reader.lock() = Some(handle);
    }
}

fn fan_out(listeners: &Listeners, packet: DatagramPacket) {
    let listeners = listeners.lock();
    for (id, tx) in listeners.iter() {
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(packet.clone()) {
            warn!(listener = ?id, sender = %packet.sender, "listener inbox full, dropping datagram");
        }
    }
}

impl Drop for PortBinding {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

/// A listener's claim on a binding.
pub struct Attachment {
    pub binding: Arc<PortBinding>,
    pub listener: ListenerId,
    pub inbox: mpsc::Receiver<DatagramPacket>,
}

/// Table of bound ports, shared by all endpoints of a gateway.
#[derive(Default)]
pub struct PortTable {
    bindings: Mutex<HashMap<SocketAddr, Weak<PortBinding>>>,
}

impl PortTable {
    /// Create an empty table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind `addr`, or attach to an existing binding when both sides allow
    /// reuse.
    pub fn bind(&self, addr: SocketAddr, reuse: bool) -> Result<Attachment, DatagramError> {
        let mut bindings = self.bindings.lock();

        if addr.port() != 0 {
            let existing = bindings
                .iter()
                .filter(|(bound, _)| overlaps(**bound, addr))
                .find_map(|(_, weak)| weak.upgrade());
            if let Some(existing) = existing {
                if !(reuse && existing.reuse) {
                    return Err(DatagramError::AddressInUse(addr));
                }
                let (listener, inbox) = existing.attach();
                debug!(%addr, listeners = existing.listener_count(), "attached to shared port");
                return Ok(Attachment {
                    binding: existing,
                    listener,
                    inbox,
                });
            }
        }

        let socket = bind_socket(addr)?;
        let local_addr = socket.local_addr()?;

        let binding = Arc::new(PortBinding {
            local_addr,
            socket: Arc::new(socket),
            reuse,
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(1),
            reader: Mutex::new(None),
        });
        let (listener, inbox) = binding.attach();
        binding.start_reader();

        bindings.insert(local_addr, Arc::downgrade(&binding));
        debug!(%local_addr, reuse, "port bound");

        Ok(Attachment {
            binding,
            listener,
            inbox,
        })
    }

    /// Detach a listener. The last listener out closes the socket and waits
    /// for the reader to stop so the port is free when this returns.
    pub async fn release(&self, binding: Arc<PortBinding>, listener: ListenerId) {
        if !self.detach(&binding, listener) {
            return;
        }

        let reader = binding.reader.lock().take();
        if let Some(handle) = reader {
            handle.abort();
            let _ = handle.await;
        }

        debug!(local = %binding.local_addr, "port released");
    }

    /// Remove a listener without waiting for the socket to close. Returns
    /// true when it was the last one and the port entry was removed.
    pub fn detach(&self, binding: &Arc<PortBinding>, listener: ListenerId) -> bool {
        let remaining = {
            let mut listeners = binding.listeners.lock();
            listeners.retain(|(id, _)| *id != listener);
            listeners.len()
        };

        if remaining > 0 {
            debug!(local = %binding.local_addr, remaining, "listener detached");
            return false;
        }

        let mut bindings = self.bindings.lock();
        let ours = bindings
            .get(&binding.local_addr)
            .is_some_and(|weak| weak.as_ptr() == Arc::as_ptr(binding));
        if ours {
            bindings.remove(&binding.local_addr);
        }
        true
    }

    /// Whether a live binding exists for `addr`.
    pub fn is_bound(&self, addr: SocketAddr) -> bool {
        self.bindings
            .lock()
            .get(&addr)
            .is_some_and(|weak| weak.strong_count() > 0)
    }
}

/// Two bind addresses claim the same port when they share a family and port
/// and one of them is the wildcard host or both hosts are equal.
fn overlaps(bound: SocketAddr, addr: SocketAddr) -> bool {
    bound.port() == addr.port()
        && bound.is_ipv4() == addr.is_ipv4()
        && (bound.ip() == addr.ip() || bound.ip().is_unspecified() || addr.ip().is_unspecified())
}

/// Bind a non-blocking socket registered with the current runtime.
pub(crate) fn bind_socket(addr: SocketAddr) -> Result<UdpSocket, DatagramError> {
    let socket = std::net::UdpSocket::bind(addr).map_err(|e| match e.kind() {
        io::ErrorKind::AddrInUse => DatagramError::AddressInUse(addr),
        _ => DatagramError::Io(e),
    })?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket)?)
}
