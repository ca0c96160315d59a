//! In-process event bus.
//!
//! A flat address space of handlers. `publish` delivers to every handler on
//! an address, `send` to one of them in round-robin order, and `request`
//! sends with a generated reply address and waits for the answer.
//!
//! Handlers are called synchronously on the publishing task and must not
//! block; the bridge's handlers only enqueue work on session contexts.

mod message;

pub use message::BusMessage;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::telemetry::counters;

/// Prefix of generated addresses.
pub const GENERATED_PREFIX: &str = "__eventgate.";

/// Receives messages for an address.
pub trait BusHandler: Send + Sync + 'static {
    fn handle(&self, message: BusMessage);
}

impl<F> BusHandler for F
where
    F: Fn(BusMessage) + Send + Sync + 'static,
{
    fn handle(&self, message: BusMessage) {
        self(message)
    }
}

/// Handle returned by `register`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h-{}", self.0)
    }
}

/// Request/reply failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplyError {
    #[error("no handlers for address {0}")]
    NoHandlers(String),

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

#[derive(Clone)]
struct Registration {
    id: HandlerId,
    handler: Arc<dyn BusHandler>,
}

/// Handlers for one address. The handler slice is replaced on every
/// change so publishers can iterate a snapshot without holding the shard.
struct AddressEntry {
    handlers: Arc<[Registration]>,
    cursor: Arc<AtomicUsize>,
}

impl Default for AddressEntry {
    fn default() -> Self {
        Self {
            handlers: Arc::from(Vec::new()),
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// The bus.
pub struct EventBus {
    table: DashMap<String, AddressEntry>,
    next_id: AtomicU64,
}

struct ReplyGuard<'a> {
    bus: &'a EventBus,
    address: String,
    id: HandlerId,
}

impl Drop for ReplyGuard<'_> {
    fn drop(&mut self) {
        self.bus.unregister(&self.address, self.id);
    }
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a handler to `address`.
    pub fn register(&self, address: &str, handler: impl BusHandler) -> HandlerId {
        self.register_arc(address, Arc::new(handler))
    }

    /// Add a shared handler to `address`.
    pub fn register_arc(&self, address: &str, handler: Arc<dyn BusHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entry = self.table.entry(address.to_string()).or_default();

        let mut handlers = entry.handlers.to_vec();
        handlers.push(Registration { id, handler });
        entry.handlers = handlers.into();

        debug!(address, handler = %id, count = entry.handlers.len(), "bus handler registered");
        id
    }

    /// Register a handler on a freshly generated address.
    pub fn register_generated(&self, handler: impl BusHandler) -> (String, HandlerId) {
        let address = format!("{GENERATED_PREFIX}{}", uuid::Uuid::new_v4());
        let id = self.register(&address, handler);
        (address, id)
    }

    /// Register a channel consumer on `address`.
    pub fn consumer(&self, address: &str) -> (HandlerId, mpsc::UnboundedReceiver<BusMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(address, move |message: BusMessage| {
            let _ = tx.send(message);
        });
        (id, rx)
    }

    /// Remove a handler. Returns false if it was not registered there.
    pub fn unregister(&self, address: &str, id: HandlerId) -> bool {
        let mut removed = false;

        if let Some(mut entry) = self.table.get_mut(address) {
            let handlers: Vec<_> = entry.handlers.iter().filter(|r| r.id != id).cloned().collect();
            removed = handlers.len() != entry.handlers.len();
            entry.handlers = handlers.into();
        }
        self.table.remove_if(address, |_, entry| entry.handlers.is_empty());

        if removed {
            debug!(address, handler = %id, "bus handler unregistered");
        }
        removed
    }

    /// Deliver to every handler on the message's address. Returns the
    /// number of handlers reached.
    pub fn publish(&self, message: BusMessage) -> usize {
        let Some(handlers) = self.snapshot(&message.address) else {
            trace!(address = %message.address, "publish with no handlers");
            return 0;
        };

        counters::bus_published();
        for registration in handlers.iter() {
            registration.handler.handle(message.clone());
        }
        handlers.len()
    }

    /// Deliver to one handler, chosen round-robin. Returns false when the
    /// address has no handlers.
    pub fn send(&self, message: BusMessage) -> bool {
        let Some((handlers, cursor)) = self.table.get(&message.address).and_then(|entry| {
            (!entry.handlers.is_empty()).then(|| (entry.handlers.clone(), entry.cursor.clone()))
        }) else {
            trace!(address = %message.address, "send with no handlers");
            return false;
        };

        counters::bus_sent();
        let index = cursor.fetch_add(1, Ordering::Relaxed) % handlers.len();
        handlers[index].handler.handle(message);
        true
    }

    /// Send `message` with a generated reply address and wait for the reply.
    pub async fn request(&self, mut message: BusMessage, timeout: Duration) -> Result<BusMessage, ReplyError> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let (reply_address, id) = self.register_generated(move |reply: BusMessage| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(reply);
            }
        });

        // Unregisters the reply handler even when the caller drops this future
        let _guard = ReplyGuard {
            bus: self,
            address: reply_address.clone(),
            id,
        };

        let address = message.address.clone();
        message.reply_address = Some(reply_address);

        if !self.send(message) {
            return Err(ReplyError::NoHandlers(address));
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // sender only drops when the handler is unregistered, which is us
            Ok(Err(_)) | Err(_) => Err(ReplyError::Timeout(timeout)),
        }
    }

    /// Send the reply to `original`. Returns false if it asked for none or
    /// nobody is waiting any more.
    pub fn reply(&self, original: &BusMessage, body: impl Into<bytes::Bytes>) -> bool {
        match original.reply(body) {
            Some(reply) => self.send(reply),
            None => false,
        }
    }

    /// Number of handlers on `address`.
    pub fn handler_count(&self, address: &str) -> usize {
        self.table.get(address).map_or(0, |entry| entry.handlers.len())
    }

    /// Number of addresses with at least one handler.
    pub fn address_count(&self) -> usize {
        self.table.len()
    }

    fn snapshot(&self, address: &str) -> Option<Arc<[Registration]>> {
        self.table
            .get(address)
            .map(|entry| entry.handlers.clone())
            .filter(|handlers| !handlers.is_empty())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            table: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("addresses", &self.table.len())
            .finish()
    }
}
