//! Logical client sessions.
//!
//! A [`Session`] is one client's connection to a bridge, independent of the
//! transport carrying it. It owns its lifecycle state, the set of bus
//! addresses it subscribed to, the context its hooks and deliveries run on,
//! and the outbound queue the transport drains.

mod frame;
mod registry;
mod state;

pub use frame::{decode_body, encode_body, ClientFrame, ServerFrame};
pub use registry::SessionRegistry;
pub use state::SessionState;

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::Context;
use crate::telemetry::counters;

/// Unique session identifier (UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session state errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("invalid state transition {from} -> {to}")]
    InvalidState { from: SessionState, to: SessionState },
}

/// A client session.
pub struct Session {
    id: SessionId,
    bridge: String,
    peer: SocketAddr,
    state: Mutex<SessionState>,
    context: Context,
    addresses: Mutex<BTreeSet<String>>,
    sink: mpsc::Sender<ServerFrame>,
    closed: CancellationToken,
    close_reason: Mutex<Option<String>>,
    created_at: Instant,
}

impl Session {
    /// Create a session in `CREATED`.
    pub fn new(bridge: &str, peer: SocketAddr, context: Context, sink: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            id: SessionId::new(),
            bridge: bridge.to_string(),
            peer,
            state: Mutex::new(SessionState::Created),
            context,
            addresses: Mutex::new(BTreeSet::new()),
            sink,
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Name of the bridge that accepted the session.
    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Context the session's hooks and deliveries run on.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Move to `to`. Fails if the session is closed or the transition is not
    /// allowed from the current state; returns the previous state.
    pub fn transition(&self, to: SessionState) -> Result<SessionState, SessionError> {
        let mut state = self.state.lock();
        let from = *state;

        if from.is_closed() {
            return Err(SessionError::Closed);
        }
        if !from.can_transition(to) {
            return Err(SessionError::InvalidState { from, to });
        }

        *state = to;
        debug!(session = %self.id, %from, %to, "state transition");
        Ok(from)
    }

    /// Move to `CLOSED` and signal the transport. Returns false if the
    /// session was already closed.
    pub fn mark_closed(&self, reason: &str) -> bool {
        if self.transition(SessionState::Closed).is_err() {
            return false;
        }
        *self.close_reason.lock() = Some(reason.to_string());
        self.closed.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Why the session closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Subscribed addresses, in order.
    pub fn addresses(&self) -> Vec<String> {
        self.addresses.lock().iter().cloned().collect()
    }

    pub fn is_subscribed(&self, address: &str) -> bool {
        self.addresses.lock().contains(address)
    }

    pub(crate) fn add_address(&self, address: &str) -> bool {
        self.addresses.lock().insert(address.to_string())
    }

    pub(crate) fn remove_address(&self, address: &str) -> bool {
        self.addresses.lock().remove(address)
    }

    pub(crate) fn take_addresses(&self) -> BTreeSet<String> {
        std::mem::take(&mut *self.addresses.lock())
    }

    /// Queue a frame for the transport. Frames are dropped when the queue is
    /// full or the transport is gone.
    pub fn deliver(&self, frame: ServerFrame) -> bool {
        match self.sink.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %self.id, "session outbound queue full, dropping frame");
                counters::frame_dropped(&self.bridge);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session = %self.id, "session transport gone, dropping frame");
                false
            }
        }
    }

    /// Time since the session was created.
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("bridge", &self.bridge)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
