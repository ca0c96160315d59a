//! Bus bridge.
//!
//! Couples client sessions to the event bus. Every transition and every
//! message crossing the bridge passes the permitted lists and the hook
//! chain; vetoes are reported to the initiating client only.

mod bus_bridge;
mod permitted;

pub use bus_bridge::BusBridge;
pub use permitted::{Permit, PermittedList};

use thiserror::Error;

use crate::bus::ReplyError;
use crate::context::ContextClosed;
use crate::hooks::{HookError, HookPoint};
use crate::session::{SessionError, SessionState};

/// Bridge errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("not authorised for address {0}")]
    NotAuthorised(String),

    #[error("address not permitted: {0}")]
    NotPermitted(String),

    #[error("registration of {address} rejected: {reason}")]
    RegistrationRejected { address: String, reason: String },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{0} handler timed out")]
    HandlerTimeout(HookPoint),

    #[error("session closed")]
    SessionClosed,

    #[error("operation not allowed in state {0}")]
    InvalidState(SessionState),

    #[error("session limit of {0} reached")]
    SessionLimit(usize),

    #[error("invalid bridge configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Reply(#[from] ReplyError),

    #[error(transparent)]
    Context(#[from] ContextClosed),
}

impl BridgeError {
    /// Error code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::NotAuthorised(_) => "not_authorised",
            BridgeError::NotPermitted(_) => "not_permitted",
            BridgeError::RegistrationRejected { .. } => "registration_rejected",
            BridgeError::Rejected(_) => "rejected",
            BridgeError::HandlerTimeout(_) => "handler_timeout",
            BridgeError::SessionClosed => "session_closed",
            BridgeError::InvalidState(_) => "invalid_state",
            BridgeError::SessionLimit(_) => "session_limit",
            BridgeError::Config(_) => "config",
            BridgeError::Reply(ReplyError::Timeout(_)) => "reply_timeout",
            BridgeError::Reply(ReplyError::NoHandlers(_)) => "no_handlers",
            BridgeError::Context(_) => "context_closed",
        }
    }

    /// Map a hook chain veto on `address` to the error the client sees.
    pub(crate) fn from_hook(err: HookError, address: Option<&str>) -> Self {
        let address = address.unwrap_or_default().to_string();
        match err {
            HookError::Timeout { hook, .. } => BridgeError::HandlerTimeout(hook),
            HookError::Rejected {
                hook: HookPoint::Authorise,
                ..
            } => BridgeError::NotAuthorised(address),
            HookError::Rejected {
                hook: HookPoint::PreRegister,
                reason,
                ..
            } => BridgeError::RegistrationRejected { address, reason },
            HookError::Rejected { reason, .. } => BridgeError::Rejected(reason),
        }
    }
}

impl From<SessionError> for BridgeError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Closed => BridgeError::SessionClosed,
            SessionError::InvalidState { from, .. } => BridgeError::InvalidState(from),
        }
    }
}
