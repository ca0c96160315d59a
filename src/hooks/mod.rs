//! Hook chain for session and message interception.
//!
//! Hooks let modules observe or veto each session lifecycle transition and
//! each message crossing the bridge. Handlers for one hook point run in
//! registration order; the first rejection stops the chain.

mod chain;

pub use chain::{HookChain, HookRegistration};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::bus::BusMessage;
use crate::session::Session;

/// Interception points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    /// A transport connection was accepted and its session created
    SocketCreated,
    /// Before an address registration takes effect
    PreRegister,
    /// After an address registration took effect (notification only)
    PostRegister,
    /// A message is crossing the bridge in either direction
    SendOrPub,
    /// Before an address is unregistered
    Unregister,
    /// The session closed (notification only)
    SocketClosed,
    /// Authorisation check for an address
    Authorise,
}

impl HookPoint {
    pub const ALL: [HookPoint; 7] = [
        HookPoint::SocketCreated,
        HookPoint::PreRegister,
        HookPoint::PostRegister,
        HookPoint::SendOrPub,
        HookPoint::Unregister,
        HookPoint::SocketClosed,
        HookPoint::Authorise,
    ];
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPoint::SocketCreated => write!(f, "socket_created"),
            HookPoint::PreRegister => write!(f, "pre_register"),
            HookPoint::PostRegister => write!(f, "post_register"),
            HookPoint::SendOrPub => write!(f, "send_or_pub"),
            HookPoint::Unregister => write!(f, "unregister"),
            HookPoint::SocketClosed => write!(f, "socket_closed"),
            HookPoint::Authorise => write!(f, "authorise"),
        }
    }
}

/// What an `authorise` check is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthAction {
    Subscribe,
    Send,
    Publish,
    /// Delivery of a bus message to the session
    Receive,
}

impl fmt::Display for AuthAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthAction::Subscribe => write!(f, "subscribe"),
            AuthAction::Send => write!(f, "send"),
            AuthAction::Publish => write!(f, "publish"),
            AuthAction::Receive => write!(f, "receive"),
        }
    }
}

/// Handler verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Allow,
    /// Allow with a replacement message body (`send_or_pub` only)
    Modify(Bytes),
    Reject(String),
}

impl HookDecision {
    pub fn reject(reason: impl Into<String>) -> Self {
        HookDecision::Reject(reason.into())
    }
}

/// Input to a hook handler.
#[derive(Debug, Clone)]
pub struct HookEvent {
    /// The hook point being executed
    pub hook: HookPoint,
    pub session: Arc<Session>,
    /// Bus address involved, if any
    pub address: Option<String>,
    /// Message body for `send_or_pub`
    pub body: Option<Bytes>,
    pub reply_address: Option<String>,
    /// `send_or_pub`: true for point-to-point send, false for publish or
    /// delivery to the session
    pub send: bool,
    /// Direction of `send_or_pub`: true when the message comes from the client
    pub inbound: bool,
    pub action: Option<AuthAction>,
}

impl HookEvent {
    pub fn new(hook: HookPoint, session: Arc<Session>) -> Self {
        Self {
            hook,
            session,
            address: None,
            body: None,
            reply_address: None,
            send: false,
            inbound: false,
            action: None,
        }
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    /// Attach a message crossing the bridge.
    pub fn with_message(mut self, message: &BusMessage, send: bool, inbound: bool) -> Self {
        self.address = Some(message.address.clone());
        self.body = Some(message.body.clone());
        self.reply_address = message.reply_address.clone();
        self.send = send;
        self.inbound = inbound;
        self
    }

    pub fn with_action(mut self, action: AuthAction) -> Self {
        self.action = Some(action);
        self
    }

    /// The message carried by this event, with any modifications applied.
    pub fn message(&self) -> Option<BusMessage> {
        let address = self.address.clone()?;
        let body = self.body.clone()?;
        Some(BusMessage {
            address,
            body,
            reply_address: self.reply_address.clone(),
        })
    }
}

/// Hook chain failures. Both count as a veto.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("{hook} rejected by {owner}: {reason}")]
    Rejected {
        hook: HookPoint,
        owner: String,
        reason: String,
    },

    #[error("{hook} handler of {owner} timed out")]
    Timeout { hook: HookPoint, owner: String },
}

impl HookError {
    pub fn hook(&self) -> HookPoint {
        match self {
            HookError::Rejected { hook, .. } | HookError::Timeout { hook, .. } => *hook,
        }
    }
}

/// A hook handler.
#[async_trait]
pub trait HookHandler: Send + Sync + 'static {
    async fn call(&self, event: HookEvent) -> HookDecision;
}

#[async_trait]
impl<F, Fut> HookHandler for F
where
    F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HookDecision> + Send + 'static,
{
    async fn call(&self, event: HookEvent) -> HookDecision {
        (self)(event).await
    }
}
