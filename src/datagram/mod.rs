//! Connectionless datagram endpoints.
//!
//! A [`DatagramEndpoint`] sends and receives raw UDP payloads. Endpoints that
//! listen on the same port with `reuse_address` share one socket through the
//! [`PortTable`] and each receive a copy of every datagram.

mod endpoint;
mod options;
mod ports;
mod service;

pub use endpoint::DatagramEndpoint;
pub use options::DatagramOptions;
pub use ports::{ListenerId, PortBinding, PortTable};
pub use service::{BusFeed, DatagramService, EchoService};

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;

use crate::context::ContextClosed;

/// Datagram endpoint errors.
#[derive(Debug, Error)]
pub enum DatagramError {
    #[error("address already in use: {0}")]
    AddressInUse(SocketAddr),

    #[error("endpoint closed")]
    EndpointClosed,

    #[error("broadcast not enabled on this endpoint")]
    BroadcastNotEnabled,

    #[error("endpoint is not listening")]
    NotListening,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Context(#[from] ContextClosed),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A received datagram.
#[derive(Debug, Clone)]
pub struct DatagramPacket {
    /// Address the datagram came from
    pub sender: SocketAddr,

    /// Payload
    pub data: Bytes,
}
