//! eventgate: a socket session gateway.
//!
//! Client sessions arrive over WebSocket and UDP datagrams; both are bridged
//! onto an in-process event bus. Every session lifecycle step passes through
//! a chain of hooks that loadable modules can observe or veto.
//!
//! Layout:
//! - [`context`]: single-threaded execution contexts on a worker pool
//! - [`datagram`]: UDP endpoints and datagram services
//! - [`bus`]: address-based publish/subscribe and request/reply
//! - [`session`]: session state machine and wire frames
//! - [`hooks`]: hook points, decisions and the handler chain
//! - [`bridge`]: the bus bridge driving sessions through hooks
//! - [`modules`]: hook-registering gateway modules
//! - [`transport`]: WebSocket acceptor
//! - [`config`], [`telemetry`], [`admin`], [`bootstrap`]: ambient stack

pub mod admin;
pub mod bootstrap;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod context;
pub mod datagram;
pub mod hooks;
pub mod modules;
pub mod session;
pub mod telemetry;
pub mod transport;
