//! Transports that carry bridge sessions.
//!
//! A transport accepts connections, hands each one to its [`BusBridge`]
//! as a session, and pumps frames between the connection and the session.
//!
//! [`BusBridge`]: crate::bridge::BusBridge

mod websocket;

pub use websocket::WebSocketListener;
