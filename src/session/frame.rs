//! JSON frames exchanged with stream clients.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::BusMessage;

/// Frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Point-to-point send, optionally expecting a reply
    Send {
        address: String,
        #[serde(default)]
        body: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_address: Option<String>,
    },
    Publish {
        address: String,
        #[serde(default)]
        body: Value,
    },
    /// Subscribe to an address
    Register { address: String },
    /// Unsubscribe from an address
    Unregister { address: String },
    Ping,
}

impl ClientFrame {
    /// Address the frame targets, if any.
    pub fn address(&self) -> Option<&str> {
        match self {
            ClientFrame::Send { address, .. }
            | ClientFrame::Publish { address, .. }
            | ClientFrame::Register { address }
            | ClientFrame::Unregister { address } => Some(address),
            ClientFrame::Ping => None,
        }
    }
}

/// Frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        address: String,
        body: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_address: Option<String>,
    },
    Err {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    Pong,
}

impl ServerFrame {
    pub fn message(message: &BusMessage) -> Self {
        ServerFrame::Message {
            address: message.address.clone(),
            body: decode_body(&message.body),
            reply_address: message.reply_address.clone(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>, address: Option<&str>) -> Self {
        ServerFrame::Err {
            code: code.to_string(),
            message: message.into(),
            address: address.map(str::to_string),
        }
    }
}

/// Encode a client body for the bus.
pub fn encode_body(body: &Value) -> Bytes {
    match body {
        Value::Null => Bytes::new(),
        body => Bytes::from(body.to_string()),
    }
}

/// Decode a bus body for a client. Payloads that are not JSON, such as raw
/// datagrams, are passed as a string.
pub fn decode_body(body: &Bytes) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}
