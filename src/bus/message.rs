use bytes::Bytes;

/// A message on the event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Destination address
    pub address: String,

    /// Opaque payload
    pub body: Bytes,

    /// Where the receiver should send its reply, if anywhere
    pub reply_address: Option<String>,
}

impl BusMessage {
    pub fn new(address: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            address: address.into(),
            body: body.into(),
            reply_address: None,
        }
    }

    pub fn with_reply_address(mut self, reply_address: impl Into<String>) -> Self {
        self.reply_address = Some(reply_address.into());
        self
    }

    /// Build the reply to this message, if it asked for one.
    pub fn reply(&self, body: impl Into<Bytes>) -> Option<BusMessage> {
        self.reply_address
            .as_ref()
            .map(|address| BusMessage::new(address.clone(), body))
    }
}
