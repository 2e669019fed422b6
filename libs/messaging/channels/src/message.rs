use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Opaque handle correlating a received message with its settlement.
///
/// Tags are scoped to the consumer link that issued them, so a tag from a
/// closed or different consumer never settles another consumer's message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    exchange: Arc<str>,
    link: u64,
    sequence: u64,
}

impl DeliveryTag {
    pub(crate) fn new(exchange: Arc<str>, link: u64, sequence: u64) -> Self {
        Self {
            exchange,
            link,
            sequence,
        }
    }

    /// Exchange the message was received from
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub(crate) fn link(&self) -> u64 {
        self.link
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.exchange, self.sequence)
    }
}

/// A message received from an exchange channel
#[derive(Debug, Clone)]
pub struct Message {
    /// Raw message bytes
    pub payload: Bytes,

    /// Settlement handle, valid until acknowledged or negatively acknowledged
    pub delivery_tag: DeliveryTag,

    /// Exchange the message arrived on
    pub exchange: String,

    /// Routing key supplied by the publisher, if any
    pub routing_key: Option<String>,

    /// Set when the broker delivered this message before and it was requeued
    pub redelivered: bool,
}

impl Message {
    /// Get message size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Payload as UTF-8, if it is
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
