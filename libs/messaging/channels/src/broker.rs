//! Broker seam
//!
//! A [`Broker`] hands out links bound to one exchange. Producer and consumer
//! workers each own exactly one link for their lifetime and nothing else
//! writes to it, which keeps wire writes from interleaving.

use crate::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;

/// One message as delivered by a broker link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Link-scoped delivery tag, increasing from 1
    pub tag: u64,
    pub payload: Bytes,
    pub routing_key: Option<String>,
    pub redelivered: bool,
}

/// Source of publisher and subscriber links
#[async_trait]
pub trait Broker: Send + Sync + Debug {
    /// Open a link that publishes to `exchange`, creating the exchange if needed
    async fn open_publisher(&self, exchange: &str) -> Result<Box<dyn PublisherLink>, BrokerError>;

    /// Open a link that consumes from `exchange` with at most `prefetch`
    /// unsettled deliveries outstanding
    async fn open_subscriber(
        &self,
        exchange: &str,
        prefetch: u16,
    ) -> Result<Box<dyn SubscriberLink>, BrokerError>;

    /// Name used in logs
    fn describe(&self) -> String {
        "broker".to_string()
    }
}

/// Outbound half of an exchange channel
#[async_trait]
pub trait PublisherLink: Send {
    /// Publish one message; returns once the broker has accepted it
    async fn publish(&mut self, routing_key: Option<&str>, payload: Bytes)
        -> Result<(), BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Inbound half of an exchange channel
#[async_trait]
pub trait SubscriberLink: Send {
    /// Wait for the next delivery.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a delivery.
    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError>;

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError>;

    async fn nack(&mut self, tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Close the link; the broker requeues anything still unsettled
    async fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}
