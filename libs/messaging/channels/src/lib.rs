//! # Exchange Channels
//!
//! Named publish/subscribe channels with acknowledged delivery.
//!
//! A [`ChannelRegistry`] hands out one [`Channel`] per exchange name. Each
//! channel pairs a [`MessageProducer`] and a [`MessageConsumer`], both backed
//! by background workers that own their broker link.
//!
//! ## Delivery model
//!
//! - At most `prefetch` unsettled deliveries per consumer (default 1)
//! - Every delivery is settled once: acknowledged, or negatively
//!   acknowledged with or without requeue
//! - Publishing retries transient broker failures with backoff and reports
//!   exhaustion to the caller
//! - Batch receive drains until the exchange stays empty for one timeout
//!
//! ## Brokers
//!
//! - [`InMemoryBroker`]: in-process queues
//! - [`TcpBroker`]: links to a [`BrokerServer`] over TCP
//!
//! ## Usage
//!
//! ```rust,no_run
//! use relay_channels::{ChannelConfig, ChannelRegistry, InMemoryBroker};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), relay_channels::ChannelError> {
//! let registry = ChannelRegistry::new(Arc::new(InMemoryBroker::new()), ChannelConfig::default())?;
//! registry.send("sensors", r#"{"temp":21}"#).await?;
//!
//! if let Some(message) = registry.receive("sensors", Some(Duration::from_secs(1))).await? {
//!     registry.acknowledge(&message.delivery_tag).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod producer;
pub mod registry;
pub mod test_utils;
pub mod wire;

pub use broker::{Broker, Delivery, PublisherLink, SubscriberLink};
pub use config::ChannelConfig;
pub use consumer::{ConsumerStats, MessageConsumer};
pub use error::{BrokerError, ChannelError};
pub use memory::{ExchangeStats, InMemoryBroker};
pub use message::{DeliveryTag, Message};
pub use producer::{MessageProducer, ProducerStats};
pub use registry::{Channel, ChannelRegistry, ChannelStats};
pub use wire::{BrokerServer, TcpBroker};

use peer_config::BrokerEndpoint;
use std::sync::Arc;
use std::time::Duration;

/// Build the broker a configured endpoint points at
pub fn broker_for(endpoint: &BrokerEndpoint, connect_timeout: Duration) -> Arc<dyn Broker> {
    match endpoint {
        BrokerEndpoint::Memory => Arc::new(InMemoryBroker::new()),
        BrokerEndpoint::Tcp(addr) => Arc::new(TcpBroker::new(addr.clone(), connect_timeout)),
    }
}
