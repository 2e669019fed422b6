//! Channel registry
//!
//! Maps exchange names to long-lived channels. The first request for a name
//! creates its channel and spawns the producer and consumer workers; every
//! later request, from any thread, gets the same `Arc<Channel>`.
//!
//! The registry lock only guards the check-and-insert. Broker links are
//! opened by the workers, so a slow broker never holds the lock.

use crate::broker::Broker;
use crate::consumer::{ConsumerStats, MessageConsumer};
use crate::producer::{MessageProducer, ProducerStats};
use crate::{ChannelConfig, ChannelError, DeliveryTag, Message};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tracing::{debug, info};

/// A named exchange with one producer and one consumer
#[derive(Debug)]
pub struct Channel {
    name: String,
    producer: MessageProducer,
    consumer: MessageConsumer,
    default_timeout: Duration,
    created_at: SystemTime,
}

impl Channel {
    fn spawn(name: &str, broker: &Arc<dyn Broker>, config: &ChannelConfig, runtime: &Handle) -> Self {
        Self {
            name: name.to_string(),
            producer: MessageProducer::spawn(name, Arc::clone(broker), config, runtime),
            consumer: MessageConsumer::spawn(name, Arc::clone(broker), config, runtime),
            default_timeout: config.default_timeout,
            created_at: SystemTime::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn producer(&self) -> &MessageProducer {
        &self.producer
    }

    pub fn consumer(&self) -> &MessageConsumer {
        &self.consumer
    }

    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.producer.send(payload).await
    }

    pub async fn publish(
        &self,
        payload: impl Into<Bytes>,
        routing_key: Option<&str>,
        max_attempts: u32,
    ) -> Result<(), ChannelError> {
        self.producer.publish(payload, routing_key, max_attempts).await
    }

    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Message>, ChannelError> {
        self.consumer.receive(timeout).await
    }

    pub async fn receive_batch(&self, timeout: Duration) -> Result<Vec<Message>, ChannelError> {
        self.consumer.receive_batch(timeout).await
    }

    /// Batch receive with the configured default timeout
    pub async fn drain(&self) -> Result<Vec<Message>, ChannelError> {
        self.consumer.receive_batch(self.default_timeout).await
    }

    pub async fn acknowledge(&self, tag: &DeliveryTag) -> Result<(), ChannelError> {
        self.consumer.acknowledge(tag).await
    }

    pub async fn negative_acknowledge(
        &self,
        tag: &DeliveryTag,
        requeue: bool,
    ) -> Result<(), ChannelError> {
        self.consumer.negative_acknowledge(tag, requeue).await
    }

    /// Close both halves; queued publishes finish first
    pub async fn close(&self) {
        self.producer.close().await;
        self.consumer.close().await;
        debug!(channel = %self.name, "Channel closed");
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            producer: self.producer.stats(),
            consumer: self.consumer.stats(),
        }
    }
}

/// Counters for both halves of a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub producer: ProducerStats,
    pub consumer: ConsumerStats,
}

/// Registry of exchange channels sharing one broker
#[derive(Debug)]
pub struct ChannelRegistry {
    broker: Arc<dyn Broker>,
    config: ChannelConfig,
    runtime: Handle,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    created: AtomicU64,
}

impl ChannelRegistry {
    /// Create a registry whose workers run on the current Tokio runtime
    pub fn new(broker: Arc<dyn Broker>, config: ChannelConfig) -> Result<Self, ChannelError> {
        let runtime = Handle::try_current().map_err(|e| ChannelError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(broker, config, runtime))
    }

    /// Create a registry whose workers run on `runtime`
    pub fn with_runtime(broker: Arc<dyn Broker>, config: ChannelConfig, runtime: Handle) -> Self {
        info!(broker = %broker.describe(), prefetch = config.prefetch, auto_ack = config.auto_ack, "Channel registry ready");
        Self {
            broker,
            config,
            runtime,
            channels: Mutex::new(HashMap::new()),
            created: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Get the channel for `name`, creating it on first use.
    ///
    /// Safe to call from any thread, inside or outside the runtime.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<Channel>, ChannelError> {
        if name.trim().is_empty() {
            return Err(ChannelError::invalid_argument("channel name must not be empty"));
        }

        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(name) {
            return Ok(Arc::clone(channel));
        }

        let channel = Arc::new(Channel::spawn(name, &self.broker, &self.config, &self.runtime));
        channels.insert(name.to_string(), Arc::clone(&channel));
        self.created.fetch_add(1, Ordering::Relaxed);
        info!(channel = name, "Channel created");
        Ok(channel)
    }

    /// Existing channel for `name`, without creating one
    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.lock().get(name).cloned()
    }

    pub async fn send(&self, name: &str, payload: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.get_or_create(name)?.send(payload).await
    }

    pub async fn receive(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, ChannelError> {
        self.get_or_create(name)?.receive(timeout).await
    }

    pub async fn receive_batch(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Vec<Message>, ChannelError> {
        self.get_or_create(name)?.receive_batch(timeout).await
    }

    /// Acknowledge on the channel the tag came from
    pub async fn acknowledge(&self, tag: &DeliveryTag) -> Result<(), ChannelError> {
        self.channel_for(tag)?.acknowledge(tag).await
    }

    pub async fn negative_acknowledge(
        &self,
        tag: &DeliveryTag,
        requeue: bool,
    ) -> Result<(), ChannelError> {
        self.channel_for(tag)?.negative_acknowledge(tag, requeue).await
    }

    fn channel_for(&self, tag: &DeliveryTag) -> Result<Arc<Channel>, ChannelError> {
        self.get(tag.exchange())
            .ok_or_else(|| ChannelError::UnknownDeliveryTag(tag.clone()))
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Channels created over the registry's lifetime
    pub fn channels_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Close and forget every channel
    pub async fn close_all(&self) {
        let channels: Vec<Arc<Channel>> = {
            let mut map = self.channels.lock();
            map.drain().map(|(_, channel)| channel).collect()
        };
        let count = channels.len();
        for channel in channels {
            channel.close().await;
        }
        info!(count, "All channels closed");
    }
}
