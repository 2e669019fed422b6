//! In-process broker
//!
//! One FIFO queue per exchange. Subscriber links take messages off the front
//! of the queue while their prefetch window has room, keep them as unsettled
//! until acknowledged, and put them back at the front when negatively
//! acknowledged with requeue or when the link closes.

use crate::broker::{Broker, Delivery, PublisherLink, SubscriberLink};
use crate::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Counters for one exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Messages waiting for a subscriber
    pub ready: usize,
    /// Messages delivered and not yet settled
    pub in_flight: usize,
    pub published: u64,
    pub acknowledged: u64,
    /// Messages negatively acknowledged without requeue
    pub dead_lettered: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Bytes,
    routing_key: Option<String>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: usize,
    published: u64,
    acknowledged: u64,
    dead_lettered: u64,
}

#[derive(Debug)]
struct ExchangeQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ExchangeQueue {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Put messages back at the front, preserving their relative order
    fn requeue_front(&self, messages: Vec<StoredMessage>) {
        if messages.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(messages.len());
            for mut message in messages.into_iter().rev() {
                message.redelivered = true;
                state.ready.push_front(message);
            }
        }
        self.notify.notify_waiters();
    }
}

/// Broker that keeps every exchange in process memory
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    exchanges: DashMap<String, Arc<ExchangeQueue>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn exchange(&self, name: &str) -> Arc<ExchangeQueue> {
        let entry = self
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(exchange = name, "Declared exchange");
                Arc::new(ExchangeQueue::new(name))
            });
        Arc::clone(entry.value())
    }

    /// Counters for `exchange`, if it has been declared
    pub fn stats(&self, exchange: &str) -> Option<ExchangeStats> {
        self.exchanges.get(exchange).map(|queue| {
            let state = queue.state.lock();
            ExchangeStats {
                ready: state.ready.len(),
                in_flight: state.in_flight,
                published: state.published,
                acknowledged: state.acknowledged,
                dead_lettered: state.dead_lettered,
            }
        })
    }

    /// Names of all declared exchanges
    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.exchanges.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open_publisher(&self, exchange: &str) -> Result<Box<dyn PublisherLink>, BrokerError> {
        Ok(Box::new(MemoryPublisher {
            queue: self.exchange(exchange),
        }))
    }

    async fn open_subscriber(
        &self,
        exchange: &str,
        prefetch: u16,
    ) -> Result<Box<dyn SubscriberLink>, BrokerError> {
        Ok(Box::new(MemorySubscriber::new(
            self.exchange(exchange),
            prefetch,
        )))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryPublisher {
    queue: Arc<ExchangeQueue>,
}

#[async_trait]
impl PublisherLink for MemoryPublisher {
    async fn publish(
        &mut self,
        routing_key: Option<&str>,
        payload: Bytes,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.queue.state.lock();
            state.ready.push_back(StoredMessage {
                payload,
                routing_key: routing_key.map(str::to_string),
                redelivered: false,
            });
            state.published += 1;
        }
        self.queue.notify.notify_waiters();
        trace!(exchange = %self.queue.name, "Message enqueued");
        Ok(())
    }
}

struct MemorySubscriber {
    queue: Arc<ExchangeQueue>,
    prefetch: usize,
    next_tag: u64,
    unsettled: BTreeMap<u64, StoredMessage>,
    closed: bool,
}

impl MemorySubscriber {
    fn new(queue: Arc<ExchangeQueue>, prefetch: u16) -> Self {
        Self {
            queue,
            prefetch: usize::from(prefetch.max(1)),
            next_tag: 1,
            unsettled: BTreeMap::new(),
            closed: false,
        }
    }

    fn take_next(&mut self) -> Option<Delivery> {
        if self.unsettled.len() >= self.prefetch {
            return None;
        }
        let message = {
            let mut state = self.queue.state.lock();
            let message = state.ready.pop_front()?;
            state.in_flight += 1;
            message
        };

        let tag = self.next_tag;
        self.next_tag += 1;
        let delivery = Delivery {
            tag,
            payload: message.payload.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
        };
        self.unsettled.insert(tag, message);
        Some(delivery)
    }

    fn requeue_unsettled(&mut self) {
        let messages: Vec<StoredMessage> = std::mem::take(&mut self.unsettled)
            .into_values()
            .collect();
        if !messages.is_empty() {
            debug!(
                exchange = %self.queue.name,
                count = messages.len(),
                "Requeueing unsettled deliveries"
            );
        }
        self.queue.requeue_front(messages);
    }
}

#[async_trait]
impl SubscriberLink for MemorySubscriber {
    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError> {
        let queue = Arc::clone(&self.queue);
        loop {
            if self.closed {
                return Err(BrokerError::Closed);
            }
            // Register interest before checking so a publish in between is not missed
            let notified = queue.notify.notified();
            if let Some(delivery) = self.take_next() {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError> {
        self.unsettled
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;
        let mut state = self.queue.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.acknowledged += 1;
        Ok(())
    }

    async fn nack(&mut self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let message = self
            .unsettled
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;
        if requeue {
            self.queue.requeue_front(vec![message]);
        } else {
            let mut state = self.queue.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.dead_lettered += 1;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.closed = true;
        self.requeue_unsettled();
        Ok(())
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        self.requeue_unsettled();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn publish(broker: &InMemoryBroker, exchange: &str, payloads: &[&'static str]) {
        let mut publisher = broker.open_publisher(exchange).await.unwrap();
        for payload in payloads.iter().copied() {
            publisher
                .publish(None, Bytes::from_static(payload.as_bytes()))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_prefetch_window_holds_back_deliveries() {
        let broker = InMemoryBroker::new();
        publish(&broker, "jobs", &["a", "b"]).await;

        let mut subscriber = broker.open_subscriber("jobs", 1).await.unwrap();
        let first = subscriber.next_delivery().await.unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"a"));

        // Window is full until the first delivery is settled
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), subscriber.next_delivery()).await;
        assert!(blocked.is_err());

        subscriber.ack(first.tag).await.unwrap();
        let second = subscriber.next_delivery().await.unwrap();
        assert_eq!(second.payload, Bytes::from_static(b"b"));
        assert_eq!(second.tag, 2);
    }

    #[tokio::test]
    async fn test_ack_unknown_tag_fails() {
        let broker = InMemoryBroker::new();
        publish(&broker, "jobs", &["a"]).await;

        let mut subscriber = broker.open_subscriber("jobs", 4).await.unwrap();
        let delivery = subscriber.next_delivery().await.unwrap();
        subscriber.ack(delivery.tag).await.unwrap();

        assert_eq!(
            subscriber.ack(delivery.tag).await,
            Err(BrokerError::UnknownDeliveryTag(delivery.tag))
        );
        assert_eq!(
            subscriber.nack(99, true).await,
            Err(BrokerError::UnknownDeliveryTag(99))
        );
    }

    #[tokio::test]
    async fn test_nack_requeue_goes_to_front() {
        let broker = InMemoryBroker::new();
        publish(&broker, "jobs", &["a", "b"]).await;

        let mut subscriber = broker.open_subscriber("jobs", 1).await.unwrap();
        let first = subscriber.next_delivery().await.unwrap();
        subscriber.nack(first.tag, true).await.unwrap();

        let again = subscriber.next_delivery().await.unwrap();
        assert_eq!(again.payload, Bytes::from_static(b"a"));
        assert!(again.redelivered);
        assert_ne!(again.tag, first.tag);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = InMemoryBroker::new();
        publish(&broker, "jobs", &["a"]).await;

        let mut subscriber = broker.open_subscriber("jobs", 1).await.unwrap();
        let delivery = subscriber.next_delivery().await.unwrap();
        subscriber.nack(delivery.tag, false).await.unwrap();

        let stats = broker.stats("jobs").unwrap();
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_dropped_link_requeues_in_order() {
        let broker = InMemoryBroker::new();
        publish(&broker, "jobs", &["a", "b", "c"]).await;

        {
            let mut subscriber = broker.open_subscriber("jobs", 2).await.unwrap();
            subscriber.next_delivery().await.unwrap();
            subscriber.next_delivery().await.unwrap();
            assert_eq!(broker.stats("jobs").unwrap().in_flight, 2);
        }

        let stats = broker.stats("jobs").unwrap();
        assert_eq!(stats.ready, 3);
        assert_eq!(stats.in_flight, 0);

        let mut subscriber = broker.open_subscriber("jobs", 3).await.unwrap();
        let order: Vec<Bytes> = vec![
            subscriber.next_delivery().await.unwrap().payload,
            subscriber.next_delivery().await.unwrap().payload,
            subscriber.next_delivery().await.unwrap().payload,
        ];
        assert_eq!(
            order,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c")
            ]
        );
    }

    #[tokio::test]
    async fn test_waiting_subscriber_wakes_on_publish() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut subscriber = broker.open_subscriber("late", 1).await.unwrap();

        let publisher_broker = Arc::clone(&broker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publish(&publisher_broker, "late", &["hello"]).await;
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), subscriber.next_delivery())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, Bytes::from_static(b"hello"));
        assert_eq!(broker.exchange_names(), vec!["late".to_string()]);
    }
}
