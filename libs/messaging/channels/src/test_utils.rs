//! Brokers with scripted failures for exercising retry and error paths

use crate::broker::{Broker, PublisherLink, SubscriberLink};
use crate::{BrokerError, InMemoryBroker};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct FlakyCounters {
    failures_remaining: AtomicU32,
    reject_all: AtomicBool,
    publish_attempts: AtomicU64,
    publisher_opens: AtomicU64,
}

/// In-memory broker whose publisher links fail on demand.
///
/// Subscriber links are passed through untouched, so messages that do get
/// published can be consumed normally.
#[derive(Debug, Clone)]
pub struct FlakyBroker {
    inner: Arc<InMemoryBroker>,
    counters: Arc<FlakyCounters>,
}

impl FlakyBroker {
    /// Fail the next `failures` publishes with a lost connection
    pub fn failing_first(failures: u32) -> Self {
        let broker = Self::wrapping(Arc::new(InMemoryBroker::new()));
        broker
            .counters
            .failures_remaining
            .store(failures, Ordering::SeqCst);
        broker
    }

    /// Reject every publish with a non-transient error
    pub fn rejecting() -> Self {
        let broker = Self::wrapping(Arc::new(InMemoryBroker::new()));
        broker.counters.reject_all.store(true, Ordering::SeqCst);
        broker
    }

    pub fn wrapping(inner: Arc<InMemoryBroker>) -> Self {
        Self {
            inner,
            counters: Arc::new(FlakyCounters::default()),
        }
    }

    pub fn inner(&self) -> &Arc<InMemoryBroker> {
        &self.inner
    }

    /// Publish calls seen by any link, successful or not
    pub fn publish_attempts(&self) -> u64 {
        self.counters.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn publisher_opens(&self) -> u64 {
        self.counters.publisher_opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn open_publisher(&self, exchange: &str) -> Result<Box<dyn PublisherLink>, BrokerError> {
        self.counters.publisher_opens.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.open_publisher(exchange).await?;
        Ok(Box::new(FlakyPublisher {
            inner,
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn open_subscriber(
        &self,
        exchange: &str,
        prefetch: u16,
    ) -> Result<Box<dyn SubscriberLink>, BrokerError> {
        self.inner.open_subscriber(exchange, prefetch).await
    }

    fn describe(&self) -> String {
        "flaky-memory".to_string()
    }
}

struct FlakyPublisher {
    inner: Box<dyn PublisherLink>,
    counters: Arc<FlakyCounters>,
}

#[async_trait]
impl PublisherLink for FlakyPublisher {
    async fn publish(
        &mut self,
        routing_key: Option<&str>,
        payload: Bytes,
    ) -> Result<(), BrokerError> {
        self.counters.publish_attempts.fetch_add(1, Ordering::SeqCst);

        if self.counters.reject_all.load(Ordering::SeqCst) {
            return Err(BrokerError::Rejected("exchange refuses messages".to_string()));
        }
        let failed = self
            .counters
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BrokerError::connection_lost("scripted failure"));
        }

        self.inner.publish(routing_key, payload).await
    }
}

/// Broker that can never be reached
#[derive(Debug, Default)]
pub struct UnreachableBroker {
    opens: AtomicU64,
}

impl UnreachableBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link opens attempted so far
    pub fn open_attempts(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for UnreachableBroker {
    async fn open_publisher(&self, _exchange: &str) -> Result<Box<dyn PublisherLink>, BrokerError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Err(BrokerError::connection_failed("broker unreachable"))
    }

    async fn open_subscriber(
        &self,
        _exchange: &str,
        _prefetch: u16,
    ) -> Result<Box<dyn SubscriberLink>, BrokerError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Err(BrokerError::connection_failed("broker unreachable"))
    }

    fn describe(&self) -> String {
        "unreachable".to_string()
    }
}
