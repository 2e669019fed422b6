//! Message consumer
//!
//! A consumer worker owns one subscriber link. It pulls deliveries from the
//! link into a bounded queue that `receive` reads from, and executes
//! settlements sent back by callers. The broker's prefetch window limits how
//! many deliveries the link hands out before some are settled.
//!
//! Deliveries waiting in the queue stay unsettled on the link, so closing
//! the consumer returns them to the broker.
//!
//! Settlement is checked against the consumer's outstanding tags before it
//! reaches the worker, so double settlement and foreign tags fail fast
//! without a broker round trip.

use crate::broker::{Broker, Delivery, SubscriberLink};
use crate::{BrokerError, ChannelConfig, ChannelError, DeliveryTag, Message};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Source of consumer link ids; tags never collide across consumers
static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Nack { requeue: bool },
}

enum ConsumerCommand {
    Settle {
        sequence: u64,
        action: Settlement,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Snapshot of consumer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub redelivered: u64,
}

#[derive(Debug, Default)]
struct ConsumerMetrics {
    received: AtomicU64,
    acknowledged: AtomicU64,
    rejected: AtomicU64,
    redelivered: AtomicU64,
}

/// Tags handed to callers and not yet settled
#[derive(Debug, Default)]
struct SettlementTracker {
    outstanding: HashSet<u64>,
    highest_issued: u64,
}

impl SettlementTracker {
    fn issue(&mut self, sequence: u64, settled: bool) {
        self.highest_issued = self.highest_issued.max(sequence);
        if !settled {
            self.outstanding.insert(sequence);
        }
    }

    fn claim(&mut self, tag: &DeliveryTag) -> Result<(), ChannelError> {
        if self.outstanding.remove(&tag.sequence()) {
            Ok(())
        } else if tag.sequence() <= self.highest_issued {
            Err(ChannelError::AlreadySettled(tag.clone()))
        } else {
            Err(ChannelError::UnknownDeliveryTag(tag.clone()))
        }
    }
}

/// Receiving side of an exchange channel
#[derive(Debug)]
pub struct MessageConsumer {
    exchange: Arc<str>,
    link_id: u64,
    auto_ack: bool,
    max_batch_size: Option<usize>,
    deliveries: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    commands: mpsc::Sender<ConsumerCommand>,
    tracker: Mutex<SettlementTracker>,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: ConsumerMetrics,
}

impl MessageConsumer {
    pub(crate) fn spawn(
        exchange: &str,
        broker: Arc<dyn Broker>,
        config: &ChannelConfig,
        runtime: &Handle,
    ) -> Self {
        let exchange: Arc<str> = Arc::from(exchange);
        let link_id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let (deliveries_tx, deliveries) = mpsc::channel(config.queue_capacity.max(1));
        let (commands, command_rx) = mpsc::channel(config.queue_capacity.max(1));

        let worker = ConsumerWorker {
            exchange: Arc::clone(&exchange),
            link_id,
            broker,
            config: config.clone(),
        };
        let handle = runtime.spawn(worker.run(command_rx, deliveries_tx));

        Self {
            exchange,
            link_id,
            auto_ack: config.auto_ack,
            max_batch_size: config.max_batch_size,
            deliveries: tokio::sync::Mutex::new(deliveries),
            commands,
            tracker: Mutex::new(SettlementTracker::default()),
            closed: AtomicBool::new(false),
            worker: Mutex::new(Some(handle)),
            metrics: ConsumerMetrics::default(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }

    fn closed_error(&self) -> ChannelError {
        ChannelError::Closed(self.exchange.to_string())
    }

    /// Wait for the next message.
    ///
    /// `None` waits indefinitely. When the timeout elapses first the result
    /// is `Ok(None)`. In auto-acknowledge mode the message is acknowledged
    /// here, after it leaves the queue and before it is returned.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Message>, ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }

        let next = async {
            let mut deliveries = self.deliveries.lock().await;
            deliveries.recv().await
        };
        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, next).await {
                Ok(received) => received,
                Err(_) => return Ok(None),
            },
            None => next.await,
        };

        let message = received.ok_or_else(|| self.closed_error())?;
        let sequence = message.delivery_tag.sequence();
        self.tracker.lock().issue(sequence, self.auto_ack);
        if self.auto_ack {
            // Unsettled until popped; a failed ack leaves it for the broker to requeue
            self.execute(sequence, Settlement::Ack).await?;
            self.metrics.acknowledged.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.received.fetch_add(1, Ordering::Relaxed);
        if message.redelivered {
            self.metrics.redelivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Some(message))
    }

    /// Receive until one fetch waits `timeout` without a message, or until
    /// the configured batch cap is reached.
    ///
    /// An empty vector means the exchange stayed empty for `timeout`.
    pub async fn receive_batch(&self, timeout: Duration) -> Result<Vec<Message>, ChannelError> {
        if timeout == Duration::MAX {
            return Err(ChannelError::UnboundedTimeout);
        }

        let mut batch = Vec::new();
        loop {
            if self.max_batch_size.is_some_and(|max| batch.len() >= max) {
                break;
            }
            match self.receive(Some(timeout)).await {
                Ok(Some(message)) => batch.push(message),
                Ok(None) => break,
                Err(e) if batch.is_empty() => return Err(e),
                Err(e) => {
                    // Messages already taken belong to the caller now
                    warn!(exchange = %self.exchange, received = batch.len(), error = %e, "Batch receive cut short");
                    break;
                }
            }
        }

        debug!(exchange = %self.exchange, count = batch.len(), "Batch received");
        Ok(batch)
    }

    /// Confirm processing of a received message
    pub async fn acknowledge(&self, tag: &DeliveryTag) -> Result<(), ChannelError> {
        self.settle(tag, Settlement::Ack).await?;
        self.metrics.acknowledged.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Reject a received message; with `requeue` the broker delivers it again
    pub async fn negative_acknowledge(
        &self,
        tag: &DeliveryTag,
        requeue: bool,
    ) -> Result<(), ChannelError> {
        self.settle(tag, Settlement::Nack { requeue }).await?;
        self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn settle(&self, tag: &DeliveryTag, action: Settlement) -> Result<(), ChannelError> {
        if tag.exchange() != &*self.exchange || tag.link() != self.link_id {
            return Err(ChannelError::UnknownDeliveryTag(tag.clone()));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        self.tracker.lock().claim(tag)?;
        self.execute(tag.sequence(), action).await
    }

    /// Run a settlement on the worker's link and wait for the outcome
    async fn execute(&self, sequence: u64, action: Settlement) -> Result<(), ChannelError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(ConsumerCommand::Settle {
                sequence,
                action,
                reply,
            })
            .await
            .map_err(|_| self.closed_error())?;

        outcome.await.map_err(|_| self.closed_error())??;
        Ok(())
    }

    /// Stop the worker. A delivery not yet handed to a caller is requeued and
    /// the broker requeues everything left unsettled.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(ConsumerCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.commands.is_closed()
    }

    /// Received messages not yet settled
    pub fn outstanding(&self) -> usize {
        self.tracker.lock().outstanding.len()
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.metrics.received.load(Ordering::Relaxed),
            acknowledged: self.metrics.acknowledged.load(Ordering::Relaxed),
            rejected: self.metrics.rejected.load(Ordering::Relaxed),
            redelivered: self.metrics.redelivered.load(Ordering::Relaxed),
        }
    }
}

struct ConsumerWorker {
    exchange: Arc<str>,
    link_id: u64,
    broker: Arc<dyn Broker>,
    config: ChannelConfig,
}

impl ConsumerWorker {
    async fn run(
        self,
        mut commands: mpsc::Receiver<ConsumerCommand>,
        deliveries: mpsc::Sender<Message>,
    ) {
        let mut link = match self.connect().await {
            Ok(link) => link,
            Err(e) => {
                error!(exchange = %self.exchange, error = %e, "Consumer could not open its link");
                return;
            }
        };
        debug!(exchange = %self.exchange, link = self.link_id, prefetch = self.config.prefetch, "Consumer worker started");

        let mut pending: Option<Delivery> = None;
        let mut shutdown_reply = None;

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(ConsumerCommand::Settle { sequence, action, reply }) => {
                        let result = match action {
                            Settlement::Ack => link.ack(sequence).await,
                            Settlement::Nack { requeue } => link.nack(sequence, requeue).await,
                        };
                        if let Err(e) = &result {
                            warn!(exchange = %self.exchange, sequence, error = %e, "Settlement failed");
                        }
                        let lost = matches!(&result, Err(e) if e.is_transient());
                        let _ = reply.send(result);
                        if lost {
                            break;
                        }
                    }
                    Some(ConsumerCommand::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    None => break,
                },

                permit = deliveries.reserve(), if pending.is_some() => {
                    let Ok(permit) = permit else { break };
                    let Some(delivery) = pending.take() else { continue };
                    permit.send(self.to_message(delivery));
                }

                delivery = link.next_delivery(), if pending.is_none() => match delivery {
                    Ok(delivery) => pending = Some(delivery),
                    Err(e) => {
                        warn!(exchange = %self.exchange, error = %e, "Consumer link failed");
                        break;
                    }
                },
            }
        }

        if let Some(delivery) = pending.take() {
            if let Err(e) = link.nack(delivery.tag, true).await {
                debug!(exchange = %self.exchange, error = %e, "Requeue on close failed");
            }
        }
        if let Err(e) = link.close().await {
            debug!(exchange = %self.exchange, error = %e, "Closing subscriber link failed");
        }
        info!(exchange = %self.exchange, link = self.link_id, "Consumer closed");

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    async fn connect(&self) -> Result<Box<dyn SubscriberLink>, BrokerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .broker
                .open_subscriber(&self.exchange, self.config.prefetch)
                .await
            {
                Ok(link) => return Ok(link),
                Err(e) if e.is_transient() && attempt < self.config.connect_attempts => {
                    warn!(exchange = %self.exchange, attempt, error = %e, "Subscriber link open failed, retrying");
                    tokio::time::sleep(self.config.backoff_for(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn to_message(&self, delivery: Delivery) -> Message {
        Message {
            payload: delivery.payload,
            delivery_tag: DeliveryTag::new(Arc::clone(&self.exchange), self.link_id, delivery.tag),
            exchange: self.exchange.to_string(),
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
        }
    }
}
