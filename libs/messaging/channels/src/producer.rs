//! Message producer
//!
//! Each producer owns a background worker that owns the publisher link.
//! Callers hand requests to the worker through a bounded queue and wait for
//! the outcome, so a failed publish always reaches the caller that made it.
//!
//! The link is opened on the first publish rather than at creation, so
//! channels can be declared before the broker is reachable.

use crate::broker::{Broker, PublisherLink};
use crate::{BrokerError, ChannelConfig, ChannelError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum ProducerCommand {
    Publish {
        payload: Bytes,
        routing_key: Option<String>,
        max_attempts: u32,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Snapshot of producer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub published: u64,
    pub failed: u64,
    pub retries: u64,
    pub connects: u64,
}

#[derive(Debug, Default)]
struct ProducerMetrics {
    published: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    connects: AtomicU64,
}

/// Publishing side of an exchange channel
#[derive(Debug)]
pub struct MessageProducer {
    exchange: String,
    default_attempts: u32,
    commands: mpsc::Sender<ProducerCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<ProducerMetrics>,
}

impl MessageProducer {
    pub(crate) fn spawn(
        exchange: &str,
        broker: Arc<dyn Broker>,
        config: &ChannelConfig,
        runtime: &Handle,
    ) -> Self {
        let (commands, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let metrics = Arc::new(ProducerMetrics::default());

        let worker = ProducerWorker {
            exchange: exchange.to_string(),
            broker,
            link: None,
            config: config.clone(),
            metrics: Arc::clone(&metrics),
        };
        let handle = runtime.spawn(worker.run(receiver));

        Self {
            exchange: exchange.to_string(),
            default_attempts: config.max_publish_attempts.max(1),
            commands,
            worker: Mutex::new(Some(handle)),
            metrics,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publish with the configured number of attempts
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.publish(payload, None, self.default_attempts).await
    }

    /// Publish `payload`, retrying transient failures up to `max_attempts` times.
    ///
    /// Waits for room when the request queue is full.
    pub async fn publish(
        &self,
        payload: impl Into<Bytes>,
        routing_key: Option<&str>,
        max_attempts: u32,
    ) -> Result<(), ChannelError> {
        if max_attempts == 0 {
            return Err(ChannelError::invalid_argument("max_attempts must be at least 1"));
        }

        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(ProducerCommand::Publish {
                payload: payload.into(),
                routing_key: routing_key.map(str::to_string),
                max_attempts,
                reply,
            })
            .await
            .map_err(|_| ChannelError::Closed(self.exchange.clone()))?;

        outcome
            .await
            .map_err(|_| ChannelError::Closed(self.exchange.clone()))?
    }

    /// Finish queued publishes, close the link and stop the worker
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(ProducerCommand::Shutdown { reply })
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
        self.commands.is_closed()
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            published: self.metrics.published.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
            connects: self.metrics.connects.load(Ordering::Relaxed),
        }
    }
}

struct ProducerWorker {
    exchange: String,
    broker: Arc<dyn Broker>,
    link: Option<Box<dyn PublisherLink>>,
    config: ChannelConfig,
    metrics: Arc<ProducerMetrics>,
}

impl ProducerWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<ProducerCommand>) {
        debug!(exchange = %self.exchange, "Producer worker started");

        while let Some(command) = commands.recv().await {
            match command {
                ProducerCommand::Publish {
                    payload,
                    routing_key,
                    max_attempts,
                    reply,
                } => {
                    let result = self
                        .publish_with_retry(payload, routing_key.as_deref(), max_attempts)
                        .await;
                    // Caller may have given up waiting; the outcome still happened
                    let _ = reply.send(result);
                }
                ProducerCommand::Shutdown { reply } => {
                    self.close_link().await;
                    let _ = reply.send(());
                    info!(exchange = %self.exchange, "Producer closed");
                    return;
                }
            }
        }

        self.close_link().await;
        debug!(exchange = %self.exchange, "Producer worker stopped");
    }

    async fn publish_with_retry(
        &mut self,
        payload: Bytes,
        routing_key: Option<&str>,
        max_attempts: u32,
    ) -> Result<(), ChannelError> {
        let mut attempts = 0;
        let mut last_error = BrokerError::Closed;

        while attempts < max_attempts {
            attempts += 1;
            match self.try_publish(payload.clone(), routing_key).await {
                Ok(()) => {
                    self.metrics.published.fetch_add(1, Ordering::Relaxed);
                    if attempts > 1 {
                        debug!(exchange = %self.exchange, attempts, "Publish succeeded after retry");
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        exchange = %self.exchange,
                        attempt = attempts,
                        max_attempts,
                        error = %e,
                        "Publish attempt failed"
                    );
                    let transient = e.is_transient();
                    if transient {
                        // Reconnect on the next attempt
                        self.link = None;
                    }
                    last_error = e;
                    if !transient || attempts >= max_attempts {
                        break;
                    }

                    let delay = self.config.backoff_for(attempts);
                    if delay > Duration::ZERO {
                        tokio::time::sleep(delay).await;
                    }
                    self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.metrics.failed.fetch_add(1, Ordering::Relaxed);
        Err(ChannelError::PublishFailed {
            exchange: self.exchange.clone(),
            attempts,
            reason: last_error,
        })
    }

    async fn try_publish(
        &mut self,
        payload: Bytes,
        routing_key: Option<&str>,
    ) -> Result<(), BrokerError> {
        if self.link.is_none() {
            let link = self.broker.open_publisher(&self.exchange).await?;
            self.metrics.connects.fetch_add(1, Ordering::Relaxed);
            debug!(exchange = %self.exchange, broker = %self.broker.describe(), "Publisher link established");
            self.link = Some(link);
        }
        match self.link.as_mut() {
            Some(link) => link.publish(routing_key, payload).await,
            None => Err(BrokerError::Closed),
        }
    }

    async fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.close().await {
                warn!(exchange = %self.exchange, error = %e, "Closing publisher link failed");
            }
        }
    }
}
