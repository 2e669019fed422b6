//! TCP broker client
//!
//! Every link is its own TCP connection to a `BrokerServer`. Publisher links
//! wait for the server's confirmation of each publish. Subscriber links run a
//! reader task that decodes frames into a queue, which keeps
//! `next_delivery` cancel-safe.

use super::frame::{read_frame, write_frame, Frame, MAX_FRAME_SIZE};
use crate::broker::{Broker, Delivery, PublisherLink, SubscriberLink};
use crate::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Frames buffered between the reader task and the link
const READ_QUEUE_DEPTH: usize = 64;

/// Broker reached over TCP
#[derive(Debug, Clone)]
pub struct TcpBroker {
    addr: String,
    connect_timeout: Duration,
}

impl TcpBroker {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }

    async fn dial(&self, opening: Frame) -> Result<TcpStream, BrokerError> {
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                BrokerError::connection_failed(format!(
                    "connect to {} timed out after {:?}",
                    self.addr, self.connect_timeout
                ))
            })?
            .map_err(|e| BrokerError::connection_failed(format!("{}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;

        write_frame(&mut stream, &opening).await?;
        match read_frame(&mut stream, MAX_FRAME_SIZE).await? {
            Some(Frame::Ok) => Ok(stream),
            Some(Frame::Error(e)) => Err(e),
            Some(other) => Err(unexpected(&other)),
            None => Err(BrokerError::connection_lost("broker closed during open")),
        }
    }
}

#[async_trait]
impl Broker for TcpBroker {
    async fn open_publisher(&self, exchange: &str) -> Result<Box<dyn PublisherLink>, BrokerError> {
        let stream = self
            .dial(Frame::OpenPublisher {
                exchange: exchange.to_string(),
            })
            .await?;
        debug!(broker = %self.addr, exchange, "Publisher link open");
        Ok(Box::new(TcpPublisher { stream }))
    }

    async fn open_subscriber(
        &self,
        exchange: &str,
        prefetch: u16,
    ) -> Result<Box<dyn SubscriberLink>, BrokerError> {
        let stream = self
            .dial(Frame::OpenSubscriber {
                exchange: exchange.to_string(),
                prefetch,
            })
            .await?;
        debug!(broker = %self.addr, exchange, prefetch, "Subscriber link open");
        Ok(Box::new(TcpSubscriber::new(stream)))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

fn unexpected(frame: &Frame) -> BrokerError {
    BrokerError::protocol(format!("unexpected frame {:?}", frame))
}

struct TcpPublisher {
    stream: TcpStream,
}

#[async_trait]
impl PublisherLink for TcpPublisher {
    async fn publish(
        &mut self,
        routing_key: Option<&str>,
        payload: Bytes,
    ) -> Result<(), BrokerError> {
        let frame = Frame::Publish {
            routing_key: routing_key.map(str::to_string),
            payload: payload.to_vec(),
        };
        write_frame(&mut self.stream, &frame).await?;
        match read_frame(&mut self.stream, MAX_FRAME_SIZE).await? {
            Some(Frame::Ok) => Ok(()),
            Some(Frame::Error(e)) => Err(e),
            Some(other) => Err(unexpected(&other)),
            None => Err(BrokerError::connection_lost("broker closed publisher link")),
        }
    }
}

struct TcpSubscriber {
    writer: OwnedWriteHalf,
    frames: mpsc::Receiver<Result<Frame, BrokerError>>,
    /// Deliveries that arrived while waiting for a settlement reply
    pending: VecDeque<Delivery>,
    reader: JoinHandle<()>,
}

impl TcpSubscriber {
    fn new(stream: TcpStream) -> Self {
        let (mut read_half, writer) = stream.into_split();
        let (tx, frames) = mpsc::channel(READ_QUEUE_DEPTH);

        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half, MAX_FRAME_SIZE).await {
                    Ok(Some(frame)) => {
                        if tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        Self {
            writer,
            frames,
            pending: VecDeque::new(),
            reader,
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, BrokerError> {
        match self.frames.recv().await {
            Some(frame) => frame,
            None => Err(BrokerError::connection_lost("broker closed subscriber link")),
        }
    }

    /// Send a settlement frame and wait for its reply, keeping any
    /// deliveries that overtake the reply
    async fn settle(&mut self, frame: Frame) -> Result<(), BrokerError> {
        write_frame(&mut self.writer, &frame).await?;
        loop {
            match self.next_frame().await? {
                Frame::Ok => return Ok(()),
                Frame::Error(e) => return Err(e),
                Frame::Delivery {
                    tag,
                    routing_key,
                    payload,
                    redelivered,
                } => self.pending.push_back(Delivery {
                    tag,
                    payload: Bytes::from(payload),
                    routing_key,
                    redelivered,
                }),
                other => return Err(unexpected(&other)),
            }
        }
    }
}

#[async_trait]
impl SubscriberLink for TcpSubscriber {
    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError> {
        if let Some(delivery) = self.pending.pop_front() {
            return Ok(delivery);
        }
        match self.next_frame().await? {
            Frame::Delivery {
                tag,
                routing_key,
                payload,
                redelivered,
            } => Ok(Delivery {
                tag,
                payload: Bytes::from(payload),
                routing_key,
                redelivered,
            }),
            Frame::Error(e) => Err(e),
            other => Err(unexpected(&other)),
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError> {
        self.settle(Frame::Ack { tag }).await
    }

    async fn nack(&mut self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.settle(Frame::Nack { tag, requeue }).await
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        use tokio::io::AsyncWriteExt;
        if let Err(e) = self.writer.shutdown().await {
            warn!(error = %e, "Subscriber link shutdown failed");
        }
        self.reader.abort();
        Ok(())
    }
}

impl Drop for TcpSubscriber {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
