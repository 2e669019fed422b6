//! TCP broker server
//!
//! Exposes any [`Broker`] over TCP. Each accepted connection carries exactly
//! one link, chosen by its first frame. Subscriber connections run a reader
//! task for settlement frames so the serving loop can wait on deliveries and
//! settlements at the same time.

use super::frame::{read_frame, write_frame, Frame, MAX_FRAME_SIZE};
use crate::broker::{Broker, PublisherLink, SubscriberLink};
use crate::BrokerError;
use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Serves a broker to `TcpBroker` clients
#[derive(Debug, Clone)]
pub struct BrokerServer {
    broker: Arc<dyn Broker>,
    max_frame_size: usize,
    connection_counter: Arc<AtomicU64>,
}

impl BrokerServer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            max_frame_size: MAX_FRAME_SIZE,
            connection_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total connections accepted so far
    pub fn connections_accepted(&self) -> u64 {
        self.connection_counter.load(Ordering::Relaxed)
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run_until<F>(self, listener: TcpListener, shutdown: F) -> Result<(), BrokerError>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, broker = %self.broker.describe(), "Broker server listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(addr = %local_addr, "Broker server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let id = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer).await {
                                    warn!(connection = id, peer = %peer, error = %e, "Broker connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), BrokerError> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        match read_frame(&mut reader, self.max_frame_size).await? {
            Some(Frame::OpenPublisher { exchange }) => {
                let link = match self.broker.open_publisher(&exchange).await {
                    Ok(link) => link,
                    Err(e) => return write_frame(&mut writer, &Frame::Error(e)).await,
                };
                write_frame(&mut writer, &Frame::Ok).await?;
                debug!(peer = %peer, exchange = %exchange, "Serving publisher link");
                self.serve_publisher(link, reader, writer).await
            }
            Some(Frame::OpenSubscriber { exchange, prefetch }) => {
                let link = match self.broker.open_subscriber(&exchange, prefetch).await {
                    Ok(link) => link,
                    Err(e) => return write_frame(&mut writer, &Frame::Error(e)).await,
                };
                write_frame(&mut writer, &Frame::Ok).await?;
                debug!(peer = %peer, exchange = %exchange, prefetch, "Serving subscriber link");
                self.serve_subscriber(link, reader, writer).await
            }
            Some(other) => {
                let e = BrokerError::protocol(format!("expected open frame, got {:?}", other));
                write_frame(&mut writer, &Frame::Error(e.clone())).await?;
                Err(e)
            }
            None => Ok(()),
        }
    }

    async fn serve_publisher(
        &self,
        mut link: Box<dyn PublisherLink>,
        mut reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
    ) -> Result<(), BrokerError> {
        while let Some(frame) = read_frame(&mut reader, self.max_frame_size).await? {
            let reply = match frame {
                Frame::Publish {
                    routing_key,
                    payload,
                } => match link.publish(routing_key.as_deref(), Bytes::from(payload)).await {
                    Ok(()) => Frame::Ok,
                    Err(e) => Frame::Error(e),
                },
                other => Frame::Error(BrokerError::protocol(format!(
                    "unexpected frame on publisher link: {:?}",
                    other
                ))),
            };
            write_frame(&mut writer, &reply).await?;
        }
        link.close().await
    }

    async fn serve_subscriber(
        &self,
        mut link: Box<dyn SubscriberLink>,
        mut reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
    ) -> Result<(), BrokerError> {
        let (tx, mut settlements) = mpsc::channel(16);
        let max_frame_size = self.max_frame_size;
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, max_frame_size).await {
                    Ok(Some(frame)) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "Subscriber link read failed");
                        break;
                    }
                }
            }
        });

        let result = loop {
            tokio::select! {
                frame = settlements.recv() => {
                    let reply = match frame {
                        Some(Frame::Ack { tag }) => link.ack(tag).await,
                        Some(Frame::Nack { tag, requeue }) => link.nack(tag, requeue).await,
                        Some(other) => Err(BrokerError::protocol(format!(
                            "unexpected frame on subscriber link: {:?}",
                            other
                        ))),
                        // Client went away
                        None => break Ok(()),
                    };
                    let reply = match reply {
                        Ok(()) => Frame::Ok,
                        Err(e) => Frame::Error(e),
                    };
                    if let Err(e) = write_frame(&mut writer, &reply).await {
                        break Err(e);
                    }
                }
                delivery = link.next_delivery() => {
                    let frame = match delivery {
                        Ok(d) => Frame::Delivery {
                            tag: d.tag,
                            routing_key: d.routing_key,
                            payload: d.payload.to_vec(),
                            redelivered: d.redelivered,
                        },
                        Err(e) => {
                            let _ = write_frame(&mut writer, &Frame::Error(e.clone())).await;
                            break Err(e);
                        }
                    };
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        break Err(e);
                    }
                }
            }
        };

        reader_task.abort();
        let _ = writer.shutdown().await;
        link.close().await?;
        result
    }
}
