//! Broker wire frames
//!
//! Every frame is a big-endian `u32` length followed by a bincode-encoded
//! [`Frame`].

use crate::BrokerError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use peer_config::service::broker::MAX_FRAME_SIZE;

/// Frames exchanged between `TcpBroker` links and a `BrokerServer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame of a publisher connection
    OpenPublisher { exchange: String },
    /// First frame of a subscriber connection
    OpenSubscriber { exchange: String, prefetch: u16 },
    Publish {
        routing_key: Option<String>,
        payload: Vec<u8>,
    },
    Ack { tag: u64 },
    Nack { tag: u64, requeue: bool },
    Delivery {
        tag: u64,
        routing_key: Option<String>,
        payload: Vec<u8>,
        redelivered: bool,
    },
    /// Positive reply to open, publish, ack and nack
    Ok,
    /// Negative reply carrying the broker's error
    Error(BrokerError),
}

/// Write one length-prefixed frame and flush
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), BrokerError>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(BrokerError::protocol(format!(
            "Frame size {} exceeds maximum {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut buffer = Vec::with_capacity(4 + body.len());
    buffer.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buffer.extend_from_slice(&body);

    writer.write_all(&buffer).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the connection between frames.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Frame>, BrokerError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let frame_len = u32::from_be_bytes(len_bytes) as usize;
    if frame_len > max_size {
        return Err(BrokerError::protocol(format!(
            "Frame size {} exceeds maximum {}",
            frame_len, max_size
        )));
    }

    let mut body = vec![0u8; frame_len];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}
