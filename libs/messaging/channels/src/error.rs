use crate::DeliveryTag;
use serde::{Deserialize, Serialize};

/// Errors raised by a broker link.
///
/// Serializable so the TCP broker can carry them back to clients unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Publish rejected: {0}")]
    Rejected(String),

    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Link closed")]
    Closed,
}

impl BrokerError {
    /// Transient errors are worth a reconnect and another attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionFailed(_) | BrokerError::ConnectionLost(_)
        )
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        BrokerError::ConnectionFailed(msg.into())
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        BrokerError::ConnectionLost(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        BrokerError::Protocol(msg.into())
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::ConnectionLost(err.to_string())
    }
}

impl From<bincode::Error> for BrokerError {
    fn from(err: bincode::Error) -> Self {
        BrokerError::Protocol(err.to_string())
    }
}

/// Errors surfaced to application code using exchange channels
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Publish to '{exchange}' failed after {attempts} attempt(s): {reason}")]
    PublishFailed {
        exchange: String,
        attempts: u32,
        reason: BrokerError,
    },

    #[error("Delivery tag {0} was already settled")]
    AlreadySettled(DeliveryTag),

    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(DeliveryTag),

    #[error("Channel '{0}' is closed")]
    Closed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Batch receive requires a finite timeout")]
    UnboundedTimeout,

    #[error("No Tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl ChannelError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ChannelError::InvalidArgument(msg.into())
    }

    /// Settlement errors are caller mistakes and must not be retried
    pub fn is_settlement_error(&self) -> bool {
        matches!(
            self,
            ChannelError::AlreadySettled(_) | ChannelError::UnknownDeliveryTag(_)
        )
    }
}
