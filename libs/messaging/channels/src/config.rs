//! Channel configuration
//!
//! Settings fixed at channel creation time. Built from
//! [`peer_config::ChannelSettings`] or programmatically.

use peer_config::{service, ChannelSettings};
use std::time::Duration;

/// Configuration for every channel a registry creates
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Acknowledge each delivery as it is popped, before the caller sees it.
    ///
    /// Trades delivery guarantees for simplicity: a crash between the pop and
    /// the caller finishing its work loses the message.
    pub auto_ack: bool,

    /// Unsettled deliveries a consumer link may hold
    pub prefetch: u16,

    /// Timeout used by `Channel::drain`
    pub default_timeout: Duration,

    /// Attempts used by `send` when no explicit count is given
    pub max_publish_attempts: u32,

    /// Capacity of the producer request queue and the consumer delivery queue.
    /// Both block when full.
    pub queue_capacity: usize,

    /// Delay before the first publish retry, doubled per attempt. Zero disables backoff.
    pub retry_backoff: Duration,

    /// Cap on the retry delay
    pub max_retry_backoff: Duration,

    /// Attempts a consumer makes to open its link
    pub connect_attempts: u32,

    /// Upper bound on messages returned by one batch receive
    pub max_batch_size: Option<usize>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            auto_ack: false,
            prefetch: service::channels::PREFETCH,
            default_timeout: Duration::from_millis(service::channels::DEFAULT_TIMEOUT_MS),
            max_publish_attempts: service::channels::MAX_PUBLISH_ATTEMPTS,
            queue_capacity: service::channels::QUEUE_CAPACITY,
            retry_backoff: Duration::from_millis(service::channels::RETRY_BACKOFF_MS),
            max_retry_backoff: Duration::from_millis(service::channels::MAX_RETRY_BACKOFF_MS),
            connect_attempts: service::channels::CONNECT_ATTEMPTS,
            max_batch_size: None,
        }
    }
}

impl From<&ChannelSettings> for ChannelConfig {
    fn from(settings: &ChannelSettings) -> Self {
        Self {
            auto_ack: settings.auto_ack,
            prefetch: settings.prefetch.max(1),
            default_timeout: settings.default_timeout(),
            max_publish_attempts: settings.max_publish_attempts.max(1),
            queue_capacity: settings.queue_capacity.max(1),
            retry_backoff: settings.retry_backoff(),
            max_retry_backoff: settings.max_retry_backoff(),
            connect_attempts: settings.connect_attempts.max(1),
            max_batch_size: settings.max_batch_size,
        }
    }
}

impl ChannelConfig {
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_max_publish_attempts(mut self, attempts: u32) -> Self {
        self.max_publish_attempts = attempts.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = Some(max);
        self
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if self.retry_backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.max_retry_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ChannelConfig {
            retry_backoff: Duration::from_millis(100),
            max_retry_backoff: Duration::from_millis(350),
            ..ChannelConfig::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(350));
        assert_eq!(config.backoff_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_zero_backoff_disables_delay() {
        let config = ChannelConfig::default().with_retry_backoff(Duration::ZERO);
        assert_eq!(config.backoff_for(5), Duration::ZERO);
    }

    #[test]
    fn test_from_settings() {
        let settings = ChannelSettings {
            auto_ack: true,
            prefetch: 8,
            max_batch_size: Some(32),
            ..ChannelSettings::default()
        };
        let config = ChannelConfig::from(&settings);
        assert!(config.auto_ack);
        assert_eq!(config.prefetch, 8);
        assert_eq!(config.max_batch_size, Some(32));
        assert_eq!(config.default_timeout, settings.default_timeout());
    }
}
