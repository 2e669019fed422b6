//! Service defaults
//!
//! Default values used when a configuration file leaves a setting out.

/// Routing proxy defaults
pub mod proxy {
    /// Listen address
    pub const LISTEN_ADDR: &str = "127.0.0.1:8080";

    /// Outbound dial timeout (milliseconds)
    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// Concurrent inbound connection cap (0 = unbounded)
    pub const MAX_CONNECTIONS: usize = 0;
}

/// Exchange channel defaults
pub mod channels {
    /// Broker endpoint used when none is configured
    pub const BROKER: &str = "memory";

    /// Unsettled deliveries a consumer may hold at once
    pub const PREFETCH: u16 = 1;

    /// Default receive timeout (milliseconds)
    pub const DEFAULT_TIMEOUT_MS: u64 = 1_000;

    /// Publish attempts before giving up
    pub const MAX_PUBLISH_ATTEMPTS: u32 = 3;

    /// Capacity of the in-process producer and consumer queues
    pub const QUEUE_CAPACITY: usize = 1_024;

    /// First retry delay (milliseconds)
    pub const RETRY_BACKOFF_MS: u64 = 50;

    /// Retry delay cap (milliseconds)
    pub const MAX_RETRY_BACKOFF_MS: u64 = 2_000;

    /// Attempts a consumer makes to open its link
    pub const CONNECT_ATTEMPTS: u32 = 3;
}

/// Broker server defaults
pub mod broker {
    /// Listen address for the TCP broker
    pub const LISTEN_ADDR: &str = "127.0.0.1:5673";

    /// Largest frame accepted on the broker wire
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
}
