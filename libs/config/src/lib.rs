//! # Peer Relay Configuration
//!
//! Configuration loading and defaults shared by the routing proxy and the
//! exchange channel layer.
//!
//! ## Features
//!
//! - **Address table entries**: logical peer name to `host:port`
//! - **Channel settings**: broker endpoint, acknowledgement mode, retry policy
//! - **Header names**: the routing and provenance headers on the wire
//!
//! ## Usage
//!
//! ```rust
//! use peer_config::RelayConfig;
//!
//! let config = RelayConfig::from_toml_str(r#"
//! [peers.alpha]
//! host = "10.0.0.1"
//! port = 9000
//! "#).unwrap();
//!
//! assert_eq!(config.get_peer("alpha").unwrap().port, 9000);
//! ```

pub mod protocol;
pub mod service;
pub mod service_config;

// Re-export commonly used types
pub use protocol::*;
pub use service_config::{
    load_config, BrokerEndpoint, ChannelSettings, ConfigError, LoggingSettings, PeerEntry,
    ProxySettings, RelayConfig,
};
