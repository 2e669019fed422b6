//! Service Configuration Module
//!
//! Provides configuration loading for the routing proxy and the exchange
//! channels. Supports loading from TOML files with environment overrides
//! (`PEER_RELAY__SECTION__KEY=value`).

use crate::service;
use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Errors raised while parsing or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to expand '{value}': {message}")]
    Expand { value: String, message: String },

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct RelayConfig {
    /// Routing proxy settings
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Address table entries keyed by logical peer name
    #[serde(default)]
    pub peers: BTreeMap<String, PeerEntry>,

    /// Exchange channel settings
    #[serde(default)]
    pub channels: ChannelSettings,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// One address table entry
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub host: String,
    pub port: u16,
}

/// Routing proxy settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProxySettings {
    pub listen: String,
    pub connect_timeout_ms: u64,
    /// Concurrent inbound connection cap, 0 means unbounded
    pub max_connections: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen: service::proxy::LISTEN_ADDR.to_string(),
            connect_timeout_ms: service::proxy::CONNECT_TIMEOUT_MS,
            max_connections: service::proxy::MAX_CONNECTIONS,
        }
    }
}

impl ProxySettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Exchange channel settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ChannelSettings {
    /// `memory` or `tcp://host:port`
    pub broker: String,
    /// Acknowledge deliveries before handing them to the caller.
    /// A crash between acknowledgement and processing loses the message.
    pub auto_ack: bool,
    pub prefetch: u16,
    pub default_timeout_ms: u64,
    pub max_publish_attempts: u32,
    pub queue_capacity: usize,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    pub connect_attempts: u32,
    pub max_batch_size: Option<usize>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            broker: service::channels::BROKER.to_string(),
            auto_ack: false,
            prefetch: service::channels::PREFETCH,
            default_timeout_ms: service::channels::DEFAULT_TIMEOUT_MS,
            max_publish_attempts: service::channels::MAX_PUBLISH_ATTEMPTS,
            queue_capacity: service::channels::QUEUE_CAPACITY,
            retry_backoff_ms: service::channels::RETRY_BACKOFF_MS,
            max_retry_backoff_ms: service::channels::MAX_RETRY_BACKOFF_MS,
            connect_attempts: service::channels::CONNECT_ATTEMPTS,
            max_batch_size: None,
        }
    }
}

impl ChannelSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms)
    }

    /// Parse the `broker` setting
    pub fn broker_endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        BrokerEndpoint::parse(&self.broker)
    }
}

/// Where exchange channels open their links
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEndpoint {
    /// In-process broker
    Memory,
    /// Remote broker reachable at `host:port`
    Tcp(String),
}

impl BrokerEndpoint {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("memory") {
            return Ok(BrokerEndpoint::Memory);
        }
        match value.strip_prefix("tcp://") {
            Some(addr) if !addr.is_empty() => Ok(BrokerEndpoint::Tcp(addr.to_string())),
            _ => Err(ConfigError::invalid(
                "channels.broker",
                format!("expected 'memory' or 'tcp://host:port', got '{}'", value),
            )),
        }
    }
}

/// Log output settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a file with environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration: {:?}", path);

        let config = Config::builder()
            .add_source(File::from(path).required(true))
            .add_source(
                Environment::with_prefix("PEER_RELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let mut relay_config: RelayConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        relay_config
            .expand_env_vars()
            .context("Failed to expand environment variables")?;
        relay_config.validate().context("Invalid configuration")?;

        debug!(peers = relay_config.peers.len(), "Configuration loaded");
        Ok(relay_config)
    }

    /// Parse configuration from an inline TOML string
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let mut relay_config: RelayConfig = toml::from_str(toml_str)?;
        relay_config.expand_env_vars()?;
        relay_config.validate()?;
        Ok(relay_config)
    }

    /// Look up an address table entry
    pub fn get_peer(&self, name: &str) -> Option<&PeerEntry> {
        self.peers.get(name)
    }

    /// Expand environment variables in host and broker strings
    pub fn expand_env_vars(&mut self) -> Result<(), ConfigError> {
        for peer in self.peers.values_mut() {
            peer.host = expand(&peer.host)?;
        }
        self.channels.broker = expand(&self.channels.broker)?;
        self.proxy.listen = expand(&self.proxy.listen)?;
        Ok(())
    }

    /// Check settings that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, peer) in &self.peers {
            if name.trim().is_empty() {
                return Err(ConfigError::invalid("peers", "peer name is empty"));
            }
            if peer.host.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("peers.{}.host", name),
                    "host is empty",
                ));
            }
        }

        if self.channels.max_publish_attempts == 0 {
            return Err(ConfigError::invalid(
                "channels.max_publish_attempts",
                "must be at least 1",
            ));
        }
        if self.channels.prefetch == 0 {
            return Err(ConfigError::invalid("channels.prefetch", "must be at least 1"));
        }
        if self.channels.queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "channels.queue_capacity",
                "must be at least 1",
            ));
        }
        if self.channels.connect_attempts == 0 {
            return Err(ConfigError::invalid(
                "channels.connect_attempts",
                "must be at least 1",
            ));
        }
        self.channels.broker_endpoint()?;

        Ok(())
    }
}

fn expand(value: &str) -> Result<String, ConfigError> {
    shellexpand::env(value)
        .map(|expanded| expanded.into_owned())
        .map_err(|e| ConfigError::Expand {
            value: value.to_string(),
            message: e.to_string(),
        })
}

/// Convenience function to load configuration from a path
pub fn load_config(path: impl AsRef<Path>) -> Result<RelayConfig> {
    RelayConfig::load(path.as_ref())
}
