//! Application context
//!
//! Everything a request handler or application code needs, built once at
//! startup and passed around behind an `Arc`.

use crate::address_table::AddressTable;
use crate::forwarder::RequestForwarder;
use anyhow::{Context, Result};
use peer_config::RelayConfig;
use relay_channels::{broker_for, ChannelConfig, ChannelRegistry};
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub struct AppContext {
    pub table: Arc<AddressTable>,
    pub channels: Arc<ChannelRegistry>,
    pub forwarder: RequestForwarder,
}

impl AppContext {
    pub fn new(table: AddressTable, channels: ChannelRegistry, forwarder: RequestForwarder) -> Self {
        Self {
            table: Arc::new(table),
            channels: Arc::new(channels),
            forwarder,
        }
    }

    /// Build from configuration. Must be called inside a Tokio runtime.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let table = AddressTable::from_config(config).context("Invalid address table")?;

        let endpoint = config
            .channels
            .broker_endpoint()
            .context("Invalid channel broker")?;
        let broker = broker_for(&endpoint, config.proxy.connect_timeout());
        let channels = ChannelRegistry::new(broker, ChannelConfig::from(&config.channels))
            .context("Failed to create channel registry")?;

        let forwarder = RequestForwarder::new(config.proxy.connect_timeout());

        info!(
            peers = table.len(),
            broker = ?endpoint,
            connect_timeout_ms = config.proxy.connect_timeout_ms,
            "Application context ready"
        );
        Ok(Self::new(table, channels, forwarder))
    }

    /// Release channel resources
    pub async fn shutdown(&self) {
        self.channels.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config() {
        let config = RelayConfig::from_toml_str(
            r#"
            [proxy]
            connect_timeout_ms = 250

            [peers.alpha]
            host = "127.0.0.1"
            port = 9000
            "#,
        )
        .unwrap();

        let context = AppContext::from_config(&config).unwrap();
        assert_eq!(context.table.len(), 1);
        assert_eq!(
            context.forwarder.connect_timeout(),
            std::time::Duration::from_millis(250)
        );
        assert!(context.channels.is_empty());
        context.shutdown().await;
    }

    #[tokio::test]
    async fn test_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.toml");
        std::fs::write(
            &path,
            r#"
            [peers.alpha]
            host = "127.0.0.1"
            port = 9000

            [peers.beta]
            host = "127.0.0.1"
            port = 9001

            [channels]
            prefetch = 4
            "#,
        )
        .unwrap();

        let config = RelayConfig::load(&path).unwrap();
        let context = AppContext::from_config(&config).unwrap();
        assert_eq!(context.table.len(), 2);
        assert_eq!(context.channels.config().prefetch, 4);

        let channel = context.channels.get_or_create("jobs").unwrap();
        channel.send("work").await.unwrap();
        let message = channel
            .receive(Some(std::time::Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload_str(), Some("work"));
        channel.acknowledge(&message.delivery_tag).await.unwrap();
        context.shutdown().await;
        assert!(context.channels.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_targets_fail_startup() {
        let config = RelayConfig::from_toml_str(
            r#"
            [peers.alpha]
            host = "127.0.0.1"
            port = 9000

            [peers.beta]
            host = "127.0.0.1"
            port = 9000
            "#,
        )
        .unwrap();
        assert!(AppContext::from_config(&config).is_err());
    }
}
