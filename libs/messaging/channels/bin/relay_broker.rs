//! Standalone broker - serves in-memory exchanges over TCP
//!
//! Usage:
//!   relay-broker --listen 127.0.0.1:5673
//!   relay-broker --listen 0.0.0.0:5673 --log-level debug --json-logs

use anyhow::{Context, Result};
use clap::Parser;
use peer_config::service;
use relay_channels::{BrokerServer, InMemoryBroker};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay-broker")]
#[command(about = "Exchange broker for peer relay channels")]
#[command(version)]
struct Args {
    /// Address to accept broker links on
    #[arg(short, long, default_value = service::broker::LISTEN_ADDR)]
    listen: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting relay broker");

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind broker listener on {}", args.listen))?;

    let broker = Arc::new(InMemoryBroker::new());
    let server = BrokerServer::new(broker.clone());

    let result = server.run_until(listener, shutdown_signal()).await;

    for exchange in broker.exchange_names() {
        if let Some(stats) = broker.stats(&exchange) {
            info!(
                exchange = %exchange,
                ready = stats.ready,
                in_flight = stats.in_flight,
                published = stats.published,
                acknowledged = stats.acknowledged,
                "Exchange state at shutdown"
            );
        }
    }

    result.context("Broker server failed")
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_lowercase()));

    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
