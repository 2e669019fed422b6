//! Peer proxy binary
//!
//! Usage:
//!   peer-proxy --config config/proxy.toml
//!   peer-proxy --config config/proxy.toml --log-level debug --json-logs

use anyhow::{Context, Result};
use clap::Parser;
use peer_config::RelayConfig;
use peer_proxy::{AppContext, ProxyServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "peer-proxy")]
#[command(about = "Header-routed HTTP proxy for peer processes")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = RelayConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;

    init_logging(&args, &config);
    info!("Starting peer proxy");
    info!("Configuration: {}", args.config.display());

    let context = Arc::new(AppContext::from_config(&config)?);

    let listener = TcpListener::bind(&config.proxy.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.proxy.listen))?;

    let server = ProxyServer::new(Arc::clone(&context), config.proxy.max_connections);
    let result = server.run_until(listener, shutdown_signal()).await;

    context.shutdown().await;
    info!(
        connections = server.connections_accepted(),
        "Peer proxy stopped"
    );
    result.context("Proxy server failed")
}

fn init_logging(args: &Args, config: &RelayConfig) {
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));

    if args.json_logs || config.logging.json {
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
