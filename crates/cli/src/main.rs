mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use toolmux_core::Aggregator;
use toolmux_mcp::StdioTransport;

use crate::cli::CliArgs;

#[tokio::main]
async fn main() -> Result<()> {
    // .env may carry TOOLMUX_CONFIG or RUST_LOG
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();

    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = config::load(args.config.as_deref()).context("failed to load configuration")?;

    if args.check {
        eprintln!("{} upstream server(s) configured", config.mcp_servers.len());
        for line in config::summary(&config) {
            eprintln!("  {line}");
        }
        return Ok(());
    }

    let upstreams = config.mcp_servers.len();
    let hub = Aggregator::new(config).context("failed to create aggregator")?;
    hub.serve(Arc::new(StdioTransport::new()))
        .context("failed to serve on stdio")?;
    info!(upstreams, "toolmux serving on stdio");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
        _ = hub.closed() => info!("downstream disconnected"),
    }

    hub.close().await;
    Ok(())
}
