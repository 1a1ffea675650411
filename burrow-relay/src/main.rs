//! Burrow Relay - public half of the tunnel.
//!
//! Runs on a reachable host, accepts agent connections and proxies public
//! traffic to them.

use anyhow::Result;
use burrow_relay::{config::RelayConfig, RelayState};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration
    let config = RelayConfig::parse();

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting burrow-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Request timeout: {}s", config.request_timeout);
    info!(
        "Outbound queue: capacity {} ({:?} when full)",
        config.queue_capacity, config.queue_policy
    );

    let listener = TcpListener::bind(&config.listen).await?;
    let state = Arc::new(RelayState::new(config));

    burrow_relay::serve(listener, state, burrow_core::shutdown::ctrl_c()).await
}
