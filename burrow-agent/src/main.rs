//! Burrow Agent - private half of the tunnel.
//!
//! Runs next to the service being exposed and keeps a connection to the
//! relay open.

use anyhow::Result;
use burrow_agent::{AgentConfig, Supervisor};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration
    let config = AgentConfig::parse();

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .init();

    info!("Starting burrow-agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Relay: {}", config.server);
    info!("Target: {}", config.target);
    if config.max_concurrent > 0 {
        info!("At most {} local requests in flight", config.max_concurrent);
    }

    let supervisor = Supervisor::new(config)?;

    tokio::select! {
        _ = supervisor.run() => {}
        _ = burrow_core::shutdown::ctrl_c() => {}
    }

    Ok(())
}
