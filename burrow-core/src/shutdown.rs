//! Process shutdown signal shared by the relay and agent binaries.

use tracing::{error, info};

/// Resolves once Ctrl-C is received.
///
/// If the handler cannot be installed the future never resolves, so the
/// process keeps serving instead of exiting on the spot.
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}
