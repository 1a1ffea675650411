//! Burrow relay.
//!
//! Accepts agent connections on `GET /ws?token=...` and proxies
//! `ANY /<token>/<path...>` through the matching agent.

pub mod config;
pub mod correlation;
pub mod proxy;
pub mod registry;
pub mod tunnel;

use anyhow::Result;
use axum::{routing::get, Router};
use config::RelayConfig;
use correlation::CorrelationTable;
use registry::ConnectionRegistry;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Shared state of one relay process.
pub struct RelayState {
    pub config: RelayConfig,
    pub registry: ConnectionRegistry,
    pub pending: CorrelationTable,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            pending: CorrelationTable::new(),
        }
    }
}

/// Build the relay's HTTP surface.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(tunnel::websocket_handler))
        // Only GET is answered locally; other methods reach a `healthz` agent.
        .route(
            "/healthz",
            get(health_handler).fallback(proxy::proxy_handler),
        )
        .fallback(proxy::proxy_handler)
        .with_state(state)
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<RelayState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Relay listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}
