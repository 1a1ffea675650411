//! Agent configuration.

use burrow_core::{connection::DEFAULT_QUEUE_CAPACITY, TunnelError, TunnelResult};
use clap::Parser;
use std::time::Duration;
use url::Url;

/// Burrow Agent - Serve a private HTTP target through a public relay.
#[derive(Parser, Debug, Clone)]
#[command(name = "burrow-agent")]
#[command(author, version, about, long_about = None)]
pub struct AgentConfig {
    /// Relay WebSocket endpoint (ws://host:port/ws, wss://..., or host:port)
    #[arg(short, long, env = "BURROW_SERVER", default_value = "ws://localhost:8080/ws")]
    pub server: String,

    /// Routing token; public traffic reaches this agent at /<token>/...
    #[arg(short, long, env = "BURROW_TOKEN", default_value = "demo")]
    pub token: String,

    /// Base URL of the local HTTP service requests are forwarded to
    #[arg(long, env = "BURROW_TARGET", default_value = "http://127.0.0.1:3000")]
    pub target: String,

    /// Seconds allowed for each local request
    #[arg(long, env = "BURROW_REQUEST_TIMEOUT", default_value = "15")]
    pub request_timeout: u64,

    /// Seconds allowed for the relay handshake (TCP connect and upgrade)
    #[arg(long, env = "BURROW_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// Seconds to wait before reconnecting after the tunnel drops
    #[arg(long, env = "BURROW_RECONNECT_DELAY", default_value = "3")]
    pub reconnect_delay: u64,

    /// Responses that may wait in the outbound queue
    #[arg(long, env = "BURROW_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Seconds between keepalive pings (0 to disable)
    #[arg(long, env = "BURROW_HEARTBEAT_INTERVAL", default_value = "30")]
    pub heartbeat_interval: u64,

    /// Maximum local requests in flight at once (0 = unbounded)
    #[arg(long, env = "BURROW_MAX_CONCURRENT", default_value = "0")]
    pub max_concurrent: usize,

    /// Enable debug logging
    #[arg(long, env = "BURROW_DEBUG")]
    pub debug: bool,
}

impl AgentConfig {
    /// The relay URL to dial, including the routing token.
    pub fn ws_url(&self) -> TunnelResult<Url> {
        let server = self.server.trim_end_matches('/');

        // Bare host:port gets the default scheme and path
        let raw = if server.contains("://") {
            server.to_string()
        } else {
            format!("ws://{}/ws", server)
        };

        let mut url = Url::parse(&raw).map_err(|e| {
            TunnelError::config(format!("invalid server url {}", self.server)).with_cause(e)
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TunnelError::config(format!(
                "server url must use ws:// or wss://, got {}",
                self.server
            )));
        }

        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url)
    }

    /// Check the configuration before the first connection attempt.
    pub fn validate(&self) -> TunnelResult<()> {
        if self.token.is_empty() {
            return Err(TunnelError::config("token must not be empty"));
        }
        self.ws_url()?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }

    /// Keepalive period, if enabled.
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_interval > 0).then(|| Duration::from_secs(self.heartbeat_interval))
    }
}
