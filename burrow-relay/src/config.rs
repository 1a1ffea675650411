//! Relay configuration.

use burrow_core::connection::{QueuePolicy, DEFAULT_QUEUE_CAPACITY};
use clap::Parser;
use std::time::Duration;

/// Burrow Relay - Expose private HTTP services through agent tunnels.
#[derive(Parser, Debug, Clone)]
#[command(name = "burrow-relay")]
#[command(author, version, about, long_about = None)]
pub struct RelayConfig {
    /// Address for agent connections (/ws) and public traffic (/<token>/...)
    #[arg(long, env = "BURROW_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Seconds to wait for an agent response before answering 504
    #[arg(long, env = "BURROW_REQUEST_TIMEOUT", default_value = "30")]
    pub request_timeout: u64,

    /// Envelopes that may wait in each connection's outbound queue
    #[arg(long, env = "BURROW_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Behaviour when a connection's queue is full: "block" waits until the
    /// request deadline, "fail-fast" answers 503 immediately
    #[arg(
        long,
        env = "BURROW_QUEUE_POLICY",
        default_value = "block",
        value_parser = parse_queue_policy
    )]
    pub queue_policy: QueuePolicy,

    /// Seconds without any frame from an agent before its connection is
    /// dropped (0 to disable); keep above the agents' heartbeat interval
    #[arg(long, env = "BURROW_IDLE_TIMEOUT", default_value = "90")]
    pub idle_timeout: u64,

    /// Largest inbound request body accepted, in bytes
    #[arg(long, env = "BURROW_MAX_BODY_BYTES", default_value = "10485760")]
    pub max_body_bytes: usize,

    /// Enable debug logging
    #[arg(long, env = "BURROW_DEBUG")]
    pub debug: bool,
}

fn parse_queue_policy(s: &str) -> Result<QueuePolicy, String> {
    match s.to_ascii_lowercase().as_str() {
        "block" => Ok(QueuePolicy::Block),
        "fail-fast" | "failfast" => Ok(QueuePolicy::FailFast),
        other => Err(format!(
            "Invalid queue policy: {} (expected block or fail-fast)",
            other
        )),
    }
}

impl RelayConfig {
    /// Deadline for one request/response exchange.
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Read deadline for agent connections, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            request_timeout: 30,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_policy: QueuePolicy::Block,
            idle_timeout: 90,
            max_body_bytes: 10 * 1024 * 1024,
            debug: false,
        }
    }
}
