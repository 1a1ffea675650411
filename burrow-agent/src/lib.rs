//! Burrow agent.
//!
//! Holds one WebSocket connection to a relay and serves the requests it
//! receives from a local HTTP target.

pub mod config;
pub mod forward;
pub mod tunnel;

pub use config::AgentConfig;
pub use forward::{ForwardError, Forwarder, LocalTarget};
pub use tunnel::{SessionState, Supervisor};
