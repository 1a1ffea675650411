//! Core types and plumbing for the burrow tunnel.
//!
//! This crate is shared by the relay and the agent: the envelope wire
//! protocol, the error taxonomy, the per-connection outbound queue with its
//! single writer loop, and the Ctrl-C signal both binaries wait on.

pub mod connection;
pub mod error;
pub mod protocol;
pub mod shutdown;

pub use connection::{
    run_writer, ConnectionHandle, ConnectionId, OutboundQueue, QueuePolicy, SendError, WireFrame,
};
pub use error::{ErrorCategory, TunnelError, TunnelResult};
pub use protocol::{Envelope, EnvelopeKind, Headers, RequestId};
