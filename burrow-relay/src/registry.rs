//! Token → connection routing table.

use burrow_core::ConnectionHandle;
use dashmap::DashMap;
use tracing::{debug, info};

/// Registry of live agent connections, keyed by routing token.
///
/// At most one connection is registered per token; registering again
/// replaces the previous entry.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` under `token`, returning the connection it replaced.
    pub fn register(&self, token: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        info!("Registering connection {} for token {}", handle.id(), token);
        self.connections.insert(token.to_string(), handle)
    }

    /// Get the live connection for `token`.
    pub fn lookup(&self, token: &str) -> Option<ConnectionHandle> {
        self.connections.get(token).map(|r| r.clone())
    }

    /// Remove `token` only if it still maps to `handle`.
    ///
    /// A connection that was replaced must not evict its successor when it
    /// tears down.
    pub fn unregister(&self, token: &str, handle: &ConnectionHandle) -> bool {
        let removed = self
            .connections
            .remove_if(token, |_, current| current.same_connection(handle))
            .is_some();
        if removed {
            info!("Unregistered connection {} for token {}", handle.id(), token);
        } else {
            debug!(
                "Connection {} for token {} was already replaced",
                handle.id(),
                token
            );
        }
        removed
    }

    /// Number of registered tokens.
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}
