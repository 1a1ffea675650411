//! Pending-exchange correlation table.
//!
//! Every request the relay ships to an agent registers a single-slot waiter
//! keyed by the envelope id. The demultiplexer delivers responses into the
//! table; the dispatcher waits on its slot until a deadline.

use burrow_core::{ConnectionId, Envelope, TunnelError, TunnelResult};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

struct Slot {
    /// Connection the request was sent on; only it may answer.
    connection: ConnectionId,
    tx: oneshot::Sender<Envelope>,
}

/// Process-wide map of in-flight exchanges.
///
/// `deliver` and `cancel` both begin by removing the id from the map, so
/// exactly one of them takes effect for a given exchange.
#[derive(Clone, Default)]
pub struct CorrelationTable {
    slots: Arc<DashMap<String, Slot>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`, expecting the answer on `connection`.
    pub fn register(&self, id: impl Into<String>, connection: ConnectionId) -> PendingExchange {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id.clone(), Slot { connection, tx });
        PendingExchange {
            id,
            rx,
            table: self.clone(),
        }
    }

    /// Route `response` to its waiter.
    ///
    /// Returns `false` (and drops the response) when no waiter exists for its
    /// id, or when the waiter belongs to a different connection.
    pub fn deliver(&self, connection: ConnectionId, response: Envelope) -> bool {
        match self
            .slots
            .remove_if(&response.id, |_, slot| slot.connection == connection)
        {
            Some((_, slot)) => slot.tx.send(response).is_ok(),
            None => {
                trace!("No pending exchange for {}", response.id);
                false
            }
        }
    }

    /// Remove the waiter for `id`. Returns `false` if it was already gone.
    pub fn cancel(&self, id: &str) -> bool {
        self.slots.remove(id).is_some()
    }

    /// Number of exchanges waiting for a response.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A registered waiter. Dropping it cancels the exchange.
pub struct PendingExchange {
    id: String,
    rx: oneshot::Receiver<Envelope>,
    table: CorrelationTable,
}

impl PendingExchange {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response until `deadline`.
    pub async fn wait_until(mut self, deadline: Instant) -> TunnelResult<Envelope> {
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TunnelError::internal("exchange was cancelled")
                .with_context("request_id", self.id.clone())),
            Err(_) => Err(TunnelError::timeout("timeout").with_context("request_id", self.id.clone())),
        }
    }
}

impl Drop for PendingExchange {
    fn drop(&mut self) {
        self.table.cancel(&self.id);
    }
}
