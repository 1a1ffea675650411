//! Per-connection outbound queue and its writer loop.
//!
//! A [`ConnectionHandle`] is the producer side: any number of tasks may clone
//! it and enqueue envelopes. The matching [`OutboundQueue`] is consumed by
//! exactly one [`run_writer`] loop, which is the only code that writes to the
//! underlying WebSocket. Writes on one connection are therefore totally
//! ordered.

use crate::error::TunnelError;
use crate::protocol::Envelope;
use futures_util::{Sink, SinkExt};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Default number of envelopes that may wait in a connection's queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Upper bound on how long the writer waits for the close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Unique identifier for one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to do when a connection's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Wait for capacity until the caller's deadline.
    #[default]
    Block,
    /// Fail the caller immediately.
    FailFast,
}

/// Why an envelope could not be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue is full")]
    Busy,
    #[error("timed out waiting for outbound queue capacity")]
    Timeout,
}

impl From<SendError> for TunnelError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Closed => TunnelError::connection("client offline").with_cause(err),
            SendError::Busy => TunnelError::busy("connection busy").with_cause(err),
            SendError::Timeout => TunnelError::timeout("timeout").with_cause(err),
        }
    }
}

/// Producer side of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Envelope>,
    policy: QueuePolicy,
    closed: CancellationToken,
}

/// Consumer side of a connection, drained by [`run_writer`].
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Envelope>,
    closed: CancellationToken,
}

impl OutboundQueue {
    /// Receive the next queued envelope, or `None` once the connection is
    /// closed and every handle has been dropped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

impl ConnectionHandle {
    /// Create a connection with a bounded outbound queue.
    pub fn new(capacity: usize, policy: QueuePolicy) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        let handle = Self {
            id: ConnectionId::new(),
            tx,
            policy,
            closed: closed.clone(),
        };
        (handle, OutboundQueue { rx, closed })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Whether both handles refer to the same physical connection.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        self.id == other.id
    }

    /// Enqueue an envelope for the writer.
    ///
    /// Under [`QueuePolicy::Block`] a full queue suspends the caller until
    /// `deadline`; under [`QueuePolicy::FailFast`] it fails with
    /// [`SendError::Busy`].
    pub async fn send(&self, envelope: Envelope, deadline: Instant) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }

        match self.policy {
            QueuePolicy::FailFast => match self.tx.try_send(envelope) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(SendError::Busy),
                Err(TrySendError::Closed(_)) => Err(SendError::Closed),
            },
            QueuePolicy::Block => {
                tokio::select! {
                    _ = self.closed.cancelled() => Err(SendError::Closed),
                    sent = tokio::time::timeout_at(deadline, self.tx.send(envelope)) => match sent {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(_)) => Err(SendError::Closed),
                        Err(_) => Err(SendError::Timeout),
                    },
                }
            }
        }
    }

    /// Tear the connection down. Idempotent.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!("Closing connection {}", self.id);
            self.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed from either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Number of envelopes currently waiting for the writer.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// A frame the writer asks the transport to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// One JSON-encoded envelope.
    Text(String),
    /// Keepalive ping.
    Ping,
}

/// Drain `queue` onto `sink` until the connection closes or a write fails.
///
/// `to_message` adapts a [`WireFrame`] to the transport's message type. When
/// `heartbeat` is set a ping is written every period. On exit the connection
/// is marked closed and the sink is closed, so the reader side observes the
/// teardown.
pub async fn run_writer<S, M, F>(
    mut queue: OutboundQueue,
    mut sink: S,
    heartbeat: Option<Duration>,
    to_message: F,
) -> Result<(), TunnelError>
where
    S: Sink<M> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
    F: Fn(WireFrame) -> M,
{
    let mut ticker = heartbeat
        .filter(|period| !period.is_zero())
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));

    let result = loop {
        tokio::select! {
            _ = queue.closed.cancelled() => break Ok(()),
            next = queue.rx.recv() => {
                let Some(envelope) = next else { break Ok(()) };
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping unencodable envelope {}: {}", envelope.id, e);
                        continue;
                    }
                };
                trace!("Writing {} {}", envelope.kind, envelope.id);
                if let Err(e) = sink.send(to_message(WireFrame::Text(text))).await {
                    break Err(TunnelError::connection("write failed").with_cause(e));
                }
            }
            _ = tick(&mut ticker) => {
                trace!("Writing heartbeat ping");
                if let Err(e) = sink.send(to_message(WireFrame::Ping)).await {
                    break Err(TunnelError::connection("heartbeat failed").with_cause(e));
                }
            }
        }
    };

    queue.closed.cancel();
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
    result
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
