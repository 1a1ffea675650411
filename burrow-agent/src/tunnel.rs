//! Relay session management with automatic reconnection.

use crate::config::AgentConfig;
use crate::forward::{Forwarder, LocalTarget};
use burrow_core::{
    run_writer, ConnectionHandle, Envelope, QueuePolicy, TunnelError, TunnelResult, WireFrame,
};
use futures_util::{Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, protocol::Message as TungsteniteMessage},
};
use tracing::{debug, error, info, warn};

/// Where the agent is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
        }
    }
}

/// Keeps exactly one relay session alive, reconnecting after every drop.
pub struct Supervisor {
    config: AgentConfig,
    forwarder: Forwarder,
    limit: Option<Arc<Semaphore>>,
    state: watch::Sender<SessionState>,
}

impl Supervisor {
    pub fn new(config: AgentConfig) -> TunnelResult<Self> {
        config.validate()?;
        let target = LocalTarget::parse(&config.target).map_err(|e| {
            TunnelError::config(format!("invalid target {}", config.target)).with_cause(e)
        })?;
        let forwarder = Forwarder::new(target, config.request_timeout());
        let limit = (config.max_concurrent > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent)));
        let (state, _) = watch::channel(SessionState::Disconnected);

        Ok(Self {
            config,
            forwarder,
            limit,
            state,
        })
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Run sessions forever. Only returns if the surrounding task is dropped.
    pub async fn run(&self) {
        let mut attempts = 0u64;

        loop {
            attempts += 1;
            self.state.send_replace(SessionState::Connecting);

            match self.run_session().await {
                Ok(()) => {
                    info!("Tunnel closed");
                    attempts = 0;
                }
                Err(e) if e.is_retryable() => warn!("Tunnel error: {}", e),
                Err(e) => error!("Tunnel error: {}", e),
            }
            self.state.send_replace(SessionState::Disconnected);

            info!(
                "Reconnecting in {:?}... (attempt {})",
                self.config.reconnect_delay(),
                attempts + 1
            );
            tokio::time::sleep(self.config.reconnect_delay()).await;
        }
    }

    /// One connection: dial, serve requests until it drops, tear down.
    async fn run_session(&self) -> TunnelResult<()> {
        let url = self.config.ws_url()?;
        info!("Connecting to {}", url);

        let timeout = self.config.connect_timeout();
        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                TunnelError::timeout(format!("relay handshake timed out after {:?}", timeout))
            })?
            .map_err(|e| TunnelError::connection("failed to connect to relay").with_cause(e))?;
        let (ws_tx, ws_rx) = ws_stream.split();

        let (handle, queue) = ConnectionHandle::new(self.config.queue_capacity, QueuePolicy::Block);
        self.state.send_replace(SessionState::Connected);
        info!(
            "Connected; serving /{}/ from {}",
            self.config.token,
            self.forwarder.target().addr()
        );

        let writer = tokio::spawn(run_writer(
            queue,
            ws_tx,
            self.config.heartbeat(),
            to_tungstenite_message,
        ));

        dispatch_requests(
            ws_rx,
            &handle,
            &self.forwarder,
            self.limit.clone(),
            self.config.request_timeout(),
        )
        .await;

        // Late local results are discarded: their sends fail on the closed handle.
        handle.close();
        match writer.await {
            Ok(result) => result,
            Err(e) => Err(TunnelError::internal("writer task panicked").with_cause(e)),
        }
    }
}

fn to_tungstenite_message(frame: WireFrame) -> TungsteniteMessage {
    match frame {
        WireFrame::Text(text) => TungsteniteMessage::Text(text),
        WireFrame::Ping => TungsteniteMessage::Ping(Vec::new()),
    }
}

/// Read request envelopes and execute each one on its own task.
///
/// Responses are enqueued on `handle` in completion order. Returns when the
/// relay closes the stream or the connection is closed locally.
pub(crate) async fn dispatch_requests<S>(
    mut ws_rx: S,
    handle: &ConnectionHandle,
    forwarder: &Forwarder,
    limit: Option<Arc<Semaphore>>,
    request_timeout: Duration,
) where
    S: Stream<Item = Result<TungsteniteMessage, tungstenite::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = handle.closed() => {
                debug!("Connection {} closed locally", handle.id());
                break;
            }
            next = ws_rx.next() => next,
        };

        let data = match next {
            Some(Ok(TungsteniteMessage::Text(text))) => text.into_bytes(),
            Some(Ok(TungsteniteMessage::Binary(data))) => data,
            Some(Ok(TungsteniteMessage::Close(_))) => {
                info!("Relay closed the connection");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("WebSocket error: {}", e);
                break;
            }
            None => break,
        };

        let request = match Envelope::from_json(&data) {
            Ok(envelope) if envelope.is_request() => envelope,
            Ok(envelope) => {
                warn!("Unexpected {} envelope {}", envelope.kind, envelope.id);
                continue;
            }
            Err(e) => {
                warn!("Invalid envelope from relay: {}", e);
                continue;
            }
        };

        debug!(
            "Request {}: {} {}",
            request.id,
            request.method.as_deref().unwrap_or("GET"),
            request.path.as_deref().unwrap_or("/")
        );

        let handle = handle.clone();
        let forwarder = forwarder.clone();
        let limit = limit.clone();
        tokio::spawn(async move {
            let _permit = match limit {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            let response = forwarder.execute(&request).await;
            let deadline = Instant::now() + request_timeout;
            if let Err(e) = handle.send(response, deadline).await {
                warn!("Dropping response {}: {}", request.id, e);
            }
        });
    }
}
