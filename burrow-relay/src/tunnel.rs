//! Agent connections: WebSocket upgrade, registration and demultiplexing.

use crate::correlation::CorrelationTable;
use crate::RelayState;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use burrow_core::{run_writer, ConnectionHandle, Envelope, WireFrame};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tracing::{debug, error, info, warn};

/// Query parameters of `GET /ws`.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub token: String,
}

pub async fn websocket_handler(
    State(state): State<Arc<RelayState>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if params.token.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing token").into_response();
    }

    let token = params.token;
    ws.on_upgrade(move |socket| handle_agent_connection(socket, token, state))
}

async fn handle_agent_connection(socket: WebSocket, token: String, state: Arc<RelayState>) {
    let (ws_tx, ws_rx) = socket.split();
    let (handle, queue) =
        ConnectionHandle::new(state.config.queue_capacity, state.config.queue_policy);

    if let Some(previous) = state.registry.register(&token, handle.clone()) {
        info!(
            "Token {} reconnected; closing previous connection {}",
            token,
            previous.id()
        );
        previous.close();
    }
    info!(
        "Agent connected: token={} connection={} ({} online)",
        token,
        handle.id(),
        state.registry.count()
    );

    let writer = tokio::spawn(run_writer(queue, ws_tx, None, to_ws_message));

    demultiplex(ws_rx, &handle, &state.pending, state.config.idle_timeout()).await;

    // In-flight exchanges on this connection are left to their own deadlines.
    handle.close();
    state.registry.unregister(&token, &handle);

    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Writer for connection {} failed: {}", handle.id(), e),
        Err(e) => error!("Writer task for connection {} panicked: {}", handle.id(), e),
    }
    info!("Agent disconnected: token={} connection={}", token, handle.id());
}

fn to_ws_message(frame: WireFrame) -> WsMessage {
    match frame {
        WireFrame::Text(text) => WsMessage::Text(text),
        WireFrame::Ping => WsMessage::Ping(Vec::new()),
    }
}

/// Read envelopes from one connection and route responses to their waiters.
///
/// Returns when the peer closes, the stream fails, the connection is closed
/// locally (write failure or replacement), or no frame at all arrives within
/// `idle`.
pub(crate) async fn demultiplex<S>(
    mut ws_rx: S,
    handle: &ConnectionHandle,
    pending: &CorrelationTable,
    idle: Option<Duration>,
) where
    S: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = handle.closed() => {
                debug!("Connection {} closed locally", handle.id());
                break;
            }
            next = next_frame(&mut ws_rx, idle) => match next {
                Ok(next) => next,
                Err(_) => {
                    warn!(
                        "Connection {} silent for {:?}; dropping it",
                        handle.id(),
                        idle.unwrap_or_default()
                    );
                    break;
                }
            },
        };

        let data = match next {
            Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
            Some(Ok(WsMessage::Binary(data))) => data,
            Some(Ok(WsMessage::Close(_))) => {
                info!("Connection {} closed by agent", handle.id());
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("WebSocket error on connection {}: {}", handle.id(), e);
                break;
            }
            None => break,
        };

        match Envelope::from_json(&data) {
            Ok(envelope) if envelope.is_response() => {
                let id = envelope.id.clone();
                if pending.deliver(handle.id(), envelope) {
                    debug!("Delivered response {}", id);
                } else {
                    debug!("Dropping response {} with no pending exchange", id);
                }
            }
            Ok(envelope) => {
                warn!(
                    "Unexpected {} envelope {} from connection {}",
                    envelope.kind,
                    envelope.id,
                    handle.id()
                );
            }
            Err(e) => {
                warn!("Invalid envelope from connection {}: {}", handle.id(), e);
            }
        }
    }
}

/// Next frame, bounded by the idle deadline. Every frame (pings included)
/// restarts the clock.
async fn next_frame<S>(
    ws_rx: &mut S,
    idle: Option<Duration>,
) -> Result<Option<S::Item>, Elapsed>
where
    S: Stream + Unpin,
{
    match idle {
        Some(limit) => tokio::time::timeout(limit, ws_rx.next()).await,
        None => Ok(ws_rx.next().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::{Headers, QueuePolicy};
    use futures_util::stream;
    use tokio::time::Instant;

    fn text(envelope: &Envelope) -> Result<WsMessage, axum::Error> {
        Ok(WsMessage::Text(envelope.to_json().unwrap()))
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_demultiplex_routes_responses() {
        let (handle, _queue) = ConnectionHandle::new(4, QueuePolicy::Block);
        let table = CorrelationTable::new();
        let a = table.register("a", handle.id());
        let b = table.register("b", handle.id());

        let frames = vec![
            text(&Envelope::response("b", 201, Headers::new(), b"bee".to_vec())),
            Ok(WsMessage::Text("not json".to_string())),
            text(&Envelope::response("unknown", 200, Headers::new(), vec![])),
            Ok(WsMessage::Ping(vec![1])),
            Ok(WsMessage::Binary(
                Envelope::response("a", 200, Headers::new(), b"ay".to_vec())
                    .to_json()
                    .unwrap()
                    .into_bytes(),
            )),
        ];
        demultiplex(stream::iter(frames), &handle, &table, None).await;

        let got_b = b.wait_until(soon()).await.unwrap();
        assert_eq!(got_b.status, Some(201));
        assert_eq!(got_b.body, b"bee");
        assert_eq!(a.wait_until(soon()).await.unwrap().body, b"ay");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_demultiplex_ignores_requests() {
        let (handle, _queue) = ConnectionHandle::new(4, QueuePolicy::Block);
        let table = CorrelationTable::new();
        let _a = table.register("a", handle.id());

        let frames = vec![text(&Envelope::request("a", "GET", "/", Headers::new(), vec![]))];
        demultiplex(stream::iter(frames), &handle, &table, None).await;
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_demultiplex_stops_on_close_frame() {
        let (handle, _queue) = ConnectionHandle::new(4, QueuePolicy::Block);
        let table = CorrelationTable::new();
        let a = table.register("a", handle.id());

        let frames = vec![
            Ok(WsMessage::Close(None)),
            text(&Envelope::response("a", 200, Headers::new(), vec![])),
        ];
        demultiplex(stream::iter(frames), &handle, &table, None).await;
        assert_eq!(table.len(), 1);
        drop(a);
    }

    #[tokio::test]
    async fn test_demultiplex_stops_when_closed_locally() {
        let (handle, _queue) = ConnectionHandle::new(4, QueuePolicy::Block);
        let table = CorrelationTable::new();

        let closer = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });

        let never = stream::pending::<Result<WsMessage, axum::Error>>();
        tokio::time::timeout(
            Duration::from_secs(5),
            demultiplex(never, &handle, &table, None),
        )
        .await
        .unwrap();
    }

    #[test]
    fn test_to_ws_message() {
        assert!(matches!(
            to_ws_message(WireFrame::Text("{}".to_string())),
            WsMessage::Text(t) if t == "{}"
        ));
        assert!(matches!(to_ws_message(WireFrame::Ping), WsMessage::Ping(p) if p.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_is_dropped_after_idle_timeout() {
        let (handle, _queue) = ConnectionHandle::new(4, QueuePolicy::Block);
        let table = CorrelationTable::new();

        let start = Instant::now();
        let silent = stream::pending::<Result<WsMessage, axum::Error>>();
        demultiplex(silent, &handle, &table, Some(Duration::from_secs(90))).await;
        assert_eq!(start.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_connection_alive() {
        let (handle, _queue) = ConnectionHandle::new(4, QueuePolicy::Block);
        let table = CorrelationTable::new();

        // Three pings 60s apart, then silence.
        let pings = Box::pin(stream::unfold(0u32, |sent| async move {
            if sent == 3 {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
            Some((Ok::<_, axum::Error>(WsMessage::Ping(Vec::new())), sent + 1))
        }));

        let start = Instant::now();
        demultiplex(pings, &handle, &table, Some(Duration::from_secs(90))).await;
        assert_eq!(start.elapsed(), Duration::from_secs(180 + 90));
    }
}
