//! HTTP reverse proxy for tunneled traffic.
//!
//! `ANY /<token>/<path...>` is turned into a request envelope, shipped to the
//! agent registered under `<token>`, and the agent's response is replayed to
//! the caller.

use crate::RelayState;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request, Response, StatusCode, Uri},
};
use burrow_core::{
    protocol::is_hop_by_hop, Envelope, ErrorCategory, Headers, RequestId, TunnelError,
    TunnelResult,
};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

pub async fn proxy_handler(
    State(state): State<Arc<RelayState>>,
    request: Request<Body>,
) -> Response<Body> {
    match dispatch(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            match e.category {
                ErrorCategory::Protocol | ErrorCategory::Connection => debug!("{}", e),
                _ => warn!("{}", e),
            }
            let status =
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::BAD_GATEWAY);
            error_response(status, &e.message)
        }
    }
}

/// Run one exchange for an inbound request.
pub async fn dispatch(state: &RelayState, request: Request<Body>) -> TunnelResult<Response<Body>> {
    let (token, path) =
        split_token_path(request.uri()).ok_or_else(|| TunnelError::protocol("bad path"))?;

    let connection = state
        .registry
        .lookup(&token)
        .ok_or_else(|| TunnelError::connection("client offline").with_context("token", &token))?;

    let id = RequestId::new().to_string();
    let envelope = convert_request(request, &id, path, state.config.max_body_bytes).await?;

    debug!(
        "Proxying {} {} to token {} (request {})",
        envelope.method.as_deref().unwrap_or_default(),
        envelope.path.as_deref().unwrap_or_default(),
        token,
        id
    );

    let deadline = Instant::now() + state.config.exchange_timeout();
    let pending = state.pending.register(id.clone(), connection.id());

    connection
        .send(envelope, deadline)
        .await
        .map_err(|e| TunnelError::from(e).with_context("request_id", &id))?;

    let response = pending.wait_until(deadline).await?;
    build_response(response)
}

/// Split `/<token>/<rest>` into the token and the forwarded path, keeping the
/// query string. A bare `/<token>` forwards `/`.
fn split_token_path(uri: &Uri) -> Option<(String, String)> {
    let trimmed = uri.path().strip_prefix('/')?;
    let (token, rest) = match trimmed.find('/') {
        Some(i) => (&trimmed[..i], &trimmed[i..]),
        None => (trimmed, "/"),
    };

    if token.is_empty() {
        return None;
    }

    let mut path = rest.to_string();
    if let Some(query) = uri.query() {
        path.push('?');
        path.push_str(query);
    }
    Some((token.to_string(), path))
}

async fn convert_request(
    request: Request<Body>,
    id: &str,
    path: String,
    max_body_bytes: usize,
) -> TunnelResult<Envelope> {
    let method = request.method().to_string();

    let mut headers = Headers::new();
    for (name, value) in request.headers() {
        match value.to_str() {
            Ok(value) => headers
                .entry(name.to_string())
                .or_default()
                .push(value.to_string()),
            Err(_) => debug!("Request {}: skipping non-UTF-8 header {}", id, name),
        }
    }

    let body = axum::body::to_bytes(request.into_body(), max_body_bytes)
        .await
        .map_err(|e| TunnelError::protocol("failed to read request body").with_cause(e))?;

    Ok(Envelope::request(id, method, path, headers, body.to_vec()))
}

fn build_response(envelope: Envelope) -> TunnelResult<Response<Body>> {
    if let Some(error) = envelope.failure_text() {
        return Err(TunnelError::upstream(error).with_context("request_id", &envelope.id));
    }

    let status = match envelope.status {
        None => StatusCode::OK,
        Some(code) => StatusCode::from_u16(code).map_err(|e| {
            TunnelError::upstream(format!("invalid status {} from agent", code)).with_cause(e)
        })?,
    };

    let mut response = Response::new(Body::from(envelope.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, values) in envelope.headers {
        if is_hop_by_hop(&name) {
            continue;
        }
        let Ok(header_name) = HeaderName::try_from(name.as_str()) else {
            debug!("Response {}: skipping invalid header name {:?}", envelope.id, name);
            continue;
        };
        for value in values {
            match HeaderValue::try_from(value.as_str()) {
                Ok(header_value) => {
                    headers.append(header_name.clone(), header_value);
                }
                Err(_) => debug!(
                    "Response {}: skipping invalid value for header {}",
                    envelope.id, name
                ),
            }
        }
    }

    Ok(response)
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| {
            let mut fallback = Response::new(Body::from("Internal error"));
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}
