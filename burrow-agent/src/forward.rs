//! Execution of request envelopes against the local target.
//!
//! Each call opens a fresh HTTP/1.1 connection with hyper, bounded by the
//! configured timeout. Failures never escape as errors: they become a
//! response envelope carrying an `error` string.

use burrow_core::{protocol::is_hop_by_hop, Envelope, Headers};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{header, Method, Request};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};
use url::Url;

/// Why a local call could not be completed.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid target url {0}")]
    InvalidTarget(String),
    #[error("unsupported target scheme {0} (only http is supported)")]
    UnsupportedScheme(String),
    #[error("invalid request method {0:?}")]
    InvalidMethod(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("local request failed: {0}")]
    Http(#[from] hyper::Error),
    #[error("local request timed out after {0:?}")]
    Timeout(Duration),
}

/// Where proxied requests are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    /// `host:port` to dial.
    addr: String,
    /// Value of the `Host` header.
    host: String,
    /// Path prefix prepended to every forwarded path, without trailing `/`.
    base_path: String,
}

impl LocalTarget {
    /// Parse a base URL such as `http://127.0.0.1:3000` or
    /// `http://intranet/app`.
    pub fn parse(target: &str) -> Result<Self, ForwardError> {
        let url = Url::parse(target).map_err(|_| ForwardError::InvalidTarget(target.to_string()))?;
        if url.scheme() != "http" {
            return Err(ForwardError::UnsupportedScheme(url.scheme().to_string()));
        }

        let host_name = url
            .host_str()
            .ok_or_else(|| ForwardError::InvalidTarget(target.to_string()))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let host = match url.port() {
            Some(port) => format!("{}:{}", host_name, port),
            None => host_name.to_string(),
        };

        Ok(Self {
            addr: format!("{}:{}", host_name, port),
            host,
            base_path: url.path().trim_end_matches('/').to_string(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Join the forwarded path (with any query) onto the base path.
    fn uri_for(&self, path: &str) -> String {
        if path.is_empty() {
            format!("{}/", self.base_path)
        } else if path.starts_with('/') {
            format!("{}{}", self.base_path, path)
        } else {
            format!("{}/{}", self.base_path, path)
        }
    }
}

/// Executes request envelopes against one [`LocalTarget`].
#[derive(Debug, Clone)]
pub struct Forwarder {
    target: LocalTarget,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(target: LocalTarget, timeout: Duration) -> Self {
        Self { target, timeout }
    }

    pub fn target(&self) -> &LocalTarget {
        &self.target
    }

    /// Run `request` and describe the outcome as a response envelope.
    pub async fn execute(&self, request: &Envelope) -> Envelope {
        match tokio::time::timeout(self.timeout, self.forward(request)).await {
            Ok(Ok((status, headers, body))) => {
                debug!("Request {} completed with {}", request.id, status);
                Envelope::response(&request.id, status, headers, body)
            }
            Ok(Err(e)) => {
                warn!("Request {} failed: {}", request.id, e);
                Envelope::failure(&request.id, e.to_string())
            }
            Err(_) => {
                let e = ForwardError::Timeout(self.timeout);
                warn!("Request {} failed: {}", request.id, e);
                Envelope::failure(&request.id, e.to_string())
            }
        }
    }

    async fn forward(&self, request: &Envelope) -> Result<(u16, Headers, Vec<u8>), ForwardError> {
        let req = self.build_request(request)?;

        debug!(
            "Forwarding {} {} to {}",
            req.method(),
            req.uri(),
            self.target.addr
        );

        let stream = TcpStream::connect(&self.target.addr)
            .await
            .map_err(|source| ForwardError::Connect {
                addr: self.target.addr.clone(),
                source,
            })?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Dropping the sender (e.g. on timeout) shuts the connection down.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("HTTP/1.1 connection error: {}", e);
            }
        });

        let response = sender.send_request(req).await?;
        convert_response(response).await
    }

    fn build_request(&self, request: &Envelope) -> Result<Request<Full<Bytes>>, ForwardError> {
        let method_name = request.method.as_deref().unwrap_or("GET");
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| ForwardError::InvalidMethod(method_name.to_string()))?;

        let uri = self.target.uri_for(request.path.as_deref().unwrap_or("/"));
        let mut builder = Request::builder().method(method).uri(uri);

        for (name, values) in &request.headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
                continue;
            }
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        builder = builder.header(header::HOST, self.target.host.as_str());

        builder
            .body(Full::new(Bytes::from(request.body.clone())))
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))
    }
}

async fn convert_response(
    response: hyper::Response<Incoming>,
) -> Result<(u16, Headers, Vec<u8>), ForwardError> {
    let status = response.status().as_u16();

    let mut headers = Headers::new();
    for (name, value) in response.headers() {
        match value.to_str() {
            Ok(value) => headers
                .entry(name.to_string())
                .or_default()
                .push(value.to_string()),
            Err(_) => debug!("Skipping non-UTF-8 response header {}", name),
        }
    }

    let body = response.collect().await?.to_bytes().to_vec();
    Ok((status, headers, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Bytes as AxumBytes,
        http::{HeaderMap, HeaderValue, Method as AxumMethod, Uri},
        routing::{any, get},
        Router,
    };
    use std::net::SocketAddr;

    async fn echo(method: AxumMethod, uri: Uri, headers: HeaderMap, body: AxumBytes) -> String {
        let host = headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let trace = headers
            .get_all("x-trace")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{} {} host={} trace={} body={}",
            method,
            uri,
            host,
            trace,
            String::from_utf8_lossy(&body)
        )
    }

    async fn start_target() -> SocketAddr {
        let app = Router::new()
            .route("/app/echo", any(echo))
            .route("/echo", any(echo))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    "late"
                }),
            )
            .route(
                "/raw-header",
                get(|| async {
                    let mut headers = HeaderMap::new();
                    headers.insert("x-raw", HeaderValue::from_bytes(b"caf\xe9").unwrap());
                    headers.insert("x-kept", HeaderValue::from_static("yes"));
                    (headers, "body")
                }),
            )
            .route(
                "/teapot",
                get(|| async { (axum::http::StatusCode::IM_A_TEAPOT, [("x-kind", "tea")], "short") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn forwarder(base: &str, timeout: Duration) -> Forwarder {
        Forwarder::new(LocalTarget::parse(base).unwrap(), timeout)
    }

    #[test]
    fn test_parse_target() {
        let target = LocalTarget::parse("http://127.0.0.1:3000").unwrap();
        assert_eq!(target.addr(), "127.0.0.1:3000");
        assert_eq!(target.host, "127.0.0.1:3000");
        assert_eq!(target.uri_for("/health?x=1"), "/health?x=1");

        let prefixed = LocalTarget::parse("http://intranet/app/").unwrap();
        assert_eq!(prefixed.addr(), "intranet:80");
        assert_eq!(prefixed.host, "intranet");
        assert_eq!(prefixed.uri_for("/x"), "/app/x");
        assert_eq!(prefixed.uri_for(""), "/app/");

        assert!(matches!(
            LocalTarget::parse("https://127.0.0.1"),
            Err(ForwardError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            LocalTarget::parse("not a url"),
            Err(ForwardError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_success() {
        let addr = start_target().await;
        let forwarder = forwarder(&format!("http://{}", addr), Duration::from_secs(5));

        let mut headers = Headers::new();
        headers.insert("host".to_string(), vec!["relay.example.com".to_string()]);
        headers.insert(
            "x-trace".to_string(),
            vec!["one".to_string(), "two".to_string()],
        );
        headers.insert("connection".to_string(), vec!["close".to_string()]);
        let request = Envelope::request("r1", "POST", "/echo?q=1", headers, b"hello".to_vec());

        let response = forwarder.execute(&request).await;
        assert_eq!(response.id, "r1");
        assert!(response.is_response());
        assert_eq!(response.failure_text(), None);
        assert_eq!(response.status, Some(200));
        assert_eq!(
            String::from_utf8(response.body).unwrap(),
            format!("POST /echo?q=1 host={} trace=one,two body=hello", addr)
        );
    }

    #[tokio::test]
    async fn test_execute_with_base_path() {
        let addr = start_target().await;
        let forwarder = forwarder(&format!("http://{}/app", addr), Duration::from_secs(5));

        let request = Envelope::request("r2", "GET", "/echo", Headers::new(), vec![]);
        let response = forwarder.execute(&request).await;
        assert_eq!(response.status, Some(200));
        assert!(String::from_utf8(response.body)
            .unwrap()
            .starts_with("GET /app/echo"));
    }

    #[tokio::test]
    async fn test_execute_copies_status_and_headers() {
        let addr = start_target().await;
        let forwarder = forwarder(&format!("http://{}", addr), Duration::from_secs(5));

        let request = Envelope::request("r3", "GET", "/teapot", Headers::new(), vec![]);
        let response = forwarder.execute(&request).await;
        assert_eq!(response.status, Some(418));
        assert_eq!(response.headers["x-kind"], vec!["tea"]);
        assert_eq!(response.body, b"short");
    }

    #[tokio::test]
    async fn test_non_utf8_response_header_is_skipped() {
        let addr = start_target().await;
        let forwarder = forwarder(&format!("http://{}", addr), Duration::from_secs(5));

        let request = Envelope::request("r7", "GET", "/raw-header", Headers::new(), vec![]);
        let response = forwarder.execute(&request).await;
        assert_eq!(response.status, Some(200));
        assert!(!response.headers.contains_key("x-raw"));
        assert_eq!(response.headers["x-kept"], vec!["yes"]);
        assert_eq!(response.body, b"body");
    }

    #[tokio::test]
    async fn test_connection_refused_becomes_error() {
        // Bind and drop to find a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = forwarder(&format!("http://{}", addr), Duration::from_secs(5));
        let request = Envelope::request("r4", "GET", "/", Headers::new(), vec![]);
        let response = forwarder.execute(&request).await;

        assert_eq!(response.id, "r4");
        assert!(response.failure_text().unwrap().contains("failed to connect"));
        assert_eq!(response.status, None);
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_becomes_error() {
        let addr = start_target().await;
        let forwarder = forwarder(&format!("http://{}", addr), Duration::from_millis(200));

        let request = Envelope::request("r5", "GET", "/slow", Headers::new(), vec![]);
        let response = forwarder.execute(&request).await;
        assert!(response.failure_text().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_invalid_method_becomes_error() {
        let forwarder = forwarder("http://127.0.0.1:1", Duration::from_secs(1));
        let request = Envelope::request("r6", "BAD METHOD", "/", Headers::new(), vec![]);
        let response = forwarder.execute(&request).await;
        assert!(response
            .failure_text()
            .unwrap()
            .contains("invalid request method"));
    }
}
