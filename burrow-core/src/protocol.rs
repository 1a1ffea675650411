//! Wire protocol for relay/agent communication.
//!
//! Every WebSocket message carries exactly one JSON-encoded [`Envelope`]. The
//! WebSocket layer already frames messages, so the codec adds no framing of
//! its own.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Multi-value header map, keyed by header name.
pub type Headers = BTreeMap<String, Vec<String>>;

/// Headers that describe a single HTTP hop and must not be replayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether `name` is a hop-by-hop header (case-insensitive).
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Identifier minted by the relay for one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// HTTP request from relay to agent
    #[serde(rename = "req")]
    Request,
    /// HTTP response (or failure) from agent to relay
    #[serde(rename = "res")]
    Response,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeKind::Request => write!(f, "request"),
            EnvelopeKind::Response => write!(f, "response"),
        }
    }
}

/// The only message exchanged over a tunnel connection.
///
/// Request envelopes populate `method`, `path`, `headers` and `body`.
/// Response envelopes populate `status`, `headers` and `body`, or `error` when
/// the agent could not complete the call, in which case the rest is not
/// meaningful. Optional fields are omitted on the wire when absent, so an
/// absent `status` never decodes as `0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: Headers,
    #[serde(
        rename = "body_b64",
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "base64_bytes"
    )]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Create a request envelope.
    pub fn request(
        id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        headers: Headers,
        body: Vec<u8>,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            id: id.into(),
            method: Some(method.into()),
            path: Some(path.into()),
            headers,
            body,
            status: None,
            error: None,
        }
    }

    /// Create a successful response envelope.
    pub fn response(id: impl Into<String>, status: u16, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            kind: EnvelopeKind::Response,
            id: id.into(),
            method: None,
            path: None,
            headers,
            body,
            status: Some(status),
            error: None,
        }
    }

    /// Create a response envelope reporting that the exchange failed.
    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Response,
            id: id.into(),
            method: None,
            path: None,
            headers: Headers::new(),
            body: Vec::new(),
            status: None,
            error: Some(error.into()),
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind == EnvelopeKind::Request
    }

    pub fn is_response(&self) -> bool {
        self.kind == EnvelopeKind::Response
    }

    /// The failure text, if the agent reported one. An empty string counts as
    /// no failure.
    pub fn failure_text(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Module for base64 encoding/decoding of byte vectors in serde.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(envelope: &Envelope) -> Envelope {
        let json = envelope.to_json().unwrap();
        Envelope::from_json(json.as_bytes()).unwrap()
    }

    #[test]
    fn test_empty_body_roundtrip() {
        let msg = Envelope::request("1", "GET", "/health", Headers::new(), vec![]);
        let json = msg.to_json().unwrap();
        assert!(!json.contains("body_b64"));

        let decoded = roundtrip(&msg);
        assert!(decoded.body.is_empty());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_binary_body_roundtrip() {
        let body: Vec<u8> = (0..=255u8).collect();
        let msg = Envelope::response("2", 200, Headers::new(), body.clone());
        let decoded = roundtrip(&msg);
        assert_eq!(decoded.body, body);
        assert_eq!(decoded.status, Some(200));
    }

    #[test]
    fn test_absent_and_zero_status_are_distinct() {
        let absent = Envelope::failure("3", "boom");
        let decoded = roundtrip(&absent);
        assert_eq!(decoded.status, None);
        assert!(!absent.to_json().unwrap().contains("status"));

        let zero = Envelope::response("4", 0, Headers::new(), vec![]);
        let decoded = roundtrip(&zero);
        assert_eq!(decoded.status, Some(0));
    }

    #[test]
    fn test_wire_field_names() {
        let mut headers = Headers::new();
        headers.insert(
            "Accept".to_string(),
            vec!["text/plain".to_string(), "text/html".to_string()],
        );
        let msg = Envelope::request("42", "POST", "/submit?x=1", headers, b"hi".to_vec());
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "req");
        assert_eq!(value["id"], "42");
        assert_eq!(value["method"], "POST");
        assert_eq!(value["path"], "/submit?x=1");
        assert_eq!(value["headers"]["Accept"][1], "text/html");
        assert_eq!(value["body_b64"], "aGk=");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_decode_minimal_response() {
        let decoded = Envelope::from_json(br#"{"type":"res","id":"7","error":"refused"}"#).unwrap();
        assert!(decoded.is_response());
        assert_eq!(decoded.failure_text(), Some("refused"));
        assert!(decoded.headers.is_empty());
        assert!(decoded.body.is_empty());
        assert_eq!(decoded.status, None);
    }

    #[test]
    fn test_empty_error_is_not_a_failure() {
        let decoded =
            Envelope::from_json(br#"{"type":"res","id":"8","status":204,"error":""}"#).unwrap();
        assert_eq!(decoded.failure_text(), None);
    }

    #[test]
    fn test_rejects_invalid_body_encoding() {
        assert!(Envelope::from_json(br#"{"type":"res","id":"9","body_b64":"%%%"}"#).is_err());
        assert!(Envelope::from_json(br#"{"type":"ping","id":"9"}"#).is_err());
    }

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("connection"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Content-Length"));
    }
}
