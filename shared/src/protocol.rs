//! Wire protocol for RTunnel communication.
//!
//! Every message crosses the tunnel as one JSON text frame tagged by `type`.
//! Responses are matched to requests by the `correlation_id` field only.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{RelayError, Result};

/// Maximum frame size accepted on the tunnel (16 MB, base64 overhead included)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Identifier tying a ForwardEvent to its ForwardResponse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque identity of one end of a tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One or many values for a single header name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            HeaderValues::One(v) => std::slice::from_ref(v),
            HeaderValues::Many(vs) => vs,
        };
        values.iter().map(String::as_str)
    }

    pub fn push(&mut self, value: String) {
        match self {
            HeaderValues::One(first) => {
                let first = std::mem::take(first);
                *self = HeaderValues::Many(vec![first, value]);
            }
            HeaderValues::Many(vs) => vs.push(value),
        }
    }
}

/// Header multimap, keyed by lower-case header name.
pub type Headers = BTreeMap<String, HeaderValues>;

/// Add a value under `name`, keeping any values already present.
pub fn append_header(headers: &mut Headers, name: &str, value: String) {
    let name = name.to_ascii_lowercase();
    match headers.get_mut(&name) {
        Some(existing) => existing.push(value),
        None => {
            headers.insert(name, HeaderValues::One(value));
        }
    }
}

/// Normalize a body so that empty is always represented as absent.
pub fn non_empty(body: impl Into<Vec<u8>>) -> Option<Vec<u8>> {
    let body = body.into();
    if body.is_empty() {
        None
    } else {
        Some(body)
    }
}

/// HTTP request as captured by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    pub method: String,
    /// Path and query exactly as received by the relay
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "body_base64", skip_serializing_if = "body_base64::is_absent")]
    pub body: Option<Vec<u8>>,
}

/// HTTP response as produced by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "body_base64", skip_serializing_if = "body_base64::is_absent")]
    pub body: Option<Vec<u8>>,
}

impl ResponseData {
    /// Response for a relay failure. Status text and body are both the
    /// generic reason phrase; the error detail stays in the logs.
    pub fn synthesized(err: &RelayError) -> Self {
        let mut headers = Headers::new();
        append_header(&mut headers, "content-type", "text/plain; charset=utf-8".into());
        Self {
            status: err.status().as_u16(),
            status_text: err.status_text().to_string(),
            headers,
            body: non_empty(err.status_text().as_bytes().to_vec()),
        }
    }
}

/// One outstanding request crossing the tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardEvent {
    pub correlation_id: CorrelationId,
    pub request: RequestData,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<String>,
}

impl ForwardEvent {
    pub fn new(request: RequestData) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            request,
            created_at: Utc::now(),
            trace_context: None,
        }
    }
}

/// Reply to a ForwardEvent, tagged with the same correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub correlation_id: CorrelationId,
    pub response: ResponseData,
}

impl ForwardResponse {
    pub fn failed(correlation_id: CorrelationId, err: &RelayError) -> Self {
        Self {
            correlation_id,
            response: ResponseData::synthesized(err),
        }
    }
}

/// Messages exchanged over the tunnel connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelMessage {
    /// Relay → client: announce yourself
    InitRequest,
    /// Client → relay: completes registration
    InitResponse { channel_id: ChannelId },
    /// Relay → client: one relayed HTTP request
    ForwardRequest(ForwardEvent),
    /// Client → relay: matching reply
    ForwardResponse(ForwardResponse),
    /// Either side: connection teardown
    Disconnect { reason: String },
}

impl TunnelMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(RelayError::Protocol(format!(
                "frame of {} bytes exceeds limit",
                frame.len()
            )));
        }
        Ok(serde_json::from_slice(frame)?)
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelMessage::InitRequest => "init_request",
            TunnelMessage::InitResponse { .. } => "init_response",
            TunnelMessage::ForwardRequest(_) => "forward_request",
            TunnelMessage::ForwardResponse(_) => "forward_response",
            TunnelMessage::Disconnect { .. } => "disconnect",
        }
    }
}

/// Bodies travel as base64 strings and are omitted when empty.
mod body_base64 {
    use super::STANDARD;
    use base64::Engine as _;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn is_absent(body: &Option<Vec<u8>>) -> bool {
        body.as_ref().map_or(true, |b| b.is_empty())
    }

    pub fn serialize<S: Serializer>(body: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match body {
            Some(bytes) if !bytes.is_empty() => s.serialize_some(&STANDARD.encode(bytes)),
            _ => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(encoded) if !encoded.is_empty() => {
                STANDARD.decode(encoded).map(Some).map_err(D::Error::custom)
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(body: Option<Vec<u8>>) -> RequestData {
        let mut headers = Headers::new();
        append_header(&mut headers, "Accept", "text/html".into());
        append_header(&mut headers, "X-Tag", "a".into());
        append_header(&mut headers, "x-tag", "b".into());
        RequestData {
            method: "POST".into(),
            url: "/api/items?limit=5".into(),
            headers,
            body,
        }
    }

    #[test]
    fn test_binary_body_survives_transport() {
        let bytes: Vec<u8> = (0..=255u8).chain([0, 0, 255]).collect();
        let resp = ForwardResponse {
            correlation_id: CorrelationId::new(),
            response: ResponseData {
                status: 200,
                status_text: "OK".into(),
                headers: Headers::new(),
                body: Some(bytes.clone()),
            },
        };
        let wire = TunnelMessage::ForwardResponse(resp.clone()).encode().unwrap();
        match TunnelMessage::decode(wire.as_bytes()).unwrap() {
            TunnelMessage::ForwardResponse(decoded) => {
                assert_eq!(decoded.correlation_id, resp.correlation_id);
                assert_eq!(decoded.response.body, Some(bytes));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_empty_body_is_absent() {
        let ev = ForwardEvent::new(sample_request(Some(Vec::new())));
        let wire = TunnelMessage::ForwardRequest(ev).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert!(value["request"].get("body").is_none());

        match TunnelMessage::decode(wire.as_bytes()).unwrap() {
            TunnelMessage::ForwardRequest(decoded) => assert_eq!(decoded.request.body, None),
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(non_empty(Vec::new()), None);
        assert_eq!(non_empty(b"x".to_vec()), Some(b"x".to_vec()));
    }

    #[test]
    fn test_message_tags() {
        let wire = TunnelMessage::InitRequest.encode().unwrap();
        assert_eq!(wire, r#"{"type":"init_request"}"#);

        let id = ChannelId::new();
        let wire = TunnelMessage::InitResponse { channel_id: id }.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["type"], "init_response");
        assert_eq!(value["channel_id"], id.to_string());
    }

    #[test]
    fn test_header_multimap() {
        let req = sample_request(None);
        assert_eq!(req.headers.get("accept"), Some(&HeaderValues::One("text/html".into())));
        let tags: Vec<&str> = req.headers["x-tag"].iter().collect();
        assert_eq!(tags, vec!["a", "b"]);

        let wire = serde_json::to_value(&req.headers).unwrap();
        assert_eq!(wire["x-tag"], serde_json::json!(["a", "b"]));
        assert_eq!(wire["accept"], serde_json::json!("text/html"));
    }

    #[test]
    fn test_unknown_type_is_error() {
        assert!(TunnelMessage::decode(br#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_synthesized_hides_detail() {
        let resp = ResponseData::synthesized(&RelayError::NoTargetMatch("/secret/path".into()));
        assert_eq!(resp.status, 502);
        assert_eq!(resp.status_text, "Bad Gateway");
        assert_eq!(resp.body, Some(b"Bad Gateway".to_vec()));
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
    }
}
