// mesh-protocol: Peer wire format for the proxy mesh.
//
// One JSON-encoded message per TCP connection: the sender writes the full
// payload, closes the write half, and the receiver reads to EOF. The outer
// object carries an integer `MessageType` tag plus an opaque `Data` field;
// both are frozen wire constants. In-process the tag/data pair is lifted
// into the `Payload` enum so dispatch happens over typed variants.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Frame hashing
// ---------------------------------------------------------------------------

/// FNV-1a, 32-bit. Used for node identifiers (`fnv1a_32(url)`) and for the
/// messenger's frame-dedup hashes. Wire-visible: peers must agree on it.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

// ---------------------------------------------------------------------------
// Wire tags (frozen)
// ---------------------------------------------------------------------------

/// Integer message-type tags as they appear in the `MessageType` field.
/// These values are shared with every deployed node and MUST NOT change.
pub mod tag {
    pub const UNICAST: u8 = 0;
    pub const MULTICAST: u8 = 1;
    pub const JOIN_REQUEST: u8 = 2;
    pub const JOIN_NOTIFY: u8 = 3;
    pub const LEAVE_NOTIFY: u8 = 4;
    pub const HTTP_REQUEST: u8 = 5;
    pub const HTTP_RESPONSE: u8 = 6;
    pub const ELECTION: u8 = 7;
    pub const ANSWER: u8 = 8;
    pub const VICTORY: u8 = 9;
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("unknown message type {0}")]
    UnknownType(u8),
}

// ---------------------------------------------------------------------------
// Base64 bytes (serde helper)
// ---------------------------------------------------------------------------

/// `Vec<u8>` as a base64 string, matching how the original peers marshal
/// byte slices. `null` deserializes to empty (a nil slice on the wire).
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Vec::new()),
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP envelopes
// ---------------------------------------------------------------------------

/// A client request serialized for fan-out to a peer.
///
/// `request_url` is `host + path` and is the rendezvous key: it must survive
/// the round trip through a peer byte-for-byte, since the leader uses it to
/// match the eventual response against waiting client handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxiedRequest {
    #[serde(rename = "Method")]
    pub method: String,
    #[serde(rename = "RequestUrl")]
    pub request_url: String,
    /// Header multimap. Key order is not significant; value order within a
    /// key is preserved.
    #[serde(rename = "Header", default)]
    pub header: HashMap<String, Vec<String>>,
    #[serde(rename = "Body", with = "base64_bytes", default)]
    pub body: Vec<u8>,
    #[serde(rename = "ContentLength")]
    pub content_length: i64,
}

/// An upstream response on its way back to the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxiedResponse {
    /// Full status line text, e.g. `"200 OK"`.
    #[serde(rename = "Status")]
    pub status: String,
    /// Echoed verbatim from the request that produced this response.
    #[serde(rename = "RequestUrl")]
    pub request_url: String,
    #[serde(rename = "Header", default)]
    pub header: HashMap<String, Vec<String>>,
    #[serde(rename = "Body", with = "base64_bytes", default)]
    pub body: Vec<u8>,
    #[serde(rename = "ContentLength")]
    pub content_length: i64,
}

impl ProxiedResponse {
    /// Numeric status code parsed from the status line; `200` if the line
    /// does not start with a number.
    pub fn status_code(&self) -> u16 {
        self.status
            .split_whitespace()
            .next()
            .and_then(|t| t.parse().ok())
            .unwrap_or(200)
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Decoded message payload, one variant per wire tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Free-form bytes delivered to a single peer; logged on receipt.
    Unicast(Vec<u8>),
    /// Free-form bytes flooded to every peer.
    Multicast(Vec<u8>),
    /// `url` is the joiner's own `host:port`.
    JoinRequest { url: String },
    /// Full roster; the first entry is the sender's own url.
    JoinNotify { urls: Vec<String> },
    /// The departed peer's url.
    LeaveNotify { url: String },
    HttpRequest(ProxiedRequest),
    HttpResponse(ProxiedResponse),
    Election,
    Answer,
    Victory,
}

impl Payload {
    /// The frozen integer tag this variant serializes under.
    pub fn wire_tag(&self) -> u8 {
        match self {
            Payload::Unicast(_) => tag::UNICAST,
            Payload::Multicast(_) => tag::MULTICAST,
            Payload::JoinRequest { .. } => tag::JOIN_REQUEST,
            Payload::JoinNotify { .. } => tag::JOIN_NOTIFY,
            Payload::LeaveNotify { .. } => tag::LEAVE_NOTIFY,
            Payload::HttpRequest(_) => tag::HTTP_REQUEST,
            Payload::HttpResponse(_) => tag::HTTP_RESPONSE,
            Payload::Election => tag::ELECTION,
            Payload::Answer => tag::ANSWER,
            Payload::Victory => tag::VICTORY,
        }
    }

    fn encode_data(&self) -> Result<Vec<u8>, CodecError> {
        Ok(match self {
            Payload::Unicast(data) | Payload::Multicast(data) => data.clone(),
            Payload::JoinRequest { url } | Payload::LeaveNotify { url } => {
                url.as_bytes().to_vec()
            }
            Payload::JoinNotify { urls } => urls.join(" ").into_bytes(),
            Payload::HttpRequest(req) => serde_json::to_vec(req)?,
            Payload::HttpResponse(res) => serde_json::to_vec(res)?,
            Payload::Election | Payload::Answer | Payload::Victory => Vec::new(),
        })
    }

    fn from_wire(message_type: u8, data: Vec<u8>) -> Result<Payload, CodecError> {
        Ok(match message_type {
            tag::UNICAST => Payload::Unicast(data),
            tag::MULTICAST => Payload::Multicast(data),
            tag::JOIN_REQUEST => Payload::JoinRequest {
                url: std::str::from_utf8(&data)?.to_owned(),
            },
            tag::JOIN_NOTIFY => Payload::JoinNotify {
                urls: std::str::from_utf8(&data)?
                    .split(' ')
                    .filter(|s| !s.is_empty())
                    .map(ToOwned::to_owned)
                    .collect(),
            },
            tag::LEAVE_NOTIFY => Payload::LeaveNotify {
                url: std::str::from_utf8(&data)?.to_owned(),
            },
            tag::HTTP_REQUEST => Payload::HttpRequest(serde_json::from_slice(&data)?),
            tag::HTTP_RESPONSE => Payload::HttpResponse(serde_json::from_slice(&data)?),
            tag::ELECTION => Payload::Election,
            tag::ANSWER => Payload::Answer,
            tag::VICTORY => Payload::Victory,
            other => return Err(CodecError::UnknownType(other)),
        })
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Outer wire object. Field names and the integer tag are frozen.
#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "Timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "Data", with = "base64_bytes", default)]
    data: Vec<u8>,
    #[serde(rename = "SenderUrl")]
    sender_url: String,
    #[serde(rename = "MessageType")]
    message_type: u8,
}

/// One peer message: who sent it, when, and the typed payload.
///
/// The timestamp is the sender's wall clock at construction time; receivers
/// store it in the dedup table, so it also bounds how long a re-flooded copy
/// of the frame is suppressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    pub sender_url: String,
    pub payload: Payload,
}

impl Envelope {
    /// Stamp a new message from `sender_url` with the current wall clock.
    pub fn new(sender_url: impl Into<String>, payload: Payload) -> Self {
        Envelope {
            timestamp: Utc::now(),
            sender_url: sender_url.into(),
            payload,
        }
    }

    /// Serialize to the frozen wire form.
    ///
    /// Failure here is a programmer bug (an envelope that cannot be
    /// represented), surfaced as an error rather than a panic.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let wire = WireMessage {
            timestamp: self.timestamp,
            data: self.payload.encode_data()?,
            sender_url: self.sender_url.clone(),
            message_type: self.payload.wire_tag(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Parse a raw frame. Any error means the frame is discarded by the
    /// receiver; it never brings a node down.
    pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
        let wire: WireMessage = serde_json::from_slice(bytes)?;
        Ok(Envelope {
            timestamp: wire.timestamp,
            sender_url: wire.sender_url,
            payload: Payload::from_wire(wire.message_type, wire.data)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_32_reference_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
        // Equal bytes, equal hash.
        assert_eq!(fnv1a_32(b"10.0.0.1:9001"), fnv1a_32(b"10.0.0.1:9001"));
    }

    #[test]
    fn wire_tags_are_frozen() {
        let cases: Vec<(Payload, u8)> = vec![
            (Payload::Unicast(vec![1]), 0),
            (Payload::Multicast(vec![2]), 1),
            (
                Payload::JoinRequest {
                    url: "h:1".to_owned(),
                },
                2,
            ),
            (
                Payload::JoinNotify {
                    urls: vec!["h:1".to_owned()],
                },
                3,
            ),
            (
                Payload::LeaveNotify {
                    url: "h:1".to_owned(),
                },
                4,
            ),
            (Payload::HttpRequest(sample_request()), 5),
            (Payload::HttpResponse(sample_response()), 6),
            (Payload::Election, 7),
            (Payload::Answer, 8),
            (Payload::Victory, 9),
        ];
        for (payload, expected) in cases {
            assert_eq!(payload.wire_tag(), expected);
            let bytes = Envelope::new("a:1", payload).encode().unwrap();
            let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(value["MessageType"], serde_json::json!(expected));
        }
    }

    #[test]
    fn outer_frame_uses_frozen_field_names() {
        let bytes = Envelope::new("a:1", Payload::Unicast(b"ping".to_vec()))
            .encode()
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let object = value.as_object().unwrap();
        for key in ["Timestamp", "Data", "SenderUrl", "MessageType"] {
            assert!(object.contains_key(key), "missing field {key}");
        }
        // Data is base64 of the payload bytes.
        assert_eq!(value["Data"], serde_json::json!("cGluZw=="));
    }

    #[test]
    fn http_request_envelope_round_trips() {
        let envelope = Envelope::new("10.0.0.1:9001", Payload::HttpRequest(sample_request()));
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn http_envelopes_use_frozen_field_names() {
        let json = serde_json::to_value(sample_request()).unwrap();
        let object = json.as_object().unwrap();
        for key in ["Method", "RequestUrl", "Header", "Body", "ContentLength"] {
            assert!(object.contains_key(key), "missing field {key}");
        }
        let json = serde_json::to_value(sample_response()).unwrap();
        assert!(json.as_object().unwrap().contains_key("Status"));
    }

    #[test]
    fn header_value_order_is_preserved() {
        let mut request = sample_request();
        request.header.insert(
            "Accept".to_owned(),
            vec!["text/html".to_owned(), "*/*".to_owned()],
        );
        let decoded: ProxiedRequest =
            serde_json::from_slice(&serde_json::to_vec(&request).unwrap()).unwrap();
        assert_eq!(
            decoded.header["Accept"],
            vec!["text/html".to_owned(), "*/*".to_owned()]
        );
        assert_eq!(decoded.body, request.body);
        assert_eq!(decoded.request_url, request.request_url);
    }

    #[test]
    fn join_notify_data_is_space_separated() {
        let payload = Payload::JoinNotify {
            urls: vec!["a:1".to_owned(), "b:2".to_owned(), "c:3".to_owned()],
        };
        let bytes = Envelope::new("a:1", payload.clone()).encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let data = value["Data"].as_str().unwrap();
        use base64::Engine as _;
        let raw = base64::engine::general_purpose::STANDARD
            .decode(data)
            .unwrap();
        assert_eq!(raw, b"a:1 b:2 c:3");
        assert_eq!(Envelope::decode(&bytes).unwrap().payload, payload);
    }

    #[test]
    fn null_body_decodes_to_empty() {
        // A nil byte slice marshals as JSON null on the wire.
        let json = r#"{"Method":"GET","RequestUrl":"x/","Header":{},"Body":null,"ContentLength":0}"#;
        let decoded: ProxiedRequest = serde_json::from_str(json).unwrap();
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(Envelope::decode(b"not json").is_err());
        let json = br#"{"Timestamp":"2026-01-01T00:00:00Z","Data":"","SenderUrl":"a:1","MessageType":42}"#;
        match Envelope::decode(json) {
            Err(CodecError::UnknownType(42)) => {}
            other => panic!("expected UnknownType(42), got {other:?}"),
        }
    }

    #[test]
    fn status_code_parses_status_line() {
        let mut response = sample_response();
        assert_eq!(response.status_code(), 200);
        response.status = "404 Not Found".to_owned();
        assert_eq!(response.status_code(), 404);
        response.status = "teapot".to_owned();
        assert_eq!(response.status_code(), 200);
    }

    fn sample_request() -> ProxiedRequest {
        let mut header = HashMap::new();
        header.insert("X-Test".to_owned(), vec!["y".to_owned()]);
        ProxiedRequest {
            method: "GET".to_owned(),
            request_url: "ok.example/".to_owned(),
            header,
            body: b"payload".to_vec(),
            content_length: 7,
        }
    }

    fn sample_response() -> ProxiedResponse {
        ProxiedResponse {
            status: "200 OK".to_owned(),
            request_url: "ok.example/".to_owned(),
            header: HashMap::new(),
            body: b"hi".to_vec(),
            content_length: 2,
        }
    }
}
