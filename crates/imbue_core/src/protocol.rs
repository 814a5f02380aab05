//! The imbue wire protocol.
//!
//! Every message is one line of JSON: `<json>\n`. Item payloads are
//! base64-encoded so binary content (images, etc.) is safe to embed in JSON
//! strings. When a token is configured the whole line is encrypted, see
//! [`crate::wire`].

use crate::{Item, PeerInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Largest message we will read off the wire (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Metadata about the broker's federation upstream connection, reported in
/// INSPECT_RESPONSE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamInfo {
    pub addr: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// The top-level wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// First message from a client when the broker requires a token; also
    /// attaches the client's source name.
    Auth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default)]
        source: String,
    },
    AuthOk,

    /// Publish items onto a namespace. The broker acks every publish.
    Publish {
        #[serde(default)]
        source: String,
        #[serde(default)]
        namespace: String,
        items: Vec<Item>,
    },
    Ack,

    /// Ask for the latest value of a namespace.
    Retrieve {
        #[serde(default)]
        namespace: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        accepts: Vec<String>,
    },
    Latest {
        source: String,
        namespace: String,
        #[serde(default)]
        items: Vec<Item>,
    },

    /// Turn this connection into an event stream for one namespace.
    Subscribe {
        #[serde(default)]
        namespace: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        accepts: Vec<String>,
        #[serde(default)]
        metadata_only: bool,
    },
    /// One clipboard update pushed to a subscriber. `items` is omitted for
    /// metadata-only subscriptions; `available_types` is always present.
    Event {
        source: String,
        namespace: String,
        available_types: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        items: Vec<Item>,
    },

    Inspect,
    InspectResponse {
        peers: Vec<PeerInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        upstream: Option<UpstreamInfo>,
    },

    Ping,
    Pong,

    Error {
        error: String,
    },
}

/// Serde helper: `Vec<u8>` as a standard-alphabet base64 string.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_round_trips_binary_payloads() {
        let msg = Message::Publish {
            source: "alice".into(),
            namespace: "default".into(),
            items: vec![Item::new("image/png", vec![0, 159, 146, 150])],
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains("\"PUBLISH\""));
        // Raw bytes must not leak into the JSON as an array.
        assert!(!json.contains("[0,159"));
        let back: Message = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, msg);
    }

    #[test]
    fn event_omits_items_when_empty() {
        let msg = Message::Event {
            source: "srv".into(),
            namespace: "default".into(),
            available_types: vec!["text/plain".into()],
            items: vec![],
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(!json.contains("\"items\""));
    }

    #[test]
    fn tags_use_screaming_snake_case() {
        let json = serde_json::to_string(&Message::AuthOk).expect("serialize");
        assert_eq!(json, r#"{"type":"AUTH_OK"}"#);
        let json = serde_json::to_string(&Message::Inspect).expect("serialize");
        assert_eq!(json, r#"{"type":"INSPECT"}"#);
    }

    #[test]
    fn subscribe_defaults_are_lenient() {
        let msg: Message = serde_json::from_str(r#"{"type":"SUBSCRIBE"}"#).expect("deserialize");
        assert_eq!(
            msg,
            Message::Subscribe {
                namespace: String::new(),
                accepts: vec![],
                metadata_only: false,
            }
        );
    }

    #[test]
    fn text_item_helper_sets_mime() {
        let item = Item::text("hello");
        assert_eq!(item.mime, "text/plain");
        assert_eq!(item.data, b"hello");
    }
}
