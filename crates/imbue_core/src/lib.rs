pub mod clipboard;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod federation;
pub mod filter;
pub mod hub;
pub mod local;
pub mod protocol;
pub mod subscriber;
pub mod wire;

pub use clipboard::*;
pub use client::*;
pub use config::*;
pub use error::*;
pub use federation::*;
pub use filter::*;
pub use hub::*;
pub use local::*;
pub use protocol::*;
pub use subscriber::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Name of the clipboard namespace used when none is given.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Returns the effective namespace, defaulting to [`DEFAULT_NAMESPACE`].
/// Every boundary canonicalizes through this so hub-internal keys are never
/// the empty string.
pub fn canonical_namespace(ns: &str) -> &str {
    if ns.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        ns
    }
}

/// A single clipboard representation: a MIME label plus opaque bytes.
/// Payloads are base64-encoded on the wire so binary content survives JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub mime: String,
    #[serde(with = "protocol::base64_bytes")]
    pub data: Vec<u8>,
}

impl Item {
    pub fn new(mime: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime: mime.into(),
            data,
        }
    }

    /// Creates a text/plain item from a string.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            mime: "text/plain".to_string(),
            data: text.into().into_bytes(),
        }
    }
}

/// A clipboard update delivered to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub source: String,
    pub namespace: String,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Remote consumer connected over the wire.
    Client,
    /// A broker that also owns the serving host's OS clipboard.
    Both,
    /// Federation outbound connection.
    Upstream,
}

/// Snapshot of a peer's metadata as reported by `Peer::info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub source: String,
    pub addr: String,
    pub role: Role,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accepted_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Anything that can receive clipboard events from the hub.
///
/// `deliver` must never block the caller; implementations queue onto a
/// bounded channel and drop the event with a warning when full.
pub trait Peer: Send + Sync {
    fn id(&self) -> &str;

    /// Returns a fresh snapshot of the peer's metadata.
    fn info(&self) -> PeerInfo;

    /// Delivers an event to the peer. Must not block.
    fn deliver(&self, event: Event);

    /// Whether this peer wants events from every namespace, ignoring the
    /// namespace reported in `info()`. Only the federation upstream does.
    fn broadcast(&self) -> bool {
        false
    }
}

/// Notified whenever the set of registered peers changes, with the
/// post-change per-namespace filter snapshot (see [`filter::compute`]).
pub trait PeerChangeListener: Send + Sync {
    fn on_peer_change(&self, filters: Vec<NamespaceFilter>);
}

/// Logs a clipboard event at DEBUG only. Copy/paste traffic is
/// high-frequency and payloads must never land in logs at INFO.
pub fn debug_items(what: &str, source: &str, namespace: &str, items: &[Item]) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    let mimes: Vec<&str> = items.iter().map(|it| it.mime.as_str()).collect();
    debug!(source, namespace, types = ?mimes, "{}", what);
    for it in items {
        if it.mime == "text/plain" {
            let text = String::from_utf8_lossy(&it.data);
            let preview: String = text.chars().take(120).collect();
            debug!(mime = %it.mime, %preview, "clipboard item");
        } else {
            debug!(mime = %it.mime, size_bytes = it.data.len(), "clipboard item");
        }
    }
}
