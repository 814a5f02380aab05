//! Transient hub peer backed by a consumer subscription stream.

use crate::{canonical_namespace, Event, Peer, PeerInfo, Role};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

const QUEUE_SIZE: usize = 16;

/// A peer registered for the lifetime of one SUBSCRIBE stream. The serving
/// layer drains the returned receiver and writes frames to the consumer;
/// when the consumer disconnects it unregisters the peer.
pub struct SubscriberPeer {
    id: String,
    source: String,
    addr: String,
    namespace: String,
    accepts: Vec<String>,
    metadata_only: bool,
    tx: mpsc::Sender<Event>,
    connected_at: DateTime<Utc>,
    last_seen_ms: AtomicI64, // unix millis; 0 = never
}

impl SubscriberPeer {
    pub fn new(
        addr: &str,
        source: &str,
        namespace: &str,
        accepts: Vec<String>,
        metadata_only: bool,
    ) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let namespace = canonical_namespace(namespace).to_string();
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        let peer = Arc::new(Self {
            id: format!("{}/subscribe/{}", addr, namespace),
            source: source.to_string(),
            addr: addr.to_string(),
            namespace,
            accepts,
            metadata_only,
            tx,
            connected_at: Utc::now(),
            last_seen_ms: AtomicI64::new(0),
        });
        (peer, rx)
    }

    /// Whether frames for this subscriber carry only the MIME type list.
    pub fn metadata_only(&self) -> bool {
        self.metadata_only
    }
}

impl Peer for SubscriberPeer {
    fn id(&self) -> &str {
        &self.id
    }

    fn info(&self) -> PeerInfo {
        let last_seen_ms = self.last_seen_ms.load(Ordering::Relaxed);
        PeerInfo {
            id: self.id.clone(),
            source: self.source.clone(),
            addr: self.addr.clone(),
            role: Role::Client,
            namespace: self.namespace.clone(),
            accepted_types: self.accepts.clone(),
            connected_at: Some(self.connected_at),
            last_seen: (last_seen_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_seen_ms).single())
                .flatten(),
        }
    }

    fn deliver(&self, event: Event) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        if self.tx.try_send(event).is_err() {
            warn!(peer = %self.id, "Subscriber channel full, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hub::Hub, Item};

    #[tokio::test]
    async fn delivers_through_queue() {
        let (peer, mut rx) = SubscriberPeer::new("1.2.3.4:9", "cli", "default", vec![], false);
        peer.deliver(Event {
            source: "srv".into(),
            namespace: "default".into(),
            items: vec![Item::text("hi")],
        });
        let ev = rx.recv().await.expect("event");
        assert_eq!(ev.items, vec![Item::text("hi")]);
    }

    #[tokio::test]
    async fn full_queue_drops_newest() {
        let (peer, mut rx) = SubscriberPeer::new("1.2.3.4:9", "cli", "default", vec![], false);
        for i in 0..QUEUE_SIZE + 4 {
            peer.deliver(Event {
                source: "srv".into(),
                namespace: "default".into(),
                items: vec![Item::text(format!("{}", i))],
            });
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, QUEUE_SIZE);
    }

    #[test]
    fn id_embeds_addr_and_namespace() {
        let (peer, _rx) = SubscriberPeer::new("1.2.3.4:9", "cli", "", vec![], false);
        assert_eq!(peer.id(), "1.2.3.4:9/subscribe/default");
        assert_eq!(peer.info().namespace, "default");
    }

    #[test]
    fn last_seen_absent_until_first_delivery() {
        let (peer, _rx) = SubscriberPeer::new("1.2.3.4:9", "cli", "default", vec![], false);
        assert!(peer.info().last_seen.is_none());
        peer.deliver(Event {
            source: "srv".into(),
            namespace: "default".into(),
            items: vec![Item::text("hi")],
        });
        assert!(peer.info().last_seen.is_some());
    }

    #[tokio::test]
    async fn registered_subscriber_receives_fanout() {
        let hub = Hub::new();
        let (peer, mut rx) =
            SubscriberPeer::new("1.2.3.4:9", "cli", "default", vec!["text/plain".into()], false);
        hub.register(peer.clone());

        hub.publish(vec![Item::text("hi")], "default", "origin", "alice");
        let ev = rx.recv().await.expect("event");
        assert_eq!(ev.source, "alice");

        hub.unregister(peer.id());
        assert!(hub.peers().is_empty());
    }
}
