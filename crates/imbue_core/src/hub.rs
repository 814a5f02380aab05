//! The central clipboard broker. Transport-agnostic: peers register, receive
//! events through their delivery sinks, and publish items.

use crate::{
    canonical_namespace, filter, Event, Item, NamespaceFilter, Peer, PeerChangeListener, PeerInfo,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
struct State {
    peers: HashMap<String, Arc<dyn Peer>>,
    latest: HashMap<String, Vec<Item>>,
    latest_source: HashMap<String, String>,
}

/// Routes clipboard updates between all registered peers.
///
/// All methods are safe for concurrent invocation. The state lock is never
/// held across peer deliveries or listener callbacks: mutations capture a
/// work list under the lock, release it, then act.
pub struct Hub {
    state: RwLock<State>,
    // Separate lock so a listener callback that re-enters the hub can never
    // deadlock against listener replacement.
    listener: Mutex<Option<Arc<dyn PeerChangeListener>>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            listener: Mutex::new(None),
        }
    }

    /// Registers a listener called on every peer set change. Only one
    /// listener is supported; calling again replaces it.
    pub fn set_listener(&self, listener: Arc<dyn PeerChangeListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Adds a peer and immediately replays the latest contents of its
    /// subscribed namespace, filtered by its accepted types. A peer with a
    /// duplicate id replaces the prior one.
    pub fn register(&self, peer: Arc<dyn Peer>) {
        let info = peer.info();
        let ns = canonical_namespace(&info.namespace).to_string();

        let (replay, filters, total) = {
            let mut state = self.state.write();
            state.peers.insert(peer.id().to_string(), Arc::clone(&peer));
            let replay = if peer.broadcast() {
                None
            } else {
                state.latest.get(&ns).map(|items| {
                    (
                        filter::filter_items(items, &info.accepted_types),
                        state.latest_source.get(&ns).cloned().unwrap_or_default(),
                    )
                })
            };
            (replay, self.filters_locked(&state), state.peers.len())
        };

        info!(
            peer = peer.id(),
            source = %info.source,
            namespace = %ns,
            total,
            "peer registered"
        );

        self.notify_listener(filters);

        if let Some((items, source)) = replay {
            if !items.is_empty() {
                peer.deliver(Event {
                    source,
                    namespace: ns,
                    items,
                });
            }
        }
    }

    /// Removes the peer with the given id. No-op if absent.
    pub fn unregister(&self, id: &str) {
        let (removed, filters, total) = {
            let mut state = self.state.write();
            let removed = state.peers.remove(id).is_some();
            (removed, self.filters_locked(&state), state.peers.len())
        };

        if !removed {
            return;
        }

        info!(peer = id, total, "peer unregistered");
        self.notify_listener(filters);
    }

    /// Stores `items` as the latest value of `namespace` and fans the event
    /// out to every registered peer except the origin. Targets whose
    /// accepted types filter the event to nothing are skipped.
    pub fn publish(&self, items: Vec<Item>, namespace: &str, origin_id: &str, source: &str) {
        let ns = canonical_namespace(namespace).to_string();

        let targets: Vec<(Arc<dyn Peer>, Vec<String>)> = {
            let mut state = self.state.write();
            state.latest.insert(ns.clone(), items.clone());
            state.latest_source.insert(ns.clone(), source.to_string());

            state
                .peers
                .iter()
                .filter(|(id, _)| id.as_str() != origin_id)
                .filter_map(|(_, p)| {
                    let info = p.info();
                    if p.broadcast() || canonical_namespace(&info.namespace) == ns {
                        Some((Arc::clone(p), info.accepted_types))
                    } else {
                        None
                    }
                })
                .collect()
        };

        for (peer, accepts) in targets {
            let filtered = filter::filter_items(&items, &accepts);
            if filtered.is_empty() {
                continue;
            }
            peer.deliver(Event {
                source: source.to_string(),
                namespace: ns.clone(),
                items: filtered,
            });
        }
    }

    /// Returns the most recent items and source for the named namespace,
    /// optionally filtered by accepted MIME types. Empty when nothing has
    /// been published there.
    pub fn latest(&self, namespace: &str, accepts: &[String]) -> (Vec<Item>, String) {
        let ns = canonical_namespace(namespace);
        let state = self.state.read();
        let items = state
            .latest
            .get(ns)
            .map(|items| filter::filter_items(items, accepts))
            .unwrap_or_default();
        let source = state.latest_source.get(ns).cloned().unwrap_or_default();
        (items, source)
    }

    /// Snapshot of all current peer metadata.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.state.read().peers.values().map(|p| p.info()).collect()
    }

    // Broadcast peers span every namespace and are the consumers of the
    // filter snapshot, not inputs to it.
    fn filters_locked(&self, state: &State) -> Vec<NamespaceFilter> {
        let inputs: Vec<(String, Vec<String>)> = state
            .peers
            .values()
            .filter(|p| !p.broadcast())
            .map(|p| {
                let info = p.info();
                (info.namespace, info.accepted_types)
            })
            .collect();
        filter::compute(&inputs)
    }

    fn notify_listener(&self, filters: Vec<NamespaceFilter>) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener.on_peer_change(filters);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::Role;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;

    /// A peer that records every delivered event.
    pub(crate) struct RecordingPeer {
        id: String,
        namespace: String,
        accepts: Vec<String>,
        broadcast: bool,
        pub events: PlMutex<Vec<Event>>,
    }

    impl RecordingPeer {
        pub fn new(id: &str, namespace: &str, accepts: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                namespace: namespace.to_string(),
                accepts: accepts.iter().map(|s| s.to_string()).collect(),
                broadcast: false,
                events: PlMutex::new(Vec::new()),
            })
        }

        pub fn broadcast(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                namespace: String::new(),
                accepts: Vec::new(),
                broadcast: true,
                events: PlMutex::new(Vec::new()),
            })
        }

        pub fn taken(&self) -> Vec<Event> {
            self.events.lock().clone()
        }
    }

    impl Peer for RecordingPeer {
        fn id(&self) -> &str {
            &self.id
        }

        fn info(&self) -> PeerInfo {
            PeerInfo {
                id: self.id.clone(),
                source: self.id.clone(),
                addr: "test".to_string(),
                role: Role::Client,
                namespace: self.namespace.clone(),
                accepted_types: self.accepts.clone(),
                connected_at: None,
                last_seen: None,
            }
        }

        fn deliver(&self, event: Event) {
            self.events.lock().push(event);
        }

        fn broadcast(&self) -> bool {
            self.broadcast
        }
    }

    struct CountingListener {
        snapshots: PlMutex<Vec<Vec<NamespaceFilter>>>,
    }

    impl PeerChangeListener for CountingListener {
        fn on_peer_change(&self, filters: Vec<NamespaceFilter>) {
            self.snapshots.lock().push(filters);
        }
    }

    #[test]
    fn two_peer_text_sync() {
        let hub = Hub::new();
        let a = RecordingPeer::new("a", "default", &[]);
        let b = RecordingPeer::new("b", "default", &["text/plain"]);
        hub.register(a.clone());
        hub.register(b.clone());

        hub.publish(vec![Item::text("hi")], "default", "a", "alice");

        assert!(a.taken().is_empty(), "origin must not receive its own event");
        let b_events = b.taken();
        assert_eq!(b_events.len(), 1);
        assert_eq!(b_events[0].source, "alice");
        assert_eq!(b_events[0].namespace, "default");
        assert_eq!(b_events[0].items, vec![Item::text("hi")]);

        let (items, source) = hub.latest("default", &[]);
        assert_eq!(items, vec![Item::text("hi")]);
        assert_eq!(source, "alice");
    }

    #[test]
    fn accepts_filter_excludes_event() {
        let hub = Hub::new();
        let a = RecordingPeer::new("a", "default", &[]);
        let b = RecordingPeer::new("b", "default", &["text/plain"]);
        hub.register(a.clone());
        hub.register(b.clone());

        hub.publish(vec![Item::text("hi")], "default", "a", "alice");
        hub.publish(
            vec![Item::new("image/png", vec![0, 1, 2, 3, 4, 5, 6, 7])],
            "default",
            "a",
            "alice",
        );

        // B saw only the text event; the image filtered to nothing.
        assert_eq!(b.taken().len(), 1);

        let (items, _) = hub.latest("default", &[]);
        assert_eq!(items[0].mime, "image/png");

        let (items, source) = hub.latest("default", &["text/plain".to_string()]);
        assert!(items.is_empty());
        assert_eq!(source, "alice");
    }

    #[test]
    fn freshness_replay_on_join() {
        let hub = Hub::new();
        hub.publish(vec![Item::text("hello")], "default", "x", "srv");

        let c = RecordingPeer::new("c", "default", &["text/plain"]);
        hub.register(c.clone());

        let events = c.taken();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "srv");
        assert_eq!(events[0].items, vec![Item::text("hello")]);
    }

    #[test]
    fn replay_skipped_when_filtered_empty() {
        let hub = Hub::new();
        hub.publish(
            vec![Item::new("image/png", vec![1])],
            "default",
            "x",
            "srv",
        );

        let c = RecordingPeer::new("c", "default", &["text/plain"]);
        hub.register(c.clone());
        assert!(c.taken().is_empty());
    }

    #[test]
    fn replay_skipped_when_namespace_empty() {
        let hub = Hub::new();
        let c = RecordingPeer::new("c", "default", &[]);
        hub.register(c.clone());
        assert!(c.taken().is_empty());
    }

    #[test]
    fn namespaces_are_isolated() {
        let hub = Hub::new();
        let a = RecordingPeer::new("a", "default", &[]);
        let b = RecordingPeer::new("b", "scratch", &[]);
        hub.register(a.clone());
        hub.register(b.clone());

        hub.publish(vec![Item::text("only-default")], "default", "x", "srv");
        assert_eq!(a.taken().len(), 1);
        assert!(b.taken().is_empty());
    }

    #[test]
    fn empty_namespace_publishes_to_default() {
        let hub = Hub::new();
        let a = RecordingPeer::new("a", "default", &[]);
        hub.register(a.clone());

        hub.publish(vec![Item::text("hi")], "", "x", "srv");
        let events = a.taken();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].namespace, "default");
    }

    #[test]
    fn broadcast_peer_receives_every_namespace() {
        let hub = Hub::new();
        let up = RecordingPeer::broadcast("federation/upstream");
        hub.register(up.clone());

        hub.publish(vec![Item::text("a")], "default", "x", "srv");
        hub.publish(vec![Item::text("b")], "scratch", "x", "srv");
        assert_eq!(up.taken().len(), 2);
    }

    #[test]
    fn origin_suppression_applies_to_broadcast_peers() {
        let hub = Hub::new();
        let up = RecordingPeer::broadcast("federation/upstream");
        hub.register(up.clone());

        hub.publish(
            vec![Item::text("round-trip")],
            "default",
            "federation/upstream",
            "remote-1",
        );
        assert!(up.taken().is_empty());
    }

    #[test]
    fn duplicate_id_replaces_prior_peer() {
        let hub = Hub::new();
        let first = RecordingPeer::new("dup", "default", &[]);
        let second = RecordingPeer::new("dup", "default", &[]);
        hub.register(first.clone());
        hub.register(second.clone());

        hub.publish(vec![Item::text("hi")], "default", "other", "srv");
        assert!(first.taken().is_empty());
        assert_eq!(second.taken().len(), 1);
    }

    #[test]
    fn listener_called_once_per_change_with_snapshot() {
        let hub = Hub::new();
        let listener = Arc::new(CountingListener {
            snapshots: PlMutex::new(Vec::new()),
        });
        hub.set_listener(listener.clone());

        let a = RecordingPeer::new("a", "default", &["text/plain"]);
        let b = RecordingPeer::new("b", "default", &["image/png"]);
        hub.register(a);
        hub.register(b);
        hub.unregister("a");
        hub.unregister("missing-id"); // no-op, no callback

        let snapshots = listener.snapshots.lock();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(
            snapshots[1],
            vec![NamespaceFilter {
                namespace: "default".into(),
                accepts: vec!["image/png".into(), "text/plain".into()],
            }]
        );
        assert_eq!(
            snapshots[2],
            vec![NamespaceFilter {
                namespace: "default".into(),
                accepts: vec!["image/png".into()],
            }]
        );
    }

    #[test]
    fn broadcast_peer_does_not_affect_filter_snapshot() {
        let hub = Hub::new();
        let listener = Arc::new(CountingListener {
            snapshots: PlMutex::new(Vec::new()),
        });
        hub.set_listener(listener.clone());

        let a = RecordingPeer::new("a", "default", &["text/plain"]);
        hub.register(a);
        let baseline = listener.snapshots.lock().last().cloned();

        let up = RecordingPeer::broadcast("federation/upstream");
        hub.register(up);
        let after = listener.snapshots.lock().last().cloned();

        assert_eq!(baseline, after);
    }

    #[test]
    fn latest_on_unpublished_namespace_is_empty() {
        let hub = Hub::new();
        let (items, source) = hub.latest("nowhere", &[]);
        assert!(items.is_empty());
        assert!(source.is_empty());
    }
}
