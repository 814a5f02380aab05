//! The optional upstream connection that turns a standalone broker into a
//! federated node.
//!
//! When an upstream is configured, [`Upstream`]:
//!   - registers itself with the local hub as a broadcast peer (fixed
//!     sentinel id), receiving locally-published events and forwarding them
//!     upstream;
//!   - maintains one subscription stream per distinct namespace that local
//!     peers subscribe to, each using that namespace's MIME accept-union so
//!     upstream only sends what local consumers can handle;
//!   - implements [`PeerChangeListener`]: when the per-namespace filter set
//!     changes (new namespace watched, last watcher gone, MIME union
//!     changed), streams are opened, closed, or resubscribed accordingly;
//!   - reconnects each stream independently with exponential backoff.
//!
//! Loop prevention: events received from upstream are published to the local
//! hub with origin id equal to this peer's own id, so the hub never delivers
//! them back to the forward queue. A per-stream structural dedup catches
//! anything that still leaks across a reconnect.

use crate::client::{BrokerClient, Subscription};
use crate::hub::Hub;
use crate::protocol::UpstreamInfo;
use crate::{debug_items, Event, Item, NamespaceFilter, Peer, PeerChangeListener, PeerInfo, Role};
use chrono::{DateTime, Utc};
use parking_lot::Mutex as PlMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const UPSTREAM_PEER_ID: &str = "federation/upstream";

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT: Duration = Duration::from_secs(30);
const SEND_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Remote broker address (host:port).
    pub addr: String,
    /// Identifier sent to the remote broker.
    pub source: String,
}

struct StreamHandle {
    cancel: CancellationToken,
    done: oneshot::Receiver<()>,
}

#[derive(Default)]
struct StreamState {
    connected_at: HashMap<String, DateTime<Utc>>,
    last_seen: HashMap<String, DateTime<Utc>>,
}

/// Manages persistent federation streams to one remote broker. Implements
/// [`Peer`] (receiving local events for forwarding) and
/// [`PeerChangeListener`] (reconciling streams when local watchers change).
pub struct Upstream {
    cfg: UpstreamConfig,
    hub: Arc<Hub>,
    client: Arc<dyn BrokerClient>,

    send_tx: mpsc::Sender<Event>,
    send_rx: Mutex<Option<mpsc::Receiver<Event>>>,

    // Filter snapshots queue here and are applied in order by the run loop,
    // which is the single serialization point for stream lifecycle.
    snapshot_tx: mpsc::UnboundedSender<Vec<NamespaceFilter>>,
    snapshot_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<NamespaceFilter>>>>,

    streams: Mutex<HashMap<String, StreamHandle>>,
    active_filter: Mutex<HashMap<String, Vec<String>>>,
    state: Arc<PlMutex<StreamState>>,
}

impl Upstream {
    /// Creates the upstream, registers it with the hub as both listener and
    /// peer, and returns it. Call [`run`](Self::run) to start the loops.
    pub fn new(cfg: UpstreamConfig, hub: Arc<Hub>, client: Arc<dyn BrokerClient>) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE);
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let upstream = Arc::new(Self {
            cfg,
            hub: Arc::clone(&hub),
            client,
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            snapshot_tx,
            snapshot_rx: Mutex::new(Some(snapshot_rx)),
            streams: Mutex::new(HashMap::new()),
            active_filter: Mutex::new(HashMap::new()),
            state: Arc::new(PlMutex::new(StreamState::default())),
        });

        hub.set_listener(Arc::clone(&upstream) as Arc<dyn PeerChangeListener>);
        hub.register(Arc::clone(&upstream) as Arc<dyn Peer>);
        upstream
    }

    /// Runs the forward loop and the stream reconciler until `shutdown`
    /// fires, then tears every stream down and unregisters from the hub.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let (mut send_rx, mut snapshot_rx) = {
            let send = self.send_rx.lock().await.take();
            let snap = self.snapshot_rx.lock().await.take();
            match (send, snap) {
                (Some(send), Some(snap)) => (send, snap),
                _ => {
                    error!("federation upstream run() called twice");
                    return;
                }
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(filters) = snapshot_rx.recv() => self.reconcile(filters).await,
                Some(event) = send_rx.recv() => self.forward(event).await,
            }
        }

        // Shutdown: stop every stream, then leave the hub.
        let handles: Vec<(String, StreamHandle)> = self.streams.lock().await.drain().collect();
        for (namespace, handle) in handles {
            handle.cancel.cancel();
            let _ = handle.done.await;
            info!(%namespace, "federation stream stopped");
        }
        self.active_filter.lock().await.clear();
        self.hub.unregister(UPSTREAM_PEER_ID);
    }

    /// Snapshot of the upstream connection for INSPECT_RESPONSE: oldest
    /// connected_at and newest last_seen across open streams.
    pub fn upstream_info(&self) -> UpstreamInfo {
        let state = self.state.lock();
        UpstreamInfo {
            addr: self.cfg.addr.clone(),
            source: self.cfg.source.clone(),
            connected_at: state.connected_at.values().min().copied(),
            last_seen: state.last_seen.values().max().copied(),
        }
    }

    /// Namespaces with a currently-running stream loop. Status detail, also
    /// used by tests.
    pub async fn stream_namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self.streams.lock().await.keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    async fn reconcile(&self, filters: Vec<NamespaceFilter>) {
        let desired: HashMap<String, Vec<String>> = filters
            .into_iter()
            .map(|f| {
                let mut accepts = f.accepts;
                accepts.sort();
                (f.namespace, accepts)
            })
            .collect();

        // Stop streams for namespaces no longer needed and scrub their
        // per-stream state.
        let stale: Vec<String> = {
            let streams = self.streams.lock().await;
            streams
                .keys()
                .filter(|ns| !desired.contains_key(*ns))
                .cloned()
                .collect()
        };
        for namespace in stale {
            info!(%namespace, "federation closing upstream stream");
            self.stop_stream(&namespace).await;
            self.active_filter.lock().await.remove(&namespace);
            let mut state = self.state.lock();
            state.connected_at.remove(&namespace);
            state.last_seen.remove(&namespace);
        }

        // Open or resubscribe streams whose accept union changed.
        for (namespace, accepts) in desired {
            let current = self.active_filter.lock().await.get(&namespace).cloned();
            let running = self.streams.lock().await.contains_key(&namespace);
            if running && current.as_ref() == Some(&accepts) {
                continue;
            }
            if running {
                info!(%namespace, ?accepts, "federation resubscribing upstream stream");
                self.stop_stream(&namespace).await;
            }
            self.active_filter
                .lock()
                .await
                .insert(namespace.clone(), accepts.clone());
            let handle = self.start_stream(namespace.clone(), accepts);
            self.streams.lock().await.insert(namespace, handle);
        }
    }

    /// Cancels the stream for `namespace` and waits for its loop to finish,
    /// so two retry loops can never coexist for one namespace.
    async fn stop_stream(&self, namespace: &str) {
        let handle = self.streams.lock().await.remove(namespace);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.done.await;
        }
    }

    fn start_stream(&self, namespace: String, accepts: Vec<String>) -> StreamHandle {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        let loop_ctx = StreamLoop {
            hub: Arc::clone(&self.hub),
            client: Arc::clone(&self.client),
            addr: self.cfg.addr.clone(),
            state: Arc::clone(&self.state),
        };
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            loop_ctx.run(namespace, accepts, task_cancel).await;
            let _ = done_tx.send(());
        });

        StreamHandle {
            cancel,
            done: done_rx,
        }
    }

    async fn forward(&self, event: Event) {
        debug_items(
            "federation forwarding to upstream",
            &event.source,
            &event.namespace,
            &event.items,
        );
        if let Err(e) = self
            .client
            .publish(&event.source, &event.namespace, event.items)
            .await
        {
            warn!("Federation upstream publish failed: {}", e);
        }
    }
}

impl Peer for Upstream {
    fn id(&self) -> &str {
        UPSTREAM_PEER_ID
    }

    /// Namespace and accepted types are left empty: this peer spans every
    /// namespace and filtering happens per-stream on the remote side.
    fn info(&self) -> PeerInfo {
        let state = self.state.lock();
        PeerInfo {
            id: UPSTREAM_PEER_ID.to_string(),
            source: self.cfg.source.clone(),
            addr: self.cfg.addr.clone(),
            role: Role::Upstream,
            namespace: String::new(),
            accepted_types: vec![],
            connected_at: state.connected_at.values().min().copied(),
            last_seen: state.last_seen.values().max().copied(),
        }
    }

    fn deliver(&self, event: Event) {
        if self.send_tx.try_send(event).is_err() {
            warn!("Federation upstream send channel full, dropping");
        }
    }

    fn broadcast(&self) -> bool {
        true
    }
}

impl PeerChangeListener for Upstream {
    fn on_peer_change(&self, filters: Vec<NamespaceFilter>) {
        // Queued rather than applied inline: reconciliation awaits stream
        // teardown, which must not run inside a hub mutation.
        let _ = self.snapshot_tx.send(filters);
    }
}

/// Everything one per-namespace stream task needs, detached from `Upstream`
/// so cancellation never races the parent's teardown.
struct StreamLoop {
    hub: Arc<Hub>,
    client: Arc<dyn BrokerClient>,
    addr: String,
    state: Arc<PlMutex<StreamState>>,
}

impl StreamLoop {
    async fn run(self, namespace: String, accepts: Vec<String>, cancel: CancellationToken) {
        let mut delay = RECONNECT_DELAY;
        loop {
            let subscription = tokio::select! {
                _ = cancel.cancelled() => return,
                sub = self.client.subscribe(&namespace, &accepts, false) => sub,
            };

            let mut subscription: Subscription = match subscription {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(%namespace, retry_in = ?delay, "Upstream subscribe failed: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(MAX_RECONNECT);
                    continue;
                }
            };

            self.state
                .lock()
                .connected_at
                .insert(namespace.clone(), Utc::now());
            info!(addr = %self.addr, %namespace, ?accepts, "federation upstream stream connected");
            delay = RECONNECT_DELAY;

            let mut last_items: Vec<Item> = Vec::new();
            let stream_error = loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = subscription.next() => frame,
                };
                match frame {
                    Ok(Some(frame)) => {
                        self.state
                            .lock()
                            .last_seen
                            .insert(namespace.clone(), Utc::now());
                        if frame.items.is_empty() {
                            continue;
                        }
                        // Relay echo inside the remote broker still sends the
                        // round trip; drop anything structurally identical.
                        if frame.items == last_items {
                            continue;
                        }
                        last_items = frame.items.clone();
                        debug_items(
                            "federation received from upstream",
                            &frame.source,
                            &frame.namespace,
                            &frame.items,
                        );
                        self.hub.publish(
                            frame.items,
                            &frame.namespace,
                            UPSTREAM_PEER_ID,
                            &frame.source,
                        );
                    }
                    Ok(None) => break "upstream closed stream".to_string(),
                    Err(e) => break e.to_string(),
                }
            };

            warn!(%namespace, error = %stream_error, retry_in = ?delay, "Upstream stream ended, reconnecting");
            self.state.lock().connected_at.remove(&namespace);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(MAX_RECONNECT);
        }
    }
}
