//! The peer that owns the serving host's OS clipboard.

use crate::{
    clipboard::ClipboardBackend, debug_items, hub::Hub, Event, Item, Peer, PeerInfo, Result, Role,
    DEFAULT_NAMESPACE,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex as PlMutex;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const LOCAL_PEER_ID: &str = "local";

const QUEUE_SIZE: usize = 64;

/// Bridges the OS clipboard to the hub: backend change signals become hub
/// publications, incoming hub events are written back to the backend.
///
/// Structural equality against the last items sent *or* received suppresses
/// the echo that a remotely-originated write would otherwise trigger when
/// the backend signals the resulting change.
pub struct LocalPeer {
    hub: Arc<Hub>,
    backend: Arc<dyn ClipboardBackend>,
    source: String,
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    last_items: PlMutex<Vec<Item>>,
    connected_at: DateTime<Utc>,
    last_seen: PlMutex<DateTime<Utc>>,
}

impl LocalPeer {
    pub fn new(hub: Arc<Hub>, backend: Arc<dyn ClipboardBackend>, source: String) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        let now = Utc::now();
        Arc::new(Self {
            hub,
            backend,
            source,
            tx,
            rx: Mutex::new(Some(rx)),
            last_items: PlMutex::new(Vec::new()),
            connected_at: now,
            last_seen: PlMutex::new(now),
        })
    }

    /// Registers with the hub and runs the watch and write loops until
    /// `shutdown` fires or the backend's watch stream ends.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let Some(mut rx) = self.rx.lock().await.take() else {
            error!("local peer run() called twice");
            return Ok(());
        };

        self.hub.register(Arc::clone(&self) as Arc<dyn Peer>);
        info!(backend = self.backend.name(), "local clipboard peer started");

        // Writer: apply incoming hub events to the local clipboard.
        let writer = {
            let peer = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = shutdown.cancelled() => return,
                        ev = rx.recv() => match ev {
                            Some(ev) => ev,
                            None => return,
                        },
                    };
                    peer.apply(event).await;
                }
            })
        };

        // Watcher: publish local clipboard changes to the hub.
        let mut watch = self.backend.watch();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = watch.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    self.publish_current().await;
                }
            }
        }

        self.hub.unregister(LOCAL_PEER_ID);
        self.backend.close();
        writer.abort();
        Ok(())
    }

    async fn apply(&self, event: Event) {
        if event.items.is_empty() {
            return;
        }
        if *self.last_items.lock() == event.items {
            return;
        }
        if let Err(e) = self.backend.write(&event.items).await {
            error!("Local clipboard write failed: {}", e);
            return;
        }
        *self.last_items.lock() = event.items.clone();
        *self.last_seen.lock() = Utc::now();
        debug_items(
            "local clipboard updated",
            &event.source,
            &event.namespace,
            &event.items,
        );
    }

    async fn publish_current(&self) {
        let items = match self.backend.read().await {
            Ok(items) => items,
            Err(e) => {
                error!("Local clipboard read failed: {}", e);
                return;
            }
        };
        if items.is_empty() {
            return;
        }
        {
            let mut last = self.last_items.lock();
            if *last == items {
                return;
            }
            *last = items.clone();
        }
        *self.last_seen.lock() = Utc::now();
        debug_items(
            "local clipboard changed, publishing",
            &self.source,
            DEFAULT_NAMESPACE,
            &items,
        );
        self.hub
            .publish(items, DEFAULT_NAMESPACE, LOCAL_PEER_ID, &self.source);
    }
}

impl Peer for LocalPeer {
    fn id(&self) -> &str {
        LOCAL_PEER_ID
    }

    fn info(&self) -> PeerInfo {
        PeerInfo {
            id: LOCAL_PEER_ID.to_string(),
            source: self.source.clone(),
            addr: "local".to_string(),
            role: Role::Both,
            namespace: DEFAULT_NAMESPACE.to_string(),
            accepted_types: vec![],
            connected_at: Some(self.connected_at),
            last_seen: Some(*self.last_seen.lock()),
        }
    }

    fn deliver(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            warn!("Local peer send channel full, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::ClipboardBackend;
    use async_trait::async_trait;
    use std::time::Duration;

    /// In-memory backend with a manual change trigger.
    struct MockBackend {
        contents: PlMutex<Vec<Item>>,
        signal: mpsc::Sender<()>,
        signal_rx: Mutex<Option<mpsc::Receiver<()>>>,
        writes: PlMutex<Vec<Vec<Item>>>,
        fail_writes: bool,
    }

    impl MockBackend {
        fn new(fail_writes: bool) -> Arc<Self> {
            let (tx, rx) = mpsc::channel(8);
            Arc::new(Self {
                contents: PlMutex::new(Vec::new()),
                signal: tx,
                signal_rx: Mutex::new(Some(rx)),
                writes: PlMutex::new(Vec::new()),
                fail_writes,
            })
        }

        async fn set_and_signal(&self, items: Vec<Item>) {
            *self.contents.lock() = items;
            self.signal.send(()).await.expect("signal");
        }
    }

    #[async_trait]
    impl ClipboardBackend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }

        async fn read(&self) -> Result<Vec<Item>> {
            Ok(self.contents.lock().clone())
        }

        async fn write(&self, items: &[Item]) -> Result<()> {
            if self.fail_writes {
                return Err(crate::ImbueError::Clipboard("mock failure".into()));
            }
            self.writes.lock().push(items.to_vec());
            *self.contents.lock() = items.to_vec();
            Ok(())
        }

        fn watch(&self) -> mpsc::Receiver<()> {
            self.signal_rx
                .try_lock()
                .expect("watch once")
                .take()
                .expect("watch once")
        }

        fn close(&self) {}
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn clipboard_change_publishes_to_hub() {
        let hub = Arc::new(Hub::new());
        let backend = MockBackend::new(false);
        let peer = LocalPeer::new(Arc::clone(&hub), backend.clone(), "host-a".to_string());

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&peer).run(shutdown.clone()));
        settle().await;

        backend.set_and_signal(vec![Item::text("copied")]).await;
        settle().await;

        let (items, source) = hub.latest(DEFAULT_NAMESPACE, &[]);
        assert_eq!(items, vec![Item::text("copied")]);
        assert_eq!(source, "host-a");

        shutdown.cancel();
        task.await.expect("join").expect("run");
        assert!(hub.peers().is_empty(), "peer should unregister on shutdown");
    }

    #[tokio::test]
    async fn incoming_event_is_written_once() {
        let hub = Arc::new(Hub::new());
        let backend = MockBackend::new(false);
        let peer = LocalPeer::new(Arc::clone(&hub), backend.clone(), "host-a".to_string());

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&peer).run(shutdown.clone()));
        settle().await;

        hub.publish(vec![Item::text("remote")], DEFAULT_NAMESPACE, "x", "bob");
        settle().await;
        assert_eq!(backend.writes.lock().len(), 1);

        // Same content again: structural dedup, no second write.
        hub.publish(vec![Item::text("remote")], DEFAULT_NAMESPACE, "x", "bob");
        settle().await;
        assert_eq!(backend.writes.lock().len(), 1);

        shutdown.cancel();
        task.await.expect("join").expect("run");
    }

    #[tokio::test]
    async fn remote_write_does_not_echo_back() {
        let hub = Arc::new(Hub::new());
        let backend = MockBackend::new(false);
        let peer = LocalPeer::new(Arc::clone(&hub), backend.clone(), "host-a".to_string());

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&peer).run(shutdown.clone()));
        settle().await;

        hub.publish(vec![Item::text("remote")], DEFAULT_NAMESPACE, "x", "bob");
        settle().await;

        // The write lands in the backend, which then signals a change, as
        // the real OS clipboard would.
        backend.signal.send(()).await.expect("signal");
        settle().await;

        // The latest source is still the remote publisher: the local peer
        // did not republish what it just received.
        let (_, source) = hub.latest(DEFAULT_NAMESPACE, &[]);
        assert_eq!(source, "bob");

        shutdown.cancel();
        task.await.expect("join").expect("run");
    }

    #[tokio::test]
    async fn write_failure_keeps_peer_alive() {
        let hub = Arc::new(Hub::new());
        let backend = MockBackend::new(true);
        let peer = LocalPeer::new(Arc::clone(&hub), backend.clone(), "host-a".to_string());

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&peer).run(shutdown.clone()));
        settle().await;

        hub.publish(vec![Item::text("remote")], DEFAULT_NAMESPACE, "x", "bob");
        settle().await;
        assert_eq!(hub.peers().len(), 1, "peer survives backend write errors");

        // A later local change still publishes; only the write path failed.
        backend.set_and_signal(vec![Item::text("local")]).await;
        settle().await;
        let (_, source) = hub.latest(DEFAULT_NAMESPACE, &[]);
        assert_eq!(source, "host-a");

        shutdown.cancel();
        task.await.expect("join").expect("run");
    }

    #[tokio::test]
    async fn info_reports_both_role_on_default_namespace() {
        let hub = Arc::new(Hub::new());
        let backend = MockBackend::new(false);
        let peer = LocalPeer::new(hub, backend, "host-a".to_string());

        let info = peer.info();
        assert_eq!(info.role, Role::Both);
        assert_eq!(info.namespace, DEFAULT_NAMESPACE);
        assert!(info.accepted_types.is_empty());
        assert!(info.connected_at.is_some());
    }
}
