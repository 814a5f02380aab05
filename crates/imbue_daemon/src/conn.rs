//! Per-connection protocol handler: binds the broker operations onto one
//! accepted TCP connection.

use imbue_core::{
    canonical_namespace, debug_items, crypto::WireCipher, federation::Upstream, hub::Hub,
    protocol::Message, subscriber::SubscriberPeer, wire, Peer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(15);
const PONG_DEADLINE: Duration = Duration::from_secs(10);
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_QUEUE: usize = 64;

/// Shared serving context, one per broker.
pub struct ServeContext {
    pub hub: Arc<Hub>,
    pub token: Option<String>,
    pub cipher: Option<Arc<WireCipher>>,
    pub upstream: Option<Arc<Upstream>>,
}

/// Serves one connection until the client disconnects, the broker shuts
/// down, or the liveness watchdog fires.
pub async fn serve(
    ctx: Arc<ServeContext>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: CancellationToken,
) {
    let (mut reader, mut writer) = wire::split(stream, ctx.cipher.clone());
    let closed = shutdown.child_token();

    // Single writer task; everything else enqueues.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(WRITE_QUEUE);
    let writer_task: JoinHandle<()> = {
        let closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = closed.cancelled() => return,
                    msg = out_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => return,
                    },
                };
                if let Err(e) = writer.write_msg(&msg).await {
                    debug!(peer = %addr, "write failed: {}", e);
                    closed.cancel();
                    return;
                }
            }
        })
    };

    // The source name this connection publishes under; updated by AUTH.
    let mut source = addr.to_string();

    if let Some(expected) = &ctx.token {
        let authed = match tokio::time::timeout(AUTH_TIMEOUT, reader.read_msg()).await {
            Ok(Ok(Some(Message::Auth {
                token,
                source: client_source,
            }))) if token.as_deref() == Some(expected.as_str()) => {
                if !client_source.is_empty() {
                    source = client_source;
                }
                true
            }
            _ => false,
        };
        if !authed {
            warn!(peer = %addr, "auth failed");
            let _ = out_tx
                .send(Message::Error {
                    error: "auth_failed".to_string(),
                })
                .await;
            // Give the writer a moment to flush the rejection.
            tokio::time::sleep(Duration::from_millis(50)).await;
            closed.cancel();
            writer_task.abort();
            return;
        }
        let _ = out_tx.send(Message::AuthOk).await;
        info!(peer = %addr, %source, "authenticated");
    }

    // Liveness: any inbound message counts as alive; the watchdog pings and
    // closes the connection when nothing comes back in time.
    let (alive_tx, mut alive_rx) = mpsc::channel::<()>(1);
    let ping_task: JoinHandle<()> = {
        let out_tx = out_tx.clone();
        let closed = closed.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    _ = closed.cancelled() => return,
                    _ = interval.tick() => {}
                }
                if out_tx.send(Message::Ping).await.is_err() {
                    return;
                }
                tokio::select! {
                    _ = closed.cancelled() => return,
                    _ = alive_rx.recv() => {}
                    _ = tokio::time::sleep(PONG_DEADLINE) => {
                        warn!(peer = %addr, "pong timeout, closing");
                        closed.cancel();
                        return;
                    }
                }
            }
        })
    };

    // Subscriber peers registered by this connection, unregistered on exit.
    let mut subscriptions: Vec<(String, JoinHandle<()>)> = Vec::new();

    loop {
        let msg = tokio::select! {
            _ = closed.cancelled() => break,
            msg = reader.read_msg() => msg,
        };
        let msg = match msg {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %addr, "connection closed: {}", e);
                break;
            }
        };
        let _ = alive_tx.try_send(());

        match msg {
            Message::Publish {
                source: msg_source,
                namespace,
                items,
            } => {
                if !items.is_empty() {
                    let src = if msg_source.is_empty() {
                        source.clone()
                    } else {
                        msg_source
                    };
                    let ns = canonical_namespace(&namespace).to_string();
                    debug_items("clipboard received", &src, &ns, &items);
                    ctx.hub.publish(items, &ns, &addr.to_string(), &src);
                }
                if out_tx.send(Message::Ack).await.is_err() {
                    break;
                }
            }

            Message::Retrieve { namespace, accepts } => {
                let ns = canonical_namespace(&namespace).to_string();
                let (items, latest_source) = ctx.hub.latest(&ns, &accepts);
                let reply = Message::Latest {
                    source: latest_source,
                    namespace: ns,
                    items,
                };
                if out_tx.send(reply).await.is_err() {
                    break;
                }
            }

            Message::Subscribe {
                namespace,
                accepts,
                metadata_only,
            } => {
                let (peer, mut events) = SubscriberPeer::new(
                    &addr.to_string(),
                    &source,
                    &namespace,
                    accepts,
                    metadata_only,
                );
                info!(peer = peer.id(), metadata_only, "subscription started");
                ctx.hub.register(Arc::clone(&peer) as Arc<dyn Peer>);

                let forward = {
                    let out_tx = out_tx.clone();
                    let closed = closed.clone();
                    tokio::spawn(async move {
                        loop {
                            let event = tokio::select! {
                                _ = closed.cancelled() => return,
                                ev = events.recv() => match ev {
                                    Some(ev) => ev,
                                    None => return,
                                },
                            };
                            let available_types =
                                event.items.iter().map(|it| it.mime.clone()).collect();
                            let items = if metadata_only { vec![] } else { event.items };
                            let frame = Message::Event {
                                source: event.source,
                                namespace: event.namespace,
                                available_types,
                                items,
                            };
                            if out_tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                    })
                };
                subscriptions.push((peer.id().to_string(), forward));
            }

            Message::Inspect => {
                let reply = Message::InspectResponse {
                    peers: ctx.hub.peers(),
                    upstream: ctx.upstream.as_ref().map(|up| up.upstream_info()),
                };
                if out_tx.send(reply).await.is_err() {
                    break;
                }
            }

            Message::Ping => {
                if out_tx.send(Message::Pong).await.is_err() {
                    break;
                }
            }

            // Already counted as liveness above.
            Message::Pong => {}

            // Late AUTH on an unauthenticated broker just attaches a source.
            Message::Auth {
                source: client_source,
                ..
            } => {
                if !client_source.is_empty() {
                    source = client_source;
                }
                if out_tx.send(Message::AuthOk).await.is_err() {
                    break;
                }
            }

            other => {
                warn!(peer = %addr, ?other, "unexpected message");
            }
        }
    }

    closed.cancel();
    for (peer_id, task) in subscriptions {
        ctx.hub.unregister(&peer_id);
        task.abort();
    }
    ping_task.abort();
    writer_task.abort();
    debug!(peer = %addr, "connection finished");
}
