//! Client side of the broker protocol: used by the CLI tools and by the
//! federation upstream. The [`BrokerClient`] trait is the seam federation is
//! tested through; [`RemoteBroker`] is the real TCP implementation.

use crate::crypto::WireCipher;
use crate::protocol::{Message, UpstreamInfo};
use crate::wire::{self, WireReader, WireWriter};
use crate::{ImbueError, Item, PeerInfo, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// One clipboard update received over a subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub source: String,
    pub namespace: String,
    pub available_types: Vec<String>,
    pub items: Vec<Item>,
}

/// Pull side of a long-lived subscription.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame; `None` when the remote closed the stream cleanly.
    async fn next(&mut self) -> Result<Option<Frame>>;
}

pub struct Subscription {
    inner: Box<dyn FrameSource>,
}

impl Subscription {
    pub fn new(inner: Box<dyn FrameSource>) -> Self {
        Self { inner }
    }

    pub async fn next(&mut self) -> Result<Option<Frame>> {
        self.inner.next().await
    }
}

/// The operations the federation upstream invokes against a remote broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(&self, source: &str, namespace: &str, items: Vec<Item>) -> Result<()>;

    async fn subscribe(
        &self,
        namespace: &str,
        accepts: &[String],
        metadata_only: bool,
    ) -> Result<Subscription>;
}

type Conn = (WireReader<OwnedReadHalf>, WireWriter<OwnedWriteHalf>);

/// TCP client for a remote imbue broker. Request/response operations share
/// one lazily-established connection, re-dialed after any error; each
/// subscription gets its own connection.
pub struct RemoteBroker {
    addr: String,
    token: Option<String>,
    source: String,
    cipher: Option<Arc<WireCipher>>,
    conn: Mutex<Option<Conn>>,
}

impl RemoteBroker {
    pub fn new(addr: String, token: Option<String>, source: String) -> Result<Self> {
        let cipher = match &token {
            Some(token) => Some(Arc::new(WireCipher::from_token(token)?)),
            None => None,
        };
        Ok(Self {
            addr,
            token,
            source,
            cipher,
            conn: Mutex::new(None),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> Result<Conn> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| ImbueError::Network(format!("Connect {}: {}", self.addr, e)))?;
        let (mut reader, mut writer) = wire::split(stream, self.cipher.clone());

        writer
            .write_msg(&Message::Auth {
                token: self.token.clone(),
                source: self.source.clone(),
            })
            .await?;
        match reader.read_msg().await? {
            Some(Message::AuthOk) => {}
            Some(Message::Error { error }) => return Err(ImbueError::Auth(error)),
            Some(other) => {
                return Err(ImbueError::Protocol(format!(
                    "Unexpected handshake reply: {:?}",
                    other
                )))
            }
            None => {
                return Err(ImbueError::Network(
                    "Connection closed during handshake".to_string(),
                ))
            }
        }
        debug!(addr = %self.addr, "connected to broker");
        Ok((reader, writer))
    }

    /// Sends `msg` on the shared connection and reads one reply, answering
    /// pings along the way. Drops the connection on any error so the next
    /// call re-dials.
    async fn request(&self, msg: &Message) -> Result<Message> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }
        let result = async {
            let (reader, writer) = guard.as_mut().ok_or_else(|| {
                ImbueError::Network("Connection unavailable".to_string())
            })?;
            writer.write_msg(msg).await?;
            loop {
                match reader.read_msg().await? {
                    Some(Message::Ping) => writer.write_msg(&Message::Pong).await?,
                    Some(Message::Pong) => {}
                    Some(Message::Error { error }) => {
                        return Err(ImbueError::Protocol(error));
                    }
                    Some(reply) => return Ok(reply),
                    None => {
                        return Err(ImbueError::Network(
                            "Connection closed mid-request".to_string(),
                        ))
                    }
                }
            }
        }
        .await;

        if result.is_err() {
            *guard = None;
        }
        result
    }

    /// Fetches the latest value of a namespace.
    pub async fn retrieve(
        &self,
        namespace: &str,
        accepts: &[String],
    ) -> Result<(String, String, Vec<Item>)> {
        let reply = self
            .request(&Message::Retrieve {
                namespace: namespace.to_string(),
                accepts: accepts.to_vec(),
            })
            .await?;
        match reply {
            Message::Latest {
                source,
                namespace,
                items,
            } => Ok((source, namespace, items)),
            other => Err(ImbueError::Protocol(format!(
                "Unexpected retrieve reply: {:?}",
                other
            ))),
        }
    }

    /// Fetches the broker's peer table and upstream summary.
    pub async fn inspect(&self) -> Result<(Vec<PeerInfo>, Option<UpstreamInfo>)> {
        let reply = self.request(&Message::Inspect).await?;
        match reply {
            Message::InspectResponse { peers, upstream } => Ok((peers, upstream)),
            other => Err(ImbueError::Protocol(format!(
                "Unexpected inspect reply: {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl BrokerClient for RemoteBroker {
    async fn publish(&self, source: &str, namespace: &str, items: Vec<Item>) -> Result<()> {
        let reply = self
            .request(&Message::Publish {
                source: source.to_string(),
                namespace: namespace.to_string(),
                items,
            })
            .await?;
        match reply {
            Message::Ack => Ok(()),
            other => Err(ImbueError::Protocol(format!(
                "Unexpected publish reply: {:?}",
                other
            ))),
        }
    }

    async fn subscribe(
        &self,
        namespace: &str,
        accepts: &[String],
        metadata_only: bool,
    ) -> Result<Subscription> {
        let (reader, mut writer) = self.dial().await?;
        writer
            .write_msg(&Message::Subscribe {
                namespace: namespace.to_string(),
                accepts: accepts.to_vec(),
                metadata_only,
            })
            .await?;
        // The first frame (if any) is the freshness replay; it arrives
        // through the normal stream.
        Ok(Subscription::new(Box::new(TcpFrameSource { reader, writer })))
    }
}

struct TcpFrameSource {
    reader: WireReader<OwnedReadHalf>,
    writer: WireWriter<OwnedWriteHalf>,
}

#[async_trait]
impl FrameSource for TcpFrameSource {
    async fn next(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.reader.read_msg().await? {
                Some(Message::Event {
                    source,
                    namespace,
                    available_types,
                    items,
                }) => {
                    return Ok(Some(Frame {
                        source,
                        namespace,
                        available_types,
                        items,
                    }))
                }
                Some(Message::Ping) => self.writer.write_msg(&Message::Pong).await?,
                Some(Message::Pong) => {}
                Some(Message::Error { error }) => return Err(ImbueError::Protocol(error)),
                Some(other) => {
                    debug!(?other, "ignoring non-event frame on subscription");
                }
                None => return Ok(None),
            }
        }
    }
}
