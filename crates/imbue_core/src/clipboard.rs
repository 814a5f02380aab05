//! OS clipboard backends.
//!
//! [`SystemClipboard`] wraps the platform clipboard via copypasta with a
//! polling change watcher. [`NoopClipboard`] is the headless stub for
//! containers and servers without a display; a broker falling back to it
//! runs as a pure relay.

use crate::{config::ClipboardConfig, ImbueError, Item, Result};
use async_trait::async_trait;
use copypasta::{ClipboardContext, ClipboardProvider};
use parking_lot::Mutex as PlMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[async_trait]
pub trait ClipboardBackend: Send + Sync {
    /// Human-readable backend name for diagnostics.
    fn name(&self) -> &str;

    /// Current clipboard contents as typed items. Empty when the clipboard
    /// is empty or holds only unsupported types.
    async fn read(&self) -> Result<Vec<Item>>;

    /// Applies items to the OS clipboard. Items with MIME types the backend
    /// cannot represent are skipped with a warning.
    async fn write(&self, items: &[Item]) -> Result<()>;

    /// Change-signal stream: one `()` per observed clipboard change. The
    /// caller reads the clipboard after each signal. At most one watcher per
    /// backend.
    fn watch(&self) -> mpsc::Receiver<()>;

    /// Stops the watcher.
    fn close(&self);
}

/// Selects a backend per config. Initialization failure is surfaced to the
/// caller, which typically reacts by not instantiating the local peer at all
/// (pure-relay mode) rather than substituting a backend.
pub fn create_backend(config: &ClipboardConfig) -> Result<Arc<dyn ClipboardBackend>> {
    match config.backend.as_str() {
        "noop" => Ok(Arc::new(NoopClipboard::new())),
        _ => Ok(Arc::new(SystemClipboard::new(config)?)),
    }
}

/// Shortens `content` to at most `max_bytes` bytes, cutting on a UTF-8
/// character boundary so the result stays valid.
fn truncate_utf8(content: &mut String, max_bytes: usize) {
    if content.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    content.truncate(cut);
}

pub struct SystemClipboard {
    context: Arc<Mutex<ClipboardContext>>,
    poll_interval: Duration,
    max_item_bytes: usize,
    closed: CancellationToken,
}

impl SystemClipboard {
    pub fn new(config: &ClipboardConfig) -> Result<Self> {
        let context = ClipboardContext::new().map_err(|e| {
            ImbueError::Clipboard(format!("Failed to create clipboard context: {}", e))
        })?;
        Ok(Self {
            context: Arc::new(Mutex::new(context)),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_item_bytes: config.max_item_bytes,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl ClipboardBackend for SystemClipboard {
    fn name(&self) -> &str {
        "system (copypasta, poll)"
    }

    async fn read(&self) -> Result<Vec<Item>> {
        let mut content = {
            let mut ctx = self.context.lock().await;
            ctx.get_contents().map_err(|e| {
                ImbueError::Clipboard(format!("Failed to get clipboard contents: {}", e))
            })?
        };
        if content.is_empty() {
            return Ok(vec![]);
        }
        if content.len() > self.max_item_bytes {
            debug!(
                "Clipboard content too large ({} bytes), truncating to {}",
                content.len(),
                self.max_item_bytes
            );
            truncate_utf8(&mut content, self.max_item_bytes);
        }
        Ok(vec![Item::text(content)])
    }

    async fn write(&self, items: &[Item]) -> Result<()> {
        // copypasta is text-only; the first text item wins.
        let text = items.iter().find(|it| it.mime == "text/plain");
        for it in items {
            if it.mime != "text/plain" {
                warn!(mime = %it.mime, "Skipping unsupported clipboard type");
            }
        }
        let Some(item) = text else {
            return Ok(());
        };

        let content = String::from_utf8_lossy(&item.data).into_owned();
        let mut ctx = self.context.lock().await;
        ctx.set_contents(content)
            .map_err(|e| ImbueError::Clipboard(format!("Failed to set clipboard contents: {}", e)))
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        let context = Arc::clone(&self.context);
        let closed = self.closed.clone();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            let mut last_content = String::new();

            loop {
                tokio::select! {
                    _ = closed.cancelled() => return,
                    _ = interval.tick() => {}
                }

                let current = {
                    let mut ctx = context.lock().await;
                    match ctx.get_contents() {
                        Ok(content) => content,
                        Err(e) => {
                            debug!("Failed to poll clipboard: {}", e);
                            continue;
                        }
                    }
                };

                if current != last_content && !current.is_empty() {
                    last_content = current;
                    // A pending signal already covers this change.
                    if tx.try_send(()).is_err() && tx.is_closed() {
                        return;
                    }
                }
            }
        });

        rx
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// No-op backend: reads are empty, writes are discarded, the watcher never
/// signals.
pub struct NoopClipboard {
    watch_tx: PlMutex<Vec<mpsc::Sender<()>>>,
}

impl Default for NoopClipboard {
    fn default() -> Self {
        Self::new()
    }
}

impl NoopClipboard {
    pub fn new() -> Self {
        Self {
            watch_tx: PlMutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ClipboardBackend for NoopClipboard {
    fn name(&self) -> &str {
        "headless (no-op)"
    }

    async fn read(&self) -> Result<Vec<Item>> {
        Ok(vec![])
    }

    async fn write(&self, _items: &[Item]) -> Result<()> {
        Ok(())
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        // Keep the sender alive so the stream stays open without ever firing.
        self.watch_tx.lock().push(tx);
        rx
    }

    fn close(&self) {
        self.watch_tx.lock().clear();
    }
}
