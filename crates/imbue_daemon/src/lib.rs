//! The imbue broker daemon: hub, local clipboard peer, optional federation
//! upstream, and the TCP serving layer.

use imbue_core::{
    clipboard::create_backend, crypto::WireCipher, federation::{Upstream, UpstreamConfig},
    hub::Hub, local::LocalPeer, ImbueConfig, ImbueError, RemoteBroker, Result,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod conn;

use conn::ServeContext;

pub struct Daemon {
    config: ImbueConfig,
    hub: Arc<Hub>,
    local: Option<Arc<LocalPeer>>,
    upstream: Option<Arc<Upstream>>,
    cipher: Option<Arc<WireCipher>>,
}

impl Daemon {
    pub fn new(config: ImbueConfig) -> Result<Self> {
        let hub = Arc::new(Hub::new());

        let cipher = match &config.server.token {
            Some(token) => Some(Arc::new(WireCipher::from_token(token)?)),
            None => None,
        };

        let local = if config.server.no_local {
            info!("local clipboard integration disabled, running as relay");
            None
        } else {
            match create_backend(&config.clipboard) {
                Ok(backend) => Some(LocalPeer::new(
                    Arc::clone(&hub),
                    backend,
                    config.node.source.clone(),
                )),
                Err(e) => {
                    warn!("Clipboard unavailable, running as pure relay: {}", e);
                    None
                }
            }
        };

        let upstream = match config.upstream_settings() {
            Some((addr, token, source)) => {
                info!(%addr, "federation enabled");
                let client = Arc::new(RemoteBroker::new(addr.clone(), token, source.clone())?);
                Some(Upstream::new(
                    UpstreamConfig { addr, source },
                    Arc::clone(&hub),
                    client,
                ))
            }
            None => None,
        };

        Ok(Self {
            config,
            hub,
            local,
            upstream,
            cipher,
        })
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Binds the listener separately from serving so callers (and tests)
    /// can learn the bound address before traffic starts.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.server.addr)
            .await
            .map_err(|e| {
                ImbueError::Network(format!("Bind {}: {}", self.config.server.addr, e))
            })?;
        Ok(listener)
    }

    /// Serves connections until `shutdown` fires.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(
            %addr,
            auth = self.config.server.token.is_some(),
            local_clip = self.local.is_some(),
            upstream = self.upstream.is_some(),
            "imbue broker listening"
        );

        if let Some(local) = &self.local {
            tokio::spawn(Arc::clone(local).run(shutdown.child_token()));
        }
        if let Some(upstream) = &self.upstream {
            tokio::spawn(Arc::clone(upstream).run(shutdown.child_token()));
        }

        let ctx = Arc::new(ServeContext {
            hub: Arc::clone(&self.hub),
            token: self.config.server.token.clone(),
            cipher: self.cipher.clone(),
            upstream: self.upstream.clone(),
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(peer = %peer_addr, "accepted connection");
                        tokio::spawn(conn::serve(
                            Arc::clone(&ctx),
                            stream,
                            peer_addr,
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }

        info!("broker shutting down");
        Ok(())
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }
}

/// Directory for runtime files (PID, logs), created with owner-only
/// permissions.
fn data_dir() -> Result<PathBuf> {
    let mut path = dirs::data_dir()
        .ok_or_else(|| ImbueError::Other("Could not find data directory".to_string()))?;
    path.push("imbue");

    std::fs::create_dir_all(&path).map_err(ImbueError::Io)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(&path, permissions).map_err(ImbueError::Io)?;
    }
    Ok(path)
}

pub fn get_pid_file_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("imbued.pid"))
}

pub fn get_log_file_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("imbued.log"))
}

/// Writes the current process PID with owner-only permissions.
pub fn write_pid_file() -> Result<()> {
    let pid_path = get_pid_file_path()?;
    std::fs::write(&pid_path, std::process::id().to_string()).map_err(ImbueError::Io)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&pid_path, permissions).map_err(ImbueError::Io)?;
    }

    info!("PID file written to {}", pid_path.display());
    Ok(())
}

pub fn remove_pid_file() -> Result<()> {
    let pid_path = get_pid_file_path()?;
    if pid_path.exists() {
        std::fs::remove_file(&pid_path).map_err(ImbueError::Io)?;
        debug!("PID file removed");
    }
    Ok(())
}

/// Returns the daemon's PID when it is running, cleaning up stale PID files.
pub fn is_daemon_running() -> Result<Option<u32>> {
    let pid_path = get_pid_file_path()?;
    if !pid_path.exists() {
        return Ok(None);
    }

    let pid_str = std::fs::read_to_string(&pid_path).map_err(ImbueError::Io)?;
    let pid: u32 = pid_str
        .trim()
        .parse()
        .map_err(|_| ImbueError::Other("Invalid PID in PID file".to_string()))?;

    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), None) {
            Ok(_) => Ok(Some(pid)),
            Err(_) => {
                // Process gone; drop the stale PID file.
                let _ = std::fs::remove_file(&pid_path);
                Ok(None)
            }
        }
    }

    #[cfg(not(unix))]
    {
        Ok(Some(pid))
    }
}
