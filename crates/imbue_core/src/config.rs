use crate::{ImbueError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImbueConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub clipboard: ClipboardConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name for this host shown in peer lists.
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP listen address.
    pub addr: String,
    /// Shared secret: bearer credential and wire-encryption key.
    /// Unset means unauthenticated plaintext.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Disable the local clipboard peer (relay/hub-only mode).
    #[serde(default)]
    pub no_local: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipboardConfig {
    /// `auto`, `system`, or `noop`.
    pub backend: String,
    pub poll_interval_ms: u64,
    pub max_item_bytes: usize,
}

/// Presence of this section enables federation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Defaults to the server token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Defaults to the node source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

pub const DEFAULT_PORT: u16 = 9611;

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            source: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            token: None,
            no_local: false,
        }
    }
}

impl Default for ClipboardConfig {
    fn default() -> Self {
        Self {
            backend: "auto".to_string(),
            poll_interval_ms: 500,
            max_item_bytes: 8 * 1024 * 1024,
        }
    }
}

impl ImbueConfig {
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|d| d.join("imbue"))
            .ok_or_else(|| ImbueError::Config("Unable to determine config directory".to_string()))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub async fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            let config = Self::default();
            config.save().await?;
            return Ok(config);
        }
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = fs::read_to_string(path).await?;
        let config: ImbueConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let config_dir = Self::config_dir()?;
        fs::create_dir_all(&config_dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(&config_dir, permissions)?;
        }

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ImbueError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(&path, contents).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, permissions)?;
        }

        Ok(())
    }

    /// Address client tools should dial for a broker using this config:
    /// the listen address with wildcard hosts mapped to loopback.
    pub fn client_addr(&self) -> String {
        let addr = &self.server.addr;
        match addr.strip_prefix("0.0.0.0:") {
            Some(port) => format!("127.0.0.1:{}", port),
            None => match addr.strip_prefix("[::]:") {
                Some(port) => format!("127.0.0.1:{}", port),
                None => addr.clone(),
            },
        }
    }

    /// Fully-resolved upstream settings, applying the token/source fallbacks.
    pub fn upstream_settings(&self) -> Option<(String, Option<String>, String)> {
        self.upstream.as_ref().map(|up| {
            (
                format!("{}:{}", up.host, up.port),
                up.token.clone().or_else(|| self.server.token.clone()),
                up.source.clone().unwrap_or_else(|| self.node.source.clone()),
            )
        })
    }
}
