//! Tunnel backends.
//!
//! A backend points the local tunnel at a new proxy endpoint. The WireGuard
//! backend rewrites the `wg-quick` file in full (temp file plus rename)
//! before restarting the interface, so the restarted tunnel only ever sees
//! a complete configuration.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use spotproxy_networking::{NetworkError, WgConfig, WIREGUARD_DEFAULT_PORT};
use spotproxy_proto::Endpoint;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel config i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel config: {0}")]
    Config(#[from] NetworkError),

    #[error("{command} failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("tunnel backend unavailable: {0}")]
    Unavailable(String),
}

/// Applies a new peer endpoint to the local tunnel.
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Point the tunnel at `endpoint` and restart it. Returns the previous
    /// peer endpoint, if there was one.
    async fn apply(&self, endpoint: &Endpoint) -> Result<Option<String>, TunnelError>;
}

/// Rewrites a `wg-quick` config and bounces the interface.
#[derive(Debug, Clone)]
pub struct WireGuardBackend {
    config_path: PathBuf,
    interface: String,
    wg_quick: PathBuf,
}

impl WireGuardBackend {
    pub fn new(config_path: PathBuf, interface: String, wg_quick: PathBuf) -> Self {
        Self {
            config_path,
            interface,
            wg_quick,
        }
    }

    /// Rewrite the peer endpoint on disk without touching the interface.
    pub async fn rewrite(&self, endpoint: &Endpoint) -> Result<Option<String>, TunnelError> {
        let text = tokio::fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| io_error(&self.config_path, e))?;
        let mut config = WgConfig::parse(&text)?;
        let target = endpoint.socket_addr(WIREGUARD_DEFAULT_PORT).to_string();
        let previous = config.set_peer_endpoint(&target)?;

        let tmp = temp_path(&self.config_path);
        tokio::fs::write(&tmp, config.render())
            .await
            .map_err(|e| io_error(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.config_path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(&self.config_path, e));
        }

        debug!(
            path = %self.config_path.display(),
            previous = previous.as_deref().unwrap_or(""),
            endpoint = %target,
            "Tunnel config rewritten"
        );
        Ok(previous)
    }

    async fn wg_quick(&self, action: &str) -> Result<Output, TunnelError> {
        Command::new(&self.wg_quick)
            .arg(action)
            .arg(&self.interface)
            .output()
            .await
            .map_err(|e| io_error(&self.wg_quick, e))
    }

    async fn restart(&self) -> Result<(), TunnelError> {
        // `down` fails when the interface is not up yet.
        let down = self.wg_quick("down").await?;
        if !down.status.success() {
            warn!(
                interface = %self.interface,
                stderr = %String::from_utf8_lossy(&down.stderr).trim(),
                "wg-quick down failed; bringing the interface up anyway"
            );
        }

        let up = self.wg_quick("up").await?;
        if !up.status.success() {
            return Err(TunnelError::Command {
                command: format!("{} up {}", self.wg_quick.display(), self.interface),
                status: up.status.to_string(),
                stderr: String::from_utf8_lossy(&up.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelBackend for WireGuardBackend {
    async fn apply(&self, endpoint: &Endpoint) -> Result<Option<String>, TunnelError> {
        let previous = self.rewrite(endpoint).await?;
        self.restart().await?;
        info!(interface = %self.interface, endpoint = %endpoint, "Tunnel restarted");
        Ok(previous)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn io_error(path: &Path, source: std::io::Error) -> TunnelError {
    TunnelError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// In-memory backend that records every applied endpoint.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    applied: Mutex<Vec<Endpoint>>,
    fail: bool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose every apply fails.
    pub fn failing() -> Self {
        Self {
            applied: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub async fn applied(&self) -> Vec<Endpoint> {
        self.applied.lock().await.clone()
    }
}

#[async_trait]
impl TunnelBackend for RecordingBackend {
    async fn apply(&self, endpoint: &Endpoint) -> Result<Option<String>, TunnelError> {
        if self.fail {
            return Err(TunnelError::Unavailable("[MOCK] backend down".to_string()));
        }
        info!(endpoint = %endpoint, "[MOCK] Applying endpoint");
        let mut applied = self.applied.lock().await;
        let previous = applied.last().map(|e| e.to_string());
        applied.push(*endpoint);
        Ok(previous)
    }
}
