//! Client agent configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Client agent configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the migration listener binds to.
    pub migration_addr: SocketAddr,

    /// `wg-quick` configuration file rewritten on migration.
    pub wg_config: PathBuf,

    /// Tunnel interface restarted after a rewrite.
    pub wg_interface: String,

    /// `wg-quick` executable.
    pub wg_quick: PathBuf,

    /// How long a sender may take to deliver its one line.
    pub read_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let migration_addr = std::env::var("SPOTPROXY_MIGRATION_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:1248".to_string())
            .parse()
            .context("SPOTPROXY_MIGRATION_ADDR must be an ip:port socket address")?;

        let read_timeout_ms: u64 = std::env::var("SPOTPROXY_MIGRATION_READ_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("SPOTPROXY_MIGRATION_READ_TIMEOUT_MS must be an integer (milliseconds)")?
            .unwrap_or(2000);

        let wg_interface =
            std::env::var("SPOTPROXY_WG_INTERFACE").unwrap_or_else(|_| "wg0".to_string());
        if wg_interface.is_empty() || wg_interface.contains('/') {
            anyhow::bail!("SPOTPROXY_WG_INTERFACE must be a bare interface name");
        }

        let wg_config = std::env::var("SPOTPROXY_WG_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(format!("/etc/wireguard/{wg_interface}.conf")));

        Ok(Self {
            migration_addr,
            wg_config,
            wg_interface,
            wg_quick: std::env::var("SPOTPROXY_WG_QUICK")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("wg-quick")),
            read_timeout: Duration::from_millis(read_timeout_ms.max(50)),
            log_level: std::env::var("SPOTPROXY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}
