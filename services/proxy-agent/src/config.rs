//! Proxy agent configuration.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};

/// Proxy agent configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Broker endpoint listen address.
    pub broker_addr: SocketAddr,

    /// Data-plane listen address clients connect to.
    pub data_addr: SocketAddr,

    /// Where data-plane sessions are relayed.
    pub upstream_addr: SocketAddr,

    /// Port clients listen on for migration messages.
    pub client_migration_port: u16,

    /// Connect-and-send deadline for one client notification, also used
    /// as the read deadline for broker commands.
    pub notify_timeout: Duration,

    /// Local to public address mapping for hosts behind one-to-one NAT, so
    /// the broker reports the addresses clients actually dialed.
    pub public_addrs: HashMap<IpAddr, IpAddr>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

fn addr(name: &str, default: &str) -> Result<SocketAddr> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("{name} must be an ip:port socket address"))
}

/// Parse `local=public[,local=public...]`.
pub fn parse_public_addrs(value: &str) -> Result<HashMap<IpAddr, IpAddr>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (local, public) = pair
                .split_once('=')
                .with_context(|| format!("'{pair}' is not a local=public pair"))?;
            let local = local
                .trim()
                .parse()
                .with_context(|| format!("bad local address in '{pair}'"))?;
            let public = public
                .trim()
                .parse()
                .with_context(|| format!("bad public address in '{pair}'"))?;
            Ok((local, public))
        })
        .collect()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let client_migration_port = std::env::var("SPOTPROXY_CLIENT_MIGRATION_PORT")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("SPOTPROXY_CLIENT_MIGRATION_PORT must be a port number")?
            .unwrap_or(1248);

        let notify_timeout_ms: u64 = std::env::var("SPOTPROXY_NOTIFY_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("SPOTPROXY_NOTIFY_TIMEOUT_MS must be an integer (milliseconds)")?
            .unwrap_or(2000);

        Ok(Self {
            broker_addr: addr("SPOTPROXY_BROKER_ADDR", "0.0.0.0:8121")?,
            data_addr: addr("SPOTPROXY_DATA_ADDR", "0.0.0.0:8443")?,
            upstream_addr: addr("SPOTPROXY_UPSTREAM_ADDR", "127.0.0.1:51820")?,
            client_migration_port,
            notify_timeout: Duration::from_millis(notify_timeout_ms.max(50)),
            public_addrs: std::env::var("SPOTPROXY_PUBLIC_ADDRS")
                .ok()
                .map(|v| parse_public_addrs(&v))
                .transpose()
                .context("SPOTPROXY_PUBLIC_ADDRS must be local=public address pairs")?
                .unwrap_or_default(),
            log_level: std::env::var("SPOTPROXY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}
