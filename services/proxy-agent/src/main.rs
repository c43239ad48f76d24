//! spotproxy proxy agent
//!
//! Serves the broker endpoint and the drainable data-plane relay until
//! interrupted.

use anyhow::{Context, Result};
use spotproxy_proxy_agent::{BrokerServer, Config, DataPlane, SessionRegistry};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        broker_addr = %config.broker_addr,
        data_addr = %config.data_addr,
        upstream_addr = %config.upstream_addr,
        client_migration_port = config.client_migration_port,
        public_addrs = config.public_addrs.len(),
        "Starting spotproxy proxy agent"
    );

    let sessions = SessionRegistry::new();
    let broker = BrokerServer::bind(
        config.broker_addr,
        sessions.clone(),
        config.client_migration_port,
        config.notify_timeout,
    )
    .await
    .context("failed to bind broker endpoint")?;
    let data_plane = DataPlane::bind(config.data_addr, config.upstream_addr, sessions)
        .await
        .context("failed to bind data plane")?
        .with_public_addresses(config.public_addrs.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let broker_handle = tokio::spawn(broker.run(shutdown_rx.clone()));
    let data_handle = tokio::spawn(data_plane.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    for (name, handle) in [("broker", broker_handle), ("data_plane", data_handle)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task panicked");
        }
    }

    info!("Proxy agent shutdown complete");
    Ok(())
}
