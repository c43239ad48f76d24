//! spotproxy client agent
//!
//! Applies migration messages from the proxy fleet to the local WireGuard
//! tunnel until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use spotproxy_client_agent::{Config, MigrationListener, WireGuardBackend};
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
        migration_addr = %config.migration_addr,
        wg_config = %config.wg_config.display(),
        wg_interface = %config.wg_interface,
        "Starting spotproxy client agent"
    );

    let backend = Arc::new(WireGuardBackend::new(
        config.wg_config.clone(),
        config.wg_interface.clone(),
        config.wg_quick.clone(),
    ));
    let listener = MigrationListener::bind(config.migration_addr, backend, config.read_timeout)
        .await
        .context("failed to bind migration listener")?;

    // Stand-in for the local data-plane user: follow the published endpoint.
    let mut endpoints = listener.subscribe();
    let follower = tokio::spawn(async move {
        while endpoints.changed().await.is_ok() {
            if let Some(endpoint) = *endpoints.borrow_and_update() {
                info!(endpoint = %endpoint, "Tunnel now points at new proxy");
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(listener.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    if let Err(e) = handle.await {
        error!(error = %e, "Migration listener panicked");
    }
    follower.abort();

    info!("Client agent shutdown complete");
    Ok(())
}
