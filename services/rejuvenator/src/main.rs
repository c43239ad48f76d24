//! spotproxy rejuvenator
//!
//! Runs one batch worker per fleet batch. Each worker rotates its share of
//! the proxy fleet every rejuvenation interval and hands attached clients
//! over to the new identity before the old one is retired.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use spotproxy_rejuvenator::handshake::broker_for;
use spotproxy_rejuvenator::health::probe_for;
use spotproxy_rejuvenator::model::Arch;
use spotproxy_rejuvenator::registry::HttpRegistry;
use spotproxy_rejuvenator::{BatchExit, Config, MockCloud, Scheduler};
use tokio::sync::watch;
use tracing::{error, info, warn};
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
        fleet_size = config.fleet_size,
        batches = config.batch_targets().len(),
        mode = %config.mode,
        interval_secs = config.rejuvenation_interval.as_secs(),
        registry_url = %config.registry_url,
        "Starting spotproxy rejuvenator"
    );

    // Cloud provider (mock for now)
    warn!("Using in-memory cloud provider; no real instances will be launched");
    let cloud = Arc::new(
        MockCloud::new()
            .with_offer("t3.micro", "us-east-1a", 0.0031, 2, &[Arch::X86_64])
            .with_offer("t4g.micro", "us-east-1b", 0.0025, 2, &[Arch::Arm64])
            .with_offer("c5.large", "us-east-1a", 0.0320, 3, &[Arch::X86_64]),
    );

    if config.in_memory_network {
        warn!("Using in-process health checks and brokers; no proxy will be contacted");
    } else {
        info!(
            health_port = config.health_port,
            broker_port = config.broker_port,
            client_migration_port = config.client_migration_port,
            "Reaching proxies over TCP"
        );
        warn!("In-memory cloud addresses are not routable; set SPOTPROXY_IN_MEMORY_NETWORK=true for dry runs");
    }
    let probe = probe_for(&config);
    let broker = broker_for(&config);

    let registry = Arc::new(
        HttpRegistry::new(&config.registry_url, Duration::from_secs(10))
            .context("failed to build registry client")?,
    );

    let release_on_shutdown = config.release_on_shutdown;
    let scheduler = Scheduler::new(config, cloud, probe, registry, broker);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = scheduler.spawn(shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        match handle.await {
            Ok(BatchExit::Shutdown { batch, live }) => {
                info!(batch, "Batch stopped");
                if let (true, Some(live)) = (release_on_shutdown, live) {
                    if let Err(e) = scheduler.release(&live).await {
                        error!(batch, error = %e, "Failed to release live generation");
                    }
                }
            }
            Ok(BatchExit::Halted {
                batch,
                error,
                live,
                unretired,
            }) => {
                error!(
                    batch,
                    reason = error.reason_code(),
                    error = %error,
                    live = %live.as_ref().map(|g| g.snapshot()).unwrap_or_default(),
                    unretired = %unretired.as_ref().map(|g| g.snapshot()).unwrap_or_default(),
                    "Batch halted earlier; reconcile these resources manually"
                );
            }
            Err(e) => error!(error = %e, "Batch task panicked"),
        }
    }

    info!("Rejuvenator shutdown complete");
    Ok(())
}
