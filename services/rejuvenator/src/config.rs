//! Configuration for the rejuvenator.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::model::Arch;

/// Which identity a cycle replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    /// Discard and replace the compute instances.
    WholeInstance,
    /// Keep the instances, rotate the public addresses on their interfaces.
    LiveIp,
}

impl FromStr for RotationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "instance" | "whole-instance" | "whole_instance" => Ok(Self::WholeInstance),
            "liveip" | "live-ip" | "live_ip" => Ok(Self::LiveIp),
            other => bail!("unknown rotation mode '{}' (expected 'instance' or 'liveip')", other),
        }
    }
}

impl std::fmt::Display for RotationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RotationMode::WholeInstance => "instance",
            RotationMode::LiveIp => "liveip",
        })
    }
}

/// Rejuvenator configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Time between the start of consecutive cycles of one batch.
    pub rejuvenation_interval: Duration,

    /// Fleet target size: instances in whole-instance mode, addresses in live-IP mode.
    pub fleet_size: usize,

    /// Fleet members per batch worker.
    pub batch_size: usize,

    /// Lower bound on effective hourly price, if any.
    pub min_cost: Option<f64>,

    /// Upper bound on effective hourly price, if any.
    pub max_cost: Option<f64>,

    /// Allowed region prefixes; empty admits every zone.
    pub regions: Vec<String>,

    pub mode: RotationMode,

    /// Architectures our proxy image is built for.
    pub architectures: Vec<Arch>,

    /// Hourly surcharge for each interface beyond the first.
    pub interface_surcharge: f64,

    /// Wait between a fleet request and reading back its members.
    pub settle_after_create: Duration,

    /// Wait after associating fresh addresses before probing them.
    pub settle_after_rotation: Duration,

    /// Assignment registry base URL.
    pub registry_url: String,

    /// Port of the broker endpoint every proxy runs.
    pub broker_port: u16,

    /// Port clients listen on for migration messages.
    pub client_migration_port: u16,

    /// Tunnel port advertised to clients in migration messages.
    pub advertised_port: u16,

    /// Port probed by the health verifier.
    pub health_port: u16,

    pub health_timeout: Duration,
    pub health_max_attempts: u32,
    pub health_backoff: Duration,

    /// Connect-and-send deadline for one client notification.
    pub notify_timeout: Duration,

    /// Answer health checks and broker calls in-process instead of over
    /// TCP. Pairs with the in-memory cloud, whose addresses are not routable.
    pub in_memory_network: bool,

    /// Directory for per-batch JSON-lines cycle logs.
    pub cycle_log_dir: Option<PathBuf>,

    /// Retire the live generation when the process shuts down.
    pub release_on_shutdown: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{} is malformed", name))
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let fleet_size = env_parse("SPOTPROXY_FLEET_SIZE")?.unwrap_or(3);
        let batch_size = env_parse("SPOTPROXY_BATCH_SIZE")?.unwrap_or(fleet_size);

        let mode = match std::env::var("SPOTPROXY_MODE") {
            Ok(raw) => raw.parse().context("SPOTPROXY_MODE is malformed")?,
            Err(_) => RotationMode::LiveIp,
        };

        let architectures = {
            let raw = env_list("SPOTPROXY_ARCHITECTURES");
            if raw.is_empty() {
                vec![Arch::X86_64]
            } else {
                raw.iter()
                    .map(|a| a.parse())
                    .collect::<std::result::Result<Vec<Arch>, _>>()
                    .context("SPOTPROXY_ARCHITECTURES is malformed")?
            }
        };

        let broker_port = env_parse("SPOTPROXY_BROKER_PORT")?.unwrap_or(DEFAULT_BROKER_PORT);

        let config = Self {
            rejuvenation_interval: Duration::from_secs(
                env_parse("SPOTPROXY_REJUVENATION_INTERVAL_SECS")?.unwrap_or(600),
            ),
            fleet_size,
            batch_size,
            min_cost: env_parse("SPOTPROXY_MIN_COST")?,
            max_cost: env_parse("SPOTPROXY_MAX_COST")?,
            regions: env_list("SPOTPROXY_REGIONS"),
            mode,
            architectures,
            interface_surcharge: env_parse("SPOTPROXY_INTERFACE_SURCHARGE")?
                .unwrap_or(DEFAULT_INTERFACE_SURCHARGE),
            settle_after_create: Duration::from_secs(
                env_parse("SPOTPROXY_SETTLE_AFTER_CREATE_SECS")?.unwrap_or(30),
            ),
            settle_after_rotation: Duration::from_secs(
                env_parse("SPOTPROXY_SETTLE_AFTER_ROTATION_SECS")?.unwrap_or(30),
            ),
            registry_url: std::env::var("SPOTPROXY_REGISTRY_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8000".to_string()),
            broker_port,
            client_migration_port: env_parse("SPOTPROXY_CLIENT_MIGRATION_PORT")?
                .unwrap_or(DEFAULT_CLIENT_MIGRATION_PORT),
            advertised_port: env_parse("SPOTPROXY_ADVERTISED_PORT")?
                .unwrap_or(DEFAULT_ADVERTISED_PORT),
            health_port: env_parse("SPOTPROXY_HEALTH_PORT")?.unwrap_or(broker_port),
            health_timeout: Duration::from_secs(
                env_parse("SPOTPROXY_HEALTH_TIMEOUT_SECS")?.unwrap_or(5),
            ),
            health_max_attempts: env_parse("SPOTPROXY_HEALTH_MAX_ATTEMPTS")?
                .unwrap_or(spotproxy_reconcile::DEFAULT_MAX_ATTEMPTS),
            health_backoff: env_parse::<u64>("SPOTPROXY_HEALTH_BACKOFF_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(spotproxy_reconcile::DEFAULT_BACKOFF),
            notify_timeout: Duration::from_millis(
                env_parse("SPOTPROXY_NOTIFY_TIMEOUT_MS")?.unwrap_or(2000),
            ),
            in_memory_network: env_flag("SPOTPROXY_IN_MEMORY_NETWORK"),
            cycle_log_dir: std::env::var("SPOTPROXY_CYCLE_LOG_DIR")
                .ok()
                .map(PathBuf::from),
            release_on_shutdown: env_flag("SPOTPROXY_RELEASE_ON_SHUTDOWN"),
            log_level: std::env::var("SPOTPROXY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no batch worker could run with.
    pub fn validate(&self) -> Result<()> {
        if self.fleet_size == 0 {
            bail!("SPOTPROXY_FLEET_SIZE must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("SPOTPROXY_BATCH_SIZE must be at least 1");
        }
        if let (Some(min), Some(max)) = (self.min_cost, self.max_cost) {
            if min > max {
                bail!("SPOTPROXY_MIN_COST ({}) exceeds SPOTPROXY_MAX_COST ({})", min, max);
            }
        }
        if self.health_max_attempts == 0 {
            bail!("SPOTPROXY_HEALTH_MAX_ATTEMPTS must be at least 1");
        }
        if self.architectures.is_empty() {
            bail!("SPOTPROXY_ARCHITECTURES must name at least one architecture");
        }
        if self.interface_surcharge < 0.0 {
            bail!("SPOTPROXY_INTERFACE_SURCHARGE must not be negative");
        }
        Ok(())
    }

    /// Targets of each batch worker; the last batch takes the remainder.
    pub fn batch_targets(&self) -> Vec<usize> {
        let batch = self.batch_size.max(1);
        (0..self.fleet_size.div_ceil(batch))
            .map(|i| batch.min(self.fleet_size - i * batch))
            .collect()
    }

    /// Settings suited to tests: short waits, loopback registry.
    pub fn for_tests(mode: RotationMode, fleet_size: usize) -> Self {
        Self {
            rejuvenation_interval: Duration::from_secs(60),
            fleet_size,
            batch_size: fleet_size,
            min_cost: None,
            max_cost: None,
            regions: Vec::new(),
            mode,
            architectures: vec![Arch::X86_64],
            interface_surcharge: DEFAULT_INTERFACE_SURCHARGE,
            settle_after_create: Duration::ZERO,
            settle_after_rotation: Duration::ZERO,
            registry_url: "http://127.0.0.1:8000".to_string(),
            broker_port: DEFAULT_BROKER_PORT,
            client_migration_port: DEFAULT_CLIENT_MIGRATION_PORT,
            advertised_port: DEFAULT_ADVERTISED_PORT,
            health_port: DEFAULT_BROKER_PORT,
            health_timeout: Duration::from_millis(200),
            health_max_attempts: 1,
            health_backoff: Duration::ZERO,
            notify_timeout: Duration::from_millis(500),
            in_memory_network: true,
            cycle_log_dir: None,
            release_on_shutdown: false,
            log_level: "debug".to_string(),
        }
    }
}

/// Hourly surcharge per additional network interface.
pub const DEFAULT_INTERFACE_SURCHARGE: f64 = 0.005;

/// Proxy broker endpoint port.
pub const DEFAULT_BROKER_PORT: u16 = 8121;

/// Client migration listener port.
pub const DEFAULT_CLIENT_MIGRATION_PORT: u16 = 1248;

/// WireGuard listen port advertised to clients.
pub const DEFAULT_ADVERTISED_PORT: u16 = 51820;
