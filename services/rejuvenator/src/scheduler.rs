//! Batch workers and the scheduler that runs them.
//!
//! The fleet is split into batches; each batch gets one worker task that
//! runs its cycles strictly one after another:
//!
//! ```text
//! build -> verify -> handshake (registry, clients, drain, retire) -> sleep
//! ```
//!
//! Batches run in parallel and share nothing but the cloud provider, the
//! registry and the broker directory. A worker only ever holds two
//! generations: the one serving and the one being built.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use spotproxy_id::CycleSeq;
use spotproxy_proto::TopologyUpdate;
use spotproxy_reconcile::{
    RetryPolicy, RetryTracker, DEFAULT_CLIENT_FAILURE_WINDOW, DEFAULT_MAX_CLIENT_FAILURES,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::cloud::CloudProvider;
use crate::config::Config;
use crate::cycle_log::{CycleLog, CycleOutcome, CycleRecord};
use crate::decommission::Decommissioner;
use crate::error::CycleError;
use crate::handshake::{Broker, HandshakeReport, HandshakeSettings, MigrationHandshake};
use crate::health::{HealthVerifier, Probe};
use crate::model::{Generation, NodeState};
use crate::registry::Registry;
use crate::rotator::{self, IdentityRotator};

/// A completed cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub seq: CycleSeq,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub handshake: HandshakeReport,
}

/// Why a batch worker stopped.
#[derive(Debug)]
pub enum BatchExit {
    Shutdown {
        batch: usize,
        live: Option<Generation>,
    },
    /// A fatal error stopped the batch. `unretired` holds a generation the
    /// handshake could not retire.
    Halted {
        batch: usize,
        error: CycleError,
        live: Option<Generation>,
        unretired: Option<Generation>,
    },
}

/// A failed cycle and the generation it was building, if any.
struct Failed {
    error: CycleError,
    generation: Option<Generation>,
}

impl From<CycleError> for Failed {
    fn from(error: CycleError) -> Self {
        Self {
            error,
            generation: None,
        }
    }
}

pub struct BatchWorker {
    batch: usize,
    target: usize,
    interval: Duration,
    rotator: Box<dyn IdentityRotator>,
    verifier: HealthVerifier,
    handshake: MigrationHandshake,
    decommissioner: Arc<Decommissioner>,
    seq: CycleSeq,
    current: Option<Generation>,
    unretired: Option<Generation>,
    client_failures: RetryTracker,
    cycle_log: Option<CycleLog>,
}

impl BatchWorker {
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Sequence number the next cycle will run under.
    pub fn seq(&self) -> CycleSeq {
        self.seq
    }

    /// The generation currently serving.
    pub fn current(&self) -> Option<&Generation> {
        self.current.as_ref()
    }

    /// Run cycles on the interval until shutdown or a fatal error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> BatchExit {
        info!(
            batch = self.batch,
            target = self.target,
            mode = %self.rotator.mode(),
            interval_secs = self.interval.as_secs(),
            "Starting batch worker"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.run_cycle().await {
                        if error.is_fatal() {
                            return BatchExit::Halted {
                                batch: self.batch,
                                error,
                                live: self.current.take(),
                                unretired: self.unretired.take(),
                            };
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(batch = self.batch, "Batch worker shutting down");
                        return BatchExit::Shutdown {
                            batch: self.batch,
                            live: self.current.take(),
                        };
                    }
                }
            }
        }
    }

    /// Run one full cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        let seq = self.seq;
        self.seq = seq.next();
        let started_at = Utc::now();
        info!(
            batch = self.batch,
            cycle = %seq,
            target = self.target,
            bootstrap = self.current.is_none(),
            "Starting rejuvenation cycle"
        );

        match self.attempt(seq).await {
            Ok(handshake) => {
                self.track_clients(&handshake);
                let finished_at = Utc::now();
                let failed: Vec<String> = handshake
                    .failed()
                    .map(|n| n.client.to_string())
                    .collect();
                self.append(CycleRecord {
                    batch: self.batch,
                    cycle: seq.value(),
                    started_at,
                    finished_at,
                    outcome: CycleOutcome::Completed,
                    reason: None,
                    error: None,
                    generation: self.current.as_ref(),
                    notified_clients: handshake.delivered().count(),
                    failed_clients: failed,
                    decommission: Some(&handshake.decommission),
                })
                .await;

                info!(
                    batch = self.batch,
                    cycle = %seq,
                    addresses = self.current.as_ref().map_or(0, |g| g.nics().count()),
                    notified = handshake.delivered().count(),
                    failed = handshake.failed().count(),
                    released = handshake.decommission.released,
                    terminated = handshake.decommission.terminated.len(),
                    "Cycle complete"
                );
                Ok(CycleReport {
                    seq,
                    started_at,
                    finished_at,
                    handshake,
                })
            }
            Err(Failed { error, generation }) => {
                let outcome = if error.is_fatal() {
                    CycleOutcome::Halted
                } else {
                    CycleOutcome::Aborted
                };

                if error.is_escalated() {
                    error!(
                        batch = self.batch,
                        cycle = %seq,
                        reason = error.reason_code(),
                        error = %error,
                        generation = %generation.as_ref().map(Generation::snapshot).unwrap_or_default(),
                        serving = %self.current.as_ref().map(Generation::snapshot).unwrap_or_default(),
                        unretired = %self.unretired.as_ref().map(Generation::snapshot).unwrap_or_default(),
                        "Cycle failed; external state may need manual reconciliation"
                    );
                } else {
                    warn!(
                        batch = self.batch,
                        cycle = %seq,
                        reason = error.reason_code(),
                        error = %error,
                        "Cycle aborted; previous generation keeps serving"
                    );
                }

                self.append(CycleRecord {
                    batch: self.batch,
                    cycle: seq.value(),
                    started_at,
                    finished_at: Utc::now(),
                    outcome,
                    reason: Some(error.reason_code()),
                    error: Some(error.to_string()),
                    generation: generation.as_ref(),
                    notified_clients: 0,
                    failed_clients: Vec::new(),
                    decommission: None,
                })
                .await;
                Err(error)
            }
        }
    }

    async fn attempt(&mut self, seq: CycleSeq) -> Result<HandshakeReport, Failed> {
        let generation = self
            .rotator
            .build_generation(seq, self.target, self.current.as_ref())
            .await?;

        let verified = match self.verifier.gate(generation).await {
            Ok(verified) => verified,
            Err((generation, error)) => return Err(self.abandon(generation, error).await),
        };

        match self.handshake.execute(self.current.as_ref(), &verified).await {
            Ok(report) => {
                let mut next = verified.into_inner();
                next.set_state(NodeState::Serving);
                self.current = Some(next);
                Ok(report)
            }
            Err(error @ CycleError::RegistryNotificationFailed(_)) => {
                Err(self.abandon(verified.into_inner(), error).await)
            }
            Err(error) => {
                // Clients were already pointed at the new generation.
                let mut next = verified.into_inner();
                next.set_state(NodeState::Serving);
                self.unretired = self.current.replace(next);
                Err(Failed {
                    error,
                    generation: self.current.clone(),
                })
            }
        }
    }

    /// Tear down a generation no dependent was told about.
    async fn abandon(&self, mut generation: Generation, error: CycleError) -> Failed {
        warn!(
            batch = self.batch,
            cycle = %generation.seq,
            reason = error.reason_code(),
            "Tearing down new generation"
        );
        match self
            .decommissioner
            .decommission(&generation, self.current.as_ref())
            .await
        {
            Ok(_) => {
                generation.set_state(NodeState::Retired);
                Failed {
                    error,
                    generation: Some(generation),
                }
            }
            Err(e) => {
                error!(batch = self.batch, cause = %error, error = %e, "Teardown of new generation failed");
                Failed {
                    error: CycleError::teardown_failed(error, e),
                    generation: Some(generation),
                }
            }
        }
    }

    fn track_clients(&mut self, report: &HandshakeReport) {
        self.client_failures.prune();
        for notification in &report.notifications {
            let key = notification.client.ip().to_string();
            if notification.delivered() {
                self.client_failures.clear(&key);
            } else if self.client_failures.record_failure(&key) {
                error!(
                    batch = self.batch,
                    client = %notification.client,
                    "Client keeps missing migration messages"
                );
            }
        }
    }

    async fn append(&self, record: CycleRecord<'_>) {
        let Some(log) = &self.cycle_log else {
            return;
        };
        if let Err(e) = log.append(&record).await {
            warn!(path = %log.path().display(), error = %e, "Failed to append cycle record");
        }
    }
}

/// Builds one worker per batch and spawns them.
pub struct Scheduler {
    config: Config,
    cloud: Arc<dyn CloudProvider>,
    probe: Arc<dyn Probe>,
    registry: Arc<dyn Registry>,
    broker: Arc<dyn Broker>,
    decommissioner: Arc<Decommissioner>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        cloud: Arc<dyn CloudProvider>,
        probe: Arc<dyn Probe>,
        registry: Arc<dyn Registry>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let decommissioner = Arc::new(Decommissioner::new(Arc::clone(&cloud)));
        Self {
            config,
            cloud,
            probe,
            registry,
            broker,
            decommissioner,
        }
    }

    pub fn worker(&self, batch: usize, target: usize) -> BatchWorker {
        let config = &self.config;
        BatchWorker {
            batch,
            target,
            interval: config.rejuvenation_interval,
            rotator: rotator::for_config(
                Arc::clone(&self.cloud),
                config,
                Arc::clone(&self.decommissioner),
            ),
            verifier: HealthVerifier::new(
                Arc::clone(&self.probe),
                RetryPolicy::fixed(config.health_max_attempts, config.health_backoff),
            ),
            handshake: MigrationHandshake::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.broker),
                Arc::clone(&self.decommissioner),
                HandshakeSettings {
                    advertised_port: config.advertised_port,
                    notify_timeout: config.notify_timeout,
                    drain_scope: config.mode.into(),
                },
            ),
            decommissioner: Arc::clone(&self.decommissioner),
            seq: CycleSeq::FIRST,
            current: None,
            unretired: None,
            client_failures: RetryTracker::new(
                DEFAULT_MAX_CLIENT_FAILURES,
                DEFAULT_CLIENT_FAILURE_WINDOW,
            ),
            cycle_log: config
                .cycle_log_dir
                .as_deref()
                .map(|dir| CycleLog::new(dir, batch)),
        }
    }

    /// Spawn one worker task per batch.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<BatchExit>> {
        self.config
            .batch_targets()
            .into_iter()
            .enumerate()
            .map(|(batch, target)| {
                let worker = self.worker(batch, target);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(shutdown).await })
            })
            .collect()
    }

    /// Withdraw a live generation from the registry and decommission it.
    pub async fn release(&self, live: &Generation) -> Result<(), CycleError> {
        let addresses = live.addresses().iter().map(ToString::to_string).collect();
        if let Err(e) = self
            .registry
            .update_topology(&TopologyUpdate::remove(addresses))
            .await
        {
            warn!(cycle = %live.seq, error = %e, "Registry removal failed; releasing anyway");
        }

        let summary = self
            .decommissioner
            .decommission(live, None)
            .await
            .map_err(CycleError::RetirementFailed)?;
        info!(
            cycle = %live.seq,
            released = summary.released,
            terminated = summary.terminated.len(),
            "Released live generation"
        );
        Ok(())
    }
}
