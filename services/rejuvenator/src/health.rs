//! Reachability verification of freshly built generations.
//!
//! A generation only becomes a [`VerifiedGeneration`] by passing
//! [`HealthVerifier::gate`]; the migration handshake accepts nothing else,
//! so unreachable infrastructure can never be advertised to clients.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use spotproxy_reconcile::{retry, RetryOutcome, RetryPolicy};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::CycleError;
use crate::model::{Generation, NodeState};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no answer within {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("address {0} is marked unreachable")]
    Unreachable(IpAddr),
}

/// A single reachability check.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, address: IpAddr) -> Result<(), ProbeError>;
}

/// Probe for the configured network: TCP connects to the health port, or
/// an in-process probe where every address answers.
pub fn probe_for(config: &Config) -> Arc<dyn Probe> {
    if config.in_memory_network {
        Arc::new(StaticProbe::reachable())
    } else {
        Arc::new(TcpProbe::new(config.health_port, config.health_timeout))
    }
}

/// TCP connect probe against a fixed port.
pub struct TcpProbe {
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, address: IpAddr) -> Result<(), ProbeError> {
        let addr = SocketAddr::new(address, self.port);
        match timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ProbeError::Connect(e)),
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }
}

/// Probe with a fixed answer per address, for tests and the mock provider.
#[derive(Default)]
pub struct StaticProbe {
    unreachable: Mutex<HashSet<IpAddr>>,
    /// When set, nothing answers.
    blackout: AtomicBool,
    probed: Mutex<Vec<IpAddr>>,
}

impl StaticProbe {
    /// Every address answers.
    pub fn reachable() -> Self {
        Self::default()
    }

    pub async fn mark_unreachable(&self, address: IpAddr) {
        self.unreachable.lock().await.insert(address);
    }

    pub async fn mark_reachable(&self, address: IpAddr) {
        self.unreachable.lock().await.remove(&address);
    }

    pub fn set_blackout(&self, on: bool) {
        self.blackout.store(on, Ordering::SeqCst);
    }

    /// Every probe made so far, in order.
    pub async fn probed(&self) -> Vec<IpAddr> {
        self.probed.lock().await.clone()
    }
}

#[async_trait]
impl Probe for StaticProbe {
    async fn probe(&self, address: IpAddr) -> Result<(), ProbeError> {
        self.probed.lock().await.push(address);
        if self.blackout.load(Ordering::SeqCst) || self.unreachable.lock().await.contains(&address) {
            return Err(ProbeError::Unreachable(address));
        }
        Ok(())
    }
}

/// A generation whose every primary address answered a probe.
#[derive(Debug, Clone)]
pub struct VerifiedGeneration(Generation);

impl VerifiedGeneration {
    pub fn generation(&self) -> &Generation {
        &self.0
    }

    pub fn into_inner(self) -> Generation {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn for_tests(generation: Generation) -> Self {
        Self(generation)
    }
}

pub struct HealthVerifier {
    probe: Arc<dyn Probe>,
    policy: RetryPolicy,
}

impl HealthVerifier {
    pub fn new(probe: Arc<dyn Probe>, policy: RetryPolicy) -> Self {
        Self { probe, policy }
    }

    /// Probe each address with bounded retries; returns the addresses that
    /// never answered, in input order.
    pub async fn verify(&self, addresses: &[IpAddr]) -> Vec<IpAddr> {
        let probes = addresses.iter().map(|&address| async move {
            let outcome = retry(&self.policy, |attempt| {
                debug!(address = %address, attempt, "Probing");
                self.probe.probe(address)
            })
            .await;
            match outcome {
                RetryOutcome::Succeeded { attempts, .. } => {
                    debug!(address = %address, attempts, "Address reachable");
                    None
                }
                RetryOutcome::Exhausted {
                    last_error,
                    attempts,
                } => {
                    warn!(address = %address, attempts, error = %last_error, "Address unreachable");
                    Some(address)
                }
            }
        });

        join_all(probes).await.into_iter().flatten().collect()
    }

    /// Verify a generation's primary addresses. On failure the generation is
    /// handed back with the error so the caller can tear it down.
    pub async fn gate(
        &self,
        mut generation: Generation,
    ) -> Result<VerifiedGeneration, (Generation, CycleError)> {
        let addresses = generation.primary_addresses();
        let unreachable = self.verify(&addresses).await;
        if !unreachable.is_empty() {
            return Err((
                generation,
                CycleError::UnreachableNewIdentity {
                    addresses: unreachable,
                },
            ));
        }

        info!(
            generation = %generation.seq,
            addresses = addresses.len(),
            "Generation verified"
        );
        generation.set_state(NodeState::Verified);
        Ok(VerifiedGeneration(generation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{nic, node};
    use spotproxy_id::CycleSeq;
    use tokio::net::TcpListener;

    fn generation() -> Generation {
        Generation::new(
            CycleSeq::FIRST,
            vec![
                node(
                    0,
                    "i-1",
                    "eni-1",
                    vec![nic("eni-2", "198.51.100.2", true), nic("eni-1", "198.51.100.1", true)],
                ),
                node(1, "i-2", "eni-3", vec![nic("eni-3", "198.51.100.3", true)]),
            ],
            None,
        )
    }

    #[tokio::test]
    async fn test_probe_for_configured_network() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();

        let mut config = Config::for_tests(crate::config::RotationMode::LiveIp, 1);
        config.in_memory_network = false;
        config.health_port = open;
        assert!(probe_for(&config).probe(loopback).await.is_ok());
        config.health_port = closed;
        assert!(probe_for(&config).probe(loopback).await.is_err());

        // In-process: nothing is dialed, so the closed port still answers.
        config.in_memory_network = true;
        assert!(probe_for(&config).probe(loopback).await.is_ok());
    }

    #[tokio::test]
    async fn test_probes_primary_addresses_only() {
        let probe = Arc::new(StaticProbe::reachable());
        let verifier = HealthVerifier::new(probe.clone(), RetryPolicy::once());

        let verified = verifier.gate(generation()).await.unwrap();
        assert!(verified
            .generation()
            .nodes
            .iter()
            .all(|n| n.state == NodeState::Verified));

        let mut probed = probe.probed().await;
        probed.sort();
        assert_eq!(
            probed,
            vec![
                "198.51.100.1".parse::<IpAddr>().unwrap(),
                "198.51.100.3".parse().unwrap()
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_after_all_attempts() {
        let probe = Arc::new(StaticProbe::reachable());
        let bad: IpAddr = "198.51.100.3".parse().unwrap();
        probe.mark_unreachable(bad).await;
        let verifier = HealthVerifier::new(
            probe.clone(),
            RetryPolicy::fixed(3, Duration::from_secs(10)),
        );

        let (returned, err) = verifier.gate(generation()).await.unwrap_err();
        assert_eq!(returned.seq, CycleSeq::FIRST);
        assert!(matches!(
            err,
            CycleError::UnreachableNewIdentity { ref addresses } if addresses == &vec![bad]
        ));
        let attempts = probe.probed().await.iter().filter(|a| **a == bad).count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::new(port, Duration::from_secs(1));
        assert!(probe.probe("127.0.0.1".parse().unwrap()).await.is_ok());

        drop(listener);
        assert!(probe.probe("127.0.0.1".parse().unwrap()).await.is_err());
    }
}
