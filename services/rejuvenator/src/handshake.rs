//! Migration handshake between the engine, the registry, proxies and clients.
//!
//! One handshake runs per cycle, after the new generation passed the health
//! gate. Its state only moves forward:
//!
//! ```text
//! Idle -> AwaitingNewIdentity -> NotifyingRegistry -> NotifyingClients -> Draining -> Retired
//! ```
//!
//! A registry failure aborts before any client hears about the new identity.
//! Client notification is best-effort per client. Retirement of the
//! previous generation only starts once every notification attempt has
//! finished.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use spotproxy_proto::{
    notify_client, send_command, Attachment, BrokerCommand, Endpoint, MigrationMessage,
    ProtoError, TopologyUpdate, UpdateKind,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, RotationMode};
use crate::decommission::{DecommissionSummary, Decommissioner};
use crate::error::{ClientNotificationFailed, CycleError, RegistryError};
use crate::health::VerifiedGeneration;
use crate::model::Generation;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    Idle,
    AwaitingNewIdentity,
    NotifyingRegistry,
    NotifyingClients,
    Draining,
    Retired,
}

impl HandshakeState {
    /// The only state reachable from this one.
    pub fn successor(self) -> Option<Self> {
        match self {
            HandshakeState::Idle => Some(HandshakeState::AwaitingNewIdentity),
            HandshakeState::AwaitingNewIdentity => Some(HandshakeState::NotifyingRegistry),
            HandshakeState::NotifyingRegistry => Some(HandshakeState::NotifyingClients),
            HandshakeState::NotifyingClients => Some(HandshakeState::Draining),
            HandshakeState::Draining => Some(HandshakeState::Retired),
            HandshakeState::Retired => None,
        }
    }
}

/// Forward-only state tracker with a timestamp per entered state.
#[derive(Debug)]
pub struct HandshakeMachine {
    state: HandshakeState,
    transitions: Vec<(HandshakeState, Instant)>,
}

impl HandshakeMachine {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
            transitions: vec![(HandshakeState::Idle, Instant::now())],
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn advance(&mut self, to: HandshakeState) -> Result<(), CycleError> {
        if self.state.successor() != Some(to) {
            return Err(CycleError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!(from = ?self.state, to = ?to, "Handshake transition");
        self.state = to;
        self.transitions.push((to, Instant::now()));
        Ok(())
    }

    pub fn into_transitions(self) -> Vec<(HandshakeState, Instant)> {
        self.transitions
    }
}

impl Default for HandshakeMachine {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Broker: per-proxy client discovery and draining
// =============================================================================

/// A client attached to a proxy, as reported by its broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscoveredClient {
    /// Where the client listens for migration messages.
    pub addr: SocketAddr,
    /// Proxy address the client's session arrived on, when known.
    pub via: Option<IpAddr>,
}

impl From<SocketAddr> for DiscoveredClient {
    fn from(addr: SocketAddr) -> Self {
        Self { addr, via: None }
    }
}

/// Control channel to the broker each proxy runs next to its data plane.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Clients attached to the proxy at `proxy`.
    async fn attached_clients(&self, proxy: IpAddr) -> Result<Vec<DiscoveredClient>, ProtoError>;

    /// Close the data-plane sessions of `clients`. An empty list closes
    /// every session and stops the proxy accepting new ones.
    async fn drain(&self, proxy: IpAddr, clients: &[IpAddr]) -> Result<(), ProtoError>;
}

/// Broker reached over its line protocol.
pub struct TcpBroker {
    broker_port: u16,
    client_port: u16,
    timeout: Duration,
}

impl TcpBroker {
    pub fn new(broker_port: u16, client_port: u16, timeout: Duration) -> Self {
        Self {
            broker_port,
            client_port,
            timeout,
        }
    }
}

#[async_trait]
impl Broker for TcpBroker {
    async fn attached_clients(&self, proxy: IpAddr) -> Result<Vec<DiscoveredClient>, ProtoError> {
        let broker = SocketAddr::new(proxy, self.broker_port);
        let lines = send_command(broker, &BrokerCommand::Clients, self.timeout).await?;

        let mut clients = Vec::with_capacity(lines.len());
        for line in lines {
            match Attachment::parse(&line) {
                Ok(a) => clients.push(DiscoveredClient {
                    addr: SocketAddr::new(a.client, self.client_port),
                    via: a.via,
                }),
                Err(e) => warn!(
                    proxy = %proxy,
                    line = %line,
                    error = %e,
                    "Ignoring malformed client entry"
                ),
            }
        }
        Ok(clients)
    }

    /// Sends as many `drain` lines as the client list needs.
    async fn drain(&self, proxy: IpAddr, clients: &[IpAddr]) -> Result<(), ProtoError> {
        let broker = SocketAddr::new(proxy, self.broker_port);
        let batches = BrokerCommand::drain_batches(clients);
        let count = batches.len();
        for (i, batch) in batches.iter().enumerate() {
            send_command(broker, batch, self.timeout).await?;
            debug!(proxy = %proxy, batch = i + 1, of = count, "Drain sent");
        }
        Ok(())
    }
}

/// Broker for the configured network: the proxies' TCP endpoints, or an
/// in-process directory with no attached clients.
pub fn broker_for(config: &Config) -> Arc<dyn Broker> {
    if config.in_memory_network {
        Arc::new(StaticBroker::new())
    } else {
        Arc::new(TcpBroker::new(
            config.broker_port,
            config.client_migration_port,
            config.notify_timeout,
        ))
    }
}

/// One drain request seen by a [`StaticBroker`].
#[derive(Debug, Clone)]
pub struct DrainRecord {
    pub proxy: IpAddr,
    pub clients: Vec<IpAddr>,
    pub at: Instant,
}

/// In-memory broker directory for tests and dry runs.
#[derive(Default)]
pub struct StaticBroker {
    clients: Mutex<HashMap<IpAddr, Vec<DiscoveredClient>>>,
    unreachable: HashSet<IpAddr>,
    drains: Mutex<Vec<DrainRecord>>,
}

impl StaticBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clients(mut self, proxy: IpAddr, clients: Vec<SocketAddr>) -> Self {
        self.clients
            .get_mut()
            .insert(proxy, clients.into_iter().map(Into::into).collect());
        self
    }

    /// Replace the clients attached to `proxy`, arrival address unknown.
    pub async fn set_clients(&self, proxy: IpAddr, clients: Vec<SocketAddr>) {
        self.set_attached(proxy, clients.into_iter().map(Into::into).collect())
            .await;
    }

    /// Replace the clients attached to `proxy`.
    pub async fn set_attached(&self, proxy: IpAddr, clients: Vec<DiscoveredClient>) {
        self.clients.lock().await.insert(proxy, clients);
    }

    pub fn with_unreachable(mut self, proxy: IpAddr) -> Self {
        self.unreachable.insert(proxy);
        self
    }

    pub async fn drains(&self) -> Vec<DrainRecord> {
        self.drains.lock().await.clone()
    }

    fn check(&self, proxy: IpAddr) -> Result<(), ProtoError> {
        if self.unreachable.contains(&proxy) {
            return Err(ProtoError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("broker at {proxy} refused"),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for StaticBroker {
    async fn attached_clients(&self, proxy: IpAddr) -> Result<Vec<DiscoveredClient>, ProtoError> {
        self.check(proxy)?;
        Ok(self
            .clients
            .lock()
            .await
            .get(&proxy)
            .cloned()
            .unwrap_or_default())
    }

    async fn drain(&self, proxy: IpAddr, clients: &[IpAddr]) -> Result<(), ProtoError> {
        self.check(proxy)?;
        self.drains.lock().await.push(DrainRecord {
            proxy,
            clients: clients.to_vec(),
            at: Instant::now(),
        });
        Ok(())
    }
}

// =============================================================================
// Handshake
// =============================================================================

/// Which sessions an old proxy closes once its clients were notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainScope {
    /// Only the clients that took their migration message. The instance
    /// keeps serving under its new addresses.
    NotifiedClients,
    /// Every session; the proxy stops accepting and its instance goes away.
    All,
}

impl From<RotationMode> for DrainScope {
    fn from(mode: RotationMode) -> Self {
        match mode {
            RotationMode::WholeInstance => DrainScope::All,
            RotationMode::LiveIp => DrainScope::NotifiedClients,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HandshakeSettings {
    /// Port clients are told to reach the new identity on.
    pub advertised_port: u16,
    /// Connect-and-send limit for one migration message.
    pub notify_timeout: Duration,
    pub drain_scope: DrainScope,
}

/// Outcome of one migration message.
#[derive(Debug)]
pub struct ClientNotification {
    pub client: SocketAddr,
    pub old: IpAddr,
    pub new: Endpoint,
    /// When the attempt finished.
    pub finished_at: Instant,
    pub failure: Option<ClientNotificationFailed>,
}

impl ClientNotification {
    pub fn delivered(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug)]
pub struct HandshakeReport {
    pub kind: UpdateKind,
    pub registry_notified_at: Instant,
    pub notifications: Vec<ClientNotification>,
    /// Set when a previous generation was retired.
    pub retired_at: Option<Instant>,
    pub decommission: DecommissionSummary,
    pub transitions: Vec<(HandshakeState, Instant)>,
}

impl HandshakeReport {
    pub fn delivered(&self) -> impl Iterator<Item = &ClientNotification> {
        self.notifications.iter().filter(|n| n.delivered())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ClientNotification> {
        self.notifications.iter().filter(|n| !n.delivered())
    }
}

pub struct MigrationHandshake {
    registry: Arc<dyn Registry>,
    broker: Arc<dyn Broker>,
    decommissioner: Arc<Decommissioner>,
    settings: HandshakeSettings,
}

/// An old proxy's broker and the old-to-new replacements of its addresses.
struct NodeMigration {
    broker: IpAddr,
    pairs: Vec<(IpAddr, Endpoint)>,
}

impl MigrationHandshake {
    pub fn new(
        registry: Arc<dyn Registry>,
        broker: Arc<dyn Broker>,
        decommissioner: Arc<Decommissioner>,
        settings: HandshakeSettings,
    ) -> Self {
        Self {
            registry,
            broker,
            decommissioner,
            settings,
        }
    }

    /// Hand every dependent of `previous` over to `current`, then retire
    /// what `current` does not reuse. On bootstrap (`previous` is `None`)
    /// the registry only learns the new addresses.
    pub async fn execute(
        &self,
        previous: Option<&Generation>,
        current: &VerifiedGeneration,
    ) -> Result<HandshakeReport, CycleError> {
        let mut machine = HandshakeMachine::new();
        machine.advance(HandshakeState::AwaitingNewIdentity)?;

        let next = current.generation();
        let update = topology_update(previous, next)
            .map_err(|e| CycleError::RegistryNotificationFailed(RegistryError::Invalid(e)))?;
        let kind = update.kind().map_err(|e| {
            CycleError::RegistryNotificationFailed(RegistryError::Invalid(e))
        })?;

        machine.advance(HandshakeState::NotifyingRegistry)?;
        self.registry
            .update_topology(&update)
            .await
            .map_err(CycleError::RegistryNotificationFailed)?;
        let registry_notified_at = Instant::now();
        info!(
            cycle = %next.seq,
            kind = ?kind,
            old = update.old_ips.len(),
            new = update.new_ips.len(),
            "Registry updated"
        );

        machine.advance(HandshakeState::NotifyingClients)?;
        let migrations = previous
            .map(|prev| self.plan(prev, &update))
            .unwrap_or_default();
        let notifications = self.notify_all(&migrations).await;

        machine.advance(HandshakeState::Draining)?;
        self.drain(&migrations, &notifications).await;

        let (decommission, retired_at) = match previous {
            Some(prev) => {
                let summary = self
                    .decommissioner
                    .decommission(prev, Some(next))
                    .await
                    .map_err(CycleError::RetirementFailed)?;
                (summary, Some(Instant::now()))
            }
            None => (DecommissionSummary::default(), None),
        };
        machine.advance(HandshakeState::Retired)?;

        Ok(HandshakeReport {
            kind,
            registry_notified_at,
            notifications,
            retired_at,
            decommission,
            transitions: machine.into_transitions(),
        })
    }

    /// Group the registry's old-to-new pairs by the old node whose broker
    /// knows the clients, so every client hears the replacement the
    /// registry recorded for its address.
    fn plan(&self, previous: &Generation, update: &TopologyUpdate) -> Vec<NodeMigration> {
        let replacements: HashMap<IpAddr, IpAddr> = update
            .pairs()
            .filter_map(|(old, new)| Some((old.parse().ok()?, new.parse().ok()?)))
            .collect();
        let mut plan = Vec::with_capacity(previous.nodes.len());

        for node in &previous.nodes {
            let Some(broker) = node.primary_address() else {
                continue;
            };
            let pairs: Vec<(IpAddr, Endpoint)> = node
                .nics
                .iter()
                .filter_map(|nic| {
                    let new = replacements.get(&nic.address)?;
                    debug!(proxy = %broker, old = %nic.address, new = %new, "Planned replacement");
                    Some((
                        nic.address,
                        Endpoint::new(*new, Some(self.settings.advertised_port)),
                    ))
                })
                .collect();
            if !pairs.is_empty() {
                plan.push(NodeMigration { broker, pairs });
            }
        }
        plan
    }

    async fn notify_all(&self, migrations: &[NodeMigration]) -> Vec<ClientNotification> {
        let discovered = join_all(migrations.iter().map(|m| async move {
            match self.broker.attached_clients(m.broker).await {
                Ok(clients) => clients,
                Err(e) => {
                    warn!(proxy = %m.broker, error = %e, "Client discovery failed; no clients notified");
                    Vec::new()
                }
            }
        }))
        .await;

        let mut targets = Vec::new();
        for (migration, clients) in migrations.iter().zip(discovered) {
            let mut seen = HashSet::new();
            let mut unplaced = 0;
            for client in clients.into_iter().filter(|c| seen.insert(c.addr)) {
                let attached = client
                    .via
                    .and_then(|via| migration.pairs.iter().find(|(old, _)| *old == via));
                let (old, new) = match attached {
                    Some(pair) => *pair,
                    // Broker did not say which address the client uses.
                    None => {
                        let pair = migration.pairs[unplaced % migration.pairs.len()];
                        unplaced += 1;
                        debug!(
                            client = %client.addr,
                            via = ?client.via,
                            old = %pair.0,
                            "Client arrival address unknown; spreading"
                        );
                        pair
                    }
                };
                targets.push((client.addr, old, new));
            }
        }

        let limit = self.settings.notify_timeout;
        join_all(targets.into_iter().map(|(client, old, new)| async move {
            let message = MigrationMessage::new(new);
            let result = notify_client(client, &message, limit).await;
            let finished_at = Instant::now();
            let failure = match result {
                Ok(()) => {
                    debug!(client = %client, new = %new, "Client notified");
                    None
                }
                Err(e) => {
                    warn!(client = %client, old = %old, error = %e, "Client notification failed");
                    Some(ClientNotificationFailed {
                        client,
                        reason: e.to_string(),
                    })
                }
            };
            ClientNotification {
                client,
                old,
                new,
                finished_at,
                failure,
            }
        }))
        .await
    }

    async fn drain(&self, migrations: &[NodeMigration], notifications: &[ClientNotification]) {
        for migration in migrations {
            let olds: HashSet<IpAddr> = migration.pairs.iter().map(|(old, _)| *old).collect();
            let notified: Vec<IpAddr> = notifications
                .iter()
                .filter(|n| n.delivered() && olds.contains(&n.old))
                .map(|n| n.client.ip())
                .collect();

            let clients: &[IpAddr] = match self.settings.drain_scope {
                DrainScope::All => &[],
                DrainScope::NotifiedClients if notified.is_empty() => continue,
                DrainScope::NotifiedClients => &notified,
            };
            if let Err(e) = self.broker.drain(migration.broker, clients).await {
                warn!(proxy = %migration.broker, error = %e, "Drain failed; continuing with retirement");
            }
        }
    }
}

fn topology_update(
    previous: Option<&Generation>,
    next: &Generation,
) -> Result<TopologyUpdate, ProtoError> {
    let render = |g: &Generation| -> Vec<String> {
        g.addresses().iter().map(ToString::to_string).collect()
    };
    match previous {
        None => Ok(TopologyUpdate::add(render(next))),
        Some(prev) => TopologyUpdate::replace(render(prev), render(next)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloud;
    use crate::model::fixtures::{nic, node};
    use crate::registry::RecordingRegistry;
    use spotproxy_id::CycleSeq;

    #[test]
    fn test_machine_moves_forward_only() {
        let mut machine = HandshakeMachine::new();
        machine.advance(HandshakeState::AwaitingNewIdentity).unwrap();
        machine.advance(HandshakeState::NotifyingRegistry).unwrap();

        let err = machine.advance(HandshakeState::Draining).unwrap_err();
        assert!(matches!(
            err,
            CycleError::InvalidTransition {
                from: HandshakeState::NotifyingRegistry,
                to: HandshakeState::Draining
            }
        ));
        assert!(err.is_fatal());

        assert!(machine.advance(HandshakeState::Idle).is_err());
        assert_eq!(machine.state(), HandshakeState::NotifyingRegistry);
        assert_eq!(machine.into_transitions().len(), 3);
    }

    #[test]
    fn test_retired_is_terminal() {
        assert_eq!(HandshakeState::Retired.successor(), None);
    }

    fn settings(scope: DrainScope) -> HandshakeSettings {
        HandshakeSettings {
            advertised_port: 51820,
            notify_timeout: Duration::from_millis(200),
            drain_scope: scope,
        }
    }

    fn handshake(
        registry: Arc<RecordingRegistry>,
        broker: Arc<StaticBroker>,
        scope: DrainScope,
    ) -> MigrationHandshake {
        let cloud = Arc::new(MockCloud::new());
        MigrationHandshake::new(
            registry,
            broker,
            Arc::new(Decommissioner::new(cloud)),
            settings(scope),
        )
    }

    fn verified(generation: Generation) -> VerifiedGeneration {
        VerifiedGeneration::for_tests(generation)
    }

    #[tokio::test]
    async fn test_bootstrap_adds_without_clients() {
        let registry = Arc::new(RecordingRegistry::default());
        let broker = Arc::new(StaticBroker::new());
        let hs = handshake(registry.clone(), broker.clone(), DrainScope::All);

        let next = Generation::new(
            CycleSeq::FIRST,
            vec![node(0, "i-1", "eni-1", vec![nic("eni-1", "198.51.100.1", false)])],
            None,
        );
        let report = hs.execute(None, &verified(next)).await.unwrap();

        assert_eq!(report.kind, UpdateKind::Add);
        assert!(report.notifications.is_empty());
        assert!(report.retired_at.is_none());
        assert!(broker.drains().await.is_empty());

        let updates = registry.updates().await;
        assert_eq!(updates.len(), 1);
        assert!(updates[0].old_ips.is_empty());
        assert_eq!(updates[0].new_ips, vec!["198.51.100.1".to_string()]);

        let states: Vec<_> = report.transitions.iter().map(|(s, _)| *s).collect();
        assert_eq!(states.last(), Some(&HandshakeState::Retired));
    }

    #[tokio::test]
    async fn test_registry_failure_touches_no_client() {
        let registry = Arc::new(RecordingRegistry::failing());
        let old: IpAddr = "198.51.100.1".parse().unwrap();
        let broker = Arc::new(
            StaticBroker::new().with_clients(old, vec!["127.0.0.1:9".parse().unwrap()]),
        );
        let hs = handshake(registry, broker.clone(), DrainScope::All);

        let previous = Generation::new(
            CycleSeq::FIRST,
            vec![node(0, "i-1", "eni-1", vec![nic("eni-1", "198.51.100.1", false)])],
            None,
        );
        let next = Generation::new(
            CycleSeq::FIRST.next(),
            vec![node(0, "i-2", "eni-2", vec![nic("eni-2", "198.51.100.2", false)])],
            None,
        );

        let err = hs
            .execute(Some(&previous), &verified(next))
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::RegistryNotificationFailed(_)));
        assert!(broker.drains().await.is_empty());
    }

    #[tokio::test]
    async fn test_tcp_broker_lists_and_drains() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut request = String::new();
                stream.read_to_string(&mut request).await.unwrap();
                if request.starts_with("clients") {
                    stream
                        .write_all(b"10.0.0.7 198.51.100.1\nnot-an-ip\n10.0.0.8\n")
                        .await
                        .unwrap();
                }
                seen.push(request);
            }
            seen
        });

        let broker = TcpBroker::new(port, 1248, Duration::from_secs(2));
        let proxy: IpAddr = "127.0.0.1".parse().unwrap();
        let clients = broker.attached_clients(proxy).await.unwrap();
        assert_eq!(
            clients,
            vec![
                DiscoveredClient {
                    addr: "10.0.0.7:1248".parse().unwrap(),
                    via: Some("198.51.100.1".parse().unwrap()),
                },
                DiscoveredClient {
                    addr: "10.0.0.8:1248".parse().unwrap(),
                    via: None,
                },
            ]
        );
        broker
            .drain(proxy, &["10.0.0.7".parse().unwrap()])
            .await
            .unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen, vec!["clients\n".to_string(), "drain 10.0.0.7\n".to_string()]);
    }

    #[test]
    fn test_plan_follows_registry_pairs() {
        let registry = Arc::new(RecordingRegistry::default());
        let hs = handshake(registry, Arc::new(StaticBroker::new()), DrainScope::NotifiedClients);

        let previous = Generation::new(
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
        );
        let next = Generation::new(
            CycleSeq::FIRST.next(),
            vec![
                node(
                    0,
                    "i-1",
                    "eni-1",
                    vec![nic("eni-2", "203.0.113.2", true), nic("eni-1", "203.0.113.1", true)],
                ),
                node(1, "i-2", "eni-3", vec![nic("eni-3", "203.0.113.3", true)]),
            ],
            None,
        );

        let update = topology_update(Some(&previous), &next).unwrap();
        let plan = hs.plan(&previous, &update);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].broker, "198.51.100.1".parse::<IpAddr>().unwrap());
        assert_eq!(plan[0].pairs.len(), 2);
        assert_eq!(plan[0].pairs[0].1.to_string(), "203.0.113.2:51820");
        assert_eq!(plan[1].pairs[0].0, "198.51.100.3".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_broker_for_configured_network() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = String::new();
            stream.read_to_string(&mut request).await.unwrap();
            stream.write_all(b"10.0.0.7 127.0.0.1\n").await.unwrap();
            request
        });
        let proxy: IpAddr = "127.0.0.1".parse().unwrap();

        let mut config = crate::config::Config::for_tests(RotationMode::LiveIp, 1);
        config.in_memory_network = false;
        config.broker_port = port;
        config.client_migration_port = 4100;
        let clients = broker_for(&config).attached_clients(proxy).await.unwrap();
        assert_eq!(
            clients,
            vec![DiscoveredClient {
                addr: "10.0.0.7:4100".parse().unwrap(),
                via: Some(proxy),
            }]
        );
        assert_eq!(server.await.unwrap(), "clients\n");

        config.in_memory_network = true;
        assert!(broker_for(&config)
            .attached_clients(proxy)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_tcp_broker_splits_long_drains() {
        use spotproxy_proto::MAX_LINE_LEN;
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let server = {
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                loop {
                    let (mut stream, _) = listener.accept().await.unwrap();
                    let mut request = String::new();
                    stream.read_to_string(&mut request).await.unwrap();
                    requests.lock().await.push(request);
                }
            })
        };

        let clients: Vec<IpAddr> = (0..30)
            .map(|i| format!("203.0.113.{}", 100 + i).parse().unwrap())
            .collect();
        let broker = TcpBroker::new(port, 1248, Duration::from_secs(2));
        broker
            .drain("127.0.0.1".parse().unwrap(), &clients)
            .await
            .unwrap();
        server.abort();

        let requests = requests.lock().await.clone();
        assert!(requests.len() > 1);
        let mut drained = Vec::new();
        for request in &requests {
            assert!(request.len() <= MAX_LINE_LEN);
            match BrokerCommand::parse(request.trim_end()).unwrap() {
                BrokerCommand::Drain(ips) => drained.extend(ips),
                other => panic!("unexpected command: {other}"),
            }
        }
        assert_eq!(drained, clients);
    }

    #[tokio::test]
    async fn test_clients_hear_the_replacement_of_their_address() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        async fn client() -> (SocketAddr, tokio::task::JoinHandle<String>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let handle = tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut line = String::new();
                stream.read_to_string(&mut line).await.unwrap();
                line
            });
            (addr, handle)
        }

        let aux: IpAddr = "198.51.100.2".parse().unwrap();
        let primary: IpAddr = "198.51.100.1".parse().unwrap();
        let (on_primary, primary_rx) = client().await;
        let (on_aux, aux_rx) = client().await;

        // Listed primary-first, the reverse of the node's address order.
        let broker = Arc::new(StaticBroker::new());
        broker
            .set_attached(
                primary,
                vec![
                    DiscoveredClient {
                        addr: on_primary,
                        via: Some(primary),
                    },
                    DiscoveredClient {
                        addr: on_aux,
                        via: Some(aux),
                    },
                ],
            )
            .await;
        let registry = Arc::new(RecordingRegistry::default());
        let hs = handshake(registry.clone(), broker.clone(), DrainScope::NotifiedClients);

        let previous = Generation::new(
            CycleSeq::FIRST,
            vec![node(
                0,
                "i-1",
                "eni-1",
                vec![nic("eni-2", "198.51.100.2", false), nic("eni-1", "198.51.100.1", false)],
            )],
            None,
        );
        let next = Generation::new(
            CycleSeq::FIRST.next(),
            vec![node(
                0,
                "i-1",
                "eni-1",
                vec![nic("eni-2", "203.0.113.2", false), nic("eni-1", "203.0.113.1", false)],
            )],
            None,
        );

        let report = hs.execute(Some(&previous), &verified(next)).await.unwrap();
        assert_eq!(report.delivered().count(), 2);

        let updates = registry.updates().await;
        let recorded: HashMap<&str, &str> = updates[0].pairs().collect();
        assert_eq!(recorded["198.51.100.1"], "203.0.113.1");
        assert_eq!(recorded["198.51.100.2"], "203.0.113.2");

        assert_eq!(primary_rx.await.unwrap(), "migrate 203.0.113.1:51820\n");
        assert_eq!(aux_rx.await.unwrap(), "migrate 203.0.113.2:51820\n");
        for n in &report.notifications {
            let expected = if n.client == on_primary { "203.0.113.1" } else { "203.0.113.2" };
            assert_eq!(recorded[n.old.to_string().as_str()], expected);
            assert_eq!(n.new.ip.to_string(), expected);
        }
    }
}
