//! Registry of live data-plane sessions.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use spotproxy_proto::Attachment;
use tokio::sync::oneshot;
use tracing::{debug, info};

struct Entry {
    peer: SocketAddr,
    /// Proxy address the session arrived on.
    local: IpAddr,
    opened_at: Instant,
    drain: oneshot::Sender<()>,
}

/// Sessions keyed by an agent-local id. Cheap to share behind an [`Arc`].
#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, Entry>>,
    closed: AtomicBool,
}

/// Keeps a session registered; dropping it unregisters the session.
pub struct SessionGuard {
    id: u64,
    registry: Arc<SessionRegistry>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a session from `peer` that arrived on `local`. The receiver
    /// fires when the session is drained.
    pub fn open(
        self: &Arc<Self>,
        peer: SocketAddr,
        local: IpAddr,
    ) -> (SessionGuard, oneshot::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            id,
            Entry {
                peer,
                local,
                opened_at: Instant::now(),
                drain: tx,
            },
        );
        debug!(session = id, peer = %peer, local = %local, "Session opened");
        (
            SessionGuard {
                id,
                registry: Arc::clone(self),
            },
            rx,
        )
    }

    fn remove(&self, id: u64) {
        if let Some(entry) = self.lock().remove(&id) {
            debug!(
                session = id,
                peer = %entry.peer,
                secs = entry.opened_at.elapsed().as_secs(),
                "Session closed"
            );
        }
    }

    /// Distinct client IPs with at least one open session, sorted.
    pub fn clients(&self) -> Vec<IpAddr> {
        self.lock()
            .values()
            .map(|e| e.peer.ip())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Distinct (client, proxy address) pairs, sorted. A client attached
    /// through two proxy addresses appears twice.
    pub fn attachments(&self) -> Vec<Attachment> {
        self.lock()
            .values()
            .map(|e| Attachment::new(e.peer.ip(), Some(e.local)))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal the sessions of `clients` to close. An empty list drains
    /// every session and stops new ones being accepted. Returns how many
    /// sessions were signalled.
    pub fn drain(&self, clients: &[IpAddr]) -> usize {
        if clients.is_empty() {
            self.closed.store(true, Ordering::SeqCst);
        }

        let mut sessions = self.lock();
        let ids: Vec<u64> = sessions
            .iter()
            .filter(|(_, e)| clients.is_empty() || clients.contains(&e.peer.ip()))
            .map(|(id, _)| *id)
            .collect();

        let mut drained = 0;
        for id in ids {
            if let Some(entry) = sessions.remove(&id) {
                // The session may have ended on its own already.
                if entry.drain.send(()).is_ok() {
                    drained += 1;
                }
            }
        }
        info!(
            drained,
            selective = !clients.is_empty(),
            accepting = self.is_accepting(),
            "Drained sessions"
        );
        drained
    }

    /// False once a full drain was requested.
    pub fn is_accepting(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Entry>> {
        // A panic while holding the lock cannot leave the map inconsistent.
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    const LOCAL: &str = "198.51.100.1";

    #[test]
    fn test_clients_are_distinct_ips() {
        let registry = SessionRegistry::new();
        let _a = registry.open(peer("10.0.0.2:4000"), ip(LOCAL));
        let _b = registry.open(peer("10.0.0.2:4001"), ip(LOCAL));
        let _c = registry.open(peer("10.0.0.1:4000"), ip(LOCAL));

        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.clients(),
            vec![
                "10.0.0.1".parse::<IpAddr>().unwrap(),
                "10.0.0.2".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_attachments_name_the_arrival_address() {
        let registry = SessionRegistry::new();
        let _a = registry.open(peer("10.0.0.2:4000"), ip("198.51.100.2"));
        let _b = registry.open(peer("10.0.0.2:4001"), ip("198.51.100.2"));
        let _c = registry.open(peer("10.0.0.1:4000"), ip("198.51.100.1"));
        let _d = registry.open(peer("10.0.0.1:4001"), ip("198.51.100.2"));

        assert_eq!(
            registry
                .attachments()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            vec![
                "10.0.0.1 198.51.100.1",
                "10.0.0.1 198.51.100.2",
                "10.0.0.2 198.51.100.2",
            ]
        );
    }

    #[test]
    fn test_guard_unregisters() {
        let registry = SessionRegistry::new();
        let (guard, _rx) = registry.open(peer("10.0.0.1:4000"), ip(LOCAL));
        assert!(!registry.is_empty());
        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_selective_drain() {
        let registry = SessionRegistry::new();
        let (_a, mut rx_a) = registry.open(peer("10.0.0.1:4000"), ip(LOCAL));
        let (_b, mut rx_b) = registry.open(peer("10.0.0.2:4000"), ip(LOCAL));

        assert_eq!(registry.drain(&["10.0.0.1".parse().unwrap()]), 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
        assert!(registry.is_accepting());
        assert_eq!(registry.clients(), vec!["10.0.0.2".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_full_drain_stops_accepting() {
        let registry = SessionRegistry::new();
        let (_a, mut rx_a) = registry.open(peer("10.0.0.1:4000"), ip(LOCAL));

        assert_eq!(registry.drain(&[]), 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(!registry.is_accepting());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain_skips_finished_sessions() {
        let registry = SessionRegistry::new();
        let (_guard, rx) = registry.open(peer("10.0.0.1:4000"), ip(LOCAL));
        drop(rx);
        assert_eq!(registry.drain(&[]), 0);
    }
}
