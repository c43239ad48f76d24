//! Shared fixtures for rejuvenator integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use spotproxy_proto::{read_line, MigrationMessage};
use spotproxy_rejuvenator::handshake::StaticBroker;
use spotproxy_rejuvenator::health::StaticProbe;
use spotproxy_rejuvenator::model::Arch;
use spotproxy_rejuvenator::registry::RecordingRegistry;
use spotproxy_rejuvenator::{Config, MockCloud, RotationMode, Scheduler};
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

pub struct Fleet {
    pub cloud: Arc<MockCloud>,
    pub probe: Arc<StaticProbe>,
    pub registry: Arc<RecordingRegistry>,
    pub broker: Arc<StaticBroker>,
    pub scheduler: Scheduler,
}

impl Fleet {
    pub fn new(mode: RotationMode, fleet_size: usize, cloud: MockCloud) -> Self {
        let cloud = Arc::new(cloud);
        let probe = Arc::new(StaticProbe::reachable());
        let registry = Arc::new(RecordingRegistry::default());
        let broker = Arc::new(StaticBroker::new());
        let scheduler = Scheduler::new(
            Config::for_tests(mode, fleet_size),
            cloud.clone(),
            probe.clone(),
            registry.clone(),
            broker.clone(),
        );
        Self {
            cloud,
            probe,
            registry,
            broker,
            scheduler,
        }
    }
}

/// Two cheap x86 offers with two interfaces each, plus a cheaper ARM one
/// the fleet cannot run on.
pub fn market() -> MockCloud {
    MockCloud::new()
        .with_offer("t4g.small", "us-east-1a", 0.005, 2, &[Arch::Arm64])
        .with_offer("c5.large", "us-east-1a", 0.040, 2, &[Arch::X86_64])
        .with_offer("c5.large", "us-east-1b", 0.042, 2, &[Arch::X86_64])
        .with_offer("m5.large", "us-east-1a", 0.060, 3, &[Arch::X86_64])
}

/// A migration message as the client agent saw it.
#[derive(Debug, Clone)]
pub struct Received {
    pub message: MigrationMessage,
    pub at: Instant,
}

/// A client migration listener on loopback recording what it receives.
pub struct ClientListener {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Received>>>,
}

impl ClientListener {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut reader = BufReader::new(stream);
                if let Ok(Some(line)) = read_line(&mut reader).await {
                    if let Ok(message) = MigrationMessage::parse(&line) {
                        sink.lock().await.push(Received {
                            message,
                            at: Instant::now(),
                        });
                    }
                }
            }
        });
        Self { addr, received }
    }

    pub async fn received(&self) -> Vec<Received> {
        self.received.lock().await.clone()
    }

    /// Wait until `count` messages arrived, or give up after two seconds.
    pub async fn wait_for(&self, count: usize) -> Vec<Received> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let received = self.received().await;
            if received.len() >= count || Instant::now() >= deadline {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// A loopback address nothing listens on.
pub async fn closed_client() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
