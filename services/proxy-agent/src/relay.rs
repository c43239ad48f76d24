//! Data-plane relay.
//!
//! Every accepted client connection is relayed to the upstream tunnel
//! endpoint until either side closes or the session is drained. A drained
//! client receives [`BYE`] before its connection is shut down.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use crate::sessions::SessionRegistry;

/// Sent to a client whose session is being drained.
pub const BYE: &[u8] = b"bye!\n";

/// Upstream connect deadline.
pub const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Relay listener for client sessions.
pub struct DataPlane {
    listener: TcpListener,
    upstream: SocketAddr,
    sessions: Arc<SessionRegistry>,
    /// Local address to the public address clients dial, for hosts behind
    /// one-to-one NAT.
    public: Arc<HashMap<IpAddr, IpAddr>>,
}

impl DataPlane {
    pub async fn bind(
        addr: SocketAddr,
        upstream: SocketAddr,
        sessions: Arc<SessionRegistry>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(bind_addr = %listener.local_addr()?, upstream = %upstream, "Data plane bound");
        Ok(Self {
            listener,
            upstream,
            sessions,
            public: Arc::new(HashMap::new()),
        })
    }

    /// Report sessions arriving on a mapped local address under its public
    /// address instead.
    pub fn with_public_addresses(mut self, public: HashMap<IpAddr, IpAddr>) -> Self {
        self.public = Arc::new(public);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept sessions until shutdown. In-flight sessions are left to
    /// finish or be drained.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let upstream = self.upstream;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if !self.sessions.is_accepting() {
                            debug!(peer = %peer, "Refusing session; proxy is drained");
                            continue;
                        }
                        let sessions = Arc::clone(&self.sessions);
                        let public = Arc::clone(&self.public);
                        tokio::spawn(
                            async move {
                                if let Err(e) = relay(stream, peer, upstream, sessions, &public).await {
                                    debug!(error = %e, "Session error");
                                }
                            }
                            .instrument(tracing::info_span!("session", peer = %peer)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Data plane shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn relay(
    mut client: TcpStream,
    peer: SocketAddr,
    upstream: SocketAddr,
    sessions: Arc<SessionRegistry>,
    public: &HashMap<IpAddr, IpAddr>,
) -> io::Result<()> {
    let local = client.local_addr()?.ip();
    let via = public.get(&local).copied().unwrap_or(local);

    let mut backend = match timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(upstream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(upstream = %upstream, error = %e, "Upstream connect failed");
            return Err(e);
        }
        Err(_) => {
            warn!(upstream = %upstream, "Upstream connect timed out");
            return Err(io::Error::new(io::ErrorKind::TimedOut, "upstream connect"));
        }
    };

    let (_guard, drained) = sessions.open(peer, via);
    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut client, &mut backend) => {
            let (to_upstream, from_upstream) = copied?;
            debug!(to_upstream, from_upstream, "Session finished");
            Ok(())
        }
        // A dropped sender means the registry forgot the session; end it too.
        _ = drained => say_bye(client).await,
    }
}

async fn say_bye(mut client: TcpStream) -> io::Result<()> {
    // Lost only when the client already left.
    let _ = client.write_all(BYE).await;
    client.shutdown().await
}
