//! Migration listener.
//!
//! Each connection carries exactly one `MigrationMessage`. Messages are
//! applied one at a time; the endpoint is published only after the tunnel
//! backend finished applying it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use spotproxy_proto::{read_line, Endpoint, MigrationMessage, ProtoError};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use crate::tunnel::{TunnelBackend, TunnelError};

/// Why a migration connection did not lead to a new endpoint.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("sender closed the connection without a message")]
    NoMessage,

    #[error("malformed message: {0}")]
    Malformed(#[from] ProtoError),

    #[error("failed to apply endpoint: {0}")]
    Apply(#[from] TunnelError),
}

pub struct MigrationListener {
    listener: TcpListener,
    backend: Arc<dyn TunnelBackend>,
    read_timeout: Duration,
    apply_lock: Mutex<()>,
    current: watch::Sender<Option<Endpoint>>,
}

impl MigrationListener {
    pub async fn bind(
        addr: SocketAddr,
        backend: Arc<dyn TunnelBackend>,
        read_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(bind_addr = %listener.local_addr()?, "Migration listener bound");
        let (current, _) = watch::channel(None);
        Ok(Self {
            listener,
            backend,
            read_timeout,
            apply_lock: Mutex::new(()),
            current,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Latest applied endpoint; `None` until the first migration.
    pub fn subscribe(&self) -> watch::Receiver<Option<Endpoint>> {
        self.current.subscribe()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let this = Arc::new(self);
        loop {
            tokio::select! {
                accepted = this.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let this = Arc::clone(&this);
                        tokio::spawn(
                            async move {
                                match this.handle(stream).await {
                                    Ok(endpoint) => info!(endpoint = %endpoint, "Migrated"),
                                    Err(MigrationError::NoMessage) => debug!("Empty migration connection"),
                                    Err(MigrationError::Malformed(e)) if !e.is_malformed() => {
                                        debug!(error = %e, "Migration connection failed")
                                    }
                                    Err(e) => warn!(error = %e, "Migration rejected"),
                                }
                            }
                            .instrument(tracing::info_span!("migration", peer = %peer)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Migration listener shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&self, stream: TcpStream) -> Result<Endpoint, MigrationError> {
        let mut reader = BufReader::new(stream);
        let line = timeout(self.read_timeout, read_line(&mut reader))
            .await
            .map_err(|_| ProtoError::Timeout(self.read_timeout))??
            .ok_or(MigrationError::NoMessage)?;
        // Anything after the first line is ignored.
        drop(reader);

        let msg = MigrationMessage::parse(&line)?;
        self.apply(msg.endpoint).await?;
        Ok(msg.endpoint)
    }

    /// Apply `endpoint` and publish it. Concurrent migrations are applied
    /// in the order they acquire the lock; the last one wins.
    pub async fn apply(&self, endpoint: Endpoint) -> Result<(), TunnelError> {
        let _guard = self.apply_lock.lock().await;
        let previous = self.backend.apply(&endpoint).await?;
        debug!(
            previous = previous.as_deref().unwrap_or(""),
            endpoint = %endpoint,
            "Endpoint applied"
        );
        self.current.send_replace(Some(endpoint));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::RecordingBackend;
    use spotproxy_proto::write_line;
    use tokio::io::AsyncWriteExt;

    async fn listener(backend: Arc<dyn TunnelBackend>) -> MigrationListener {
        MigrationListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            backend,
            Duration::from_millis(200),
        )
        .await
        .unwrap()
    }

    async fn connected(l: &MigrationListener) -> (TcpStream, TcpStream) {
        let client = TcpStream::connect(l.local_addr().unwrap()).await.unwrap();
        let (server, _) = l.listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_applies_then_publishes() {
        let backend = Arc::new(RecordingBackend::new());
        let l = listener(backend.clone()).await;
        let rx = l.subscribe();
        let (mut client, server) = connected(&l).await;

        write_line(&mut client, "migrate 198.51.100.2:51820").await.unwrap();
        client.shutdown().await.unwrap();
        let endpoint = l.handle(server).await.unwrap();

        assert_eq!(endpoint.to_string(), "198.51.100.2:51820");
        assert_eq!(backend.applied().await, vec![endpoint]);
        assert_eq!(*rx.borrow(), Some(endpoint));
    }

    #[tokio::test]
    async fn test_only_first_line_counts() {
        let backend = Arc::new(RecordingBackend::new());
        let l = listener(backend.clone()).await;
        let (mut client, server) = connected(&l).await;

        client
            .write_all(b"migrate 198.51.100.2\nmigrate 198.51.100.3\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        l.handle(server).await.unwrap();

        assert_eq!(backend.applied().await.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_message_changes_nothing() {
        let backend = Arc::new(RecordingBackend::new());
        let l = listener(backend.clone()).await;
        let rx = l.subscribe();
        let (mut client, server) = connected(&l).await;

        write_line(&mut client, "drain").await.unwrap();
        client.shutdown().await.unwrap();

        assert!(matches!(
            l.handle(server).await,
            Err(MigrationError::Malformed(_))
        ));
        assert!(backend.applied().await.is_empty());
        assert_eq!(*rx.borrow(), None);
    }

    #[tokio::test]
    async fn test_silent_sender_times_out() {
        let l = listener(Arc::new(RecordingBackend::new())).await;
        let (_client, server) = connected(&l).await;

        assert!(matches!(
            l.handle(server).await,
            Err(MigrationError::Malformed(ProtoError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn test_failed_apply_is_not_published() {
        let l = listener(Arc::new(RecordingBackend::failing())).await;
        let rx = l.subscribe();
        let (mut client, server) = connected(&l).await;

        write_line(&mut client, "migrate 198.51.100.2").await.unwrap();
        client.shutdown().await.unwrap();

        assert!(matches!(l.handle(server).await, Err(MigrationError::Apply(_))));
        assert_eq!(*rx.borrow(), None);
    }
}
