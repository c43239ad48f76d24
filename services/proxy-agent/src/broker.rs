//! Broker endpoint.
//!
//! One command per connection. Replies are plain lines; the connection is
//! closed once the command is handled. A malformed command is answered with
//! a single `error: <reason>` line.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use spotproxy_proto::{
    notify_client, read_line, write_line, BrokerCommand, Endpoint, MigrationMessage, ProtoError,
};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use crate::sessions::SessionRegistry;

/// Result of a broker-initiated migration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrateOutcome {
    pub notified: Vec<IpAddr>,
    pub failed: Vec<IpAddr>,
    pub drained: usize,
}

pub struct BrokerServer {
    listener: TcpListener,
    sessions: Arc<SessionRegistry>,
    client_port: u16,
    notify_timeout: Duration,
}

impl BrokerServer {
    pub async fn bind(
        addr: SocketAddr,
        sessions: Arc<SessionRegistry>,
        client_port: u16,
        notify_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(bind_addr = %listener.local_addr()?, client_port, "Broker bound");
        Ok(Self {
            listener,
            sessions,
            client_port,
            notify_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let server = Arc::new(self);
        loop {
            tokio::select! {
                accepted = server.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(
                            async move {
                                if let Err(e) = server.handle(stream).await {
                                    debug!(error = %e, "Broker connection error");
                                }
                            }
                            .instrument(tracing::info_span!("broker", peer = %peer)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Broker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&self, stream: TcpStream) -> Result<(), ProtoError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let line = match timeout(self.notify_timeout, read_line(&mut reader)).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return Ok(()),
            // A transport failure leaves nobody to answer.
            Ok(Err(e)) if !e.is_malformed() => return Err(e),
            Ok(Err(e)) => {
                warn!(error = %e, "Rejected broker line");
                return reply_error(&mut writer, &e).await;
            }
            Err(_) => return Err(ProtoError::Timeout(self.notify_timeout)),
        };
        let command = match BrokerCommand::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Rejected broker command");
                return reply_error(&mut writer, &e).await;
            }
        };
        debug!(command = command.keyword(), "Broker command");

        match command {
            BrokerCommand::Clients => {
                for attachment in self.sessions.attachments() {
                    write_line(&mut writer, &attachment.to_string()).await?;
                }
            }
            BrokerCommand::Drain(ips) => {
                self.sessions.drain(&ips);
            }
            BrokerCommand::Migrate(endpoint) => {
                self.migrate(endpoint).await;
            }
        }
        writer.shutdown().await?;
        Ok(())
    }

    /// Tell every attached client about `endpoint`, then drain all sessions.
    pub async fn migrate(&self, endpoint: Endpoint) -> MigrateOutcome {
        let msg = MigrationMessage::new(endpoint);
        let clients = self.sessions.clients();

        let results = join_all(clients.iter().map(|ip| {
            let addr = SocketAddr::new(*ip, self.client_port);
            let msg = &msg;
            async move { (*ip, notify_client(addr, msg, self.notify_timeout).await) }
        }))
        .await;

        let mut outcome = MigrateOutcome::default();
        for (ip, result) in results {
            match result {
                Ok(()) => outcome.notified.push(ip),
                Err(e) => {
                    warn!(client = %ip, error = %e, "Client notification failed");
                    outcome.failed.push(ip);
                }
            }
        }
        outcome.drained = self.sessions.drain(&[]);

        info!(
            endpoint = %endpoint,
            notified = outcome.notified.len(),
            failed = outcome.failed.len(),
            drained = outcome.drained,
            "Migrated attached clients"
        );
        outcome
    }
}

async fn reply_error<W>(writer: &mut W, err: &ProtoError) -> Result<(), ProtoError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    write_line(writer, &format!("error: {err}")).await?;
    writer.shutdown().await?;
    Ok(())
}
