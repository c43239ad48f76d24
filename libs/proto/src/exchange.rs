//! One-shot command exchanges, each over its own TCP connection.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::{read_line, write_line, BrokerCommand, MigrationMessage, ProtoError};

/// Sends a migration message to a client and closes the connection.
///
/// Connect and send share one deadline so an unreachable client costs at
/// most `limit`.
pub async fn notify_client(
    addr: SocketAddr,
    msg: &MigrationMessage,
    limit: Duration,
) -> Result<(), ProtoError> {
    let line = msg.to_string();
    timeout(limit, async {
        let mut stream = TcpStream::connect(addr).await?;
        write_line(&mut stream, &line).await?;
        stream.shutdown().await?;
        Ok(())
    })
    .await
    .map_err(|_| ProtoError::Timeout(limit))?
}

/// Sends a broker command and collects every reply line until the broker
/// closes the connection.
pub async fn send_command(
    addr: SocketAddr,
    cmd: &BrokerCommand,
    limit: Duration,
) -> Result<Vec<String>, ProtoError> {
    let line = cmd.to_string();
    timeout(limit, async {
        let mut stream = TcpStream::connect(addr).await?;
        write_line(&mut stream, &line).await?;
        stream.shutdown().await?;

        let mut reader = BufReader::new(stream);
        let mut replies = Vec::new();
        while let Some(reply) = read_line(&mut reader).await? {
            replies.push(reply);
        }
        Ok(replies)
    })
    .await
    .map_err(|_| ProtoError::Timeout(limit))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_notify_client_sends_one_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = String::new();
            sock.read_to_string(&mut buf).await.unwrap();
            buf
        });

        let msg = MigrationMessage::parse("migrate 198.51.100.4:51820").unwrap();
        notify_client(addr, &msg, Duration::from_secs(2)).await.unwrap();

        assert_eq!(server.await.unwrap(), "migrate 198.51.100.4:51820\n");
    }

    #[tokio::test]
    async fn test_notify_client_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let msg = MigrationMessage::parse("migrate 198.51.100.4").unwrap();
        let err = notify_client(addr, &msg, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtoError::Io(_)));
    }

    #[tokio::test]
    async fn test_send_command_collects_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (r, mut w) = sock.into_split();
            let mut r = BufReader::new(r);
            let line = read_line(&mut r).await.unwrap().unwrap();
            assert_eq!(line, "clients");
            write_line(&mut w, "10.1.0.1").await.unwrap();
            write_line(&mut w, "10.1.0.2").await.unwrap();
        });

        let replies = send_command(addr, &BrokerCommand::Clients, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(replies, vec!["10.1.0.1", "10.1.0.2"]);
    }
}
