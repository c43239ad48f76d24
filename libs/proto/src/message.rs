//! Command grammar.

use std::fmt;
use std::net::IpAddr;

use crate::{Endpoint, ProtoError, MAX_LINE_LEN};

/// `migrate <ip>[:<port>]`: tells a client (or a proxy broker) where the
/// new identity lives. Applying it twice with the same endpoint only
/// reconfigures redundantly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationMessage {
    pub endpoint: Endpoint,
}

impl MigrationMessage {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Parses one line without its terminator.
    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        match BrokerCommand::parse(line)? {
            BrokerCommand::Migrate(endpoint) => Ok(Self { endpoint }),
            other => Err(ProtoError::UnknownCommand(other.keyword().to_string())),
        }
    }
}

impl fmt::Display for MigrationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "migrate {}", self.endpoint)
    }
}

/// Commands understood by the broker endpoint a proxy runs for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCommand {
    /// Notify every attached client of the new endpoint, then drain.
    Migrate(Endpoint),
    /// List attached data-plane clients, one [`Attachment`] per line.
    Clients,
    /// Close data-plane sessions. With no addresses: all sessions, and stop
    /// accepting new ones.
    Drain(Vec<IpAddr>),
}

impl BrokerCommand {
    pub fn keyword(&self) -> &'static str {
        match self {
            BrokerCommand::Migrate(_) => "migrate",
            BrokerCommand::Clients => "clients",
            BrokerCommand::Drain(_) => "drain",
        }
    }

    /// Split a selective drain into `drain` commands that each fit on one
    /// line. An empty list yields the single drain-everything command.
    pub fn drain_batches(clients: &[IpAddr]) -> Vec<BrokerCommand> {
        // Room left after the keyword and the terminator.
        let budget = MAX_LINE_LEN - "drain".len() - 1;
        let mut batches = Vec::new();
        let mut batch: Vec<IpAddr> = Vec::new();
        let mut used = 0;
        for ip in clients {
            let cost = ip.to_string().len() + 1;
            if !batch.is_empty() && used + cost > budget {
                batches.push(BrokerCommand::Drain(std::mem::take(&mut batch)));
                used = 0;
            }
            batch.push(*ip);
            used += cost;
        }
        if !batch.is_empty() || batches.is_empty() {
            batches.push(BrokerCommand::Drain(batch));
        }
        batches
    }

    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        let mut words = line.split_ascii_whitespace();
        let keyword = words.next().ok_or(ProtoError::Empty)?;
        let args: Vec<&str> = words.collect();

        if keyword.eq_ignore_ascii_case("migrate") {
            let [target] = args.as_slice() else {
                return Err(ProtoError::WrongArity {
                    command: "migrate",
                    expected: "exactly 1",
                    got: args.len(),
                });
            };
            Ok(BrokerCommand::Migrate(target.parse()?))
        } else if keyword.eq_ignore_ascii_case("clients") {
            if !args.is_empty() {
                return Err(ProtoError::WrongArity {
                    command: "clients",
                    expected: "no",
                    got: args.len(),
                });
            }
            Ok(BrokerCommand::Clients)
        } else if keyword.eq_ignore_ascii_case("drain") {
            let ips = args
                .iter()
                .map(|a| {
                    a.parse::<IpAddr>()
                        .map_err(|_| ProtoError::InvalidEndpoint((*a).to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(BrokerCommand::Drain(ips))
        } else {
            Err(ProtoError::UnknownCommand(keyword.to_string()))
        }
    }
}

impl fmt::Display for BrokerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerCommand::Migrate(endpoint) => write!(f, "migrate {endpoint}"),
            BrokerCommand::Clients => f.write_str("clients"),
            BrokerCommand::Drain(ips) => {
                f.write_str("drain")?;
                for ip in ips {
                    write!(f, " {ip}")?;
                }
                Ok(())
            }
        }
    }
}

/// One line of a `clients` reply: `<client_ip> [<proxy_ip>]`.
///
/// `via` is the proxy address the client's session arrived on. Brokers
/// that cannot tell leave it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attachment {
    pub client: IpAddr,
    pub via: Option<IpAddr>,
}

impl Attachment {
    pub fn new(client: IpAddr, via: Option<IpAddr>) -> Self {
        Self { client, via }
    }

    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        let ip = |s: &str| {
            s.parse::<IpAddr>()
                .map_err(|_| ProtoError::InvalidEndpoint(s.to_string()))
        };
        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        match fields.as_slice() {
            [client] => Ok(Self::new(ip(client)?, None)),
            [client, via] => Ok(Self::new(ip(client)?, Some(ip(via)?))),
            _ => Err(ProtoError::InvalidEndpoint(line.to_string())),
        }
    }
}

impl fmt::Display for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.via {
            Some(via) => write!(f, "{} {via}", self.client),
            None => write!(f, "{}", self.client),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("migrate 203.0.113.9", "203.0.113.9", None)]
    #[case("MIGRATE 203.0.113.9:51820", "203.0.113.9", Some(51820))]
    #[case("  Migrate   [2001:db8::5]:7  ", "2001:db8::5", Some(7))]
    fn test_migration_message_parse(
        #[case] line: &str,
        #[case] ip: &str,
        #[case] port: Option<u16>,
    ) {
        let msg = MigrationMessage::parse(line).unwrap();
        assert_eq!(msg.endpoint.ip, ip.parse::<IpAddr>().unwrap());
        assert_eq!(msg.endpoint.port, port);
    }

    #[test]
    fn test_migration_message_display() {
        let msg = MigrationMessage::parse("migrate 203.0.113.9:51820").unwrap();
        assert_eq!(msg.to_string(), "migrate 203.0.113.9:51820");
    }

    #[rstest]
    #[case("")]
    #[case("migrate")]
    #[case("migrate 1.2.3.4 5.6.7.8")]
    #[case("migrate not-an-ip")]
    #[case("clients")]
    #[case("hello 1.2.3.4")]
    fn test_migration_message_rejects(#[case] line: &str) {
        assert!(MigrationMessage::parse(line).is_err());
    }

    #[test]
    fn test_broker_commands() {
        assert_eq!(BrokerCommand::parse("clients").unwrap(), BrokerCommand::Clients);
        assert_eq!(
            BrokerCommand::parse("drain").unwrap(),
            BrokerCommand::Drain(vec![])
        );
        assert_eq!(
            BrokerCommand::parse("DRAIN 10.0.0.1 10.0.0.2").unwrap(),
            BrokerCommand::Drain(vec![
                "10.0.0.1".parse().unwrap(),
                "10.0.0.2".parse().unwrap()
            ])
        );
        assert!(matches!(
            BrokerCommand::parse("clients extra"),
            Err(ProtoError::WrongArity { command: "clients", .. })
        ));
        assert!(matches!(
            BrokerCommand::parse("drain nope"),
            Err(ProtoError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_drain_batches_fit_on_a_line() {
        let clients: Vec<IpAddr> = (0..40)
            .map(|i| format!("203.0.113.{}", 100 + i).parse().unwrap())
            .chain((0..10).map(|i| format!("2001:db8:ffff:ffff::{i:x}").parse().unwrap()))
            .collect();

        let batches = BrokerCommand::drain_batches(&clients);
        assert!(batches.len() > 1);

        let mut covered = Vec::new();
        for cmd in &batches {
            assert!(cmd.to_string().len() < MAX_LINE_LEN);
            match BrokerCommand::parse(&cmd.to_string()).unwrap() {
                BrokerCommand::Drain(ips) => {
                    assert!(!ips.is_empty());
                    covered.extend(ips);
                }
                other => panic!("unexpected command: {other}"),
            }
        }
        assert_eq!(covered, clients);
    }

    #[test]
    fn test_drain_batches_of_nothing_drains_all() {
        assert_eq!(
            BrokerCommand::drain_batches(&[]),
            vec![BrokerCommand::Drain(vec![])]
        );
        let one: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            BrokerCommand::drain_batches(&[one]),
            vec![BrokerCommand::Drain(vec![one])]
        );
    }

    #[rstest]
    #[case("10.0.0.7 198.51.100.1", "10.0.0.7", Some("198.51.100.1"))]
    #[case("  10.0.0.7  ", "10.0.0.7", None)]
    #[case("2001:db8::7 2001:db8::1", "2001:db8::7", Some("2001:db8::1"))]
    fn test_attachment_parse(
        #[case] line: &str,
        #[case] client: &str,
        #[case] via: Option<&str>,
    ) {
        let attachment = Attachment::parse(line).unwrap();
        assert_eq!(attachment.client, client.parse::<IpAddr>().unwrap());
        assert_eq!(attachment.via, via.map(|v| v.parse().unwrap()));
        assert_eq!(Attachment::parse(&attachment.to_string()).unwrap(), attachment);
    }

    #[rstest]
    #[case("")]
    #[case("not-an-ip")]
    #[case("10.0.0.7 nope")]
    #[case("10.0.0.7 10.0.0.8 10.0.0.9")]
    fn test_attachment_rejects(#[case] line: &str) {
        assert!(Attachment::parse(line).is_err());
    }

    #[test]
    fn test_broker_command_display_reparses() {
        let cmd = BrokerCommand::Drain(vec!["10.0.0.1".parse().unwrap()]);
        assert_eq!(cmd.to_string(), "drain 10.0.0.1");
        assert_eq!(BrokerCommand::parse(&cmd.to_string()).unwrap(), cmd);
    }
}
