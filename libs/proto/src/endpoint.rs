use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtoError;

/// A proxy identity as advertised to clients: an address and, optionally,
/// the port the tunnel listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: Option<u16>) -> Self {
        Self { ip, port }
    }

    /// Resolves to a socket address, using `default_port` when none was given.
    pub fn socket_addr(&self, default_port: u16) -> SocketAddr {
        SocketAddr::new(self.ip, self.port.unwrap_or(default_port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), Some(addr.port()))
    }
}

impl From<IpAddr> for Endpoint {
    fn from(ip: IpAddr) -> Self {
        Self::new(ip, None)
    }
}

impl FromStr for Endpoint {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        s.parse::<IpAddr>()
            .map(Into::into)
            .map_err(|_| ProtoError::InvalidEndpoint(s.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ip, self.port) {
            (ip, None) => write!(f, "{ip}"),
            (IpAddr::V4(ip), Some(port)) => write!(f, "{ip}:{port}"),
            (IpAddr::V6(ip), Some(port)) => write!(f, "[{ip}]:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("203.0.113.7", "203.0.113.7", None)]
    #[case("203.0.113.7:51820", "203.0.113.7", Some(51820))]
    #[case("2001:db8::1", "2001:db8::1", None)]
    #[case("[2001:db8::1]:443", "2001:db8::1", Some(443))]
    fn test_parse(#[case] raw: &str, #[case] ip: &str, #[case] port: Option<u16>) {
        let ep: Endpoint = raw.parse().unwrap();
        assert_eq!(ep.ip, ip.parse::<IpAddr>().unwrap());
        assert_eq!(ep.port, port);
        assert_eq!(ep.to_string(), raw);
    }

    #[rstest]
    #[case("")]
    #[case("example.com")]
    #[case("203.0.113.7:")]
    #[case("203.0.113.7:70000")]
    #[case("300.1.1.1")]
    fn test_parse_rejects(#[case] raw: &str) {
        assert!(matches!(
            raw.parse::<Endpoint>(),
            Err(ProtoError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_socket_addr_default_port() {
        let ep: Endpoint = "198.51.100.2".parse().unwrap();
        assert_eq!(ep.socket_addr(1248).to_string(), "198.51.100.2:1248");
        let ep: Endpoint = "198.51.100.2:9".parse().unwrap();
        assert_eq!(ep.socket_addr(1248).port(), 9);
    }
}
