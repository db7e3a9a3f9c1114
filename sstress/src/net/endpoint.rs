//! Network endpoint types.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

/// A network endpoint (IP address + port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(addr, port))
    }

    /// Creates a localhost endpoint on the given port.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)))
    }

    /// The endpoint for `host` when it is already an IP address.
    #[must_use]
    pub fn literal(host: &str, port: u16) -> Option<Self> {
        host.parse::<IpAddr>().ok().map(|ip| Self::new(ip, port))
    }

    /// Resolves a policy host name, preferring IPv4 answers.
    ///
    /// Blocks; see [`Resolver`](super::Resolver) for lookups from the loop.
    ///
    /// # Errors
    ///
    /// Returns the resolver error, or `NotFound` if it yields no address.
    pub fn resolve(host: &str, port: u16) -> io::Result<Self> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .map(Self)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{host}:{port} resolved to no address"),
                )
            })
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_literal_address() {
        let ep = Endpoint::resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(ep, Endpoint::localhost(8080));
        assert_eq!(ep.port(), 8080);
        assert_eq!(ep.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn literal_skips_host_names() {
        assert_eq!(
            Endpoint::literal("127.0.0.1", 81),
            Some(Endpoint::localhost(81))
        );
        assert_eq!(Endpoint::literal("::1", 81).map(|e| e.ip().is_ipv6()), Some(true));
        assert_eq!(Endpoint::literal("warmcat.com", 81), None);
    }

    #[test]
    fn resolve_localhost_prefers_v4() {
        let ep = Endpoint::resolve("localhost", 80).unwrap();
        assert!(ep.ip().is_loopback());
    }

    #[test]
    fn endpoint_display() {
        assert_eq!(format!("{}", Endpoint::localhost(8080)), "127.0.0.1:8080");
    }
}
