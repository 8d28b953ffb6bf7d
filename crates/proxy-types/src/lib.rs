//! Destination address model shared by every proxy protocol in the
//! workspace, together with the RFC 1928 byte-level address codec that
//! SOCKS5, Shadowsocks, VMESS and Trojan all embed in their wire formats.

pub mod codec;

use core::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DestAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

/// Bounded address (used in responses)
pub type BoundAddr = DestAddr;

impl DestAddr {
    /// Classifies a host string: an IP literal becomes [`DestAddr::Ip`],
    /// anything else is carried as a domain name to be resolved by
    /// whoever terminates the tunnel.
    pub fn from_host(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => DestAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => DestAddr::Domain(host.to_owned(), port),
        }
    }

    pub fn as_ip(&self) -> Option<SocketAddr> {
        match self {
            DestAddr::Ip(ip) => Some(*ip),
            _ => None,
        }
    }

    pub fn as_domain(&self) -> Option<(&str, u16)> {
        match self {
            DestAddr::Domain(dns, port) => Some((dns, *port)),
            _ => None,
        }
    }

    pub fn host(&self) -> String {
        match self {
            DestAddr::Ip(addr) => addr.ip().to_string(),
            DestAddr::Domain(dns, _) => dns.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            DestAddr::Ip(addr) => addr.port(),
            DestAddr::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for DestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestAddr::Ip(addr) => addr.fmt(f),
            DestAddr::Domain(dns, port) => write!(f, "{dns}:{port}"),
        }
    }
}

/// Conversion into a [`DestAddr`], in the spirit of
/// `std::net::ToSocketAddrs` but without ever touching the resolver:
/// unresolved names stay names.
pub trait ToDestAddr {
    fn to_dest_addr(&self) -> io::Result<DestAddr>;
}

impl ToDestAddr for DestAddr {
    fn to_dest_addr(&self) -> io::Result<DestAddr> {
        Ok(self.clone())
    }
}

impl ToDestAddr for SocketAddr {
    fn to_dest_addr(&self) -> io::Result<DestAddr> {
        Ok(DestAddr::Ip(*self))
    }
}

impl ToDestAddr for (IpAddr, u16) {
    fn to_dest_addr(&self) -> io::Result<DestAddr> {
        Ok(DestAddr::Ip(SocketAddr::new(self.0, self.1)))
    }
}

impl ToDestAddr for (&str, u16) {
    fn to_dest_addr(&self) -> io::Result<DestAddr> {
        Ok(DestAddr::from_host(self.0, self.1))
    }
}

/// `"host:port"`, where host is a domain name, an IPv4 literal or a
/// bracketed IPv6 literal (`[2001:db8::1]:443`).
impl ToDestAddr for &str {
    fn to_dest_addr(&self) -> io::Result<DestAddr> {
        let (host, port) = self
            .rsplit_once(':')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("`{self}` is missing a port")))?;

        let port = port
            .parse::<u16>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("`{port}` is not a valid port")))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("`{self}` is missing a host"),
            ));
        }

        Ok(DestAddr::from_host(host, port))
    }
}

impl ToDestAddr for String {
    fn to_dest_addr(&self) -> io::Result<DestAddr> {
        self.as_str().to_dest_addr()
    }
}

impl<T: ToDestAddr + ?Sized> ToDestAddr for &T {
    fn to_dest_addr(&self) -> io::Result<DestAddr> {
        (**self).to_dest_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_conversion() {
        let addr = ("swift.org", 443).to_dest_addr().unwrap();
        assert_eq!(addr, DestAddr::Domain("swift.org".to_owned(), 443));
        assert_eq!(addr.to_string(), "swift.org:443");
    }

    #[test]
    fn ip_literals_are_not_domains() {
        let addr = ("192.168.1.1", 80).to_dest_addr().unwrap();
        assert_eq!(addr, DestAddr::Ip("192.168.1.1:80".parse().unwrap()));

        let addr = ("2001:db8::1", 443).to_dest_addr().unwrap();
        assert_eq!(addr.as_ip().map(|a| a.port()), Some(443));
    }

    #[test]
    fn host_port_string() {
        let addr = "example.net:8080".to_dest_addr().unwrap();
        assert_eq!(addr.as_domain(), Some(("example.net", 8080)));
    }

    #[test]
    fn bracketed_ipv6_string() {
        let addr = "[2001:db8::1]:443".to_dest_addr().unwrap();
        assert_eq!(addr, DestAddr::Ip("[2001:db8::1]:443".parse().unwrap()));
    }

    #[test]
    fn malformed_strings_are_rejected() {
        assert!("no-port-here".to_dest_addr().is_err());
        assert!("bad:port:x".to_dest_addr().is_err());
        assert!(":443".to_dest_addr().is_err());
        assert!("host:99999".to_dest_addr().is_err());
    }
}
