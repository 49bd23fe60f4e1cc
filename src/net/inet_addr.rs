//! An address value type that unifies IPv4 and IPv6 behind accessors for
//! family, port, textual form, and byte-order-correct construction.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

/// A total value wrapping either an IPv4 or an IPv6 socket address.
///
/// `std::net::SocketAddr` already stores either variant in one enum and
/// gives family/port/text accessors for both; this type exists to carry
/// the construction and formatting conventions the runtime needs (e.g.
/// `[ipv6]:port` bracketing, loopback-only and port-only constructors)
/// without leaking `std::net` choices into every call site.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct InetAddress(SocketAddr);

impl InetAddress {
    /// Bind-to-any address on `port`.
    pub fn new(port: u16, loopback_only: bool, ipv6: bool) -> InetAddress {
        let addr = if ipv6 {
            SocketAddr::new(
                if loopback_only {
                    std::net::Ipv6Addr::LOCALHOST.into()
                } else {
                    std::net::Ipv6Addr::UNSPECIFIED.into()
                },
                port,
            )
        } else {
            SocketAddr::new(
                if loopback_only {
                    Ipv4Addr::LOCALHOST.into()
                } else {
                    Ipv4Addr::UNSPECIFIED.into()
                },
                port,
            )
        };
        InetAddress(addr)
    }

    /// Parse a textual IP plus a port, auto-detecting v4/v6 by the
    /// presence of `:` in the text (matches the scan the wrapped
    /// constructor does, without requiring the caller to pass a flag).
    pub fn from_ip_port(ip: &str, port: u16) -> io::Result<InetAddress> {
        if ip.contains(':') {
            let addr: std::net::Ipv6Addr = ip
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad ipv6 address"))?;
            Ok(InetAddress(SocketAddr::new(addr.into(), port)))
        } else {
            let addr: Ipv4Addr = ip
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad ipv4 address"))?;
            Ok(InetAddress(SocketAddr::new(addr.into(), port)))
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> InetAddress {
        InetAddress(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn family(&self) -> libc::sa_family_t {
        match self.0 {
            SocketAddr::V4(_) => libc::AF_INET as libc::sa_family_t,
            SocketAddr::V6(_) => libc::AF_INET6 as libc::sa_family_t,
        }
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn to_ip(&self) -> String {
        match self.0 {
            SocketAddr::V4(a) => a.ip().to_string(),
            SocketAddr::V6(a) => a.ip().to_string(),
        }
    }

    /// `ip:port`, or `[ip]:port` for IPv6.
    pub fn to_ip_port(&self) -> String {
        self.0.to_string()
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.0, SocketAddr::V4(_))
    }

    /// Blocking hostname -> IPv4 resolve. Provided for completeness; not
    /// used on any hot path.
    pub fn resolve(hostname: &str) -> io::Result<InetAddress> {
        (hostname, 0u16)
            .to_socket_addrs()?
            .find(|a| a.is_ipv4())
            .map(InetAddress::from_socket_addr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no A record"))
    }

    pub fn any_v4(port: u16) -> InetAddress {
        InetAddress(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)))
    }
}

impl std::fmt::Display for InetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_ip_port())
    }
}
