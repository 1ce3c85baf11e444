//! Address-family helpers: classifying literals and binding a UDP socket
//! paired with an existing TCP socket's local address family.

use std::net::{IpAddr, SocketAddr};

use tokio::net::{TcpStream, UdpSocket};

use firefly_core::Result;

/// How a destination string should be treated: IPv4 literal, IPv6 literal,
/// or a DNS name (anything that fails to parse as either).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    V4,
    V6,
    Domain,
}

pub fn addr_type(literal: &str) -> AddrType {
    match literal.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => AddrType::V4,
        Ok(IpAddr::V6(_)) => AddrType::V6,
        Err(_) => AddrType::Domain,
    }
}

/// Bind an ephemeral UDP socket on the same local IP as `tcp_sock`'s local
/// address (same family it is already bound to).
pub async fn bind_local_udp(tcp_sock: &TcpStream) -> Result<UdpSocket> {
    let local = tcp_sock.local_addr()?;
    let bind_addr = SocketAddr::new(local.ip(), 0);
    Ok(UdpSocket::bind(bind_addr).await?)
}

/// Bind an ephemeral UDP socket and connect it to `remote`, so that this
/// socket can be used as `remoteUDP` in a smart SOCKS UDP session.
pub async fn bind_connected_udp(remote: SocketAddr) -> Result<UdpSocket> {
    let bind_addr: SocketAddr = if remote.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let sock = UdpSocket::bind(bind_addr).await?;
    sock.connect(remote).await?;
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_type_ipv4() {
        assert_eq!(addr_type("93.184.216.34"), AddrType::V4);
    }

    #[test]
    fn test_addr_type_ipv6() {
        assert_eq!(addr_type("::1"), AddrType::V6);
    }

    #[test]
    fn test_addr_type_domain() {
        assert_eq!(addr_type("example.com"), AddrType::Domain);
    }
}
