//! Network transports for KNXnet/IP.
//!
//! Every transport implements [`transport::AsyncTransport`] and moves whole
//! KNXnet/IP frames:
//!
//! - [`udp::UdpTransport`] - unicast datagrams for tunnelling and description
//! - [`tcp::TcpTransport`] - stream connection with frame reassembly
//! - [`multicast::MulticastTransport`] - routing and discovery on 224.0.23.12
//! - [`mock_transport::MockTransport`] - channel-backed fake for tests

pub mod mock_transport;
pub mod multicast;
pub mod tcp;
pub mod transport;
pub mod udp;

use crate::error::{KnxError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// Local IPv4 address used to reach `remote`.
///
/// Connects an unbound UDP socket (no packet is sent) and reads back the
/// address the routing table picked.
pub fn local_ipv4_for(remote: Ipv4Addr) -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((remote, crate::protocol::constants::KNXNETIP_DEFAULT_PORT))?;
    match socket.local_addr()? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Ok(*addr.ip()),
        _ => Err(KnxError::no_local_address()),
    }
}

/// IPv4 addresses of every interface that is up, multicast capable and not
/// loopback.
#[cfg(unix)]
pub fn local_ipv4_interfaces() -> Result<Vec<Ipv4Addr>> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;

    let mut found = Vec::new();
    for interface in getifaddrs().map_err(std::io::Error::from)? {
        let flags = interface.flags;
        if !flags.contains(InterfaceFlags::IFF_UP)
            || !flags.contains(InterfaceFlags::IFF_MULTICAST)
            || flags.contains(InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }
        let Some(ip) = interface
            .address
            .as_ref()
            .and_then(|address| address.as_sockaddr_in())
            .map(|address| address.ip())
        else {
            continue;
        };
        if !found.contains(&ip) {
            found.push(ip);
        }
    }
    Ok(found)
}

/// IPv4 address of the interface routing to the KNX multicast group.
#[cfg(not(unix))]
pub fn local_ipv4_interfaces() -> Result<Vec<Ipv4Addr>> {
    local_ipv4_for(crate::protocol::constants::KNXNETIP_MULTICAST_ADDR).map(|ip| vec![ip])
}

/// IPv4 part of `addr`.
pub(crate) fn ipv4_of(addr: SocketAddr) -> Result<Ipv4Addr> {
    match addr.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(KnxError::no_local_address()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_of() {
        assert_eq!(
            ipv4_of("192.168.1.10:3671".parse().unwrap()).unwrap(),
            Ipv4Addr::new(192, 168, 1, 10)
        );
        assert!(ipv4_of("[::1]:3671".parse().unwrap()).is_err());
    }

    #[test]
    fn test_local_ipv4_for_loopback() {
        assert_eq!(
            local_ipv4_for(Ipv4Addr::LOCALHOST).unwrap(),
            Ipv4Addr::LOCALHOST
        );
    }
}
