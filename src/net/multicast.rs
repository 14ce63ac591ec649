//! Multicast UDP transport for routing and discovery.
//!
//! The socket is built with `socket2` so address reuse, the outgoing
//! interface and group membership can be set before tokio takes it over.
//! Outgoing multicast is looped back; [`MulticastTransport::is_own`] tells
//! those echoes apart from frames sent by other devices.

use crate::error::Result;
use crate::net::transport::{AsyncTransport, TransportFactory, TransportProtocol};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

/// Multicast TTL used for KNXnet/IP routing
pub const MULTICAST_TTL: u32 = 16;

/// UDP socket joined to a multicast group on one interface.
#[derive(Debug)]
pub struct MulticastTransport {
    socket: UdpSocket,
    group: SocketAddrV4,
    local: SocketAddrV4,
}

impl MulticastTransport {
    /// Bind to `group.port()` on all interfaces and join `group` on
    /// `interface`.
    pub fn join(group: SocketAddrV4, interface: Ipv4Addr) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_multicast_if_v4(&interface)?;
        socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        socket.set_multicast_loop_v4(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port()).into())?;
        socket.join_multicast_v4(group.ip(), &interface)?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        knx_log!(
            debug,
            "Joined multicast group {} on interface {}",
            group,
            interface
        );
        Ok(Self {
            socket,
            group,
            local: SocketAddrV4::new(interface, group.port()),
        })
    }

    /// Unjoined socket on `interface` with an ephemeral port, sending
    /// multicast through that interface. Used for search requests; the
    /// responses come back unicast.
    pub fn sender(group: SocketAddrV4, interface: Ipv4Addr) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_multicast_if_v4(&interface)?;
        socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        socket.bind(&SocketAddrV4::new(interface, 0).into())?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        let port = socket.local_addr()?.port();
        Ok(Self {
            socket,
            group,
            local: SocketAddrV4::new(interface, port),
        })
    }

    /// Multicast group and port
    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    /// Interface address and port frames are sent from
    pub fn local_endpoint(&self) -> SocketAddrV4 {
        self.local
    }

    /// `true` if a datagram from `source` is our own looped-back send.
    pub fn is_own(&self, source: SocketAddr) -> bool {
        source == SocketAddr::V4(self.local)
    }
}

#[async_trait]
impl AsyncTransport for MulticastTransport {
    async fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<()> {
        knx_log!(target: raw, trace, "MC -> {}: {:02X?}", addr, data);
        self.socket.send_to(data, addr).await?;
        Ok(())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (n, from) = self.socket.recv_from(buf).await?;
        knx_log!(target: raw, trace, "MC <- {}: {:02X?}", from, &buf[..n]);
        Ok((n, from))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::V4(self.local))
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }
}

/// Joins a multicast group on one interface.
#[derive(Debug, Clone, Copy)]
pub struct MulticastFactory {
    /// Group and port
    pub group: SocketAddrV4,
    /// Interface address
    pub interface: Ipv4Addr,
}

#[async_trait]
impl TransportFactory for MulticastFactory {
    type Transport = MulticastTransport;

    async fn open(&self) -> Result<MulticastTransport> {
        MulticastTransport::join(self.group, self.interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sender_reports_interface_endpoint() {
        let group = SocketAddrV4::new(Ipv4Addr::new(224, 0, 23, 12), 3671);
        let transport = MulticastTransport::sender(group, Ipv4Addr::LOCALHOST).unwrap();
        let local = transport.local_endpoint();
        assert_eq!(*local.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(local.port(), 0);
        assert!(transport.is_own(SocketAddr::V4(local)));
        assert!(!transport.is_own("127.0.0.1:1".parse().unwrap()));
        assert_eq!(transport.group(), group);
    }
}
