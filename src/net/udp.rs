//! Unicast UDP transport.

use crate::error::Result;
use crate::net::transport::{AsyncTransport, TransportFactory, TransportProtocol};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// One UDP socket used for both control and data endpoint of a tunnel.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind to `local`. Port 0 picks an ephemeral port.
    pub async fn bind(local: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        knx_log!(debug, "UDP transport bound to {}", socket.local_addr()?);
        Ok(Self { socket })
    }
}

#[async_trait]
impl AsyncTransport for UdpTransport {
    async fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<()> {
        knx_log!(target: raw, trace, "UDP -> {}: {:02X?}", addr, data);
        self.socket.send_to(data, addr).await?;
        Ok(())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (n, from) = self.socket.recv_from(buf).await?;
        knx_log!(target: raw, trace, "UDP <- {}: {:02X?}", from, &buf[..n]);
        Ok((n, from))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }
}

/// Opens a [`UdpTransport`] bound to a fixed local address.
#[derive(Debug, Clone, Copy)]
pub struct UdpFactory {
    /// Local bind address
    pub local: SocketAddr,
}

#[async_trait]
impl TransportFactory for UdpFactory {
    type Transport = UdpTransport;

    async fn open(&self) -> Result<UdpTransport> {
        UdpTransport::bind(self.local).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_datagram() {
        let mut a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(&[0x06, 0x10, 0x02, 0x03, 0x00, 0x06], b_addr)
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x06, 0x10, 0x02, 0x03, 0x00, 0x06]);
        assert_eq!(from, a.local_addr().unwrap());
        assert_eq!(b.protocol(), TransportProtocol::Udp);
    }
}
