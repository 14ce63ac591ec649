//! Network transport abstraction for KNXnet/IP communication.
//!
//! This module provides the [`AsyncTransport`] trait that abstracts the
//! underlying socket, enabling:
//! - Testability through [`MockTransport`](super::mock_transport::MockTransport)
//! - UDP, TCP stream and multicast transports behind one interface
//! - KNX IP Secure as a decorator ([`SecureSession`](crate::secure::session::SecureSession))
//!   that wraps any other transport
//!
//! A transport moves whole KNXnet/IP frames. Stream transports reassemble
//! frames before returning them; datagram transports return one datagram.
//!
//! ## Example
//!
//! ```rust,no_run
//! use knx_engine::net::transport::AsyncTransport;
//! use knx_engine::net::udp::UdpTransport;
//!
//! # async fn run() -> knx_engine::Result<()> {
//! let mut transport = UdpTransport::bind("0.0.0.0:0".parse().unwrap()).await?;
//! let gateway = "192.168.1.10:3671".parse().unwrap();
//! transport.send_to(&[0x06, 0x10, 0x02, 0x01, 0x00, 0x0E], gateway).await?;
//!
//! let mut buf = [0u8; 1024];
//! let (n, from) = transport.recv_from(&mut buf).await?;
//! # let _ = (n, from);
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::time::Instant;

/// Transport protocol, as advertised in HPAIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportProtocol {
    /// Datagrams (unicast or multicast)
    Udp,
    /// Stream connection
    Tcp,
}

/// Asynchronous network transport.
///
/// # Cancellation
///
/// `recv_from` must be cancel-safe: the connection tasks poll it inside
/// `tokio::select!` next to timers and the outbound queue, and a cancelled
/// call must not lose a frame.
#[async_trait]
pub trait AsyncTransport: Send {
    /// Send one frame.
    ///
    /// Stream transports ignore `addr`.
    ///
    /// # Errors
    ///
    /// Returns error if the socket fails or the transport is closed.
    async fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<()>;

    /// Receive one frame into `buf`.
    ///
    /// # Returns
    ///
    /// A tuple of:
    /// - Number of bytes received
    /// - Source endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the receive fails, the frame does not fit in `buf`
    /// or the peer closed the transport.
    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Local address the transport is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Datagram or stream.
    fn protocol(&self) -> TransportProtocol;

    /// Check if the transport is currently usable.
    fn is_ready(&self) -> bool {
        true
    }

    /// Instant at which [`maintain`](Self::maintain) must be called.
    ///
    /// Default implementation never asks for maintenance.
    fn maintenance_deadline(&self) -> Option<Instant> {
        None
    }

    /// Periodic work such as session keepalives.
    async fn maintain(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the transport and release resources.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: AsyncTransport + ?Sized> AsyncTransport for Box<T> {
    async fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<()> {
        (**self).send_to(data, addr).await
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        (**self).recv_from(buf).await
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        (**self).local_addr()
    }

    fn protocol(&self) -> TransportProtocol {
        (**self).protocol()
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn maintenance_deadline(&self) -> Option<Instant> {
        (**self).maintenance_deadline()
    }

    async fn maintain(&mut self) -> Result<()> {
        (**self).maintain().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}

/// Opens fresh transports, used when a connection has to be rebuilt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Transport type produced
    type Transport: AsyncTransport + 'static;

    /// Open a new transport.
    async fn open(&self) -> Result<Self::Transport>;
}
