//! Mock transport implementation for testing.
//!
//! [`MockTransport`] implements [`AsyncTransport`] on top of two tokio
//! channels. The other ends form a [`MockHandle`] that plays the gateway:
//! it injects frames the transport will receive and observes every frame the
//! transport sends. Because `recv_from` simply awaits the channel, tests run
//! fine under `#[tokio::test(start_paused = true)]`.
//!
//! ## Example
//!
//! ```rust
//! use knx_engine::net::mock_transport::MockTransport;
//! use knx_engine::net::transport::AsyncTransport;
//! use knx_engine::protocol::frame::KnxIpFrame;
//! use knx_engine::protocol::services::ConnectionStateResponse;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> knx_engine::Result<()> {
//! let gateway = "192.168.1.10:3671".parse().unwrap();
//! let (mut transport, mut handle) = MockTransport::pair(gateway);
//!
//! // Program a response
//! handle.add_response(&KnxIpFrame::ConnectionStateResponse(ConnectionStateResponse {
//!     communication_channel_id: 1,
//!     status_code: 0,
//! }));
//!
//! let mut buf = [0u8; 64];
//! let (n, from) = transport.recv_from(&mut buf).await?;
//! assert_eq!(n, 8);
//! assert_eq!(from, gateway);
//!
//! // Verify what was sent
//! transport.send_to(&buf[..n], gateway).await?;
//! assert_eq!(handle.sent_packets().len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::error::{KnxError, Result};
use crate::net::transport::{AsyncTransport, TransportFactory, TransportProtocol};
use crate::protocol::frame::KnxIpFrame;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::{mpsc, Mutex};

type Packet = (Vec<u8>, SocketAddr);

/// Mock transport for testing KNX communication without real network.
#[derive(Debug)]
pub struct MockTransport {
    /// Frames to hand out from `recv_from()`
    inbound: mpsc::UnboundedReceiver<Packet>,
    /// Record of all packets sent via `send_to()`
    outbound: mpsc::UnboundedSender<Packet>,
    local: SocketAddr,
    protocol: TransportProtocol,
    ready: bool,
}

/// Gateway side of a [`MockTransport`].
#[derive(Debug)]
pub struct MockHandle {
    inbound: Option<mpsc::UnboundedSender<Packet>>,
    outbound: mpsc::UnboundedReceiver<Packet>,
    peer: SocketAddr,
}

impl MockTransport {
    /// Create a UDP-flavoured transport whose frames appear to come from `peer`.
    pub fn pair(peer: SocketAddr) -> (Self, MockHandle) {
        Self::pair_with_protocol(peer, TransportProtocol::Udp)
    }

    /// Same as [`pair`](Self::pair) with an explicit protocol.
    pub fn pair_with_protocol(peer: SocketAddr, protocol: TransportProtocol) -> (Self, MockHandle) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let transport = Self {
            inbound: inbound_rx,
            outbound: outbound_tx,
            local: SocketAddr::from(([192, 168, 1, 20], 50000)),
            protocol,
            ready: true,
        };
        let handle = MockHandle {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
            peer,
        };
        (transport, handle)
    }

    /// Override the reported local address.
    #[must_use]
    pub fn with_local_addr(mut self, local: SocketAddr) -> Self {
        self.local = local;
        self
    }

    /// Simulate a socket that is not usable.
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }
}

#[async_trait]
impl AsyncTransport for MockTransport {
    async fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<()> {
        if !self.ready {
            return Err(KnxError::transport_closed());
        }
        self.outbound
            .send((data.to_vec(), addr))
            .map_err(|_closed| KnxError::transport_closed())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (data, from) = self
            .inbound
            .recv()
            .await
            .ok_or_else(KnxError::transport_closed)?;
        let target = buf
            .get_mut(..data.len())
            .ok_or_else(KnxError::buffer_too_small)?;
        target.copy_from_slice(&data);
        Ok((data.len(), from))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }

    fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn close(&mut self) -> Result<()> {
        self.ready = false;
        self.inbound.close();
        Ok(())
    }
}

impl MockHandle {
    /// Queue raw bytes as if received from `from`.
    pub fn add_response_from(&self, data: Vec<u8>, from: SocketAddr) {
        if let Some(inbound) = &self.inbound {
            // A closed transport just drops the frame.
            let _ = inbound.send((data, from));
        }
    }

    /// Queue a frame as if received from the peer.
    pub fn add_response(&self, frame: &KnxIpFrame) {
        self.add_response_from(frame.to_bytes(), self.peer);
    }

    /// Wait for the next frame the transport sends.
    ///
    /// Returns `None` once the transport is dropped.
    pub async fn next_sent(&mut self) -> Option<Packet> {
        self.outbound.recv().await
    }

    /// Wait for the next frame the transport sends and decode it.
    pub async fn next_frame(&mut self) -> Option<KnxIpFrame> {
        let (data, _) = self.next_sent().await?;
        KnxIpFrame::from_bytes(&data).ok().map(|(frame, _)| frame)
    }

    /// Drain every packet sent so far without waiting.
    pub fn sent_packets(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(packet) = self.outbound.try_recv() {
            packets.push(packet);
        }
        packets
    }

    /// Simulate the peer going away: `recv_from` fails once the queue is empty.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Peer address injected frames come from
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Hands out prepared mock transports in order, one per `open()`.
#[derive(Debug)]
pub struct MockFactory {
    transports: Mutex<VecDeque<MockTransport>>,
}

impl MockFactory {
    /// Factory returning `transports` in order, then failing.
    pub fn new(transports: impl IntoIterator<Item = MockTransport>) -> Self {
        Self {
            transports: Mutex::new(transports.into_iter().collect()),
        }
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    type Transport = MockTransport;

    async fn open(&self) -> Result<MockTransport> {
        self.transports
            .lock()
            .await
            .pop_front()
            .ok_or_else(KnxError::transport_closed)
    }
}
