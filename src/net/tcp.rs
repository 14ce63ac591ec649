//! TCP stream transport.
//!
//! KNXnet/IP frames are not delimited on a stream beyond their own total
//! length field, so reads are accumulated in a [`BytesMut`] and complete
//! frames are split off one at a time.
//!
//! ```text
//! stream:  [06 10 04 20 00 15 ...][06 10 04 21 00 0A ...][06 10 04 ...
//!          └──── total 0x15 ─────┘└──── total 0x0A ────┘└─ partial, kept ─
//! ```

use crate::error::{KnxError, Result};
use crate::net::transport::{AsyncTransport, TransportFactory, TransportProtocol};
use crate::protocol::constants::{HEADER_SIZE_10, MAX_FRAME_SIZE};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use socket2::SockRef;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Reassembles KNXnet/IP frames from stream chunks.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: BytesMut,
}

impl FrameBuffer {
    /// Append bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Split off the next complete frame.
    ///
    /// Returns `Ok(None)` while the frame is still incomplete.
    ///
    /// # Errors
    ///
    /// A header whose length fields cannot be right leaves the stream
    /// unsynchronised; the buffer is cleared and `MalformedHeader` returned.
    pub fn next_frame(&mut self) -> Result<Option<BytesMut>> {
        let header_size = usize::from(HEADER_SIZE_10);
        if self.buffer.len() < header_size {
            return Ok(None);
        }
        let total = usize::from(u16::from_be_bytes([self.buffer[4], self.buffer[5]]));
        if self.buffer[0] != HEADER_SIZE_10 || total < header_size || total > MAX_FRAME_SIZE {
            knx_log!(warn, "Discarding unsynchronised TCP stream data");
            self.buffer.clear();
            return Err(KnxError::malformed_header());
        }
        if self.buffer.len() < total {
            return Ok(None);
        }
        Ok(Some(self.buffer.split_to(total)))
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.remaining()
    }
}

/// Persistent stream connection to one KNXnet/IP server.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    frames: FrameBuffer,
    closed: bool,
}

impl TcpTransport {
    /// Connect to `remote`.
    pub async fn connect(remote: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(remote).await?;
        stream.set_nodelay(true)?;
        SockRef::from(&stream).set_keepalive(true)?;
        knx_log!(debug, "TCP transport connected to {}", remote);
        Ok(Self {
            stream,
            peer: remote,
            frames: FrameBuffer::default(),
            closed: false,
        })
    }

    /// Remote endpoint.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl AsyncTransport for TcpTransport {
    async fn send_to(&mut self, data: &[u8], _addr: SocketAddr) -> Result<()> {
        if self.closed {
            return Err(KnxError::transport_closed());
        }
        knx_log!(target: raw, trace, "TCP -> {}: {:02X?}", self.peer, data);
        self.stream.write_all(data).await?;
        Ok(())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        loop {
            if let Some(frame) = self.frames.next_frame()? {
                let target = buf
                    .get_mut(..frame.len())
                    .ok_or_else(KnxError::buffer_too_small)?;
                target.copy_from_slice(&frame);
                knx_log!(target: raw, trace, "TCP <- {}: {:02X?}", self.peer, &frame[..]);
                return Ok((frame.len(), self.peer));
            }
            if self.closed {
                return Err(KnxError::transport_closed());
            }
            // read_buf is cancel-safe: data is either in the buffer or still in the socket.
            let n = self.stream.read_buf(&mut self.frames.buffer).await?;
            if n == 0 {
                knx_log!(info, "TCP connection closed by {}", self.peer);
                self.closed = true;
                return Err(KnxError::transport_closed());
            }
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Tcp
    }

    fn is_ready(&self) -> bool {
        !self.closed
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.stream.shutdown().await?;
        }
        Ok(())
    }
}

/// Opens a [`TcpTransport`] to a fixed server.
#[derive(Debug, Clone, Copy)]
pub struct TcpFactory {
    /// Server address
    pub remote: SocketAddr,
}

#[async_trait]
impl TransportFactory for TcpFactory {
    type Transport = TcpTransport;

    async fn open(&self) -> Result<TcpTransport> {
        TcpTransport::connect(self.remote).await
    }
}
