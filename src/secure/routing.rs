//! KNX IP Secure multicast routing transport.
//!
//! [`SecureRouting`] decorates a multicast transport. Outgoing frames are
//! wrapped with session id 0, the backbone key and the group timer as
//! sequence; incoming wrappers pass the timer check and the MAC check
//! before their content is handed on. `TIMER_NOTIFY` frames are consumed
//! here and never reach the caller.

use crate::error::{KnxError, Result};
use crate::net::transport::{AsyncTransport, TransportFactory, TransportProtocol};
use crate::protocol::constants::MAX_FRAME_SIZE;
use crate::protocol::frame::KnxIpFrame;
use crate::secure::primitives::Key;
use crate::secure::session::DEFAULT_SERIAL_NUMBER;
use crate::secure::timer::SecureTimer;
use crate::secure::wrapper::{open, seal, sequence_bytes};
use async_trait::async_trait;
use core::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// Secure routing on top of a multicast transport.
pub struct SecureRouting<T> {
    inner: T,
    group: SocketAddr,
    backbone_key: Key,
    serial_number: [u8; 6],
    timer: SecureTimer,
    buffer: Vec<u8>,
}

impl<T: AsyncTransport> SecureRouting<T> {
    /// Join the secure group and synchronise the timer.
    ///
    /// Waits for the timekeeper's answer for up to the synchronisation
    /// timeout; if nobody answers this device becomes timekeeper. Either way
    /// the returned transport is ready to use.
    pub async fn connect(
        inner: T,
        group: SocketAddr,
        backbone_key: Key,
        latency: Duration,
    ) -> Result<Self> {
        let mut routing = Self {
            inner,
            group,
            backbone_key,
            serial_number: DEFAULT_SERIAL_NUMBER,
            timer: SecureTimer::new(backbone_key, latency, DEFAULT_SERIAL_NUMBER),
            buffer: vec![0u8; MAX_FRAME_SIZE],
        };
        routing.synchronize().await?;
        Ok(routing)
    }

    /// Timer state, for inspection.
    pub fn timer(&self) -> &SecureTimer {
        &self.timer
    }

    async fn send_frame(&mut self, frame: &KnxIpFrame) -> Result<()> {
        self.inner.send_to(&frame.to_bytes(), self.group).await
    }

    async fn synchronize(&mut self) -> Result<()> {
        let request = KnxIpFrame::TimerNotify(self.timer.start_synchronization());
        self.send_frame(&request).await?;
        let deadline = Instant::now() + self.timer.synchronization_timeout();
        let own = self.inner.local_addr().ok();
        let answer = loop {
            let received = timeout_at(deadline, self.inner.recv_from(&mut self.buffer)).await;
            let Ok(result) = received else {
                break None;
            };
            let (n, from) = result?;
            if Some(from) == own {
                continue;
            }
            match KnxIpFrame::from_bytes(&self.buffer[..n]) {
                Ok((KnxIpFrame::TimerNotify(notify), _)) => {
                    if let Ok(Some(value)) = self.timer.handle_timer_notify(&notify) {
                        break Some(value);
                    }
                }
                Ok((KnxIpFrame::SecureWrapper(wrapper), _)) => {
                    // Seen for the timer only; nothing is delivered before
                    // synchronisation finished.
                    let _ = self.timer.validate_wrapper(&wrapper);
                }
                _ => {}
            }
        };
        self.timer.finish_synchronization(answer);
        knx_log!(
            info,
            "Secure routing timer synchronised, timekeeper: {}",
            self.timer.is_timekeeper()
        );
        Ok(())
    }
}

impl<T> fmt::Debug for SecureRouting<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureRouting")
            .field("group", &self.group)
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: AsyncTransport> AsyncTransport for SecureRouting<T> {
    async fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<()> {
        let wrapper = seal(
            &self.backbone_key,
            0,
            sequence_bytes(self.timer.outgoing_value()),
            self.serial_number,
            rand::random(),
            data,
        );
        self.inner
            .send_to(&KnxIpFrame::SecureWrapper(wrapper).to_bytes(), addr)
            .await
    }

    /// Returns the next authenticated frame.
    ///
    /// # Errors
    ///
    /// Per-frame security failures are returned and leave the transport
    /// usable: `TimerNotAuthenticated`, `ReplayOrOutOfOrder` for a stale
    /// timer, `AuthenticationFailed` for a bad MAC.
    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let own = self.inner.local_addr().ok();
        loop {
            let (n, from) = self.inner.recv_from(&mut self.buffer).await?;
            let frame = match KnxIpFrame::from_bytes(&self.buffer[..n]) {
                Ok((frame, _)) => frame,
                Err(e) => {
                    knx_log!(debug, "Ignoring undecodable frame from {}: {}", from, e);
                    continue;
                }
            };
            let wrapper = match frame {
                KnxIpFrame::TimerNotify(notify) => {
                    if Some(from) != own {
                        // MAC failures are logged by the timer.
                        let _ = self.timer.handle_timer_notify(&notify);
                    }
                    continue;
                }
                KnxIpFrame::SecureWrapper(wrapper) => wrapper,
                other => {
                    knx_log!(debug, "Dropping unsecured {:?} from {}", other.service_type(), from);
                    continue;
                }
            };
            // The MAC is checked before the timer value may move the clock.
            let inner = open(&self.backbone_key, &wrapper).inspect_err(|_| {
                knx_log!(warn, "Secure routing frame from {} failed authentication", from);
            })?;
            if Some(from) != own {
                self.timer.validate_wrapper(&wrapper)?;
            }
            if !self.timer.is_authenticated() {
                return Err(KnxError::timer_not_authenticated());
            }
            let target = buf
                .get_mut(..inner.len())
                .ok_or_else(KnxError::buffer_too_small)?;
            target.copy_from_slice(&inner);
            return Ok((inner.len(), from));
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    fn maintenance_deadline(&self) -> Option<Instant> {
        self.timer.next_deadline()
    }

    async fn maintain(&mut self) -> Result<()> {
        if self.timer.next_deadline().is_some_and(|at| at <= Instant::now()) {
            let notify = KnxIpFrame::TimerNotify(self.timer.on_deadline());
            self.send_frame(&notify).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

/// Opens the inner transport and runs the timer synchronisation on it.
pub struct SecureRoutingFactory<F> {
    /// Multicast transport factory
    pub inner: F,
    /// Multicast group and port
    pub group: SocketAddr,
    /// Backbone key shared by all secure routers
    pub backbone_key: Key,
    /// Accepted network latency
    pub latency: Duration,
}

impl<F: fmt::Debug> fmt::Debug for SecureRoutingFactory<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureRoutingFactory")
            .field("inner", &self.inner)
            .field("group", &self.group)
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F: TransportFactory> TransportFactory for SecureRoutingFactory<F> {
    type Transport = SecureRouting<F::Transport>;

    async fn open(&self) -> Result<Self::Transport> {
        let inner = self.inner.open().await?;
        SecureRouting::connect(inner, self.group, self.backbone_key, self.latency).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::mock_transport::{MockHandle, MockTransport};
    use crate::secure::wrapper::sequence_value;

    const KEY: Key = [0x42; 16];

    fn group() -> SocketAddr {
        "224.0.23.12:3671".parse().unwrap()
    }

    fn peer() -> SocketAddr {
        "192.168.1.50:3671".parse().unwrap()
    }

    fn wrap_at(value: u64, frame: &[u8]) -> KnxIpFrame {
        KnxIpFrame::SecureWrapper(seal(&KEY, 0, sequence_bytes(value), [9; 6], 1, frame))
    }

    async fn connected() -> (SecureRouting<MockTransport>, MockHandle) {
        let (transport, handle) = MockTransport::pair(peer());
        let routing = SecureRouting::connect(transport, group(), KEY, Duration::from_millis(1000))
            .await
            .unwrap();
        (routing, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_sync_becomes_timekeeper() {
        let (routing, mut handle) = connected().await;
        assert!(routing.timer().is_timekeeper());
        assert!(routing.timer().is_authenticated());
        let sent = handle.sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, group());
        assert!(matches!(
            KnxIpFrame::from_bytes(&sent[0].0).unwrap().0,
            KnxIpFrame::TimerNotify(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrapped_traffic() {
        let (mut routing, mut handle) = connected().await;
        let _ = handle.sent_packets();

        let payload = [0x06, 0x10, 0x05, 0x30, 0x00, 0x08, 0x29, 0x00];
        routing.send_to(&payload, group()).await.unwrap();
        let (bytes, to) = handle.next_sent().await.unwrap();
        assert_eq!(to, group());
        let KnxIpFrame::SecureWrapper(wrapper) = KnxIpFrame::from_bytes(&bytes).unwrap().0 else {
            panic!("expected a wrapper");
        };
        assert_eq!(wrapper.secure_session_id, 0);
        assert_eq!(open(&KEY, &wrapper).unwrap(), payload);

        let now = routing.timer().current_value();
        handle.add_response(&wrap_at(now, &payload));
        let mut buf = [0u8; 64];
        let (n, from) = routing.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &payload);
        assert_eq!(from, peer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_and_tampered_wrappers_rejected() {
        let (mut routing, handle) = connected().await;
        let now = routing.timer().current_value() + 10_000;
        tokio::time::advance(Duration::from_secs(10)).await;
        let mut buf = [0u8; 64];

        handle.add_response(&wrap_at(now - 5_000, &[0x06, 0x10]));
        assert!(routing.recv_from(&mut buf).await.unwrap_err().is_replay());

        let KnxIpFrame::SecureWrapper(mut bad) = wrap_at(now, &[0x06, 0x10]) else {
            unreachable!()
        };
        let last = bad.encrypted_data.len() - 1;
        bad.encrypted_data[last] ^= 1;
        handle.add_response(&KnxIpFrame::SecureWrapper(bad));
        assert!(routing.recv_from(&mut buf).await.unwrap_err().is_authentication_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_notify() {
        let (mut routing, mut handle) = connected().await;
        let _ = handle.sent_packets();
        let deadline = routing.maintenance_deadline().unwrap();
        tokio::time::sleep_until(deadline).await;
        routing.maintain().await.unwrap();
        let (bytes, _) = handle.next_sent().await.unwrap();
        let KnxIpFrame::TimerNotify(notify) = KnxIpFrame::from_bytes(&bytes).unwrap().0 else {
            panic!("expected a timer notify");
        };
        assert!(sequence_value(&notify.timer_value) >= 10_000);
        assert!(routing.maintenance_deadline().unwrap() > deadline);
    }
}
