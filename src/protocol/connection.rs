//! Types shared by the tunnel and routing connection tasks.
//!
//! A connection task owns its transport, sequence counters and timers.
//! Everything else talks to it through channels:
//!
//! ```text
//!            requests (bounded, FIFO)          inbound telegrams (bus order)
//! caller ──────────────────────────> task ─────────────────────────────> caller
//!        <────────────── state watch ──────────  shutdown ──────────────>
//! ```

use crate::error::{KnxError, Result};
use crate::protocol::constants::TunnellingFeatureType;
use crate::telegram::Telegram;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use core::fmt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    /// No connection; terminal after a fatal error or close
    #[default]
    Disconnected,
    /// Connect request sent
    Connecting,
    /// Secure session handshake running
    Authenticating,
    /// Ready for telegrams
    Connected {
        /// Traffic runs through KNX IP Secure
        secure: bool,
    },
    /// Connection lost, rebuilding
    Reconnecting,
    /// Disconnect request sent
    Disconnecting,
}

impl ConnectionState {
    /// `true` while telegrams can be sent.
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Authenticating => f.write_str("authenticating"),
            Self::Connected { secure: false } => f.write_str("connected"),
            Self::Connected { secure: true } => f.write_str("connected (secure)"),
            Self::Reconnecting => f.write_str("reconnecting"),
            Self::Disconnecting => f.write_str("disconnecting"),
        }
    }
}

/// Telegram counters of a connection, readable from any task.
///
/// Clones share the same counters; they stay valid after the connection
/// task ended.
#[derive(Debug, Clone, Default)]
pub struct CemiCounters {
    incoming: Arc<AtomicU64>,
    outgoing: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
}

impl CemiCounters {
    /// Telegrams delivered to subscribers
    pub fn incoming(&self) -> u64 {
        self.incoming.load(Ordering::Relaxed)
    }

    /// Telegrams put on the wire
    pub fn outgoing(&self) -> u64 {
        self.outgoing.load(Ordering::Relaxed)
    }

    /// Telegrams dropped or failed in either direction
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub(crate) fn record_incoming(&self) {
        self.incoming.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outgoing(&self) {
        self.outgoing.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Completion of a queued request.
pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Work submitted to a connection task.
#[derive(Debug)]
pub enum Request {
    /// Send a telegram. Completes once the connection delivered it (ack and
    /// confirmation on a tunnel, transmission on routing).
    Telegram {
        /// Telegram to send
        telegram: Telegram,
        /// Completion
        reply: Reply<()>,
    },
    /// Read a tunnelling feature.
    FeatureGet {
        /// Feature to read
        feature: TunnellingFeatureType,
        /// Feature value
        reply: Reply<Vec<u8>>,
    },
    /// Write a tunnelling feature.
    FeatureSet {
        /// Feature to write
        feature: TunnellingFeatureType,
        /// New value
        value: Vec<u8>,
        /// Value reported back by the server
        reply: Reply<Vec<u8>>,
    },
}

impl Request {
    /// Complete the request with `error`.
    pub(crate) fn fail(self, error: KnxError) {
        // A caller that stopped waiting is not an error.
        match self {
            Self::Telegram { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::FeatureGet { reply, .. } | Self::FeatureSet { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Task side of a connection's channels.
#[derive(Debug)]
pub struct ConnectionChannels {
    /// Outbound requests in submission order
    pub requests: mpsc::Receiver<Request>,
    /// Decoded inbound telegrams in bus order
    pub inbound: mpsc::UnboundedSender<Telegram>,
    /// Published lifecycle state
    pub state: watch::Sender<ConnectionState>,
    /// Fires (or is dropped) when the caller closes the connection
    pub shutdown: oneshot::Receiver<()>,
}

/// Caller side of a connection's channels.
#[derive(Debug)]
pub struct ConnectionEnds {
    /// Submit requests
    pub requests: mpsc::Sender<Request>,
    /// Inbound telegrams
    pub inbound: mpsc::UnboundedReceiver<Telegram>,
    /// Lifecycle state
    pub state: watch::Receiver<ConnectionState>,
    /// Close trigger
    pub shutdown: oneshot::Sender<()>,
}

/// Create a connected pair of channel ends with room for `queue_size`
/// outstanding requests.
pub fn channels(queue_size: usize) -> (ConnectionChannels, ConnectionEnds) {
    let (request_tx, request_rx) = mpsc::channel(queue_size.max(1));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    (
        ConnectionChannels {
            requests: request_rx,
            inbound: inbound_tx,
            state: state_tx,
            shutdown: shutdown_rx,
        },
        ConnectionEnds {
            requests: request_tx,
            inbound: inbound_rx,
            state: state_rx,
            shutdown: shutdown_tx,
        },
    )
}

/// Fail every request still queued and refuse new ones.
pub(crate) fn reject_pending(requests: &mut mpsc::Receiver<Request>, error: impl Fn() -> KnxError) {
    requests.close();
    let mut rejected = 0usize;
    while let Ok(request) = requests.try_recv() {
        request.fail(error());
        rejected += 1;
    }
    if rejected > 0 {
        knx_log!(debug, "Rejected {} queued requests", rejected);
    }
}

/// Sleep until `at`, or forever when there is no deadline.
pub(crate) async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => core::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::Payload;

    #[test]
    fn test_cemi_counters_shared_between_clones() {
        let counters = CemiCounters::default();
        let observer = counters.clone();
        counters.record_incoming();
        counters.record_outgoing();
        counters.record_outgoing();
        counters.record_error();
        assert_eq!(observer.incoming(), 1);
        assert_eq!(observer.outgoing(), 2);
        assert_eq!(observer.errors(), 1);
    }

    #[tokio::test]
    async fn test_reject_pending_fails_waiters() {
        let (mut task, ends) = channels(4);
        let (reply, waiter) = oneshot::channel();
        let telegram = Telegram::group_write("1/2/3".parse().unwrap(), Payload::Binary(1));
        ends.requests
            .send(Request::Telegram { telegram, reply })
            .await
            .unwrap();

        reject_pending(&mut task.requests, KnxError::connection_closed);
        assert!(waiter.await.unwrap().unwrap_err().is_connection_closed());

        let (reply, _waiter) = oneshot::channel();
        let telegram = Telegram::group_read("1/2/3".parse().unwrap());
        assert!(ends
            .requests
            .send(Request::Telegram { telegram, reply })
            .await
            .is_err());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::default().to_string(), "disconnected");
        assert!(ConnectionState::Connected { secure: true }.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_without_deadline_pends() {
        let result =
            tokio::time::timeout(std::time::Duration::from_secs(1), sleep_until_opt(None)).await;
        assert!(result.is_err());
    }
}
