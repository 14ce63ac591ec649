//! KNXnet/IP routing connection.
//!
//! Routing has no session: telegrams go out as `ROUTING_INDICATION` on the
//! multicast group and nothing acknowledges them. What the connection does
//! enforce is bus timing:
//!
//! - a 20 ms pause after every indication
//! - `ROUTING_BUSY` handling with a randomised back-off that grows with the
//!   number of busy frames in the current window and decays afterwards
//! - the outgoing rate limit
//!
//! Frames this device sent itself come back over multicast loopback; they
//! are recognised by source endpoint and by source individual address and
//! never delivered.

use crate::addressing::IndividualAddress;
use crate::config::{ConnectionConfig, RoutingTimings};
use crate::error::{KnxError, Result};
use crate::net::transport::{AsyncTransport, TransportFactory};
use crate::protocol::cemi::{CemiFrame, CemiMessageCode};
use crate::protocol::connection::{
    reject_pending, sleep_until_opt, CemiCounters, ConnectionChannels, ConnectionState, Request,
};
use crate::protocol::constants::{ServiceType, MAX_FRAME_SIZE};
use crate::protocol::frame::KnxIpFrame;
use crate::protocol::services::{RoutingBusy, RoutingIndication};
use crate::queue::RateLimiter;
use crate::secure::DataSecure;
use crate::telegram::Telegram;
use core::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};

/// Source address used on routing when none is configured (15.15.250).
pub const DEFAULT_ROUTING_ADDRESS: IndividualAddress = IndividualAddress::from_wire([0xFF, 0xFA]);

/// Busy frames closer together than this count once.
const BUSY_FRAME_WINDOW: Duration = Duration::from_millis(10);

/// Parameters of a routing connection.
#[derive(Debug, Clone)]
pub struct RoutingSettings {
    /// Multicast group and port
    pub multicast: SocketAddr,
    /// Source address of outgoing telegrams
    pub individual_address: IndividualAddress,
    /// Pacing and busy back-off
    pub timings: RoutingTimings,
    /// Outgoing telegrams per second
    pub rate_limit: Option<u32>,
    /// Reopen the socket after a failure
    pub auto_reconnect: bool,
    /// Attempts before giving up
    pub reconnect_attempts: u32,
    /// Pause before each attempt
    pub reconnect_backoff: Duration,
    /// The factory opens secure routing
    pub secure: bool,
}

impl RoutingSettings {
    /// Defaults for `multicast`.
    pub fn new(multicast: SocketAddr) -> Self {
        Self {
            multicast,
            individual_address: DEFAULT_ROUTING_ADDRESS,
            timings: RoutingTimings::default(),
            rate_limit: None,
            auto_reconnect: true,
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(3),
            secure: false,
        }
    }

    /// Settings from a connection configuration.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            multicast: config.multicast_endpoint().into(),
            individual_address: config.individual_address.unwrap_or(DEFAULT_ROUTING_ADDRESS),
            timings: config.routing,
            rate_limit: config.rate_limit,
            auto_reconnect: config.auto_reconnect,
            reconnect_attempts: config.reconnect_attempts,
            reconnect_backoff: config.reconnect_backoff,
            secure: config.connection_type.is_secure(),
        }
    }
}

/// `ROUTING_BUSY` flow control.
///
/// A pure state machine over explicit instants; the connection asks it when
/// the next indication may go out.
#[derive(Debug, Clone)]
pub struct RoutingFlowControl {
    timings: RoutingTimings,
    busy_start: Option<Instant>,
    last_busy: Option<Instant>,
    busy_frames: u32,
    resume_at: Option<Instant>,
    next_decay: Option<Instant>,
    paced_until: Option<Instant>,
}

impl RoutingFlowControl {
    /// Idle flow control.
    pub fn new(timings: RoutingTimings) -> Self {
        Self {
            timings,
            busy_start: None,
            last_busy: None,
            busy_frames: 0,
            resume_at: None,
            next_decay: None,
            paced_until: None,
        }
    }

    /// Busy frames counted in the current window.
    pub fn busy_frames(&self) -> u32 {
        self.busy_frames
    }

    /// Handle a `ROUTING_BUSY` received at `now`.
    ///
    /// A busy frame arriving while already paused counts towards the window
    /// (unless it follows the previous one within 10 ms) and restarts the
    /// pause only if it asks for longer than the pause already lasted.
    pub fn handle_busy(&mut self, busy: &RoutingBusy, now: Instant) {
        self.update(now);
        let previous = self.last_busy.replace(now);
        if let Some(start) = self.busy_start {
            if previous.map_or(true, |last| now.duration_since(last) > BUSY_FRAME_WINDOW) {
                self.busy_frames += 1;
            }
            if now.duration_since(start) >= busy.wait_time() {
                return;
            }
        }
        let jitter = self
            .timings
            .busy_random_slot
            .mul_f64(rand::random::<f64>() * f64::from(self.busy_frames));
        self.busy_start = Some(now);
        self.resume_at = Some(now + busy.wait_time() + jitter);
        self.next_decay = None;
        knx_log!(
            warn,
            "Routing busy: pausing {:?} ({} busy frames in window)",
            busy.wait_time() + jitter,
            self.busy_frames
        );
    }

    /// Record an indication sent at `now`.
    pub fn sent(&mut self, now: Instant) {
        self.paced_until = Some(now + self.timings.indication_pause);
    }

    /// Instant the next indication may go out, if that is after `now`.
    pub fn wait_until(&mut self, now: Instant) -> Option<Instant> {
        self.update(now);
        [self.resume_at, self.paced_until]
            .into_iter()
            .flatten()
            .filter(|at| *at > now)
            .max()
    }

    fn update(&mut self, now: Instant) {
        if let Some(resume_at) = self.resume_at.filter(|at| *at <= now) {
            self.resume_at = None;
            self.busy_start = None;
            let slow = self.timings.slow_duration_step * self.busy_frames;
            self.next_decay = Some(resume_at + slow + self.timings.busy_decay_interval);
        }
        while let Some(at) = self.next_decay.filter(|at| *at <= now) {
            if self.busy_frames == 0 {
                self.next_decay = None;
                break;
            }
            self.busy_frames -= 1;
            self.next_decay = Some(at + self.timings.busy_decay_interval);
        }
    }
}

/// Counters of a routing connection, readable from any task.
#[derive(Debug, Clone, Default)]
pub struct RoutingCounters {
    lost_messages: Arc<AtomicU64>,
    busy_frames: Arc<AtomicU64>,
    cemi: CemiCounters,
}

impl RoutingCounters {
    /// Telegrams sent, delivered and dropped
    pub fn cemi(&self) -> &CemiCounters {
        &self.cemi
    }

    /// Telegrams other routers reported as lost
    pub fn lost_messages(&self) -> u64 {
        self.lost_messages.load(Ordering::Relaxed)
    }

    /// `ROUTING_BUSY` frames received
    pub fn busy_frames(&self) -> u64 {
        self.busy_frames.load(Ordering::Relaxed)
    }
}

/// Routing connection task.
pub struct RoutingConnection<F: TransportFactory> {
    factory: F,
    settings: RoutingSettings,
    transport: F::Transport,
    local: Option<SocketAddr>,
    flow: RoutingFlowControl,
    limiter: RateLimiter,
    data_secure: Option<DataSecure>,
    counters: RoutingCounters,
    buffer: Vec<u8>,
}

impl<F: TransportFactory> fmt::Debug for RoutingConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingConnection")
            .field("settings", &self.settings)
            .field("local", &self.local)
            .field("flow", &self.flow)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum Event {
    Shutdown,
    Received(Result<(usize, SocketAddr)>),
    Maintenance,
    Tick,
    Request(Option<Request>),
}

impl<F: TransportFactory> RoutingConnection<F> {
    /// Join the multicast group.
    ///
    /// Secure routing synchronises its timer inside the factory, so the
    /// state reads `Authenticating` until that finished.
    ///
    /// # Errors
    ///
    /// Socket and timer synchronisation errors.
    pub async fn connect(
        factory: F,
        settings: RoutingSettings,
        data_secure: Option<DataSecure>,
        state: &watch::Sender<ConnectionState>,
    ) -> Result<Self> {
        state.send_replace(ConnectionState::Connecting);
        if settings.secure {
            state.send_replace(ConnectionState::Authenticating);
        }
        let transport = match factory.open().await {
            Ok(transport) => transport,
            Err(e) => {
                state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let local = transport.local_addr().ok();
        knx_log!(
            info,
            "Routing on {} as {}",
            settings.multicast,
            settings.individual_address
        );
        state.send_replace(ConnectionState::Connected {
            secure: settings.secure,
        });
        Ok(Self {
            factory,
            flow: RoutingFlowControl::new(settings.timings),
            limiter: RateLimiter::new(settings.rate_limit),
            settings,
            transport,
            local,
            data_secure,
            counters: RoutingCounters::default(),
            buffer: vec![0u8; MAX_FRAME_SIZE],
        })
    }

    /// Shared counters; stay valid after `run` consumed the connection.
    pub fn counters(&self) -> RoutingCounters {
        self.counters.clone()
    }

    /// Serve the connection until it is closed or the socket is lost.
    ///
    /// # Errors
    ///
    /// `ConnectionLost` when the socket failed and could not be reopened.
    pub async fn run(mut self, mut channels: ConnectionChannels) -> Result<()> {
        let result = self.serve(&mut channels).await;
        let error: fn() -> KnxError = if result.is_ok() {
            KnxError::connection_closed
        } else {
            KnxError::connection_lost
        };
        reject_pending(&mut channels.requests, error);
        if let Err(e) = self.transport.close().await {
            knx_log!(debug, "Closing transport failed: {}", e);
        }
        channels.state.send_replace(ConnectionState::Disconnected);
        knx_log!(info, "Routing on {} stopped", self.settings.multicast);
        result
    }

    async fn serve(&mut self, channels: &mut ConnectionChannels) -> Result<()> {
        loop {
            let wait = self
                .flow
                .wait_until(Instant::now())
                .max(self.limiter.ready_at());
            let maintenance = self.transport.maintenance_deadline();

            let event = tokio::select! {
                biased;
                _ = &mut channels.shutdown => Event::Shutdown,
                received = self.transport.recv_from(&mut self.buffer) => Event::Received(received),
                () = sleep_until_opt(maintenance) => Event::Maintenance,
                () = sleep_until_opt(wait) => Event::Tick,
                request = channels.requests.recv(), if wait.is_none() => Event::Request(request),
            };

            let outcome = match event {
                Event::Shutdown | Event::Request(None) => return Ok(()),
                Event::Received(Ok((n, from))) => {
                    self.handle_datagram(n, from, &channels.inbound);
                    Ok(())
                }
                Event::Received(Err(e)) if e.is_security() => {
                    knx_log!(warn, "Discarding routed frame: {}", e);
                    self.counters.cemi.record_error();
                    Ok(())
                }
                Event::Received(Err(e)) => Err(e),
                Event::Maintenance => self.transport.maintain().await,
                Event::Tick => Ok(()),
                Event::Request(Some(request)) => self.send_request(request).await,
            };
            if let Err(e) = outcome {
                knx_log!(warn, "Routing socket failed: {}", e);
                match self.reopen(channels).await {
                    Ok(()) => {}
                    Err(e) if e.is_connection_closed() => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        }
    }

    async fn send_request(&mut self, request: Request) -> Result<()> {
        let (telegram, reply) = match request {
            Request::Telegram { telegram, reply } => (telegram, reply),
            other => {
                other.fail(KnxError::unsupported_service_type(
                    ServiceType::TunnellingFeatureGet.to_u16(),
                ));
                return Ok(());
            }
        };
        let mut cemi = CemiFrame::from_telegram(
            &telegram,
            CemiMessageCode::LDataInd,
            Some(self.settings.individual_address),
        );
        if let (Some(data_secure), Some(ldata)) = (self.data_secure.as_mut(), cemi.ldata_mut()) {
            if let Err(e) = data_secure.outgoing(ldata) {
                knx_log!(warn, "Not sending to {}: {}", telegram.destination, e);
                self.counters.cemi.record_error();
                let _ = reply.send(Err(e));
                return Ok(());
            }
        }
        knx_log!(target: telegram, debug, "-> {}", telegram);
        let frame = KnxIpFrame::RoutingIndication(RoutingIndication {
            raw_cemi: cemi.to_bytes(),
        });
        let bytes = frame.to_bytes();
        knx_log!(target: raw, trace, "TX {} bytes: {:02x?}", bytes.len(), bytes);
        let sent = self.transport.send_to(&bytes, self.settings.multicast).await;
        let now = Instant::now();
        self.flow.sent(now);
        self.limiter.record();
        match sent {
            Ok(()) => {
                self.counters.cemi.record_outgoing();
                let _ = reply.send(Ok(()));
                Ok(())
            }
            Err(e) => {
                self.counters.cemi.record_error();
                let _ = reply.send(Err(KnxError::connection_lost()));
                Err(e)
            }
        }
    }

    fn handle_datagram(&mut self, n: usize, from: SocketAddr, inbound: &mpsc::UnboundedSender<Telegram>) {
        if Some(from) == self.local {
            knx_log!(trace, "Ignoring own datagram");
            return;
        }
        let Some(data) = self.buffer.get(..n) else {
            return;
        };
        knx_log!(target: raw, trace, "RX {} bytes from {}: {:02x?}", n, from, data);
        let frame = match KnxIpFrame::from_bytes(data) {
            Ok((frame, _)) => frame,
            Err(e) => {
                knx_log!(debug, "Ignoring undecodable frame from {}: {}", from, e);
                return;
            }
        };
        match frame {
            KnxIpFrame::RoutingIndication(indication)
            | KnxIpFrame::RoutingSystemBroadcast(indication) => {
                self.handle_indication(&indication, inbound);
            }
            KnxIpFrame::RoutingBusy(busy) => {
                self.counters.busy_frames.fetch_add(1, Ordering::Relaxed);
                self.flow.handle_busy(&busy, Instant::now());
            }
            KnxIpFrame::RoutingLostMessage(lost) => {
                self.counters
                    .lost_messages
                    .fetch_add(u64::from(lost.lost_messages), Ordering::Relaxed);
                knx_log!(
                    warn,
                    "{} routed telegrams lost at {}",
                    lost.lost_messages,
                    from
                );
            }
            other => knx_log!(trace, "Ignoring {:?} on routing", other.service_type()),
        }
    }

    fn handle_indication(
        &mut self,
        indication: &RoutingIndication,
        inbound: &mpsc::UnboundedSender<Telegram>,
    ) {
        let mut cemi = match CemiFrame::parse(&indication.raw_cemi) {
            Ok(cemi) => cemi,
            Err(e) => {
                knx_log!(debug, "Ignoring cEMI frame: {}", e);
                self.counters.cemi.record_error();
                return;
            }
        };
        if cemi.code != CemiMessageCode::LDataInd {
            knx_log!(debug, "Ignoring cEMI {:?} on routing", cemi.code);
            return;
        }
        let Some(ldata) = cemi.ldata_mut() else {
            return;
        };
        if ldata.source == self.settings.individual_address {
            knx_log!(debug, "Ignoring own telegram");
            return;
        }
        let mut secured = false;
        if let Some(data_secure) = self.data_secure.as_mut() {
            match data_secure.incoming(ldata) {
                Ok(was_secured) => secured = was_secured,
                Err(e) => {
                    knx_log!(warn, "Dropping telegram from {}: {}", ldata.source, e);
                    self.counters.cemi.record_error();
                    return;
                }
            }
        }
        match cemi.telegram() {
            Ok(mut telegram) => {
                telegram.data_secure = secured;
                self.counters.cemi.record_incoming();
                // The receiver only goes away while shutting down.
                let _ = inbound.send(telegram);
            }
            Err(e) => {
                knx_log!(debug, "Ignoring L_Data.ind: {}", e);
                self.counters.cemi.record_error();
            }
        }
    }

    async fn reopen(&mut self, channels: &mut ConnectionChannels) -> Result<()> {
        channels.state.send_replace(ConnectionState::Reconnecting);
        if let Err(e) = self.transport.close().await {
            knx_log!(debug, "Closing transport failed: {}", e);
        }
        if !self.settings.auto_reconnect {
            return Err(KnxError::connection_lost());
        }
        for attempt in 1..=self.settings.reconnect_attempts {
            tokio::select! {
                biased;
                _ = &mut channels.shutdown => return Err(KnxError::connection_closed()),
                () = sleep(self.settings.reconnect_backoff) => {}
            }
            match self.factory.open().await {
                Ok(transport) => {
                    self.local = transport.local_addr().ok();
                    self.transport = transport;
                    channels.state.send_replace(ConnectionState::Connected {
                        secure: self.settings.secure,
                    });
                    return Ok(());
                }
                Err(e) => knx_log!(warn, "Reopen attempt {} failed: {}", attempt, e),
            }
        }
        Err(KnxError::connection_lost())
    }
}
