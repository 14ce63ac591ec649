//! Async KNXnet/IP tunnelling connection.
//!
//! [`AsyncTunnelClient`] drives a [`TunnelClient`] over any
//! [`TransportFactory`]: UDP, TCP, or a secure session wrapping either. It
//! runs as a single task that owns the transport and the sequence counters
//! and talks to the rest of the program through [`ConnectionChannels`].
//!
//! ## Features
//!
//! - One telegram in flight at a time; queued requests go out in order
//! - `TUNNELLING_ACK` timeout with one resend, then the connection is rebuilt
//! - `L_Data.con` tracking so a send completes once the bus saw it
//! - Heartbeat with retries; automatic reconnect with backoff
//! - Optional KNX Data Secure on group telegrams
//!
//! ## Example
//!
//! ```rust,no_run
//! use knx_engine::net::udp::UdpFactory;
//! use knx_engine::protocol::async_tunnel::{AsyncTunnelClient, TunnelSettings};
//! use knx_engine::protocol::connection::channels;
//!
//! # async fn run() -> knx_engine::Result<()> {
//! let settings = TunnelSettings::new("192.168.1.10:3671".parse().unwrap());
//! let factory = UdpFactory { local: "0.0.0.0:0".parse().unwrap() };
//! let (task, ends) = channels(32);
//! let client = AsyncTunnelClient::connect(factory, settings, None, &task.state).await?;
//! tokio::spawn(client.run(task));
//! # drop(ends);
//! # Ok(())
//! # }
//! ```

use crate::addressing::{Address, IndividualAddress};
use crate::config::{ConnectionConfig, TunnelTimings};
use crate::error::{KnxError, Result};
use crate::net::transport::{AsyncTransport, TransportFactory, TransportProtocol};
use crate::protocol::cemi::{CemiFrame, CemiMessageCode};
use crate::protocol::connection::{
    reject_pending, sleep_until_opt, CemiCounters, ConnectionChannels, ConnectionState, Reply,
    Request,
};
use crate::protocol::constants::{TunnellingFeatureType, E_NO_ERROR, MAX_FRAME_SIZE};
use crate::protocol::frame::{Hpai, KnxIpFrame};
use crate::protocol::services::{ConnectRequestInfo, TunnellingAck, TunnellingFeature};
use crate::protocol::tunnel::{AckResult, Connected, InboundSequence, TunnelClient};
use crate::queue::RateLimiter;
use crate::secure::DataSecure;
use crate::telegram::Telegram;
use core::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};

/// Parameters of a tunnelling connection.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Gateway control endpoint
    pub gateway: SocketAddr,
    /// Advertise `0.0.0.0:0` so the gateway answers to the datagram source
    pub route_back: bool,
    /// Requested tunnel address (TCP only)
    pub individual_address: Option<IndividualAddress>,
    /// Timeouts and heartbeat
    pub timings: TunnelTimings,
    /// Rebuild a lost connection
    pub auto_reconnect: bool,
    /// Attempts before giving up
    pub reconnect_attempts: u32,
    /// Pause before each attempt
    pub reconnect_backoff: Duration,
    /// Outgoing telegrams per second
    pub rate_limit: Option<u32>,
    /// The factory opens a secure session
    pub secure: bool,
}

impl TunnelSettings {
    /// Defaults for `gateway`.
    pub fn new(gateway: SocketAddr) -> Self {
        Self {
            gateway,
            route_back: false,
            individual_address: None,
            timings: TunnelTimings::default(),
            auto_reconnect: true,
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(3),
            rate_limit: None,
            secure: false,
        }
    }

    /// Settings from a connection configuration.
    ///
    /// # Errors
    ///
    /// `GatewayNotFound` without a gateway address.
    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        Ok(Self {
            gateway: config.gateway_endpoint()?,
            route_back: config.route_back,
            individual_address: config.individual_address,
            timings: config.tunnel,
            auto_reconnect: config.auto_reconnect,
            reconnect_attempts: config.reconnect_attempts,
            reconnect_backoff: config.reconnect_backoff,
            rate_limit: config.rate_limit,
            secure: config.connection_type.is_secure(),
        })
    }
}

/// Caller waiting on the frame in flight.
#[derive(Debug)]
enum Pending {
    Telegram {
        destination: Address,
        reply: Reply<()>,
    },
    Feature {
        feature: TunnellingFeatureType,
        reply: Reply<Vec<u8>>,
    },
}

impl Pending {
    fn fail(self, error: KnxError) {
        // The caller may have stopped waiting.
        match self {
            Self::Telegram { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::Feature { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for `TUNNELLING_ACK`
    Ack { resent: bool },
    /// Acked, waiting for `L_Data.con`
    Confirmation,
    /// Acked, waiting for `TUNNELLING_FEATURE_RESPONSE`
    FeatureResponse,
}

#[derive(Debug)]
struct InFlight {
    pending: Pending,
    frame: KnxIpFrame,
    phase: Phase,
    deadline: Instant,
    /// `L_Data.con` that overtook the ack; `true` when negative
    early_confirmation: Option<bool>,
}

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    deadline: Instant,
    waiting: bool,
    failures: u8,
}

impl Heartbeat {
    fn idle(interval: Duration) -> Self {
        Self {
            deadline: Instant::now() + interval,
            waiting: false,
            failures: 0,
        }
    }
}

/// What the run loop does after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Rebuild the connection, telling the gateway first
    Reconnect,
    /// The gateway already dropped the channel
    Dropped,
}

#[derive(Debug)]
enum Event {
    Shutdown,
    Received(Result<(usize, SocketAddr)>),
    InFlightTimeout,
    Heartbeat,
    Maintenance,
    Tick,
    Request(Option<Request>),
}

/// Tunnelling connection task.
pub struct AsyncTunnelClient<F: TransportFactory> {
    factory: F,
    settings: TunnelSettings,
    transport: F::Transport,
    tunnel: TunnelClient<Connected>,
    data_secure: Option<DataSecure>,
    limiter: RateLimiter,
    buffer: Vec<u8>,
    in_flight: Option<InFlight>,
    heartbeat: Heartbeat,
    counters: CemiCounters,
}

impl<F: TransportFactory> fmt::Debug for AsyncTunnelClient<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTunnelClient")
            .field("settings", &self.settings)
            .field("tunnel", &self.tunnel)
            .field("data_secure", &self.data_secure.is_some())
            .field("in_flight", &self.in_flight)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl<F: TransportFactory> AsyncTunnelClient<F> {
    /// Open a transport and establish the tunnel.
    ///
    /// Publishes `Connecting` (and `Authenticating` while a secure session
    /// is set up) and finally `Connected`.
    ///
    /// # Errors
    ///
    /// `ConnectionRefused`, `Timeout`, transport and security errors.
    pub async fn connect(
        factory: F,
        settings: TunnelSettings,
        data_secure: Option<DataSecure>,
        state: &watch::Sender<ConnectionState>,
    ) -> Result<Self> {
        state.send_replace(ConnectionState::Connecting);
        if settings.secure {
            state.send_replace(ConnectionState::Authenticating);
        }
        let (transport, tunnel) = match open_tunnel(&factory, &settings).await {
            Ok(opened) => opened,
            Err(e) => {
                state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        state.send_replace(ConnectionState::Connected {
            secure: settings.secure,
        });
        Ok(Self {
            factory,
            limiter: RateLimiter::new(settings.rate_limit),
            heartbeat: Heartbeat::idle(settings.timings.heartbeat_interval),
            settings,
            transport,
            tunnel,
            data_secure,
            buffer: vec![0u8; MAX_FRAME_SIZE],
            in_flight: None,
            counters: CemiCounters::default(),
        })
    }

    /// Shared telegram counters; stay valid after `run` consumed the client.
    pub fn counters(&self) -> CemiCounters {
        self.counters.clone()
    }

    /// Address the gateway assigned to this tunnel.
    pub fn individual_address(&self) -> IndividualAddress {
        self.tunnel.individual_address()
    }

    /// Communication channel of the current tunnel.
    pub fn channel_id(&self) -> u8 {
        self.tunnel.channel_id()
    }

    /// Serve the connection until it is closed or lost for good.
    ///
    /// On return every queued request has been failed (`ConnectionClosed`
    /// after a close, `ConnectionLost` otherwise) and the state is
    /// `Disconnected`.
    ///
    /// # Errors
    ///
    /// `ConnectionLost` once reconnecting gave up.
    pub async fn run(mut self, mut channels: ConnectionChannels) -> Result<()> {
        let result = self.serve(&mut channels).await;
        let error: fn() -> KnxError = if result.is_ok() {
            KnxError::connection_closed
        } else {
            KnxError::connection_lost
        };
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.pending.fail(error());
        }
        reject_pending(&mut channels.requests, error);
        channels.state.send_replace(ConnectionState::Disconnected);
        match &result {
            Ok(()) => knx_log!(info, "Tunnel to {} closed", self.settings.gateway),
            Err(e) => knx_log!(error, "Tunnel to {} lost: {}", self.settings.gateway, e),
        }
        result
    }

    async fn serve(&mut self, channels: &mut ConnectionChannels) -> Result<()> {
        loop {
            let in_flight_deadline = self.in_flight.as_ref().map(|f| f.deadline);
            let limiter_wait = self.limiter.ready_at();
            let idle = self.in_flight.is_none();
            let accepting = idle && limiter_wait.is_none();
            let maintenance = self.transport.maintenance_deadline();
            let heartbeat = self.heartbeat.deadline;

            let event = tokio::select! {
                biased;
                _ = &mut channels.shutdown => Event::Shutdown,
                received = self.transport.recv_from(&mut self.buffer) => Event::Received(received),
                () = sleep_until_opt(in_flight_deadline) => Event::InFlightTimeout,
                () = sleep_until(heartbeat) => Event::Heartbeat,
                () = sleep_until_opt(maintenance) => Event::Maintenance,
                () = sleep_until_opt(limiter_wait), if idle => Event::Tick,
                request = channels.requests.recv(), if accepting => Event::Request(request),
            };

            let flow = match event {
                Event::Shutdown | Event::Request(None) => {
                    self.shutdown(channels).await;
                    return Ok(());
                }
                Event::Received(Ok((n, _from))) => self.handle_datagram(n, &channels.inbound).await,
                Event::Received(Err(e)) if e.is_security() => {
                    knx_log!(warn, "Discarding frame: {}", e);
                    Ok(Flow::Continue)
                }
                Event::Received(Err(e)) => {
                    knx_log!(warn, "Receive failed: {}", e);
                    Ok(Flow::Reconnect)
                }
                Event::InFlightTimeout => self.handle_in_flight_timeout().await,
                Event::Heartbeat => self.handle_heartbeat_deadline().await,
                Event::Maintenance => self.transport.maintain().await.map(|()| Flow::Continue),
                Event::Tick => Ok(Flow::Continue),
                Event::Request(Some(request)) => self.start_request(request).await,
            };

            let notify_gateway = match flow {
                Ok(Flow::Continue) => continue,
                Ok(Flow::Reconnect) => true,
                Ok(Flow::Dropped) => false,
                Err(e) => {
                    knx_log!(warn, "Tunnel error: {}", e);
                    true
                }
            };
            match self.reconnect(channels, notify_gateway).await {
                Ok(()) => {}
                Err(e) if e.is_connection_closed() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Outgoing
    // -------------------------------------------------------------------------

    async fn start_request(&mut self, request: Request) -> Result<Flow> {
        let (pending, frame) = match request {
            Request::Telegram { telegram, reply } => {
                let mut cemi = CemiFrame::from_telegram(
                    &telegram,
                    CemiMessageCode::LDataReq,
                    Some(self.tunnel.individual_address()),
                );
                if let (Some(data_secure), Some(ldata)) =
                    (self.data_secure.as_mut(), cemi.ldata_mut())
                {
                    if let Err(e) = data_secure.outgoing(ldata) {
                        knx_log!(warn, "Not sending to {}: {}", telegram.destination, e);
                        self.counters.record_error();
                        let _ = reply.send(Err(e));
                        return Ok(Flow::Continue);
                    }
                }
                knx_log!(target: telegram, debug, "-> {}", telegram);
                let pending = Pending::Telegram {
                    destination: telegram.destination,
                    reply,
                };
                (pending, self.tunnel.tunnelling_request(cemi.to_bytes()))
            }
            Request::FeatureGet { feature, reply } => {
                (Pending::Feature { feature, reply }, self.tunnel.feature_get(feature))
            }
            Request::FeatureSet {
                feature,
                value,
                reply,
            } => (
                Pending::Feature { feature, reply },
                self.tunnel.feature_set(feature, value),
            ),
        };
        self.in_flight = Some(InFlight {
            pending,
            frame: frame.clone(),
            phase: Phase::Ack { resent: false },
            deadline: Instant::now() + self.settings.timings.ack_timeout,
            early_confirmation: None,
        });
        self.limiter.record();
        self.send_data(&frame).await?;
        if matches!(frame, KnxIpFrame::TunnellingRequest(_)) {
            self.counters.record_outgoing();
        }
        Ok(Flow::Continue)
    }

    async fn send_data(&mut self, frame: &KnxIpFrame) -> Result<()> {
        let target = self.tunnel.data_endpoint();
        self.send_frame(frame, target).await
    }

    async fn send_control(&mut self, frame: &KnxIpFrame) -> Result<()> {
        let target = self.tunnel.gateway();
        self.send_frame(frame, target).await
    }

    async fn send_frame(&mut self, frame: &KnxIpFrame, target: SocketAddr) -> Result<()> {
        let bytes = frame.to_bytes();
        knx_log!(target: raw, trace, "TX {} bytes to {}: {:02x?}", bytes.len(), target, bytes);
        self.transport.send_to(&bytes, target).await
    }

    // -------------------------------------------------------------------------
    // Incoming
    // -------------------------------------------------------------------------

    async fn handle_datagram(
        &mut self,
        n: usize,
        inbound: &mpsc::UnboundedSender<Telegram>,
    ) -> Result<Flow> {
        let data = self.buffer.get(..n).ok_or_else(KnxError::buffer_too_small)?;
        knx_log!(target: raw, trace, "RX {} bytes: {:02x?}", n, data);
        let frame = match KnxIpFrame::from_bytes(data) {
            Ok((frame, _)) => frame,
            Err(e) => {
                knx_log!(debug, "Ignoring undecodable frame: {}", e);
                return Ok(Flow::Continue);
            }
        };

        match frame {
            KnxIpFrame::TunnellingRequest(request) => {
                let sequence = request.sequence_counter;
                match self
                    .tunnel
                    .check_inbound(request.communication_channel_id, sequence)
                {
                    InboundSequence::New => {
                        let ack = self.tunnel.ack(sequence);
                        self.send_data(&ack).await?;
                        self.handle_cemi(&request.raw_cemi, inbound);
                        Ok(Flow::Continue)
                    }
                    InboundSequence::Duplicate => {
                        let ack = self.tunnel.ack(sequence);
                        self.send_data(&ack).await?;
                        Ok(Flow::Continue)
                    }
                    InboundSequence::OutOfOrder => Ok(Flow::Reconnect),
                    InboundSequence::ForeignChannel => Ok(Flow::Continue),
                }
            }
            KnxIpFrame::TunnellingAck(ack) => {
                self.handle_ack(&ack);
                Ok(Flow::Continue)
            }
            KnxIpFrame::TunnellingFeatureResponse(feature) => {
                self.handle_feature(&feature, true).await
            }
            KnxIpFrame::TunnellingFeatureInfo(feature) => {
                self.handle_feature(&feature, false).await
            }
            KnxIpFrame::ConnectionStateResponse(response) => {
                if !self.tunnel.is_own_connection_state(&response) {
                    return Ok(Flow::Continue);
                }
                if self.tunnel.check_connection_state(&response).is_err() {
                    return Ok(Flow::Reconnect);
                }
                knx_log!(trace, "Heartbeat ok");
                self.heartbeat = Heartbeat::idle(self.settings.timings.heartbeat_interval);
                Ok(Flow::Continue)
            }
            KnxIpFrame::DisconnectRequest(request) => {
                match self.tunnel.clone().handle_disconnect_request(&request) {
                    Ok((_idle, response)) => {
                        self.send_control(&response).await?;
                        Ok(Flow::Dropped)
                    }
                    Err(_other_channel) => Ok(Flow::Continue),
                }
            }
            KnxIpFrame::DeviceConfigurationRequest(request) => {
                if request.communication_channel_id == self.tunnel.channel_id() {
                    let ack = self.tunnel.device_configuration_ack(request.sequence_counter);
                    self.send_data(&ack).await?;
                }
                Ok(Flow::Continue)
            }
            other => {
                knx_log!(debug, "Ignoring {:?} on tunnel", other.service_type());
                Ok(Flow::Continue)
            }
        }
    }

    fn handle_ack(&mut self, ack: &TunnellingAck) {
        let Some(in_flight) = self.in_flight.as_mut() else {
            knx_log!(debug, "Ack seq {} without request in flight", ack.sequence_counter);
            return;
        };
        if !matches!(in_flight.phase, Phase::Ack { .. }) {
            knx_log!(debug, "Duplicate ack seq {} ignored", ack.sequence_counter);
            return;
        }
        match self.tunnel.check_ack(ack) {
            AckResult::Accepted => {
                if let Some(negative) = in_flight.early_confirmation {
                    self.finish_telegram(negative);
                    return;
                }
                let (phase, wait) = match in_flight.pending {
                    Pending::Telegram { .. } => {
                        (Phase::Confirmation, self.settings.timings.confirmation_timeout)
                    }
                    Pending::Feature { .. } => {
                        (Phase::FeatureResponse, self.settings.timings.ack_timeout)
                    }
                };
                in_flight.phase = phase;
                in_flight.deadline = Instant::now() + wait;
            }
            AckResult::Rejected(status) => {
                knx_log!(warn, "Gateway rejected request: status 0x{:02X}", status);
                if let Some(in_flight) = self.in_flight.take() {
                    in_flight.pending.fail(KnxError::tunneling_ack_failed(status));
                }
            }
            AckResult::Unrelated => {}
        }
    }

    async fn handle_feature(&mut self, feature: &TunnellingFeature, response: bool) -> Result<Flow> {
        let sequence = feature.sequence_counter;
        match self
            .tunnel
            .check_inbound(feature.communication_channel_id, sequence)
        {
            InboundSequence::New => {
                let ack = self.tunnel.ack(sequence);
                self.send_data(&ack).await?;
            }
            InboundSequence::Duplicate => {
                let ack = self.tunnel.ack(sequence);
                self.send_data(&ack).await?;
                return Ok(Flow::Continue);
            }
            InboundSequence::OutOfOrder => return Ok(Flow::Reconnect),
            InboundSequence::ForeignChannel => return Ok(Flow::Continue),
        }

        if !response {
            knx_log!(
                info,
                "Feature {:?} changed: {:02x?}",
                feature.feature_type,
                feature.data
            );
            return Ok(Flow::Continue);
        }
        let awaited = matches!(
            &self.in_flight,
            Some(InFlight {
                phase: Phase::FeatureResponse,
                pending: Pending::Feature { feature: wanted, .. },
                ..
            }) if *wanted == feature.feature_type
        );
        if !awaited {
            knx_log!(debug, "Unexpected feature response {:?}", feature.feature_type);
            return Ok(Flow::Continue);
        }
        if let Some(InFlight {
            pending: Pending::Feature { reply, .. },
            ..
        }) = self.in_flight.take()
        {
            let result = if feature.status_code == E_NO_ERROR {
                Ok(feature.data.clone())
            } else {
                Err(KnxError::tunneling_ack_failed(feature.status_code))
            };
            let _ = reply.send(result);
        }
        Ok(Flow::Continue)
    }

    fn handle_cemi(&mut self, raw: &[u8], inbound: &mpsc::UnboundedSender<Telegram>) {
        let mut cemi = match CemiFrame::parse(raw) {
            Ok(cemi) => cemi,
            Err(e) => {
                knx_log!(debug, "Ignoring cEMI frame: {}", e);
                self.counters.record_error();
                return;
            }
        };
        match cemi.code {
            CemiMessageCode::LDataCon => self.handle_confirmation(&cemi),
            CemiMessageCode::LDataInd => {
                let mut secured = false;
                if let (Some(data_secure), Some(ldata)) =
                    (self.data_secure.as_mut(), cemi.ldata_mut())
                {
                    match data_secure.incoming(ldata) {
                        Ok(was_secured) => secured = was_secured,
                        Err(e) => {
                            knx_log!(warn, "Dropping telegram from {}: {}", ldata.source, e);
                            self.counters.record_error();
                            return;
                        }
                    }
                }
                match cemi.telegram() {
                    Ok(mut telegram) => {
                        telegram.data_secure = secured;
                        self.counters.record_incoming();
                        // The receiver only goes away while shutting down.
                        let _ = inbound.send(telegram);
                    }
                    Err(e) => {
                        knx_log!(debug, "Ignoring L_Data.ind: {}", e);
                        self.counters.record_error();
                    }
                }
            }
            other => knx_log!(debug, "Ignoring cEMI {:?}", other),
        }
    }

    fn handle_confirmation(&mut self, cemi: &CemiFrame) {
        let Some(ldata) = cemi.ldata() else {
            return;
        };
        let negative = ldata.control1.confirm_error();
        let phase = match &mut self.in_flight {
            Some(InFlight {
                phase,
                pending: Pending::Telegram { destination, .. },
                early_confirmation,
                ..
            }) if *destination == ldata.destination => {
                if matches!(phase, Phase::Ack { .. }) {
                    // UDP may reorder; completes once the ack arrives.
                    *early_confirmation = Some(negative);
                }
                *phase
            }
            _ => {
                knx_log!(debug, "Unmatched L_Data.con for {}", ldata.destination);
                return;
            }
        };
        if phase == Phase::Confirmation {
            self.finish_telegram(negative);
        }
    }

    fn finish_telegram(&mut self, negative: bool) {
        let Some(InFlight {
            pending: Pending::Telegram { destination, reply },
            ..
        }) = self.in_flight.take()
        else {
            return;
        };
        let result = if negative {
            knx_log!(warn, "Negative confirmation for {}", destination);
            self.counters.record_error();
            Err(KnxError::negative_confirmation())
        } else {
            Ok(())
        };
        let _ = reply.send(result);
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    async fn handle_in_flight_timeout(&mut self) -> Result<Flow> {
        let Some(mut in_flight) = self.in_flight.take() else {
            return Ok(Flow::Continue);
        };
        match in_flight.phase {
            Phase::Ack { resent: false } => {
                knx_log!(warn, "No ack from gateway, resending");
                let frame = in_flight.frame.clone();
                in_flight.phase = Phase::Ack { resent: true };
                in_flight.deadline = Instant::now() + self.settings.timings.ack_timeout;
                self.in_flight = Some(in_flight);
                self.send_data(&frame).await?;
                Ok(Flow::Continue)
            }
            Phase::Ack { resent: true } => {
                knx_log!(warn, "No ack after resend, rebuilding tunnel");
                self.counters.record_error();
                in_flight.pending.fail(KnxError::send_timeout());
                Ok(Flow::Reconnect)
            }
            Phase::Confirmation | Phase::FeatureResponse => {
                knx_log!(warn, "No confirmation from gateway");
                self.counters.record_error();
                in_flight.pending.fail(KnxError::send_timeout());
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_heartbeat_deadline(&mut self) -> Result<Flow> {
        let timings = self.settings.timings;
        if self.heartbeat.waiting {
            self.heartbeat.failures += 1;
            knx_log!(
                warn,
                "Heartbeat timeout {}/{}",
                self.heartbeat.failures,
                timings.heartbeat_retries
            );
            if self.heartbeat.failures >= timings.heartbeat_retries {
                return Ok(Flow::Reconnect);
            }
        }
        self.heartbeat.waiting = true;
        self.heartbeat.deadline = Instant::now() + timings.connectionstate_timeout;
        let request = self.tunnel.connection_state_request();
        self.send_control(&request).await?;
        Ok(Flow::Continue)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    async fn reconnect(
        &mut self,
        channels: &mut ConnectionChannels,
        notify_gateway: bool,
    ) -> Result<()> {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.pending.fail(KnxError::connection_lost());
        }
        channels.state.send_replace(ConnectionState::Reconnecting);
        if notify_gateway {
            let (_disconnecting, request) = self.tunnel.clone().disconnect();
            if let Err(e) = self.send_control(&request).await {
                knx_log!(debug, "Disconnect before reconnect failed: {}", e);
            }
        }
        if let Err(e) = self.transport.close().await {
            knx_log!(debug, "Closing transport failed: {}", e);
        }
        if !self.settings.auto_reconnect {
            return Err(KnxError::connection_lost());
        }

        for attempt in 1..=self.settings.reconnect_attempts {
            knx_log!(
                info,
                "Reconnecting to {} ({}/{})",
                self.settings.gateway,
                attempt,
                self.settings.reconnect_attempts
            );
            tokio::select! {
                biased;
                _ = &mut channels.shutdown => return Err(KnxError::connection_closed()),
                () = sleep(self.settings.reconnect_backoff) => {}
            }
            match open_tunnel(&self.factory, &self.settings).await {
                Ok((transport, tunnel)) => {
                    self.transport = transport;
                    self.tunnel = tunnel;
                    self.heartbeat = Heartbeat::idle(self.settings.timings.heartbeat_interval);
                    channels.state.send_replace(ConnectionState::Connected {
                        secure: self.settings.secure,
                    });
                    return Ok(());
                }
                Err(e) => knx_log!(warn, "Reconnect attempt {} failed: {}", attempt, e),
            }
        }
        Err(KnxError::connection_lost())
    }

    async fn shutdown(&mut self, channels: &mut ConnectionChannels) {
        channels.state.send_replace(ConnectionState::Disconnecting);
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.pending.fail(KnxError::connection_closed());
        }
        let (disconnecting, request) = self.tunnel.clone().disconnect();
        if let Err(e) = self.send_control(&request).await {
            knx_log!(debug, "Disconnect request failed: {}", e);
        } else {
            let transport = &mut self.transport;
            let buffer = &mut self.buffer;
            let waited = timeout(self.settings.timings.connectionstate_timeout, async {
                loop {
                    let (n, _) = match transport.recv_from(buffer).await {
                        Ok(received) => received,
                        Err(e) if e.is_security() => continue,
                        Err(e) => return Err(e),
                    };
                    let Some(data) = buffer.get(..n) else {
                        continue;
                    };
                    if let Ok((KnxIpFrame::DisconnectResponse(response), _)) =
                        KnxIpFrame::from_bytes(data)
                    {
                        if disconnecting.is_own_disconnect_response(&response) {
                            return Ok(());
                        }
                    }
                }
            })
            .await;
            if !matches!(waited, Ok(Ok(()))) {
                knx_log!(debug, "No disconnect response from gateway");
            }
        }
        let _idle = disconnecting.finish();
        if let Err(e) = self.transport.close().await {
            knx_log!(debug, "Closing transport failed: {}", e);
        }
    }
}

/// Open a transport and run the connect handshake on it.
async fn open_tunnel<F: TransportFactory>(
    factory: &F,
    settings: &TunnelSettings,
) -> Result<(F::Transport, TunnelClient<Connected>)> {
    let mut transport = factory.open().await?;
    match handshake(&mut transport, settings).await {
        Ok(tunnel) => Ok((transport, tunnel)),
        Err(e) => {
            if let Err(close) = transport.close().await {
                knx_log!(debug, "Closing transport failed: {}", close);
            }
            Err(e)
        }
    }
}

async fn handshake<T: AsyncTransport>(
    transport: &mut T,
    settings: &TunnelSettings,
) -> Result<TunnelClient<Connected>> {
    let tcp = transport.protocol() == TransportProtocol::Tcp;
    let local_endpoint = if tcp {
        Hpai::tcp()
    } else if settings.route_back {
        Hpai::route_back()
    } else {
        match transport.local_addr()? {
            SocketAddr::V4(local) => Hpai::udp(local),
            SocketAddr::V6(_) => return Err(KnxError::no_local_address()),
        }
    };
    // Only TCP connections may ask for a specific tunnel address.
    let requested = settings.individual_address.filter(|_| tcp);
    let (connecting, request) = TunnelClient::new(
        settings.gateway,
        local_endpoint,
        ConnectRequestInfo::tunnel(requested),
    )
    .connect();
    knx_log!(debug, "Connecting to {}", settings.gateway);
    transport.send_to(&request.to_bytes(), settings.gateway).await?;

    let mut buffer = vec![0u8; MAX_FRAME_SIZE];
    let response = timeout(settings.timings.connect_timeout, async {
        loop {
            let (n, _) = match transport.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) if e.is_security() => continue,
                Err(e) => return Err(e),
            };
            match KnxIpFrame::from_bytes(buffer.get(..n).unwrap_or_default()) {
                Ok((KnxIpFrame::ConnectResponse(response), _)) => break Ok::<_, KnxError>(response),
                Ok((other, _)) => {
                    knx_log!(debug, "Ignoring {:?} while connecting", other.service_type());
                }
                Err(e) => knx_log!(debug, "Ignoring undecodable frame: {}", e),
            }
        }
    })
    .await??;
    connecting.handle_connect_response(&response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::GroupAddress;
    use crate::net::mock_transport::{MockFactory, MockHandle, MockTransport};
    use crate::protocol::connection::{channels, ConnectionEnds};
    use crate::protocol::constants::TUNNEL_CONNECTION;
    use crate::protocol::services::{
        ConnectResponse, ConnectResponseData, ConnectionStateResponse, DisconnectRequest,
        DisconnectResponse, TunnellingRequest,
    };
    use crate::secure::Keyring;
    use crate::telegram::{Payload, Telegram};
    use std::net::SocketAddrV4;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    const CHANNEL: u8 = 7;

    fn gateway() -> SocketAddrV4 {
        SocketAddrV4::new([192, 168, 1, 10].into(), 3671)
    }

    fn settings() -> TunnelSettings {
        let mut settings = TunnelSettings::new(gateway().into());
        settings.reconnect_attempts = 2;
        settings.reconnect_backoff = Duration::from_secs(1);
        settings
    }

    fn connect_response() -> KnxIpFrame {
        KnxIpFrame::ConnectResponse(ConnectResponse {
            communication_channel_id: CHANNEL,
            status_code: E_NO_ERROR,
            data_endpoint: Hpai::udp(gateway()),
            crd: ConnectResponseData {
                connection_type: TUNNEL_CONNECTION,
                individual_address: Some(IndividualAddress::new(1, 1, 250).unwrap()),
            },
        })
    }

    fn gateway_transport() -> (MockTransport, MockHandle) {
        let (transport, handle) = MockTransport::pair(gateway().into());
        handle.add_response(&connect_response());
        (transport, handle)
    }

    fn ack(sequence: u8, status_code: u8) -> KnxIpFrame {
        KnxIpFrame::TunnellingAck(TunnellingAck {
            communication_channel_id: CHANNEL,
            sequence_counter: sequence,
            status_code,
        })
    }

    fn group(text: &str) -> GroupAddress {
        text.parse().unwrap()
    }

    async fn start(
        transports: Vec<MockTransport>,
        settings: TunnelSettings,
    ) -> (JoinHandle<Result<()>>, ConnectionEnds) {
        let (task, ends) = channels(8);
        let client = AsyncTunnelClient::connect(MockFactory::new(transports), settings, None, &task.state)
            .await
            .unwrap();
        assert_eq!(client.channel_id(), CHANNEL);
        (tokio::spawn(client.run(task)), ends)
    }

    async fn submit(ends: &ConnectionEnds, telegram: Telegram) -> oneshot::Receiver<Result<()>> {
        let (reply, done) = oneshot::channel();
        ends.requests
            .send(Request::Telegram { telegram, reply })
            .await
            .unwrap();
        done
    }

    async fn expect_connect(handle: &mut MockHandle) {
        assert!(matches!(
            handle.next_frame().await,
            Some(KnxIpFrame::ConnectRequest(_))
        ));
    }

    async fn expect_request(handle: &mut MockHandle) -> TunnellingRequest {
        match handle.next_frame().await {
            Some(KnxIpFrame::TunnellingRequest(request)) => request,
            other => panic!("expected tunnelling request, got {other:?}"),
        }
    }

    fn confirmation_of(request: &TunnellingRequest, sequence: u8) -> KnxIpFrame {
        let mut cemi = CemiFrame::parse(&request.raw_cemi).unwrap();
        cemi.code = CemiMessageCode::LDataCon;
        KnxIpFrame::TunnellingRequest(TunnellingRequest {
            communication_channel_id: CHANNEL,
            sequence_counter: sequence,
            raw_cemi: cemi.to_bytes(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_write_completes_after_ack_and_confirmation() {
        let (transport, mut handle) = gateway_transport();
        let (_runner, ends) = start(vec![transport], settings()).await;
        expect_connect(&mut handle).await;
        assert_eq!(*ends.state.borrow(), ConnectionState::Connected { secure: false });

        let mut done = submit(&ends, Telegram::group_write(group("1/2/3"), Payload::Binary(1))).await;
        let request = expect_request(&mut handle).await;
        assert_eq!(request.communication_channel_id, CHANNEL);
        assert_eq!(request.sequence_counter, 0);
        let cemi = CemiFrame::parse(&request.raw_cemi).unwrap();
        assert_eq!(cemi.code, CemiMessageCode::LDataReq);
        let telegram = cemi.telegram().unwrap();
        assert_eq!(telegram.group_destination(), Some(group("1/2/3")));
        assert_eq!(telegram.source, IndividualAddress::new(1, 1, 250).unwrap());

        handle.add_response(&ack(0, E_NO_ERROR));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(done.try_recv().is_err());

        handle.add_response(&confirmation_of(&request, 0));
        done.await.unwrap().unwrap();
        assert!(matches!(
            handle.next_frame().await,
            Some(KnxIpFrame::TunnellingAck(TunnellingAck { sequence_counter: 0, .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_ack_ignored() {
        let (transport, mut handle) = gateway_transport();
        let (_runner, ends) = start(vec![transport], settings()).await;
        expect_connect(&mut handle).await;

        let first = submit(&ends, Telegram::group_write(group("1/2/3"), Payload::Binary(1))).await;
        let second = submit(&ends, Telegram::group_write(group("1/2/4"), Payload::Binary(0))).await;
        let request = expect_request(&mut handle).await;
        handle.add_response(&ack(0, E_NO_ERROR));
        handle.add_response(&ack(0, E_NO_ERROR));
        handle.add_response(&confirmation_of(&request, 0));
        first.await.unwrap().unwrap();

        // The second telegram uses the next sequence number.
        let _ack_of_confirmation = handle.next_frame().await;
        let request = expect_request(&mut handle).await;
        assert_eq!(request.sequence_counter, 1);
        handle.add_response(&ack(1, E_NO_ERROR));
        handle.add_response(&confirmation_of(&request, 1));
        second.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_before_ack_completes() {
        let (transport, mut handle) = gateway_transport();
        let (_runner, ends) = start(vec![transport], settings()).await;
        expect_connect(&mut handle).await;

        let mut done = submit(&ends, Telegram::group_write(group("1/2/3"), Payload::Binary(1))).await;
        let request = expect_request(&mut handle).await;
        handle.add_response(&confirmation_of(&request, 0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(done.try_recv().is_err());

        handle.add_response(&ack(0, E_NO_ERROR));
        done.await.unwrap().unwrap();

        // Nothing is pending afterwards: the next telegram goes out at once.
        let next = submit(&ends, Telegram::group_write(group("1/2/4"), Payload::Binary(0))).await;
        let _ack_of_confirmation = handle.next_frame().await;
        let request = expect_request(&mut handle).await;
        assert_eq!(request.sequence_counter, 1);
        handle.add_response(&ack(1, E_NO_ERROR));
        handle.add_response(&confirmation_of(&request, 1));
        next.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_confirmation() {
        let (transport, mut handle) = gateway_transport();
        let (_runner, ends) = start(vec![transport], settings()).await;
        expect_connect(&mut handle).await;

        let done = submit(&ends, Telegram::group_write(group("1/2/3"), Payload::Binary(1))).await;
        let request = expect_request(&mut handle).await;
        handle.add_response(&ack(0, E_NO_ERROR));
        let mut cemi = CemiFrame::parse(&request.raw_cemi).unwrap();
        cemi.code = CemiMessageCode::LDataCon;
        let mut raw = cemi.to_bytes();
        // Control field 1 follows the message code and the empty info length.
        raw[2] |= 0x01;
        handle.add_response(&KnxIpFrame::TunnellingRequest(TunnellingRequest {
            communication_channel_id: CHANNEL,
            sequence_counter: 0,
            raw_cemi: raw,
        }));
        let error = done.await.unwrap().unwrap_err();
        assert!(matches!(error, KnxError::Tunneling(ref e) if e.is_negative_confirmation()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cemi_counters() {
        let (transport, mut handle) = gateway_transport();
        let (task, ends) = channels(8);
        let client = AsyncTunnelClient::connect(MockFactory::new([transport]), settings(), None, &task.state)
            .await
            .unwrap();
        let counters = client.counters();
        let _runner = tokio::spawn(client.run(task));
        expect_connect(&mut handle).await;

        let done = submit(&ends, Telegram::group_write(group("1/2/3"), Payload::Binary(1))).await;
        let request = expect_request(&mut handle).await;
        handle.add_response(&ack(0, E_NO_ERROR));
        handle.add_response(&confirmation_of(&request, 0));
        done.await.unwrap().unwrap();
        assert_eq!(counters.outgoing(), 1);
        assert_eq!(counters.errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_data_secure_refuses_send() {
        let keyring = Keyring::new()
            .with_group_key(group("1/2/3"), [0x11; 16])
            .with_sequence_number(u64::MAX);
        let (transport, mut handle) = gateway_transport();
        let (task, ends) = channels(8);
        let client = AsyncTunnelClient::connect(
            MockFactory::new([transport]),
            settings(),
            Some(DataSecure::new(keyring)),
            &task.state,
        )
        .await
        .unwrap();
        let counters = client.counters();
        let _runner = tokio::spawn(client.run(task));
        expect_connect(&mut handle).await;

        let done = submit(&ends, Telegram::group_write(group("1/2/3"), Payload::Binary(1))).await;
        assert!(done.await.unwrap().unwrap_err().is_security());
        assert_eq!(counters.errors(), 1);
        assert_eq!(counters.outgoing(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_ack_fails_request() {
        let (transport, mut handle) = gateway_transport();
        let (_runner, ends) = start(vec![transport], settings()).await;
        expect_connect(&mut handle).await;

        let done = submit(&ends, Telegram::group_read(group("1/2/3"))).await;
        let _request = expect_request(&mut handle).await;
        handle.add_response(&ack(0, 0x29));
        assert!(done.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_resends_then_reconnects() {
        let (transport, mut handle) = gateway_transport();
        let (second, mut second_handle) = gateway_transport();
        let (_runner, ends) = start(vec![transport, second], settings()).await;
        expect_connect(&mut handle).await;

        let done = submit(&ends, Telegram::group_write(group("1/2/3"), Payload::Binary(1))).await;
        let first = expect_request(&mut handle).await;
        let resent = expect_request(&mut handle).await;
        assert_eq!(first, resent);

        assert!(done.await.unwrap().unwrap_err().is_send_timeout());
        assert!(matches!(
            handle.next_frame().await,
            Some(KnxIpFrame::DisconnectRequest(DisconnectRequest { communication_channel_id: CHANNEL, .. }))
        ));
        expect_connect(&mut second_handle).await;

        let mut state = ends.state.clone();
        state
            .wait_for(|state| state.is_connected())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_failures_trigger_reconnect() {
        let (transport, mut handle) = gateway_transport();
        let (second, mut second_handle) = gateway_transport();
        let (_runner, _ends) = start(vec![transport, second], settings()).await;
        expect_connect(&mut handle).await;

        for _ in 0..3 {
            assert!(matches!(
                handle.next_frame().await,
                Some(KnxIpFrame::ConnectionStateRequest(_))
            ));
        }
        assert!(matches!(
            handle.next_frame().await,
            Some(KnxIpFrame::DisconnectRequest(_))
        ));
        expect_connect(&mut second_handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_response_keeps_connection() {
        let (transport, mut handle) = gateway_transport();
        let (_runner, ends) = start(vec![transport], settings()).await;
        expect_connect(&mut handle).await;

        for _ in 0..3 {
            assert!(matches!(
                handle.next_frame().await,
                Some(KnxIpFrame::ConnectionStateRequest(_))
            ));
            handle.add_response(&KnxIpFrame::ConnectionStateResponse(ConnectionStateResponse {
                communication_channel_id: CHANNEL,
                status_code: E_NO_ERROR,
            }));
        }
        assert!(ends.state.borrow().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_indication_delivered_once() {
        let (transport, mut handle) = gateway_transport();
        let (_runner, mut ends) = start(vec![transport], settings()).await;
        expect_connect(&mut handle).await;

        let mut telegram = Telegram::group_write(group("1/2/3"), Payload::Binary(1));
        telegram.source = IndividualAddress::new(1, 1, 5).unwrap();
        let cemi = CemiFrame::from_telegram(&telegram, CemiMessageCode::LDataInd, None);
        let indication = KnxIpFrame::TunnellingRequest(TunnellingRequest {
            communication_channel_id: CHANNEL,
            sequence_counter: 0,
            raw_cemi: cemi.to_bytes(),
        });
        handle.add_response(&indication);
        handle.add_response(&indication);

        let received = ends.inbound.recv().await.unwrap();
        assert_eq!(received.group_destination(), Some(group("1/2/3")));
        assert_eq!(received.source, IndividualAddress::new(1, 1, 5).unwrap());
        for _ in 0..2 {
            assert!(matches!(
                handle.next_frame().await,
                Some(KnxIpFrame::TunnellingAck(TunnellingAck { sequence_counter: 0, .. }))
            ));
        }
        assert!(ends.inbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_disconnect_answered_and_reconnected() {
        let (transport, mut handle) = gateway_transport();
        let (second, mut second_handle) = gateway_transport();
        let (_runner, _ends) = start(vec![transport, second], settings()).await;
        expect_connect(&mut handle).await;

        handle.add_response(&KnxIpFrame::DisconnectRequest(DisconnectRequest {
            communication_channel_id: CHANNEL,
            control_endpoint: Hpai::udp(gateway()),
        }));
        assert!(matches!(
            handle.next_frame().await,
            Some(KnxIpFrame::DisconnectResponse(DisconnectResponse {
                communication_channel_id: CHANNEL,
                ..
            }))
        ));
        expect_connect(&mut second_handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_disconnects_and_rejects_queue() {
        let (transport, mut handle) = gateway_transport();
        let (runner, ends) = start(vec![transport], settings()).await;
        expect_connect(&mut handle).await;

        ends.shutdown.send(()).unwrap();
        assert!(matches!(
            handle.next_frame().await,
            Some(KnxIpFrame::DisconnectRequest(_))
        ));
        handle.add_response(&KnxIpFrame::DisconnectResponse(DisconnectResponse {
            communication_channel_id: CHANNEL,
            status_code: E_NO_ERROR,
        }));
        runner.await.unwrap().unwrap();
        assert_eq!(*ends.state.borrow(), ConnectionState::Disconnected);

        let (reply, _done) = oneshot::channel();
        let telegram = Telegram::group_read(group("1/2/3"));
        assert!(ends
            .requests
            .send(Request::Telegram { telegram, reply })
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up() {
        let (transport, mut handle) = gateway_transport();
        let (runner, ends) = start(vec![transport], settings()).await;
        expect_connect(&mut handle).await;

        handle.disconnect();
        let error = runner.await.unwrap().unwrap_err();
        assert!(error.is_connection_lost());
        assert_eq!(*ends.state.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_refused() {
        let (transport, handle) = MockTransport::pair(gateway().into());
        handle.add_response(&KnxIpFrame::ConnectResponse(ConnectResponse {
            communication_channel_id: 0,
            status_code: 0x24,
            data_endpoint: Hpai::route_back(),
            crd: ConnectResponseData::default(),
        }));
        let (task, _ends) = channels(1);
        let error = AsyncTunnelClient::connect(MockFactory::new([transport]), settings(), None, &task.state)
            .await
            .unwrap_err();
        assert_eq!(error.refused_status(), Some(0x24));
        assert_eq!(*task.state.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feature_get_returns_value() {
        let (transport, mut handle) = gateway_transport();
        let (_runner, ends) = start(vec![transport], settings()).await;
        expect_connect(&mut handle).await;

        let (reply, done) = oneshot::channel();
        ends.requests
            .send(Request::FeatureGet {
                feature: TunnellingFeatureType::MaxApduLength,
                reply,
            })
            .await
            .unwrap();
        assert!(matches!(
            handle.next_frame().await,
            Some(KnxIpFrame::TunnellingFeatureGet(_))
        ));
        handle.add_response(&ack(0, E_NO_ERROR));
        handle.add_response(&KnxIpFrame::TunnellingFeatureResponse(TunnellingFeature {
            communication_channel_id: CHANNEL,
            sequence_counter: 0,
            status_code: E_NO_ERROR,
            feature_type: TunnellingFeatureType::MaxApduLength,
            data: vec![0x00, 0xF8],
        }));
        assert_eq!(done.await.unwrap().unwrap(), vec![0x00, 0xF8]);
    }
}
