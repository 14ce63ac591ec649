//! KNXnet/IP Tunneling Client with Typestate Pattern
//!
//! This module holds the pure protocol state of one tunnel connection. It
//! performs no I/O: every method that wants something on the wire returns a
//! [`KnxIpFrame`], and every frame received from the gateway is fed back in.
//! The async driver in [`async_tunnel`](super::async_tunnel) owns the socket
//! and the timers.
//!
//! ## Features
//!
//! - **Compile-time state validation** using typestate pattern
//! - Connection management (CONNECT/DISCONNECT)
//! - Heartbeat (CONNECTIONSTATE)
//! - Send and receive sequence counters with duplicate detection
//! - Tunnelling feature get/set
//!
//! ## Example
//!
//! ```rust
//! use knx_engine::protocol::tunnel::{TunnelClient, AckResult};
//! use knx_engine::protocol::frame::{Hpai, KnxIpFrame};
//! use knx_engine::protocol::services::{ConnectRequestInfo, ConnectResponse, ConnectResponseData, TunnellingAck};
//!
//! let gateway = "192.168.1.10:3671".parse().unwrap();
//! let local = Hpai::udp("192.168.1.20:50000".parse().unwrap());
//! let client = TunnelClient::new(gateway, local, ConnectRequestInfo::tunnel(None));
//!
//! // Idle -> Connecting
//! let (client, _connect_request) = client.connect();
//!
//! // Connecting -> Connected
//! let response = ConnectResponse {
//!     communication_channel_id: 7,
//!     status_code: 0,
//!     data_endpoint: Hpai::udp("192.168.1.10:3671".parse().unwrap()),
//!     crd: ConnectResponseData { connection_type: 4, individual_address: Some("1.1.250".parse().unwrap()) },
//! };
//! let mut client = client.handle_connect_response(&response).unwrap();
//!
//! // Sending is only possible while connected
//! let frame = client.tunnelling_request(vec![0x11, 0x00]);
//! assert!(matches!(frame, KnxIpFrame::TunnellingRequest(_)));
//! let ack = TunnellingAck { communication_channel_id: 7, sequence_counter: 0, status_code: 0 };
//! assert_eq!(client.check_ack(&ack), AckResult::Accepted);
//! assert_eq!(client.send_sequence(), 1);
//!
//! // Connected -> Disconnecting -> Idle
//! let (client, _disconnect_request) = client.disconnect();
//! let _idle = client.finish();
//! ```

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::protocol::constants::{TunnellingFeatureType, E_NO_ERROR};
use crate::protocol::frame::{Hpai, KnxIpFrame};
use crate::protocol::services::{
    ConnectRequest, ConnectRequestInfo, ConnectResponse, ConnectionStateRequest,
    ConnectionStateResponse, DisconnectRequest, DisconnectResponse, TunnellingAck,
    TunnellingFeature, TunnellingRequest,
};
use std::net::SocketAddr;

// =============================================================================
// State Types
// =============================================================================

/// Client is idle (not connected)
#[derive(Debug, Clone, Copy)]
pub struct Idle;

/// Connection request sent, waiting for response
#[derive(Debug, Clone, Copy)]
pub struct Connecting;

/// Connected and ready to send/receive
#[derive(Debug, Clone, Copy)]
pub struct Connected {
    /// Communication channel ID assigned by gateway
    pub channel_id: u8,
    /// Address the gateway assigned to this tunnel
    pub individual_address: IndividualAddress,
    /// Where tunnelling frames are sent
    pub data_endpoint: SocketAddr,
    /// Sequence number of the next outgoing request (wraps at 256)
    pub send_sequence: u8,
    /// Sequence number expected from the gateway (wraps at 256)
    pub recv_sequence: u8,
}

/// Disconnect request sent
#[derive(Debug, Clone, Copy)]
pub struct Disconnecting {
    /// Channel being closed
    pub channel_id: u8,
}

// =============================================================================
// Results of feeding frames into a connected client
// =============================================================================

/// Outcome of matching a `TUNNELLING_ACK` against the request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckResult {
    /// Ack for the request in flight; the send sequence advanced
    Accepted,
    /// Ack for the request in flight with an error status
    Rejected(u8),
    /// Other channel or sequence number; ignore
    Unrelated,
}

/// Classification of an inbound `TUNNELLING_REQUEST` sequence counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundSequence {
    /// Expected sequence number: acknowledge and process
    New,
    /// Same as the last processed one: acknowledge, do not process again
    Duplicate,
    /// Anything else: the connection must be rebuilt
    OutOfOrder,
    /// Not addressed to this channel
    ForeignChannel,
}

// =============================================================================
// Tunneling Client with Generic State Parameter
// =============================================================================

/// Tunneling client state for one gateway connection.
///
/// ## State Machine
///
/// ```text
/// Idle → Connecting → Connected → Disconnecting → Idle
///         ↓ (error)
///         (dropped)
/// ```
///
/// - `TunnelClient<Idle>` can only call `connect()`
/// - `TunnelClient<Connecting>` can only call `handle_connect_response()` or `cancel()`
/// - `TunnelClient<Connected>` builds requests, checks acks and sequence
///   numbers, or starts `disconnect()`
/// - `TunnelClient<Disconnecting>` can only call `finish()`
#[derive(Debug, Clone)]
pub struct TunnelClient<State> {
    /// Gateway control endpoint
    gateway: SocketAddr,
    /// Local endpoint advertised in the connect request
    local_endpoint: Hpai,
    /// Requested connection
    cri: ConnectRequestInfo,
    /// Current state
    state: State,
}

// =============================================================================
// Methods Available in ALL States
// =============================================================================

impl<S> TunnelClient<S> {
    /// Gateway control endpoint
    #[inline]
    pub const fn gateway(&self) -> SocketAddr {
        self.gateway
    }

    /// Local endpoint advertised to the gateway
    #[inline]
    pub const fn local_endpoint(&self) -> Hpai {
        self.local_endpoint
    }

    fn transition<T>(self, state: T) -> TunnelClient<T> {
        TunnelClient {
            gateway: self.gateway,
            local_endpoint: self.local_endpoint,
            cri: self.cri,
            state,
        }
    }
}

// =============================================================================
// Idle State
// =============================================================================

impl TunnelClient<Idle> {
    /// Create a new client for `gateway`.
    ///
    /// `local_endpoint` is advertised as both control and data endpoint; use
    /// [`Hpai::route_back`] behind NAT and [`Hpai::tcp`] on stream transports.
    pub fn new(gateway: SocketAddr, local_endpoint: Hpai, cri: ConnectRequestInfo) -> Self {
        Self {
            gateway,
            local_endpoint,
            cri,
            state: Idle,
        }
    }

    /// Build the `CONNECT_REQUEST` (Idle → Connecting).
    pub fn connect(self) -> (TunnelClient<Connecting>, KnxIpFrame) {
        let request = KnxIpFrame::ConnectRequest(ConnectRequest {
            control_endpoint: self.local_endpoint,
            data_endpoint: self.local_endpoint,
            cri: self.cri,
        });
        (self.transition(Connecting), request)
    }
}

// =============================================================================
// Connecting State
// =============================================================================

impl TunnelClient<Connecting> {
    /// Handle the `CONNECT_RESPONSE` (Connecting → Connected).
    ///
    /// The data endpoint comes from the response; a route-back or TCP HPAI,
    /// or a route-back local endpoint, keeps using the control endpoint.
    ///
    /// # Errors
    ///
    /// `ConnectionRefused` carrying the status code when the gateway did not
    /// accept the connection.
    pub fn handle_connect_response(
        self,
        response: &ConnectResponse,
    ) -> Result<TunnelClient<Connected>> {
        if response.status_code != E_NO_ERROR {
            knx_log!(
                warn,
                "Gateway {} refused connection: 0x{:02X}",
                self.gateway,
                response.status_code
            );
            return Err(KnxError::connection_refused(response.status_code));
        }
        let data_endpoint = if self.local_endpoint.is_route_back()
            || response.data_endpoint.is_route_back()
            || response.data_endpoint.is_tcp()
        {
            self.gateway
        } else {
            response.data_endpoint.socket_addr()
        };
        let individual_address = response.crd.individual_address.unwrap_or_default();
        knx_log!(
            info,
            "Tunnel established: channel {} address {}",
            response.communication_channel_id,
            individual_address
        );
        let state = Connected {
            channel_id: response.communication_channel_id,
            individual_address,
            data_endpoint,
            send_sequence: 0,
            recv_sequence: 0,
        };
        Ok(self.transition(state))
    }

    /// Cancel connection attempt (Connecting → Idle)
    pub fn cancel(self) -> TunnelClient<Idle> {
        self.transition(Idle)
    }
}

// =============================================================================
// Connected State
// =============================================================================

impl TunnelClient<Connected> {
    /// Communication channel ID
    #[inline]
    pub const fn channel_id(&self) -> u8 {
        self.state.channel_id
    }

    /// Individual address assigned by the gateway
    #[inline]
    pub const fn individual_address(&self) -> IndividualAddress {
        self.state.individual_address
    }

    /// Endpoint tunnelling frames are sent to
    #[inline]
    pub const fn data_endpoint(&self) -> SocketAddr {
        self.state.data_endpoint
    }

    /// Sequence number of the next outgoing request
    #[inline]
    pub const fn send_sequence(&self) -> u8 {
        self.state.send_sequence
    }

    /// Sequence number expected from the gateway
    #[inline]
    pub const fn recv_sequence(&self) -> u8 {
        self.state.recv_sequence
    }

    /// Build a `TUNNELLING_REQUEST` for `raw_cemi`.
    ///
    /// The current send sequence is used and stays unchanged until the
    /// matching ack arrives, so calling this again produces the resend.
    pub fn tunnelling_request(&self, raw_cemi: Vec<u8>) -> KnxIpFrame {
        KnxIpFrame::TunnellingRequest(TunnellingRequest {
            communication_channel_id: self.state.channel_id,
            sequence_counter: self.state.send_sequence,
            raw_cemi,
        })
    }

    /// Match a `TUNNELLING_ACK` against the request in flight.
    pub fn check_ack(&mut self, ack: &TunnellingAck) -> AckResult {
        if ack.communication_channel_id != self.state.channel_id
            || ack.sequence_counter != self.state.send_sequence
        {
            knx_log!(
                debug,
                "Ignoring ack channel {} seq {} (expected {} / {})",
                ack.communication_channel_id,
                ack.sequence_counter,
                self.state.channel_id,
                self.state.send_sequence
            );
            return AckResult::Unrelated;
        }
        if ack.status_code != E_NO_ERROR {
            return AckResult::Rejected(ack.status_code);
        }
        self.state.send_sequence = self.state.send_sequence.wrapping_add(1);
        AckResult::Accepted
    }

    /// Classify an inbound sequence counter, advancing the receive sequence
    /// for new frames.
    pub fn check_inbound(&mut self, channel_id: u8, sequence: u8) -> InboundSequence {
        if channel_id != self.state.channel_id {
            return InboundSequence::ForeignChannel;
        }
        if sequence == self.state.recv_sequence {
            self.state.recv_sequence = self.state.recv_sequence.wrapping_add(1);
            InboundSequence::New
        } else if sequence == self.state.recv_sequence.wrapping_sub(1) {
            InboundSequence::Duplicate
        } else {
            knx_log!(
                warn,
                "Out of order tunnelling request: got {} expected {}",
                sequence,
                self.state.recv_sequence
            );
            InboundSequence::OutOfOrder
        }
    }

    /// Build a `TUNNELLING_ACK` for an inbound request.
    pub fn ack(&self, sequence: u8) -> KnxIpFrame {
        KnxIpFrame::TunnellingAck(TunnellingAck {
            communication_channel_id: self.state.channel_id,
            sequence_counter: sequence,
            status_code: E_NO_ERROR,
        })
    }

    /// Build a `DEVICE_CONFIGURATION_ACK` for an inbound request.
    pub fn device_configuration_ack(&self, sequence: u8) -> KnxIpFrame {
        KnxIpFrame::DeviceConfigurationAck(TunnellingAck {
            communication_channel_id: self.state.channel_id,
            sequence_counter: sequence,
            status_code: E_NO_ERROR,
        })
    }

    /// Build a `TUNNELLING_FEATURE_GET`. It shares the send sequence with
    /// tunnelling requests and is acknowledged the same way.
    pub fn feature_get(&self, feature: TunnellingFeatureType) -> KnxIpFrame {
        KnxIpFrame::TunnellingFeatureGet(self.feature(feature, Vec::new()))
    }

    /// Build a `TUNNELLING_FEATURE_SET`.
    pub fn feature_set(&self, feature: TunnellingFeatureType, value: Vec<u8>) -> KnxIpFrame {
        KnxIpFrame::TunnellingFeatureSet(self.feature(feature, value))
    }

    fn feature(&self, feature_type: TunnellingFeatureType, data: Vec<u8>) -> TunnellingFeature {
        TunnellingFeature {
            communication_channel_id: self.state.channel_id,
            sequence_counter: self.state.send_sequence,
            status_code: 0,
            feature_type,
            data,
        }
    }

    /// Build a heartbeat `CONNECTIONSTATE_REQUEST`.
    pub fn connection_state_request(&self) -> KnxIpFrame {
        KnxIpFrame::ConnectionStateRequest(ConnectionStateRequest {
            communication_channel_id: self.state.channel_id,
            control_endpoint: self.local_endpoint,
        })
    }

    /// `true` if `response` answers this channel's heartbeat.
    pub fn is_own_connection_state(&self, response: &ConnectionStateResponse) -> bool {
        response.communication_channel_id == self.state.channel_id
    }

    /// Validate a heartbeat response.
    ///
    /// # Errors
    ///
    /// `ConnectionLost` when the gateway reports an error for the channel.
    pub fn check_connection_state(&self, response: &ConnectionStateResponse) -> Result<()> {
        if response.status_code != E_NO_ERROR {
            knx_log!(
                warn,
                "Heartbeat for channel {} failed: 0x{:02X}",
                self.state.channel_id,
                response.status_code
            );
            return Err(KnxError::connection_lost());
        }
        Ok(())
    }

    /// Answer a gateway-initiated `DISCONNECT_REQUEST` (Connected → Idle).
    ///
    /// Returns `Err(self)` if the request is for another channel.
    pub fn handle_disconnect_request(
        self,
        request: &DisconnectRequest,
    ) -> core::result::Result<(TunnelClient<Idle>, KnxIpFrame), Self> {
        if request.communication_channel_id != self.state.channel_id {
            return Err(self);
        }
        knx_log!(info, "Gateway closed channel {}", self.state.channel_id);
        let response = KnxIpFrame::DisconnectResponse(DisconnectResponse {
            communication_channel_id: self.state.channel_id,
            status_code: E_NO_ERROR,
        });
        Ok((self.transition(Idle), response))
    }

    /// Build the `DISCONNECT_REQUEST` (Connected → Disconnecting).
    pub fn disconnect(self) -> (TunnelClient<Disconnecting>, KnxIpFrame) {
        let channel_id = self.state.channel_id;
        let request = KnxIpFrame::DisconnectRequest(DisconnectRequest {
            communication_channel_id: channel_id,
            control_endpoint: self.local_endpoint,
        });
        (self.transition(Disconnecting { channel_id }), request)
    }
}

// =============================================================================
// Disconnecting State
// =============================================================================

impl TunnelClient<Disconnecting> {
    /// `true` if `response` closes the channel being disconnected.
    pub fn is_own_disconnect_response(&self, response: &DisconnectResponse) -> bool {
        response.communication_channel_id == self.state.channel_id
    }

    /// Finish disconnection (Disconnecting → Idle).
    ///
    /// Called on the `DISCONNECT_RESPONSE` or when waiting for it timed out.
    pub fn finish(self) -> TunnelClient<Idle> {
        self.transition(Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::services::ConnectResponseData;

    fn gateway() -> SocketAddr {
        "192.168.1.10:3671".parse().unwrap()
    }

    fn response(status: u8, data_endpoint: Hpai) -> ConnectResponse {
        ConnectResponse {
            communication_channel_id: 0x15,
            status_code: status,
            data_endpoint,
            crd: ConnectResponseData {
                connection_type: 4,
                individual_address: Some(IndividualAddress::new(1, 1, 250).unwrap()),
            },
        }
    }

    fn connected() -> TunnelClient<Connected> {
        let local = Hpai::udp("192.168.1.20:50000".parse().unwrap());
        let client = TunnelClient::new(gateway(), local, ConnectRequestInfo::tunnel(None));
        let (client, _) = client.connect();
        let data = Hpai::udp("192.168.1.10:50100".parse().unwrap());
        client.handle_connect_response(&response(0, data)).unwrap()
    }

    #[test]
    fn test_connect_request_uses_local_endpoint() {
        let local = Hpai::udp("192.168.1.20:50000".parse().unwrap());
        let client = TunnelClient::new(gateway(), local, ConnectRequestInfo::tunnel(None));
        let (_, frame) = client.connect();
        let KnxIpFrame::ConnectRequest(request) = frame else {
            panic!("expected connect request");
        };
        assert_eq!(request.control_endpoint, local);
        assert_eq!(request.data_endpoint, local);
    }

    #[test]
    fn test_state_transitions() {
        let client = connected();
        assert_eq!(client.channel_id(), 0x15);
        assert_eq!(client.individual_address().to_string(), "1.1.250");
        assert_eq!(client.data_endpoint(), "192.168.1.10:50100".parse().unwrap());

        let (client, frame) = client.disconnect();
        assert!(matches!(frame, KnxIpFrame::DisconnectRequest(ref r) if r.communication_channel_id == 0x15));
        assert!(client.is_own_disconnect_response(&DisconnectResponse {
            communication_channel_id: 0x15,
            status_code: 0,
        }));
        let _idle = client.finish();
    }

    #[test]
    fn test_connect_error() {
        let client = TunnelClient::new(gateway(), Hpai::route_back(), ConnectRequestInfo::tunnel(None));
        let (client, _) = client.connect();
        let err = client
            .handle_connect_response(&response(0x24, Hpai::route_back()))
            .unwrap_err();
        assert_eq!(err.refused_status(), Some(0x24));
    }

    #[test]
    fn test_route_back_uses_control_endpoint() {
        let client = TunnelClient::new(gateway(), Hpai::route_back(), ConnectRequestInfo::tunnel(None));
        let (client, _) = client.connect();
        let data = Hpai::udp("10.0.0.1:4000".parse().unwrap());
        let client = client.handle_connect_response(&response(0, data)).unwrap();
        assert_eq!(client.data_endpoint(), gateway());
    }

    #[test]
    fn test_cancel_connection() {
        let client = TunnelClient::new(gateway(), Hpai::route_back(), ConnectRequestInfo::tunnel(None));
        let (client, _) = client.connect();
        let client = client.cancel();
        assert_eq!(client.gateway(), gateway());
    }

    #[test]
    fn test_resend_uses_same_sequence() {
        let mut client = connected();
        let first = client.tunnelling_request(vec![0x11]);
        let resend = client.tunnelling_request(vec![0x11]);
        assert_eq!(first, resend);

        let ack = TunnellingAck {
            communication_channel_id: 0x15,
            sequence_counter: 0,
            status_code: 0,
        };
        assert_eq!(client.check_ack(&ack), AckResult::Accepted);
        assert_eq!(client.send_sequence(), 1);
        // The same ack again no longer matches.
        assert_eq!(client.check_ack(&ack), AckResult::Unrelated);
    }

    #[test]
    fn test_rejected_ack_keeps_sequence() {
        let mut client = connected();
        let ack = TunnellingAck {
            communication_channel_id: 0x15,
            sequence_counter: 0,
            status_code: 0x29,
        };
        assert_eq!(client.check_ack(&ack), AckResult::Rejected(0x29));
        assert_eq!(client.send_sequence(), 0);
    }

    #[test]
    fn test_sequence_wrapping() {
        let mut client = connected();
        for _ in 0..256 {
            let ack = TunnellingAck {
                communication_channel_id: 0x15,
                sequence_counter: client.send_sequence(),
                status_code: 0,
            };
            assert_eq!(client.check_ack(&ack), AckResult::Accepted);
        }
        assert_eq!(client.send_sequence(), 0);
    }

    #[test]
    fn test_inbound_sequence() {
        let mut client = connected();
        assert_eq!(client.check_inbound(0x15, 0), InboundSequence::New);
        assert_eq!(client.check_inbound(0x15, 0), InboundSequence::Duplicate);
        assert_eq!(client.check_inbound(0x15, 1), InboundSequence::New);
        assert_eq!(client.check_inbound(0x15, 5), InboundSequence::OutOfOrder);
        assert_eq!(client.check_inbound(0x16, 2), InboundSequence::ForeignChannel);
        assert_eq!(client.recv_sequence(), 2);
    }

    #[test]
    fn test_heartbeat() {
        let client = connected();
        assert!(matches!(
            client.connection_state_request(),
            KnxIpFrame::ConnectionStateRequest(ref r) if r.communication_channel_id == 0x15
        ));
        let ok = ConnectionStateResponse {
            communication_channel_id: 0x15,
            status_code: 0,
        };
        assert!(client.is_own_connection_state(&ok));
        assert!(client.check_connection_state(&ok).is_ok());
        let failed = ConnectionStateResponse {
            communication_channel_id: 0x15,
            status_code: 0x21,
        };
        assert!(client.check_connection_state(&failed).unwrap_err().is_connection_lost());
    }

    #[test]
    fn test_gateway_disconnect() {
        let client = connected();
        let other = DisconnectRequest {
            communication_channel_id: 0x01,
            control_endpoint: Hpai::route_back(),
        };
        let client = client.handle_disconnect_request(&other).unwrap_err();
        let own = DisconnectRequest {
            communication_channel_id: 0x15,
            control_endpoint: Hpai::route_back(),
        };
        let (_, frame) = client.handle_disconnect_request(&own).unwrap();
        assert_eq!(
            frame,
            KnxIpFrame::DisconnectResponse(DisconnectResponse {
                communication_channel_id: 0x15,
                status_code: 0,
            })
        );
    }

    #[test]
    fn test_feature_frames() {
        let client = connected();
        let KnxIpFrame::TunnellingFeatureSet(set) =
            client.feature_set(TunnellingFeatureType::InterfaceFeatureInfoServiceEnable, vec![1])
        else {
            panic!("expected feature set");
        };
        assert_eq!(set.sequence_counter, 0);
        assert_eq!(set.data, vec![1]);
        assert!(matches!(
            client.feature_get(TunnellingFeatureType::MaxApduLength),
            KnxIpFrame::TunnellingFeatureGet(ref get) if get.data.is_empty()
        ));
    }
}
