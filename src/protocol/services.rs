//! Bodies of the core, device management, tunnelling and routing services.
//!
//! Each body knows how to `parse` itself from the bytes following the
//! KNXnet/IP header and how to `encode` itself by appending to a buffer.
//! [`KnxIpFrame`](super::frame::KnxIpFrame) adds the header.
//!
//! Bodies carrying a cEMI frame keep it as raw bytes so that a receiver can
//! acknowledge a request before (and regardless of) interpreting the cEMI.

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::protocol::constants::{
    TunnellingFeatureType, DEVICE_MGMT_CONNECTION, E_NO_ERROR, TUNNEL_CONNECTION,
    TUNNEL_LINKLAYER,
};
use crate::protocol::dib::{Dib, Srp};
use crate::protocol::frame::Hpai;
use std::time::Duration;

fn hpai_at(body: &[u8], offset: usize) -> Result<Hpai> {
    Hpai::parse(body.get(offset..).ok_or_else(KnxError::invalid_frame)?)
}

/// Connection header shared by tunnelling and device configuration bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct ConnectionHeader {
    channel: u8,
    sequence: u8,
    status: u8,
}

impl ConnectionHeader {
    const SIZE: usize = 4;

    fn parse(body: &[u8]) -> Result<Self> {
        match body {
            [4, channel, sequence, status, ..] => Ok(Self {
                channel: *channel,
                sequence: *sequence,
                status: *status,
            }),
            _ => Err(KnxError::invalid_frame()),
        }
    }

    fn encode(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[
            Self::SIZE as u8,
            self.channel,
            self.sequence,
            self.status,
        ]);
    }
}

// =============================================================================
// Discovery and description
// =============================================================================

/// `SEARCH_REQUEST`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchRequest {
    /// Where responses are sent
    pub discovery_endpoint: Hpai,
}

impl SearchRequest {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        Ok(Self {
            discovery_endpoint: Hpai::parse(body)?,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        self.discovery_endpoint.encode(out);
    }
}

/// `SEARCH_REQUEST_EXTENDED`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequestExtended {
    /// Where responses are sent
    pub discovery_endpoint: Hpai,
    /// Search request parameters
    pub srps: Vec<Srp>,
}

impl SearchRequestExtended {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        let discovery_endpoint = Hpai::parse(body)?;
        let mut rest = &body[Hpai::SIZE..];
        let mut srps = Vec::new();
        while !rest.is_empty() {
            let (srp, used) = Srp::parse(rest)?;
            srps.push(srp);
            rest = &rest[used..];
        }
        Ok(Self {
            discovery_endpoint,
            srps,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        self.discovery_endpoint.encode(out);
        for srp in &self.srps {
            srp.encode(out);
        }
    }
}

/// `SEARCH_RESPONSE` and `SEARCH_RESPONSE_EXTENDED`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    /// Control endpoint of the responding server
    pub control_endpoint: Hpai,
    /// Description blocks
    pub dibs: Vec<Dib>,
}

impl SearchResponse {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        Ok(Self {
            control_endpoint: Hpai::parse(body)?,
            dibs: Dib::parse_all(&body[Hpai::SIZE..])?,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        self.control_endpoint.encode(out);
        for dib in &self.dibs {
            dib.encode(out);
        }
    }
}

/// `DESCRIPTION_REQUEST`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptionRequest {
    /// Where the response is sent
    pub control_endpoint: Hpai,
}

impl DescriptionRequest {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        Ok(Self {
            control_endpoint: Hpai::parse(body)?,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        self.control_endpoint.encode(out);
    }
}

/// `DESCRIPTION_RESPONSE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionResponse {
    /// Description blocks
    pub dibs: Vec<Dib>,
}

impl DescriptionResponse {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        Ok(Self {
            dibs: Dib::parse_all(body)?,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        for dib in &self.dibs {
            dib.encode(out);
        }
    }
}

// =============================================================================
// Connection management
// =============================================================================

/// Connection Request Information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectRequestInfo {
    /// Connection type code
    pub connection_type: u8,
    /// KNX layer (tunnel connections only)
    pub knx_layer: u8,
    /// Requested tunnel address (TCP extended CRI)
    pub individual_address: Option<IndividualAddress>,
}

impl ConnectRequestInfo {
    /// Link-layer tunnel, optionally asking for a specific address.
    pub const fn tunnel(individual_address: Option<IndividualAddress>) -> Self {
        Self {
            connection_type: TUNNEL_CONNECTION,
            knx_layer: TUNNEL_LINKLAYER,
            individual_address,
        }
    }

    /// Device management connection.
    pub const fn device_management() -> Self {
        Self {
            connection_type: DEVICE_MGMT_CONNECTION,
            knx_layer: 0,
            individual_address: None,
        }
    }

    fn parse(data: &[u8]) -> Result<Self> {
        match data {
            [2, connection_type, ..] => Ok(Self {
                connection_type: *connection_type,
                knx_layer: 0,
                individual_address: None,
            }),
            [4, connection_type, knx_layer, _, ..] => Ok(Self {
                connection_type: *connection_type,
                knx_layer: *knx_layer,
                individual_address: None,
            }),
            [6, connection_type, knx_layer, _, hi, lo, ..] => Ok(Self {
                connection_type: *connection_type,
                knx_layer: *knx_layer,
                individual_address: Some(IndividualAddress::from_wire([*hi, *lo])),
            }),
            _ => Err(KnxError::invalid_frame()),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        if self.connection_type != TUNNEL_CONNECTION {
            out.extend_from_slice(&[2, self.connection_type]);
            return;
        }
        match self.individual_address {
            Some(ia) => {
                out.extend_from_slice(&[6, self.connection_type, self.knx_layer, 0]);
                out.extend_from_slice(&ia.to_wire());
            }
            None => out.extend_from_slice(&[4, self.connection_type, self.knx_layer, 0]),
        }
    }
}

/// `CONNECT_REQUEST`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Endpoint for control frames
    pub control_endpoint: Hpai,
    /// Endpoint for tunnelling frames
    pub data_endpoint: Hpai,
    /// Requested connection
    pub cri: ConnectRequestInfo,
}

impl ConnectRequest {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        Ok(Self {
            control_endpoint: Hpai::parse(body)?,
            data_endpoint: hpai_at(body, Hpai::SIZE)?,
            cri: ConnectRequestInfo::parse(&body[2 * Hpai::SIZE..])?,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        self.control_endpoint.encode(out);
        self.data_endpoint.encode(out);
        self.cri.encode(out);
    }
}

/// Connection Response Data Block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectResponseData {
    /// Connection type code
    pub connection_type: u8,
    /// Address assigned to a tunnel
    pub individual_address: Option<IndividualAddress>,
}

impl ConnectResponseData {
    fn parse(data: &[u8]) -> Result<Self> {
        match data {
            [4, connection_type, hi, lo, ..] => Ok(Self {
                connection_type: *connection_type,
                individual_address: Some(IndividualAddress::from_wire([*hi, *lo])),
            }),
            [2, connection_type, ..] => Ok(Self {
                connection_type: *connection_type,
                individual_address: None,
            }),
            _ => Err(KnxError::invalid_frame()),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self.individual_address {
            Some(ia) => {
                out.extend_from_slice(&[4, self.connection_type]);
                out.extend_from_slice(&ia.to_wire());
            }
            None => out.extend_from_slice(&[2, self.connection_type]),
        }
    }
}

/// `CONNECT_RESPONSE`
///
/// When the status is not `E_NO_ERROR` the server may omit the data endpoint
/// and CRD; they decode as route-back and empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Channel assigned by the server
    pub communication_channel_id: u8,
    /// Status code
    pub status_code: u8,
    /// Server data endpoint
    pub data_endpoint: Hpai,
    /// Connection response data
    pub crd: ConnectResponseData,
}

impl ConnectResponse {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        let [channel, status, rest @ ..] = body else {
            return Err(KnxError::invalid_frame());
        };
        if *status != E_NO_ERROR && rest.is_empty() {
            return Ok(Self {
                communication_channel_id: *channel,
                status_code: *status,
                data_endpoint: Hpai::route_back(),
                crd: ConnectResponseData::default(),
            });
        }
        Ok(Self {
            communication_channel_id: *channel,
            status_code: *status,
            data_endpoint: Hpai::parse(rest)?,
            crd: ConnectResponseData::parse(&rest[Hpai::SIZE..])?,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.communication_channel_id, self.status_code]);
        if self.status_code == E_NO_ERROR {
            self.data_endpoint.encode(out);
            self.crd.encode(out);
        }
    }
}

/// `CONNECTIONSTATE_REQUEST`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateRequest {
    /// Channel being checked
    pub communication_channel_id: u8,
    /// Where the response is sent
    pub control_endpoint: Hpai,
}

impl ConnectionStateRequest {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        let channel = *body.first().ok_or_else(KnxError::invalid_frame)?;
        Ok(Self {
            communication_channel_id: channel,
            control_endpoint: hpai_at(body, 2)?,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.communication_channel_id, 0]);
        self.control_endpoint.encode(out);
    }
}

/// `CONNECTIONSTATE_RESPONSE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateResponse {
    /// Channel that was checked
    pub communication_channel_id: u8,
    /// Status code
    pub status_code: u8,
}

impl ConnectionStateResponse {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        match body {
            [channel, status, ..] => Ok(Self {
                communication_channel_id: *channel,
                status_code: *status,
            }),
            _ => Err(KnxError::invalid_frame()),
        }
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.communication_channel_id, self.status_code]);
    }
}

/// `DISCONNECT_REQUEST`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectRequest {
    /// Channel being closed
    pub communication_channel_id: u8,
    /// Where the response is sent
    pub control_endpoint: Hpai,
}

impl DisconnectRequest {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        let ConnectionStateRequest {
            communication_channel_id,
            control_endpoint,
        } = ConnectionStateRequest::parse(body)?;
        Ok(Self {
            communication_channel_id,
            control_endpoint,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.communication_channel_id, 0]);
        self.control_endpoint.encode(out);
    }
}

/// `DISCONNECT_RESPONSE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectResponse {
    /// Channel that was closed
    pub communication_channel_id: u8,
    /// Status code
    pub status_code: u8,
}

impl DisconnectResponse {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        let ConnectionStateResponse {
            communication_channel_id,
            status_code,
        } = ConnectionStateResponse::parse(body)?;
        Ok(Self {
            communication_channel_id,
            status_code,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.communication_channel_id, self.status_code]);
    }
}

// =============================================================================
// Tunnelling and device management
// =============================================================================

/// `TUNNELLING_REQUEST` and `DEVICE_CONFIGURATION_REQUEST`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnellingRequest {
    /// Channel of the connection
    pub communication_channel_id: u8,
    /// Sequence counter of the sender
    pub sequence_counter: u8,
    /// Undecoded cEMI frame
    pub raw_cemi: Vec<u8>,
}

impl TunnellingRequest {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        let header = ConnectionHeader::parse(body)?;
        Ok(Self {
            communication_channel_id: header.channel,
            sequence_counter: header.sequence,
            raw_cemi: body[ConnectionHeader::SIZE..].to_vec(),
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        ConnectionHeader {
            channel: self.communication_channel_id,
            sequence: self.sequence_counter,
            status: 0,
        }
        .encode(out);
        out.extend_from_slice(&self.raw_cemi);
    }
}

/// `TUNNELLING_ACK` and `DEVICE_CONFIGURATION_ACK`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnellingAck {
    /// Channel of the connection
    pub communication_channel_id: u8,
    /// Sequence counter being acknowledged
    pub sequence_counter: u8,
    /// Status code
    pub status_code: u8,
}

impl TunnellingAck {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        let header = ConnectionHeader::parse(body)?;
        Ok(Self {
            communication_channel_id: header.channel,
            sequence_counter: header.sequence,
            status_code: header.status,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        ConnectionHeader {
            channel: self.communication_channel_id,
            sequence: self.sequence_counter,
            status: self.status_code,
        }
        .encode(out);
    }
}

/// `TUNNELLING_FEATURE_GET`, `_RESPONSE`, `_SET` and `_INFO`
///
/// `GET` carries no value. The return code follows the feature identifier
/// and is zero except in `_RESPONSE`. Values are padded to an even length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnellingFeature {
    /// Channel of the connection
    pub communication_channel_id: u8,
    /// Sequence counter of the sender
    pub sequence_counter: u8,
    /// Return code (`_RESPONSE` only)
    pub status_code: u8,
    /// Feature being read or written
    pub feature_type: TunnellingFeatureType,
    /// Feature value
    pub data: Vec<u8>,
}

impl TunnellingFeature {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        let header = ConnectionHeader::parse(body)?;
        let [feature, return_code, data @ ..] = &body[ConnectionHeader::SIZE..] else {
            return Err(KnxError::invalid_frame());
        };
        Ok(Self {
            communication_channel_id: header.channel,
            sequence_counter: header.sequence,
            status_code: *return_code,
            feature_type: TunnellingFeatureType::from_u8(*feature)
                .ok_or_else(KnxError::invalid_frame)?,
            data: data.to_vec(),
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        ConnectionHeader {
            channel: self.communication_channel_id,
            sequence: self.sequence_counter,
            status: 0,
        }
        .encode(out);
        out.extend_from_slice(&[self.feature_type as u8, self.status_code]);
        out.extend_from_slice(&self.data);
        if self.data.len() % 2 != 0 {
            out.push(0);
        }
    }
}

// =============================================================================
// Routing
// =============================================================================

/// `ROUTING_INDICATION` and `ROUTING_SYSTEM_BROADCAST`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingIndication {
    /// Undecoded cEMI frame
    pub raw_cemi: Vec<u8>,
}

impl RoutingIndication {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        Ok(Self {
            raw_cemi: body.to_vec(),
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.raw_cemi);
    }
}

/// `ROUTING_BUSY`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingBusy {
    /// Device state bits
    pub device_state: u8,
    /// Requested pause in milliseconds
    pub wait_time_ms: u16,
    /// Control field; non-zero values are reserved and ignored by receivers
    pub control_field: u16,
}

impl RoutingBusy {
    /// Requested pause.
    pub const fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms as u64)
    }

    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        match body {
            [6, state, w0, w1, c0, c1, ..] => Ok(Self {
                device_state: *state,
                wait_time_ms: u16::from_be_bytes([*w0, *w1]),
                control_field: u16::from_be_bytes([*c0, *c1]),
            }),
            _ => Err(KnxError::invalid_frame()),
        }
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[6, self.device_state]);
        out.extend_from_slice(&self.wait_time_ms.to_be_bytes());
        out.extend_from_slice(&self.control_field.to_be_bytes());
    }
}

/// `ROUTING_LOST_MESSAGE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingLostMessage {
    /// Device state bits
    pub device_state: u8,
    /// Number of frames the sender dropped
    pub lost_messages: u16,
}

impl RoutingLostMessage {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        match body {
            [4, state, l0, l1, ..] => Ok(Self {
                device_state: *state,
                lost_messages: u16::from_be_bytes([*l0, *l1]),
            }),
            _ => Err(KnxError::invalid_frame()),
        }
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[4, self.device_state]);
        out.extend_from_slice(&self.lost_messages.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{E_NO_MORE_CONNECTIONS, E_NO_ERROR};
    use crate::protocol::frame::KnxIpFrame;

    #[test]
    fn test_routing_indication_vector() {
        let raw = [
            0x06, 0x10, 0x05, 0x30, 0x00, 0x12, 0x29, 0x00, 0xBC, 0xD0, 0x12, 0x02, 0x01, 0x51,
            0x02, 0x00, 0x40, 0xF0,
        ];
        let (frame, used) = KnxIpFrame::from_bytes(&raw).unwrap();
        assert_eq!(used, raw.len());
        let KnxIpFrame::RoutingIndication(indication) = &frame else {
            panic!("expected routing indication");
        };
        assert_eq!(indication.raw_cemi, &raw[6..]);
        assert_eq!(frame.to_bytes(), raw);
    }

    #[test]
    fn test_connect_response_with_tcp_crd() {
        let raw = [
            0x06, 0x10, 0x02, 0x06, 0x00, 0x14, 0x15, 0x00, 0x08, 0x01, 0xC0, 0xA8, 0x2A, 0x0A,
            0x0E, 0x57, 0x04, 0x04, 0x11, 0xFF,
        ];
        let (frame, _) = KnxIpFrame::from_bytes(&raw).unwrap();
        let KnxIpFrame::ConnectResponse(response) = frame else {
            panic!("expected connect response");
        };
        assert_eq!(response.communication_channel_id, 0x15);
        assert_eq!(response.status_code, E_NO_ERROR);
        assert_eq!(
            response.crd.individual_address,
            Some(IndividualAddress::new(1, 1, 255).unwrap())
        );
    }

    #[test]
    fn test_connect_response_error_without_endpoint() {
        let raw = [0x06, 0x10, 0x02, 0x06, 0x00, 0x08, 0x00, 0x24];
        let (frame, _) = KnxIpFrame::from_bytes(&raw).unwrap();
        let KnxIpFrame::ConnectResponse(response) = &frame else {
            panic!("expected connect response");
        };
        assert_eq!(response.status_code, E_NO_MORE_CONNECTIONS);
        assert!(response.data_endpoint.is_route_back());
        assert_eq!(frame.to_bytes(), raw);
    }

    #[test]
    fn test_extended_cri_carries_address() {
        let request = ConnectRequest {
            control_endpoint: Hpai::tcp(),
            data_endpoint: Hpai::tcp(),
            cri: ConnectRequestInfo::tunnel(Some(IndividualAddress::new(1, 1, 20).unwrap())),
        };
        let mut out = Vec::new();
        request.encode(&mut out);
        assert_eq!(&out[16..], &[0x06, 0x04, 0x02, 0x00, 0x11, 0x14]);
        assert_eq!(ConnectRequest::parse(&out).unwrap(), request);
    }

    #[test]
    fn test_tunnelling_ack_header() {
        let ack = TunnellingAck {
            communication_channel_id: 0x2A,
            sequence_counter: 0x17,
            status_code: 0,
        };
        let frame = KnxIpFrame::TunnellingAck(ack);
        assert_eq!(
            frame.to_bytes(),
            [0x06, 0x10, 0x04, 0x21, 0x00, 0x0A, 0x04, 0x2A, 0x17, 0x00]
        );
    }

    #[test]
    fn test_bad_connection_header_length() {
        assert!(TunnellingAck::parse(&[0x05, 0x01, 0x02, 0x00]).is_err());
        assert!(TunnellingRequest::parse(&[0x04, 0x01]).is_err());
    }

    #[test]
    fn test_feature_get_and_padded_set() {
        let get = TunnellingFeature {
            communication_channel_id: 1,
            sequence_counter: 0,
            status_code: 0,
            feature_type: TunnellingFeatureType::IndividualAddress,
            data: Vec::new(),
        };
        let mut out = Vec::new();
        get.encode(&mut out);
        assert_eq!(out, [0x04, 0x01, 0x00, 0x00, 0x06, 0x00]);

        let set = TunnellingFeature {
            feature_type: TunnellingFeatureType::InterfaceFeatureInfoServiceEnable,
            data: vec![0x01],
            ..get
        };
        let mut out = Vec::new();
        set.encode(&mut out);
        assert_eq!(&out[4..], &[0x08, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_routing_busy_and_lost() {
        let busy = RoutingBusy::parse(&[0x06, 0x00, 0x00, 0x64, 0x00, 0x00]).unwrap();
        assert_eq!(busy.wait_time(), Duration::from_millis(100));
        assert_eq!(busy.control_field, 0);

        let lost = RoutingLostMessage::parse(&[0x04, 0x00, 0x00, 0x05]).unwrap();
        assert_eq!(lost.lost_messages, 5);
        assert!(RoutingBusy::parse(&[0x04, 0x00, 0x00, 0x64]).is_err());
    }
}
