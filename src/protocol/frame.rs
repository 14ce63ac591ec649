//! KNXnet/IP frame parsing and encoding.
//!
//! Every KNXnet/IP service is one variant of [`KnxIpFrame`]; decoding reads
//! the generic header, validates it, then dispatches on the service type to
//! the body codec in [`services`](super::services) or
//! [`secure_services`](super::secure_services).
//!
//! ## Frame Structure
//!
//! ```text
//! ┌─────────────────────────────┐
//! │  Header (6 bytes)           │
//! │  - Header Length: 0x06      │
//! │  - Protocol Version: 0x10   │
//! │  - Service Type: 2 bytes    │
//! │  - Total Length: 2 bytes    │
//! ├─────────────────────────────┤
//! │  Body (variable)            │
//! │  - Service-specific data    │
//! └─────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use knx_engine::protocol::frame::KnxIpFrame;
//! use knx_engine::protocol::services::ConnectionStateResponse;
//!
//! let frame = KnxIpFrame::ConnectionStateResponse(ConnectionStateResponse {
//!     communication_channel_id: 7,
//!     status_code: 0,
//! });
//! let bytes = frame.to_bytes();
//! assert_eq!(bytes, [0x06, 0x10, 0x02, 0x08, 0x00, 0x08, 0x07, 0x00]);
//!
//! let (decoded, used) = KnxIpFrame::from_bytes(&bytes).unwrap();
//! assert_eq!(decoded, frame);
//! assert_eq!(used, bytes.len());
//! ```

use crate::error::{KnxError, Result};
use crate::protocol::constants::{
    ServiceType, HEADER_SIZE_10, IPV4_TCP, IPV4_UDP, KNXNETIP_VERSION_10,
};
use crate::protocol::secure_services::{
    SecureWrapper, SessionAuthenticate, SessionRequest, SessionResponse, SessionStatus,
    TimerNotify,
};
use crate::protocol::services::{
    ConnectRequest, ConnectResponse, ConnectionStateRequest, ConnectionStateResponse,
    DescriptionRequest, DescriptionResponse, DisconnectRequest, DisconnectResponse,
    RoutingBusy, RoutingIndication, RoutingLostMessage, SearchRequest, SearchRequestExtended,
    SearchResponse, TunnellingAck, TunnellingFeature, TunnellingRequest,
};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// KNXnet/IP frame header (6 bytes)
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Header Len   │ Protocol Ver │  Service Type ID    │
/// │   (1 byte)   │   (1 byte)   │     (2 bytes)       │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │           Total Length (2 bytes)                   │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KnxnetIpHeader {
    /// Raw service type identifier (may be unknown to this crate)
    pub service_type: u16,
    /// Total length of frame (header + body)
    pub total_length: u16,
}

impl KnxnetIpHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 6;

    /// Create a new header for a body of `body_length` bytes
    pub const fn new(service_type: ServiceType, body_length: u16) -> Self {
        Self {
            service_type: service_type.to_u16(),
            total_length: Self::SIZE as u16 + body_length,
        }
    }

    /// Parse and validate a header.
    ///
    /// # Errors
    ///
    /// - `IncompleteFrame` if fewer than 6 bytes are available
    /// - `MalformedHeader` if the header length field is not 6, or the total
    ///   length is smaller than the header
    /// - `UnsupportedProtocolVersion` if the version is not 1.0
    pub fn parse(data: &[u8]) -> Result<Self> {
        let Some(raw) = data.get(..Self::SIZE) else {
            return Err(KnxError::incomplete_frame());
        };
        if raw[0] != HEADER_SIZE_10 {
            return Err(KnxError::malformed_header());
        }
        if raw[1] != KNXNETIP_VERSION_10 {
            return Err(KnxError::unsupported_protocol_version(raw[1]));
        }
        let header = Self {
            service_type: u16::from_be_bytes([raw[2], raw[3]]),
            total_length: u16::from_be_bytes([raw[4], raw[5]]),
        };
        if usize::from(header.total_length) < Self::SIZE {
            return Err(KnxError::malformed_header());
        }
        Ok(header)
    }

    /// Encode the header into the first 6 bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(KnxError::buffer_too_small());
        }
        buf[0] = HEADER_SIZE_10;
        buf[1] = KNXNETIP_VERSION_10;
        buf[2..4].copy_from_slice(&self.service_type.to_be_bytes());
        buf[4..6].copy_from_slice(&self.total_length.to_be_bytes());
        Ok(Self::SIZE)
    }

    /// Get the expected body length from the header
    pub const fn body_length(&self) -> u16 {
        self.total_length.saturating_sub(Self::SIZE as u16)
    }
}

/// Host Protocol Address Information (HPAI)
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Structure Len│ Host Protocol│   IP Address        │
/// │   (1 byte)   │   (1 byte)   │   (4 bytes IPv4)    │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │                Port (2 bytes)                      │
/// └────────────────────────────────────────────────────┘
/// ```
///
/// `0.0.0.0:0` asks the server to reply to the address the request came from
/// (route back / NAT mode, and always for TCP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Hpai {
    /// Host protocol code (UDP or TCP)
    pub host_protocol: u8,
    /// IPv4 address
    pub ip_address: Ipv4Addr,
    /// Port
    pub port: u16,
}

impl Default for Hpai {
    fn default() -> Self {
        Self::route_back()
    }
}

impl Hpai {
    /// Size of HPAI structure for IPv4
    pub const SIZE: usize = 8;

    /// UDP endpoint.
    pub const fn udp(addr: SocketAddrV4) -> Self {
        Self {
            host_protocol: IPV4_UDP,
            ip_address: *addr.ip(),
            port: addr.port(),
        }
    }

    /// UDP route-back endpoint `0.0.0.0:0`.
    pub const fn route_back() -> Self {
        Self {
            host_protocol: IPV4_UDP,
            ip_address: Ipv4Addr::UNSPECIFIED,
            port: 0,
        }
    }

    /// TCP endpoint; always `0.0.0.0:0` since the stream identifies the peer.
    pub const fn tcp() -> Self {
        Self {
            host_protocol: IPV4_TCP,
            ip_address: Ipv4Addr::UNSPECIFIED,
            port: 0,
        }
    }

    /// `true` for `0.0.0.0:0`.
    pub fn is_route_back(&self) -> bool {
        self.ip_address.is_unspecified() && self.port == 0
    }

    /// `true` for the TCP host protocol code.
    pub const fn is_tcp(&self) -> bool {
        self.host_protocol == IPV4_TCP
    }

    /// Endpoint as a socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip_address, self.port))
    }

    /// Parse an HPAI from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || usize::from(data[0]) != Self::SIZE {
            return Err(KnxError::invalid_frame());
        }
        Ok(Self {
            host_protocol: data[1],
            ip_address: Ipv4Addr::new(data[2], data[3], data[4], data[5]),
            port: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    /// Append the 8-byte encoding.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(Self::SIZE as u8);
        out.push(self.host_protocol);
        out.extend_from_slice(&self.ip_address.octets());
        out.extend_from_slice(&self.port.to_be_bytes());
    }
}

macro_rules! knx_ip_frames {
    ($($service:ident($body:ty)),+ $(,)?) => {
        /// A decoded KNXnet/IP frame: one variant per service type.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum KnxIpFrame {
            $(
                #[doc = concat!("`", stringify!($service), "` service")]
                $service($body),
            )+
        }

        impl KnxIpFrame {
            /// Service type identifier of this frame.
            pub const fn service_type(&self) -> ServiceType {
                match self {
                    $( Self::$service(_) => ServiceType::$service, )+
                }
            }

            fn encode_body(&self, out: &mut Vec<u8>) {
                match self {
                    $( Self::$service(body) => body.encode(out), )+
                }
            }

            fn parse_body(service: ServiceType, body: &[u8]) -> Result<Self> {
                match service {
                    $( ServiceType::$service => <$body>::parse(body).map(Self::$service), )+
                }
            }
        }
    };
}

knx_ip_frames! {
    SearchRequest(SearchRequest),
    SearchResponse(SearchResponse),
    DescriptionRequest(DescriptionRequest),
    DescriptionResponse(DescriptionResponse),
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    ConnectionStateRequest(ConnectionStateRequest),
    ConnectionStateResponse(ConnectionStateResponse),
    DisconnectRequest(DisconnectRequest),
    DisconnectResponse(DisconnectResponse),
    SearchRequestExtended(SearchRequestExtended),
    SearchResponseExtended(SearchResponse),
    DeviceConfigurationRequest(TunnellingRequest),
    DeviceConfigurationAck(TunnellingAck),
    TunnellingRequest(TunnellingRequest),
    TunnellingAck(TunnellingAck),
    TunnellingFeatureGet(TunnellingFeature),
    TunnellingFeatureResponse(TunnellingFeature),
    TunnellingFeatureSet(TunnellingFeature),
    TunnellingFeatureInfo(TunnellingFeature),
    RoutingIndication(RoutingIndication),
    RoutingLostMessage(RoutingLostMessage),
    RoutingBusy(RoutingBusy),
    RoutingSystemBroadcast(RoutingIndication),
    SecureWrapper(SecureWrapper),
    SessionRequest(SessionRequest),
    SessionResponse(SessionResponse),
    SessionAuthenticate(SessionAuthenticate),
    SessionStatus(SessionStatus),
    TimerNotify(TimerNotify),
}

impl KnxIpFrame {
    /// Decode one frame from the start of `data`.
    ///
    /// Returns the frame and the number of bytes it occupied, so stream
    /// callers can advance past it.
    ///
    /// # Errors
    ///
    /// Header errors as in [`KnxnetIpHeader::parse`]; `IncompleteFrame` if
    /// the body is cut short; `UnsupportedServiceType` for unknown services
    /// (the frame length is still valid, callers may skip it);
    /// `InvalidFrame` when the body does not match the service schema.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        let header = KnxnetIpHeader::parse(data)?;
        let total = usize::from(header.total_length);
        let Some(body) = data.get(KnxnetIpHeader::SIZE..total) else {
            return Err(KnxError::incomplete_frame());
        };
        let service = ServiceType::from_u16(header.service_type)
            .ok_or_else(|| KnxError::unsupported_service_type(header.service_type))?;
        let frame = Self::parse_body(service, body)?;
        Ok((frame, total))
    }

    /// Encode header and body. Length fields are computed from the body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; KnxnetIpHeader::SIZE];
        self.encode_body(&mut out);
        let body_length = (out.len() - KnxnetIpHeader::SIZE) as u16;
        let header = KnxnetIpHeader::new(self.service_type(), body_length);
        // The buffer was sized for the header above.
        let _ = header.encode(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::services::ConnectRequestInfo;

    #[test]
    fn test_header_parse() {
        let data = [0x06, 0x10, 0x02, 0x06, 0x00, 0x14];
        let header = KnxnetIpHeader::parse(&data).unwrap();
        assert_eq!(header.service_type, 0x0206);
        assert_eq!(header.total_length, 20);
        assert_eq!(header.body_length(), 14);
    }

    #[test]
    fn test_header_validation() {
        let err = KnxnetIpHeader::parse(&[0x06, 0x20, 0x02, 0x06, 0x00, 0x14]).unwrap_err();
        assert!(matches!(err, KnxError::Protocol(ref e) if e.is_unsupported_version()));

        let err = KnxnetIpHeader::parse(&[0x08, 0x10, 0x02, 0x06, 0x00, 0x14]).unwrap_err();
        assert!(matches!(err, KnxError::Protocol(ref e) if e.is_malformed_header()));

        let err = KnxnetIpHeader::parse(&[0x06, 0x10, 0x02]).unwrap_err();
        assert!(err.is_incomplete_frame());
    }

    #[test]
    fn test_incomplete_body() {
        let frame = KnxIpFrame::ConnectionStateResponse(ConnectionStateResponse {
            communication_channel_id: 1,
            status_code: 0,
        });
        let bytes = frame.to_bytes();
        let err = KnxIpFrame::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(err.is_incomplete_frame());
    }

    #[test]
    fn test_unknown_service_is_reported() {
        let data = [0x06, 0x10, 0x07, 0x40, 0x00, 0x08, 0x01, 0x02];
        let err = KnxIpFrame::from_bytes(&data).unwrap_err();
        assert_eq!(err.unsupported_service(), Some(0x0740));
    }

    #[test]
    fn test_length_recomputed_on_encode() {
        let frame = KnxIpFrame::ConnectRequest(ConnectRequest {
            control_endpoint: Hpai::udp("192.168.42.1:33941".parse().unwrap()),
            data_endpoint: Hpai::udp("192.168.42.1:33941".parse().unwrap()),
            cri: ConnectRequestInfo::tunnel(None),
        });
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), 26);
        assert_eq!(&bytes[..6], &[0x06, 0x10, 0x02, 0x05, 0x00, 0x1A]);
        assert_eq!(KnxIpFrame::from_bytes(&bytes).unwrap().0, frame);
    }

    #[test]
    fn test_trailing_bytes_not_consumed() {
        let frame = KnxIpFrame::DisconnectResponse(DisconnectResponse {
            communication_channel_id: 3,
            status_code: 0,
        });
        let mut bytes = frame.to_bytes();
        let len = bytes.len();
        bytes.extend_from_slice(&[0x06, 0x10]);
        let (decoded, used) = KnxIpFrame::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(used, len);
    }

    #[test]
    fn test_hpai() {
        let hpai = Hpai::udp("192.168.200.12:3671".parse().unwrap());
        let mut out = Vec::new();
        hpai.encode(&mut out);
        assert_eq!(out, [0x08, 0x01, 0xC0, 0xA8, 0xC8, 0x0C, 0x0E, 0x57]);
        assert_eq!(Hpai::parse(&out).unwrap(), hpai);
        assert!(Hpai::route_back().is_route_back());
        assert!(Hpai::tcp().is_tcp());
    }
}
