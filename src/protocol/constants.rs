//! KNXnet/IP protocol constants and service type identifiers.

use std::net::Ipv4Addr;
use std::time::Duration;

/// KNXnet/IP protocol version 1.0
pub const KNXNETIP_VERSION_10: u8 = 0x10;

/// Standard KNXnet/IP header length (6 bytes)
pub const HEADER_SIZE_10: u8 = 0x06;

/// Standard UDP port for KNXnet/IP communication
pub const KNXNETIP_DEFAULT_PORT: u16 = 3671;

/// KNXnet/IP multicast address for routing and discovery
pub const KNXNETIP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 23, 12);

/// Largest frame accepted from a stream before the connection is considered corrupt
pub const MAX_FRAME_SIZE: usize = 1024;

// =============================================================================
// Timing
// =============================================================================

/// Interval between ConnectionState requests on an idle tunnel
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// Time to wait for a ConnectionState response
pub const CONNECTIONSTATE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Additional heartbeat attempts before a tunnel is considered lost
pub const HEARTBEAT_RETRIES: u8 = 3;
/// Time to wait for a TunnellingAck
pub const TUNNELLING_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
/// Time to wait for the L_Data.con of an acknowledged request
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(1);
/// Time to wait for a ConnectResponse / DisconnectResponse
pub const CONNECT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause after each RoutingIndication
pub const ROUTING_INDICATION_PAUSE: Duration = Duration::from_millis(20);

// =============================================================================
// Service Type Identifiers
// =============================================================================

/// KNXnet/IP Service Type Identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum ServiceType {
    // Core services (0x02xx)
    /// `SEARCH_REQUEST` - Device discovery request
    SearchRequest = 0x0201,
    /// `SEARCH_RESPONSE` - Device discovery response
    SearchResponse = 0x0202,
    /// `DESCRIPTION_REQUEST` - Device description request
    DescriptionRequest = 0x0203,
    /// `DESCRIPTION_RESPONSE` - Device description response
    DescriptionResponse = 0x0204,
    /// `CONNECT_REQUEST` - Connection request
    ConnectRequest = 0x0205,
    /// `CONNECT_RESPONSE` - Connection response
    ConnectResponse = 0x0206,
    /// `CONNECTIONSTATE_REQUEST` - Heartbeat request
    ConnectionStateRequest = 0x0207,
    /// `CONNECTIONSTATE_RESPONSE` - Heartbeat response
    ConnectionStateResponse = 0x0208,
    /// `DISCONNECT_REQUEST`
    DisconnectRequest = 0x0209,
    /// `DISCONNECT_RESPONSE`
    DisconnectResponse = 0x020A,
    /// `SEARCH_REQUEST_EXTENDED` - Discovery with search parameters
    SearchRequestExtended = 0x020B,
    /// `SEARCH_RESPONSE_EXTENDED`
    SearchResponseExtended = 0x020C,

    // Device management (0x03xx)
    /// `DEVICE_CONFIGURATION_REQUEST`
    DeviceConfigurationRequest = 0x0310,
    /// `DEVICE_CONFIGURATION_ACK`
    DeviceConfigurationAck = 0x0311,

    // Tunnelling (0x04xx)
    /// `TUNNELLING_REQUEST`
    TunnellingRequest = 0x0420,
    /// `TUNNELLING_ACK`
    TunnellingAck = 0x0421,
    /// `TUNNELLING_FEATURE_GET`
    TunnellingFeatureGet = 0x0422,
    /// `TUNNELLING_FEATURE_RESPONSE`
    TunnellingFeatureResponse = 0x0423,
    /// `TUNNELLING_FEATURE_SET`
    TunnellingFeatureSet = 0x0424,
    /// `TUNNELLING_FEATURE_INFO`
    TunnellingFeatureInfo = 0x0425,

    // Routing (0x05xx)
    /// `ROUTING_INDICATION`
    RoutingIndication = 0x0530,
    /// `ROUTING_LOST_MESSAGE`
    RoutingLostMessage = 0x0531,
    /// `ROUTING_BUSY`
    RoutingBusy = 0x0532,
    /// `ROUTING_SYSTEM_BROADCAST`
    RoutingSystemBroadcast = 0x0533,

    // Security (0x09xx)
    /// `SECURE_WRAPPER`
    SecureWrapper = 0x0950,
    /// `SECURE_SESSION_REQUEST`
    SessionRequest = 0x0951,
    /// `SECURE_SESSION_RESPONSE`
    SessionResponse = 0x0952,
    /// `SECURE_SESSION_AUTHENTICATE`
    SessionAuthenticate = 0x0953,
    /// `SECURE_SESSION_STATUS`
    SessionStatus = 0x0954,
    /// `SECURE_TIMER_NOTIFY`
    TimerNotify = 0x0955,
}

impl ServiceType {
    /// Convert from u16 value; `None` for services this crate does not handle.
    pub const fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x0201 => Self::SearchRequest,
            0x0202 => Self::SearchResponse,
            0x0203 => Self::DescriptionRequest,
            0x0204 => Self::DescriptionResponse,
            0x0205 => Self::ConnectRequest,
            0x0206 => Self::ConnectResponse,
            0x0207 => Self::ConnectionStateRequest,
            0x0208 => Self::ConnectionStateResponse,
            0x0209 => Self::DisconnectRequest,
            0x020A => Self::DisconnectResponse,
            0x020B => Self::SearchRequestExtended,
            0x020C => Self::SearchResponseExtended,
            0x0310 => Self::DeviceConfigurationRequest,
            0x0311 => Self::DeviceConfigurationAck,
            0x0420 => Self::TunnellingRequest,
            0x0421 => Self::TunnellingAck,
            0x0422 => Self::TunnellingFeatureGet,
            0x0423 => Self::TunnellingFeatureResponse,
            0x0424 => Self::TunnellingFeatureSet,
            0x0425 => Self::TunnellingFeatureInfo,
            0x0530 => Self::RoutingIndication,
            0x0531 => Self::RoutingLostMessage,
            0x0532 => Self::RoutingBusy,
            0x0533 => Self::RoutingSystemBroadcast,
            0x0950 => Self::SecureWrapper,
            0x0951 => Self::SessionRequest,
            0x0952 => Self::SessionResponse,
            0x0953 => Self::SessionAuthenticate,
            0x0954 => Self::SessionStatus,
            0x0955 => Self::TimerNotify,
            _ => return None,
        })
    }

    /// Convert to u16 value
    pub const fn to_u16(self) -> u16 {
        self as u16
    }
}

// =============================================================================
// Connection Types
// =============================================================================

/// Device management connection
pub const DEVICE_MGMT_CONNECTION: u8 = 0x03;

/// Tunnel connection (most common)
pub const TUNNEL_CONNECTION: u8 = 0x04;

/// Tunnelling on the data link layer
pub const TUNNEL_LINKLAYER: u8 = 0x02;

/// Host protocol code: IPv4 over UDP
pub const IPV4_UDP: u8 = 0x01;

/// Host protocol code: IPv4 over TCP
pub const IPV4_TCP: u8 = 0x02;

// =============================================================================
// Error Codes
// =============================================================================

/// Operation successful
pub const E_NO_ERROR: u8 = 0x00;
/// Requested host protocol not supported
pub const E_HOST_PROTOCOL_TYPE: u8 = 0x01;
/// Requested protocol version not supported
pub const E_VERSION_NOT_SUPPORTED: u8 = 0x02;
/// Received sequence number out of order
pub const E_SEQUENCE_NUMBER: u8 = 0x04;
/// Generic error
pub const E_ERROR: u8 = 0x0F;
/// Communication channel ID unknown to the server
pub const E_CONNECTION_ID: u8 = 0x21;
/// Requested connection type not supported
pub const E_CONNECTION_TYPE: u8 = 0x22;
/// Requested connection option not supported
pub const E_CONNECTION_OPTION: u8 = 0x23;
/// Server cannot accept another connection
pub const E_NO_MORE_CONNECTIONS: u8 = 0x24;
/// No more unique connections (TCP individual address already in use)
pub const E_NO_MORE_UNIQUE_CONNECTIONS: u8 = 0x25;
/// Error in the data connection
pub const E_DATA_CONNECTION: u8 = 0x26;
/// Error in the KNX subnetwork connection
pub const E_KNX_CONNECTION: u8 = 0x27;
/// Requested credentials not authorised
pub const E_AUTHORISATION_ERROR: u8 = 0x28;
/// Requested tunnelling layer not supported
pub const E_TUNNELLING_LAYER: u8 = 0x29;
/// Requested individual address not available
pub const E_NO_TUNNELLING_ADDRESS: u8 = 0x2D;
/// Requested individual address in use
pub const E_CONNECTION_IN_USE: u8 = 0x2E;

// =============================================================================
// Description Information Blocks
// =============================================================================

/// DIB: device information
pub const DIB_DEVICE_INFO: u8 = 0x01;
/// DIB: supported service families
pub const DIB_SUPP_SVC_FAMILIES: u8 = 0x02;
/// DIB: IP configuration
pub const DIB_IP_CONFIG: u8 = 0x03;
/// DIB: current IP configuration
pub const DIB_IP_CUR_CONFIG: u8 = 0x04;
/// DIB: KNX addresses
pub const DIB_KNX_ADDRESSES: u8 = 0x05;
/// DIB: secured service families
pub const DIB_SECURED_SERVICE_FAMILIES: u8 = 0x06;
/// DIB: tunnelling slot information
pub const DIB_TUNNELING_INFO: u8 = 0x07;
/// DIB: extended device information
pub const DIB_EXTENDED_DEVICE_INFO: u8 = 0x08;
/// DIB: manufacturer data
pub const DIB_MFR_DATA: u8 = 0xFE;

/// KNXnet/IP service families advertised in DIBs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ServiceFamily {
    /// Core services
    Core = 0x02,
    /// Device management
    DeviceManagement = 0x03,
    /// Tunnelling
    Tunnelling = 0x04,
    /// Routing
    Routing = 0x05,
    /// Remote logging
    RemoteLogging = 0x06,
    /// Remote configuration and diagnosis
    RemoteConfigurationDiagnosis = 0x07,
    /// Object server
    ObjectServer = 0x08,
    /// KNX IP Secure
    Security = 0x09,
}

impl ServiceFamily {
    /// Convert from u8 value
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x02 => Self::Core,
            0x03 => Self::DeviceManagement,
            0x04 => Self::Tunnelling,
            0x05 => Self::Routing,
            0x06 => Self::RemoteLogging,
            0x07 => Self::RemoteConfigurationDiagnosis,
            0x08 => Self::ObjectServer,
            0x09 => Self::Security,
            _ => return None,
        })
    }
}

/// KNX medium codes
pub const KNX_MEDIUM_TP1: u8 = 0x02;
/// Powerline 110
pub const KNX_MEDIUM_PL110: u8 = 0x04;
/// Radio frequency
pub const KNX_MEDIUM_RF: u8 = 0x10;
/// KNX IP
pub const KNX_MEDIUM_IP: u8 = 0x20;

// =============================================================================
// Search Request Parameters
// =============================================================================

/// SRP: select by programming mode
pub const SRP_SELECT_BY_PROGRAMMING_MODE: u8 = 0x01;
/// SRP: select by MAC address
pub const SRP_SELECT_BY_MAC_ADDRESS: u8 = 0x02;
/// SRP: select by service family
pub const SRP_SELECT_BY_SERVICE: u8 = 0x03;
/// SRP: request additional DIBs
pub const SRP_REQUEST_DIBS: u8 = 0x04;

// =============================================================================
// Tunnelling Features
// =============================================================================

/// Interface feature identifiers for TunnellingFeature services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TunnellingFeatureType {
    /// Supported EMI types
    SupportedEmiType = 0x01,
    /// Host device descriptor type 0 (mask version)
    HostDeviceDescriptorType0 = 0x02,
    /// Bus connection status
    BusConnectionStatus = 0x03,
    /// KNX manufacturer code
    KnxManufacturerCode = 0x04,
    /// Active EMI type
    ActiveEmiType = 0x05,
    /// Individual address used by the interface
    IndividualAddress = 0x06,
    /// Maximum APDU length
    MaxApduLength = 0x07,
    /// Enable TunnellingFeatureInfo
    InterfaceFeatureInfoServiceEnable = 0x08,
}

impl TunnellingFeatureType {
    /// Convert from u8 value
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::SupportedEmiType,
            0x02 => Self::HostDeviceDescriptorType0,
            0x03 => Self::BusConnectionStatus,
            0x04 => Self::KnxManufacturerCode,
            0x05 => Self::ActiveEmiType,
            0x06 => Self::IndividualAddress,
            0x07 => Self::MaxApduLength,
            0x08 => Self::InterfaceFeatureInfoServiceEnable,
            _ => return None,
        })
    }
}

// =============================================================================
// Secure Session Status
// =============================================================================

/// Status codes carried by `SESSION_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SecureSessionStatus {
    /// Authentication succeeded
    AuthenticationSuccess = 0x00,
    /// Authentication failed
    AuthenticationFailed = 0x01,
    /// Session not authenticated
    Unauthenticated = 0x02,
    /// Session timed out
    Timeout = 0x03,
    /// Keep the session alive
    KeepAlive = 0x04,
    /// Close the session
    Close = 0x05,
}

impl SecureSessionStatus {
    /// Convert from u8 value
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::AuthenticationSuccess,
            0x01 => Self::AuthenticationFailed,
            0x02 => Self::Unauthenticated,
            0x03 => Self::Timeout,
            0x04 => Self::KeepAlive,
            0x05 => Self::Close,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_roundtrip() {
        for raw in (0x0201..=0x020C).chain([0x0420, 0x0425, 0x0530, 0x0533, 0x0950, 0x0955]) {
            let service = ServiceType::from_u16(raw).unwrap();
            assert_eq!(service.to_u16(), raw);
        }
        assert_eq!(ServiceType::from_u16(0x0740), None);
    }
}
