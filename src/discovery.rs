//! KNXnet/IP gateway discovery.
//!
//! A scan multicasts `SEARCH_REQUEST` (and optionally
//! `SEARCH_REQUEST_EXTENDED`) on every usable interface and collects the
//! unicast responses until the timeout expires or enough gateways matched.
//!
//! ```text
//! Client                          Gateway
//!   |                                |
//!   |------- SEARCH_REQUEST -------->| (multicast, per interface)
//!   |<------ SEARCH_RESPONSE --------| (unicast)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use knx_engine::discovery::{GatewayScanFilter, GatewayScanner};
//!
//! # async fn run() -> knx_engine::Result<()> {
//! let filter = GatewayScanFilter {
//!     tunnelling: Some(true),
//!     ..GatewayScanFilter::default()
//! };
//! for gateway in GatewayScanner::new(filter).scan().await? {
//!     println!("{gateway}");
//! }
//! # Ok(())
//! # }
//! ```

use crate::addressing::IndividualAddress;
use crate::error::Result;
use crate::net::multicast::MulticastTransport;
use crate::net::transport::AsyncTransport;
use crate::net::udp::UdpTransport;
use crate::net::{ipv4_of, local_ipv4_for, local_ipv4_interfaces};
use crate::protocol::constants::{
    ServiceFamily, KNXNETIP_DEFAULT_PORT, KNXNETIP_MULTICAST_ADDR, MAX_FRAME_SIZE,
};
use crate::protocol::dib::Dib;
use crate::protocol::frame::{Hpai, KnxIpFrame};
use crate::protocol::services::{
    DescriptionRequest, SearchRequest, SearchRequestExtended, SearchResponse,
};
use core::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};

/// Default time a scan waits for responses
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(4);

/// Default time to wait for a `DESCRIPTION_RESPONSE`
pub const DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Capabilities a gateway must (or must not) have to be kept by a scan.
///
/// Every `None` field matches any gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GatewayScanFilter {
    /// Exact friendly name
    pub name: Option<String>,
    /// UDP tunnelling support
    pub tunnelling: Option<bool>,
    /// TCP tunnelling support
    pub tunnelling_tcp: Option<bool>,
    /// Routing support
    pub routing: Option<bool>,
    /// Tunnelling only through KNX IP Secure
    pub secure_tunnelling: Option<bool>,
    /// Routing only through KNX IP Secure
    pub secure_routing: Option<bool>,
}

impl GatewayScanFilter {
    /// `true` if `gateway` satisfies every set criterion.
    pub fn matches(&self, gateway: &GatewayDescriptor) -> bool {
        fn wanted(criterion: Option<bool>, actual: bool) -> bool {
            criterion.is_none_or(|expected| expected == actual)
        }

        self.name.as_ref().is_none_or(|name| *name == gateway.name)
            && wanted(self.tunnelling, gateway.supports_tunnelling)
            && wanted(self.tunnelling_tcp, gateway.supports_tunnelling_tcp)
            && wanted(self.routing, gateway.supports_routing)
            && wanted(self.secure_tunnelling, gateway.tunnelling_requires_secure)
            && wanted(self.secure_routing, gateway.routing_requires_secure)
    }
}

/// One gateway as described by its search or description response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayDescriptor {
    /// Control endpoint to connect to
    pub control_endpoint: SocketAddrV4,
    /// Local interface the response arrived on
    pub local_interface: Ipv4Addr,
    /// Friendly name
    pub name: String,
    /// Individual address of the gateway itself
    pub individual_address: IndividualAddress,
    /// Device is in programming mode
    pub programming_mode: bool,
    /// Tunnelling v1 or newer
    pub supports_tunnelling: bool,
    /// Tunnelling v2 (TCP)
    pub supports_tunnelling_tcp: bool,
    /// Routing
    pub supports_routing: bool,
    /// KNX IP Secure service family present
    pub supports_secure: bool,
    /// Tunnelling is listed as a secured service family
    pub tunnelling_requires_secure: bool,
    /// Routing is listed as a secured service family
    pub routing_requires_secure: bool,
    /// A usable, free tunnelling slot exists; `None` without slot information
    pub free_tunnel_slot: Option<bool>,
    /// Every DIB the gateway sent
    pub dibs: Vec<Dib>,
}

impl GatewayDescriptor {
    /// Build a descriptor from the DIBs of a search or description response.
    pub fn from_dibs(
        control_endpoint: SocketAddrV4,
        local_interface: Ipv4Addr,
        dibs: Vec<Dib>,
    ) -> Self {
        let mut descriptor = Self {
            control_endpoint,
            local_interface,
            name: String::new(),
            individual_address: IndividualAddress::from_wire([0, 0]),
            programming_mode: false,
            supports_tunnelling: false,
            supports_tunnelling_tcp: false,
            supports_routing: false,
            supports_secure: false,
            tunnelling_requires_secure: false,
            routing_requires_secure: false,
            free_tunnel_slot: None,
            dibs: Vec::new(),
        };
        for dib in &dibs {
            match dib {
                Dib::DeviceInformation(info) => {
                    descriptor.name = info.name.as_str().trim_end().into();
                    descriptor.individual_address = info.individual_address;
                    descriptor.programming_mode = info.programming_mode;
                }
                Dib::SupportedServiceFamilies(families) => {
                    descriptor.supports_tunnelling = families.supports(ServiceFamily::Tunnelling, 1);
                    descriptor.supports_tunnelling_tcp =
                        families.supports(ServiceFamily::Tunnelling, 2);
                    descriptor.supports_routing = families.supports(ServiceFamily::Routing, 1);
                    descriptor.supports_secure = families.supports(ServiceFamily::Security, 1);
                }
                Dib::SecuredServiceFamilies(families) => {
                    descriptor.tunnelling_requires_secure =
                        families.supports(ServiceFamily::Tunnelling, 1);
                    descriptor.routing_requires_secure =
                        families.supports(ServiceFamily::Routing, 1);
                }
                Dib::TunnellingInfo(info) => {
                    descriptor.free_tunnel_slot =
                        Some(info.slots.iter().any(|slot| slot.usable && slot.free));
                }
                Dib::Generic { .. } => {}
            }
        }
        descriptor.dibs = dibs;
        descriptor
    }

    /// Build a descriptor from a search response received from `source`.
    ///
    /// A route-back control endpoint is replaced by the datagram source.
    pub fn from_search_response(
        response: SearchResponse,
        source: SocketAddr,
        local_interface: Ipv4Addr,
    ) -> Result<Self> {
        let advertised = response.control_endpoint.socket_addr();
        let endpoint = if response.control_endpoint.is_route_back() || advertised.ip().is_unspecified()
        {
            source
        } else {
            advertised
        };
        let control_endpoint = SocketAddrV4::new(ipv4_of(endpoint)?, endpoint.port());
        Ok(Self::from_dibs(control_endpoint, local_interface, response.dibs))
    }

    /// Connection preference; lower is better.
    ///
    /// Tunnelling before routing, plain before secure, TCP before UDP, and
    /// gateways reporting no free slot last among tunnels.
    pub fn rank(&self) -> u8 {
        match (self.supports_tunnelling, self.supports_routing) {
            (true, _) => {
                let mut rank = 0;
                if self.tunnelling_requires_secure {
                    rank += 4;
                }
                if !self.supports_tunnelling_tcp {
                    rank += 1;
                }
                if self.free_tunnel_slot == Some(false) {
                    rank += 2;
                }
                rank
            }
            (false, true) => 8 + u8::from(self.routing_requires_secure),
            (false, false) => 10,
        }
    }
}

impl fmt::Display for GatewayDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) at {} via {}",
            self.name, self.individual_address, self.control_endpoint, self.local_interface
        )
    }
}

/// Multicast gateway search.
#[derive(Debug, Clone)]
pub struct GatewayScanner {
    filter: GatewayScanFilter,
    timeout: Duration,
    stop_on_found: Option<usize>,
    extended: bool,
    interfaces: Option<Vec<Ipv4Addr>>,
    multicast: SocketAddrV4,
}

impl GatewayScanner {
    /// Scanner stopping at the first gateway matching `filter`.
    pub fn new(filter: GatewayScanFilter) -> Self {
        Self {
            filter,
            timeout: DEFAULT_SCAN_TIMEOUT,
            stop_on_found: Some(1),
            extended: true,
            interfaces: None,
            multicast: SocketAddrV4::new(KNXNETIP_MULTICAST_ADDR, KNXNETIP_DEFAULT_PORT),
        }
    }

    /// Wait at most `timeout` for responses.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Stop after `count` matches; `None` waits for the full timeout.
    #[must_use]
    pub fn with_stop_on_found(mut self, count: Option<usize>) -> Self {
        self.stop_on_found = count.filter(|&count| count > 0);
        self
    }

    /// Also send `SEARCH_REQUEST_EXTENDED`.
    #[must_use]
    pub fn with_extended_search(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    /// Search only on these interfaces.
    #[must_use]
    pub fn with_interfaces(mut self, interfaces: Vec<Ipv4Addr>) -> Self {
        self.interfaces = Some(interfaces);
        self
    }

    /// Search on every interface and return the matching gateways, best
    /// first. Returns an empty list if nothing answered.
    pub async fn scan(&self) -> Result<Vec<GatewayDescriptor>> {
        let interfaces = match &self.interfaces {
            Some(interfaces) => interfaces.clone(),
            None => local_ipv4_interfaces()?,
        };
        let mut transports = Vec::with_capacity(interfaces.len());
        for interface in interfaces {
            match MulticastTransport::sender(self.multicast, interface) {
                Ok(transport) => transports.push((interface, transport)),
                Err(e) => knx_log!(warn, "Skipping interface {} for search: {}", interface, e),
            }
        }
        if transports.is_empty() {
            knx_log!(warn, "No interface available for gateway search");
        }
        self.scan_on(transports).await
    }

    /// Search through the given transports, one per local interface.
    pub async fn scan_on<T>(&self, transports: Vec<(Ipv4Addr, T)>) -> Result<Vec<GatewayDescriptor>>
    where
        T: AsyncTransport + 'static,
    {
        let deadline = Instant::now() + self.timeout;
        let (found_tx, mut found) = mpsc::unbounded_channel();
        let mut searches = JoinSet::new();
        for (interface, transport) in transports {
            searches.spawn(search_interface(
                transport,
                interface,
                SocketAddr::V4(self.multicast),
                self.extended,
                found_tx.clone(),
            ));
        }
        drop(found_tx);

        let mut gateways: Vec<GatewayDescriptor> = Vec::new();
        while let Ok(Some(gateway)) = timeout_at(deadline, found.recv()).await {
            if !self.filter.matches(&gateway) {
                knx_log!(debug, "Gateway {} does not match the filter", gateway);
                continue;
            }
            if gateways
                .iter()
                .any(|known| known.individual_address == gateway.individual_address)
            {
                continue;
            }
            knx_log!(info, "Found gateway {}", gateway);
            gateways.push(gateway);
            if self
                .stop_on_found
                .is_some_and(|limit| gateways.len() >= limit)
            {
                break;
            }
        }
        searches.shutdown().await;

        gateways.sort_by_key(GatewayDescriptor::rank);
        Ok(gateways)
    }

    /// Ask `gateway` for its description over unicast UDP.
    pub async fn describe(gateway: SocketAddrV4) -> Result<GatewayDescriptor> {
        let local = local_ipv4_for(*gateway.ip())?;
        let mut transport = UdpTransport::bind(SocketAddr::from((local, 0))).await?;
        let result = describe_on(&mut transport, gateway, DESCRIPTION_TIMEOUT).await;
        transport.close().await?;
        result
    }
}

/// Send a `DESCRIPTION_REQUEST` to `gateway` over `transport` and wait for
/// the response.
pub async fn describe_on<T: AsyncTransport + ?Sized>(
    transport: &mut T,
    gateway: SocketAddrV4,
    wait: Duration,
) -> Result<GatewayDescriptor> {
    let local = transport.local_addr()?;
    let local = SocketAddrV4::new(ipv4_of(local)?, local.port());
    let request = KnxIpFrame::DescriptionRequest(DescriptionRequest {
        control_endpoint: Hpai::udp(local),
    });
    transport
        .send_to(&request.to_bytes(), SocketAddr::V4(gateway))
        .await?;

    let mut buffer = vec![0u8; MAX_FRAME_SIZE];
    timeout(wait, async {
        loop {
            let (len, from) = transport.recv_from(&mut buffer).await?;
            if from != SocketAddr::V4(gateway) {
                continue;
            }
            match KnxIpFrame::from_bytes(&buffer[..len]) {
                Ok((KnxIpFrame::DescriptionResponse(response), _)) => {
                    return Ok(GatewayDescriptor::from_dibs(
                        gateway,
                        *local.ip(),
                        response.dibs,
                    ));
                }
                Ok((frame, _)) => {
                    knx_log!(debug, "Ignoring {:?} while waiting for description", frame.service_type());
                }
                Err(e) => knx_log!(debug, "Malformed frame from {}: {}", from, e),
            }
        }
    })
    .await?
}

async fn search_interface<T: AsyncTransport>(
    mut transport: T,
    interface: Ipv4Addr,
    group: SocketAddr,
    extended: bool,
    found: mpsc::UnboundedSender<GatewayDescriptor>,
) -> Result<()> {
    let local = transport.local_addr()?;
    let discovery_endpoint = Hpai::udp(SocketAddrV4::new(interface, local.port()));
    if extended {
        let request = KnxIpFrame::SearchRequestExtended(SearchRequestExtended {
            discovery_endpoint,
            srps: Vec::new(),
        });
        transport.send_to(&request.to_bytes(), group).await?;
    }
    let request = KnxIpFrame::SearchRequest(SearchRequest { discovery_endpoint });
    transport.send_to(&request.to_bytes(), group).await?;
    knx_log!(debug, "Search request sent on {}", interface);

    let mut buffer = vec![0u8; MAX_FRAME_SIZE];
    loop {
        let (len, from) = transport.recv_from(&mut buffer).await?;
        let response = match KnxIpFrame::from_bytes(&buffer[..len]) {
            Ok((
                KnxIpFrame::SearchResponse(response) | KnxIpFrame::SearchResponseExtended(response),
                _,
            )) => response,
            Ok(_) => continue,
            Err(e) => {
                knx_log!(debug, "Malformed search response from {}: {}", from, e);
                continue;
            }
        };
        let gateway = match GatewayDescriptor::from_search_response(response, from, interface) {
            Ok(gateway) => gateway,
            Err(e) => {
                knx_log!(debug, "Unusable search response from {}: {}", from, e);
                continue;
            }
        };
        if found.send(gateway).is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KnxError;
    use crate::net::mock_transport::MockTransport;
    use crate::protocol::dib::{
        DeviceInformation, FamilyVersion, ServiceFamilies, TunnellingInfo, TunnellingSlot,
    };

    const GATEWAY: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 3671));
    const INTERFACE: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

    fn families(entries: &[(ServiceFamily, u8)]) -> ServiceFamilies {
        let mut families = heapless::Vec::new();
        for &(family, version) in entries {
            families
                .push(FamilyVersion {
                    family: family as u8,
                    version,
                })
                .unwrap();
        }
        ServiceFamilies { families }
    }

    fn device(name: &str, address: [u8; 2]) -> Dib {
        let mut text = heapless::String::new();
        text.push_str(name).unwrap();
        Dib::DeviceInformation(DeviceInformation {
            knx_medium: crate::protocol::constants::KNX_MEDIUM_TP1,
            programming_mode: false,
            individual_address: IndividualAddress::from_wire(address),
            installation_id: 0,
            serial_number: [0, 1, 2, 3, 4, 5],
            multicast_address: KNXNETIP_MULTICAST_ADDR,
            mac_address: [0; 6],
            name: text,
        })
    }

    fn search_response(name: &str, address: [u8; 2], supported: &[(ServiceFamily, u8)]) -> KnxIpFrame {
        KnxIpFrame::SearchResponse(SearchResponse {
            control_endpoint: Hpai::udp(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 3671)),
            dibs: vec![
                device(name, address),
                Dib::SupportedServiceFamilies(families(supported)),
            ],
        })
    }

    fn tunnelling_gateway() -> KnxIpFrame {
        search_response(
            "Office IP Interface",
            [0x11, 0x00],
            &[
                (ServiceFamily::Core, 2),
                (ServiceFamily::Tunnelling, 2),
                (ServiceFamily::Routing, 1),
            ],
        )
    }

    #[test]
    fn test_descriptor_capabilities() {
        let KnxIpFrame::SearchResponse(response) = tunnelling_gateway() else {
            unreachable!()
        };
        let gateway = GatewayDescriptor::from_search_response(response, GATEWAY, INTERFACE).unwrap();
        assert_eq!(gateway.name, "Office IP Interface");
        assert_eq!(gateway.individual_address.to_string(), "1.1.0");
        assert!(gateway.supports_tunnelling);
        assert!(gateway.supports_tunnelling_tcp);
        assert!(gateway.supports_routing);
        assert!(!gateway.supports_secure);
        assert_eq!(gateway.free_tunnel_slot, None);
        assert_eq!(gateway.control_endpoint.to_string(), "192.168.1.10:3671");
    }

    #[test]
    fn test_route_back_endpoint_uses_source() {
        let response = SearchResponse {
            control_endpoint: Hpai::route_back(),
            dibs: vec![device("NAT", [0x11, 0x01])],
        };
        let source: SocketAddr = "10.0.0.5:3671".parse().unwrap();
        let gateway = GatewayDescriptor::from_search_response(response, source, INTERFACE).unwrap();
        assert_eq!(SocketAddr::V4(gateway.control_endpoint), source);
    }

    #[test]
    fn test_secure_families_and_slots() {
        let dibs = vec![
            device("Secure", [0x11, 0x02]),
            Dib::SupportedServiceFamilies(families(&[
                (ServiceFamily::Tunnelling, 2),
                (ServiceFamily::Security, 1),
            ])),
            Dib::SecuredServiceFamilies(families(&[(ServiceFamily::Tunnelling, 2)])),
            Dib::TunnellingInfo(TunnellingInfo {
                max_apdu_length: 254,
                slots: vec![TunnellingSlot {
                    individual_address: IndividualAddress::from_wire([0x11, 0xFA]),
                    usable: true,
                    authorized: false,
                    free: false,
                }],
            }),
        ];
        let gateway = GatewayDescriptor::from_dibs(
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 3671),
            INTERFACE,
            dibs,
        );
        assert!(gateway.supports_secure);
        assert!(gateway.tunnelling_requires_secure);
        assert!(!gateway.routing_requires_secure);
        assert_eq!(gateway.free_tunnel_slot, Some(false));
        assert_eq!(gateway.dibs.len(), 4);
    }

    #[test]
    fn test_filter_matching() {
        let KnxIpFrame::SearchResponse(response) = tunnelling_gateway() else {
            unreachable!()
        };
        let gateway = GatewayDescriptor::from_search_response(response, GATEWAY, INTERFACE).unwrap();

        assert!(GatewayScanFilter::default().matches(&gateway));
        let routing_only = GatewayScanFilter {
            tunnelling: Some(false),
            ..GatewayScanFilter::default()
        };
        assert!(!routing_only.matches(&gateway));
        let by_name = GatewayScanFilter {
            name: Some("Office IP Interface".into()),
            secure_tunnelling: Some(false),
            ..GatewayScanFilter::default()
        };
        assert!(by_name.matches(&gateway));
        let other_name = GatewayScanFilter {
            name: Some("Basement".into()),
            ..GatewayScanFilter::default()
        };
        assert!(!other_name.matches(&gateway));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_sends_search_and_stops_on_first() {
        let (transport, mut handle) = MockTransport::pair(GATEWAY);
        handle.add_response(&tunnelling_gateway());

        let gateways = GatewayScanner::new(GatewayScanFilter::default())
            .scan_on(vec![(INTERFACE, transport)])
            .await
            .unwrap();
        assert_eq!(gateways.len(), 1);
        assert_eq!(gateways[0].local_interface, INTERFACE);

        let (extended, target) = handle.next_sent().await.unwrap();
        assert_eq!(
            target,
            SocketAddr::V4(SocketAddrV4::new(KNXNETIP_MULTICAST_ADDR, 3671))
        );
        assert!(matches!(
            KnxIpFrame::from_bytes(&extended).unwrap().0,
            KnxIpFrame::SearchRequestExtended(_)
        ));
        match handle.next_frame().await.unwrap() {
            KnxIpFrame::SearchRequest(request) => {
                assert_eq!(request.discovery_endpoint.socket_addr().port(), 50000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_dedupes_filters_and_ranks() {
        let (transport, handle) = MockTransport::pair(GATEWAY);
        let router = search_response("Line Router", [0x12, 0x00], &[(ServiceFamily::Routing, 1)]);
        handle.add_response(&router);
        handle.add_response(&tunnelling_gateway());
        handle.add_response(&tunnelling_gateway());
        let dead = search_response("Dead", [0x13, 0x00], &[(ServiceFamily::Core, 1)]);
        handle.add_response(&dead);

        let filter = GatewayScanFilter {
            name: None,
            routing: Some(true),
            ..GatewayScanFilter::default()
        };
        let gateways = GatewayScanner::new(filter)
            .with_stop_on_found(None)
            .with_extended_search(false)
            .scan_on(vec![(INTERFACE, transport)])
            .await
            .unwrap();
        let names: Vec<_> = gateways.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["Office IP Interface", "Line Router"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_without_answer_is_empty() {
        let (transport, _handle) = MockTransport::pair(GATEWAY);
        let started = Instant::now();
        let gateways = GatewayScanner::new(GatewayScanFilter::default())
            .with_timeout(Duration::from_secs(2))
            .scan_on(vec![(INTERFACE, transport)])
            .await
            .unwrap();
        assert!(gateways.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_describe_gateway() {
        let (mut transport, mut handle) = MockTransport::pair(GATEWAY);
        let response = KnxIpFrame::DescriptionResponse(crate::protocol::services::DescriptionResponse {
            dibs: vec![
                device("Office IP Interface", [0x11, 0x00]),
                Dib::SupportedServiceFamilies(families(&[(ServiceFamily::Tunnelling, 1)])),
            ],
        });
        handle.add_response(&response);

        let SocketAddr::V4(gateway) = GATEWAY else {
            unreachable!()
        };
        let descriptor = describe_on(&mut transport, gateway, DESCRIPTION_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(descriptor.name, "Office IP Interface");
        assert!(descriptor.supports_tunnelling);
        assert!(!descriptor.supports_tunnelling_tcp);
        assert!(matches!(
            handle.next_frame().await.unwrap(),
            KnxIpFrame::DescriptionRequest(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_describe_times_out() {
        let (mut transport, _handle) = MockTransport::pair(GATEWAY);
        let SocketAddr::V4(gateway) = GATEWAY else {
            unreachable!()
        };
        let err = describe_on(&mut transport, gateway, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, KnxError::Timeout));
    }
}
