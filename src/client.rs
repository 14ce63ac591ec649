//! High-level KNX client.
//!
//! [`KnxClient`] owns one connection task (tunnel or routing) and one
//! dispatcher task. Outgoing telegrams go through the task's request queue;
//! inbound telegrams reach every subscriber in bus order.
//!
//! ## Example
//!
//! ```rust,no_run
//! use knx_engine::client::KnxClient;
//! use knx_engine::config::ConnectionConfig;
//! use knx_engine::telegram::{Payload, Telegram};
//! use std::net::Ipv4Addr;
//!
//! # async fn run() -> knx_engine::Result<()> {
//! let config = ConnectionConfig::tunneling(Ipv4Addr::new(192, 168, 1, 10));
//! let client = KnxClient::connect(&config).await?;
//! let mut lights = client.subscribe(Some("1/*/*".parse()?));
//!
//! client
//!     .send_confirmed(Telegram::group_write("1/2/3".parse()?, Payload::Binary(1)))
//!     .await?;
//! while let Some(telegram) = lights.recv().await {
//!     println!("{telegram}");
//! }
//! client.close().await
//! # }
//! ```

use crate::addressing::{AddressFilter, IndividualAddress};
use crate::config::{ConnectionConfig, ConnectionType};
use crate::discovery::GatewayScanner;
use crate::error::{KnxError, Result};
use crate::net::local_ipv4_for;
use crate::net::multicast::MulticastFactory;
use crate::net::tcp::TcpFactory;
use crate::net::transport::TransportFactory;
use crate::net::udp::UdpFactory;
use crate::protocol::async_tunnel::{AsyncTunnelClient, TunnelSettings};
use crate::protocol::connection::{
    channels, CemiCounters, ConnectionEnds, ConnectionState, Request,
};
use crate::protocol::constants::TunnellingFeatureType;
use crate::protocol::routing::{RoutingConnection, RoutingCounters, RoutingSettings};
use crate::queue::{Subscribers, TelegramStream};
use crate::secure::data_secure::DataSecure;
use crate::secure::{SecureRoutingFactory, SecureSessionFactory};
use crate::telegram::Telegram;
use core::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Requests that may wait in the queue of a connection task
pub const REQUEST_QUEUE_SIZE: usize = 64;

/// What the client is connected through.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Tunnel gateway; `None` for routing
    pub gateway: Option<SocketAddr>,
    /// Own address on the bus as of the initial connect
    pub individual_address: IndividualAddress,
    /// Traffic runs through KNX IP Secure
    pub secure: bool,
    /// Routing statistics; `None` for tunnels
    pub routing: Option<RoutingCounters>,
    /// Telegrams sent, delivered and dropped by the connection task
    pub counters: CemiCounters,
}

/// Connected KNX client.
///
/// Dropping the client closes the connection in the background; use
/// [`KnxClient::close`] to wait for the disconnect.
#[derive(Debug)]
pub struct KnxClient {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
    subscribers: Subscribers,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
    info: ConnectionInfo,
}

impl KnxClient {
    /// Connect as described by `config`.
    ///
    /// `Automatic` scans for gateways and tries each match, tunnelling
    /// before routing.
    ///
    /// # Errors
    ///
    /// `GatewayNotFound` when a tunnel has no gateway or a scan found
    /// nothing usable, `InvalidCredentials` for incomplete secure
    /// configuration, and any connect error of the chosen method.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        knx_log!(debug, "Connecting with {:?}", config.connection_type);
        match config.connection_type {
            ConnectionType::Automatic => Self::connect_automatic(config).await,
            _ => Self::connect_direct(config).await,
        }
    }

    async fn connect_direct(config: &ConnectionConfig) -> Result<Self> {
        match config.connection_type {
            ConnectionType::Automatic => Err(KnxError::gateway_not_found()),
            ConnectionType::Tunneling => {
                let gateway = config.gateway_endpoint()?;
                let local = match config.local_ip {
                    Some(ip) => ip,
                    None => local_ipv4_for(gateway_ipv4(gateway)?)?,
                };
                let factory = UdpFactory {
                    local: SocketAddr::from((local, 0)),
                };
                Self::start_tunnel(factory, TunnelSettings::from_config(config)?, data_secure(config))
                    .await
            }
            ConnectionType::TunnelingTcp => {
                let factory = TcpFactory {
                    remote: config.gateway_endpoint()?,
                };
                Self::start_tunnel(factory, TunnelSettings::from_config(config)?, data_secure(config))
                    .await
            }
            ConnectionType::TunnelingSecure => {
                let secure = config
                    .secure
                    .as_ref()
                    .ok_or_else(KnxError::invalid_credentials)?;
                let gateway = config.gateway_endpoint()?;
                let factory = SecureSessionFactory {
                    inner: TcpFactory { remote: gateway },
                    gateway,
                    credentials: secure.session_credentials()?,
                };
                Self::start_tunnel(factory, TunnelSettings::from_config(config)?, data_secure(config))
                    .await
            }
            ConnectionType::Routing => {
                let factory = MulticastFactory {
                    group: config.multicast_endpoint(),
                    interface: routing_interface(config)?,
                };
                Self::start_routing(factory, RoutingSettings::from_config(config), data_secure(config))
                    .await
            }
            ConnectionType::RoutingSecure => {
                let secure = config
                    .secure
                    .as_ref()
                    .ok_or_else(KnxError::invalid_credentials)?;
                let factory = SecureRoutingFactory {
                    inner: MulticastFactory {
                        group: config.multicast_endpoint(),
                        interface: routing_interface(config)?,
                    },
                    group: config.multicast_endpoint().into(),
                    backbone_key: secure.backbone_key()?,
                    latency: secure.latency(),
                };
                Self::start_routing(factory, RoutingSettings::from_config(config), data_secure(config))
                    .await
            }
        }
    }

    async fn connect_automatic(config: &ConnectionConfig) -> Result<Self> {
        let gateways = GatewayScanner::new(config.gateway_scan.clone())
            .scan()
            .await?;
        let mut last_error = None;
        for gateway in gateways {
            let mut attempt = config.clone();
            attempt.gateway_ip = Some(*gateway.control_endpoint.ip());
            attempt.gateway_port = gateway.control_endpoint.port();
            attempt.local_ip = Some(gateway.local_interface);

            if gateway.supports_tunnelling && !gateway.tunnelling_requires_secure {
                attempt.connection_type = ConnectionType::Tunneling;
                match Self::connect_direct(&attempt).await {
                    Ok(client) => return Ok(client),
                    Err(e) => {
                        knx_log!(warn, "Tunnel to {} failed: {}", gateway, e);
                        last_error = Some(e);
                    }
                }
            }
            if gateway.supports_routing && !gateway.routing_requires_secure {
                attempt.connection_type = ConnectionType::Routing;
                match Self::connect_direct(&attempt).await {
                    Ok(client) => return Ok(client),
                    Err(e) => {
                        knx_log!(warn, "Routing via {} failed: {}", gateway.local_interface, e);
                        last_error = Some(e);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(KnxError::gateway_not_found))
    }

    /// Establish a tunnel through `factory` and start serving it.
    ///
    /// # Errors
    ///
    /// Connect errors of [`AsyncTunnelClient::connect`].
    pub async fn start_tunnel<F>(
        factory: F,
        settings: TunnelSettings,
        data_secure: Option<DataSecure>,
    ) -> Result<Self>
    where
        F: TransportFactory + 'static,
    {
        let (task, ends) = channels(REQUEST_QUEUE_SIZE);
        let gateway = settings.gateway;
        let secure = settings.secure;
        let client = AsyncTunnelClient::connect(factory, settings, data_secure, &task.state).await?;
        let info = ConnectionInfo {
            gateway: Some(gateway),
            individual_address: client.individual_address(),
            secure,
            routing: None,
            counters: client.counters(),
        };
        knx_log!(
            info,
            "Tunnel to {} on channel {} as {}",
            gateway,
            client.channel_id(),
            info.individual_address
        );
        Ok(Self::spawn(ends, info, client.run(task)))
    }

    /// Open a routing connection through `factory` and start serving it.
    ///
    /// # Errors
    ///
    /// Socket and timer synchronisation errors.
    pub async fn start_routing<F>(
        factory: F,
        settings: RoutingSettings,
        data_secure: Option<DataSecure>,
    ) -> Result<Self>
    where
        F: TransportFactory + 'static,
    {
        let (task, ends) = channels(REQUEST_QUEUE_SIZE);
        let info = ConnectionInfo {
            gateway: None,
            individual_address: settings.individual_address,
            secure: settings.secure,
            routing: None,
            counters: CemiCounters::default(),
        };
        let connection = RoutingConnection::connect(factory, settings, data_secure, &task.state).await?;
        let routing = connection.counters();
        let info = ConnectionInfo {
            counters: routing.cemi().clone(),
            routing: Some(routing),
            ..info
        };
        Ok(Self::spawn(ends, info, connection.run(task)))
    }

    fn spawn<T>(ends: ConnectionEnds, info: ConnectionInfo, connection: T) -> Self
    where
        T: Future<Output = Result<()>> + Send + 'static,
    {
        let subscribers = Subscribers::new();
        tokio::spawn(subscribers.clone().run(ends.inbound));
        Self {
            requests: ends.requests,
            state: ends.state,
            subscribers,
            shutdown: ends.shutdown,
            task: tokio::spawn(connection),
            info,
        }
    }

    /// Queue `telegram` and return once it is queued.
    ///
    /// Delivery failures are logged by the connection task; use
    /// [`KnxClient::send_confirmed`] to observe them.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once the connection task is gone.
    pub async fn send(&self, telegram: Telegram) -> Result<()> {
        // The receiver is dropped; the task ignores the unread reply.
        let (reply, _done) = oneshot::channel();
        self.submit(Request::Telegram { telegram, reply }).await
    }

    /// Send `telegram` and wait until the connection delivered it.
    ///
    /// A tunnel completes after the gateway's ack and the bus confirmation;
    /// routing completes after transmission.
    ///
    /// # Errors
    ///
    /// `SendTimeout`, `NegativeConfirmation`, security errors for Data
    /// Secure groups, `ConnectionClosed` and `ConnectionLost`.
    pub async fn send_confirmed(&self, telegram: Telegram) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.submit(Request::Telegram { telegram, reply }).await?;
        done.await.map_err(|_dropped| KnxError::connection_closed())?
    }

    /// Read a tunnelling feature from the gateway.
    ///
    /// # Errors
    ///
    /// `UnsupportedServiceType` on routing connections, `SendTimeout`
    /// and connection errors.
    pub async fn feature_get(&self, feature: TunnellingFeatureType) -> Result<Vec<u8>> {
        let (reply, done) = oneshot::channel();
        self.submit(Request::FeatureGet { feature, reply }).await?;
        done.await.map_err(|_dropped| KnxError::connection_closed())?
    }

    /// Write a tunnelling feature; returns the value the gateway reports.
    ///
    /// # Errors
    ///
    /// As [`KnxClient::feature_get`].
    pub async fn feature_set(&self, feature: TunnellingFeatureType, value: Vec<u8>) -> Result<Vec<u8>> {
        let (reply, done) = oneshot::channel();
        self.submit(Request::FeatureSet {
            feature,
            value,
            reply,
        })
        .await?;
        done.await.map_err(|_dropped| KnxError::connection_closed())?
    }

    async fn submit(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_closed| KnxError::connection_closed())
    }

    /// Inbound telegrams matching `filter`; `None` receives everything.
    pub fn subscribe(&self, filter: Option<AddressFilter>) -> TelegramStream {
        self.subscribers.subscribe(filter)
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// How the client is connected
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Close the connection and wait for the task to finish.
    ///
    /// Telegrams still queued fail with `ConnectionClosed`.
    ///
    /// # Errors
    ///
    /// The error the connection ended with, if it was lost before the
    /// close.
    pub async fn close(self) -> Result<()> {
        // The task may already have ended on its own.
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                knx_log!(error, "Connection task failed: {}", e);
                Err(KnxError::connection_lost())
            }
        }
    }
}

fn data_secure(config: &ConnectionConfig) -> Option<DataSecure> {
    config.keyring().cloned().map(DataSecure::new)
}

fn gateway_ipv4(gateway: SocketAddr) -> Result<Ipv4Addr> {
    match gateway.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(KnxError::gateway_not_found()),
    }
}

fn routing_interface(config: &ConnectionConfig) -> Result<Ipv4Addr> {
    match config.local_ip {
        Some(ip) => Ok(ip),
        None => local_ipv4_for(config.multicast_group),
    }
}
