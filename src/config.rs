//! Connection configuration.
//!
//! [`ConnectionConfig`] is handed to [`KnxClient::connect`](crate::client::KnxClient::connect)
//! and decides how the bus is reached. The crate never reads configuration
//! files; callers fill the struct (or deserialize it with the `serde`
//! feature) from whatever source they use.
//!
//! ## Example
//!
//! ```rust
//! use knx_engine::config::{ConnectionConfig, ConnectionType};
//! use std::net::Ipv4Addr;
//!
//! let config = ConnectionConfig::tunneling(Ipv4Addr::new(192, 168, 1, 10));
//! assert_eq!(config.connection_type, ConnectionType::Tunneling);
//! assert_eq!(config.gateway_port, 3671);
//! assert_eq!(config.rate_limit, Some(20));
//! ```

use crate::addressing::IndividualAddress;
use crate::discovery::GatewayScanFilter;
use crate::error::{KnxError, Result};
use crate::protocol::constants::{
    CONFIRMATION_TIMEOUT, CONNECTIONSTATE_REQUEST_TIMEOUT, CONNECT_REQUEST_TIMEOUT,
    HEARTBEAT_INTERVAL, HEARTBEAT_RETRIES, KNXNETIP_DEFAULT_PORT, KNXNETIP_MULTICAST_ADDR,
    ROUTING_INDICATION_PAUSE, TUNNELLING_REQUEST_TIMEOUT,
};
use crate::secure::keyring::Keyring;
use crate::secure::primitives::{derive_device_authentication_password, derive_user_password, Key};
use crate::secure::session::{SessionCredentials, DEFAULT_SERIAL_NUMBER};
use core::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Default outgoing rate limit in telegrams per second
pub const DEFAULT_RATE_LIMIT: u32 = 20;

/// How the bus is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionType {
    /// Discover gateways, then try tunnelling and routing in turn
    #[default]
    Automatic,
    /// UDP tunnel
    Tunneling,
    /// TCP tunnel
    TunnelingTcp,
    /// TCP tunnel inside a KNX IP Secure session
    TunnelingSecure,
    /// Multicast routing
    Routing,
    /// Multicast routing with the backbone key
    RoutingSecure,
}

impl ConnectionType {
    /// `true` for the tunnelling variants.
    pub const fn is_tunneling(self) -> bool {
        matches!(
            self,
            Self::Tunneling | Self::TunnelingTcp | Self::TunnelingSecure
        )
    }

    /// `true` for the IP Secure variants.
    pub const fn is_secure(self) -> bool {
        matches!(self, Self::TunnelingSecure | Self::RoutingSecure)
    }
}

/// Timers of a tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TunnelTimings {
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// Time to wait for a heartbeat response
    pub connectionstate_timeout: Duration,
    /// Heartbeats repeated before the tunnel counts as lost
    pub heartbeat_retries: u8,
    /// Time to wait for a `TUNNELLING_ACK`
    pub ack_timeout: Duration,
    /// Time to wait for the `L_Data.con` after the ack
    pub confirmation_timeout: Duration,
    /// Time to wait for a `CONNECT_RESPONSE` or `DISCONNECT_RESPONSE`
    pub connect_timeout: Duration,
}

impl Default for TunnelTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            connectionstate_timeout: CONNECTIONSTATE_REQUEST_TIMEOUT,
            heartbeat_retries: HEARTBEAT_RETRIES,
            ack_timeout: TUNNELLING_REQUEST_TIMEOUT,
            confirmation_timeout: CONFIRMATION_TIMEOUT,
            connect_timeout: CONNECT_REQUEST_TIMEOUT,
        }
    }
}

/// Flow control of a routing connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoutingTimings {
    /// Pause after each `ROUTING_INDICATION`
    pub indication_pause: Duration,
    /// Random back-off slot per `ROUTING_BUSY` in the current window
    pub busy_random_slot: Duration,
    /// Slow-down per `ROUTING_BUSY` before the counter starts to decay
    pub slow_duration_step: Duration,
    /// Interval in which the busy counter decays by one
    pub busy_decay_interval: Duration,
}

impl Default for RoutingTimings {
    fn default() -> Self {
        Self {
            indication_pause: ROUTING_INDICATION_PAUSE,
            busy_random_slot: Duration::from_millis(50),
            slow_duration_step: Duration::from_millis(100),
            busy_decay_interval: Duration::from_millis(5),
        }
    }
}

/// Parsed KNX IP Secure and Data Secure key material.
///
/// Passwords are turned into keys on connect; pre-derived keys win over
/// passwords when both are given.
#[derive(Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SecureConfig {
    /// Tunnel user id
    pub user_id: u8,
    /// Tunnel user password
    pub user_password: Option<String>,
    /// PBKDF2 hash of the user password
    pub user_password_key: Option<Key>,
    /// Device authentication code
    pub device_authentication_password: Option<String>,
    /// PBKDF2 hash of the device authentication code
    pub device_authentication_key: Option<Key>,
    /// Backbone key for secure routing
    pub backbone_key: Option<Key>,
    /// Expected multicast latency for secure routing, in milliseconds
    pub latency_ms: u32,
    /// Data Secure keys
    #[cfg_attr(feature = "serde", serde(skip))]
    pub keyring: Option<Keyring>,
}

impl SecureConfig {
    /// Default latency tolerance for secure routing
    pub const DEFAULT_LATENCY_MS: u32 = 1000;

    /// Secure tunnel as `user_id` with a password.
    pub fn tunnel(user_id: u8, user_password: impl Into<String>) -> Self {
        Self {
            user_id,
            user_password: Some(user_password.into()),
            latency_ms: Self::DEFAULT_LATENCY_MS,
            ..Self::default()
        }
    }

    /// Secure routing with `backbone_key`.
    pub fn routing(backbone_key: Key) -> Self {
        Self {
            backbone_key: Some(backbone_key),
            latency_ms: Self::DEFAULT_LATENCY_MS,
            ..Self::default()
        }
    }

    /// Verify the gateway with its device authentication code.
    #[must_use]
    pub fn with_device_authentication(mut self, password: impl Into<String>) -> Self {
        self.device_authentication_password = Some(password.into());
        self
    }

    /// Add Data Secure keys.
    #[must_use]
    pub fn with_keyring(mut self, keyring: Keyring) -> Self {
        self.keyring = Some(keyring);
        self
    }

    /// Session credentials for a secure tunnel.
    ///
    /// # Errors
    ///
    /// `InvalidCredentials` when neither a user password nor its key is set,
    /// or a password contains characters outside Latin-1.
    pub fn session_credentials(&self) -> Result<SessionCredentials> {
        let user_key = match (&self.user_password_key, &self.user_password) {
            (Some(key), _) => *key,
            (None, Some(password)) => derive_user_password(password)?,
            (None, None) => return Err(KnxError::invalid_credentials()),
        };
        let mut credentials = SessionCredentials::new(self.user_id, user_key);
        credentials.serial_number = DEFAULT_SERIAL_NUMBER;
        let device_key = match (
            &self.device_authentication_key,
            &self.device_authentication_password,
        ) {
            (Some(key), _) => Some(*key),
            (None, Some(password)) => Some(derive_device_authentication_password(password)?),
            (None, None) => None,
        };
        Ok(match device_key {
            Some(key) => credentials.with_device_authentication(key),
            None => credentials,
        })
    }

    /// Backbone key for secure routing.
    ///
    /// # Errors
    ///
    /// `InvalidCredentials` when no backbone key is configured.
    pub fn backbone_key(&self) -> Result<Key> {
        self.backbone_key.ok_or_else(KnxError::invalid_credentials)
    }

    /// Latency tolerance as a duration
    pub fn latency(&self) -> Duration {
        Duration::from_millis(u64::from(self.latency_ms))
    }
}

impl fmt::Debug for SecureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureConfig")
            .field("user_id", &self.user_id)
            .field("latency_ms", &self.latency_ms)
            .field("keyring", &self.keyring)
            .finish_non_exhaustive()
    }
}

/// Everything needed to reach the bus.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConnectionConfig {
    /// Connection method
    pub connection_type: ConnectionType,
    /// Gateway address; required for tunnelling
    pub gateway_ip: Option<Ipv4Addr>,
    /// Gateway port
    pub gateway_port: u16,
    /// Local interface; detected from the route to the gateway when unset
    pub local_ip: Option<Ipv4Addr>,
    /// Own address for routing, requested address for TCP tunnels
    pub individual_address: Option<IndividualAddress>,
    /// Advertise a route-back HPAI (NAT friendly)
    pub route_back: bool,
    /// Routing multicast group
    pub multicast_group: Ipv4Addr,
    /// Routing multicast port
    pub multicast_port: u16,
    /// Outgoing telegrams per second; `None` disables the limit
    pub rate_limit: Option<u32>,
    /// IP Secure and Data Secure keys
    pub secure: Option<SecureConfig>,
    /// Tunnel timers
    pub tunnel: TunnelTimings,
    /// Routing flow control
    pub routing: RoutingTimings,
    /// Rebuild a lost tunnel
    pub auto_reconnect: bool,
    /// Reconnect attempts before giving up
    pub reconnect_attempts: u32,
    /// Pause before each reconnect attempt
    pub reconnect_backoff: Duration,
    /// Gateway selection for automatic connections
    pub gateway_scan: GatewayScanFilter,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::Automatic,
            gateway_ip: None,
            gateway_port: KNXNETIP_DEFAULT_PORT,
            local_ip: None,
            individual_address: None,
            route_back: false,
            multicast_group: KNXNETIP_MULTICAST_ADDR,
            multicast_port: KNXNETIP_DEFAULT_PORT,
            rate_limit: Some(DEFAULT_RATE_LIMIT),
            secure: None,
            tunnel: TunnelTimings::default(),
            routing: RoutingTimings::default(),
            auto_reconnect: true,
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(3),
            gateway_scan: GatewayScanFilter::default(),
        }
    }
}

impl ConnectionConfig {
    /// Discover a gateway and connect to the best match.
    pub fn automatic() -> Self {
        Self::default()
    }

    /// UDP tunnel to `gateway`.
    pub fn tunneling(gateway: Ipv4Addr) -> Self {
        Self {
            connection_type: ConnectionType::Tunneling,
            gateway_ip: Some(gateway),
            ..Self::default()
        }
    }

    /// TCP tunnel to `gateway`.
    pub fn tunneling_tcp(gateway: Ipv4Addr) -> Self {
        Self {
            connection_type: ConnectionType::TunnelingTcp,
            gateway_ip: Some(gateway),
            ..Self::default()
        }
    }

    /// Secure TCP tunnel to `gateway`.
    pub fn secure_tunneling(gateway: Ipv4Addr, secure: SecureConfig) -> Self {
        Self {
            connection_type: ConnectionType::TunnelingSecure,
            gateway_ip: Some(gateway),
            secure: Some(secure),
            ..Self::default()
        }
    }

    /// Multicast routing on the default group.
    pub fn routing() -> Self {
        Self {
            connection_type: ConnectionType::Routing,
            ..Self::default()
        }
    }

    /// Secure multicast routing with `backbone_key`.
    pub fn secure_routing(backbone_key: Key) -> Self {
        Self {
            connection_type: ConnectionType::RoutingSecure,
            secure: Some(SecureConfig::routing(backbone_key)),
            ..Self::default()
        }
    }

    /// Use `address` as own (routing) or requested (TCP) address.
    #[must_use]
    pub fn with_individual_address(mut self, address: IndividualAddress) -> Self {
        self.individual_address = Some(address);
        self
    }

    /// Send from `local_ip`.
    #[must_use]
    pub fn with_local_ip(mut self, local_ip: Ipv4Addr) -> Self {
        self.local_ip = Some(local_ip);
        self
    }

    /// Change the outgoing rate limit.
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: Option<u32>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Gateway control endpoint.
    ///
    /// # Errors
    ///
    /// `GatewayNotFound` when no gateway address is set.
    pub fn gateway_endpoint(&self) -> Result<SocketAddr> {
        let ip = self.gateway_ip.ok_or_else(KnxError::gateway_not_found)?;
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, self.gateway_port)))
    }

    /// Multicast group and port
    pub fn multicast_endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.multicast_group, self.multicast_port)
    }

    /// Data Secure keys, if configured.
    pub fn keyring(&self) -> Option<&Keyring> {
        self.secure.as_ref().and_then(|secure| secure.keyring.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.connection_type, ConnectionType::Automatic);
        assert_eq!(config.multicast_endpoint().to_string(), "224.0.23.12:3671");
        assert!(config.auto_reconnect);
        assert_eq!(config.reconnect_attempts, 3);
        assert_eq!(config.tunnel.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.tunnel.ack_timeout, Duration::from_secs(3));
        assert_eq!(config.routing.indication_pause, Duration::from_millis(20));
        assert!(config.gateway_endpoint().is_err());
    }

    #[test]
    fn test_builders() {
        let ip = Ipv4Addr::new(10, 0, 0, 5);
        let config = ConnectionConfig::tunneling_tcp(ip).with_rate_limit(None);
        assert_eq!(config.gateway_endpoint().unwrap().to_string(), "10.0.0.5:3671");
        assert_eq!(config.rate_limit, None);
        assert!(config.connection_type.is_tunneling());

        let config = ConnectionConfig::secure_routing([1; 16]);
        assert!(config.connection_type.is_secure());
        assert_eq!(config.secure.unwrap().backbone_key().unwrap(), [1; 16]);
    }

    #[test]
    fn test_session_credentials() {
        let secure = SecureConfig::tunnel(2, "secret").with_device_authentication("trustme");
        let credentials = secure.session_credentials().unwrap();
        assert_eq!(credentials.user_id, 2);
        assert_eq!(
            credentials.user_password_key,
            derive_user_password("secret").unwrap()
        );
        assert!(credentials.device_authentication_key.is_some());

        let pre_derived = SecureConfig {
            user_password_key: Some([3; 16]),
            ..SecureConfig::default()
        };
        let credentials = pre_derived.session_credentials().unwrap();
        assert_eq!(credentials.user_password_key, [3; 16]);
        assert!(credentials.device_authentication_key.is_none());

        let err = SecureConfig::default().session_credentials().unwrap_err();
        assert!(err.is_security());
    }

    #[test]
    fn test_secure_debug_hides_passwords() {
        let secure = SecureConfig::tunnel(2, "hunter2");
        assert!(!format!("{secure:?}").contains("hunter2"));
    }
}
