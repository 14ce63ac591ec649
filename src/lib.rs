#![doc = include_str!("../README.md")]

//! ## Modules
//!
//! - [`addressing`] - individual and group addresses, subscription filters
//! - [`telegram`] - the application-level telegram and its TPCI/APCI codec
//! - [`protocol`] - KNXnet/IP frames, cEMI and the connection state machines
//! - [`net`] - UDP, TCP, multicast and mock transports
//! - [`secure`] - KNX IP Secure sessions, secure routing and Data Secure
//! - [`queue`] - outbound rate limiting and inbound dispatch
//! - [`discovery`] - gateway search and description
//! - [`config`] - connection configuration
//! - [`client`] - the high-level [`KnxClient`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use knx_engine::{ga, ConnectionConfig, KnxClient, Payload, Telegram};
//!
//! # async fn run() -> knx_engine::Result<()> {
//! let client = KnxClient::connect(&ConnectionConfig::routing()).await?;
//! client
//!     .send(Telegram::group_write(ga!(1/2/3), Payload::Binary(1)))
//!     .await?;
//! client.close().await
//! # }
//! ```

// Must precede the modules using the macros.
#[doc(hidden)]
pub use log as __log;
#[macro_use]
pub mod logging;
#[macro_use]
pub mod macros;

pub mod addressing;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod net;
pub mod protocol;
pub mod queue;
pub mod secure;
pub mod telegram;

#[doc(inline)]
pub use addressing::{Address, AddressFilter, GroupAddress, IndividualAddress};
#[doc(inline)]
pub use client::KnxClient;
#[doc(inline)]
pub use config::{ConnectionConfig, ConnectionType, SecureConfig};
#[doc(inline)]
pub use discovery::{GatewayDescriptor, GatewayScanFilter, GatewayScanner};
#[doc(inline)]
pub use error::{KnxError, Result};
#[doc(inline)]
pub use protocol::connection::ConnectionState;
#[doc(inline)]
pub use telegram::{Apdu, Payload, Telegram};
