//! KNXnet/IP protocol implementation.
//!
//! Frame and service codecs (`frame`, `services`, `dib`, `secure_services`,
//! `cemi`), the tunnelling state machine (`tunnel`) and the connection tasks
//! built on them (`async_tunnel`, `routing`).

pub mod async_tunnel;
pub mod cemi;
pub mod connection;
pub mod constants;
pub mod dib;
pub mod frame;
pub mod routing;
pub mod secure_services;
pub mod services;
pub mod tunnel;

pub use cemi::*;
pub use constants::*;
pub use frame::*;
pub use services::*;
pub use tunnel::*;
