//! KNX IP Secure and KNX Data Secure.
//!
//! - [`session`]: secure unicast sessions (`SESSION_REQUEST` handshake,
//!   wrapped tunnelling traffic, keep-alive)
//! - [`routing`]: secure multicast routing with the shared group timer
//! - [`timer`]: the group timer state machine used by secure routing
//! - [`data_secure`]: end-to-end security of group telegrams
//! - [`keyring`]: key material for Data Secure
//! - [`primitives`] and [`wrapper`]: AES-CCM, key derivation and the
//!   `SECURE_WRAPPER` frame

pub mod data_secure;
pub mod keyring;
pub mod primitives;
pub mod routing;
pub mod session;
pub mod timer;
pub mod wrapper;

pub use data_secure::DataSecure;
pub use keyring::Keyring;
pub use routing::{SecureRouting, SecureRoutingFactory};
pub use session::{SecureSession, SecureSessionFactory, SessionCredentials};
