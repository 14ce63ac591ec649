//! Unified logging macro for knx-engine.
//!
//! Every log call in the crate goes through [`knx_log!`] so the level and
//! target conventions stay in one place. The macro forwards to the `log`
//! facade; the application decides which logger to install.
//!
//! # Targets
//!
//! - default (`knx_engine::...` module path) - connection and state changes
//! - `raw` - `knx_engine::raw_socket`, hex dumps of datagrams and stream chunks
//! - `telegram` - `knx_engine::telegram`, decoded telegrams in both directions
//!
//! # Usage
//!
//! ```rust
//! use knx_engine::knx_log;
//!
//! knx_log!(info, "Connection established");
//! knx_log!(debug, "Received {} bytes", 42);
//! knx_log!(target: raw, trace, "{:02x?}", [0x06u8, 0x10]);
//! ```

/// Target used for raw datagram dumps.
pub const RAW_SOCKET_TARGET: &str = "knx_engine::raw_socket";

/// Target used for decoded telegram traffic.
pub const TELEGRAM_TARGET: &str = "knx_engine::telegram";

/// Unified logging macro
///
/// # Examples
///
/// ```rust
/// use knx_engine::knx_log;
///
/// knx_log!(info, "System initialized");
/// knx_log!(warn, "Retry attempt {}/{}", 1, 3);
/// knx_log!(target: telegram, debug, "Outgoing: {}", "1/2/3");
/// ```
#[macro_export]
macro_rules! knx_log {
    (target: raw, $level:ident, $($arg:tt)*) => {
        $crate::knx_log!(@target $crate::logging::RAW_SOCKET_TARGET, $level, $($arg)*)
    };
    (target: telegram, $level:ident, $($arg:tt)*) => {
        $crate::knx_log!(@target $crate::logging::TELEGRAM_TARGET, $level, $($arg)*)
    };
    (@target $target:expr, info, $($arg:tt)*) => { $crate::__log::info!(target: $target, $($arg)*) };
    (@target $target:expr, debug, $($arg:tt)*) => { $crate::__log::debug!(target: $target, $($arg)*) };
    (@target $target:expr, warn, $($arg:tt)*) => { $crate::__log::warn!(target: $target, $($arg)*) };
    (@target $target:expr, error, $($arg:tt)*) => { $crate::__log::error!(target: $target, $($arg)*) };
    (@target $target:expr, trace, $($arg:tt)*) => { $crate::__log::trace!(target: $target, $($arg)*) };
    (info, $($arg:tt)*) => { $crate::__log::info!($($arg)*) };
    (debug, $($arg:tt)*) => { $crate::__log::debug!($($arg)*) };
    (warn, $($arg:tt)*) => { $crate::__log::warn!($($arg)*) };
    (error, $($arg:tt)*) => { $crate::__log::error!($($arg)*) };
    (trace, $($arg:tt)*) => { $crate::__log::trace!($($arg)*) };
}
