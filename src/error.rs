//! Error types for KNX operations following M-ERRORS-CANONICAL-STRUCTS guideline.
//!
//! This module provides structured error types with backtraces and helper
//! methods for error information. Every category wraps a private kind enum so
//! new failure modes can be added without breaking callers that only use the
//! `is_*()` predicates.

use core::fmt;
use std::backtrace::Backtrace;

/// Result type alias for KNX operations.
pub type Result<T> = core::result::Result<T, KnxError>;

// =============================================================================
// Error Kind Enums (Internal)
// =============================================================================

/// Protocol error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ProtocolErrorKind {
    UnsupportedProtocolVersion(u8),
    MalformedHeader,
    IncompleteFrame,
    UnsupportedServiceType(u16),
    InvalidFrame,
    InvalidCemiFrame,
    UnsupportedMessageCode(u8),
}

/// Connection error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ConnectionErrorKind {
    Refused(u8),
    Lost,
    Closed,
    NotConnected,
    GatewayNotFound,
}

/// Tunneling error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum TunnelingErrorKind {
    SequenceMismatch,
    SendTimeout,
    NegativeConfirmation,
    AckFailed(u8),
}

/// Transport error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum TransportErrorKind {
    BufferTooSmall,
    Closed,
    NoLocalAddress,
}

/// Addressing error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum AddressingErrorKind {
    InvalidAddressFormat,
    OutOfRange,
}

/// Security error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum SecurityErrorKind {
    AuthenticationFailed,
    ReplayOrOutOfOrder,
    InvalidCredentials,
    TimerNotAuthenticated,
    MissingKey,
    PlainTelegramToSecureGroup,
    SequenceExhausted,
}

// =============================================================================
// Main Error Type
// =============================================================================

/// KNX protocol error types.
///
/// This is the main error type returned by all KNX operations.
/// It contains a backtrace and detailed error information through helper
/// methods.
#[derive(Debug)]
pub enum KnxError {
    /// Protocol-related errors (frame parsing, version, etc.)
    Protocol(ProtocolError),
    /// Connection-related errors (connect, disconnect, etc.)
    Connection(ConnectionError),
    /// Tunneling-related errors (sequence, ACK, confirmation)
    Tunneling(TunnelingError),
    /// Transport-related errors (buffer, closed socket, etc.)
    Transport(TransportError),
    /// Addressing errors (invalid address format, etc.)
    Addressing(AddressingError),
    /// KNX IP Secure and Data Secure errors
    Security(SecurityError),
    /// Underlying socket I/O failure
    Io(std::io::Error),
    /// A network wait exceeded its deadline
    Timeout,
}

// =============================================================================
// Structured Error Types
// =============================================================================

/// Protocol error with backtrace
#[derive(Debug)]
pub struct ProtocolError {
    kind: ProtocolErrorKind,
    backtrace: Backtrace,
}

impl ProtocolError {
    pub(crate) fn new(kind: ProtocolErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if the frame was cut short (more bytes are needed)
    pub fn is_incomplete_frame(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::IncompleteFrame)
    }

    /// Check if this is an unsupported version error
    pub fn is_unsupported_version(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::UnsupportedProtocolVersion(_))
    }

    /// Check if the header length field was wrong
    pub fn is_malformed_header(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::MalformedHeader)
    }

    /// Service type identifier, if this error was raised for an unknown service
    pub fn unsupported_service_type(&self) -> Option<u16> {
        match self.kind {
            ProtocolErrorKind::UnsupportedServiceType(service) => Some(service),
            _ => None,
        }
    }

    /// Check if a cEMI frame failed to decode
    pub fn is_invalid_cemi_frame(&self) -> bool {
        matches!(
            self.kind,
            ProtocolErrorKind::InvalidCemiFrame | ProtocolErrorKind::UnsupportedMessageCode(_)
        )
    }

    /// Captured backtrace
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// Connection error with backtrace
#[derive(Debug)]
pub struct ConnectionError {
    kind: ConnectionErrorKind,
    backtrace: Backtrace,
}

impl ConnectionError {
    pub(crate) fn new(kind: ConnectionErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Status code of a refused connect request
    pub fn refused_status(&self) -> Option<u8> {
        match self.kind {
            ConnectionErrorKind::Refused(status) => Some(status),
            _ => None,
        }
    }

    /// Check if connection was refused
    pub fn is_refused(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::Refused(_))
    }

    /// Check if connection was lost (reconnect budget exhausted)
    pub fn is_lost(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::Lost)
    }

    /// Check if the connection was closed by the application
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::Closed)
    }

    /// Captured backtrace
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// Tunneling error with backtrace
#[derive(Debug)]
pub struct TunnelingError {
    kind: TunnelingErrorKind,
    backtrace: Backtrace,
}

impl TunnelingError {
    pub(crate) fn new(kind: TunnelingErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if this is a sequence mismatch error
    pub fn is_sequence_mismatch(&self) -> bool {
        matches!(self.kind, TunnelingErrorKind::SequenceMismatch)
    }

    /// Check if an acknowledgement or confirmation never arrived
    pub fn is_send_timeout(&self) -> bool {
        matches!(self.kind, TunnelingErrorKind::SendTimeout)
    }

    /// Check if the bus reported a failed transmission
    pub fn is_negative_confirmation(&self) -> bool {
        matches!(self.kind, TunnelingErrorKind::NegativeConfirmation)
    }

    /// Captured backtrace
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// Transport error with backtrace
#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    backtrace: Backtrace,
}

impl TransportError {
    pub(crate) fn new(kind: TransportErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if buffer is too small
    pub fn is_buffer_too_small(&self) -> bool {
        matches!(self.kind, TransportErrorKind::BufferTooSmall)
    }

    /// Check if the transport was closed by the peer or locally
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Closed)
    }
}

/// Addressing error with backtrace
#[derive(Debug)]
pub struct AddressingError {
    kind: AddressingErrorKind,
    backtrace: Backtrace,
}

impl AddressingError {
    pub(crate) fn new(kind: AddressingErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if the address text was malformed or a segment was out of range
    pub fn is_invalid_address_format(&self) -> bool {
        matches!(
            self.kind,
            AddressingErrorKind::InvalidAddressFormat | AddressingErrorKind::OutOfRange
        )
    }

    /// Check if address is out of range
    pub fn is_out_of_range(&self) -> bool {
        matches!(self.kind, AddressingErrorKind::OutOfRange)
    }
}

/// Security error with backtrace
#[derive(Debug)]
pub struct SecurityError {
    kind: SecurityErrorKind,
    backtrace: Backtrace,
}

impl SecurityError {
    pub(crate) fn new(kind: SecurityErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if a message authentication code did not verify
    pub fn is_authentication_failed(&self) -> bool {
        matches!(self.kind, SecurityErrorKind::AuthenticationFailed)
    }

    /// Check if a sequence number was not strictly greater than the last one
    pub fn is_replay(&self) -> bool {
        matches!(self.kind, SecurityErrorKind::ReplayOrOutOfOrder)
    }

    /// Check if the configured credentials were rejected
    pub fn is_invalid_credentials(&self) -> bool {
        matches!(self.kind, SecurityErrorKind::InvalidCredentials)
    }

    /// Captured backtrace
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

// =============================================================================
// Convenience Constructors for KnxError
// =============================================================================

impl KnxError {
    // Protocol errors
    pub(crate) fn unsupported_protocol_version(version: u8) -> Self {
        Self::Protocol(ProtocolError::new(
            ProtocolErrorKind::UnsupportedProtocolVersion(version),
        ))
    }

    pub(crate) fn malformed_header() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::MalformedHeader))
    }

    pub(crate) fn incomplete_frame() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::IncompleteFrame))
    }

    pub(crate) fn unsupported_service_type(service: u16) -> Self {
        Self::Protocol(ProtocolError::new(
            ProtocolErrorKind::UnsupportedServiceType(service),
        ))
    }

    pub(crate) fn invalid_frame() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::InvalidFrame))
    }

    pub(crate) fn invalid_cemi_frame() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::InvalidCemiFrame))
    }

    pub(crate) fn unsupported_message_code(code: u8) -> Self {
        Self::Protocol(ProtocolError::new(
            ProtocolErrorKind::UnsupportedMessageCode(code),
        ))
    }

    // Connection errors
    pub(crate) fn connection_refused(status: u8) -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::Refused(status)))
    }

    pub(crate) fn connection_lost() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::Lost))
    }

    pub(crate) fn connection_closed() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::Closed))
    }

    pub(crate) fn not_connected() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::NotConnected))
    }

    pub(crate) fn gateway_not_found() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::GatewayNotFound))
    }

    // Tunneling errors
    pub(crate) fn sequence_mismatch() -> Self {
        Self::Tunneling(TunnelingError::new(TunnelingErrorKind::SequenceMismatch))
    }

    pub(crate) fn send_timeout() -> Self {
        Self::Tunneling(TunnelingError::new(TunnelingErrorKind::SendTimeout))
    }

    pub(crate) fn negative_confirmation() -> Self {
        Self::Tunneling(TunnelingError::new(TunnelingErrorKind::NegativeConfirmation))
    }

    pub(crate) fn tunneling_ack_failed(status: u8) -> Self {
        Self::Tunneling(TunnelingError::new(TunnelingErrorKind::AckFailed(status)))
    }

    // Transport errors
    pub(crate) fn buffer_too_small() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::BufferTooSmall))
    }

    pub(crate) fn transport_closed() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::Closed))
    }

    pub(crate) fn no_local_address() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::NoLocalAddress))
    }

    // Addressing errors
    pub(crate) fn invalid_address_format() -> Self {
        Self::Addressing(AddressingError::new(
            AddressingErrorKind::InvalidAddressFormat,
        ))
    }

    pub(crate) fn address_out_of_range() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::OutOfRange))
    }

    // Security errors
    pub(crate) fn authentication_failed() -> Self {
        Self::Security(SecurityError::new(SecurityErrorKind::AuthenticationFailed))
    }

    pub(crate) fn replay_or_out_of_order() -> Self {
        Self::Security(SecurityError::new(SecurityErrorKind::ReplayOrOutOfOrder))
    }

    pub(crate) fn invalid_credentials() -> Self {
        Self::Security(SecurityError::new(SecurityErrorKind::InvalidCredentials))
    }

    pub(crate) fn timer_not_authenticated() -> Self {
        Self::Security(SecurityError::new(SecurityErrorKind::TimerNotAuthenticated))
    }

    pub(crate) fn missing_key() -> Self {
        Self::Security(SecurityError::new(SecurityErrorKind::MissingKey))
    }

    pub(crate) fn plain_telegram_to_secure_group() -> Self {
        Self::Security(SecurityError::new(
            SecurityErrorKind::PlainTelegramToSecureGroup,
        ))
    }

    pub(crate) fn sequence_exhausted() -> Self {
        Self::Security(SecurityError::new(SecurityErrorKind::SequenceExhausted))
    }

    // Predicates spanning categories

    /// `true` for `IncompleteFrame`: the caller must buffer more bytes.
    pub fn is_incomplete_frame(&self) -> bool {
        matches!(self, Self::Protocol(e) if e.is_incomplete_frame())
    }

    /// `true` for `AuthenticationFailed` (MAC mismatch).
    pub fn is_authentication_failed(&self) -> bool {
        matches!(self, Self::Security(e) if e.is_authentication_failed())
    }

    /// `true` for `ReplayOrOutOfOrder`.
    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Security(e) if e.is_replay())
    }

    /// `true` for any security-category failure.
    pub fn is_security(&self) -> bool {
        matches!(self, Self::Security(_))
    }

    /// `true` for `SendTimeout`.
    pub fn is_send_timeout(&self) -> bool {
        matches!(self, Self::Tunneling(e) if e.is_send_timeout())
    }

    /// `true` for `ConnectionClosed`.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::Connection(e) if e.is_closed())
    }

    /// `true` for `ConnectionLost`.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Connection(e) if e.is_lost())
    }

    /// Status code carried by `ConnectionRefused`.
    pub fn refused_status(&self) -> Option<u8> {
        match self {
            Self::Connection(e) => e.refused_status(),
            _ => None,
        }
    }

    /// `true` for `InvalidAddressFormat`.
    pub fn is_invalid_address_format(&self) -> bool {
        matches!(self, Self::Addressing(e) if e.is_invalid_address_format())
    }

    /// Service type carried by `UnsupportedServiceType`.
    pub fn unsupported_service(&self) -> Option<u16> {
        match self {
            Self::Protocol(e) => e.unsupported_service_type(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KnxError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<tokio::time::error::Elapsed> for KnxError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

// =============================================================================
// Display Implementation
// =============================================================================

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedProtocolVersion(v) => {
                write!(f, "unsupported protocol version 0x{v:02X}")
            }
            Self::MalformedHeader => write!(f, "malformed header"),
            Self::IncompleteFrame => write!(f, "incomplete frame"),
            Self::UnsupportedServiceType(s) => write!(f, "unsupported service type 0x{s:04X}"),
            Self::InvalidFrame => write!(f, "invalid frame body"),
            Self::InvalidCemiFrame => write!(f, "invalid cEMI frame"),
            Self::UnsupportedMessageCode(c) => write!(f, "unsupported cEMI message code 0x{c:02X}"),
        }
    }
}

impl fmt::Display for KnxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnxError::Protocol(e) => write!(f, "Protocol error: {}", e.kind),
            KnxError::Connection(e) => match e.kind {
                ConnectionErrorKind::Refused(status) => {
                    write!(f, "Connection error: refused with status 0x{status:02X}")
                }
                kind => write!(f, "Connection error: {kind:?}"),
            },
            KnxError::Tunneling(e) => write!(f, "Tunneling error: {:?}", e.kind),
            KnxError::Transport(e) => write!(f, "Transport error: {:?}", e.kind),
            KnxError::Addressing(e) => write!(f, "Addressing error: {:?}", e.kind),
            KnxError::Security(e) => write!(f, "Security error: {:?}", e.kind),
            KnxError::Io(e) => write!(f, "I/O error: {e}"),
            KnxError::Timeout => write!(f, "Operation timeout"),
        }
    }
}

impl std::error::Error for KnxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KnxError::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(KnxError::incomplete_frame().is_incomplete_frame());
        assert!(KnxError::authentication_failed().is_authentication_failed());
        assert!(KnxError::replay_or_out_of_order().is_replay());
        assert!(KnxError::send_timeout().is_send_timeout());
        assert!(KnxError::connection_closed().is_connection_closed());
        assert_eq!(KnxError::connection_refused(0x24).refused_status(), Some(0x24));
        assert_eq!(KnxError::unsupported_service_type(0x0740).unsupported_service(), Some(0x0740));
        assert!(!KnxError::Timeout.is_security());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            KnxError::connection_refused(0x24).to_string(),
            "Connection error: refused with status 0x24"
        );
        assert_eq!(
            KnxError::unsupported_service_type(0x0740).to_string(),
            "Protocol error: unsupported service type 0x0740"
        );
    }
}
