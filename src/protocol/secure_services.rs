//! Bodies of the KNX IP Secure services (`0x095x`).
//!
//! These are plain containers; MAC computation and encryption live in
//! [`crate::secure`].

use crate::error::{KnxError, Result};
use crate::protocol::constants::SecureSessionStatus;
use crate::protocol::frame::Hpai;

fn array<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(
        data.get(offset..offset + N)
            .ok_or_else(KnxError::invalid_frame)?,
    );
    Ok(out)
}

fn u16_at(data: &[u8], offset: usize) -> Result<u16> {
    array::<2>(data, offset).map(u16::from_be_bytes)
}

/// `SECURE_WRAPPER`
///
/// ```text
/// session id (2) | sequence info (6) | serial (6) | tag (2) | data (n) | MAC (16)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureWrapper {
    /// Session identifier, 0 for secure routing
    pub secure_session_id: u16,
    /// Sender sequence counter (or routing timer value)
    pub sequence_information: [u8; 6],
    /// Sender KNX serial number
    pub serial_number: [u8; 6],
    /// Message tag
    pub message_tag: u16,
    /// Encrypted inner KNXnet/IP frame
    pub encrypted_data: Vec<u8>,
    /// Encrypted MAC
    pub message_authentication_code: [u8; 16],
}

impl SecureWrapper {
    /// Bytes of the body that are not encrypted data
    pub const OVERHEAD: usize = 2 + 6 + 6 + 2 + 16;

    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < Self::OVERHEAD {
            return Err(KnxError::invalid_frame());
        }
        let mac_offset = body.len() - 16;
        Ok(Self {
            secure_session_id: u16_at(body, 0)?,
            sequence_information: array(body, 2)?,
            serial_number: array(body, 8)?,
            message_tag: u16_at(body, 14)?,
            encrypted_data: body[16..mac_offset].to_vec(),
            message_authentication_code: array(body, mac_offset)?,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.secure_session_id.to_be_bytes());
        out.extend_from_slice(&self.sequence_information);
        out.extend_from_slice(&self.serial_number);
        out.extend_from_slice(&self.message_tag.to_be_bytes());
        out.extend_from_slice(&self.encrypted_data);
        out.extend_from_slice(&self.message_authentication_code);
    }
}

/// `SECURE_SESSION_REQUEST`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRequest {
    /// Client control endpoint
    pub control_endpoint: Hpai,
    /// Client X25519 public key
    pub ecdh_client_public_key: [u8; 32],
}

impl SessionRequest {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        Ok(Self {
            control_endpoint: Hpai::parse(body)?,
            ecdh_client_public_key: array(body, Hpai::SIZE)?,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        self.control_endpoint.encode(out);
        out.extend_from_slice(&self.ecdh_client_public_key);
    }
}

/// `SECURE_SESSION_RESPONSE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionResponse {
    /// Session identifier assigned by the server
    pub secure_session_id: u16,
    /// Server X25519 public key
    pub ecdh_server_public_key: [u8; 32],
    /// Encrypted MAC over both public keys
    pub message_authentication_code: [u8; 16],
}

impl SessionResponse {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        Ok(Self {
            secure_session_id: u16_at(body, 0)?,
            ecdh_server_public_key: array(body, 2)?,
            message_authentication_code: array(body, 34)?,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.secure_session_id.to_be_bytes());
        out.extend_from_slice(&self.ecdh_server_public_key);
        out.extend_from_slice(&self.message_authentication_code);
    }
}

/// `SECURE_SESSION_AUTHENTICATE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionAuthenticate {
    /// User identifier (1 is the management user)
    pub user_id: u8,
    /// Encrypted MAC keyed with the user password hash
    pub message_authentication_code: [u8; 16],
}

impl SessionAuthenticate {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        let [_reserved, user_id, ..] = body else {
            return Err(KnxError::invalid_frame());
        };
        Ok(Self {
            user_id: *user_id,
            message_authentication_code: array(body, 2)?,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[0, self.user_id]);
        out.extend_from_slice(&self.message_authentication_code);
    }
}

/// `SECURE_SESSION_STATUS`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// Status code
    pub status: SecureSessionStatus,
}

impl SessionStatus {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        let status = body
            .first()
            .copied()
            .and_then(SecureSessionStatus::from_u8)
            .ok_or_else(KnxError::invalid_frame)?;
        Ok(Self { status })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.status as u8, 0]);
    }
}

/// `SECURE_TIMER_NOTIFY`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerNotify {
    /// Sender's view of the group timer (48 bit)
    pub timer_value: [u8; 6],
    /// Sender KNX serial number
    pub serial_number: [u8; 6],
    /// Message tag
    pub message_tag: u16,
    /// Encrypted MAC
    pub message_authentication_code: [u8; 16],
}

impl TimerNotify {
    pub(crate) fn parse(body: &[u8]) -> Result<Self> {
        Ok(Self {
            timer_value: array(body, 0)?,
            serial_number: array(body, 6)?,
            message_tag: u16_at(body, 12)?,
            message_authentication_code: array(body, 14)?,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timer_value);
        out.extend_from_slice(&self.serial_number);
        out.extend_from_slice(&self.message_tag.to_be_bytes());
        out.extend_from_slice(&self.message_authentication_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::KnxIpFrame;

    #[test]
    fn test_wrapper_layout() {
        let wrapper = SecureWrapper {
            secure_session_id: 1,
            sequence_information: [0, 0, 0, 0, 0, 0],
            serial_number: [0x00, 0xFA, 0x12, 0x34, 0x56, 0x78],
            message_tag: 0xAFFE,
            encrypted_data: vec![0x79, 0x15, 0xA4, 0xF3],
            message_authentication_code: [0xAA; 16],
        };
        let bytes = KnxIpFrame::SecureWrapper(wrapper.clone()).to_bytes();
        assert_eq!(&bytes[..6], &[0x06, 0x10, 0x09, 0x50, 0x00, 0x2A]);
        assert_eq!(&bytes[20..22], &[0xAF, 0xFE]);

        let (decoded, _) = KnxIpFrame::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, KnxIpFrame::SecureWrapper(wrapper));
    }

    #[test]
    fn test_short_wrapper_rejected() {
        assert!(SecureWrapper::parse(&[0u8; SecureWrapper::OVERHEAD - 1]).is_err());
        let empty = SecureWrapper::parse(&[0u8; SecureWrapper::OVERHEAD]).unwrap();
        assert!(empty.encrypted_data.is_empty());
    }

    #[test]
    fn test_session_status() {
        let frame = KnxIpFrame::SessionStatus(SessionStatus {
            status: SecureSessionStatus::Close,
        });
        assert_eq!(
            frame.to_bytes(),
            [0x06, 0x10, 0x09, 0x54, 0x00, 0x08, 0x05, 0x00]
        );
        assert!(SessionStatus::parse(&[0x09, 0x00]).is_err());
    }

    #[test]
    fn test_session_response_length() {
        let response = SessionResponse {
            secure_session_id: 0x0001,
            ecdh_server_public_key: [0x11; 32],
            message_authentication_code: [0x22; 16],
        };
        let bytes = KnxIpFrame::SessionResponse(response).to_bytes();
        assert_eq!(bytes.len(), 56);
        assert!(SessionResponse::parse(&bytes[6..55]).is_err());
    }

    #[test]
    fn test_timer_notify_layout() {
        let notify = TimerNotify {
            timer_value: [0, 0, 0, 0, 0x12, 0x34],
            serial_number: [1, 2, 3, 4, 5, 6],
            message_tag: 7,
            message_authentication_code: [0; 16],
        };
        let mut out = Vec::new();
        notify.encode(&mut out);
        assert_eq!(out.len(), 30);
        assert_eq!(TimerNotify::parse(&out).unwrap(), notify);
    }
}
