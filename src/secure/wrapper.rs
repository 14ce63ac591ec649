//! `SECURE_WRAPPER` sealing and opening.
//!
//! ```text
//! additional data: header(06 10 09 50 len) | session id
//! block 0:         sequence | serial | tag | payload length
//! counter 0:       sequence | serial | tag | FF 00
//! ```
//!
//! Sequence bookkeeping is left to the caller: a unicast session counts
//! frames, secure routing uses the group timer.

use crate::error::{KnxError, Result};
use crate::protocol::constants::ServiceType;
use crate::protocol::frame::KnxnetIpHeader;
use crate::protocol::secure_services::SecureWrapper;
use crate::secure::primitives::{cbc_mac, ctr, macs_equal, Key};

/// Low 48 bits of `value` as the 6-byte big-endian sequence field.
pub fn sequence_bytes(value: u64) -> [u8; 6] {
    let mut out = [0u8; 6];
    out.copy_from_slice(&value.to_be_bytes()[2..]);
    out
}

/// Inverse of [`sequence_bytes`].
pub fn sequence_value(bytes: &[u8; 6]) -> u64 {
    let mut wide = [0u8; 8];
    wide[2..].copy_from_slice(bytes);
    u64::from_be_bytes(wide)
}

fn additional_data(session_id: u16, payload_len: usize) -> [u8; 8] {
    let total = (KnxnetIpHeader::SIZE + SecureWrapper::OVERHEAD + payload_len) as u16;
    let service = ServiceType::SecureWrapper.to_u16().to_be_bytes();
    let total = total.to_be_bytes();
    let session = session_id.to_be_bytes();
    [
        0x06, 0x10, service[0], service[1], total[0], total[1], session[0], session[1],
    ]
}

fn blocks(sequence: &[u8; 6], serial: &[u8; 6], tag: u16, payload_len: usize) -> ([u8; 16], [u8; 16]) {
    let mut block_0 = [0u8; 16];
    block_0[..6].copy_from_slice(sequence);
    block_0[6..12].copy_from_slice(serial);
    block_0[12..14].copy_from_slice(&tag.to_be_bytes());
    let mut counter_0 = block_0;
    block_0[14..].copy_from_slice(&(payload_len as u16).to_be_bytes());
    counter_0[14..].copy_from_slice(&[0xFF, 0x00]);
    (block_0, counter_0)
}

/// Encrypt and authenticate a complete KNXnet/IP frame.
pub fn seal(
    key: &Key,
    session_id: u16,
    sequence: [u8; 6],
    serial_number: [u8; 6],
    message_tag: u16,
    frame: &[u8],
) -> SecureWrapper {
    let (block_0, counter_0) = blocks(&sequence, &serial_number, message_tag, frame.len());
    let mac = cbc_mac(key, &additional_data(session_id, frame.len()), frame, &block_0);
    let (encrypted_data, message_authentication_code) = ctr(key, &counter_0, &mac, frame);
    SecureWrapper {
        secure_session_id: session_id,
        sequence_information: sequence,
        serial_number,
        message_tag,
        encrypted_data,
        message_authentication_code,
    }
}

/// Decrypt a wrapper and verify its MAC.
///
/// # Errors
///
/// `AuthenticationFailed` if the MAC does not match. Nothing of the
/// decrypted data is returned in that case.
pub fn open(key: &Key, wrapper: &SecureWrapper) -> Result<Vec<u8>> {
    let (block_0, counter_0) = blocks(
        &wrapper.sequence_information,
        &wrapper.serial_number,
        wrapper.message_tag,
        wrapper.encrypted_data.len(),
    );
    let (frame, mac_received) = ctr(
        key,
        &counter_0,
        &wrapper.message_authentication_code,
        &wrapper.encrypted_data,
    );
    let mac = cbc_mac(
        key,
        &additional_data(wrapper.secure_session_id, frame.len()),
        &frame,
        &block_0,
    );
    if !macs_equal(&mac, &mac_received) {
        return Err(KnxError::authentication_failed());
    }
    Ok(frame)
}
