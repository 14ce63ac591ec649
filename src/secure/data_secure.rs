//! KNX Data Secure for group communication (S-A_Data).
//!
//! A secured APDU travels as APCI `0x03F1`:
//!
//! ```text
//! ┌─────┬──────────────┬───────────────────────┬─────────┐
//! │ SCF │ sequence (6) │ APDU (plain or crypt) │ MAC (4) │
//! └─────┴──────────────┴───────────────────────┴─────────┘
//! ```
//!
//! The MAC is a CCM CBC-MAC truncated to 4 bytes over a block 0 built from
//! the sequence number, both addresses, the frame format and the secure
//! APCI. With confidentiality the APDU and MAC are additionally encrypted
//! in CTR mode.
//!
//! Only group communication with S-A_Data is supported; tool access and
//! system broadcast frames are rejected.

use crate::addressing::{Address, GroupAddress, IndividualAddress};
use crate::error::{KnxError, Result};
use crate::protocol::cemi::{ControlField2, LData};
use crate::secure::keyring::Keyring;
use crate::secure::primitives::{cbc_mac, ctr, macs_equal, Key};
use crate::secure::wrapper::{sequence_bytes, sequence_value};
use crate::telegram::{Apdu, Tpci, APCI_SECURE_SERVICE};
use std::collections::HashMap;

const MAC_LEN: usize = 4;
const SEQUENCE_LEN: usize = 6;
const MAX_SEQUENCE_NUMBER: u64 = 0xFFFF_FFFF_FFFF;

/// CCM variant of a secured APDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityAlgorithm {
    /// MAC only, APDU in clear
    Authentication,
    /// MAC and encrypted APDU
    AuthenticationConfidentiality,
}

/// Security control field
///
/// ```text
/// Bit 7: tool access
/// Bit 6-4: algorithm (0 = CCM authentication, 1 = CCM encryption)
/// Bit 3: system broadcast
/// Bit 2-0: security service (0 = S-A_Data)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SecurityControlField {
    /// Tool key instead of group key
    pub tool_access: bool,
    /// CCM variant
    pub algorithm: SecurityAlgorithm,
    /// System broadcast frame
    pub system_broadcast: bool,
    /// Security service code (0 = S-A_Data)
    pub service: u8,
}

impl SecurityControlField {
    /// S-A_Data with confidentiality, as used for outgoing group telegrams.
    pub const fn group_data() -> Self {
        Self {
            tool_access: false,
            algorithm: SecurityAlgorithm::AuthenticationConfidentiality,
            system_broadcast: false,
            service: 0,
        }
    }

    /// Decode the raw octet.
    pub fn from_u8(raw: u8) -> Result<Self> {
        let algorithm = match (raw >> 4) & 0x07 {
            0 => SecurityAlgorithm::Authentication,
            1 => SecurityAlgorithm::AuthenticationConfidentiality,
            _ => return Err(KnxError::invalid_cemi_frame()),
        };
        Ok(Self {
            tool_access: raw & 0x80 != 0,
            algorithm,
            system_broadcast: raw & 0x08 != 0,
            service: raw & 0x07,
        })
    }

    /// Raw octet
    pub const fn to_u8(self) -> u8 {
        let algorithm = match self.algorithm {
            SecurityAlgorithm::Authentication => 0x00,
            SecurityAlgorithm::AuthenticationConfidentiality => 0x10,
        };
        (if self.tool_access { 0x80 } else { 0 })
            | algorithm
            | (if self.system_broadcast { 0x08 } else { 0 })
            | (self.service & 0x07)
    }
}

/// Fields that enter block 0 and counter 0.
struct FrameContext {
    sequence: [u8; 6],
    addresses: [u8; 4],
    frame_flags: u8,
    tpci: Tpci,
}

impl FrameContext {
    fn new(ldata: &LData, sequence: [u8; 6]) -> Self {
        let mut addresses = [0u8; 4];
        addresses[..2].copy_from_slice(&ldata.source.to_wire());
        addresses[2..].copy_from_slice(&ldata.destination.to_wire());
        // Only the address type and extended frame format bits count.
        let control2 = ControlField2::new(
            ldata.destination.is_group(),
            0,
            ldata.control2.extended_format(),
        );
        Self {
            sequence,
            addresses,
            frame_flags: control2.raw() & 0x8F,
            tpci: ldata.tpci,
        }
    }

    fn block_0(&self, payload_len: usize) -> [u8; 16] {
        let tpci_apci = (u16::from(self.tpci.to_bits()) << 8) | APCI_SECURE_SERVICE;
        let mut block = [0u8; 16];
        block[..6].copy_from_slice(&self.sequence);
        block[6..10].copy_from_slice(&self.addresses);
        block[11] = self.frame_flags;
        block[12..14].copy_from_slice(&tpci_apci.to_be_bytes());
        block[15] = payload_len as u8;
        block
    }

    fn counter_0(&self) -> [u8; 16] {
        let mut counter = [0u8; 16];
        counter[..6].copy_from_slice(&self.sequence);
        counter[6..10].copy_from_slice(&self.addresses);
        counter[14] = 0x01;
        counter
    }
}

fn short_mac(mac: [u8; 16]) -> [u8; MAC_LEN] {
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&mac[..MAC_LEN]);
    out
}

/// CTR over a 4-byte MAC: the MAC sits in the first key stream block.
fn ctr_short(key: &Key, counter_0: &[u8; 16], mac: &[u8; MAC_LEN], payload: &[u8]) -> (Vec<u8>, [u8; MAC_LEN]) {
    let mut padded = [0u8; 16];
    padded[..MAC_LEN].copy_from_slice(mac);
    let (data, mac) = ctr(key, counter_0, &padded, payload);
    (data, short_mac(mac))
}

/// Plain APDU octets: APCI and data without the TPCI bits.
fn plain_apdu(apdu: &Apdu, tpci: Tpci) -> Vec<u8> {
    let mut bytes = apdu.to_bytes(tpci);
    bytes[0] &= 0x03;
    bytes
}

/// Secure and verify group telegrams with the keys of a [`Keyring`].
#[derive(Debug)]
pub struct DataSecure {
    keyring: Keyring,
    sequence_number_sending: u64,
    last_valid: HashMap<(IndividualAddress, GroupAddress), u64>,
}

impl DataSecure {
    /// Data Secure layer using `keyring`.
    pub fn new(keyring: Keyring) -> Self {
        Self {
            sequence_number_sending: keyring.sequence_number_sending(),
            keyring,
            last_valid: HashMap::new(),
        }
    }

    /// Key material in use
    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Verify and unwrap a received frame in place.
    ///
    /// Returns `true` if the frame was secured. Plain frames to unsecured
    /// destinations pass unchanged.
    ///
    /// # Errors
    ///
    /// - `PlainTelegramToSecureGroup` for a plain APDU to a secured group
    /// - `MissingKey` for a secured frame to a group without key, or a
    ///   secured point-to-point frame
    /// - `ReplayOrOutOfOrder` for an unknown sender or a sequence number
    ///   not above the last accepted one
    /// - `AuthenticationFailed` for a MAC mismatch
    ///
    /// On error the frame and the sequence table are left untouched.
    pub fn incoming(&mut self, ldata: &mut LData) -> Result<bool> {
        let Some(Apdu::Secure { scf, secured_data }) = &ldata.apdu else {
            if let Address::Group(group) = ldata.destination {
                if self.keyring.is_secure_group(&group) {
                    knx_log!(warn, "Discarding plain telegram to secure group {}", group);
                    return Err(KnxError::plain_telegram_to_secure_group());
                }
            }
            return Ok(false);
        };
        let scf = SecurityControlField::from_u8(*scf)?;
        if scf.service != 0 || scf.tool_access || scf.system_broadcast {
            knx_log!(warn, "Unsupported Data Secure frame from {}: {:?}", ldata.source, scf);
            return Err(KnxError::missing_key());
        }
        let Address::Group(group) = ldata.destination else {
            knx_log!(warn, "Secure point-to-point frame from {} not supported", ldata.source);
            return Err(KnxError::missing_key());
        };
        let key = *self.keyring.group_key(&group).ok_or_else(|| {
            knx_log!(warn, "No key for secure group {}", group);
            KnxError::missing_key()
        })?;
        if secured_data.len() < SEQUENCE_LEN + MAC_LEN {
            return Err(KnxError::invalid_cemi_frame());
        }

        let (sequence_raw, rest) = secured_data.split_at(SEQUENCE_LEN);
        let (secured_apdu, mac_raw) = rest.split_at(rest.len() - MAC_LEN);
        let mut sequence = [0u8; SEQUENCE_LEN];
        sequence.copy_from_slice(sequence_raw);
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(mac_raw);
        let received_sequence = sequence_value(&sequence);

        let last = match self.last_valid.get(&(ldata.source, group)) {
            Some(last) => *last,
            None => self.keyring.device_sequence_number(&ldata.source).ok_or_else(|| {
                knx_log!(warn, "Unknown Data Secure sender {}", ldata.source);
                KnxError::replay_or_out_of_order()
            })?,
        };
        if received_sequence <= last {
            knx_log!(
                warn,
                "Data Secure sequence {} from {} not above {}",
                received_sequence,
                ldata.source,
                last
            );
            return Err(KnxError::replay_or_out_of_order());
        }

        let context = FrameContext::new(ldata, sequence);
        let plain = match scf.algorithm {
            SecurityAlgorithm::AuthenticationConfidentiality => {
                let (plain, mac_received) =
                    ctr_short(&key, &context.counter_0(), &mac, secured_apdu);
                let expected = cbc_mac(&key, &[scf.to_u8()], &plain, &context.block_0(plain.len()));
                if !macs_equal(&expected[..MAC_LEN], &mac_received) {
                    knx_log!(warn, "Data Secure MAC mismatch from {}", ldata.source);
                    return Err(KnxError::authentication_failed());
                }
                plain
            }
            SecurityAlgorithm::Authentication => {
                let mut additional = vec![scf.to_u8()];
                additional.extend_from_slice(secured_apdu);
                let expected = cbc_mac(&key, &additional, &[], &context.block_0(0));
                if !macs_equal(&expected[..MAC_LEN], &mac) {
                    knx_log!(warn, "Data Secure MAC mismatch from {}", ldata.source);
                    return Err(KnxError::authentication_failed());
                }
                secured_apdu.to_vec()
            }
        };
        let apdu = Apdu::from_bytes(&plain)?;
        self.last_valid.insert((ldata.source, group), received_sequence);
        ldata.apdu = Some(apdu);
        Ok(true)
    }

    /// Secure an outgoing frame in place if its group is secured.
    ///
    /// Returns `true` if the frame was secured. The source address must
    /// already be final; it is part of the MAC.
    ///
    /// # Errors
    ///
    /// `SequenceExhausted` once the 48-bit sending sequence number ran out.
    pub fn outgoing(&mut self, ldata: &mut LData) -> Result<bool> {
        let Address::Group(group) = ldata.destination else {
            return Ok(false);
        };
        let Some(key) = self.keyring.group_key(&group).copied() else {
            return Ok(false);
        };
        let Some(apdu) = &ldata.apdu else {
            return Ok(false);
        };
        if matches!(apdu, Apdu::Secure { .. }) {
            return Ok(true);
        }
        if self.sequence_number_sending > MAX_SEQUENCE_NUMBER {
            return Err(KnxError::sequence_exhausted());
        }
        let apdu = plain_apdu(apdu, ldata.tpci);
        let sequence = sequence_bytes(self.sequence_number_sending);
        self.sequence_number_sending += 1;

        let scf = SecurityControlField::group_data();
        let context = FrameContext::new(ldata, sequence);
        let mac = cbc_mac(&key, &[scf.to_u8()], &apdu, &context.block_0(apdu.len()));
        let (encrypted, mac) = ctr_short(&key, &context.counter_0(), &short_mac(mac), &apdu);

        let mut secured_data = Vec::with_capacity(SEQUENCE_LEN + encrypted.len() + MAC_LEN);
        secured_data.extend_from_slice(&sequence);
        secured_data.extend_from_slice(&encrypted);
        secured_data.extend_from_slice(&mac);
        ldata.apdu = Some(Apdu::Secure {
            scf: scf.to_u8(),
            secured_data,
        });
        Ok(true)
    }

    /// Build an authentication-only secured APDU for `ldata`.
    ///
    /// Used for groups whose keyring entry does not require
    /// confidentiality.
    pub fn authenticate_only(&mut self, ldata: &mut LData) -> Result<()> {
        let Address::Group(group) = ldata.destination else {
            return Err(KnxError::missing_key());
        };
        let key = *self.keyring.group_key(&group).ok_or_else(KnxError::missing_key)?;
        let apdu = ldata.apdu.as_ref().ok_or_else(KnxError::invalid_cemi_frame)?;
        if self.sequence_number_sending > MAX_SEQUENCE_NUMBER {
            return Err(KnxError::sequence_exhausted());
        }
        let apdu = plain_apdu(apdu, ldata.tpci);
        let sequence = sequence_bytes(self.sequence_number_sending);
        self.sequence_number_sending += 1;

        let scf = SecurityControlField {
            algorithm: SecurityAlgorithm::Authentication,
            ..SecurityControlField::group_data()
        };
        let context = FrameContext::new(ldata, sequence);
        let mut additional = vec![scf.to_u8()];
        additional.extend_from_slice(&apdu);
        let mac = short_mac(cbc_mac(&key, &additional, &[], &context.block_0(0)));

        let mut secured_data = sequence.to_vec();
        secured_data.extend_from_slice(&apdu);
        secured_data.extend_from_slice(&mac);
        ldata.apdu = Some(Apdu::Secure {
            scf: scf.to_u8(),
            secured_data,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cemi::{CemiFrame, CemiMessageCode};
    use crate::telegram::{Payload, Telegram};

    const KEY: Key = [
        0x70, 0x71, 0x72, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a, 0x7b, 0x7c, 0x7d, 0x7e,
        0x7f,
    ];

    fn group() -> GroupAddress {
        "1/2/3".parse().unwrap()
    }

    fn sender() -> IndividualAddress {
        "1.1.5".parse().unwrap()
    }

    fn keyring() -> Keyring {
        Keyring::new()
            .with_group_key(group(), KEY)
            .with_device(sender(), 10)
            .with_sequence_number(20)
    }

    fn frame(value: u8) -> LData {
        let telegram = Telegram::group_write(group(), Payload::Binary(value));
        let cemi = CemiFrame::from_telegram(&telegram, CemiMessageCode::LDataInd, Some(sender()));
        cemi.ldata().unwrap().clone()
    }

    #[test]
    fn test_scf_bits() {
        let scf = SecurityControlField::group_data();
        assert_eq!(scf.to_u8(), 0x10);
        assert_eq!(SecurityControlField::from_u8(0x10).unwrap(), scf);
        let tool = SecurityControlField::from_u8(0x98).unwrap();
        assert!(tool.tool_access && tool.system_broadcast);
        assert!(SecurityControlField::from_u8(0x20).is_err());
    }

    #[test]
    fn test_secure_then_verify() {
        let mut sending = DataSecure::new(keyring());
        let mut receiving = DataSecure::new(keyring());

        let mut ldata = frame(1);
        assert!(sending.outgoing(&mut ldata).unwrap());
        let Some(Apdu::Secure { scf, secured_data }) = &ldata.apdu else {
            panic!("not secured");
        };
        assert_eq!(*scf, 0x10);
        assert_eq!(&secured_data[..6], &[0, 0, 0, 0, 0, 20]);
        // APCI (2 bytes) with the value in the low bits, plus 4-byte MAC.
        assert_eq!(secured_data.len(), 6 + 2 + 4);

        assert!(receiving.incoming(&mut ldata).unwrap());
        assert_eq!(ldata.apdu, Some(Apdu::GroupValueWrite(Payload::Binary(1))));
    }

    #[test]
    fn test_authentication_only() {
        let mut sending = DataSecure::new(keyring());
        let mut receiving = DataSecure::new(keyring());
        let mut ldata = frame(0);
        sending.authenticate_only(&mut ldata).unwrap();
        let Some(Apdu::Secure { scf, secured_data }) = &ldata.apdu else {
            panic!("not secured");
        };
        assert_eq!(*scf, 0x00);
        // Clear APDU after the sequence number.
        assert_eq!(&secured_data[6..8], &[0x00, 0x80]);
        assert!(receiving.incoming(&mut ldata).unwrap());
        assert_eq!(ldata.apdu, Some(Apdu::GroupValueWrite(Payload::Binary(0))));
    }

    #[test]
    fn test_tampered_mac_rejected() {
        let mut sending = DataSecure::new(keyring());
        let mut receiving = DataSecure::new(keyring());
        let mut ldata = frame(1);
        sending.outgoing(&mut ldata).unwrap();
        if let Some(Apdu::Secure { secured_data, .. }) = &mut ldata.apdu {
            let last = secured_data.len() - 1;
            secured_data[last] ^= 0x01;
        }
        let before = ldata.clone();
        assert!(receiving.incoming(&mut ldata).unwrap_err().is_authentication_failed());
        assert_eq!(ldata, before);
    }

    #[test]
    fn test_replay_rejected_per_sender_and_group() {
        let mut sending = DataSecure::new(keyring());
        let mut receiving = DataSecure::new(keyring());
        let mut first = frame(1);
        sending.outgoing(&mut first).unwrap();
        let replay = first.clone();
        let mut second = frame(0);
        sending.outgoing(&mut second).unwrap();

        assert!(receiving.incoming(&mut first).unwrap());
        assert!(receiving.incoming(&mut second).unwrap());
        let mut replay = replay;
        assert!(receiving.incoming(&mut replay).unwrap_err().is_replay());
    }

    #[test]
    fn test_sequence_not_above_keyring_value() {
        let mut sending = DataSecure::new(keyring().with_sequence_number(5));
        let mut receiving = DataSecure::new(keyring());
        let mut ldata = frame(1);
        sending.outgoing(&mut ldata).unwrap();
        assert!(receiving.incoming(&mut ldata).unwrap_err().is_replay());
    }

    #[test]
    fn test_unknown_sender_rejected() {
        let mut sending = DataSecure::new(keyring());
        let mut receiving = DataSecure::new(Keyring::new().with_group_key(group(), KEY));
        let mut ldata = frame(1);
        sending.outgoing(&mut ldata).unwrap();
        assert!(receiving.incoming(&mut ldata).unwrap_err().is_replay());
    }

    #[test]
    fn test_plain_to_secure_group_rejected() {
        let mut receiving = DataSecure::new(keyring());
        let mut ldata = frame(1);
        assert!(receiving.incoming(&mut ldata).unwrap_err().is_security());

        let mut other = frame(1);
        other.destination = Address::Group("1/2/4".parse().unwrap());
        assert!(!receiving.incoming(&mut other).unwrap());
    }

    #[test]
    fn test_unsecured_group_passes_outgoing() {
        let mut sending = DataSecure::new(keyring());
        let mut ldata = frame(1);
        ldata.destination = Address::Group("5/5/5".parse().unwrap());
        assert!(!sending.outgoing(&mut ldata).unwrap());
        assert_eq!(ldata.apdu, Some(Apdu::GroupValueWrite(Payload::Binary(1))));
    }

    #[test]
    fn test_exhausted_sequence_refuses_outgoing() {
        let mut sending = DataSecure::new(keyring().with_sequence_number(MAX_SEQUENCE_NUMBER));
        let mut last = frame(1);
        assert!(sending.outgoing(&mut last).unwrap());

        let mut ldata = frame(0);
        assert!(sending.outgoing(&mut ldata).unwrap_err().is_security());
        assert_eq!(ldata.apdu, Some(Apdu::GroupValueWrite(Payload::Binary(0))));
    }

    #[test]
    fn test_tool_access_rejected() {
        let mut receiving = DataSecure::new(keyring());
        let mut ldata = frame(1);
        ldata.apdu = Some(Apdu::Secure {
            scf: 0x90,
            secured_data: vec![0; 12],
        });
        assert!(receiving.incoming(&mut ldata).is_err());
    }
}
