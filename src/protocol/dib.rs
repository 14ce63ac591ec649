//! Description Information Blocks and Search Request Parameters.
//!
//! DIBs are self-describing `[length, type, data..]` records returned in
//! search and description responses. SRPs narrow an extended search request.

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::protocol::constants::{
    ServiceFamily, DIB_DEVICE_INFO, DIB_SECURED_SERVICE_FAMILIES, DIB_SUPP_SVC_FAMILIES,
    DIB_TUNNELING_INFO, SRP_REQUEST_DIBS, SRP_SELECT_BY_MAC_ADDRESS,
    SRP_SELECT_BY_PROGRAMMING_MODE, SRP_SELECT_BY_SERVICE,
};
use std::net::Ipv4Addr;

/// Maximum number of service family entries kept per DIB
pub const MAX_SERVICE_FAMILIES: usize = 16;

/// One decoded DIB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dib {
    /// Hardware and identity of the server
    DeviceInformation(DeviceInformation),
    /// Service families and versions the server implements
    SupportedServiceFamilies(ServiceFamilies),
    /// Service families that require KNX IP Secure
    SecuredServiceFamilies(ServiceFamilies),
    /// Tunnelling slots and their state
    TunnellingInfo(TunnellingInfo),
    /// Any DIB this crate does not interpret
    Generic {
        /// DIB type code
        dib_type: u8,
        /// Data after the 2-byte DIB header
        data: Vec<u8>,
    },
}

impl Dib {
    /// Parse one DIB from the start of `data`, returning it and its length.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let len = usize::from(*data.first().ok_or_else(KnxError::invalid_frame)?);
        if len < 2 || data.len() < len {
            return Err(KnxError::invalid_frame());
        }
        let dib_type = data[1];
        let body = &data[2..len];
        let dib = match dib_type {
            DIB_DEVICE_INFO => Self::DeviceInformation(DeviceInformation::parse(body)?),
            DIB_SUPP_SVC_FAMILIES => Self::SupportedServiceFamilies(ServiceFamilies::parse(body)?),
            DIB_SECURED_SERVICE_FAMILIES => {
                Self::SecuredServiceFamilies(ServiceFamilies::parse(body)?)
            }
            DIB_TUNNELING_INFO => Self::TunnellingInfo(TunnellingInfo::parse(body)?),
            _ => Self::Generic {
                dib_type,
                data: body.to_vec(),
            },
        };
        Ok((dib, len))
    }

    /// Parse DIBs until `data` is exhausted.
    pub fn parse_all(mut data: &[u8]) -> Result<Vec<Self>> {
        let mut dibs = Vec::new();
        while !data.is_empty() {
            let (dib, used) = Self::parse(data)?;
            dibs.push(dib);
            data = &data[used..];
        }
        Ok(dibs)
    }

    /// Append the encoding, including the length/type header.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.push(0);
        match self {
            Self::DeviceInformation(info) => {
                out.push(DIB_DEVICE_INFO);
                info.encode(out);
            }
            Self::SupportedServiceFamilies(families) => {
                out.push(DIB_SUPP_SVC_FAMILIES);
                families.encode(out);
            }
            Self::SecuredServiceFamilies(families) => {
                out.push(DIB_SECURED_SERVICE_FAMILIES);
                families.encode(out);
            }
            Self::TunnellingInfo(info) => {
                out.push(DIB_TUNNELING_INFO);
                info.encode(out);
            }
            Self::Generic { dib_type, data } => {
                out.push(*dib_type);
                out.extend_from_slice(data);
            }
        }
        out[start] = (out.len() - start) as u8;
    }
}

/// `DEVICE_INFO` DIB (54 bytes on the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInformation {
    /// KNX medium code
    pub knx_medium: u8,
    /// Device is in programming mode
    pub programming_mode: bool,
    /// Individual address of the server
    pub individual_address: IndividualAddress,
    /// Project-installation identifier
    pub installation_id: u16,
    /// KNX serial number
    pub serial_number: [u8; 6],
    /// Routing multicast address
    pub multicast_address: Ipv4Addr,
    /// MAC address
    pub mac_address: [u8; 6],
    /// Friendly name (ISO 8859-1 on the wire)
    pub name: heapless::String<30>,
}

impl DeviceInformation {
    /// DIB size including the 2-byte header
    pub const SIZE: usize = 54;
    const NAME_OFFSET: usize = 22;

    fn parse(body: &[u8]) -> Result<Self> {
        if body.len() + 2 != Self::SIZE {
            return Err(KnxError::invalid_frame());
        }
        let mut serial_number = [0u8; 6];
        serial_number.copy_from_slice(&body[6..12]);
        let mut mac_address = [0u8; 6];
        mac_address.copy_from_slice(&body[16..22]);
        let mut name = heapless::String::new();
        for &byte in body[Self::NAME_OFFSET..].iter().take_while(|&&b| b != 0) {
            // Every Latin-1 byte maps to one char; 30 bytes always fit.
            let _ = name.push(char::from(byte));
        }
        Ok(Self {
            knx_medium: body[0],
            programming_mode: body[1] & 0x01 != 0,
            individual_address: IndividualAddress::from_wire([body[2], body[3]]),
            installation_id: u16::from_be_bytes([body[4], body[5]]),
            serial_number,
            multicast_address: Ipv4Addr::new(body[12], body[13], body[14], body[15]),
            mac_address,
            name,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.knx_medium);
        out.push(u8::from(self.programming_mode));
        out.extend_from_slice(&self.individual_address.to_wire());
        out.extend_from_slice(&self.installation_id.to_be_bytes());
        out.extend_from_slice(&self.serial_number);
        out.extend_from_slice(&self.multicast_address.octets());
        out.extend_from_slice(&self.mac_address);
        let mut name = [0u8; 30];
        for (slot, c) in name.iter_mut().zip(self.name.chars()) {
            *slot = u8::try_from(u32::from(c)).unwrap_or(b'?');
        }
        out.extend_from_slice(&name);
    }
}

/// One `(family, version)` entry of a service family DIB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FamilyVersion {
    /// Raw service family code
    pub family: u8,
    /// Implemented version
    pub version: u8,
}

/// Supported or secured service families.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceFamilies {
    /// Entries in wire order
    pub families: heapless::Vec<FamilyVersion, MAX_SERVICE_FAMILIES>,
}

impl ServiceFamilies {
    fn parse(body: &[u8]) -> Result<Self> {
        if body.len() % 2 != 0 {
            return Err(KnxError::invalid_frame());
        }
        let mut families = heapless::Vec::new();
        for pair in body.chunks_exact(2) {
            families
                .push(FamilyVersion {
                    family: pair[0],
                    version: pair[1],
                })
                .ok()
                .ok_or_else(KnxError::invalid_frame)?;
        }
        Ok(Self { families })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        for entry in &self.families {
            out.push(entry.family);
            out.push(entry.version);
        }
    }

    /// Highest version listed for `family`, if any.
    pub fn version_of(&self, family: ServiceFamily) -> Option<u8> {
        self.families
            .iter()
            .filter(|entry| entry.family == family as u8)
            .map(|entry| entry.version)
            .max()
    }

    /// `true` if `family` is listed with at least `min_version`.
    pub fn supports(&self, family: ServiceFamily, min_version: u8) -> bool {
        self.version_of(family).is_some_and(|v| v >= min_version)
    }
}

/// State of one tunnelling slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TunnellingSlot {
    /// Address assigned to the slot
    pub individual_address: IndividualAddress,
    /// Slot can be used at all
    pub usable: bool,
    /// Current client is authorised for the slot
    pub authorized: bool,
    /// Slot is not connected
    pub free: bool,
}

/// `TUNNELING_INFO` DIB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnellingInfo {
    /// Maximum APDU length supported by the interface
    pub max_apdu_length: u16,
    /// Slots in wire order
    pub slots: Vec<TunnellingSlot>,
}

impl TunnellingInfo {
    fn parse(body: &[u8]) -> Result<Self> {
        let [a, b, rest @ ..] = body else {
            return Err(KnxError::invalid_frame());
        };
        if rest.len() % 4 != 0 {
            return Err(KnxError::invalid_frame());
        }
        let slots = rest
            .chunks_exact(4)
            .map(|slot| {
                let status = slot[3];
                TunnellingSlot {
                    individual_address: IndividualAddress::from_wire([slot[0], slot[1]]),
                    usable: status & 0x04 != 0,
                    authorized: status & 0x02 != 0,
                    free: status & 0x01 != 0,
                }
            })
            .collect();
        Ok(Self {
            max_apdu_length: u16::from_be_bytes([*a, *b]),
            slots,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.max_apdu_length.to_be_bytes());
        for slot in &self.slots {
            out.extend_from_slice(&slot.individual_address.to_wire());
            let status = u8::from(slot.usable) << 2
                | u8::from(slot.authorized) << 1
                | u8::from(slot.free);
            out.extend_from_slice(&[0, status]);
        }
    }

    /// First slot that is usable, authorised and free.
    pub fn free_slot(&self) -> Option<&TunnellingSlot> {
        self.slots
            .iter()
            .find(|slot| slot.usable && slot.authorized && slot.free)
    }
}

/// Search Request Parameter for `SEARCH_REQUEST_EXTENDED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Srp {
    /// Server must not answer if it does not understand this SRP
    pub mandatory: bool,
    /// SRP type code
    pub srp_type: u8,
    /// SRP data
    pub data: Vec<u8>,
}

impl Srp {
    /// Only servers in programming mode answer.
    pub fn programming_mode() -> Self {
        Self {
            mandatory: true,
            srp_type: SRP_SELECT_BY_PROGRAMMING_MODE,
            data: Vec::new(),
        }
    }

    /// Only the server with this MAC address answers.
    pub fn mac_address(mac: [u8; 6]) -> Self {
        Self {
            mandatory: true,
            srp_type: SRP_SELECT_BY_MAC_ADDRESS,
            data: mac.to_vec(),
        }
    }

    /// Only servers implementing `family` in at least `version` answer.
    pub fn service(family: ServiceFamily, version: u8) -> Self {
        Self {
            mandatory: true,
            srp_type: SRP_SELECT_BY_SERVICE,
            data: vec![family as u8, version],
        }
    }

    /// Ask for additional DIB types; the list is padded to an even length.
    pub fn request_dibs(dib_types: &[u8]) -> Self {
        let mut data = dib_types.to_vec();
        if data.len() % 2 != 0 {
            data.push(0);
        }
        Self {
            mandatory: false,
            srp_type: SRP_REQUEST_DIBS,
            data,
        }
    }

    /// Parse one SRP, returning it and its length.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let [len, kind, ..] = data else {
            return Err(KnxError::invalid_frame());
        };
        let len = usize::from(*len);
        if len < 2 || data.len() < len {
            return Err(KnxError::invalid_frame());
        }
        Ok((
            Self {
                mandatory: kind & 0x80 != 0,
                srp_type: kind & 0x7F,
                data: data[2..len].to_vec(),
            },
            len,
        ))
    }

    /// Append the encoding.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push((self.data.len() + 2) as u8);
        out.push(u8::from(self.mandatory) << 7 | self.srp_type);
        out.extend_from_slice(&self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_info_bytes() -> Vec<u8> {
        let mut raw = vec![
            0x36, 0x01, 0x02, 0x00, 0x11, 0x00, 0x00, 0x00, 0x00, 0x01, 0x11, 0x00, 0x00, 0x11,
            0xE0, 0x00, 0x17, 0x0C, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05,
        ];
        let mut name = [0u8; 30];
        name[..7].copy_from_slice(b"Gateway");
        raw.extend_from_slice(&name);
        raw
    }

    #[test]
    fn test_device_info() {
        let raw = device_info_bytes();
        let (dib, used) = Dib::parse(&raw).unwrap();
        assert_eq!(used, DeviceInformation::SIZE);
        let Dib::DeviceInformation(info) = &dib else {
            panic!("expected device information");
        };
        assert_eq!(info.individual_address, IndividualAddress::new(1, 1, 0).unwrap());
        assert_eq!(info.multicast_address, Ipv4Addr::new(224, 0, 23, 12));
        assert_eq!(info.name.as_str(), "Gateway");
        assert!(!info.programming_mode);

        let mut out = Vec::new();
        dib.encode(&mut out);
        assert_eq!(out, raw);
    }

    #[test]
    fn test_service_families() {
        let raw = [0x08, 0x02, 0x02, 0x02, 0x04, 0x01, 0x09, 0x01];
        let (dib, _) = Dib::parse(&raw).unwrap();
        let Dib::SupportedServiceFamilies(families) = dib else {
            panic!("expected service families");
        };
        assert!(families.supports(ServiceFamily::Tunnelling, 1));
        assert!(!families.supports(ServiceFamily::Tunnelling, 2));
        assert!(families.supports(ServiceFamily::Security, 1));
        assert!(!families.supports(ServiceFamily::Routing, 1));
    }

    #[test]
    fn test_tunnelling_info_free_slot() {
        let raw = [
            0x0C, 0x07, 0x00, 0xF8, 0x11, 0x01, 0x00, 0x06, 0x11, 0x02, 0x00, 0x07,
        ];
        let (dib, _) = Dib::parse(&raw).unwrap();
        let Dib::TunnellingInfo(info) = &dib else {
            panic!("expected tunnelling info");
        };
        assert_eq!(info.max_apdu_length, 248);
        let slot = info.free_slot().unwrap();
        assert_eq!(slot.individual_address, IndividualAddress::new(1, 1, 2).unwrap());

        let mut out = Vec::new();
        dib.encode(&mut out);
        assert_eq!(out, raw);
    }

    #[test]
    fn test_unknown_dib_kept() {
        let raw = [0x04, 0xFE, 0x00, 0x01];
        let (dib, _) = Dib::parse(&raw).unwrap();
        assert_eq!(
            dib,
            Dib::Generic {
                dib_type: 0xFE,
                data: vec![0x00, 0x01]
            }
        );
    }

    #[test]
    fn test_truncated_dib_rejected() {
        assert!(Dib::parse(&[0x36, 0x01, 0x02]).is_err());
        assert!(Dib::parse(&[0x01]).is_err());
    }

    #[test]
    fn test_srp_encoding() {
        let mut out = Vec::new();
        Srp::programming_mode().encode(&mut out);
        Srp::request_dibs(&[0x07]).encode(&mut out);
        assert_eq!(out, [0x02, 0x81, 0x04, 0x04, 0x07, 0x00]);

        let (srp, used) = Srp::parse(&out[2..]).unwrap();
        assert_eq!(used, 4);
        assert_eq!(srp.srp_type, SRP_REQUEST_DIBS);
        assert!(!srp.mandatory);
    }
}
