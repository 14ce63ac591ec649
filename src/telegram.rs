//! Telegrams: the application's unit of KNX communication.
//!
//! A [`Telegram`] is an immutable value built either by decoding a cEMI frame
//! or by the application before sending. It carries the transport-layer
//! control information ([`Tpci`]) and the application-layer service
//! ([`Apdu`]); link-layer flags live on the cEMI frame instead.
//!
//! ## APDU layout
//!
//! ```text
//! ┌────────────────────┬────────────────────┬──────────────┐
//! │ TPCI (6) │ APCI(2) │ APCI (2) │ data(6) │ data (n)     │
//! └────────────────────┴────────────────────┴──────────────┘
//! ```
//!
//! Group value services with a payload of six bits or less pack it into the
//! low bits of the second octet ([`Payload::Binary`]); anything longer
//! follows as whole bytes ([`Payload::Array`]).

use crate::addressing::{Address, GroupAddress, IndividualAddress};
use crate::error::{KnxError, Result};
use core::fmt;

/// APCI of an S-A_Data (Data Secure) APDU.
pub const APCI_SECURE_SERVICE: u16 = 0x03F1;

/// Raw payload of a group value service.
///
/// `Binary(1)` and `Array(vec![1])` are different payloads on the wire and
/// never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Payload {
    /// Up to 6 bits packed into the APCI octet
    Binary(u8),
    /// Whole bytes following the APCI
    Array(Vec<u8>),
}

impl Payload {
    /// Number of bytes the payload adds after the 2-octet TPCI/APCI header.
    pub fn extra_len(&self) -> usize {
        match self {
            Self::Binary(_) => 0,
            Self::Array(data) => data.len(),
        }
    }

    fn decode(low_bits: u8, rest: &[u8]) -> Self {
        if rest.is_empty() {
            Self::Binary(low_bits & 0x3F)
        } else {
            Self::Array(rest.to_vec())
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Binary(value) => {
                if let Some(last) = out.last_mut() {
                    *last |= value & 0x3F;
                }
            }
            Self::Array(data) => out.extend_from_slice(data),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary(value) => write!(f, "0x{value:02X}"),
            Self::Array(data) => {
                for byte in data {
                    write!(f, "{byte:02X}")?;
                }
                Ok(())
            }
        }
    }
}

/// Transport layer control information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Tpci {
    /// T_Data_Group (multicast to a group address)
    DataGroup,
    /// T_Data_Broadcast (group address 0/0/0)
    DataBroadcast,
    /// T_Data_Tag_Group
    DataTagGroup,
    /// T_Data_Individual (connectionless point-to-point)
    DataIndividual,
    /// T_Data_Connected with sequence number
    DataConnected {
        /// Sequence number (0-15)
        sequence: u8,
    },
    /// T_Connect
    Connect,
    /// T_Disconnect
    Disconnect,
    /// T_ACK
    Ack {
        /// Sequence number (0-15)
        sequence: u8,
    },
    /// T_NAK
    Nak {
        /// Sequence number (0-15)
        sequence: u8,
    },
}

impl Tpci {
    /// TPCI bits as they appear in the upper six bits of the first TPDU octet.
    pub const fn to_bits(self) -> u8 {
        match self {
            Self::DataGroup | Self::DataBroadcast | Self::DataIndividual => 0x00,
            Self::DataTagGroup => 0x04,
            Self::DataConnected { sequence } => 0x40 | ((sequence & 0x0F) << 2),
            Self::Connect => 0x80,
            Self::Disconnect => 0x81,
            Self::Ack { sequence } => 0xC2 | ((sequence & 0x0F) << 2),
            Self::Nak { sequence } => 0xC3 | ((sequence & 0x0F) << 2),
        }
    }

    /// Resolve the TPCI octet against the destination it was addressed to.
    pub fn resolve(octet: u8, destination: Address) -> Result<Self> {
        let sequence = (octet >> 2) & 0x0F;
        let tpci = match (octet & 0xC0, destination) {
            (0x00, Address::Group(_)) if octet & 0x04 != 0 => Self::DataTagGroup,
            (0x00, Address::Group(ga)) if ga.is_broadcast() => Self::DataBroadcast,
            (0x00, Address::Group(_)) => Self::DataGroup,
            (0x00, Address::Individual(_)) => Self::DataIndividual,
            (0x40, _) => Self::DataConnected { sequence },
            (0x80, _) if octet & 0x03 == 0x00 => Self::Connect,
            (0x80, _) if octet & 0x03 == 0x01 => Self::Disconnect,
            (0xC0, _) if octet & 0x03 == 0x02 => Self::Ack { sequence },
            (0xC0, _) if octet & 0x03 == 0x03 => Self::Nak { sequence },
            _ => return Err(KnxError::invalid_cemi_frame()),
        };
        Ok(tpci)
    }

    /// Control TPDUs carry no APDU.
    pub const fn is_control(self) -> bool {
        matches!(
            self,
            Self::Connect | Self::Disconnect | Self::Ack { .. } | Self::Nak { .. }
        )
    }

    /// Default TPCI for a data telegram to `destination`.
    pub const fn data_for(destination: Address) -> Self {
        match destination {
            Address::Group(ga) if ga.is_broadcast() => Self::DataBroadcast,
            Address::Group(_) => Self::DataGroup,
            Address::Individual(_) => Self::DataIndividual,
        }
    }
}

/// Application layer service with its data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Apdu {
    /// A_GroupValue_Read
    GroupValueRead,
    /// A_GroupValue_Response
    GroupValueResponse(Payload),
    /// A_GroupValue_Write
    GroupValueWrite(Payload),
    /// A_IndividualAddress_Write
    IndividualAddressWrite(IndividualAddress),
    /// A_IndividualAddress_Read
    IndividualAddressRead,
    /// A_IndividualAddress_Response
    IndividualAddressResponse,
    /// A_Memory_Read
    MemoryRead {
        /// Number of octets (0-63)
        count: u8,
        /// Memory address
        address: u16,
    },
    /// A_Memory_Response
    MemoryResponse {
        /// Number of octets (0-63)
        count: u8,
        /// Memory address
        address: u16,
        /// Memory content
        data: Vec<u8>,
    },
    /// A_Memory_Write
    MemoryWrite {
        /// Number of octets (0-63)
        count: u8,
        /// Memory address
        address: u16,
        /// Memory content
        data: Vec<u8>,
    },
    /// A_DeviceDescriptor_Read
    DeviceDescriptorRead {
        /// Descriptor type (0-63)
        descriptor: u8,
    },
    /// A_DeviceDescriptor_Response
    DeviceDescriptorResponse {
        /// Descriptor type (0-63)
        descriptor: u8,
        /// Descriptor value
        value: Vec<u8>,
    },
    /// A_Restart (basic)
    Restart,
    /// A_PropertyValue_Read
    PropertyValueRead(PropertyValue),
    /// A_PropertyValue_Response
    PropertyValueResponse(PropertyValue),
    /// A_PropertyValue_Write
    PropertyValueWrite(PropertyValue),
    /// S-A_Data: Data Secure envelope (security control field + secured data)
    Secure {
        /// Security control field
        scf: u8,
        /// Sequence number, secured APDU and MAC
        secured_data: Vec<u8>,
    },
    /// Any other APCI, carried through unchanged
    Unknown {
        /// 10-bit APCI
        apci: u16,
        /// Bytes after the APCI octets
        data: Vec<u8>,
    },
}

/// Property addressing shared by the A_PropertyValue services.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyValue {
    /// Interface object index
    pub object_index: u8,
    /// Property identifier
    pub property_id: u8,
    /// Number of elements (0-15)
    pub count: u8,
    /// Start index (0-4095)
    pub start_index: u16,
    /// Element data (empty for read)
    pub data: Vec<u8>,
}

impl PropertyValue {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.object_index);
        out.push(self.property_id);
        let count_index = (u16::from(self.count & 0x0F) << 12) | (self.start_index & 0x0FFF);
        out.extend_from_slice(&count_index.to_be_bytes());
        out.extend_from_slice(&self.data);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(KnxError::invalid_cemi_frame());
        }
        let count_index = u16::from_be_bytes([data[2], data[3]]);
        Ok(Self {
            object_index: data[0],
            property_id: data[1],
            count: (count_index >> 12) as u8,
            start_index: count_index & 0x0FFF,
            data: data[4..].to_vec(),
        })
    }
}

impl Apdu {
    /// 10-bit APCI of the service.
    pub const fn apci(&self) -> u16 {
        match self {
            Self::GroupValueRead => 0x0000,
            Self::GroupValueResponse(_) => 0x0040,
            Self::GroupValueWrite(_) => 0x0080,
            Self::IndividualAddressWrite(_) => 0x00C0,
            Self::IndividualAddressRead => 0x0100,
            Self::IndividualAddressResponse => 0x0140,
            Self::MemoryRead { .. } => 0x0200,
            Self::MemoryResponse { .. } => 0x0240,
            Self::MemoryWrite { .. } => 0x0280,
            Self::DeviceDescriptorRead { .. } => 0x0300,
            Self::DeviceDescriptorResponse { .. } => 0x0340,
            Self::Restart => 0x0380,
            Self::PropertyValueRead(_) => 0x03D5,
            Self::PropertyValueResponse(_) => 0x03D6,
            Self::PropertyValueWrite(_) => 0x03D7,
            Self::Secure { .. } => APCI_SECURE_SERVICE,
            Self::Unknown { apci, .. } => *apci & 0x03FF,
        }
    }

    /// Encode as TPDU octets with the given TPCI bits merged into the first octet.
    pub fn to_bytes(&self, tpci: Tpci) -> Vec<u8> {
        let apci = self.apci();
        let mut out = Vec::with_capacity(16);
        out.push(tpci.to_bits() | ((apci >> 8) as u8 & 0x03));
        out.push((apci & 0xFF) as u8);
        match self {
            Self::GroupValueRead
            | Self::IndividualAddressRead
            | Self::IndividualAddressResponse
            | Self::Restart => {}
            Self::GroupValueResponse(payload) | Self::GroupValueWrite(payload) => {
                payload.encode(&mut out);
            }
            Self::IndividualAddressWrite(ia) => out.extend_from_slice(&ia.to_wire()),
            Self::MemoryRead { count, address } => {
                out[1] |= count & 0x3F;
                out.extend_from_slice(&address.to_be_bytes());
            }
            Self::MemoryResponse {
                count,
                address,
                data,
            }
            | Self::MemoryWrite {
                count,
                address,
                data,
            } => {
                out[1] |= count & 0x3F;
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(data);
            }
            Self::DeviceDescriptorRead { descriptor } => out[1] |= descriptor & 0x3F,
            Self::DeviceDescriptorResponse { descriptor, value } => {
                out[1] |= descriptor & 0x3F;
                out.extend_from_slice(value);
            }
            Self::PropertyValueRead(property)
            | Self::PropertyValueResponse(property)
            | Self::PropertyValueWrite(property) => property.encode(&mut out),
            Self::Secure { scf, secured_data } => {
                out.push(*scf);
                out.extend_from_slice(secured_data);
            }
            Self::Unknown { data, .. } => out.extend_from_slice(data),
        }
        out
    }

    /// Decode TPDU octets (TPCI octet included, its TPCI bits ignored).
    pub fn from_bytes(tpdu: &[u8]) -> Result<Self> {
        if tpdu.len() < 2 {
            return Err(KnxError::invalid_cemi_frame());
        }
        let apci = (u16::from(tpdu[0] & 0x03) << 8) | u16::from(tpdu[1]);
        let low = tpdu[1] & 0x3F;
        let rest = &tpdu[2..];
        let memory = |rest: &[u8]| -> Result<(u16, Vec<u8>)> {
            if rest.len() < 2 {
                return Err(KnxError::invalid_cemi_frame());
            }
            Ok((u16::from_be_bytes([rest[0], rest[1]]), rest[2..].to_vec()))
        };
        let apdu = match apci & 0x03C0 {
            0x0000 => Self::GroupValueRead,
            0x0040 => Self::GroupValueResponse(Payload::decode(low, rest)),
            0x0080 => Self::GroupValueWrite(Payload::decode(low, rest)),
            0x00C0 => match rest {
                [high, low, ..] => Self::IndividualAddressWrite(IndividualAddress::from_wire([*high, *low])),
                _ => return Err(KnxError::invalid_cemi_frame()),
            },
            0x0100 => Self::IndividualAddressRead,
            0x0140 => Self::IndividualAddressResponse,
            0x0200 => {
                let (address, _) = memory(rest)?;
                Self::MemoryRead { count: low, address }
            }
            0x0240 => {
                let (address, data) = memory(rest)?;
                Self::MemoryResponse {
                    count: low,
                    address,
                    data,
                }
            }
            0x0280 => {
                let (address, data) = memory(rest)?;
                Self::MemoryWrite {
                    count: low,
                    address,
                    data,
                }
            }
            0x0300 => Self::DeviceDescriptorRead { descriptor: low },
            0x0340 => Self::DeviceDescriptorResponse {
                descriptor: low,
                value: rest.to_vec(),
            },
            0x0380 if apci == 0x0380 => Self::Restart,
            _ => match apci {
                0x03D5 => Self::PropertyValueRead(PropertyValue::decode(rest)?),
                0x03D6 => Self::PropertyValueResponse(PropertyValue::decode(rest)?),
                0x03D7 => Self::PropertyValueWrite(PropertyValue::decode(rest)?),
                APCI_SECURE_SERVICE => {
                    let (&scf, secured) = rest.split_first().ok_or_else(KnxError::invalid_cemi_frame)?;
                    Self::Secure {
                        scf,
                        secured_data: secured.to_vec(),
                    }
                }
                _ => Self::Unknown {
                    apci,
                    data: rest.to_vec(),
                },
            },
        };
        Ok(apdu)
    }

    /// Group value payload, if this is a group value write or response.
    pub fn group_value(&self) -> Option<&Payload> {
        match self {
            Self::GroupValueWrite(payload) | Self::GroupValueResponse(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Direction of a telegram relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TelegramDirection {
    /// Received from the bus
    Incoming,
    /// Submitted by the application
    #[default]
    Outgoing,
}

/// One KNX bus transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Telegram {
    /// Sender. Left at 0.0.0 for outgoing telegrams; the connection fills it in.
    pub source: IndividualAddress,
    /// Group or individual destination
    pub destination: Address,
    /// Incoming or outgoing
    pub direction: TelegramDirection,
    /// Transport layer control information
    pub tpci: Tpci,
    /// Application service; `None` for control TPDUs
    pub apdu: Option<Apdu>,
    /// `true` once the telegram passed Data Secure verification
    pub data_secure: bool,
}

impl Telegram {
    /// Outgoing telegram with the default data TPCI for `destination`.
    pub fn new(destination: impl Into<Address>, apdu: Apdu) -> Self {
        let destination = destination.into();
        Self {
            source: IndividualAddress::default(),
            destination,
            direction: TelegramDirection::Outgoing,
            tpci: Tpci::data_for(destination),
            apdu: Some(apdu),
            data_secure: false,
        }
    }

    /// A_GroupValue_Write to `destination`.
    pub fn group_write(destination: GroupAddress, payload: Payload) -> Self {
        Self::new(destination, Apdu::GroupValueWrite(payload))
    }

    /// A_GroupValue_Read to `destination`.
    pub fn group_read(destination: GroupAddress) -> Self {
        Self::new(destination, Apdu::GroupValueRead)
    }

    /// A_GroupValue_Response to `destination`.
    pub fn group_response(destination: GroupAddress, payload: Payload) -> Self {
        Self::new(destination, Apdu::GroupValueResponse(payload))
    }

    /// Transport-layer control telegram (no APDU).
    pub fn control(destination: IndividualAddress, tpci: Tpci) -> Self {
        Self {
            source: IndividualAddress::default(),
            destination: destination.into(),
            direction: TelegramDirection::Outgoing,
            tpci,
            apdu: None,
            data_secure: false,
        }
    }

    /// Group destination, if any.
    pub fn group_destination(&self) -> Option<GroupAddress> {
        match self.destination {
            Address::Group(ga) => Some(ga),
            Address::Individual(_) => None,
        }
    }

    /// Encoded TPDU (TPCI + APCI + data).
    pub fn tpdu(&self) -> Vec<u8> {
        match &self.apdu {
            Some(apdu) => apdu.to_bytes(self.tpci),
            None => vec![self.tpci.to_bits()],
        }
    }
}

impl fmt::Display for Telegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Telegram {:?} {} -> {} {:?}",
            self.direction, self.source, self.destination, self.tpci
        )?;
        if let Some(apdu) = &self.apdu {
            write!(f, " {apdu:?}")?;
        }
        write!(f, ">")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ga(text: &str) -> GroupAddress {
        text.parse().unwrap()
    }

    #[test]
    fn test_small_payload_is_packed() {
        let apdu = Apdu::GroupValueWrite(Payload::Binary(1));
        assert_eq!(apdu.to_bytes(Tpci::DataGroup), vec![0x00, 0x81]);
        assert_eq!(Apdu::from_bytes(&[0x00, 0x81]).unwrap(), apdu);
    }

    #[test]
    fn test_array_payload_follows_apci() {
        let apdu = Apdu::GroupValueResponse(Payload::Array(vec![0x0C, 0x1A]));
        let bytes = apdu.to_bytes(Tpci::DataGroup);
        assert_eq!(bytes, vec![0x00, 0x40, 0x0C, 0x1A]);
        assert_eq!(Apdu::from_bytes(&bytes).unwrap(), apdu);
    }

    #[test]
    fn test_binary_and_array_are_distinct() {
        assert_ne!(Payload::Binary(1), Payload::Array(vec![1]));
        let binary = Apdu::GroupValueWrite(Payload::Binary(1)).to_bytes(Tpci::DataGroup);
        let array = Apdu::GroupValueWrite(Payload::Array(vec![1])).to_bytes(Tpci::DataGroup);
        assert_ne!(binary, array);
    }

    #[test]
    fn test_point_to_point_services_roundtrip() {
        let services = [
            Apdu::IndividualAddressWrite(IndividualAddress::new(1, 1, 5).unwrap()),
            Apdu::IndividualAddressRead,
            Apdu::MemoryRead {
                count: 3,
                address: 0x0060,
            },
            Apdu::MemoryWrite {
                count: 2,
                address: 0x1234,
                data: vec![0xAA, 0xBB],
            },
            Apdu::DeviceDescriptorResponse {
                descriptor: 0,
                value: vec![0x07, 0xB0],
            },
            Apdu::Restart,
            Apdu::PropertyValueRead(PropertyValue {
                object_index: 0,
                property_id: 0x0F,
                count: 1,
                start_index: 1,
                data: vec![],
            }),
            Apdu::Secure {
                scf: 0x10,
                secured_data: vec![1, 2, 3],
            },
            Apdu::Unknown {
                apci: 0x03E0,
                data: vec![9],
            },
        ];
        for apdu in services {
            let bytes = apdu.to_bytes(Tpci::DataIndividual);
            assert_eq!(Apdu::from_bytes(&bytes).unwrap(), apdu);
        }
    }

    #[test]
    fn test_tpci_resolution() {
        let group = Address::Group(ga("1/2/3"));
        let broadcast = Address::Group(GroupAddress::BROADCAST);
        let device = Address::Individual(IndividualAddress::new(1, 1, 1).unwrap());
        assert_eq!(Tpci::resolve(0x00, group).unwrap(), Tpci::DataGroup);
        assert_eq!(Tpci::resolve(0x00, broadcast).unwrap(), Tpci::DataBroadcast);
        assert_eq!(Tpci::resolve(0x04, group).unwrap(), Tpci::DataTagGroup);
        assert_eq!(Tpci::resolve(0x00, device).unwrap(), Tpci::DataIndividual);
        assert_eq!(
            Tpci::resolve(0x4C, device).unwrap(),
            Tpci::DataConnected { sequence: 3 }
        );
        assert_eq!(Tpci::resolve(0x80, device).unwrap(), Tpci::Connect);
        assert_eq!(Tpci::resolve(0x81, device).unwrap(), Tpci::Disconnect);
        assert_eq!(Tpci::resolve(0xC6, device).unwrap(), Tpci::Ack { sequence: 1 });
        assert_eq!(Tpci::resolve(0xC7, device).unwrap(), Tpci::Nak { sequence: 1 });
        for tpci in [Tpci::Ack { sequence: 9 }, Tpci::DataConnected { sequence: 15 }] {
            assert_eq!(Tpci::resolve(tpci.to_bits(), device).unwrap(), tpci);
        }
    }
}
