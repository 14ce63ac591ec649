//! KNX addressing system.
//!
//! KNX uses two types of addresses:
//! - Individual addresses for physical devices (Area.Line.Device)
//! - Group addresses for logical grouping (Main/Middle/Sub, Main/Sub or free)
//!
//! Both are 16-bit values on the wire; the cEMI control field tells which one
//! a destination is. [`Address`] carries that discriminant.

pub mod filter;
pub mod group;
pub mod individual;

pub use filter::AddressFilter;
pub use group::{GroupAddress, GroupAddressFormat};
pub use individual::IndividualAddress;

use crate::error::{KnxError, Result};
use core::fmt;

/// Individual or group address.
///
/// Two addresses are equal only if both the kind and the raw value match, so
/// `1.0.3` (0x1003) never equals group `2/0/3` (0x1003).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Address {
    /// Physical device address
    Individual(IndividualAddress),
    /// Logical group address
    Group(GroupAddress),
}

impl Address {
    /// Big-endian wire form, without the kind discriminant.
    pub const fn to_wire(self) -> [u8; 2] {
        match self {
            Self::Individual(ia) => ia.to_wire(),
            Self::Group(ga) => ga.to_wire(),
        }
    }

    /// Decode 2 wire bytes; `is_group` comes from the cEMI address-type flag.
    pub const fn from_wire(bytes: [u8; 2], is_group: bool) -> Self {
        if is_group {
            Self::Group(GroupAddress::from_wire(bytes))
        } else {
            Self::Individual(IndividualAddress::from_wire(bytes))
        }
    }

    /// Raw 16-bit value.
    pub const fn raw(self) -> u16 {
        match self {
            Self::Individual(ia) => ia.raw(),
            Self::Group(ga) => ga.raw(),
        }
    }

    /// `true` for group destinations.
    pub const fn is_group(self) -> bool {
        matches!(self, Self::Group(_))
    }
}

impl From<IndividualAddress> for Address {
    fn from(addr: IndividualAddress) -> Self {
        Self::Individual(addr)
    }
}

impl From<GroupAddress> for Address {
    fn from(addr: GroupAddress) -> Self {
        Self::Group(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Individual(ia) => ia.fmt(f),
            Self::Group(ga) => ga.fmt(f),
        }
    }
}

/// Input accepted by [`parse_address`].
#[derive(Debug, Clone, Copy)]
pub enum AddressInput<'a> {
    /// Textual address
    Text(&'a str),
    /// Raw integer, always interpreted as a group address
    Raw(u32),
}

impl<'a> From<&'a str> for AddressInput<'a> {
    fn from(text: &'a str) -> Self {
        Self::Text(text)
    }
}

impl From<u16> for AddressInput<'_> {
    fn from(raw: u16) -> Self {
        Self::Raw(raw.into())
    }
}

impl From<u32> for AddressInput<'_> {
    fn from(raw: u32) -> Self {
        Self::Raw(raw)
    }
}

/// Parse an address from text or an integer.
///
/// Text containing `.` is an individual address; anything else is a group
/// address that must be written in `format` (free text is only accepted for
/// [`GroupAddressFormat::Free`]). Integers are raw group addresses and must
/// fit in 16 bits.
///
/// ```
/// use knx_engine::addressing::{parse_address, Address, GroupAddressFormat};
///
/// let addr = parse_address("1/2/3", GroupAddressFormat::ThreeLevel).unwrap();
/// assert!(matches!(addr, Address::Group(_)));
/// assert!(parse_address("1/2/3", GroupAddressFormat::TwoLevel).is_err());
/// assert!(parse_address(70_000u32, GroupAddressFormat::Free).is_err());
/// ```
pub fn parse_address<'a>(
    input: impl Into<AddressInput<'a>>,
    format: GroupAddressFormat,
) -> Result<Address> {
    match input.into() {
        AddressInput::Raw(raw) => u16::try_from(raw)
            .ok()
            .map(|raw| Address::Group(GroupAddress::from(raw)))
            .ok_or_else(KnxError::invalid_address_format),
        AddressInput::Text(text) if text.contains('.') => {
            text.parse::<IndividualAddress>().map(Address::Individual)
        }
        AddressInput::Text(text) => {
            GroupAddress::parse_with_format(text, format).map(Address::Group)
        }
    }
}
