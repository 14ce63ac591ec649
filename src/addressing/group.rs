//! KNX Group Address implementation.
//!
//! Group addresses represent logical groupings of devices for functional control.
//! Three textual formats exist for the same 16-bit value:
//! - Free: a plain number (e.g., 2563)
//! - 2-level: Main/Sub (e.g., 1/515)
//! - 3-level: Main/Middle/Sub (e.g., 1/2/3) - most common
//!
//! Internally stored as 16 bits:
//! - Main: 5 bits (0-31)
//! - Middle: 3 bits (0-7)
//! - Sub: 8 bits (0-255)
//!
//! Equality and hashing only look at the raw value; the format is a display
//! concern.

use crate::error::{KnxError, Result};
use core::fmt;

/// Textual representation used when rendering a [`GroupAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GroupAddressFormat {
    /// Plain 16-bit number
    Free,
    /// Main/Sub
    TwoLevel,
    /// Main/Middle/Sub
    #[default]
    ThreeLevel,
}

/// KNX Group Address
///
/// Used for logical grouping of devices and functions.
///
/// # Examples
///
/// ```
/// use knx_engine::GroupAddress;
///
/// let addr = GroupAddress::new(1, 2, 3).unwrap();
/// assert_eq!(addr.to_string(), "1/2/3");
///
/// let addr = GroupAddress::new_2level(1, 234).unwrap();
/// assert_eq!(addr.to_string_2level(), "1/234");
///
/// let addr: GroupAddress = "1/2/3".parse().unwrap();
/// assert_eq!(u16::from(addr), 0x0A03);
///
/// let free: GroupAddress = "2563".parse().unwrap();
/// assert_eq!(free, addr);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupAddress {
    raw: u16,
}

impl GroupAddress {
    /// Maximum main group value (5 bits)
    pub const MAX_MAIN: u8 = 31;
    /// Maximum middle group value (3 bits)
    pub const MAX_MIDDLE: u8 = 7;
    /// Maximum sub group value (8 bits)
    pub const MAX_SUB: u8 = 255;
    /// Maximum sub value for 2-level format (11 bits)
    pub const MAX_SUB_2LEVEL: u16 = 2047;

    /// Broadcast destination (0/0/0)
    pub const BROADCAST: Self = Self { raw: 0 };

    /// Create a new 3-level Group Address (Main/Middle/Sub).
    ///
    /// # Errors
    ///
    /// Returns an addressing error if any component is out of range.
    pub fn new(main: u8, middle: u8, sub: u8) -> Result<Self> {
        if main > Self::MAX_MAIN || middle > Self::MAX_MIDDLE {
            return Err(KnxError::address_out_of_range());
        }
        let raw = (u16::from(main) << 11) | (u16::from(middle) << 8) | u16::from(sub);
        Ok(Self { raw })
    }

    /// Create a new 2-level Group Address (Main/Sub).
    ///
    /// # Errors
    ///
    /// Returns an addressing error if any component is out of range.
    pub fn new_2level(main: u8, sub: u16) -> Result<Self> {
        if main > Self::MAX_MAIN || sub > Self::MAX_SUB_2LEVEL {
            return Err(KnxError::address_out_of_range());
        }
        Ok(Self {
            raw: (u16::from(main) << 11) | sub,
        })
    }

    /// Create from a 3-element array `[main, middle, sub]`.
    pub fn from_array(parts: [u8; 3]) -> Result<Self> {
        Self::new(parts[0], parts[1], parts[2])
    }

    /// Parse text in one specific format.
    ///
    /// Unlike [`str::parse`], which accepts any of the three formats, this
    /// rejects text written in a different format than requested.
    pub fn parse_with_format(s: &str, format: GroupAddressFormat) -> Result<Self> {
        let levels = s.split('/').count();
        let expected = match format {
            GroupAddressFormat::Free => 1,
            GroupAddressFormat::TwoLevel => 2,
            GroupAddressFormat::ThreeLevel => 3,
        };
        if levels != expected {
            return Err(KnxError::invalid_address_format());
        }
        s.parse()
    }

    /// Get the raw u16 representation of the address.
    #[inline(always)]
    pub const fn raw(self) -> u16 {
        self.raw
    }

    /// Get the main group component (0-31).
    #[inline(always)]
    pub const fn main(self) -> u8 {
        ((self.raw >> 11) & 0x1F) as u8
    }

    /// Get the middle group component for 3-level format (0-7).
    #[inline(always)]
    pub const fn middle(self) -> u8 {
        ((self.raw >> 8) & 0x07) as u8
    }

    /// Get the sub group component for 3-level format (0-255).
    #[inline(always)]
    pub const fn sub(self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// Get the sub group component for 2-level format (0-2047).
    #[inline(always)]
    pub const fn sub_2level(self) -> u16 {
        self.raw & 0x07FF
    }

    /// `true` for the broadcast destination 0/0/0.
    #[inline(always)]
    pub const fn is_broadcast(self) -> bool {
        self.raw == 0
    }

    /// Format as 2-level string (Main/Sub).
    pub fn to_string_2level(&self) -> heapless::String<16> {
        use core::fmt::Write;
        let mut s = heapless::String::new();
        let _ = write!(s, "{}/{}", self.main(), self.sub_2level());
        s
    }

    /// Render in the requested format.
    pub fn format(&self, format: GroupAddressFormat) -> heapless::String<16> {
        use core::fmt::Write;
        let mut s = heapless::String::new();
        let _ = match format {
            GroupAddressFormat::Free => write!(s, "{}", self.raw),
            GroupAddressFormat::TwoLevel => write!(s, "{}/{}", self.main(), self.sub_2level()),
            GroupAddressFormat::ThreeLevel => write!(s, "{self}"),
        };
        s
    }

    /// Big-endian wire form.
    #[inline]
    pub const fn to_wire(self) -> [u8; 2] {
        self.raw.to_be_bytes()
    }

    /// Decode from the big-endian wire form. Any 16-bit value is valid.
    #[inline]
    pub const fn from_wire(bytes: [u8; 2]) -> Self {
        Self {
            raw: u16::from_be_bytes(bytes),
        }
    }

    /// Encode the address into a byte buffer (big-endian).
    ///
    /// # Errors
    ///
    /// Returns a transport error if buffer is shorter than 2 bytes.
    #[inline]
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < 2 {
            return Err(KnxError::buffer_too_small());
        }
        buf[0..2].copy_from_slice(&self.raw.to_be_bytes());
        Ok(2)
    }

    /// Decode an address from a byte buffer (big-endian).
    #[inline]
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(KnxError::buffer_too_small());
        }
        Ok(Self::from_wire([buf[0], buf[1]]))
    }
}

impl From<u16> for GroupAddress {
    #[inline(always)]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<GroupAddress> for u16 {
    #[inline(always)]
    fn from(addr: GroupAddress) -> u16 {
        addr.raw
    }
}

impl fmt::Display for GroupAddress {
    /// Format as 3-level address by default
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl core::str::FromStr for GroupAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let first = parse_level(parts.next())?;

        let Some(second) = parts.next() else {
            // Free format: the whole 16-bit range is valid
            return Ok(Self { raw: first });
        };
        let second = parse_level(Some(second))?;
        let main = narrow(first)?;

        match parts.next() {
            None => Self::new_2level(main, second),
            Some(sub) => {
                if parts.next().is_some() {
                    return Err(KnxError::invalid_address_format());
                }
                let sub = parse_level(Some(sub))?;
                Self::new(main, narrow(second)?, narrow(sub)?)
            }
        }
    }
}

fn parse_level(part: Option<&str>) -> Result<u16> {
    part.and_then(|p| p.trim().parse::<u16>().ok())
        .ok_or_else(KnxError::invalid_address_format)
}

fn narrow(value: u16) -> Result<u8> {
    u8::try_from(value)
        .ok()
        .ok_or_else(KnxError::address_out_of_range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_3level_valid() {
        let addr = GroupAddress::new(1, 2, 3).unwrap();
        assert_eq!(addr.main(), 1);
        assert_eq!(addr.middle(), 2);
        assert_eq!(addr.sub(), 3);
    }

    #[test]
    fn test_new_3level_invalid() {
        assert!(GroupAddress::new(32, 0, 0).is_err());
        assert!(GroupAddress::new(0, 8, 0).is_err());
    }

    #[test]
    fn test_new_2level() {
        let addr = GroupAddress::new_2level(1, 234).unwrap();
        assert_eq!(addr.main(), 1);
        assert_eq!(addr.sub_2level(), 234);
        assert!(GroupAddress::new_2level(0, 2048).is_err());
    }

    #[test]
    fn test_wire_form() {
        let addr = GroupAddress::new(1, 2, 3).unwrap();
        assert_eq!(addr.to_wire(), [0x0A, 0x03]);
        assert_eq!(GroupAddress::from_wire([0x0A, 0x03]), addr);
        assert_eq!(GroupAddress::from_wire([0xFF, 0xFF]).raw(), 0xFFFF);
    }

    #[test]
    fn test_all_formats_address_same_value() {
        let three: GroupAddress = "1/2/3".parse().unwrap();
        let two: GroupAddress = "1/515".parse().unwrap();
        let free: GroupAddress = "2563".parse().unwrap();
        assert_eq!(three, two);
        assert_eq!(three, free);
        assert_eq!(three.format(GroupAddressFormat::Free).as_str(), "2563");
        assert_eq!(three.format(GroupAddressFormat::TwoLevel).as_str(), "1/515");
        assert_eq!(three.format(GroupAddressFormat::ThreeLevel).as_str(), "1/2/3");
    }

    #[test]
    fn test_format_roundtrip_every_format() {
        for raw in [0u16, 1, 0x0A03, 0x7FFF, 0xFFFF] {
            let addr = GroupAddress::from(raw);
            for format in [
                GroupAddressFormat::Free,
                GroupAddressFormat::TwoLevel,
                GroupAddressFormat::ThreeLevel,
            ] {
                let text = addr.format(format);
                let parsed = GroupAddress::parse_with_format(&text, format).unwrap();
                assert_eq!(parsed, addr);
            }
        }
    }

    #[test]
    fn test_parse_with_wrong_format() {
        assert!(GroupAddress::parse_with_format("1/2/3", GroupAddressFormat::TwoLevel).is_err());
        assert!(GroupAddress::parse_with_format("1/2", GroupAddressFormat::Free).is_err());
    }

    #[test]
    fn test_from_str_invalid() {
        for text in ["32/0/0", "1/2/3/4", "a/b/c", "", "1/2048", "1/8/0", "1/2/256", "65536"] {
            let err = text.parse::<GroupAddress>().unwrap_err();
            assert!(err.is_invalid_address_format(), "{text}");
        }
    }
}
