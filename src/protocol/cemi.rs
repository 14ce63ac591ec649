//! Common External Message Interface (cEMI) implementation.
//!
//! cEMI is the link-layer frame carried inside tunnelling requests, routing
//! indications and device configuration requests. The message code selects
//! the layout of the rest of the frame.
//!
//! ## L_Data Frame Structure
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Message Code (1 byte)                    │
//! ├──────────────────────────────────────────┤
//! │ Additional Info Length (1 byte)          │
//! ├──────────────────────────────────────────┤
//! │ Additional Info (variable)               │
//! ├──────────────────────────────────────────┤
//! │ Service Information (L_Data)             │
//! │  ├─ Control Field 1 (1 byte)             │
//! │  ├─ Control Field 2 (1 byte)             │
//! │  ├─ Source Address (2 bytes)             │
//! │  ├─ Destination Address (2 bytes)        │
//! │  ├─ NPDU Length (1 byte)                 │
//! │  ├─ TPCI/APCI (1-2 bytes)                │
//! │  └─ Data (variable)                      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Property frames (`M_Prop*`) and reset frames (`M_Reset*`) carry no
//! additional info block.
//!
//! ## Example
//!
//! ```rust
//! use knx_engine::protocol::cemi::{CemiFrame, CemiMessageCode};
//! use knx_engine::telegram::{Payload, Telegram};
//!
//! let telegram = Telegram::group_write("1/2/3".parse().unwrap(), Payload::Binary(1));
//! let frame = CemiFrame::from_telegram(&telegram, CemiMessageCode::LDataReq, None);
//! let bytes = frame.to_bytes();
//! assert_eq!(bytes[0], 0x11);
//!
//! let decoded = CemiFrame::parse(&bytes).unwrap();
//! assert_eq!(decoded.telegram().unwrap().destination, telegram.destination);
//! ```

use crate::addressing::{Address, IndividualAddress};
use crate::error::{KnxError, Result};
use crate::telegram::{Apdu, Telegram, TelegramDirection, Tpci};

/// cEMI message codes handled by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CemiMessageCode {
    /// `L_Data.req`
    LDataReq = 0x11,
    /// `L_Data.con`
    LDataCon = 0x2E,
    /// `L_Data.ind`
    LDataInd = 0x29,
    /// `M_PropRead.req`
    MPropReadReq = 0xFC,
    /// `M_PropRead.con`
    MPropReadCon = 0xFB,
    /// `M_PropWrite.req`
    MPropWriteReq = 0xF6,
    /// `M_PropWrite.con`
    MPropWriteCon = 0xF5,
    /// `M_PropInfo.ind`
    MPropInfoInd = 0xF7,
    /// `M_Reset.req`
    MResetReq = 0xF1,
    /// `M_Reset.ind`
    MResetInd = 0xF0,
}

impl CemiMessageCode {
    /// Convert from u8 value
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x11 => Self::LDataReq,
            0x2E => Self::LDataCon,
            0x29 => Self::LDataInd,
            0xFC => Self::MPropReadReq,
            0xFB => Self::MPropReadCon,
            0xF6 => Self::MPropWriteReq,
            0xF5 => Self::MPropWriteCon,
            0xF7 => Self::MPropInfoInd,
            0xF1 => Self::MResetReq,
            0xF0 => Self::MResetInd,
            _ => return None,
        })
    }

    /// `true` for the data link layer codes.
    pub const fn is_ldata(self) -> bool {
        matches!(self, Self::LDataReq | Self::LDataCon | Self::LDataInd)
    }

    const fn is_reset(self) -> bool {
        matches!(self, Self::MResetReq | Self::MResetInd)
    }
}

/// Frame priority, bits 3-2 of control field 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Priority {
    /// System priority (management)
    System = 0,
    /// Normal priority
    Normal = 1,
    /// Urgent priority
    Urgent = 2,
    /// Low priority
    Low = 3,
}

impl Priority {
    const fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::System,
            1 => Self::Normal,
            2 => Self::Urgent,
            _ => Self::Low,
        }
    }
}

/// Control Field 1 of an `L_Data` frame
///
/// ```text
/// Bit 7: Frame Type (0=extended, 1=standard)
/// Bit 5: Repeat (0=repeat, 1=do not repeat)
/// Bit 4: Broadcast (0=system broadcast, 1=broadcast)
/// Bit 3-2: Priority (00=system, 01=normal, 10=urgent, 11=low)
/// Bit 1: Acknowledge Request
/// Bit 0: Confirm (0=no error, 1=error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControlField1 {
    raw: u8,
}

impl From<u8> for ControlField1 {
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl ControlField1 {
    /// Raw byte value
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Standard (not extended) frame
    pub const fn is_standard_frame(self) -> bool {
        self.raw & 0x80 != 0
    }

    /// Repetitions on the bus are suppressed
    pub const fn do_not_repeat(self) -> bool {
        self.raw & 0x20 != 0
    }

    /// Normal broadcast rather than system broadcast
    pub const fn is_broadcast(self) -> bool {
        self.raw & 0x10 != 0
    }

    /// Frame priority
    pub const fn priority(self) -> Priority {
        Priority::from_bits(self.raw >> 2)
    }

    /// Layer 2 acknowledge requested
    pub const fn ack_requested(self) -> bool {
        self.raw & 0x02 != 0
    }

    /// Confirmation carries an error (`L_Data.con` only)
    pub const fn confirm_error(self) -> bool {
        self.raw & 0x01 != 0
    }

    /// Same field with another priority.
    pub const fn with_priority(self, priority: Priority) -> Self {
        Self {
            raw: (self.raw & !0x0C) | ((priority as u8) << 2),
        }
    }

    /// Same field with the confirm error bit set or cleared.
    pub const fn with_confirm_error(self, error: bool) -> Self {
        Self {
            raw: if error { self.raw | 0x01 } else { self.raw & !0x01 },
        }
    }

    /// Standard frame, do not repeat, broadcast, no ack request.
    pub const fn standard(priority: Priority) -> Self {
        Self { raw: 0xB0 }.with_priority(priority)
    }
}

/// Control Field 2 of an `L_Data` frame
///
/// ```text
/// Bit 7: Destination Address Type (0=individual, 1=group)
/// Bit 6-4: Hop Count (0-7)
/// Bit 3-0: Extended Frame Format (0000=standard)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControlField2 {
    raw: u8,
}

impl From<u8> for ControlField2 {
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl ControlField2 {
    /// Hop count used for frames originating here
    pub const DEFAULT_HOP_COUNT: u8 = 6;

    /// Raw byte value
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Destination is a group address
    pub const fn is_group_address(self) -> bool {
        self.raw & 0x80 != 0
    }

    /// Hop count (0-7)
    pub const fn hop_count(self) -> u8 {
        (self.raw >> 4) & 0x07
    }

    /// Extended frame format
    pub const fn extended_format(self) -> u8 {
        self.raw & 0x0F
    }

    /// Build from its parts.
    pub const fn new(is_group: bool, hop_count: u8, extended_format: u8) -> Self {
        let group = if is_group { 0x80 } else { 0x00 };
        Self {
            raw: group | ((hop_count & 0x07) << 4) | (extended_format & 0x0F),
        }
    }

    const fn with_group(self, is_group: bool) -> Self {
        Self::new(is_group, self.hop_count(), self.extended_format())
    }
}

/// One entry of the additional info block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalInfo {
    /// Type identifier
    pub info_type: u8,
    /// Type specific data
    pub data: Vec<u8>,
}

impl AdditionalInfo {
    fn parse_block(block: &[u8]) -> Result<Vec<Self>> {
        let mut entries = Vec::new();
        let mut rest = block;
        while let [info_type, len, tail @ ..] = rest {
            let len = usize::from(*len);
            let data = tail.get(..len).ok_or_else(KnxError::invalid_cemi_frame)?;
            entries.push(Self {
                info_type: *info_type,
                data: data.to_vec(),
            });
            rest = &tail[len..];
        }
        if rest.is_empty() {
            Ok(entries)
        } else {
            Err(KnxError::invalid_cemi_frame())
        }
    }

    fn encode_block(entries: &[Self], out: &mut Vec<u8>) {
        let start = out.len();
        out.push(0);
        for entry in entries {
            out.push(entry.info_type);
            out.push(entry.data.len() as u8);
            out.extend_from_slice(&entry.data);
        }
        out[start] = (out.len() - start - 1) as u8;
    }
}

/// Service information of an `L_Data` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LData {
    /// Control field 1
    pub control1: ControlField1,
    /// Control field 2; the address type bit follows `destination`
    pub control2: ControlField2,
    /// Sender
    pub source: IndividualAddress,
    /// Receiver
    pub destination: Address,
    /// Transport layer control information
    pub tpci: Tpci,
    /// Application service; `None` for control TPDUs
    pub apdu: Option<Apdu>,
}

impl LData {
    /// Fixed part: ctrl1, ctrl2, source, destination, NPDU length, TPCI
    const MIN_SIZE: usize = 8;

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(KnxError::invalid_cemi_frame());
        }
        let control1 = ControlField1::from(data[0]);
        let control2 = ControlField2::from(data[1]);
        let source = IndividualAddress::from_wire([data[2], data[3]]);
        let destination = Address::from_wire([data[4], data[5]], control2.is_group_address());
        let npdu_length = usize::from(data[6]);
        let tpdu = &data[7..];
        // The TPCI octet is not counted in the NPDU length.
        if tpdu.len() != npdu_length + 1 {
            return Err(KnxError::invalid_cemi_frame());
        }
        let tpci = Tpci::resolve(tpdu[0], destination)?;
        let apdu = if tpci.is_control() {
            if npdu_length != 0 {
                return Err(KnxError::invalid_cemi_frame());
            }
            None
        } else {
            Some(Apdu::from_bytes(tpdu)?)
        };
        Ok(Self {
            control1,
            control2,
            source,
            destination,
            tpci,
            apdu,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let tpdu = match &self.apdu {
            Some(apdu) => apdu.to_bytes(self.tpci),
            None => vec![self.tpci.to_bits()],
        };
        out.push(self.control1.raw());
        out.push(self.control2.with_group(self.destination.is_group()).raw());
        out.extend_from_slice(&self.source.to_wire());
        out.extend_from_slice(&self.destination.to_wire());
        out.push((tpdu.len() - 1) as u8);
        out.extend_from_slice(&tpdu);
    }
}

/// Property addressing of an `M_Prop*` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PropertyInfo {
    /// Interface object type
    pub object_type: u16,
    /// Object instance (1-based)
    pub object_instance: u8,
    /// Property identifier
    pub property_id: u8,
    /// Number of elements (0-15); 0 in a confirmation signals an error
    pub number_of_elements: u8,
    /// Start index (0-4095)
    pub start_index: u16,
}

impl PropertyInfo {
    const SIZE: usize = 6;

    fn parse(data: &[u8]) -> Result<Self> {
        match data {
            [t0, t1, instance, pid, n0, n1, ..] => {
                let count_index = u16::from_be_bytes([*n0, *n1]);
                Ok(Self {
                    object_type: u16::from_be_bytes([*t0, *t1]),
                    object_instance: *instance,
                    property_id: *pid,
                    number_of_elements: (count_index >> 12) as u8,
                    start_index: count_index & 0x0FFF,
                })
            }
            _ => Err(KnxError::invalid_cemi_frame()),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.object_type.to_be_bytes());
        out.push(self.object_instance);
        out.push(self.property_id);
        let count_index =
            (u16::from(self.number_of_elements & 0x0F) << 12) | (self.start_index & 0x0FFF);
        out.extend_from_slice(&count_index.to_be_bytes());
    }
}

/// Body of an `M_Prop*` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyFrame {
    /// Property addressing
    pub info: PropertyInfo,
    /// Element data, or a single error code in a failed confirmation
    pub data: Vec<u8>,
}

impl PropertyFrame {
    /// Error code of a negative confirmation.
    pub fn error_code(&self) -> Option<u8> {
        (self.info.number_of_elements == 0)
            .then(|| self.data.first().copied())
            .flatten()
    }

    fn parse(code: CemiMessageCode, data: &[u8]) -> Result<Self> {
        let info = PropertyInfo::parse(data)?;
        let rest = &data[PropertyInfo::SIZE..];
        let valid = match code {
            CemiMessageCode::MPropReadReq => rest.is_empty(),
            CemiMessageCode::MPropReadCon | CemiMessageCode::MPropWriteCon
                if info.number_of_elements == 0 =>
            {
                rest.len() == 1
            }
            CemiMessageCode::MPropWriteCon => rest.is_empty(),
            _ => !rest.is_empty(),
        };
        if !valid {
            return Err(KnxError::invalid_cemi_frame());
        }
        Ok(Self {
            info,
            data: rest.to_vec(),
        })
    }
}

/// Message-code specific part of a cEMI frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CemiData {
    /// `L_Data.req`, `.con`, `.ind`
    LData(LData),
    /// `M_Prop*`
    Property(PropertyFrame),
    /// `M_Reset.req`, `.ind`
    Reset,
}

/// A decoded cEMI frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CemiFrame {
    /// Message code; selects the variant of `data`
    pub code: CemiMessageCode,
    /// Additional info entries (`L_Data` only)
    pub additional_info: Vec<AdditionalInfo>,
    /// Service information
    pub data: CemiData,
}

impl CemiFrame {
    /// Parse a cEMI frame.
    ///
    /// # Errors
    ///
    /// `UnsupportedMessageCode` for codes outside [`CemiMessageCode`];
    /// `InvalidCemiFrame` when a length field disagrees with the data or a
    /// TPDU cannot be decoded.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (&raw_code, rest) = data.split_first().ok_or_else(KnxError::invalid_cemi_frame)?;
        let code = CemiMessageCode::from_u8(raw_code)
            .ok_or_else(|| KnxError::unsupported_message_code(raw_code))?;
        if code.is_reset() {
            return Ok(Self {
                code,
                additional_info: Vec::new(),
                data: CemiData::Reset,
            });
        }
        if !code.is_ldata() {
            return Ok(Self {
                code,
                additional_info: Vec::new(),
                data: CemiData::Property(PropertyFrame::parse(code, rest)?),
            });
        }
        let (&info_len, rest) = rest.split_first().ok_or_else(KnxError::invalid_cemi_frame)?;
        let info_len = usize::from(info_len);
        let block = rest.get(..info_len).ok_or_else(KnxError::invalid_cemi_frame)?;
        Ok(Self {
            code,
            additional_info: AdditionalInfo::parse_block(block)?,
            data: CemiData::LData(LData::parse(&rest[info_len..])?),
        })
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.push(self.code as u8);
        match &self.data {
            CemiData::LData(ldata) => {
                AdditionalInfo::encode_block(&self.additional_info, &mut out);
                ldata.encode(&mut out);
            }
            CemiData::Property(property) => {
                property.info.encode(&mut out);
                out.extend_from_slice(&property.data);
            }
            CemiData::Reset => {}
        }
        out
    }

    /// Build an `L_Data` frame for `telegram`.
    ///
    /// Point-to-point and broadcast frames get system priority, group frames
    /// normal priority. `source` overrides the telegram's source address.
    pub fn from_telegram(
        telegram: &Telegram,
        code: CemiMessageCode,
        source: Option<IndividualAddress>,
    ) -> Self {
        let priority = match telegram.destination {
            Address::Group(ga) if !ga.is_broadcast() => Priority::Normal,
            _ => Priority::System,
        };
        Self {
            code,
            additional_info: Vec::new(),
            data: CemiData::LData(LData {
                control1: ControlField1::standard(priority),
                control2: ControlField2::new(
                    telegram.destination.is_group(),
                    ControlField2::DEFAULT_HOP_COUNT,
                    0,
                ),
                source: source.unwrap_or(telegram.source),
                destination: telegram.destination,
                tpci: telegram.tpci,
                apdu: telegram.apdu.clone(),
            }),
        }
    }

    /// `L_Data` service information, if any.
    pub fn ldata(&self) -> Option<&LData> {
        match &self.data {
            CemiData::LData(ldata) => Some(ldata),
            _ => None,
        }
    }

    /// Mutable `L_Data` service information, if any.
    pub fn ldata_mut(&mut self) -> Option<&mut LData> {
        match &mut self.data {
            CemiData::LData(ldata) => Some(ldata),
            _ => None,
        }
    }

    /// Telegram carried by an `L_Data` frame.
    ///
    /// Indications are incoming, requests and confirmations outgoing.
    pub fn telegram(&self) -> Result<Telegram> {
        let ldata = self.ldata().ok_or_else(KnxError::invalid_cemi_frame)?;
        let direction = if self.code == CemiMessageCode::LDataInd {
            TelegramDirection::Incoming
        } else {
            TelegramDirection::Outgoing
        };
        Ok(Telegram {
            source: ldata.source,
            destination: ldata.destination,
            direction,
            tpci: ldata.tpci,
            apdu: ldata.apdu.clone(),
            data_secure: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::GroupAddress;
    use crate::telegram::Payload;

    #[test]
    fn test_control_field1() {
        let ctrl = ControlField1::standard(Priority::Normal);
        assert_eq!(ctrl.raw(), 0xB4);
        assert!(ctrl.is_standard_frame());
        assert!(ctrl.do_not_repeat());
        assert!(ctrl.is_broadcast());
        assert_eq!(ctrl.priority(), Priority::Normal);
        assert!(!ctrl.ack_requested());
        assert!(!ctrl.confirm_error());
        assert!(ctrl.with_confirm_error(true).confirm_error());
    }

    #[test]
    fn test_control_field1_raw() {
        let ctrl = ControlField1::from(0xBCu8);
        assert!(ctrl.do_not_repeat());
        assert_eq!(ctrl.priority(), Priority::Low);
    }

    #[test]
    fn test_control_field2() {
        let ctrl = ControlField2::new(true, 6, 0);
        assert_eq!(ctrl.raw(), 0xE0);
        assert!(ctrl.is_group_address());
        assert_eq!(ctrl.hop_count(), 6);
        assert!(!ControlField2::new(false, 5, 0).is_group_address());
    }

    #[test]
    fn test_parse_group_write_indication() {
        let data = [
            0x29, 0x00, 0xBC, 0xE0, 0x11, 0x01, 0x0A, 0x03, 0x01, 0x00, 0x81,
        ];
        let frame = CemiFrame::parse(&data).unwrap();
        assert_eq!(frame.code, CemiMessageCode::LDataInd);
        let telegram = frame.telegram().unwrap();
        assert_eq!(telegram.direction, TelegramDirection::Incoming);
        assert_eq!(telegram.source, IndividualAddress::new(1, 1, 1).unwrap());
        assert_eq!(
            telegram.destination,
            Address::Group(GroupAddress::new(1, 2, 3).unwrap())
        );
        assert_eq!(telegram.apdu, Some(Apdu::GroupValueWrite(Payload::Binary(1))));
        assert_eq!(frame.to_bytes(), data);
    }

    #[test]
    fn test_routing_indication_cemi_with_array_payload() {
        let data = [
            0x29, 0x00, 0xBC, 0xD0, 0x12, 0x02, 0x01, 0x51, 0x02, 0x00, 0x40, 0xF0,
        ];
        let frame = CemiFrame::parse(&data).unwrap();
        let ldata = frame.ldata().unwrap();
        assert_eq!(ldata.control2.hop_count(), 5);
        assert_eq!(
            ldata.apdu,
            Some(Apdu::GroupValueResponse(Payload::Array(vec![0xF0])))
        );
        assert_eq!(frame.to_bytes(), data);
    }

    #[test]
    fn test_additional_info_preserved() {
        let data = [
            0x29, 0x04, 0x03, 0x02, 0xAA, 0xBB, 0xBC, 0xE0, 0x11, 0x01, 0x0A, 0x03, 0x01, 0x00,
            0x80,
        ];
        let frame = CemiFrame::parse(&data).unwrap();
        assert_eq!(
            frame.additional_info,
            vec![AdditionalInfo {
                info_type: 0x03,
                data: vec![0xAA, 0xBB]
            }]
        );
        assert_eq!(frame.to_bytes(), data);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let data = [0x29, 0x00, 0xBC, 0xE0, 0x11, 0x01, 0x0A, 0x03, 0x02, 0x00, 0x80];
        let err = CemiFrame::parse(&data).unwrap_err();
        assert!(matches!(err, KnxError::Protocol(ref e) if e.is_invalid_cemi_frame()));
    }

    #[test]
    fn test_unknown_message_code() {
        assert!(CemiFrame::parse(&[0x2B, 0x00]).is_err());
        assert!(CemiFrame::parse(&[]).is_err());
    }

    #[test]
    fn test_default_flags_from_telegram() {
        let group = Telegram::group_read(GroupAddress::new(1, 2, 3).unwrap());
        let frame = CemiFrame::from_telegram(&group, CemiMessageCode::LDataReq, None);
        let ldata = frame.ldata().unwrap();
        assert_eq!(ldata.control1.priority(), Priority::Normal);
        assert_eq!(ldata.control2.raw(), 0xE0);

        let p2p = Telegram::new(IndividualAddress::new(1, 1, 5).unwrap(), Apdu::Restart);
        let source = IndividualAddress::new(1, 1, 250).unwrap();
        let frame = CemiFrame::from_telegram(&p2p, CemiMessageCode::LDataReq, Some(source));
        let ldata = frame.ldata().unwrap();
        assert_eq!(ldata.control1.priority(), Priority::System);
        assert!(!ldata.control2.is_group_address());
        assert_eq!(ldata.source, source);
    }

    #[test]
    fn test_control_tpdu() {
        let telegram = Telegram::control(IndividualAddress::new(1, 1, 5).unwrap(), Tpci::Connect);
        let bytes = CemiFrame::from_telegram(&telegram, CemiMessageCode::LDataReq, None).to_bytes();
        assert_eq!(&bytes[8..], &[0x00, 0x80]);
        let decoded = CemiFrame::parse(&bytes).unwrap().telegram().unwrap();
        assert_eq!(decoded.tpci, Tpci::Connect);
        assert_eq!(decoded.apdu, None);
    }

    #[test]
    fn test_property_frames() {
        let read = [0xFC, 0x00, 0x08, 0x01, 0x34, 0x10, 0x01];
        let frame = CemiFrame::parse(&read).unwrap();
        let CemiData::Property(property) = &frame.data else {
            panic!("expected property frame");
        };
        assert_eq!(property.info.object_type, 0x0008);
        assert_eq!(property.info.property_id, 0x34);
        assert_eq!(property.info.number_of_elements, 1);
        assert_eq!(frame.to_bytes(), read);

        let failed = [0xF5, 0x00, 0x08, 0x01, 0x34, 0x00, 0x01, 0x07];
        let CemiData::Property(property) = CemiFrame::parse(&failed).unwrap().data else {
            panic!("expected property frame");
        };
        assert_eq!(property.error_code(), Some(0x07));

        assert!(CemiFrame::parse(&[0xFC, 0x00, 0x08, 0x01, 0x34, 0x10, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_reset() {
        let frame = CemiFrame::parse(&[0xF1]).unwrap();
        assert_eq!(frame.data, CemiData::Reset);
        assert_eq!(frame.to_bytes(), [0xF1]);
    }
}
