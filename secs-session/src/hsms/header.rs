//! HSMS message header

use crate::error::{SecsError, SecsResult};
use bytes::{BufMut, BytesMut};

/// Header length in bytes
pub const HEADER_LENGTH: usize = 10;

/// Session id carried by Select, Deselect, Linktest and Separate messages
pub const CONTROL_SESSION_ID: u16 = 0xFFFF;

const W_BIT: u8 = 0x80;

/// HSMS session type (header byte 5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SType {
    Data,
    SelectReq,
    SelectRsp,
    DeselectReq,
    DeselectRsp,
    LinktestReq,
    LinktestRsp,
    RejectReq,
    SeparateReq,
}

impl SType {
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::SelectReq => 1,
            Self::SelectRsp => 2,
            Self::DeselectReq => 3,
            Self::DeselectRsp => 4,
            Self::LinktestReq => 5,
            Self::LinktestRsp => 6,
            Self::RejectReq => 7,
            Self::SeparateReq => 9,
        }
    }

    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Data),
            1 => Some(Self::SelectReq),
            2 => Some(Self::SelectRsp),
            3 => Some(Self::DeselectReq),
            4 => Some(Self::DeselectRsp),
            5 => Some(Self::LinktestReq),
            6 => Some(Self::LinktestRsp),
            7 => Some(Self::RejectReq),
            9 => Some(Self::SeparateReq),
            _ => None,
        }
    }

    /// Whether a message of this type answers a request
    pub const fn is_response(self) -> bool {
        matches!(self, Self::SelectRsp | Self::DeselectRsp | Self::LinktestRsp)
    }
}

/// Reject.req reason codes (header byte 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    STypeNotSupported = 1,
    PTypeNotSupported = 2,
    TransactionNotOpen = 3,
    EntityNotSelected = 4,
}

/// HSMS message header
///
/// | Byte | Data message | Control message |
/// |------|--------------|-----------------|
/// | 0-1 | session (device) id | session id |
/// | 2 | W-bit + stream | status / rejected SType |
/// | 3 | function | status / reason |
/// | 4 | PType (0 = SECS-II) | PType |
/// | 5 | SType = 0 | SType |
/// | 6-9 | system bytes | system bytes |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsmsHeader {
    pub session_id: u16,
    pub byte2: u8,
    pub byte3: u8,
    pub ptype: u8,
    pub stype: u8,
    pub system_bytes: u32,
}

impl HsmsHeader {
    /// Create a data message header
    pub fn data(session_id: u16, stream: u8, function: u8, reply_expected: bool, system_bytes: u32) -> Self {
        let w_bit = if reply_expected { W_BIT } else { 0 };
        Self {
            session_id,
            byte2: w_bit | (stream & 0x7F),
            byte3: function,
            ptype: 0,
            stype: SType::Data.to_byte(),
            system_bytes,
        }
    }

    /// Create a control message header
    pub fn control(session_id: u16, stype: SType, byte2: u8, byte3: u8, system_bytes: u32) -> Self {
        Self {
            session_id,
            byte2,
            byte3,
            ptype: 0,
            stype: stype.to_byte(),
            system_bytes,
        }
    }

    /// Session type, `None` if the byte is not a known SType
    pub fn message_type(&self) -> Option<SType> {
        SType::from_byte(self.stype)
    }

    pub fn is_data(&self) -> bool {
        self.stype == SType::Data.to_byte()
    }

    pub fn stream(&self) -> u8 {
        self.byte2 & 0x7F
    }

    pub fn function(&self) -> u8 {
        self.byte3
    }

    pub fn reply_expected(&self) -> bool {
        self.byte2 & W_BIT != 0
    }

    /// Encode header to bytes (big-endian)
    pub fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u16(self.session_id);
        buffer.put_u8(self.byte2);
        buffer.put_u8(self.byte3);
        buffer.put_u8(self.ptype);
        buffer.put_u8(self.stype);
        buffer.put_u32(self.system_bytes);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut bytes = [0u8; HEADER_LENGTH];
        bytes[0..2].copy_from_slice(&self.session_id.to_be_bytes());
        bytes[2] = self.byte2;
        bytes[3] = self.byte3;
        bytes[4] = self.ptype;
        bytes[5] = self.stype;
        bytes[6..10].copy_from_slice(&self.system_bytes.to_be_bytes());
        bytes
    }

    /// Decode header from bytes
    pub fn decode(data: &[u8]) -> SecsResult<Self> {
        if data.len() < HEADER_LENGTH {
            return Err(SecsError::FrameInvalid(format!(
                "HSMS header too short: expected {}, got {}",
                HEADER_LENGTH,
                data.len()
            )));
        }
        Ok(Self {
            session_id: u16::from_be_bytes([data[0], data[1]]),
            byte2: data[2],
            byte3: data[3],
            ptype: data[4],
            stype: data[5],
            system_bytes: u32::from_be_bytes([data[6], data[7], data[8], data[9]]),
        })
    }
}
