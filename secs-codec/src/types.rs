//! SECS-II format byte

use crate::error::{SecsError, SecsResult};
use secs_core::ItemFormat;

/// Largest length expressible with three length bytes
pub const MAX_ITEM_LENGTH: usize = 0x00FF_FFFF;

/// Deepest list nesting accepted by the decoder
pub const MAX_NESTING_DEPTH: usize = 64;

/// Decoded format byte: item format plus number of length bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatByte {
    pub format: ItemFormat,
    pub length_bytes: u8,
}

impl FormatByte {
    /// Smallest header able to carry `length`
    pub fn for_length(format: ItemFormat, length: usize) -> SecsResult<Self> {
        let length_bytes = match length {
            0..=0xFF => 1,
            0x100..=0xFFFF => 2,
            0x1_0000..=MAX_ITEM_LENGTH => 3,
            _ => {
                return Err(SecsError::Encoding(format!(
                    "Item length {} exceeds maximum {}",
                    length, MAX_ITEM_LENGTH
                )));
            }
        };
        Ok(Self {
            format,
            length_bytes,
        })
    }

    pub fn encode(&self) -> u8 {
        (self.format.code() << 2) | self.length_bytes
    }

    pub fn decode(byte: u8) -> SecsResult<Self> {
        let length_bytes = byte & 0x03;
        if length_bytes == 0 {
            return Err(SecsError::Decoding(format!(
                "Format byte 0x{:02X} declares zero length bytes",
                byte
            )));
        }
        Ok(Self {
            format: ItemFormat::from_code(byte >> 2)?,
            length_bytes,
        })
    }
}
