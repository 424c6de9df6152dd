//! SECS-II decoder

use crate::error::{SecsError, SecsResult};
use crate::types::{FormatByte, MAX_NESTING_DEPTH};
use secs_core::{Item, ItemFormat};

/// SECS-II decoder reading items from a byte slice
pub struct SecsDecoder<'a> {
    buffer: &'a [u8],
    position: usize,
    depth: usize,
}

impl<'a> SecsDecoder<'a> {
    /// Create a new decoder
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
            depth: 0,
        }
    }

    /// Decode one item starting at the current position
    pub fn decode_item(&mut self) -> SecsResult<Item> {
        let header = FormatByte::decode(self.read_byte()?)?;
        let length = self.read_length(header.length_bytes)?;

        if header.format == ItemFormat::List {
            return self.decode_list(length);
        }

        let element_size = header.format.element_size().unwrap_or(1);
        if length % element_size != 0 {
            return Err(SecsError::Decoding(format!(
                "{} item length {} is not a multiple of {}",
                header.format.mnemonic(),
                length,
                element_size
            )));
        }
        let data = self.read_bytes(length)?;

        macro_rules! numbers {
            ($variant:ident, $ty:ty, $size:expr) => {
                Item::$variant(
                    data.chunks_exact($size)
                        .map(|chunk| {
                            let mut raw = [0u8; $size];
                            raw.copy_from_slice(chunk);
                            <$ty>::from_be_bytes(raw)
                        })
                        .collect(),
                )
            };
        }

        Ok(match header.format {
            ItemFormat::List => {
                return Err(SecsError::Decoding("List decoded as scalar".to_string()));
            }
            ItemFormat::Binary => Item::Binary(data.to_vec()),
            ItemFormat::Boolean => Item::Boolean(data.iter().map(|b| *b != 0).collect()),
            ItemFormat::Ascii => {
                if !data.is_ascii() {
                    return Err(SecsError::Decoding(
                        "ASCII item contains non-ASCII bytes".to_string(),
                    ));
                }
                Item::Ascii(data.iter().map(|b| *b as char).collect())
            }
            ItemFormat::I1 => numbers!(I1, i8, 1),
            ItemFormat::I2 => numbers!(I2, i16, 2),
            ItemFormat::I4 => numbers!(I4, i32, 4),
            ItemFormat::I8 => numbers!(I8, i64, 8),
            ItemFormat::U1 => Item::U1(data.to_vec()),
            ItemFormat::U2 => numbers!(U2, u16, 2),
            ItemFormat::U4 => numbers!(U4, u32, 4),
            ItemFormat::U8 => numbers!(U8, u64, 8),
            ItemFormat::F4 => numbers!(F4, f32, 4),
            ItemFormat::F8 => numbers!(F8, f64, 8),
        })
    }

    fn decode_list(&mut self, count: usize) -> SecsResult<Item> {
        // every child needs at least a format byte and one length byte
        if count.saturating_mul(2) > self.remaining() {
            return Err(SecsError::Decoding(format!(
                "List declares {} items but only {} bytes remain",
                count,
                self.remaining()
            )));
        }
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(SecsError::Decoding(format!(
                "List nesting deeper than {}",
                MAX_NESTING_DEPTH
            )));
        }

        self.depth += 1;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.decode_item()?);
        }
        self.depth -= 1;
        Ok(Item::List(items))
    }

    fn read_length(&mut self, length_bytes: u8) -> SecsResult<usize> {
        let raw = self.read_bytes(length_bytes as usize)?;
        Ok(raw.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize))
    }

    /// Read a single byte
    pub fn read_byte(&mut self) -> SecsResult<u8> {
        if self.position >= self.buffer.len() {
            return Err(SecsError::Decoding("Unexpected end of buffer".to_string()));
        }
        let byte = self.buffer[self.position];
        self.position += 1;
        Ok(byte)
    }

    /// Read `len` bytes
    pub fn read_bytes(&mut self, len: usize) -> SecsResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(SecsError::Decoding(format!(
                "Not enough bytes: need {}, have {}",
                len,
                self.remaining()
            )));
        }
        let bytes = &self.buffer[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    /// Get current position
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get remaining bytes
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }
}

/// Decode exactly one item; trailing bytes are an error
pub fn decode_item(bytes: &[u8]) -> SecsResult<Item> {
    let mut decoder = SecsDecoder::new(bytes);
    let item = decoder.decode_item()?;
    if decoder.remaining() != 0 {
        return Err(SecsError::Decoding(format!(
            "{} trailing bytes after item",
            decoder.remaining()
        )));
    }
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::encode_item;

    fn round_trip(item: Item) {
        let bytes = encode_item(&item).unwrap();
        assert_eq!(decode_item(&bytes).unwrap(), item, "round trip of {}", item);
    }

    #[test]
    fn test_decode_u4() {
        let item = decode_item(&[0xB1, 0x04, 0x00, 0x00, 0x27, 0x11]).unwrap();
        assert_eq!(item, Item::u4(10001));
    }

    #[test]
    fn test_decode_boolean_nonzero_is_true() {
        let item = decode_item(&[0x25, 0x02, 0x00, 0x07]).unwrap();
        assert_eq!(item, Item::Boolean(vec![false, true]));
    }

    #[test]
    fn test_round_trip_integer_boundaries() {
        round_trip(Item::I1(vec![0, i8::MIN, i8::MAX]));
        round_trip(Item::I2(vec![0, i16::MIN, i16::MAX]));
        round_trip(Item::I4(vec![0, i32::MIN, i32::MAX]));
        round_trip(Item::I8(vec![0, i64::MIN, i64::MAX]));
        round_trip(Item::U1(vec![0, u8::MAX]));
        round_trip(Item::U2(vec![0, u16::MAX]));
        round_trip(Item::U4(vec![0, u32::MAX]));
        round_trip(Item::U8(vec![0, u64::MAX]));
    }

    #[test]
    fn test_round_trip_float_boundaries() {
        round_trip(Item::F4(vec![0.0, f32::MIN, f32::MAX, f32::MIN_POSITIVE]));
        round_trip(Item::F8(vec![0.0, f64::MIN, f64::MAX, -1.5]));
    }

    #[test]
    fn test_round_trip_empty_and_long() {
        round_trip(Item::ascii(""));
        round_trip(Item::Binary(vec![]));
        round_trip(Item::Boolean(vec![]));
        round_trip(Item::empty_list());
        round_trip(Item::ascii("a".repeat(255)));
        round_trip(Item::ascii("b".repeat(256)));
        round_trip(Item::ascii("c".repeat(70_000)));
    }

    #[test]
    fn test_round_trip_nested_list() {
        round_trip(Item::list(vec![
            Item::u4(1),
            Item::list(vec![Item::u4(10001), Item::list(vec![])]),
            Item::boolean(true),
            Item::binary(0x80),
        ]));
    }

    #[test]
    fn test_decode_rejects_zero_length_bytes() {
        assert!(matches!(decode_item(&[0x40]), Err(SecsError::Decoding(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_data() {
        let result = decode_item(&[0xB1, 0x04, 0x00, 0x00]);
        assert!(matches!(result, Err(SecsError::Decoding(_))));
    }

    #[test]
    fn test_decode_rejects_misaligned_length() {
        let result = decode_item(&[0xB1, 0x03, 0x00, 0x00, 0x01]);
        assert!(matches!(result, Err(SecsError::Decoding(_))));
    }

    #[test]
    fn test_decode_rejects_implausible_list_count() {
        let result = decode_item(&[0x03, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(SecsError::Decoding(_))));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let result = decode_item(&[0xA5, 0x01, 0x01, 0x00]);
        assert!(matches!(result, Err(SecsError::Decoding(_))));
    }

    #[test]
    fn test_decode_rejects_deep_nesting() {
        let mut bytes = Vec::new();
        for _ in 0..=MAX_NESTING_DEPTH {
            bytes.extend_from_slice(&[0x01, 0x01]);
        }
        bytes.extend_from_slice(&[0x01, 0x00]);
        assert!(matches!(decode_item(&bytes), Err(SecsError::Decoding(_))));
    }

    #[test]
    fn test_decoder_position() {
        let bytes = [0xA5, 0x01, 0x07, 0xA5, 0x01, 0x08];
        let mut decoder = SecsDecoder::new(&bytes);
        assert_eq!(decoder.decode_item().unwrap(), Item::u1(7));
        assert_eq!(decoder.position(), 3);
        assert_eq!(decoder.remaining(), 3);
    }
}
