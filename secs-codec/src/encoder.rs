//! SECS-II encoder

use crate::error::{SecsError, SecsResult};
use crate::types::FormatByte;
use bytes::{BufMut, Bytes, BytesMut};
use secs_core::{Item, ItemFormat};

/// SECS-II encoder writing items into a growable buffer
pub struct SecsEncoder {
    buffer: BytesMut,
}

impl SecsEncoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Create a new encoder with initial capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Encode one item (recursively for lists)
    ///
    /// # Errors
    /// Returns `SecsError::Encoding` if an item is longer than three length
    /// bytes can express or an ASCII item holds non-ASCII characters.
    pub fn encode_item(&mut self, item: &Item) -> SecsResult<()> {
        match item {
            Item::List(items) => {
                self.encode_header(ItemFormat::List, items.len())?;
                for child in items {
                    self.encode_item(child)?;
                }
            }
            Item::Binary(v) => {
                self.encode_header(ItemFormat::Binary, v.len())?;
                self.buffer.put_slice(v);
            }
            Item::Boolean(v) => {
                self.encode_header(ItemFormat::Boolean, v.len())?;
                for b in v {
                    self.buffer.put_u8(u8::from(*b));
                }
            }
            Item::Ascii(s) => {
                if !s.is_ascii() {
                    return Err(SecsError::Encoding(format!(
                        "ASCII item contains non-ASCII characters: {:?}",
                        s
                    )));
                }
                self.encode_header(ItemFormat::Ascii, s.len())?;
                self.buffer.put_slice(s.as_bytes());
            }
            Item::I1(v) => {
                self.encode_header(ItemFormat::I1, v.len())?;
                v.iter().for_each(|x| self.buffer.put_i8(*x));
            }
            Item::I2(v) => {
                self.encode_header(ItemFormat::I2, v.len() * 2)?;
                v.iter().for_each(|x| self.buffer.put_i16(*x));
            }
            Item::I4(v) => {
                self.encode_header(ItemFormat::I4, v.len() * 4)?;
                v.iter().for_each(|x| self.buffer.put_i32(*x));
            }
            Item::I8(v) => {
                self.encode_header(ItemFormat::I8, v.len() * 8)?;
                v.iter().for_each(|x| self.buffer.put_i64(*x));
            }
            Item::U1(v) => {
                self.encode_header(ItemFormat::U1, v.len())?;
                self.buffer.put_slice(v);
            }
            Item::U2(v) => {
                self.encode_header(ItemFormat::U2, v.len() * 2)?;
                v.iter().for_each(|x| self.buffer.put_u16(*x));
            }
            Item::U4(v) => {
                self.encode_header(ItemFormat::U4, v.len() * 4)?;
                v.iter().for_each(|x| self.buffer.put_u32(*x));
            }
            Item::U8(v) => {
                self.encode_header(ItemFormat::U8, v.len() * 8)?;
                v.iter().for_each(|x| self.buffer.put_u64(*x));
            }
            Item::F4(v) => {
                self.encode_header(ItemFormat::F4, v.len() * 4)?;
                v.iter().for_each(|x| self.buffer.put_f32(*x));
            }
            Item::F8(v) => {
                self.encode_header(ItemFormat::F8, v.len() * 8)?;
                v.iter().for_each(|x| self.buffer.put_f64(*x));
            }
        }
        Ok(())
    }

    /// Write format byte and big-endian length
    fn encode_header(&mut self, format: ItemFormat, length: usize) -> SecsResult<()> {
        let header = FormatByte::for_length(format, length)?;
        self.buffer.put_u8(header.encode());
        let be = (length as u32).to_be_bytes();
        self.buffer
            .put_slice(&be[4 - header.length_bytes as usize..]);
        Ok(())
    }

    /// Get the encoded bytes
    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }

    /// Get a reference to the encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Clear the encoder buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for SecsEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a single item into a fresh buffer
pub fn encode_item(item: &Item) -> SecsResult<Vec<u8>> {
    let mut encoder = SecsEncoder::new();
    encoder.encode_item(item)?;
    Ok(encoder.into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_u4() {
        let bytes = encode_item(&Item::u4(1)).unwrap();
        assert_eq!(bytes, vec![0xB1, 0x04, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_encode_list() {
        let item = Item::list(vec![Item::ascii("OK"), Item::binary(0)]);
        let bytes = encode_item(&item).unwrap();
        assert_eq!(bytes, vec![0x01, 0x02, 0x41, 0x02, b'O', b'K', 0x21, 0x01, 0x00]);
    }

    #[test]
    fn test_encode_empty_items() {
        assert_eq!(encode_item(&Item::empty_list()).unwrap(), vec![0x01, 0x00]);
        assert_eq!(encode_item(&Item::ascii("")).unwrap(), vec![0x41, 0x00]);
        assert_eq!(encode_item(&Item::U4(vec![])).unwrap(), vec![0xB1, 0x00]);
    }

    #[test]
    fn test_encode_boolean() {
        let bytes = encode_item(&Item::Boolean(vec![true, false])).unwrap();
        assert_eq!(bytes, vec![0x25, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_encode_two_length_bytes() {
        let bytes = encode_item(&Item::ascii("x".repeat(256))).unwrap();
        assert_eq!(&bytes[..3], &[0x42, 0x01, 0x00]);
        assert_eq!(bytes.len(), 3 + 256);
    }

    #[test]
    fn test_encode_non_ascii_rejected() {
        let result = encode_item(&Item::ascii("température"));
        assert!(matches!(result, Err(SecsError::Encoding(_))));
    }

    #[test]
    fn test_encoder_reuse() {
        let mut encoder = SecsEncoder::default();
        encoder.encode_item(&Item::u1(1)).unwrap();
        assert_eq!(encoder.as_bytes(), &[0xA5, 0x01, 0x01]);
        encoder.clear();
        assert!(encoder.as_bytes().is_empty());
    }
}
