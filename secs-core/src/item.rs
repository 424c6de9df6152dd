//! SECS-II data items
//!
//! An [`Item`] is one node of a SECS-II message body: either a list of
//! nested items or an array of scalar values of a single format.

use crate::error::{SecsError, SecsResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SECS-II item format codes (6-bit, octal in SEMI E5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemFormat {
    List,
    Binary,
    Boolean,
    Ascii,
    I8,
    I1,
    I2,
    I4,
    F8,
    F4,
    U8,
    U1,
    U2,
    U4,
}

impl ItemFormat {
    /// 6-bit format code as carried in the upper bits of the format byte
    pub const fn code(self) -> u8 {
        match self {
            Self::List => 0o00,
            Self::Binary => 0o10,
            Self::Boolean => 0o11,
            Self::Ascii => 0o20,
            Self::I8 => 0o30,
            Self::I1 => 0o31,
            Self::I2 => 0o32,
            Self::I4 => 0o34,
            Self::F8 => 0o40,
            Self::F4 => 0o44,
            Self::U8 => 0o50,
            Self::U1 => 0o51,
            Self::U2 => 0o52,
            Self::U4 => 0o54,
        }
    }

    /// Get format from a 6-bit format code
    pub fn from_code(code: u8) -> SecsResult<Self> {
        Ok(match code {
            0o00 => Self::List,
            0o10 => Self::Binary,
            0o11 => Self::Boolean,
            0o20 => Self::Ascii,
            0o30 => Self::I8,
            0o31 => Self::I1,
            0o32 => Self::I2,
            0o34 => Self::I4,
            0o40 => Self::F8,
            0o44 => Self::F4,
            0o50 => Self::U8,
            0o51 => Self::U1,
            0o52 => Self::U2,
            0o54 => Self::U4,
            other => {
                return Err(SecsError::Decoding(format!(
                    "Unknown SECS-II format code: 0o{:02o}",
                    other
                )));
            }
        })
    }

    /// Size in bytes of one element, `None` for lists
    pub const fn element_size(self) -> Option<usize> {
        match self {
            Self::List => None,
            Self::Binary | Self::Boolean | Self::Ascii | Self::I1 | Self::U1 => Some(1),
            Self::I2 | Self::U2 => Some(2),
            Self::I4 | Self::U4 | Self::F4 => Some(4),
            Self::I8 | Self::U8 | Self::F8 => Some(8),
        }
    }

    /// SML mnemonic
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::List => "L",
            Self::Binary => "B",
            Self::Boolean => "BOOLEAN",
            Self::Ascii => "A",
            Self::I8 => "I8",
            Self::I1 => "I1",
            Self::I2 => "I2",
            Self::I4 => "I4",
            Self::F8 => "F8",
            Self::F4 => "F4",
            Self::U8 => "U8",
            Self::U1 => "U1",
            Self::U2 => "U2",
            Self::U4 => "U4",
        }
    }
}

/// A SECS-II item
///
/// Scalar formats are arrays: a single value is an array of length one,
/// and an empty array is a valid item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Item {
    List(Vec<Item>),
    Binary(Vec<u8>),
    Boolean(Vec<bool>),
    Ascii(String),
    I1(Vec<i8>),
    I2(Vec<i16>),
    I4(Vec<i32>),
    I8(Vec<i64>),
    U1(Vec<u8>),
    U2(Vec<u16>),
    U4(Vec<u32>),
    U8(Vec<u64>),
    F4(Vec<f32>),
    F8(Vec<f64>),
}

impl Item {
    pub fn list(items: Vec<Item>) -> Self {
        Self::List(items)
    }

    pub fn empty_list() -> Self {
        Self::List(Vec::new())
    }

    pub fn ascii(value: impl Into<String>) -> Self {
        Self::Ascii(value.into())
    }

    pub fn binary(value: u8) -> Self {
        Self::Binary(vec![value])
    }

    pub fn boolean(value: bool) -> Self {
        Self::Boolean(vec![value])
    }

    pub fn u1(value: u8) -> Self {
        Self::U1(vec![value])
    }

    pub fn u2(value: u16) -> Self {
        Self::U2(vec![value])
    }

    pub fn u4(value: u32) -> Self {
        Self::U4(vec![value])
    }

    pub fn u8(value: u64) -> Self {
        Self::U8(vec![value])
    }

    pub fn i4(value: i32) -> Self {
        Self::I4(vec![value])
    }

    pub fn i8(value: i64) -> Self {
        Self::I8(vec![value])
    }

    pub fn f4(value: f32) -> Self {
        Self::F4(vec![value])
    }

    pub fn f8(value: f64) -> Self {
        Self::F8(vec![value])
    }

    /// Format of this item
    pub fn format(&self) -> ItemFormat {
        match self {
            Self::List(_) => ItemFormat::List,
            Self::Binary(_) => ItemFormat::Binary,
            Self::Boolean(_) => ItemFormat::Boolean,
            Self::Ascii(_) => ItemFormat::Ascii,
            Self::I1(_) => ItemFormat::I1,
            Self::I2(_) => ItemFormat::I2,
            Self::I4(_) => ItemFormat::I4,
            Self::I8(_) => ItemFormat::I8,
            Self::U1(_) => ItemFormat::U1,
            Self::U2(_) => ItemFormat::U2,
            Self::U4(_) => ItemFormat::U4,
            Self::U8(_) => ItemFormat::U8,
            Self::F4(_) => ItemFormat::F4,
            Self::F8(_) => ItemFormat::F8,
        }
    }

    /// Number of elements (items for a list, values otherwise)
    pub fn len(&self) -> usize {
        match self {
            Self::List(v) => v.len(),
            Self::Binary(v) => v.len(),
            Self::Boolean(v) => v.len(),
            Self::Ascii(s) => s.len(),
            Self::I1(v) => v.len(),
            Self::I2(v) => v.len(),
            Self::I4(v) => v.len(),
            Self::I8(v) => v.len(),
            Self::U1(v) => v.len(),
            Self::U2(v) => v.len(),
            Self::U4(v) => v.len(),
            Self::U8(v) => v.len(),
            Self::F4(v) => v.len(),
            Self::F8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_list(&self) -> Option<&[Item]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_ascii(&self) -> Option<&str> {
        match self {
            Self::Ascii(s) => Some(s),
            _ => None,
        }
    }

    /// Single boolean value (Boolean, or a one-byte Binary/U1 treated as non-zero)
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) if v.len() == 1 => Some(v[0]),
            Self::Binary(v) | Self::U1(v) if v.len() == 1 => Some(v[0] != 0),
            _ => None,
        }
    }

    /// Single integer value of any integer format (including one-byte Binary)
    pub fn as_i128(&self) -> Option<i128> {
        fn single<T: Copy + Into<i128>>(v: &[T]) -> Option<i128> {
            match v {
                [x] => Some((*x).into()),
                _ => None,
            }
        }
        match self {
            Self::Binary(v) | Self::U1(v) => single(v),
            Self::I1(v) => single(v),
            Self::I2(v) => single(v),
            Self::I4(v) => single(v),
            Self::I8(v) => single(v),
            Self::U2(v) => single(v),
            Self::U4(v) => single(v),
            Self::U8(v) => single(v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_i128().and_then(|v| u32::try_from(v).ok())
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i128().and_then(|v| u64::try_from(v).ok())
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    /// Single numeric value of any integer or float format
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F4(v) if v.len() == 1 => Some(v[0] as f64),
            Self::F8(v) if v.len() == 1 => Some(v[0]),
            _ => self.as_i128().map(|v| v as f64),
        }
    }

    /// Item at `index` of a list
    pub fn get(&self, index: usize) -> Option<&Item> {
        self.as_list().and_then(|items| items.get(index))
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        macro_rules! values {
            ($v:expr) => {{
                write!(f, "<{}", self.format().mnemonic())?;
                for value in $v {
                    write!(f, " {}", value)?;
                }
                write!(f, ">")
            }};
        }

        match self {
            Self::List(items) => {
                write!(f, "<L [{}]", items.len())?;
                for item in items {
                    write!(f, " {}", item)?;
                }
                write!(f, ">")
            }
            Self::Ascii(s) => write!(f, "<A \"{}\">", s),
            Self::Binary(v) => {
                write!(f, "<B")?;
                for b in v {
                    write!(f, " 0x{:02X}", b)?;
                }
                write!(f, ">")
            }
            Self::Boolean(v) => values!(v),
            Self::I1(v) => values!(v),
            Self::I2(v) => values!(v),
            Self::I4(v) => values!(v),
            Self::I8(v) => values!(v),
            Self::U1(v) => values!(v),
            Self::U2(v) => values!(v),
            Self::U4(v) => values!(v),
            Self::U8(v) => values!(v),
            Self::F4(v) => values!(v),
            Self::F8(v) => values!(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_codes_round_trip() {
        let formats = [
            ItemFormat::List,
            ItemFormat::Binary,
            ItemFormat::Boolean,
            ItemFormat::Ascii,
            ItemFormat::I8,
            ItemFormat::I1,
            ItemFormat::I2,
            ItemFormat::I4,
            ItemFormat::F8,
            ItemFormat::F4,
            ItemFormat::U8,
            ItemFormat::U1,
            ItemFormat::U2,
            ItemFormat::U4,
        ];
        for format in formats {
            assert_eq!(ItemFormat::from_code(format.code()).unwrap(), format);
        }
        assert!(ItemFormat::from_code(0o77).is_err());
    }

    #[test]
    fn test_numeric_accessors() {
        assert_eq!(Item::u4(10001).as_u32(), Some(10001));
        assert_eq!(Item::U1(vec![3]).as_u32(), Some(3));
        assert_eq!(Item::I4(vec![-1]).as_u32(), None);
        assert_eq!(Item::I4(vec![-1]).as_i64(), Some(-1));
        assert_eq!(Item::U4(vec![1, 2]).as_u32(), None);
        assert_eq!(Item::f4(1.5).as_f64(), Some(1.5));
        assert_eq!(Item::binary(0).as_bool(), Some(false));
        assert_eq!(Item::boolean(true).as_bool(), Some(true));
    }

    #[test]
    fn test_display() {
        let item = Item::list(vec![Item::u4(1), Item::ascii("OK"), Item::binary(0x80)]);
        assert_eq!(item.to_string(), "<L [3] <U4 1> <A \"OK\"> <B 0x80>>");
    }
}
