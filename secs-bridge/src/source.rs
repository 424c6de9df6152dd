//! Physical data sources
//!
//! A [`PhysicalSource`] is the PLC side of a device: values are read from
//! and written to string addresses, each with a declared [`DataType`]. The
//! wire driver itself lives outside this crate; [`MemorySource`] is an
//! in-process implementation for simulation and tests.

use crate::error::{SecsError, SecsResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use secs_core::Item;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Value read from or written to a PLC address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlcValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl PlcValue {
    /// Trigger condition: non-zero, true or non-empty
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(v) => *v != 0,
            Self::UInt(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::Text(s) => !s.is_empty(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            Self::Bool(b) => Some(i128::from(*b)),
            Self::Int(v) => Some(i128::from(*v)),
            Self::UInt(v) => Some(i128::from(*v)),
            Self::Float(v) if v.fract() == 0.0 => Some(*v as i128),
            _ => None,
        }
    }
}

impl fmt::Display for PlcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::UInt(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "\"{}\"", v),
        }
    }
}

/// Declared type of a PLC address and the SECS-II format it maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Ascii,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::Bool | Self::Ascii)
    }

    fn mismatch(self, value: impl fmt::Display) -> SecsError {
        SecsError::TypeMismatch(format!("{} is not representable as {:?}", value, self))
    }

    /// Convert a PLC value into the SECS-II item of this type
    ///
    /// # Errors
    ///
    /// `SecsError::TypeMismatch` if the value does not fit the type
    pub fn to_item(self, value: &PlcValue) -> SecsResult<Item> {
        macro_rules! int {
            ($variant:ident, $ty:ty) => {
                value
                    .as_i128()
                    .and_then(|v| <$ty>::try_from(v).ok())
                    .map(|v| Item::$variant(vec![v]))
                    .ok_or_else(|| self.mismatch(value))
            };
        }
        match self {
            Self::Bool => match value {
                PlcValue::Text(_) => Err(self.mismatch(value)),
                other => Ok(Item::boolean(other.is_truthy())),
            },
            Self::I8 => int!(I1, i8),
            Self::I16 => int!(I2, i16),
            Self::I32 => int!(I4, i32),
            Self::I64 => int!(I8, i64),
            Self::U8 => int!(U1, u8),
            Self::U16 => int!(U2, u16),
            Self::U32 => int!(U4, u32),
            Self::U64 => int!(U8, u64),
            Self::F32 => value
                .as_f64()
                .map(|v| Item::f4(v as f32))
                .ok_or_else(|| self.mismatch(value)),
            Self::F64 => value
                .as_f64()
                .map(Item::f8)
                .ok_or_else(|| self.mismatch(value)),
            Self::Ascii => Ok(Item::ascii(match value {
                PlcValue::Text(s) => s.clone(),
                other => other.to_string(),
            })),
        }
    }

    /// Convert a host-supplied item into a PLC value of this type
    ///
    /// # Errors
    ///
    /// `SecsError::TypeMismatch` if the item has the wrong format or its
    /// value does not fit the type
    pub fn from_item(self, item: &Item) -> SecsResult<PlcValue> {
        macro_rules! int {
            ($ty:ty, $variant:ident, $wide:ty) => {
                item.as_i128()
                    .and_then(|v| <$ty>::try_from(v).ok())
                    .map(|v| PlcValue::$variant(<$wide>::from(v)))
                    .ok_or_else(|| self.mismatch(item))
            };
        }
        match self {
            Self::Bool => item
                .as_bool()
                .map(PlcValue::Bool)
                .ok_or_else(|| self.mismatch(item)),
            Self::I8 => int!(i8, Int, i64),
            Self::I16 => int!(i16, Int, i64),
            Self::I32 => int!(i32, Int, i64),
            Self::I64 => int!(i64, Int, i64),
            Self::U8 => int!(u8, UInt, u64),
            Self::U16 => int!(u16, UInt, u64),
            Self::U32 => int!(u32, UInt, u64),
            Self::U64 => int!(u64, UInt, u64),
            Self::F32 | Self::F64 => item
                .as_f64()
                .map(PlcValue::Float)
                .ok_or_else(|| self.mismatch(item)),
            Self::Ascii => item
                .as_ascii()
                .map(|s| PlcValue::Text(s.to_string()))
                .ok_or_else(|| self.mismatch(item)),
        }
    }
}

/// PLC address space of one device
///
/// Implementations report every failure to reach the PLC as
/// `SecsError::SourceUnavailable`. Callers bound each call with the
/// device's source timeout.
#[async_trait]
pub trait PhysicalSource: Send + Sync {
    /// Read the value at `address`
    async fn read(&self, address: &str, data_type: DataType) -> SecsResult<PlcValue>;

    /// Write `value` to `address`
    async fn write(&self, address: &str, data_type: DataType, value: PlcValue) -> SecsResult<()>;
}

#[derive(Default)]
struct MemoryState {
    values: HashMap<String, PlcValue>,
    failing: HashSet<String>,
}

/// In-memory PLC address space
///
/// Unset addresses and addresses marked failing read as unavailable.
#[derive(Default)]
pub struct MemorySource {
    state: Mutex<MemoryState>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(self, address: impl Into<String>, value: PlcValue) -> Self {
        self.set(address, value);
        self
    }

    pub fn set(&self, address: impl Into<String>, value: PlcValue) {
        self.state.lock().values.insert(address.into(), value);
    }

    pub fn get(&self, address: &str) -> Option<PlcValue> {
        self.state.lock().values.get(address).cloned()
    }

    /// Make reads and writes of `address` fail
    pub fn fail(&self, address: impl Into<String>) {
        self.state.lock().failing.insert(address.into());
    }

    pub fn recover(&self, address: &str) {
        self.state.lock().failing.remove(address);
    }
}

#[async_trait]
impl PhysicalSource for MemorySource {
    async fn read(&self, address: &str, _data_type: DataType) -> SecsResult<PlcValue> {
        let state = self.state.lock();
        if state.failing.contains(address) {
            return Err(SecsError::SourceUnavailable(format!("read of {} failed", address)));
        }
        state
            .values
            .get(address)
            .cloned()
            .ok_or_else(|| SecsError::SourceUnavailable(format!("no value at {}", address)))
    }

    async fn write(&self, address: &str, _data_type: DataType, value: PlcValue) -> SecsResult<()> {
        let mut state = self.state.lock();
        if state.failing.contains(address) {
            return Err(SecsError::SourceUnavailable(format!("write of {} failed", address)));
        }
        state.values.insert(address.to_string(), value);
        Ok(())
    }
}
