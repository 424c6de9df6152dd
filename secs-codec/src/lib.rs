//! SECS-II item encoding/decoding
//!
//! Items are encoded as nested type-length-value records (SEMI E5 §9):
//! a format byte carrying the 6-bit format code and the number of length
//! bytes (1..=3), the big-endian length, then the data. For lists the
//! length counts items, for every other format it counts bytes.

pub mod decoder;
pub mod encoder;
pub mod error;
pub mod types;

pub use decoder::{SecsDecoder, decode_item};
pub use encoder::{SecsEncoder, encode_item};
pub use error::{SecsError, SecsResult};
pub use types::{FormatByte, MAX_ITEM_LENGTH, MAX_NESTING_DEPTH};
