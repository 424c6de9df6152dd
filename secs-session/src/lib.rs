//! Session layer module for the HSMS protocol (SEMI E37)
//!
//! This crate provides the HSMS message header and message types, the
//! per-device connection state machine with its T5/T6/T7/T8 timers, and
//! the transaction correlator pairing primaries with their replies under
//! the T3 reply timeout.

pub mod error;
pub mod hsms;

pub use error::{SecsError, SecsResult};
pub use hsms::*;
