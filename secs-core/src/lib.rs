//! Core types and utilities for the SECS/GEM equipment bridge
//!
//! This crate provides the fundamental types shared by every layer of the
//! stack: the error type, the SECS-II item model, logical identifier kinds
//! and the HSMS timeout set.

pub mod error;
pub mod ids;
pub mod item;
pub mod timeouts;

pub use error::{SecsError, SecsResult};
pub use ids::{Alid, Ceid, DeviceId, Ecid, IdentifierKind, Rptid, Svid};
pub use item::{Item, ItemFormat};
pub use timeouts::HsmsTimeouts;
