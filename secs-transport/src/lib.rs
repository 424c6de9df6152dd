//! Transport layer module for the HSMS protocol
//!
//! This crate provides the byte-stream abstraction the session layer runs
//! on, length-prefixed frame reading/writing with the T8 inter-character
//! timeout, and connectors for TCP (active and passive) and in-memory
//! duplex streams.

pub mod error;
pub mod frame;
pub mod memory;
pub mod stream;
pub mod tcp;

pub use error::{SecsError, SecsResult};
pub use frame::{DEFAULT_MAX_FRAME_LENGTH, MIN_FRAME_LENGTH, read_frame, write_frame};
pub use memory::{MemoryConnector, MemoryDialer};
pub use stream::{BoxedStream, ByteStream, Connector};
pub use tcp::{TcpConnector, TcpMode, TcpSettings};
