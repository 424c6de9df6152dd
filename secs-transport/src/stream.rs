//! Byte stream and connector abstractions

use crate::error::SecsResult;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Bidirectional byte stream carrying HSMS frames
///
/// Implemented for every `AsyncRead + AsyncWrite` type, so TCP streams and
/// in-memory duplex pipes can be used interchangeably.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Owned, type-erased byte stream
pub type BoxedStream = Box<dyn ByteStream>;

/// Establishes byte streams to the host
///
/// A connector is called again after every disconnect; each call yields a
/// fresh stream or an error. Active connectors dial out, passive connectors
/// wait for the host to connect.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a new byte stream
    ///
    /// # Returns
    ///
    /// The connected stream, or `SecsError::Connection` if it could not be
    /// established
    async fn connect(&self) -> SecsResult<BoxedStream>;

    /// Human-readable endpoint description for logging
    fn describe(&self) -> String;
}
