use crate::ids::{DeviceId, IdentifierKind};
use thiserror::Error;

/// Main error type for SECS/GEM bridge operations
#[derive(Error, Debug)]
pub enum SecsError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("SECS-II encoding error: {0}")]
    Encoding(String),

    #[error("SECS-II decoding error: {0}")]
    Decoding(String),

    #[error("Frame invalid: {0}")]
    FrameInvalid(String),

    #[error("Connection is not selected")]
    NotSelected,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unknown identifier: {kind} {id}")]
    UnknownIdentifier { kind: IdentifierKind, id: u32 },

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Value out of range: {0}")]
    OutOfRange(String),

    #[error("Read-only violation: {kind} {id}")]
    ReadOnlyViolation { kind: IdentifierKind, id: u32 },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Duplicate device id: {0}")]
    DuplicateDeviceId(DeviceId),

    #[error("Unknown device id: {0}")]
    UnknownDevice(DeviceId),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SecsError {
    /// Shorthand for an `UnknownIdentifier` error
    pub fn unknown(kind: IdentifierKind, id: u32) -> Self {
        Self::UnknownIdentifier { kind, id }
    }

    /// Whether this error is a transport-level fault that should tear down the link
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::FrameInvalid(_)
        )
    }
}

/// Result type alias for SECS/GEM bridge operations
pub type SecsResult<T> = Result<T, SecsError>;
