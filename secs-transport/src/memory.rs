//! In-memory transport over `tokio::io::duplex`
//!
//! A [`MemoryConnector`] behaves like a passive TCP endpoint: each `connect`
//! waits until the paired [`MemoryDialer`] dials in. Used by host
//! simulators and tests.

use crate::error::{SecsError, SecsResult};
use crate::stream::{BoxedStream, Connector};
use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc};

/// Buffer size of each direction of a duplex pipe
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Equipment-side end of an in-memory link
#[derive(Debug)]
pub struct MemoryConnector {
    name: String,
    incoming: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

/// Host-side handle creating new in-memory connections
#[derive(Debug, Clone)]
pub struct MemoryDialer {
    capacity: usize,
    outgoing: mpsc::UnboundedSender<DuplexStream>,
}

impl MemoryConnector {
    /// Create a connector/dialer pair
    pub fn pair(name: impl Into<String>) -> (Self, MemoryDialer) {
        Self::with_capacity(name, DEFAULT_PIPE_CAPACITY)
    }

    /// Create a connector/dialer pair with a custom pipe capacity
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> (Self, MemoryDialer) {
        let (outgoing, incoming) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                incoming: Mutex::new(incoming),
            },
            MemoryDialer { capacity, outgoing },
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> SecsResult<BoxedStream> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(SecsError::Connection(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("memory link {} has no dialer", self.name),
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("memory {}", self.name)
    }
}

impl MemoryDialer {
    /// Open a new connection, returning the host end of the pipe
    ///
    /// # Errors
    ///
    /// Returns `SecsError::Connection` if the connector was dropped
    pub fn dial(&self) -> SecsResult<DuplexStream> {
        let (host, equipment) = tokio::io::duplex(self.capacity);
        self.outgoing.send(equipment).map_err(|_| {
            SecsError::Connection(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory connector closed",
            ))
        })?;
        Ok(host)
    }
}
