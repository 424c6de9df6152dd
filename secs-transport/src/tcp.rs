//! TCP transport implementation

use crate::error::{SecsError, SecsResult};
use crate::stream::{BoxedStream, Connector};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Connection establishment mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpMode {
    /// Dial out to the host
    Active,
    /// Listen and accept the host's connection
    Passive,
}

/// TCP transport layer settings
#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub address: SocketAddr,
    pub mode: TcpMode,
    pub nodelay: bool,
}

impl TcpSettings {
    /// Create settings dialing `address`
    pub fn active(address: SocketAddr) -> Self {
        Self {
            address,
            mode: TcpMode::Active,
            nodelay: true,
        }
    }

    /// Create settings listening on `address`
    pub fn passive(address: SocketAddr) -> Self {
        Self {
            address,
            mode: TcpMode::Passive,
            nodelay: true,
        }
    }

    /// Create settings from an address string such as `"127.0.0.1:5000"`
    pub fn from_address(address: &str, mode: TcpMode) -> SecsResult<Self> {
        let address: SocketAddr = address
            .parse()
            .map_err(|e| SecsError::Config(format!("Invalid TCP address {:?}: {}", address, e)))?;
        Ok(match mode {
            TcpMode::Active => Self::active(address),
            TcpMode::Passive => Self::passive(address),
        })
    }
}

/// TCP connector
///
/// In passive mode the listener is bound on the first `connect` call and
/// kept for later reconnects, so the host can always reach the same port.
#[derive(Debug)]
pub struct TcpConnector {
    settings: TcpSettings,
    listener: Mutex<Option<TcpListener>>,
}

impl TcpConnector {
    /// Create a new TCP connector
    pub fn new(settings: TcpSettings) -> Self {
        Self {
            settings,
            listener: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &TcpSettings {
        &self.settings
    }

    async fn accept(&self) -> SecsResult<TcpStream> {
        let mut guard = self.listener.lock().await;
        if guard.is_none() {
            let listener = TcpListener::bind(self.settings.address).await?;
            log::info!("HSMS listening on {}", self.settings.address);
            *guard = Some(listener);
        }
        let listener = guard.as_ref().ok_or_else(|| {
            SecsError::Connection(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "TCP listener not bound",
            ))
        })?;
        let (stream, peer) = listener.accept().await?;
        log::info!("Accepted HSMS connection from {}", peer);
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> SecsResult<BoxedStream> {
        let stream = match self.settings.mode {
            TcpMode::Active => TcpStream::connect(self.settings.address).await?,
            TcpMode::Passive => self.accept().await?,
        };
        stream.set_nodelay(self.settings.nodelay)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        match self.settings.mode {
            TcpMode::Active => format!("tcp active {}", self.settings.address),
            TcpMode::Passive => format!("tcp passive {}", self.settings.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DEFAULT_MAX_FRAME_LENGTH, read_frame, write_frame};
    use std::time::Duration;

    #[test]
    fn test_settings_from_address() {
        let settings = TcpSettings::from_address("127.0.0.1:5000", TcpMode::Passive).unwrap();
        assert_eq!(settings.mode, TcpMode::Passive);
        assert_eq!(settings.address.port(), 5000);
        assert!(TcpSettings::from_address("not-an-address", TcpMode::Active).is_err());
    }

    #[tokio::test]
    async fn test_active_connector_exchanges_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let connector = TcpConnector::new(TcpSettings::active(address));
        assert!(connector.describe().starts_with("tcp active"));

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_frame(&mut stream, Duration::from_secs(1), DEFAULT_MAX_FRAME_LENGTH)
                .await
                .unwrap()
        });

        let mut stream = connector.connect().await.unwrap();
        let frame = vec![0xFF, 0xFF, 0, 0, 0, 5, 0, 0, 0, 7];
        write_frame(&mut stream, &frame, Duration::from_secs(1)).await.unwrap();
        assert_eq!(server.await.unwrap(), Some(frame));
    }

    #[tokio::test]
    async fn test_active_connector_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);
        let connector = TcpConnector::new(TcpSettings::active(address));
        assert!(matches!(connector.connect().await, Err(SecsError::Connection(_))));
    }
}
