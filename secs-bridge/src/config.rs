//! Device and manager configuration
//!
//! ```toml
//! notification_capacity = 1024
//!
//! [[devices]]
//! device_id = 1
//! name = "etcher-1"
//! address = "0.0.0.0:5000"
//! mode = "passive"
//! poll_interval = 0.5
//!
//! [devices.timeouts]
//! t3 = 45
//! t7 = 10
//!
//! [devices.initialization]
//! step_timeout = 30
//!
//! [[devices.identifiers.svids]]
//! id = 10001
//! name = "ChamberTemp"
//! address = "D100"
//! data_type = "f32"
//! ```

use crate::definition::IdentifierTables;
use crate::error::{SecsError, SecsResult};
use secs_core::timeouts::duration_secs;
use secs_core::{DeviceId, HsmsTimeouts};
use secs_gem::InitializationConfig;
use secs_session::{ConnectMode, HsmsConfig};
use secs_transport::{TcpMode, TcpSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Configuration of one device bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: DeviceId,
    pub name: String,
    /// Model name reported in S1F2/S1F14
    pub model_name: String,
    /// Software revision reported in S1F2/S1F14
    pub software_revision: String,
    /// Local listen address (passive) or host address (active)
    pub address: String,
    pub mode: ConnectMode,
    pub timeouts: HsmsTimeouts,
    /// Consecutive T3 timeouts tolerated before the link is faulted
    pub t3_retry_limit: u32,
    pub initialization: InitializationConfig,
    /// Interval of event and alarm trigger sweeps
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Bound on each PLC read or write
    #[serde(with = "duration_secs")]
    pub source_timeout: Duration,
    pub identifiers: IdentifierTables,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: 1,
            name: String::new(),
            model_name: "SECS-BRIDGE".to_string(),
            software_revision: env!("CARGO_PKG_VERSION").to_string(),
            address: "0.0.0.0:5000".to_string(),
            mode: ConnectMode::Passive,
            timeouts: HsmsTimeouts::default(),
            t3_retry_limit: 3,
            initialization: InitializationConfig::default(),
            poll_interval: Duration::from_millis(500),
            source_timeout: Duration::from_secs(2),
            identifiers: IdentifierTables::default(),
        }
    }
}

impl DeviceConfig {
    pub fn new(device_id: DeviceId, address: impl Into<String>) -> Self {
        Self {
            device_id,
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_model(mut self, model_name: impl Into<String>, software_revision: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self.software_revision = software_revision.into();
        self
    }

    pub fn with_mode(mut self, mode: ConnectMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeouts(mut self, timeouts: HsmsTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_initialization(mut self, initialization: InitializationConfig) -> Self {
        self.initialization = initialization;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_source_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = timeout;
        self
    }

    pub fn with_identifiers(mut self, identifiers: IdentifierTables) -> Self {
        self.identifiers = identifiers;
        self
    }

    /// HSMS session configuration of the device
    pub fn hsms_config(&self) -> HsmsConfig {
        HsmsConfig::new(self.device_id)
            .with_mode(self.mode)
            .with_timeouts(self.timeouts)
            .with_t3_retry_limit(self.t3_retry_limit)
    }

    /// TCP settings for the configured address and mode
    pub fn tcp_settings(&self) -> SecsResult<TcpSettings> {
        let mode = match self.mode {
            ConnectMode::Active => TcpMode::Active,
            ConnectMode::Passive => TcpMode::Passive,
        };
        TcpSettings::from_address(&self.address, mode)
    }

    /// Reject configurations no bridge can run with
    pub fn validate(&self) -> SecsResult<()> {
        if self.device_id == 0 {
            return Err(SecsError::Config("device id 0 is not allowed".to_string()));
        }
        self.hsms_config().validate()?;
        self.initialization.validate()?;
        if self.poll_interval.is_zero() {
            return Err(SecsError::Config(format!(
                "dev{} poll interval must be greater than zero",
                self.device_id
            )));
        }
        if self.source_timeout.is_zero() {
            return Err(SecsError::Config(format!(
                "dev{} source timeout must be greater than zero",
                self.device_id
            )));
        }
        self.tcp_settings().map(|_| ())
    }
}

/// Configuration of a device manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Capacity of each notification channel
    pub notification_capacity: usize,
    pub devices: Vec<DeviceConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            notification_capacity: 1024,
            devices: Vec::new(),
        }
    }
}

impl ManagerConfig {
    pub fn from_toml_str(text: &str) -> SecsResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| SecsError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> SecsResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> SecsResult<()> {
        if self.notification_capacity == 0 {
            return Err(SecsError::Config(
                "notification capacity must be greater than zero".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for device in &self.devices {
            device.validate()?;
            if !seen.insert(device.device_id) {
                return Err(SecsError::DuplicateDeviceId(device.device_id));
            }
        }
        Ok(())
    }
}
