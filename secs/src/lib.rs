//! SECS/GEM equipment bridge
//!
//! Connects factory equipment to a host over HSMS, answers the host's
//! SECS-II requests from live PLC data, and reports events, alarms and
//! traces back to the host.
//!
//! # Architecture
//!
//! This library is organized as a workspace with multiple crates:
//!
//! - `secs-core`: Identifiers, SECS-II items, timeouts and error handling
//! - `secs-codec`: SECS-II item encoding/decoding
//! - `secs-transport`: Framed byte streams (TCP, in-memory)
//! - `secs-session`: HSMS connection state machine and transaction correlator
//! - `secs-gem`: GEM session, message handlers and initialization sequencer
//! - `secs-bridge`: Identifier resolution, equipment bridge and device manager
//!
//! # Usage
//!
//! ```no_run
//! use secs::bridge::{DeviceManager, ManagerConfig, MemorySource, PhysicalSource};
//! use std::sync::Arc;
//!
//! # async fn run() -> secs::SecsResult<()> {
//! let config = ManagerConfig::from_file("devices.toml")?;
//! let manager = DeviceManager::from_config(&config, |_| {
//!     Arc::new(MemorySource::new()) as Arc<dyn PhysicalSource>
//! })
//! .await?;
//! manager.start_all().await;
//! # Ok(())
//! # }
//! ```

// Re-export core types
pub use secs_core::{
    Alid, Ceid, DeviceId, Ecid, HsmsTimeouts, IdentifierKind, Item, ItemFormat, Rptid, SecsError,
    SecsResult, Svid,
};

// Re-export codec
pub mod codec {
    pub use secs_codec::*;
}

// Re-export transport
pub mod transport {
    pub use secs_transport::*;
}

// Re-export HSMS session layer
pub mod hsms {
    pub use secs_session::*;
}

// Re-export GEM layer
pub mod gem {
    pub use secs_gem::*;
}

// Re-export bridge and manager
pub mod bridge {
    pub use secs_bridge::*;
}
