//! SECS/GEM equipment bridge
//!
//! This crate connects the GEM layer to the equipment's PLC: identifier
//! definitions and their repository, the validated catalog, the resolver
//! reading and writing PLC values, the per-device [`EquipmentBridge`] and
//! the [`DeviceManager`] running many devices side by side.

pub mod alarm;
pub mod bridge;
pub mod catalog;
pub mod config;
pub mod definition;
pub mod error;
pub mod manager;
pub mod repository;
pub mod resolver;
pub mod source;

pub use alarm::{AlarmRuntimeState, AlarmTable};
pub use bridge::{DEFAULT_NOTIFICATION_CAPACITY, DeviceHealth, EquipmentBridge};
pub use catalog::IdentifierCatalog;
pub use config::{DeviceConfig, ManagerConfig};
pub use definition::{
    AlidDefinition, CeidDefinition, EcidDefinition, IdentifierDefinition, IdentifierTables,
    RptidDefinition, SvidDefinition, TriggerKind,
};
pub use error::{SecsError, SecsResult};
pub use manager::DeviceManager;
pub use repository::{InMemoryMappingRepository, MappingRepository};
pub use resolver::{IdentifierResolver, ReportSlot, TriggerSnapshot};
pub use source::{DataType, MemorySource, PhysicalSource, PlcValue};

#[cfg(test)]
mod testing;
