//! Identifier definitions
//!
//! Each logical identifier the host can address is defined by the
//! equipment integrator and mapped onto a PLC address.

use crate::source::{DataType, PlcValue};
use secs_core::{Alid, Ceid, Ecid, IdentifierKind, Rptid, Svid};
use serde::{Deserialize, Serialize};

/// Status variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvidDefinition {
    pub id: Svid,
    pub name: String,
    pub address: String,
    pub data_type: DataType,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_true")]
    pub read_only: bool,
}

/// When a collection event fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    /// Any change of the trigger value
    #[default]
    ValueChange,
    /// Trigger goes from false to true
    RisingEdge,
    /// Trigger goes from true to false
    FallingEdge,
    /// Only fired on request
    Manual,
}

impl TriggerKind {
    /// Whether the trigger fires between two observed values
    pub fn fires(self, previous: &PlcValue, current: &PlcValue) -> bool {
        match self {
            Self::ValueChange => previous != current,
            Self::RisingEdge => !previous.is_truthy() && current.is_truthy(),
            Self::FallingEdge => previous.is_truthy() && !current.is_truthy(),
            Self::Manual => false,
        }
    }
}

/// Collection event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CeidDefinition {
    pub id: Ceid,
    pub name: String,
    #[serde(default)]
    pub trigger: TriggerKind,
    /// Trigger address, required unless the trigger is manual
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_trigger_type")]
    pub data_type: DataType,
}

/// Equipment constant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcidDefinition {
    pub id: Ecid,
    pub name: String,
    pub address: String,
    pub data_type: DataType,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub default: Option<PlcValue>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Locked by the integrator; host writes are rejected
    #[serde(default)]
    pub read_only: bool,
}

/// Alarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlidDefinition {
    pub id: Alid,
    pub name: String,
    #[serde(default)]
    pub priority: u8,
    /// ALCD category bits 1-7
    #[serde(default)]
    pub category: u8,
    pub address: String,
    /// Clear automatically when the trigger condition goes away
    #[serde(default = "default_true")]
    pub auto_clear: bool,
    /// Report transitions to the host
    #[serde(default = "default_true")]
    pub monitored: bool,
}

/// Equipment-defined report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RptidDefinition {
    pub id: Rptid,
    /// Member variables in wire order
    pub svids: Vec<Svid>,
}

fn default_true() -> bool {
    true
}

fn default_trigger_type() -> DataType {
    DataType::U32
}

/// Any identifier definition
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifierDefinition {
    Svid(SvidDefinition),
    Ceid(CeidDefinition),
    Ecid(EcidDefinition),
    Alid(AlidDefinition),
    Rptid(RptidDefinition),
}

impl IdentifierDefinition {
    pub fn kind(&self) -> IdentifierKind {
        match self {
            Self::Svid(_) => IdentifierKind::Svid,
            Self::Ceid(_) => IdentifierKind::Ceid,
            Self::Ecid(_) => IdentifierKind::Ecid,
            Self::Alid(_) => IdentifierKind::Alid,
            Self::Rptid(_) => IdentifierKind::Rptid,
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Self::Svid(d) => d.id,
            Self::Ceid(d) => d.id,
            Self::Ecid(d) => d.id,
            Self::Alid(d) => d.id,
            Self::Rptid(d) => d.id,
        }
    }
}

/// Identifier tables of one device, as written in configuration files
///
/// ```toml
/// [[svids]]
/// id = 10001
/// name = "ChamberTemp"
/// address = "D100"
/// data_type = "f32"
/// unit = "C"
///
/// [[ceids]]
/// id = 100
/// name = "LotStart"
/// trigger = "rising-edge"
/// address = "M10"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifierTables {
    pub svids: Vec<SvidDefinition>,
    pub ceids: Vec<CeidDefinition>,
    pub ecids: Vec<EcidDefinition>,
    pub alids: Vec<AlidDefinition>,
    pub rptids: Vec<RptidDefinition>,
}

impl IdentifierTables {
    /// Flatten into definitions of every kind
    pub fn definitions(&self) -> Vec<IdentifierDefinition> {
        let svids = self.svids.iter().cloned().map(IdentifierDefinition::Svid);
        let ceids = self.ceids.iter().cloned().map(IdentifierDefinition::Ceid);
        let ecids = self.ecids.iter().cloned().map(IdentifierDefinition::Ecid);
        let alids = self.alids.iter().cloned().map(IdentifierDefinition::Alid);
        let rptids = self.rptids.iter().cloned().map(IdentifierDefinition::Rptid);
        svids.chain(ceids).chain(ecids).chain(alids).chain(rptids).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_kinds() {
        let zero = PlcValue::UInt(0);
        let one = PlcValue::UInt(1);
        let two = PlcValue::UInt(2);
        assert!(TriggerKind::ValueChange.fires(&one, &two));
        assert!(!TriggerKind::ValueChange.fires(&one, &one));
        assert!(TriggerKind::RisingEdge.fires(&zero, &one));
        assert!(!TriggerKind::RisingEdge.fires(&one, &two));
        assert!(TriggerKind::FallingEdge.fires(&one, &zero));
        assert!(!TriggerKind::FallingEdge.fires(&zero, &one));
        assert!(!TriggerKind::Manual.fires(&zero, &one));
    }

    #[test]
    fn test_tables_from_toml() {
        let tables: IdentifierTables = toml::from_str(
            r#"
            [[svids]]
            id = 10001
            name = "ChamberTemp"
            address = "D100"
            data_type = "f32"
            unit = "C"

            [[ceids]]
            id = 100
            name = "LotStart"
            trigger = "rising-edge"
            address = "M10"

            [[ecids]]
            id = 20001
            name = "MaxTemp"
            address = "D200"
            data_type = "u32"
            default = 150
            min = 0
            max = 400

            [[alids]]
            id = 5001
            name = "Overheat"
            address = "M20"
            auto_clear = false

            [[rptids]]
            id = 1
            svids = [10001]
            "#,
        )
        .unwrap();
        assert_eq!(tables.svids[0].data_type, DataType::F32);
        assert!(tables.svids[0].read_only);
        assert_eq!(tables.ceids[0].trigger, TriggerKind::RisingEdge);
        assert_eq!(tables.ecids[0].default, Some(PlcValue::Int(150)));
        assert_eq!(tables.ecids[0].max, Some(400.0));
        assert!(!tables.alids[0].auto_clear);
        assert!(tables.alids[0].monitored);

        let definitions = tables.definitions();
        assert_eq!(definitions.len(), 5);
        assert_eq!(definitions[4].kind(), IdentifierKind::Rptid);
    }
}
