//! Identifier resolver
//!
//! Maps the host's logical identifiers onto the device's PLC address space.
//! Every physical access goes through one async mutex so reads of a sweep
//! or report are never interleaved with another sweep of the same device.

use crate::alarm::{AlarmRuntimeState, AlarmTable};
use crate::catalog::IdentifierCatalog;
use crate::definition::{EcidDefinition, TriggerKind};
use crate::error::{SecsError, SecsResult};
use crate::source::{DataType, PhysicalSource, PlcValue};
use parking_lot::{Mutex, RwLock};
use secs_core::{Alid, Ceid, DeviceId, Ecid, IdentifierKind, Item, Rptid, Svid};
use secs_gem::AlarmChange;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Trigger values of one sweep, keyed by address
///
/// Addresses whose read failed are absent.
pub type TriggerSnapshot = HashMap<String, PlcValue>;

/// One value slot of a resolved report
#[derive(Debug, Clone, PartialEq)]
pub enum ReportSlot {
    Resolved(Item),
    /// The variable could not be resolved; carries the reason
    Unresolved(String),
}

impl ReportSlot {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    pub fn item(&self) -> Option<&Item> {
        match self {
            Self::Resolved(item) => Some(item),
            Self::Unresolved(_) => None,
        }
    }

    pub fn into_item(self) -> Option<Item> {
        match self {
            Self::Resolved(item) => Some(item),
            Self::Unresolved(_) => None,
        }
    }
}

pub struct IdentifierResolver {
    device_id: DeviceId,
    source: Arc<dyn PhysicalSource>,
    source_timeout: Duration,
    catalog: RwLock<Arc<IdentifierCatalog>>,
    internal: Mutex<BTreeMap<Svid, Item>>,
    alarms: Mutex<AlarmTable>,
    monitored: Mutex<BTreeSet<Alid>>,
    access: tokio::sync::Mutex<()>,
}

impl IdentifierResolver {
    pub fn new(
        device_id: DeviceId,
        catalog: IdentifierCatalog,
        source: Arc<dyn PhysicalSource>,
        source_timeout: Duration,
    ) -> Self {
        Self {
            device_id,
            source,
            source_timeout,
            alarms: Mutex::new(AlarmTable::from_catalog(&catalog)),
            monitored: Mutex::new(catalog.monitored_alarms().clone()),
            catalog: RwLock::new(Arc::new(catalog)),
            internal: Mutex::new(BTreeMap::new()),
            access: tokio::sync::Mutex::new(()),
        }
    }

    pub fn catalog(&self) -> Arc<IdentifierCatalog> {
        self.catalog.read().clone()
    }

    /// Swap in a reloaded catalog
    ///
    /// Alarm states and monitored flags of alarms that still exist survive.
    pub fn replace_catalog(&self, catalog: IdentifierCatalog) {
        self.alarms.lock().sync(&catalog);
        {
            let mut monitored = self.monitored.lock();
            let previous = self.catalog.read().clone();
            let mut next = catalog.monitored_alarms().clone();
            for alid in catalog.alids().map(|d| d.id) {
                if previous.alid(alid).is_ok() {
                    if monitored.contains(&alid) {
                        next.insert(alid);
                    } else {
                        next.remove(&alid);
                    }
                }
            }
            *monitored = next;
        }
        *self.catalog.write() = Arc::new(catalog);
        log::info!("dev{} identifier catalog replaced", self.device_id);
    }

    /// Publish equipment-internal status variable values
    pub fn publish_internal(&self, values: Vec<(Svid, Item)>) {
        self.internal.lock().extend(values);
    }

    async fn read(&self, address: &str, data_type: DataType) -> SecsResult<PlcValue> {
        match tokio::time::timeout(self.source_timeout, self.source.read(address, data_type)).await {
            Ok(result) => result,
            Err(_) => Err(SecsError::SourceUnavailable(format!(
                "read of {} timed out after {:?}",
                address, self.source_timeout
            ))),
        }
    }

    async fn write(&self, address: &str, data_type: DataType, value: PlcValue) -> SecsResult<()> {
        match tokio::time::timeout(self.source_timeout, self.source.write(address, data_type, value))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SecsError::SourceUnavailable(format!(
                "write of {} timed out after {:?}",
                address, self.source_timeout
            ))),
        }
    }

    async fn read_svid(&self, catalog: &IdentifierCatalog, id: Svid) -> SecsResult<Item> {
        let internal = self.internal.lock().get(&id).cloned();
        if let Some(value) = internal {
            return Ok(value);
        }
        let definition = catalog.svid(id)?;
        let value = self.read(&definition.address, definition.data_type).await?;
        definition.data_type.to_item(&value)
    }

    /// Current value of a status variable
    ///
    /// # Errors
    ///
    /// `SecsError::UnknownIdentifier` if the SVID is not defined,
    /// `SecsError::SourceUnavailable` if the read fails or times out
    pub async fn resolve_svid(&self, id: Svid) -> SecsResult<Item> {
        let catalog = self.catalog();
        let _access = self.access.lock().await;
        self.read_svid(&catalog, id).await
    }

    /// Resolve a list of variables in order
    ///
    /// A variable that cannot be resolved leaves an unresolved slot; the
    /// other slots are unaffected.
    pub async fn resolve_values(&self, svids: &[Svid]) -> Vec<(Svid, ReportSlot)> {
        let catalog = self.catalog();
        let _access = self.access.lock().await;
        let mut slots = Vec::with_capacity(svids.len());
        for svid in svids {
            let slot = match self.read_svid(&catalog, *svid).await {
                Ok(item) => ReportSlot::Resolved(item),
                Err(e) => ReportSlot::Unresolved(e.to_string()),
            };
            slots.push((*svid, slot));
        }
        slots
    }

    /// Resolve an equipment-defined report in its declared order
    pub async fn resolve_report(&self, rptid: Rptid) -> SecsResult<Vec<(Svid, ReportSlot)>> {
        let members = self.catalog().report(rptid)?.to_vec();
        let slots = self.resolve_values(&members).await;
        let unresolved = slots.iter().filter(|(_, slot)| !slot.is_resolved()).count();
        if unresolved > 0 {
            log::warn!(
                "dev{} report {} degraded: {} of {} value(s) unresolved",
                self.device_id,
                rptid,
                unresolved,
                slots.len()
            );
        }
        Ok(slots)
    }

    /// Read every event and alarm trigger address once
    pub async fn snapshot(&self) -> TriggerSnapshot {
        let catalog = self.catalog();
        let mut addresses: Vec<(&str, DataType)> = Vec::new();
        for ceid in catalog.ceids().filter(|c| c.trigger != TriggerKind::Manual) {
            if let Some(address) = ceid.address.as_deref() {
                addresses.push((address, ceid.data_type));
            }
        }
        for alid in catalog.alids() {
            addresses.push((alid.address.as_str(), DataType::Bool));
        }

        let _access = self.access.lock().await;
        let mut snapshot = TriggerSnapshot::with_capacity(addresses.len());
        for (address, data_type) in addresses {
            if snapshot.contains_key(address) {
                continue;
            }
            match self.read(address, data_type).await {
                Ok(value) => {
                    snapshot.insert(address.to_string(), value);
                }
                Err(e) => log::debug!("dev{} trigger {} unavailable: {}", self.device_id, address, e),
            }
        }
        snapshot
    }

    /// Events whose trigger fired between two sweeps
    ///
    /// An address missing from either sweep does not fire.
    pub fn evaluate_event_triggers(
        &self,
        previous: &TriggerSnapshot,
        current: &TriggerSnapshot,
    ) -> BTreeSet<Ceid> {
        self.catalog()
            .ceids()
            .filter(|ceid| {
                let Some(address) = ceid.address.as_deref() else {
                    return false;
                };
                match (previous.get(address), current.get(address)) {
                    (Some(before), Some(after)) => ceid.trigger.fires(before, after),
                    _ => false,
                }
            })
            .map(|ceid| ceid.id)
            .collect()
    }

    /// Alarm transitions caused by a sweep
    pub fn evaluate_alarms(&self, snapshot: &TriggerSnapshot) -> Vec<(Alid, AlarmChange)> {
        let catalog = self.catalog();
        let mut alarms = self.alarms.lock();
        catalog
            .alids()
            .filter_map(|alid| {
                let trigger = snapshot.get(&alid.address)?.is_truthy();
                alarms
                    .evaluate(alid.id, trigger, alid.auto_clear)
                    .map(|change| (alid.id, change))
            })
            .collect()
    }

    pub fn alarm_state(&self, alid: Alid) -> Option<AlarmRuntimeState> {
        self.alarms.lock().get(alid).copied()
    }

    pub fn active_alarms(&self) -> Vec<Alid> {
        self.alarms.lock().active()
    }

    /// Clear an alarm explicitly
    pub fn clear_alarm(&self, alid: Alid) -> SecsResult<Option<AlarmChange>> {
        self.alarms.lock().clear(alid)
    }

    pub fn is_monitored(&self, alid: Alid) -> bool {
        self.monitored.lock().contains(&alid)
    }

    pub fn monitored_alarms(&self) -> Vec<Alid> {
        self.monitored.lock().iter().copied().collect()
    }

    pub fn set_alarm_monitored(&self, alid: Alid, monitored: bool) -> SecsResult<()> {
        self.catalog().alid(alid)?;
        let mut set = self.monitored.lock();
        if monitored {
            set.insert(alid);
        } else {
            set.remove(&alid);
        }
        Ok(())
    }

    fn validate_ecid(catalog: &IdentifierCatalog, id: Ecid, value: &Item) -> SecsResult<(EcidDefinition, PlcValue)> {
        let definition = catalog.ecid(id)?;
        if definition.read_only {
            return Err(SecsError::ReadOnlyViolation {
                kind: IdentifierKind::Ecid,
                id,
            });
        }
        let converted = definition.data_type.from_item(value)?;
        if let Some(number) = converted.as_f64() {
            let below = definition.min.is_some_and(|min| number < min);
            let above = definition.max.is_some_and(|max| number > max);
            if below || above {
                return Err(SecsError::OutOfRange(format!(
                    "ECID {} value {} outside [{}, {}]",
                    id,
                    converted,
                    definition.min.map_or("-".to_string(), |v| v.to_string()),
                    definition.max.map_or("-".to_string(), |v| v.to_string()),
                )));
            }
        }
        Ok((definition.clone(), converted))
    }

    /// Validate and write an equipment constant
    ///
    /// Nothing is written unless validation passes.
    ///
    /// # Errors
    ///
    /// `UnknownIdentifier`, `ReadOnlyViolation`, `TypeMismatch`,
    /// `OutOfRange`, or `SourceUnavailable` if the write fails
    pub async fn apply_ecid(&self, id: Ecid, value: &Item) -> SecsResult<PlcValue> {
        let catalog = self.catalog();
        let (definition, converted) = Self::validate_ecid(&catalog, id, value)?;
        let _access = self.access.lock().await;
        self.write(&definition.address, definition.data_type, converted.clone())
            .await?;
        log::info!("dev{} ECID {} set to {}", self.device_id, id, converted);
        Ok(converted)
    }

    /// Validate every constant, then write them all
    pub async fn apply_ecids(&self, values: &[(Ecid, Item)]) -> SecsResult<()> {
        let catalog = self.catalog();
        let validated = values
            .iter()
            .map(|(id, value)| Self::validate_ecid(&catalog, *id, value))
            .collect::<SecsResult<Vec<_>>>()?;
        let _access = self.access.lock().await;
        for (definition, converted) in validated {
            self.write(&definition.address, definition.data_type, converted)
                .await?;
        }
        Ok(())
    }

    /// Current value of an equipment constant
    pub async fn read_ecid(&self, id: Ecid) -> SecsResult<Item> {
        let catalog = self.catalog();
        let definition = catalog.ecid(id)?;
        let _access = self.access.lock().await;
        let value = self.read(&definition.address, definition.data_type).await?;
        definition.data_type.to_item(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{
        AlidDefinition, CeidDefinition, EcidDefinition, IdentifierDefinition, RptidDefinition,
        SvidDefinition,
    };
    use crate::source::MemorySource;
    use async_trait::async_trait;

    fn svid(id: Svid, address: &str) -> IdentifierDefinition {
        IdentifierDefinition::Svid(SvidDefinition {
            id,
            name: format!("SV{}", id),
            address: address.into(),
            data_type: DataType::U32,
            unit: String::new(),
            read_only: true,
        })
    }

    fn ceid(id: Ceid, trigger: TriggerKind, address: &str) -> IdentifierDefinition {
        IdentifierDefinition::Ceid(CeidDefinition {
            id,
            name: format!("CE{}", id),
            trigger,
            address: Some(address.into()),
            data_type: DataType::U32,
        })
    }

    fn catalog() -> IdentifierCatalog {
        IdentifierCatalog::build(vec![
            svid(10001, "D1"),
            svid(10002, "D2"),
            IdentifierDefinition::Rptid(RptidDefinition {
                id: 1,
                svids: vec![10001, 10002],
            }),
            ceid(100, TriggerKind::ValueChange, "D10"),
            ceid(101, TriggerKind::RisingEdge, "M11"),
            ceid(102, TriggerKind::FallingEdge, "M12"),
            IdentifierDefinition::Ecid(EcidDefinition {
                id: 20001,
                name: "MaxTemp".into(),
                address: "D200".into(),
                data_type: DataType::U32,
                unit: "C".into(),
                default: None,
                min: Some(0.0),
                max: Some(400.0),
                read_only: false,
            }),
            IdentifierDefinition::Ecid(EcidDefinition {
                id: 20002,
                name: "Locked".into(),
                address: "D201".into(),
                data_type: DataType::U32,
                unit: String::new(),
                default: None,
                min: None,
                max: None,
                read_only: true,
            }),
            IdentifierDefinition::Alid(AlidDefinition {
                id: 5001,
                name: "Overheat".into(),
                priority: 1,
                category: 4,
                address: "M20".into(),
                auto_clear: false,
                monitored: true,
            }),
        ])
        .unwrap()
    }

    fn resolver(source: Arc<MemorySource>) -> IdentifierResolver {
        IdentifierResolver::new(1, catalog(), source, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_resolve_svid() {
        let source = Arc::new(MemorySource::new().with_value("D1", PlcValue::UInt(42)));
        let resolver = resolver(source);
        assert_eq!(resolver.resolve_svid(10001).await.unwrap(), Item::u4(42));
        assert!(matches!(
            resolver.resolve_svid(99).await,
            Err(SecsError::UnknownIdentifier { kind: IdentifierKind::Svid, id: 99 })
        ));
        assert!(matches!(
            resolver.resolve_svid(10002).await,
            Err(SecsError::SourceUnavailable(_))
        ));

        resolver.publish_internal(vec![(1, Item::u1(5))]);
        assert_eq!(resolver.resolve_svid(1).await.unwrap(), Item::u1(5));
    }

    #[tokio::test]
    async fn test_report_partial_failure_keeps_order() {
        let source = Arc::new(
            MemorySource::new()
                .with_value("D1", PlcValue::UInt(1))
                .with_value("D2", PlcValue::UInt(2)),
        );
        source.fail("D2");
        let resolver = resolver(source);
        let slots = resolver.resolve_report(1).await.unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0], (10001, ReportSlot::Resolved(Item::u4(1))));
        assert_eq!(slots[1].0, 10002);
        assert!(!slots[1].1.is_resolved());
        assert!(resolver.resolve_report(9).await.is_err());
    }

    struct StalledSource;

    #[async_trait]
    impl PhysicalSource for StalledSource {
        async fn read(&self, _address: &str, _data_type: DataType) -> SecsResult<PlcValue> {
            std::future::pending().await
        }

        async fn write(&self, _address: &str, _data_type: DataType, _value: PlcValue) -> SecsResult<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_source_timeout_is_unavailable() {
        let resolver = IdentifierResolver::new(1, catalog(), Arc::new(StalledSource), Duration::from_millis(20));
        assert!(matches!(
            resolver.resolve_svid(10001).await,
            Err(SecsError::SourceUnavailable(_))
        ));
        assert!(matches!(
            resolver.apply_ecid(20001, &Item::u4(10)).await,
            Err(SecsError::SourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_event_triggers() {
        let source = Arc::new(
            MemorySource::new()
                .with_value("D10", PlcValue::UInt(1))
                .with_value("M11", PlcValue::Bool(false))
                .with_value("M12", PlcValue::Bool(true))
                .with_value("M20", PlcValue::Bool(false)),
        );
        let resolver = resolver(source.clone());
        let first = resolver.snapshot().await;
        assert_eq!(first.len(), 4);
        assert!(resolver.evaluate_event_triggers(&first, &first).is_empty());

        source.set("D10", PlcValue::UInt(2));
        source.set("M11", PlcValue::Bool(true));
        let second = resolver.snapshot().await;
        let fired = resolver.evaluate_event_triggers(&first, &second);
        assert_eq!(fired, BTreeSet::from([100, 101]));

        source.set("M12", PlcValue::Bool(false));
        let third = resolver.snapshot().await;
        assert_eq!(resolver.evaluate_event_triggers(&second, &third), BTreeSet::from([102]));
    }

    #[tokio::test]
    async fn test_alarm_sets_once() {
        let source = Arc::new(MemorySource::new().with_value("M20", PlcValue::UInt(0)));
        let resolver = resolver(source.clone());
        assert!(resolver.evaluate_alarms(&resolver.snapshot().await).is_empty());

        source.set("M20", PlcValue::UInt(1));
        assert_eq!(
            resolver.evaluate_alarms(&resolver.snapshot().await),
            vec![(5001, AlarmChange::Set)]
        );
        assert!(resolver.evaluate_alarms(&resolver.snapshot().await).is_empty());
        assert!(resolver.alarm_state(5001).unwrap().set);

        // latched: stays set after the condition clears
        source.set("M20", PlcValue::UInt(0));
        assert!(resolver.evaluate_alarms(&resolver.snapshot().await).is_empty());
        assert_eq!(resolver.clear_alarm(5001).unwrap(), Some(AlarmChange::Clear));
        assert!(resolver.active_alarms().is_empty());
    }

    #[tokio::test]
    async fn test_apply_ecid() {
        let source = Arc::new(MemorySource::new().with_value("D200", PlcValue::UInt(100)));
        let resolver = resolver(source.clone());
        assert_eq!(resolver.read_ecid(20001).await.unwrap(), Item::u4(100));

        resolver.apply_ecid(20001, &Item::u4(250)).await.unwrap();
        assert_eq!(source.get("D200"), Some(PlcValue::UInt(250)));

        assert!(matches!(
            resolver.apply_ecid(20001, &Item::u4(500)).await,
            Err(SecsError::OutOfRange(_))
        ));
        assert!(matches!(
            resolver.apply_ecid(20001, &Item::ascii("hot")).await,
            Err(SecsError::TypeMismatch(_))
        ));
        assert!(matches!(
            resolver.apply_ecid(20002, &Item::u4(1)).await,
            Err(SecsError::ReadOnlyViolation { kind: IdentifierKind::Ecid, id: 20002 })
        ));
        assert_eq!(source.get("D200"), Some(PlcValue::UInt(250)));
        assert!(source.get("D201").is_none());
    }

    #[tokio::test]
    async fn test_apply_ecids_is_all_or_nothing() {
        let source = Arc::new(MemorySource::new().with_value("D200", PlcValue::UInt(100)));
        let resolver = resolver(source.clone());
        let result = resolver
            .apply_ecids(&[(20001, Item::u4(10)), (20001, Item::u4(999))])
            .await;
        assert!(matches!(result, Err(SecsError::OutOfRange(_))));
        assert_eq!(source.get("D200"), Some(PlcValue::UInt(100)));
    }

    #[tokio::test]
    async fn test_monitored_flags_survive_reload() {
        let resolver = resolver(Arc::new(MemorySource::new()));
        assert_eq!(resolver.monitored_alarms(), vec![5001]);
        resolver.set_alarm_monitored(5001, false).unwrap();
        assert!(resolver.set_alarm_monitored(9, true).is_err());

        resolver.replace_catalog(catalog());
        assert!(!resolver.is_monitored(5001));
    }
}
