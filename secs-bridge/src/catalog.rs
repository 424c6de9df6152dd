//! Validated identifier catalog
//!
//! An [`IdentifierCatalog`] is an immutable snapshot of a device's
//! identifier definitions. It is built once per bridge from the mapping
//! repository and replaced as a whole on reload.

use crate::definition::{
    AlidDefinition, CeidDefinition, EcidDefinition, IdentifierDefinition, SvidDefinition,
};
use crate::error::{SecsError, SecsResult};
use crate::repository::MappingRepository;
use secs_core::{Alid, Ceid, Ecid, IdentifierKind, Rptid, Svid};
use secs_gem::{IdentifierDirectory, VariableInfo};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct IdentifierCatalog {
    svids: BTreeMap<Svid, SvidDefinition>,
    ceids: BTreeMap<Ceid, CeidDefinition>,
    ecids: BTreeMap<Ecid, EcidDefinition>,
    alids: BTreeMap<Alid, AlidDefinition>,
    rptids: BTreeMap<Rptid, Vec<Svid>>,
    monitored: BTreeSet<Alid>,
}

fn malformed(kind: IdentifierKind, id: u32, reason: &str) -> SecsError {
    SecsError::Config(format!("{} {}: {}", kind, id, reason))
}

impl IdentifierCatalog {
    /// Snapshot the repository into a catalog
    ///
    /// Report members are taken from `get_report_members` and alarm
    /// monitoring from `is_monitored`.
    pub async fn load(repository: &dyn MappingRepository) -> SecsResult<Self> {
        let mut definitions = Vec::new();
        for kind in IdentifierKind::ALL {
            definitions.extend(repository.get_definitions(kind).await?);
        }
        for definition in definitions.iter_mut() {
            if let IdentifierDefinition::Rptid(report) = definition {
                report.svids = repository.get_report_members(report.id).await?;
            }
        }
        let mut unmonitored = BTreeSet::new();
        for definition in &definitions {
            if let IdentifierDefinition::Alid(alarm) = definition {
                if !repository.is_monitored(alarm.id).await? {
                    unmonitored.insert(alarm.id);
                }
            }
        }
        let mut catalog = Self::build(definitions)?;
        catalog.monitored.retain(|alid| !unmonitored.contains(alid));
        Ok(catalog)
    }

    /// Build and validate a catalog
    ///
    /// # Errors
    ///
    /// `SecsError::Config` for duplicate ids, missing addresses, inverted
    /// bounds or reports referencing undefined variables
    pub fn build(definitions: Vec<IdentifierDefinition>) -> SecsResult<Self> {
        let mut catalog = Self::default();
        let mut reports = Vec::new();

        for definition in definitions {
            let (kind, id) = (definition.kind(), definition.id());
            let duplicate = match definition {
                IdentifierDefinition::Svid(d) => {
                    if d.address.is_empty() {
                        return Err(malformed(kind, id, "empty address"));
                    }
                    catalog.svids.insert(d.id, d).is_some()
                }
                IdentifierDefinition::Ceid(d) => {
                    let has_address = d.address.as_deref().is_some_and(|a| !a.is_empty());
                    if d.trigger != crate::definition::TriggerKind::Manual && !has_address {
                        return Err(malformed(kind, id, "trigger address required"));
                    }
                    catalog.ceids.insert(d.id, d).is_some()
                }
                IdentifierDefinition::Ecid(d) => {
                    if d.address.is_empty() {
                        return Err(malformed(kind, id, "empty address"));
                    }
                    if let (Some(min), Some(max)) = (d.min, d.max) {
                        if min > max {
                            return Err(malformed(kind, id, "min greater than max"));
                        }
                    }
                    if (d.min.is_some() || d.max.is_some()) && !d.data_type.is_numeric() {
                        return Err(malformed(kind, id, "bounds on a non-numeric constant"));
                    }
                    catalog.ecids.insert(d.id, d).is_some()
                }
                IdentifierDefinition::Alid(d) => {
                    if d.address.is_empty() {
                        return Err(malformed(kind, id, "empty address"));
                    }
                    if d.monitored {
                        catalog.monitored.insert(d.id);
                    }
                    catalog.alids.insert(d.id, d).is_some()
                }
                IdentifierDefinition::Rptid(d) => {
                    reports.push(d.id);
                    catalog.rptids.insert(d.id, d.svids).is_some()
                }
            };
            if duplicate {
                return Err(malformed(kind, id, "defined more than once"));
            }
        }

        for rptid in reports {
            let members = catalog.rptids.get(&rptid).map(Vec::as_slice).unwrap_or_default();
            if let Some(svid) = members.iter().find(|svid| !catalog.svids.contains_key(*svid)) {
                return Err(malformed(
                    IdentifierKind::Rptid,
                    rptid,
                    &format!("references undefined SVID {}", svid),
                ));
            }
        }
        Ok(catalog)
    }

    pub fn svid(&self, id: Svid) -> SecsResult<&SvidDefinition> {
        self.svids.get(&id).ok_or_else(|| SecsError::unknown(IdentifierKind::Svid, id))
    }

    pub fn ceid(&self, id: Ceid) -> SecsResult<&CeidDefinition> {
        self.ceids.get(&id).ok_or_else(|| SecsError::unknown(IdentifierKind::Ceid, id))
    }

    pub fn ecid(&self, id: Ecid) -> SecsResult<&EcidDefinition> {
        self.ecids.get(&id).ok_or_else(|| SecsError::unknown(IdentifierKind::Ecid, id))
    }

    pub fn alid(&self, id: Alid) -> SecsResult<&AlidDefinition> {
        self.alids.get(&id).ok_or_else(|| SecsError::unknown(IdentifierKind::Alid, id))
    }

    pub fn report(&self, id: Rptid) -> SecsResult<&[Svid]> {
        self.rptids
            .get(&id)
            .map(Vec::as_slice)
            .ok_or_else(|| SecsError::unknown(IdentifierKind::Rptid, id))
    }

    pub fn svids(&self) -> impl Iterator<Item = &SvidDefinition> {
        self.svids.values()
    }

    pub fn ceids(&self) -> impl Iterator<Item = &CeidDefinition> {
        self.ceids.values()
    }

    pub fn ecids(&self) -> impl Iterator<Item = &EcidDefinition> {
        self.ecids.values()
    }

    pub fn alids(&self) -> impl Iterator<Item = &AlidDefinition> {
        self.alids.values()
    }

    pub fn reports(&self) -> &BTreeMap<Rptid, Vec<Svid>> {
        &self.rptids
    }

    /// Alarms whose transitions are reported, as loaded
    pub fn monitored_alarms(&self) -> &BTreeSet<Alid> {
        &self.monitored
    }

    /// Identifier directory for the GEM session
    ///
    /// `internal` lists equipment-internal status variables that have no
    /// PLC address.
    pub fn directory(&self, internal: &[(Svid, &str)]) -> IdentifierDirectory {
        let mut directory = IdentifierDirectory::default();
        for (svid, name) in internal {
            directory.svids.insert(
                *svid,
                VariableInfo {
                    name: name.to_string(),
                    units: String::new(),
                },
            );
        }
        for d in self.svids.values() {
            directory.svids.insert(
                d.id,
                VariableInfo {
                    name: d.name.clone(),
                    units: d.unit.clone(),
                },
            );
        }
        for d in self.ecids.values() {
            directory.ecids.insert(
                d.id,
                VariableInfo {
                    name: d.name.clone(),
                    units: d.unit.clone(),
                },
            );
        }
        directory.ceids = self.ceids.keys().copied().collect();
        directory.alids = self.alids.values().map(|d| (d.id, d.name.clone())).collect();
        directory
    }
}
