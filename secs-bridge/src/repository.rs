//! Identifier mapping repository
//!
//! The repository is the persistent source of identifier definitions. The
//! bridge only reads it when building or reloading its catalog.

use crate::definition::{IdentifierDefinition, IdentifierTables};
use crate::error::{SecsError, SecsResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use secs_core::{Alid, IdentifierKind, Rptid, Svid};
use std::collections::BTreeSet;

/// Source of identifier definitions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MappingRepository: Send + Sync {
    /// All definitions of one kind
    async fn get_definitions(&self, kind: IdentifierKind) -> SecsResult<Vec<IdentifierDefinition>>;

    /// Whether transitions of `alid` are reported
    async fn is_monitored(&self, alid: Alid) -> SecsResult<bool>;

    /// Member variables of a report, in wire order
    async fn get_report_members(&self, rptid: Rptid) -> SecsResult<Vec<Svid>>;
}

/// Repository over an in-memory definition list
#[derive(Default)]
pub struct InMemoryMappingRepository {
    definitions: RwLock<Vec<IdentifierDefinition>>,
    unmonitored: RwLock<BTreeSet<Alid>>,
}

impl InMemoryMappingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(definitions: Vec<IdentifierDefinition>) -> Self {
        let unmonitored = definitions
            .iter()
            .filter_map(|d| match d {
                IdentifierDefinition::Alid(alid) if !alid.monitored => Some(alid.id),
                _ => None,
            })
            .collect();
        Self {
            definitions: RwLock::new(definitions),
            unmonitored: RwLock::new(unmonitored),
        }
    }

    pub fn from_tables(tables: &IdentifierTables) -> Self {
        Self::from_definitions(tables.definitions())
    }

    /// Add or replace a definition
    pub fn upsert(&self, definition: IdentifierDefinition) {
        let mut definitions = self.definitions.write();
        definitions.retain(|d| !(d.kind() == definition.kind() && d.id() == definition.id()));
        definitions.push(definition);
    }

    /// Remove a definition, returning whether it existed
    pub fn remove(&self, kind: IdentifierKind, id: u32) -> bool {
        let mut definitions = self.definitions.write();
        let before = definitions.len();
        definitions.retain(|d| !(d.kind() == kind && d.id() == id));
        definitions.len() != before
    }

    pub fn set_monitored(&self, alid: Alid, monitored: bool) {
        let mut unmonitored = self.unmonitored.write();
        if monitored {
            unmonitored.remove(&alid);
        } else {
            unmonitored.insert(alid);
        }
    }
}

#[async_trait]
impl MappingRepository for InMemoryMappingRepository {
    async fn get_definitions(&self, kind: IdentifierKind) -> SecsResult<Vec<IdentifierDefinition>> {
        Ok(self
            .definitions
            .read()
            .iter()
            .filter(|d| d.kind() == kind)
            .cloned()
            .collect())
    }

    async fn is_monitored(&self, alid: Alid) -> SecsResult<bool> {
        Ok(!self.unmonitored.read().contains(&alid))
    }

    async fn get_report_members(&self, rptid: Rptid) -> SecsResult<Vec<Svid>> {
        self.definitions
            .read()
            .iter()
            .find_map(|d| match d {
                IdentifierDefinition::Rptid(report) if report.id == rptid => Some(report.svids.clone()),
                _ => None,
            })
            .ok_or_else(|| SecsError::unknown(IdentifierKind::Rptid, rptid))
    }
}
