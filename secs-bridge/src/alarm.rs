//! Alarm runtime state

use crate::catalog::IdentifierCatalog;
use crate::error::{SecsError, SecsResult};
use chrono::{DateTime, Utc};
use secs_core::{Alid, IdentifierKind};
use secs_gem::AlarmChange;
use serde::Serialize;
use std::collections::BTreeMap;

/// Runtime state of one alarm
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct AlarmRuntimeState {
    pub set: bool,
    /// Time of the last set or clear
    pub last_transition: Option<DateTime<Utc>>,
    /// Trigger condition at the last evaluation
    #[serde(skip)]
    trigger: bool,
}

/// Set/clear state of every alarm of a device
///
/// Alarms set on a rising trigger condition. An alarm with auto-clear
/// clears when the condition goes away; any other alarm stays set until
/// [`AlarmTable::clear`] is called.
#[derive(Debug, Clone, Default)]
pub struct AlarmTable {
    states: BTreeMap<Alid, AlarmRuntimeState>,
}

impl AlarmTable {
    /// All alarms of the catalog, initially clear
    pub fn from_catalog(catalog: &IdentifierCatalog) -> Self {
        Self {
            states: catalog
                .alids()
                .map(|d| (d.id, AlarmRuntimeState::default()))
                .collect(),
        }
    }

    /// Follow a catalog change, keeping the state of surviving alarms
    pub fn sync(&mut self, catalog: &IdentifierCatalog) {
        let mut states = Self::from_catalog(catalog).states;
        for (alid, state) in states.iter_mut() {
            if let Some(existing) = self.states.get(alid) {
                *state = *existing;
            }
        }
        self.states = states;
    }

    pub fn get(&self, alid: Alid) -> Option<&AlarmRuntimeState> {
        self.states.get(&alid)
    }

    pub fn is_set(&self, alid: Alid) -> bool {
        self.states.get(&alid).is_some_and(|s| s.set)
    }

    /// Alarms currently set
    pub fn active(&self) -> Vec<Alid> {
        self.states
            .iter()
            .filter(|(_, s)| s.set)
            .map(|(alid, _)| *alid)
            .collect()
    }

    /// Evaluate the trigger condition of one alarm
    ///
    /// Returns the transition, if any.
    pub fn evaluate(&mut self, alid: Alid, trigger: bool, auto_clear: bool) -> Option<AlarmChange> {
        let state = self.states.get_mut(&alid)?;
        let previous = std::mem::replace(&mut state.trigger, trigger);
        let change = if trigger && !previous && !state.set {
            state.set = true;
            Some(AlarmChange::Set)
        } else if !trigger && state.set && auto_clear {
            state.set = false;
            Some(AlarmChange::Clear)
        } else {
            None
        };
        if change.is_some() {
            state.last_transition = Some(Utc::now());
        }
        change
    }

    /// Clear an alarm explicitly
    ///
    /// Returns `AlarmChange::Clear` if the alarm was set.
    pub fn clear(&mut self, alid: Alid) -> SecsResult<Option<AlarmChange>> {
        let state = self
            .states
            .get_mut(&alid)
            .ok_or_else(|| SecsError::unknown(IdentifierKind::Alid, alid))?;
        if !state.set {
            return Ok(None);
        }
        state.set = false;
        state.last_transition = Some(Utc::now());
        Ok(Some(AlarmChange::Clear))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{AlidDefinition, IdentifierDefinition};

    fn table(ids: &[Alid]) -> AlarmTable {
        let definitions = ids
            .iter()
            .map(|id| {
                IdentifierDefinition::Alid(AlidDefinition {
                    id: *id,
                    name: format!("AL{}", id),
                    priority: 0,
                    category: 0,
                    address: format!("M{}", id),
                    auto_clear: true,
                    monitored: true,
                })
            })
            .collect();
        AlarmTable::from_catalog(&IdentifierCatalog::build(definitions).unwrap())
    }

    #[test]
    fn test_sets_once_on_rising_condition() {
        let mut alarms = table(&[5001]);
        assert_eq!(alarms.evaluate(5001, false, true), None);
        assert_eq!(alarms.evaluate(5001, true, true), Some(AlarmChange::Set));
        assert_eq!(alarms.evaluate(5001, true, true), None);
        assert!(alarms.is_set(5001));
        assert!(alarms.get(5001).unwrap().last_transition.is_some());
        assert_eq!(alarms.evaluate(5001, false, true), Some(AlarmChange::Clear));
        assert!(alarms.active().is_empty());
    }

    #[test]
    fn test_latched_alarm_needs_explicit_clear() {
        let mut alarms = table(&[5001]);
        assert_eq!(alarms.evaluate(5001, true, false), Some(AlarmChange::Set));
        assert_eq!(alarms.evaluate(5001, false, false), None);
        assert!(alarms.is_set(5001));
        assert_eq!(alarms.clear(5001).unwrap(), Some(AlarmChange::Clear));
        assert_eq!(alarms.clear(5001).unwrap(), None);
        assert!(alarms.clear(9).is_err());
    }

    #[test]
    fn test_clear_while_condition_holds_does_not_refire() {
        let mut alarms = table(&[5001]);
        alarms.evaluate(5001, true, false);
        alarms.clear(5001).unwrap();
        assert_eq!(alarms.evaluate(5001, true, false), None);
        assert_eq!(alarms.evaluate(5001, false, false), None);
        assert_eq!(alarms.evaluate(5001, true, false), Some(AlarmChange::Set));
    }

    #[test]
    fn test_sync_keeps_surviving_state() {
        let mut alarms = table(&[5001, 5002]);
        alarms.evaluate(5001, true, true);
        let catalog = IdentifierCatalog::build(vec![IdentifierDefinition::Alid(AlidDefinition {
            id: 5001,
            name: "AL5001".into(),
            priority: 0,
            category: 0,
            address: "M5001".into(),
            auto_clear: true,
            monitored: true,
        })])
        .unwrap();
        alarms.sync(&catalog);
        assert!(alarms.is_set(5001));
        assert!(alarms.get(5002).is_none());
    }
}
