//! GEM session model of one device

use crate::control::{CommunicationState, ControlMode, ControlState};
use parking_lot::Mutex;
use secs_core::{Alid, Ceid, DeviceId, Ecid, Rptid, Svid};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Name and unit of a variable, as reported by S1F12
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VariableInfo {
    pub name: String,
    pub units: String,
}

/// The identifiers a device knows, taken from its catalog
#[derive(Debug, Clone, Default)]
pub struct IdentifierDirectory {
    pub svids: BTreeMap<Svid, VariableInfo>,
    pub ecids: BTreeMap<Ecid, VariableInfo>,
    pub ceids: BTreeSet<Ceid>,
    pub alids: BTreeMap<Alid, String>,
}

/// A trace configured by S2F23
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceDefinition {
    pub trid: u32,
    /// Sampling period
    pub period: Duration,
    /// Total samples to take
    pub total_samples: u32,
    /// Samples per S6F1
    pub group_size: u32,
    pub svids: Vec<Svid>,
}

/// Host interactions the initialization sequence waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionProgress {
    pub communication_established: bool,
    pub online_requested: bool,
    pub reports_defined: bool,
    pub links_defined: bool,
    pub events_enabled: bool,
    pub traces_initialized: bool,
}

/// GEM state of one device
#[derive(Debug, Clone)]
pub struct GemSession {
    pub device_id: DeviceId,
    pub model_name: String,
    pub software_revision: String,
    pub communication_state: CommunicationState,
    pub control_state: ControlState,
    pub control_mode: ControlMode,
    pub directory: IdentifierDirectory,
    /// Report id to ordered variable ids
    pub reports: BTreeMap<Rptid, Vec<Svid>>,
    /// Event id to ordered report ids
    pub event_links: BTreeMap<Ceid, Vec<Rptid>>,
    pub enabled_events: BTreeSet<Ceid>,
    pub enabled_alarms: BTreeSet<Alid>,
    pub traces: BTreeMap<u32, TraceDefinition>,
    pub progress: SessionProgress,
    data_id: u32,
}

impl GemSession {
    pub fn new(device_id: DeviceId, model_name: impl Into<String>, software_revision: impl Into<String>) -> Self {
        Self {
            device_id,
            model_name: model_name.into(),
            software_revision: software_revision.into(),
            communication_state: CommunicationState::Disabled,
            control_state: ControlState::EquipmentOffLine,
            control_mode: ControlMode::Local,
            directory: IdentifierDirectory::default(),
            reports: BTreeMap::new(),
            event_links: BTreeMap::new(),
            enabled_events: BTreeSet::new(),
            enabled_alarms: BTreeSet::new(),
            traces: BTreeMap::new(),
            progress: SessionProgress::default(),
            data_id: 0,
        }
    }

    pub fn with_directory(mut self, directory: IdentifierDirectory) -> Self {
        self.directory = directory;
        self
    }

    /// Return to the state of a fresh link
    ///
    /// Communication is disabled, the equipment is off-line, traces stop
    /// and the host's initialization progress is forgotten. Report
    /// definitions, links and enable flags survive.
    pub fn reset(&mut self) {
        self.communication_state = CommunicationState::Disabled;
        self.control_state = ControlState::EquipmentOffLine;
        self.traces.clear();
        self.progress = SessionProgress::default();
    }

    /// Next DATAID for an equipment-initiated report
    pub fn next_data_id(&mut self) -> u32 {
        self.data_id = self.data_id.wrapping_add(1);
        self.data_id
    }

    /// Set the control state, returning the previous one if it changed
    pub fn set_control_state(&mut self, state: ControlState) -> Option<ControlState> {
        let previous = std::mem::replace(&mut self.control_state, state);
        (previous != state).then_some(previous)
    }

    /// Whether `ceid` is enabled for S6F11
    pub fn is_event_enabled(&self, ceid: Ceid) -> bool {
        self.enabled_events.contains(&ceid)
    }

    /// Reports linked to `ceid` with their variable lists, in link order
    pub fn linked_reports(&self, ceid: Ceid) -> Vec<(Rptid, Vec<Svid>)> {
        self.event_links
            .get(&ceid)
            .map(|rptids| {
                rptids
                    .iter()
                    .map(|rptid| (*rptid, self.reports.get(rptid).cloned().unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct SharedInner {
    session: Mutex<GemSession>,
    progress: watch::Sender<SessionProgress>,
}

/// A [`GemSession`] shared between the bridge event loop and the sequencer
///
/// Every mutation publishes the session's progress flags, so the sequencer
/// can wait for host interactions without polling.
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<SharedInner>,
}

impl SharedSession {
    pub fn new(session: GemSession) -> Self {
        let (progress, _) = watch::channel(session.progress);
        Self {
            inner: Arc::new(SharedInner {
                session: Mutex::new(session),
                progress,
            }),
        }
    }

    /// Mutate the session
    pub fn update<R>(&self, f: impl FnOnce(&mut GemSession) -> R) -> R {
        let (result, progress) = {
            let mut session = self.inner.session.lock();
            let result = f(&mut session);
            (result, session.progress)
        };
        self.inner.progress.send_if_modified(|current| {
            if *current != progress {
                *current = progress;
                true
            } else {
                false
            }
        });
        result
    }

    /// Read the session
    pub fn read<R>(&self, f: impl FnOnce(&GemSession) -> R) -> R {
        f(&self.inner.session.lock())
    }

    /// Copy of the current session
    pub fn snapshot(&self) -> GemSession {
        self.inner.session.lock().clone()
    }

    /// Watch the host's initialization progress
    pub fn progress(&self) -> watch::Receiver<SessionProgress> {
        self.inner.progress.subscribe()
    }
}
