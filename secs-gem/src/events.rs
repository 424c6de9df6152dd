//! Device notifications
//!
//! Every observable change of a device is published as one
//! [`Notification`]. Notifications of one device are delivered in the order
//! the changes happened.

use crate::control::ControlState;
use crate::state::InitializationState;
use secs_core::{Alid, Ceid, DeviceId, Ecid, Item, Rptid, Svid};
use secs_session::HsmsConnectionState;
use serde::Serialize;

/// Alarm transition direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AlarmChange {
    Set,
    Clear,
}

impl AlarmChange {
    /// ALCD byte of S5F1: bit 8 set while the alarm is set
    pub const fn alcd(self, category: u8) -> u8 {
        match self {
            Self::Set => 0x80 | (category & 0x7F),
            Self::Clear => category & 0x7F,
        }
    }
}

/// Values of one report, in the report's declared variable order
///
/// `None` marks a variable that could not be resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportValues {
    pub rptid: Rptid,
    pub values: Vec<(Svid, Option<Item>)>,
}

impl ReportValues {
    pub fn is_degraded(&self) -> bool {
        self.values.iter().any(|(_, value)| value.is_none())
    }
}

/// A typed notification about one device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Notification {
    /// HSMS connection state changed
    ConnectionStateChanged {
        device_id: DeviceId,
        from: HsmsConnectionState,
        to: HsmsConnectionState,
    },

    /// Initialization sequencer state changed
    InitializationStateChanged {
        device_id: DeviceId,
        from: InitializationState,
        to: InitializationState,
    },

    /// A collection event fired
    EventFired {
        device_id: DeviceId,
        ceid: Ceid,
        reports: Vec<ReportValues>,
    },

    /// An alarm was set or cleared
    AlarmTransition {
        device_id: DeviceId,
        alid: Alid,
        change: AlarmChange,
    },

    /// GEM control state changed
    ControlStateChanged {
        device_id: DeviceId,
        from: ControlState,
        to: ControlState,
    },

    /// The host wrote an equipment constant
    EquipmentConstantChanged {
        device_id: DeviceId,
        ecid: Ecid,
        value: Item,
    },

    /// One trace sample was taken
    TraceSample {
        device_id: DeviceId,
        trid: u32,
        smpln: u32,
        values: Vec<(Svid, Option<Item>)>,
    },
}

impl Notification {
    /// Device the notification belongs to
    pub fn device_id(&self) -> DeviceId {
        match self {
            Self::ConnectionStateChanged { device_id, .. }
            | Self::InitializationStateChanged { device_id, .. }
            | Self::EventFired { device_id, .. }
            | Self::AlarmTransition { device_id, .. }
            | Self::ControlStateChanged { device_id, .. }
            | Self::EquipmentConstantChanged { device_id, .. }
            | Self::TraceSample { device_id, .. } => *device_id,
        }
    }

    /// Check if the notification reports a failure
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::InitializationStateChanged {
                to: InitializationState::Failed,
                ..
            } | Self::ConnectionStateChanged {
                to: HsmsConnectionState::NotConnected,
                ..
            }
        )
    }

    /// Get a human-readable description of the notification
    pub fn description(&self) -> String {
        match self {
            Self::ConnectionStateChanged { device_id, from, to } => {
                format!("dev{} connection {} -> {}", device_id, from, to)
            }
            Self::InitializationStateChanged { device_id, from, to } => {
                format!("dev{} initialization {} -> {}", device_id, from, to)
            }
            Self::EventFired {
                device_id,
                ceid,
                reports,
            } => format!(
                "dev{} event {} fired with {} report(s)",
                device_id,
                ceid,
                reports.len()
            ),
            Self::AlarmTransition {
                device_id,
                alid,
                change,
            } => format!("dev{} alarm {} {:?}", device_id, alid, change),
            Self::ControlStateChanged { device_id, from, to } => {
                format!("dev{} control state {} -> {}", device_id, from, to)
            }
            Self::EquipmentConstantChanged {
                device_id,
                ecid,
                value,
            } => format!("dev{} constant {} = {}", device_id, ecid, value),
            Self::TraceSample {
                device_id,
                trid,
                smpln,
                ..
            } => format!("dev{} trace {} sample {}", device_id, trid, smpln),
        }
    }
}
