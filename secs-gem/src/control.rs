//! GEM communication and control states

use serde::{Deserialize, Serialize};
use std::fmt;

/// GEM control state
///
/// The numeric codes are the values reported through the control-state
/// status variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ControlState {
    #[default]
    EquipmentOffLine,
    AttemptOnLine,
    HostOffLine,
    OnLineLocal,
    OnLineRemote,
}

impl ControlState {
    pub const fn code(self) -> u8 {
        match self {
            Self::EquipmentOffLine => 1,
            Self::AttemptOnLine => 2,
            Self::HostOffLine => 3,
            Self::OnLineLocal => 4,
            Self::OnLineRemote => 5,
        }
    }

    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::OnLineLocal | Self::OnLineRemote)
    }

    /// On-line state matching a control mode
    pub const fn online(mode: ControlMode) -> Self {
        match mode {
            ControlMode::Local => Self::OnLineLocal,
            ControlMode::Remote => Self::OnLineRemote,
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EquipmentOffLine => "EQUIPMENT OFF-LINE",
            Self::AttemptOnLine => "ATTEMPT ON-LINE",
            Self::HostOffLine => "HOST OFF-LINE",
            Self::OnLineLocal => "ON-LINE LOCAL",
            Self::OnLineRemote => "ON-LINE REMOTE",
        };
        f.write_str(name)
    }
}

/// Operator-selected on-line sub-mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ControlMode {
    #[default]
    Local,
    Remote,
}

impl ControlMode {
    pub const fn code(self) -> u8 {
        match self {
            Self::Local => 0,
            Self::Remote => 1,
        }
    }
}

/// GEM communication state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CommunicationState {
    #[default]
    Disabled,
    EnabledNotCommunicating,
    WaitCommunicationRequest,
    Communicating,
}

impl CommunicationState {
    #[must_use]
    pub const fn is_communicating(self) -> bool {
        matches!(self, Self::Communicating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_state_codes() {
        assert_eq!(ControlState::EquipmentOffLine.code(), 1);
        assert_eq!(ControlState::OnLineRemote.code(), 5);
        assert!(ControlState::online(ControlMode::Local).is_online());
        assert!(!ControlState::HostOffLine.is_online());
        assert_eq!(ControlState::OnLineRemote.to_string(), "ON-LINE REMOTE");
    }

    #[test]
    fn test_defaults() {
        assert_eq!(ControlState::default(), ControlState::EquipmentOffLine);
        assert_eq!(CommunicationState::default(), CommunicationState::Disabled);
        assert_eq!(ControlMode::default(), ControlMode::Local);
    }
}
