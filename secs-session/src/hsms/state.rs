//! HSMS connection state machine

use crate::error::{SecsError, SecsResult};
use serde::Serialize;
use std::fmt;

/// HSMS connection state
///
/// # State Transitions
/// ```text
/// NotConnected -> Connecting          (start, reconnect)
/// Connecting   -> Connected           (stream established)
/// Connected    -> Selected            (Select.req/Select.rsp exchanged)
/// Selected     -> Connected           (Deselect)
/// Connecting | Connected | Selected -> NotConnected   (fault, timeout, Separate, stop)
/// ```
///
/// There is no terminal state: after a disconnect the connection loops
/// back through `Connecting` until it is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum HsmsConnectionState {
    /// No transport (initial state)
    #[default]
    NotConnected,
    /// Dialing or waiting for the host to connect
    Connecting,
    /// Transport established, not yet selected (T7 running)
    Connected,
    /// Selected, data messages may flow
    Selected,
}

impl HsmsConnectionState {
    /// Check if data messages may be exchanged
    pub fn is_selected(&self) -> bool {
        matches!(self, HsmsConnectionState::Selected)
    }

    /// Check if a transport stream is established
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            HsmsConnectionState::Connected | HsmsConnectionState::Selected
        )
    }

    /// Validate state transition
    ///
    /// # Returns
    /// `Ok(())` if transition is valid, `Err` otherwise
    pub fn validate_transition(&self, new_state: HsmsConnectionState) -> SecsResult<()> {
        use HsmsConnectionState::*;

        let valid = match (*self, new_state) {
            (NotConnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Selected) => true,
            (Selected, Connected) => true,
            (Connecting | Connected | Selected, NotConnected) => true,
            (a, b) if a == b => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(SecsError::Protocol(format!(
                "Invalid state transition: {:?} -> {:?}",
                self, new_state
            )))
        }
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            HsmsConnectionState::NotConnected => "NotConnected",
            HsmsConnectionState::Connecting => "Connecting",
            HsmsConnectionState::Connected => "Connected",
            HsmsConnectionState::Selected => "Selected",
        }
    }
}

impl fmt::Display for HsmsConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
