//! GEM initialization state machine

use crate::error::{SecsError, SecsResult};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Progress of the GEM initialization sequence
///
/// # State Transitions
///
/// ```text
/// NotStarted -> InitializingTransport -> EnablingCommunication
///   -> SwitchingToRemote -> EnteringCommunicating -> EstablishingCommunication
///   -> RequestingOnline -> EnteringNormalOperation -> InitializingFunctions
///   -> Completed
///
/// any step -> Failed          (step error or step timeout)
/// any state -> NotStarted     (link left Selected)
/// ```
///
/// The sequence only advances while the HSMS connection is selected.
/// `Failed` is absorbing until the link is lost or the device restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum InitializationState {
    #[default]
    NotStarted,
    InitializingTransport,
    EnablingCommunication,
    SwitchingToRemote,
    EnteringCommunicating,
    EstablishingCommunication,
    RequestingOnline,
    EnteringNormalOperation,
    InitializingFunctions,
    Completed,
    Failed,
}

impl InitializationState {
    /// The step following this one, `None` for `Completed` and `Failed`
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        use InitializationState::*;
        match self {
            NotStarted => Some(InitializingTransport),
            InitializingTransport => Some(EnablingCommunication),
            EnablingCommunication => Some(SwitchingToRemote),
            SwitchingToRemote => Some(EnteringCommunicating),
            EnteringCommunicating => Some(EstablishingCommunication),
            EstablishingCommunication => Some(RequestingOnline),
            RequestingOnline => Some(EnteringNormalOperation),
            EnteringNormalOperation => Some(InitializingFunctions),
            InitializingFunctions => Some(Completed),
            Completed | Failed => None,
        }
    }

    /// Whether the sequence has stopped advancing
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a sequencer step is executing
    #[must_use]
    pub const fn is_in_progress(self) -> bool {
        !matches!(self, Self::NotStarted | Self::Completed | Self::Failed)
    }

    /// Validate state transition
    ///
    /// Only single forward steps, failure from an in-progress step and the
    /// reset to `NotStarted` are allowed.
    pub fn validate_transition(&self, new_state: InitializationState) -> SecsResult<()> {
        let valid = match new_state {
            InitializationState::NotStarted => true,
            InitializationState::Failed => self.is_in_progress(),
            next => self.next() == Some(next),
        };
        if valid {
            Ok(())
        } else {
            Err(SecsError::Protocol(format!(
                "Invalid initialization transition: {} -> {}",
                self, new_state
            )))
        }
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::InitializingTransport => "InitializingTransport",
            Self::EnablingCommunication => "EnablingCommunication",
            Self::SwitchingToRemote => "SwitchingToRemote",
            Self::EnteringCommunicating => "EnteringCommunicating",
            Self::EstablishingCommunication => "EstablishingCommunication",
            Self::RequestingOnline => "RequestingOnline",
            Self::EnteringNormalOperation => "EnteringNormalOperation",
            Self::InitializingFunctions => "InitializingFunctions",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

impl Display for InitializationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InitializationState::*;

    #[test]
    fn test_sequence_order() {
        let mut state = NotStarted;
        let mut steps = vec![state];
        while let Some(next) = state.next() {
            steps.push(next);
            state = next;
        }
        assert_eq!(steps.len(), 10);
        assert_eq!(state, Completed);
        assert!(steps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_transitions() {
        assert!(NotStarted.validate_transition(InitializingTransport).is_ok());
        assert!(RequestingOnline.validate_transition(Failed).is_ok());
        assert!(Completed.validate_transition(NotStarted).is_ok());
        assert!(Failed.validate_transition(NotStarted).is_ok());

        assert!(NotStarted.validate_transition(Completed).is_err());
        assert!(EnablingCommunication.validate_transition(InitializingTransport).is_err());
        assert!(Failed.validate_transition(InitializingTransport).is_err());
        assert!(Completed.validate_transition(Failed).is_err());
    }

    #[test]
    fn test_predicates() {
        assert!(Failed.is_terminal());
        assert!(Completed.is_terminal());
        assert!(!NotStarted.is_in_progress());
        assert!(InitializingFunctions.is_in_progress());
    }
}
