//! GEM initialization sequencer
//!
//! Drives one device through the initialization steps after its HSMS link
//! is selected. The host runs the conversation: the handlers record each
//! host request in the session's [`SessionProgress`], and the sequencer
//! waits (bounded by the step timeout) until the step's request has been
//! seen. Requests that arrive before their step is reached complete the
//! step immediately.

use crate::control::{CommunicationState, ControlMode, ControlState};
use crate::error::{SecsError, SecsResult};
use crate::session::{SessionProgress, SharedSession};
use crate::state::InitializationState;
use secs_core::timeouts::duration_secs;
use secs_core::{DeviceId, Item, Svid};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Sequencer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializationConfig {
    /// Bound on each step waiting for the host
    #[serde(with = "duration_secs")]
    pub step_timeout: Duration,
    /// Whether S2F23 trace initialization must be seen before completion
    pub trace_required: bool,
    /// Status variable publishing the control state code
    pub control_state_svid: Svid,
    /// Status variable publishing the control mode code
    pub control_mode_svid: Svid,
}

impl Default for InitializationConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            trace_required: false,
            control_state_svid: 1,
            control_mode_svid: 2,
        }
    }
}

impl InitializationConfig {
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_trace_required(mut self, required: bool) -> Self {
        self.trace_required = required;
        self
    }

    pub fn with_status_svids(mut self, control_state: Svid, control_mode: Svid) -> Self {
        self.control_state_svid = control_state;
        self.control_mode_svid = control_mode;
        self
    }

    pub fn validate(&self) -> SecsResult<()> {
        if self.step_timeout.is_zero() {
            return Err(SecsError::Config(
                "step timeout must be greater than zero".to_string(),
            ));
        }
        if self.control_state_svid == self.control_mode_svid {
            return Err(SecsError::Config(format!(
                "control state and control mode share SVID {}",
                self.control_state_svid
            )));
        }
        Ok(())
    }
}

/// Receives what the sequencer does
#[cfg_attr(test, mockall::automock)]
pub trait SequencerObserver: Send + Sync {
    /// Initialization state changed
    fn on_state_changed(&self, from: InitializationState, to: InitializationState);

    /// The sequencer changed the control state
    fn on_control_state_changed(&self, from: ControlState, to: ControlState);

    /// Publish equipment-internal status variable values
    fn publish_status(&self, values: Vec<(Svid, Item)>);
}

/// Runs the initialization sequence of one device
pub struct GemSequencer {
    device_id: DeviceId,
    config: InitializationConfig,
    session: SharedSession,
    observer: Arc<dyn SequencerObserver>,
    state: InitializationState,
}

impl GemSequencer {
    pub fn new(
        device_id: DeviceId,
        config: InitializationConfig,
        session: SharedSession,
        observer: Arc<dyn SequencerObserver>,
    ) -> Self {
        Self {
            device_id,
            config,
            session,
            observer,
            state: InitializationState::NotStarted,
        }
    }

    pub fn state(&self) -> InitializationState {
        self.state
    }

    /// Run the sequence to `Completed` or `Failed`
    ///
    /// Cancelling `token` stops the sequence where it is; the caller resets
    /// the state to `NotStarted`.
    pub async fn run(mut self, token: CancellationToken) -> InitializationState {
        log::info!("dev{} initialization started", self.device_id);
        match self.execute(&token).await {
            Ok(()) => {
                log::info!("dev{} initialization completed", self.device_id);
            }
            Err(SecsError::Cancelled) => {
                log::debug!("dev{} initialization cancelled in {}", self.device_id, self.state);
            }
            Err(e) => {
                log::error!("dev{} initialization failed in {}: {}", self.device_id, self.state, e);
                self.transition(InitializationState::Failed);
            }
        }
        self.state
    }

    async fn execute(&mut self, token: &CancellationToken) -> SecsResult<()> {
        while let Some(step) = self.state.next() {
            if token.is_cancelled() {
                return Err(SecsError::Cancelled);
            }
            self.transition(step);
            self.perform(step, token).await?;
        }
        Ok(())
    }

    fn transition(&mut self, to: InitializationState) {
        if let Err(e) = self.state.validate_transition(to) {
            log::warn!("dev{} {}", self.device_id, e);
            return;
        }
        let from = std::mem::replace(&mut self.state, to);
        log::debug!("dev{} initialization {} -> {}", self.device_id, from, to);
        self.observer.on_state_changed(from, to);
    }

    fn set_control_state(&self, to: ControlState) {
        if let Some(from) = self.session.update(|s| s.set_control_state(to)) {
            log::info!("dev{} control state {} -> {}", self.device_id, from, to);
            self.observer.on_control_state_changed(from, to);
        }
    }

    async fn perform(&self, step: InitializationState, token: &CancellationToken) -> SecsResult<()> {
        use InitializationState::*;
        match step {
            InitializingTransport => {
                let fresh = self.session.read(|s| !s.progress.communication_established);
                if fresh {
                    self.session
                        .update(|s| s.communication_state = CommunicationState::Disabled);
                    self.set_control_state(ControlState::EquipmentOffLine);
                }
            }
            EnablingCommunication => self.session.update(|s| {
                if s.communication_state == CommunicationState::Disabled {
                    s.communication_state = CommunicationState::EnabledNotCommunicating;
                }
            }),
            SwitchingToRemote => self.session.update(|s| s.control_mode = ControlMode::Remote),
            EnteringCommunicating => self.session.update(|s| {
                if !s.communication_state.is_communicating() {
                    s.communication_state = CommunicationState::WaitCommunicationRequest;
                }
            }),
            EstablishingCommunication => {
                self.wait_for(token, self.deadline(), "S1F13", |p| p.communication_established)
                    .await?
            }
            RequestingOnline => {
                self.wait_for(token, self.deadline(), "S1F17", |p| p.online_requested)
                    .await?
            }
            EnteringNormalOperation => {
                let (state, mode) = self.session.read(|s| (s.control_state, s.control_mode));
                if !state.is_online() {
                    return Err(SecsError::Protocol(format!(
                        "equipment is {} after on-line request",
                        state
                    )));
                }
                self.set_control_state(ControlState::online(mode));
            }
            InitializingFunctions => {
                // one bound for the whole step
                let deadline = self.deadline();
                self.wait_for(token, deadline, "S2F33", |p| p.reports_defined).await?;
                self.wait_for(token, deadline, "S2F35", |p| p.links_defined).await?;
                self.wait_for(token, deadline, "S2F37", |p| p.events_enabled).await?;
                if self.config.trace_required {
                    self.wait_for(token, deadline, "S2F23", |p| p.traces_initialized)
                        .await?;
                }
                let (state, mode) = self.session.read(|s| (s.control_state, s.control_mode));
                self.observer.publish_status(vec![
                    (self.config.control_state_svid, Item::u1(state.code())),
                    (self.config.control_mode_svid, Item::u1(mode.code())),
                ]);
            }
            NotStarted | Completed | Failed => {}
        }
        Ok(())
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.step_timeout
    }

    /// Wait until the host's request has been recorded, at most until
    /// `deadline`
    async fn wait_for(
        &self,
        token: &CancellationToken,
        deadline: Instant,
        request: &str,
        done: fn(&SessionProgress) -> bool,
    ) -> SecsResult<()> {
        let mut progress = self.session.progress();
        let seen = async move { progress.wait_for(done).await.map(|_| ()) };
        tokio::select! {
            _ = token.cancelled() => Err(SecsError::Cancelled),
            result = tokio::time::timeout_at(deadline, seen) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(SecsError::Cancelled),
                Err(_) => Err(SecsError::Timeout(format!(
                    "{} not received within {:?}",
                    request, self.config.step_timeout
                ))),
            },
        }
    }
}
