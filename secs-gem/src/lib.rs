//! GEM application layer (SEMI E30)
//!
//! This crate provides the GEM session model of one device (communication
//! and control state, host-defined reports, event links, enabled events and
//! traces), the stream/function handler registry answering host primaries,
//! the typed notifications published to subscribers, and the sequencer
//! driving the multi-step initialization after the link is selected.

pub mod control;
pub mod error;
pub mod events;
pub mod handler;
pub mod sequencer;
pub mod session;
pub mod state;

pub use control::{CommunicationState, ControlMode, ControlState};
pub use error::{SecsError, SecsResult};
pub use events::{AlarmChange, Notification, ReportValues};
pub use handler::{Dispatch, Effect, Handler, HandlerOutcome, HandlerRegistry, Reply, ResolveRequest};
pub use sequencer::{GemSequencer, InitializationConfig, SequencerObserver};
pub use session::{
    GemSession, IdentifierDirectory, SessionProgress, SharedSession, TraceDefinition, VariableInfo,
};
pub use state::InitializationState;
