//! HSMS session layer module

pub mod connection;
pub mod header;
pub mod message;
pub mod state;
pub mod statistics;
pub mod transaction;

pub use connection::{ConnectMode, HsmsConfig, HsmsConnection, SessionEvent};
pub use header::{CONTROL_SESSION_ID, HEADER_LENGTH, HsmsHeader, RejectReason, SType};
pub use message::HsmsMessage;
pub use state::HsmsConnectionState;
pub use statistics::HsmsStatistics;
pub use transaction::{PendingReply, ReplyOutcome, TransactionCorrelator, TransactionState};
