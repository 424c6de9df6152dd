//! Transaction correlation
//!
//! Every primary sent with the W-bit set opens a transaction identified by
//! its system bytes. The correlator hands out fresh ids, keeps one pending
//! entry per (session id, transaction id) and completes it when the
//! matching reply arrives, when the reply timeout expires, or when the
//! link goes away.

use crate::hsms::header::SType;
use crate::hsms::message::HsmsMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Completion state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Replied,
    TimedOut,
    Rejected,
    Cancelled,
}

/// Result of waiting for a reply
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    /// The matching reply arrived
    Replied(HsmsMessage),
    /// The reply timeout expired first
    NoReply,
    /// The peer answered with Reject.req carrying this reason code
    Rejected(u8),
    /// The link was torn down or the device stopped
    Cancelled,
}

impl ReplyOutcome {
    pub fn state(&self) -> TransactionState {
        match self {
            ReplyOutcome::Replied(_) => TransactionState::Replied,
            ReplyOutcome::NoReply => TransactionState::TimedOut,
            ReplyOutcome::Rejected(_) => TransactionState::Rejected,
            ReplyOutcome::Cancelled => TransactionState::Cancelled,
        }
    }

    /// The reply message, if one arrived
    pub fn into_reply(self) -> Option<HsmsMessage> {
        match self {
            ReplyOutcome::Replied(msg) => Some(msg),
            _ => None,
        }
    }
}

struct PendingEntry {
    stream: u8,
    function: u8,
    sent_at: Instant,
    tx: oneshot::Sender<ReplyOutcome>,
}

struct CorrelatorInner {
    next_id: u32,
    pending: HashMap<(u16, u32), PendingEntry>,
}

/// Pairs outgoing primaries with their replies
///
/// Cloning yields another handle to the same pending table.
#[derive(Clone)]
pub struct TransactionCorrelator {
    inner: Arc<Mutex<CorrelatorInner>>,
}

impl TransactionCorrelator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CorrelatorInner {
                next_id: 1,
                pending: HashMap::new(),
            })),
        }
    }

    /// Allocate a transaction id without recording a transaction
    ///
    /// Ids are monotonic, skip 0 and are never handed out while a previous
    /// use of the same id is still pending.
    pub fn next_id(&self) -> u32 {
        let mut inner = self.inner.lock();
        Self::allocate(&mut inner, None)
    }

    fn allocate(inner: &mut CorrelatorInner, session_id: Option<u16>) -> u32 {
        loop {
            let id = inner.next_id;
            inner.next_id = inner.next_id.wrapping_add(1);
            if id == 0 {
                continue;
            }
            let in_use = match session_id {
                Some(session) => inner.pending.contains_key(&(session, id)),
                None => inner.pending.keys().any(|(_, pending)| *pending == id),
            };
            if !in_use {
                return id;
            }
        }
    }

    /// Open a transaction and return its id plus a handle to await the reply
    ///
    /// # Arguments
    ///
    /// * `session_id` - Session id the reply must carry
    /// * `stream` / `function` - The primary being sent, for logging
    /// * `timeout` - Reply deadline measured from now
    pub fn begin(&self, session_id: u16, stream: u8, function: u8, timeout: Duration) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let id = Self::allocate(&mut inner, Some(session_id));
        inner.pending.insert(
            (session_id, id),
            PendingEntry {
                stream,
                function,
                sent_at: now,
                tx,
            },
        );
        PendingReply {
            id,
            session_id,
            deadline: now + timeout,
            rx,
            correlator: self.clone(),
        }
    }

    /// Complete the transaction a reply belongs to
    ///
    /// # Returns
    ///
    /// `false` if no pending transaction matched; the reply is dropped and
    /// other transactions are unaffected.
    pub fn resolve_reply(&self, reply: HsmsMessage) -> bool {
        let key = (reply.device_id(), reply.system_bytes());
        let Some(entry) = self.inner.lock().pending.remove(&key) else {
            return false;
        };
        if reply.header.is_data() && reply.stream() != entry.stream {
            log::warn!(
                "Reply S{}F{} answers S{}F{} [{:08X}]",
                reply.stream(),
                reply.function(),
                entry.stream,
                entry.function,
                key.1
            );
        }
        log::trace!(
            "Transaction {:08X} replied after {:?}",
            key.1,
            entry.sent_at.elapsed()
        );
        let _ = entry.tx.send(ReplyOutcome::Replied(reply));
        true
    }

    /// Complete the transaction referenced by a Reject.req as rejected
    pub fn resolve_reject(&self, reject: &HsmsMessage) -> bool {
        if reject.message_type() != Some(SType::RejectReq) {
            return false;
        }
        let key = (reject.device_id(), reject.system_bytes());
        match self.inner.lock().pending.remove(&key) {
            Some(entry) => {
                let _ = entry.tx.send(ReplyOutcome::Rejected(reject.header.byte3));
                true
            }
            None => false,
        }
    }

    /// Cancel every pending transaction
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingEntry> = self.inner.lock().pending.drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(ReplyOutcome::Cancelled);
        }
        count
    }

    /// Number of transactions awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    fn forget(&self, session_id: u16, id: u32) -> bool {
        self.inner.lock().pending.remove(&(session_id, id)).is_some()
    }
}

impl Default for TransactionCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one pending transaction
///
/// Dropping the handle before completion removes the pending entry so the
/// id can be reused.
pub struct PendingReply {
    id: u32,
    session_id: u16,
    deadline: Instant,
    rx: oneshot::Receiver<ReplyOutcome>,
    correlator: TransactionCorrelator,
}

impl PendingReply {
    /// Transaction id (system bytes) to put in the primary's header
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the reply, the deadline, or cancellation
    pub async fn wait(mut self, cancel: &CancellationToken) -> ReplyOutcome {
        tokio::select! {
            result = &mut self.rx => result.unwrap_or(ReplyOutcome::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => {
                if self.correlator.forget(self.session_id, self.id) {
                    ReplyOutcome::NoReply
                } else {
                    // resolved concurrently with the deadline
                    self.rx.try_recv().unwrap_or(ReplyOutcome::NoReply)
                }
            }
            _ = cancel.cancelled() => ReplyOutcome::Cancelled,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.correlator.forget(self.session_id, self.id);
    }
}
