//! HSMS link statistics

use serde::Serialize;

/// HSMS connection statistics
///
/// Counters accumulate over the lifetime of a connection handle, across
/// reconnects. They are reported in device health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HsmsStatistics {
    /// Total number of frames sent
    pub frames_sent: u64,
    /// Total number of frames received
    pub frames_received: u64,
    /// Replies that matched no pending transaction
    pub unmatched_replies: u64,
    /// Primaries that got no reply within T3
    pub t3_timeouts: u64,
    /// Linktest.req sent by this side
    pub linktests_sent: u64,
    /// Linktest.req that got no response within T6
    pub linktest_failures: u64,
    /// Reject.req sent
    pub rejects_sent: u64,
    /// Reject.req received
    pub rejects_received: u64,
    /// Established transport streams
    pub connects: u64,
    /// Torn-down transport streams
    pub disconnects: u64,
}

impl HsmsStatistics {
    /// Create new statistics with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all statistics counters
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn increment_frames_sent(&mut self) {
        self.frames_sent += 1;
    }

    pub fn increment_frames_received(&mut self) {
        self.frames_received += 1;
    }

    pub fn increment_unmatched_replies(&mut self) {
        self.unmatched_replies += 1;
    }

    pub fn increment_t3_timeouts(&mut self) {
        self.t3_timeouts += 1;
    }

    pub fn increment_linktests_sent(&mut self) {
        self.linktests_sent += 1;
    }

    pub fn increment_linktest_failures(&mut self) {
        self.linktest_failures += 1;
    }

    pub fn increment_rejects_sent(&mut self) {
        self.rejects_sent += 1;
    }

    pub fn increment_rejects_received(&mut self) {
        self.rejects_received += 1;
    }

    pub fn increment_connects(&mut self) {
        self.connects += 1;
    }

    pub fn increment_disconnects(&mut self) {
        self.disconnects += 1;
    }

    /// Share of sent primaries that timed out, as a percentage
    ///
    /// Returns 0.0 if nothing has been sent.
    pub fn timeout_rate(&self) -> f64 {
        if self.frames_sent == 0 {
            0.0
        } else {
            (self.t3_timeouts as f64 / self.frames_sent as f64) * 100.0
        }
    }
}
