//! HSMS timeout set (SEMI E37)

use crate::error::{SecsError, SecsResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-device HSMS timeouts
///
/// | Timer | Meaning | Default |
/// |-------|---------|---------|
/// | T3 | reply timeout | 45 s |
/// | T5 | connect separation | 10 s |
/// | T6 | link-test interval / control transaction | 5 s |
/// | T7 | not-selected | 10 s |
/// | T8 | inter-character / network | 5 s |
///
/// In configuration files every timer is written in seconds, e.g.
/// `t3 = 45` or `t8 = 0.5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HsmsTimeouts {
    #[serde(with = "duration_secs")]
    pub t3: Duration,
    #[serde(with = "duration_secs")]
    pub t5: Duration,
    #[serde(with = "duration_secs")]
    pub t6: Duration,
    #[serde(with = "duration_secs")]
    pub t7: Duration,
    #[serde(with = "duration_secs")]
    pub t8: Duration,
}

impl Default for HsmsTimeouts {
    fn default() -> Self {
        Self {
            t3: Duration::from_secs(45),
            t5: Duration::from_secs(10),
            t6: Duration::from_secs(5),
            t7: Duration::from_secs(10),
            t8: Duration::from_secs(5),
        }
    }
}

impl HsmsTimeouts {
    pub fn with_t3(mut self, t3: Duration) -> Self {
        self.t3 = t3;
        self
    }

    pub fn with_t5(mut self, t5: Duration) -> Self {
        self.t5 = t5;
        self
    }

    pub fn with_t6(mut self, t6: Duration) -> Self {
        self.t6 = t6;
        self
    }

    pub fn with_t7(mut self, t7: Duration) -> Self {
        self.t7 = t7;
        self
    }

    pub fn with_t8(mut self, t8: Duration) -> Self {
        self.t8 = t8;
        self
    }

    /// Reject zero timers
    pub fn validate(&self) -> SecsResult<()> {
        for (name, value) in [
            ("T3", self.t3),
            ("T5", self.t5),
            ("T6", self.t6),
            ("T7", self.t7),
            ("T8", self.t8),
        ] {
            if value.is_zero() {
                return Err(SecsError::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}

/// Serde adapter writing a `Duration` as fractional seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
