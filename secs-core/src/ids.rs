//! Logical identifiers exchanged with the host

use serde::{Deserialize, Serialize};
use std::fmt;

/// HSMS session id of a device (unique within a manager, never 0)
pub type DeviceId = u16;
/// Status variable id
pub type Svid = u32;
/// Collection event id
pub type Ceid = u32;
/// Equipment constant id
pub type Ecid = u32;
/// Alarm id
pub type Alid = u32;
/// Report id
pub type Rptid = u32;

/// Kind of a logical identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Svid,
    Ceid,
    Ecid,
    Alid,
    Rptid,
}

impl IdentifierKind {
    /// All identifier kinds, in catalog loading order
    pub const ALL: [IdentifierKind; 5] = [
        IdentifierKind::Svid,
        IdentifierKind::Ecid,
        IdentifierKind::Ceid,
        IdentifierKind::Alid,
        IdentifierKind::Rptid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Svid => "SVID",
            Self::Ceid => "CEID",
            Self::Ecid => "ECID",
            Self::Alid => "ALID",
            Self::Rptid => "RPTID",
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
