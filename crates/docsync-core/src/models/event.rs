//! Local sync activity log

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

use super::document::SyncId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventKind {
    Queued,
    Uploaded,
    Downloaded,
    ConflictDetected,
    ConflictResolved,
    Failed,
    Deleted,
    Migrated,
    RolledBack,
}

impl SyncEventKind {
    pub const ALL: [Self; 9] = [
        Self::Queued,
        Self::Uploaded,
        Self::Downloaded,
        Self::ConflictDetected,
        Self::ConflictResolved,
        Self::Failed,
        Self::Deleted,
        Self::Migrated,
        Self::RolledBack,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Uploaded => "uploaded",
            Self::Downloaded => "downloaded",
            Self::ConflictDetected => "conflict_detected",
            Self::ConflictResolved => "conflict_resolved",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
            Self::Migrated => "migrated",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for SyncEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncEventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown sync event kind '{s}'")))
    }
}

/// One recorded sync event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEventRecord {
    /// Row identifier
    pub id: i64,
    pub sync_id: Option<SyncId>,
    pub kind: SyncEventKind,
    pub detail: String,
    /// Event timestamp (Unix ms)
    pub recorded_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_roundtrips_through_str() {
        for kind in SyncEventKind::ALL {
            assert_eq!(kind.as_str().parse::<SyncEventKind>().unwrap(), kind);
        }
    }
}
