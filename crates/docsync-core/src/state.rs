//! Per-document sync state and its transition table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Sync state of one document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    PendingUpload,
    PendingDownload,
    Uploading,
    Downloading,
    Conflict,
    Error,
}

impl SyncState {
    pub const ALL: [Self; 7] = [
        Self::Synced,
        Self::PendingUpload,
        Self::PendingDownload,
        Self::Uploading,
        Self::Downloading,
        Self::Conflict,
        Self::Error,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::PendingUpload => "pending_upload",
            Self::PendingDownload => "pending_download",
            Self::Uploading => "uploading",
            Self::Downloading => "downloading",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }

    /// A remote operation for this document is in flight
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Uploading | Self::Downloading)
    }

    /// Apply `trigger`, returning the next state or `None` when the
    /// transition does not exist.
    #[must_use]
    pub const fn next(self, trigger: Trigger) -> Option<Self> {
        use SyncState::{
            Conflict, Downloading, Error, PendingDownload, PendingUpload, Synced, Uploading,
        };
        use Trigger::{
            Dispatch, DownloadCompleted, DownloadStarted, Failed, LocalEdit, RemoteAccepted,
            RemoteChanged, Resolved, Retry, VersionRejected,
        };

        let next = match (self, trigger) {
            (Conflict, LocalEdit) => Conflict,
            (_, LocalEdit) => PendingUpload,

            (PendingUpload, Dispatch) => Uploading,
            (Uploading, RemoteAccepted) => Synced,
            (Uploading | Downloading, Failed) => Error,
            (Uploading | Downloading, VersionRejected) => Conflict,

            (Synced | Error | PendingDownload, RemoteChanged) => PendingDownload,
            (PendingDownload, DownloadStarted) => Downloading,
            (Downloading, DownloadCompleted) => Synced,

            (Error, Retry(Direction::Upload)) => PendingUpload,
            (Error, Retry(Direction::Download)) => PendingDownload,

            (Conflict, Resolved { needs_push: true }) => PendingUpload,
            (Conflict, Resolved { needs_push: false }) => Synced,

            _ => return None,
        };
        Some(next)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown sync state '{s}'")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Events that move a document between sync states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    LocalEdit,
    Dispatch,
    RemoteAccepted,
    /// The remote store rejected the expected prior version
    VersionRejected,
    /// Non-conflict failure (network, permission, validation)
    Failed,
    Retry(Direction),
    RemoteChanged,
    DownloadStarted,
    DownloadCompleted,
    /// The conflict resolver produced a single document
    Resolved { needs_push: bool },
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::LocalEdit => "local_edit",
            Self::Dispatch => "dispatch",
            Self::RemoteAccepted => "remote_accepted",
            Self::VersionRejected => "version_rejected",
            Self::Failed => "failed",
            Self::Retry(Direction::Upload) => "retry_upload",
            Self::Retry(Direction::Download) => "retry_download",
            Self::RemoteChanged => "remote_changed",
            Self::DownloadStarted => "download_started",
            Self::DownloadCompleted => "download_completed",
            Self::Resolved { .. } => "resolved",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_path() {
        let state = SyncState::PendingUpload;
        let state = state.next(Trigger::Dispatch).unwrap();
        assert_eq!(state, SyncState::Uploading);
        assert_eq!(state.next(Trigger::RemoteAccepted), Some(SyncState::Synced));
        assert_eq!(state.next(Trigger::Failed), Some(SyncState::Error));
        assert_eq!(state.next(Trigger::VersionRejected), Some(SyncState::Conflict));
    }

    #[test]
    fn download_path() {
        let state = SyncState::Synced.next(Trigger::RemoteChanged).unwrap();
        assert_eq!(state, SyncState::PendingDownload);
        let state = state.next(Trigger::DownloadStarted).unwrap();
        assert_eq!(state, SyncState::Downloading);
        assert_eq!(
            state.next(Trigger::DownloadCompleted),
            Some(SyncState::Synced)
        );
    }

    #[test]
    fn error_retries_back_to_pending() {
        assert_eq!(
            SyncState::Error.next(Trigger::Retry(Direction::Upload)),
            Some(SyncState::PendingUpload)
        );
        assert_eq!(
            SyncState::Error.next(Trigger::Retry(Direction::Download)),
            Some(SyncState::PendingDownload)
        );
        assert_eq!(SyncState::Synced.next(Trigger::Retry(Direction::Upload)), None);
    }

    #[test]
    fn conflict_and_error_never_connect() {
        for trigger in [
            Trigger::Failed,
            Trigger::Dispatch,
            Trigger::RemoteAccepted,
            Trigger::Retry(Direction::Upload),
            Trigger::RemoteChanged,
        ] {
            assert_ne!(SyncState::Conflict.next(trigger), Some(SyncState::Error));
        }
        assert_eq!(SyncState::Error.next(Trigger::VersionRejected), None);
    }

    #[test]
    fn conflict_leaves_only_through_resolution() {
        assert_eq!(
            SyncState::Conflict.next(Trigger::LocalEdit),
            Some(SyncState::Conflict)
        );
        assert_eq!(
            SyncState::Conflict.next(Trigger::Resolved { needs_push: true }),
            Some(SyncState::PendingUpload)
        );
        assert_eq!(
            SyncState::Conflict.next(Trigger::Resolved { needs_push: false }),
            Some(SyncState::Synced)
        );
        assert_eq!(SyncState::Synced.next(Trigger::Resolved { needs_push: true }), None);
    }

    #[test]
    fn state_roundtrips_through_str() {
        for state in SyncState::ALL {
            assert_eq!(state.as_str().parse::<SyncState>().unwrap(), state);
        }
    }
}
