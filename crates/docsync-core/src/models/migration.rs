//! Storage path migration model

use serde::{Deserialize, Serialize};
use std::fmt;

use super::document::SyncId;

/// Relocation of one attachment file from the legacy path scheme to the
/// current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationMapping {
    pub legacy_path: String,
    pub new_path: String,
    /// Stable id of the owning account
    pub owner_id: String,
    pub document_id: SyncId,
    pub file_name: String,
    /// Copy timestamp (Unix ms), set once bytes were written to the new path
    pub migrated_at: Option<i64>,
    /// Set only after new-path existence and size match were both confirmed
    pub verified: bool,
    /// Last copy or verification failure
    pub last_error: Option<String>,
}

impl MigrationMapping {
    #[must_use]
    pub fn new(
        legacy_path: impl Into<String>,
        new_path: impl Into<String>,
        owner_id: impl Into<String>,
        document_id: SyncId,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            legacy_path: legacy_path.into(),
            new_path: new_path.into(),
            owner_id: owner_id.into(),
            document_id,
            file_name: file_name.into(),
            migrated_at: None,
            verified: false,
            last_error: None,
        }
    }
}

/// Per-file migration status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMigrationStatus {
    /// Verified under the new path, legacy copy still present
    Migrated,
    /// Not yet verified, legacy copy present
    Pending,
    /// Verified under the new path, legacy copy since removed
    MigratedLegacyDeleted,
    /// Neither a verified new copy nor a legacy source exists
    FailedMissingFiles,
}

impl fmt::Display for FileMigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Migrated => "migrated",
            Self::Pending => "pending",
            Self::MigratedLegacyDeleted => "migrated_legacy_deleted",
            Self::FailedMissingFiles => "failed_missing_files",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMigrationProgress {
    pub mapping: MigrationMapping,
    pub status: FileMigrationStatus,
}

/// Snapshot of an account's migration, polled by callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub files: Vec<FileMigrationProgress>,
    pub total: usize,
    pub completed: usize,
    pub percentage: f64,
    /// True iff at least one file is migrated with its legacy source still present
    pub can_rollback: bool,
}

impl MigrationProgress {
    #[must_use]
    pub fn from_files(files: Vec<FileMigrationProgress>) -> Self {
        let total = files.len();
        let completed = files
            .iter()
            .filter(|file| {
                matches!(
                    file.status,
                    FileMigrationStatus::Migrated | FileMigrationStatus::MigratedLegacyDeleted
                )
            })
            .count();
        let can_rollback = files
            .iter()
            .any(|file| file.status == FileMigrationStatus::Migrated);

        #[allow(clippy::cast_precision_loss)]
        let percentage = if total == 0 {
            100.0
        } else {
            completed as f64 * 100.0 / total as f64
        };

        Self {
            files,
            total,
            completed,
            percentage,
            can_rollback,
        }
    }

    #[must_use]
    pub fn count(&self, status: FileMigrationStatus) -> usize {
        self.files.iter().filter(|file| file.status == status).count()
    }
}

/// Outcome of a migration batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub migrated: usize,
    pub failed: usize,
    pub already_migrated: usize,
    pub cancelled: bool,
}

/// Outcome of a rollback; partial failures are counted, not fatal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub removed: usize,
    /// Kept because the legacy copy is gone and the new copy is the only one
    pub skipped_legacy_missing: usize,
    /// Nothing to remove: the new copy was never written or is already gone
    #[serde(default)]
    pub skipped_new_missing: usize,
    pub failed: usize,
}
