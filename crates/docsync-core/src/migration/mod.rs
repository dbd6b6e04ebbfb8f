//! Relocation of attachment files from the legacy per-username path scheme to
//! the stable per-account scheme.
//!
//! Copies are never destructive: the legacy source stays in place until
//! something outside this module removes it, and reads fall back to it while a
//! file has not been migrated.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::db::{DocumentPatch, DocumentRepository, EventLog, MappingRepository};
use crate::error::{Error, Result};
use crate::identity::{PathResolver, StableId};
use crate::models::{
    FileMigrationProgress, FileMigrationStatus, MigrationMapping, MigrationProgress,
    MigrationReport, RollbackReport, SyncEventKind, SyncId,
};
use crate::remote::{with_timeout, BlobStore, IdentityProvider, RemoteError, RemoteResult};
use crate::services::LocalStore;
use crate::util::{normalize_text_option, unix_millis_now};

enum RollbackOutcome {
    Removed,
    LegacyMissing,
    NewMissing,
}

/// Scans, copies, verifies and rolls back path migrations for one account
pub struct MigrationOrchestrator<B, I> {
    store: LocalStore,
    blobs: B,
    identity: I,
    resolver: PathResolver,
    remote_timeout: Duration,
}

impl<B: BlobStore, I: IdentityProvider> MigrationOrchestrator<B, I> {
    pub const fn new(
        store: LocalStore,
        blobs: B,
        identity: I,
        resolver: PathResolver,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            store,
            blobs,
            identity,
            resolver,
            remote_timeout,
        }
    }

    pub const fn blobs(&self) -> &B {
        &self.blobs
    }

    pub const fn identity(&self) -> &I {
        &self.identity
    }

    pub const fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    async fn call<T>(&self, call: impl Future<Output = RemoteResult<T>>) -> RemoteResult<T> {
        with_timeout(self.remote_timeout, call).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.call(self.blobs.exists(path)).await?)
    }

    /// Stable id and legacy username of the signed-in account
    async fn account(&self) -> Result<(StableId, Option<String>)> {
        let principal = self.call(self.identity.authenticate()).await?;
        let stable_id = self.resolver.resolve_stable_id(&principal)?;
        Ok((stable_id, normalize_text_option(principal.username)))
    }

    /// Mappings for every attachment of the account that still sits under the
    /// legacy scheme and has not been verified at its new path.
    pub async fn scan_legacy_files(&self, stable_id: &StableId) -> Result<Vec<MigrationMapping>> {
        let (_, username) = self.account().await?;
        let Some(username) = username else {
            debug!("Account {stable_id} has no legacy username; nothing to migrate");
            return Ok(Vec::new());
        };

        let mut pending = Vec::new();
        for document in self.store.list(false)? {
            if document.owner_id != stable_id.as_str() {
                continue;
            }
            for attachment in &document.attachments {
                let current_key = attachment
                    .remote_key
                    .as_deref()
                    .filter(|key| !self.resolver.is_legacy_path(key));
                if let Some(key) = current_key {
                    debug!("{} already lives at {key}", attachment.file_name);
                    continue;
                }
                let legacy_path = self.resolver.build_legacy_path(
                    &username,
                    &document.sync_id,
                    &attachment.file_name,
                )?;
                let existing = self.store.get_mapping(&legacy_path)?;
                if existing.as_ref().is_some_and(|mapping| mapping.verified) {
                    continue;
                }
                if !self.exists(&legacy_path).await? {
                    continue;
                }

                let mapping = match existing {
                    Some(mapping) => mapping,
                    None => MigrationMapping::new(
                        legacy_path,
                        self.resolver.build_path(
                            stable_id,
                            &document.sync_id,
                            &attachment.file_name,
                        )?,
                        stable_id.as_str(),
                        document.sync_id.clone(),
                        attachment.file_name.clone(),
                    ),
                };
                self.store.upsert_mapping(&mapping)?;
                pending.push(mapping);
            }
        }

        info!(
            "Found {} legacy files awaiting migration for {stable_id}",
            pending.len()
        );
        Ok(pending)
    }

    /// Copy the legacy file to its new path and verify the copy.
    ///
    /// The legacy source is left in place.
    pub async fn migrate_file(&self, mapping: &MigrationMapping) -> Result<MigrationMapping> {
        let mut mapping = mapping.clone();

        let bytes = match self.call(self.blobs.get(&mapping.legacy_path)).await {
            Ok(bytes) => bytes,
            Err(RemoteError::NotFound(_)) => {
                self.record_failure(&mut mapping, "legacy file is missing")?;
                return Err(Error::FileNotFound(mapping.legacy_path));
            }
            Err(error) => {
                self.record_failure(&mut mapping, &error.to_string())?;
                return Err(error.into());
            }
        };

        if let Err(error) = self.call(self.blobs.put(&mapping.new_path, &bytes)).await {
            self.record_failure(&mut mapping, &error.to_string())?;
            return Err(error.into());
        }
        mapping.migrated_at = Some(unix_millis_now());
        mapping.last_error = None;
        self.store.upsert_mapping(&mapping)?;

        self.verify_migration(&mut mapping).await?;
        Ok(mapping)
    }

    /// Confirm the new copy exists and matches the legacy size.
    ///
    /// On a size mismatch the new copy is deleted and
    /// `MigrationVerificationFailed` is returned; the mapping stays unverified
    /// and can be retried. A copy whose legacy source has vanished cannot be
    /// compared, so it is kept but never marked verified.
    pub async fn verify_migration(&self, mapping: &mut MigrationMapping) -> Result<()> {
        let new_size = self.call(self.blobs.size(&mapping.new_path)).await?;
        let legacy_size = self.call(self.blobs.size(&mapping.legacy_path)).await?;

        let failure = match (new_size, legacy_size) {
            (None, _) => Some(("new copy is missing".to_string(), false)),
            (Some(_), None) => Some(("legacy source missing".to_string(), false)),
            (Some(new), Some(legacy)) if new != legacy => Some((
                format!("size mismatch: new copy has {new} bytes, legacy has {legacy}"),
                true,
            )),
            _ => None,
        };

        if let Some((reason, remove_copy)) = failure {
            warn!(
                "Verification of {} failed: {reason}",
                mapping.new_path
            );
            if remove_copy {
                if let Err(error) = self.call(self.blobs.delete(&mapping.new_path)).await {
                    warn!("Could not remove bad copy {}: {error}", mapping.new_path);
                }
                mapping.migrated_at = None;
            }
            mapping.verified = false;
            self.record_failure(mapping, &reason)?;
            return Err(Error::MigrationVerificationFailed {
                path: mapping.new_path.clone(),
                reason,
            });
        }

        mapping.verified = true;
        mapping.last_error = None;
        self.store.upsert_mapping(mapping)?;
        self.point_attachment_at(&mapping.document_id, &mapping.file_name, &mapping.new_path)?;
        self.store.record(
            Some(&mapping.document_id),
            SyncEventKind::Migrated,
            &format!("{} -> {}", mapping.legacy_path, mapping.new_path),
        )?;
        Ok(())
    }

    fn record_failure(&self, mapping: &mut MigrationMapping, reason: &str) -> Result<()> {
        mapping.last_error = Some(reason.to_string());
        self.store.upsert_mapping(mapping)
    }

    /// Rewrite an attachment's remote key; device paths and versions are untouched
    fn point_attachment_at(&self, sync_id: &SyncId, file_name: &str, path: &str) -> Result<()> {
        let Some(document) = self.store.get(sync_id)? else {
            return Ok(());
        };
        match document.attachment(file_name) {
            Some(attachment) if attachment.remote_key.as_deref() != Some(path) => {}
            _ => return Ok(()),
        }

        let attachments = document
            .attachments
            .iter()
            .cloned()
            .map(|mut attachment| {
                if attachment.file_name == file_name {
                    attachment.remote_key = Some(path.to_string());
                }
                attachment
            })
            .collect();
        self.store.update_by_sync_id(
            sync_id,
            &DocumentPatch {
                attachments: Some(attachments),
                ..DocumentPatch::default()
            },
        )?;
        Ok(())
    }

    /// Per-file status for every mapping recorded for the account
    pub async fn get_migration_progress(&self, stable_id: &StableId) -> Result<MigrationProgress> {
        let mut files = Vec::new();
        for mapping in self.store.mappings_for_owner(stable_id.as_str())? {
            let legacy_exists = self.exists(&mapping.legacy_path).await?;
            let new_exists = mapping.verified && self.exists(&mapping.new_path).await?;
            let status = match (new_exists, legacy_exists) {
                (true, true) => FileMigrationStatus::Migrated,
                (true, false) => FileMigrationStatus::MigratedLegacyDeleted,
                (false, true) => FileMigrationStatus::Pending,
                (false, false) => FileMigrationStatus::FailedMissingFiles,
            };
            files.push(FileMigrationProgress { mapping, status });
        }
        Ok(MigrationProgress::from_files(files))
    }

    /// Undo every migrated file of the account whose legacy copy still exists
    pub async fn rollback_migration(&self, stable_id: &StableId) -> Result<RollbackReport> {
        let mappings = self.store.mappings_for_owner(stable_id.as_str())?;
        let report = self.rollback(mappings).await;
        info!(
            "Rollback for {stable_id}: {} removed, {} kept (legacy missing), {} already absent, {} failed",
            report.removed, report.skipped_legacy_missing, report.skipped_new_missing, report.failed
        );
        Ok(report)
    }

    /// Undo the migrated files of one document
    pub async fn rollback_for_document(&self, sync_id: &SyncId) -> Result<RollbackReport> {
        let mappings = self.store.mappings_for_document(sync_id)?;
        Ok(self.rollback(mappings).await)
    }

    async fn rollback(&self, mappings: Vec<MigrationMapping>) -> RollbackReport {
        let mut report = RollbackReport::default();
        for mapping in mappings {
            if !mapping.verified && mapping.migrated_at.is_none() {
                continue;
            }
            match self.rollback_file(mapping).await {
                Ok(RollbackOutcome::Removed) => report.removed += 1,
                Ok(RollbackOutcome::LegacyMissing) => report.skipped_legacy_missing += 1,
                Ok(RollbackOutcome::NewMissing) => report.skipped_new_missing += 1,
                Err(error) => {
                    warn!("Rollback step failed: {error}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Remove the new copy if the legacy one is still there.
    async fn rollback_file(&self, mut mapping: MigrationMapping) -> Result<RollbackOutcome> {
        if !self.exists(&mapping.legacy_path).await? {
            warn!(
                "Keeping {}: legacy copy {} no longer exists",
                mapping.new_path, mapping.legacy_path
            );
            return Ok(RollbackOutcome::LegacyMissing);
        }
        if !self.exists(&mapping.new_path).await? {
            debug!("Nothing to roll back at {}", mapping.new_path);
            mapping.verified = false;
            mapping.migrated_at = None;
            self.store.upsert_mapping(&mapping)?;
            self.point_attachment_at(&mapping.document_id, &mapping.file_name, &mapping.legacy_path)?;
            return Ok(RollbackOutcome::NewMissing);
        }

        self.call(self.blobs.delete(&mapping.new_path)).await?;
        mapping.verified = false;
        mapping.migrated_at = None;
        mapping.last_error = None;
        self.store.upsert_mapping(&mapping)?;
        self.point_attachment_at(&mapping.document_id, &mapping.file_name, &mapping.legacy_path)?;
        self.store.record(
            Some(&mapping.document_id),
            SyncEventKind::RolledBack,
            &format!("{} -> {}", mapping.new_path, mapping.legacy_path),
        )?;
        Ok(RollbackOutcome::Removed)
    }

    async fn candidate_paths(
        &self,
        sync_id: &SyncId,
        file_name: &str,
    ) -> Result<(String, Option<String>)> {
        let (stable_id, username) = self.account().await?;
        let new_path = self.resolver.build_path(&stable_id, sync_id, file_name)?;
        let legacy_path = username
            .map(|username| self.resolver.build_legacy_path(&username, sync_id, file_name))
            .transpose()?;
        Ok((new_path, legacy_path))
    }

    /// Read an attachment from its new path, falling back to the legacy path
    pub async fn read_file_with_fallback(
        &self,
        sync_id: &SyncId,
        file_name: &str,
    ) -> Result<Vec<u8>> {
        let (new_path, legacy_path) = self.candidate_paths(sync_id, file_name).await?;
        for path in std::iter::once(&new_path).chain(legacy_path.as_ref()) {
            match self.call(self.blobs.get(path)).await {
                Ok(bytes) => {
                    if path != &new_path {
                        debug!("Served {file_name} of {sync_id} from legacy path");
                    }
                    return Ok(bytes);
                }
                Err(RemoteError::NotFound(_)) => {}
                Err(error) => return Err(error.into()),
            }
        }
        Err(Error::FileNotFound(new_path))
    }

    /// Whether an attachment is readable under either path scheme
    pub async fn file_exists_with_fallback(&self, sync_id: &SyncId, file_name: &str) -> Result<bool> {
        let (new_path, legacy_path) = self.candidate_paths(sync_id, file_name).await?;
        if self.exists(&new_path).await? {
            return Ok(true);
        }
        match legacy_path {
            Some(path) => self.exists(&path).await,
            None => Ok(false),
        }
    }

    /// Migrate every pending file of the account.
    ///
    /// `cancel` is checked between files, never during a copy. A later run
    /// resumes with the files that are still unverified.
    pub async fn run_migration(
        &self,
        stable_id: &StableId,
        cancel: &AtomicBool,
    ) -> Result<MigrationReport> {
        let mut report = MigrationReport {
            already_migrated: self
                .store
                .mappings_for_owner(stable_id.as_str())?
                .iter()
                .filter(|mapping| mapping.verified)
                .count(),
            ..MigrationReport::default()
        };

        for mapping in self.scan_legacy_files(stable_id).await? {
            if cancel.load(Ordering::SeqCst) {
                info!("Migration for {stable_id} cancelled");
                report.cancelled = true;
                break;
            }
            match self.migrate_file(&mapping).await {
                Ok(_) => report.migrated += 1,
                Err(error) => {
                    warn!("Migrating {} failed: {error}", mapping.legacy_path);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Migration for {stable_id}: {} migrated, {} failed, {} already done",
            report.migrated, report.failed, report.already_migrated
        );
        Ok(report)
    }
}
