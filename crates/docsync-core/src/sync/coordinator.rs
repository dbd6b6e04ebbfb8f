//! Sync coordinator: drains the offline queue against the remote stores,
//! reconciles remote changes and owns the conflict lifecycle.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::db::{ConflictRepository, DocumentPatch, DocumentRepository, EventLog};
use crate::error::{Error, Result};
use crate::migration::MigrationOrchestrator;
use crate::models::{
    ConflictId, Document, DocumentConflict, FileReference, OperationPayload, OperationType,
    QueuedOperation, ResolutionStrategy, SyncEventKind, SyncEventRecord, SyncId,
};
use crate::queue::{DispatchOutcome, DrainReport, OfflineQueue, OperationDispatcher, QueueStatus};
use crate::remote::{
    with_timeout, BlobStore, IdentityProvider, MetadataStore, RemoteError, RemoteResult,
};
use crate::services::LocalStore;
use crate::state::{Direction, SyncState, Trigger};
use crate::util::lock_unpoisoned;

use super::conflict::{carry_local_paths, detect, resolve, Detection, Resolution};
use super::machine::StateMachine;
use super::retry::with_retry;

type SharedOutcome = Option<std::result::Result<SyncSummary, String>>;

/// Counts for one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub uploaded: usize,
    pub downloaded: usize,
    pub deleted: usize,
    pub files_uploaded: usize,
    pub files_downloaded: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub retried: usize,
    pub deferred: usize,
    /// Entries removed after exhausting their attempts
    pub dropped: usize,
    /// The pass stopped early because the identity provider needs a sign-in
    pub auth_required: bool,
    /// Nothing was attempted because the device is offline
    pub offline: bool,
}

impl SyncSummary {
    fn absorb(&mut self, report: &DrainReport) {
        for operation in &report.completed {
            match operation.op_type {
                OperationType::Upload | OperationType::Update => self.uploaded += 1,
                OperationType::Delete => self.deleted += 1,
                OperationType::FileUpload => self.files_uploaded += 1,
                OperationType::FileDownload => self.files_downloaded += 1,
            }
        }
        self.conflicts += report.conflicts.len();
        self.failed += report.failed.len();
        self.retried += report.retried.len();
        self.deferred += report.deferred;
        self.dropped += report.dropped.len();
        self.auth_required |= report.auth_required;
    }

    fn record_pull(&mut self, outcome: &PullOutcome) {
        match outcome {
            PullOutcome::Created | PullOutcome::Updated => self.downloaded += 1,
            PullOutcome::Deleted => self.deleted += 1,
            PullOutcome::Conflict(_) | PullOutcome::Resolved(_) => self.conflicts += 1,
            PullOutcome::UpToDate | PullOutcome::NotFound => {}
        }
    }
}

/// What pulling one document changed locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate,
    /// First local copy of a document created elsewhere
    Created,
    Updated,
    /// The remote tombstone was applied and the local copy purged
    Deleted,
    /// The remote has no record of the document
    NotFound,
    /// Both sides changed; the conflict waits for a caller decision
    Conflict(ConflictId),
    /// Both sides changed and the configured policy settled it
    Resolved(ConflictId),
}

/// Snapshot of the engine for status displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub online: bool,
    pub queue: QueueStatus,
    /// Local documents per sync state, tombstones included
    pub documents: Vec<(SyncState, usize)>,
    pub open_conflicts: usize,
    pub last_summary: Option<SyncSummary>,
}

/// Where a document is headed; the trigger path depends on where it is now
#[derive(Debug, Clone, Copy)]
enum Goal {
    Uploading,
    Conflict,
    Synced,
}

fn path_to(state: SyncState, goal: Goal) -> Option<&'static [Trigger]> {
    use SyncState as S;
    use Trigger as T;

    let path: &'static [Trigger] = match (goal, state) {
        (Goal::Uploading, S::Uploading) | (Goal::Conflict, S::Conflict) => &[],
        (Goal::Uploading, S::PendingUpload) => &[T::Dispatch],
        (Goal::Uploading, S::Error) => &[T::Retry(Direction::Upload), T::Dispatch],
        (Goal::Uploading, S::Synced) => &[T::LocalEdit, T::Dispatch],

        (Goal::Conflict, S::Uploading | S::Downloading) => &[T::VersionRejected],
        (Goal::Conflict, S::PendingUpload) => &[T::Dispatch, T::VersionRejected],
        (Goal::Conflict, S::PendingDownload) => &[T::DownloadStarted, T::VersionRejected],
        (Goal::Conflict, S::Error) => &[
            T::Retry(Direction::Upload),
            T::Dispatch,
            T::VersionRejected,
        ],
        (Goal::Conflict, S::Synced) => &[T::LocalEdit, T::Dispatch, T::VersionRejected],

        (Goal::Synced, S::Uploading) => &[T::RemoteAccepted],
        (Goal::Synced, S::PendingUpload) => &[T::Dispatch, T::RemoteAccepted],
        (Goal::Synced, S::Downloading) => &[T::DownloadCompleted],
        (Goal::Synced, S::PendingDownload) => &[T::DownloadStarted, T::DownloadCompleted],
        (Goal::Synced, S::Synced | S::Error) => &[
            T::RemoteChanged,
            T::DownloadStarted,
            T::DownloadCompleted,
        ],
        _ => return None,
    };
    Some(path)
}

fn needs_authentication(error: &Error) -> bool {
    match error {
        Error::IdentityUnavailable(_) => true,
        Error::Remote(remote) => remote.needs_authentication(),
        _ => false,
    }
}

/// Queue outcome for a failed dispatch
fn outcome_for(error: &Error) -> DispatchOutcome {
    if needs_authentication(error) {
        DispatchOutcome::AuthRequired(error.to_string())
    } else if error.is_retriable() {
        DispatchOutcome::Retry(error.to_string())
    } else {
        DispatchOutcome::Failed(error.to_string())
    }
}

/// Clears the shared pass slot when the leading caller finishes or is dropped
struct InFlightGuard<'a> {
    slot: &'a Mutex<Option<watch::Receiver<SharedOutcome>>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock_unpoisoned(self.slot).take();
    }
}

/// Releases a document claimed for remote work when dropped
struct DocumentClaim<'a> {
    busy: &'a Mutex<BTreeSet<SyncId>>,
    sync_id: SyncId,
}

impl Drop for DocumentClaim<'_> {
    fn drop(&mut self) {
        lock_unpoisoned(self.busy).remove(&self.sync_id);
    }
}

/// Orchestrates uploads, downloads, deletes and file transfers for one device.
///
/// Local mutations are recorded by the methods in `local.rs` and queued; the
/// remote side is only touched from a sync pass or an explicit
/// [`SyncCoordinator::sync_document`].
pub struct SyncCoordinator<M, B, I> {
    store: LocalStore,
    queue: OfflineQueue<LocalStore>,
    pub(super) machine: StateMachine<LocalStore>,
    metadata: M,
    migration: MigrationOrchestrator<B, I>,
    config: SyncConfig,
    online: AtomicBool,
    in_flight: Mutex<Option<watch::Receiver<SharedOutcome>>>,
    /// Documents with a remote operation running in this process
    busy: Mutex<BTreeSet<SyncId>>,
    last_summary: Mutex<Option<SyncSummary>>,
}

impl<M: MetadataStore, B: BlobStore, I: IdentityProvider> SyncCoordinator<M, B, I> {
    pub fn new(
        store: LocalStore,
        metadata: M,
        blobs: B,
        identity: I,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let migration = MigrationOrchestrator::new(
            store.clone(),
            blobs,
            identity,
            config.path_resolver()?,
            config.remote_timeout(),
        );
        Ok(Self {
            queue: OfflineQueue::new(store.clone(), config.max_queue_attempts),
            machine: StateMachine::new(store.clone()),
            store,
            metadata,
            migration,
            config,
            online: AtomicBool::new(true),
            in_flight: Mutex::new(None),
            busy: Mutex::new(BTreeSet::new()),
            last_summary: Mutex::new(None),
        })
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    pub const fn queue(&self) -> &OfflineQueue<LocalStore> {
        &self.queue
    }

    pub const fn metadata(&self) -> &M {
        &self.metadata
    }

    pub const fn migration(&self) -> &MigrationOrchestrator<B, I> {
        &self.migration
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Reload the persisted queue if this process has not done so yet
    pub(super) fn ensure_queue(&self) -> Result<()> {
        if self.queue.is_initialized() {
            return Ok(());
        }
        let report = self.queue.initialize()?;
        if !report.is_healthy() {
            warn!(
                "Offline queue recovered with {} bad rows and {} duplicates",
                report.anomalies.len(),
                report.duplicates
            );
        }
        Ok(())
    }

    pub(super) fn event(&self, sync_id: &SyncId, kind: SyncEventKind, detail: &str) -> Result<()> {
        self.store.record(Some(sync_id), kind, detail)?;
        Ok(())
    }

    pub(super) fn current(&self, sync_id: &SyncId) -> Result<Document> {
        self.store
            .get(sync_id)?
            .ok_or_else(|| Error::NotFound(sync_id.to_string()))
    }

    /// One remote call with the configured deadline and retry policy
    async fn remote<T, F, Fut>(&self, operation: &str, call: F) -> RemoteResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let limit = self.config.remote_timeout();
        with_retry(&self.config.retry, operation, || with_timeout(limit, call())).await
    }

    /// Reserve `sync_id` for remote work; `None` while another task holds it.
    ///
    /// A document left `Uploading` by an interrupted process is not held by
    /// anyone and can be claimed again.
    fn claim(&self, sync_id: &SyncId) -> Option<DocumentClaim<'_>> {
        if !lock_unpoisoned(&self.busy).insert(sync_id.clone()) {
            return None;
        }
        Some(DocumentClaim {
            busy: &self.busy,
            sync_id: sync_id.clone(),
        })
    }

    fn advance(&self, sync_id: &SyncId, goal: Goal, patch: DocumentPatch) -> Result<Document> {
        let state = self.current(sync_id)?.sync_state;
        let path = path_to(state, goal).ok_or_else(|| Error::InvalidTransition {
            sync_id: sync_id.to_string(),
            from: state.to_string(),
            trigger: format!("{goal:?}"),
        })?;
        self.machine.apply_path(sync_id, path, patch)
    }

    /// Run a full sync pass, or join the one already running.
    ///
    /// Concurrent callers share a single pass and all receive its summary.
    pub async fn trigger_sync(&self) -> Result<SyncSummary> {
        let (leader, follower) = {
            let mut slot = lock_unpoisoned(&self.in_flight);
            match slot.as_ref() {
                Some(receiver) => (None, Some(receiver.clone())),
                None => {
                    let (sender, receiver) = watch::channel(None);
                    *slot = Some(receiver);
                    (Some(sender), None)
                }
            }
        };

        if let Some(mut receiver) = follower {
            debug!("Sync pass already running; waiting for its result");
            let shared = match receiver.wait_for(Option::is_some).await {
                Ok(value) => SharedOutcome::clone(&value),
                Err(_) => None,
            };
            return match shared {
                Some(Ok(summary)) => Ok(summary),
                Some(Err(message)) => Err(Error::SyncFailed(message)),
                None => Err(Error::SyncFailed(
                    "the running pass ended without a result".to_string(),
                )),
            };
        }

        let _guard = InFlightGuard {
            slot: &self.in_flight,
        };
        let result = self.run_pass().await;
        if let Some(sender) = leader {
            sender.send_replace(Some(
                result
                    .as_ref()
                    .map(Clone::clone)
                    .map_err(ToString::to_string),
            ));
        }
        result
    }

    async fn run_pass(&self) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        if !self.is_online() {
            info!("Offline; sync pass skipped");
            summary.offline = true;
            return Ok(summary);
        }

        let authenticated = with_timeout(
            self.config.remote_timeout(),
            self.migration.identity().authenticate(),
        )
        .await;
        if let Err(error) = authenticated {
            if error.needs_authentication() {
                warn!("Sync pass blocked until sign-in: {error}");
                summary.auth_required = true;
                self.remember(&summary);
                return Ok(summary);
            }
            return Err(error.into());
        }

        self.ensure_queue()?;
        let report = self.queue.process_queue(self).await?;
        for dropped in &report.dropped {
            self.event(
                &dropped.document_id,
                SyncEventKind::Failed,
                &format!("{} dropped after {} attempts", dropped.op_type, dropped.retry_count + 1),
            )?;
        }
        summary.absorb(&report);

        if !summary.auth_required {
            for document in self.store.list_by_state(SyncState::PendingDownload)? {
                let Some(_claim) = self.claim(&document.sync_id) else {
                    summary.deferred += 1;
                    continue;
                };
                match self.pull_document(&document.sync_id).await {
                    Ok(outcome) => summary.record_pull(&outcome),
                    Err(error) if needs_authentication(&error) => {
                        summary.auth_required = true;
                        break;
                    }
                    Err(error) => {
                        warn!("Pulling {} failed: {error}", document.sync_id);
                        summary.failed += 1;
                    }
                }
            }
        }

        info!(
            uploaded = summary.uploaded,
            downloaded = summary.downloaded,
            deleted = summary.deleted,
            conflicts = summary.conflicts,
            failed = summary.failed,
            "Sync pass finished"
        );
        self.remember(&summary);
        Ok(summary)
    }

    fn remember(&self, summary: &SyncSummary) {
        *lock_unpoisoned(&self.last_summary) = Some(summary.clone());
    }

    /// Push pending changes of one document, then pull its remote copy.
    ///
    /// Returns the resulting local copy, or `None` once it no longer exists.
    /// A document already being pushed or pulled by a running pass is left to
    /// that pass and returned as it is.
    pub async fn sync_document(&self, sync_id: &SyncId) -> Result<Option<Document>> {
        if !self.is_online() {
            debug!("Offline; {sync_id} left for the next pass");
            return self.store.get(sync_id);
        }
        let Some(_claim) = self.claim(sync_id) else {
            debug!("{sync_id} is already syncing; left to the running pass");
            return self.store.get(sync_id);
        };
        self.ensure_queue()?;

        if let Some(document) = self.store.get(sync_id)? {
            if document.deleted {
                self.delete_remote(sync_id).await?;
                self.queue.remove_document(sync_id)?;
                return Ok(None);
            }
            if document.has_unpushed_changes() && document.sync_state != SyncState::Conflict {
                let pending = self.queue.pending_for(sync_id);
                let outcome = self.push_document(sync_id).await?;
                if matches!(outcome, DispatchOutcome::Completed | DispatchOutcome::Conflict) {
                    for operation in pending
                        .iter()
                        .filter(|operation| operation.op_type.is_document_level())
                    {
                        self.queue.discard(operation)?;
                    }
                }
            }
        }

        self.pull_document(sync_id).await?;
        self.store.get(sync_id)
    }

    /// Fetch the remote copy of one document and fold it into the local one
    pub async fn pull_document(&self, sync_id: &SyncId) -> Result<PullOutcome> {
        let remote = match self
            .remote("fetch", || self.metadata.fetch(sync_id))
            .await
        {
            Ok(remote) => remote,
            Err(RemoteError::NotFound(_)) => {
                if let Some(local) = self.store.get(sync_id)? {
                    self.settle_without_download(&local)?;
                }
                return Ok(PullOutcome::NotFound);
            }
            Err(error) => return Err(error.into()),
        };

        let Some(local) = self.store.get(sync_id)? else {
            if remote.deleted {
                return Ok(PullOutcome::Deleted);
            }
            let mut created = remote;
            created.sync_state = SyncState::Synced;
            created.conflict_id = None;
            created.base_version = created.version;
            self.store.insert(&created)?;
            self.event(sync_id, SyncEventKind::Downloaded, "first copy on this device")?;
            self.queue_missing_files(&created)?;
            return Ok(PullOutcome::Created);
        };

        if local.sync_state == SyncState::Conflict {
            if let Some(existing) = self.store.conflict_for_document(sync_id)? {
                return Ok(PullOutcome::Conflict(existing.id));
            }
        }
        self.reconcile(&local, &remote).await
    }

    /// Leave a pending download without taking anything from the remote
    fn settle_without_download(&self, local: &Document) -> Result<()> {
        if !matches!(
            local.sync_state,
            SyncState::PendingDownload | SyncState::Downloading
        ) {
            return Ok(());
        }
        if local.has_unpushed_changes() {
            self.machine.apply(&local.sync_id, Trigger::LocalEdit)?;
        } else {
            self.advance(&local.sync_id, Goal::Synced, DocumentPatch::default())?;
        }
        Ok(())
    }

    async fn reconcile(&self, local: &Document, remote: &Document) -> Result<PullOutcome> {
        match detect(local, remote) {
            Detection::UpToDate => {
                self.settle_without_download(local)?;
                Ok(PullOutcome::UpToDate)
            }
            Detection::FastForward if remote.deleted => {
                self.purge_local(&local.sync_id, "deleted on another device")
                    .await?;
                Ok(PullOutcome::Deleted)
            }
            Detection::FastForward => {
                self.adopt_remote(local, remote)?;
                Ok(PullOutcome::Updated)
            }
            Detection::Converged => {
                debug!("{} converged at remote version {}", local.sync_id, remote.version);
                self.adopt_remote(local, remote)?;
                for operation in self.queue.pending_for(&local.sync_id) {
                    if operation.op_type.is_document_level() {
                        self.queue.discard(&operation)?;
                    }
                }
                Ok(PullOutcome::Updated)
            }
            Detection::Conflict(conflict) => self.enter_conflict(conflict).await,
        }
    }

    /// Replace the local copy with the remote one, keeping device file paths
    fn adopt_remote(&self, local: &Document, remote: &Document) -> Result<Document> {
        let mut adopted = remote.clone();
        adopted.attachments = carry_local_paths(&remote.attachments, local);
        adopted.base_version = remote.version;
        adopted.conflict_id = None;

        let stored = self.advance(
            &local.sync_id,
            Goal::Synced,
            DocumentPatch::from_document(&adopted),
        )?;
        self.event(
            &local.sync_id,
            SyncEventKind::Downloaded,
            &format!("version {}", stored.version),
        )?;
        self.queue_missing_files(&stored)?;
        Ok(stored)
    }

    /// Queue downloads for attachments that only exist remotely
    fn queue_missing_files(&self, document: &Document) -> Result<()> {
        if self.config.files_dir.is_none() {
            return Ok(());
        }
        let missing: Vec<_> = document
            .attachments
            .iter()
            .filter(|attachment| attachment.needs_download())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        self.ensure_queue()?;
        for attachment in missing {
            self.queue.enqueue(
                &document.sync_id,
                OperationType::FileDownload,
                OperationPayload::File(FileReference {
                    file_name: attachment.file_name.clone(),
                }),
                OperationType::FileDownload.default_priority(),
            )?;
        }
        Ok(())
    }

    async fn enter_conflict(&self, conflict: DocumentConflict) -> Result<PullOutcome> {
        let sync_id = conflict.sync_id.clone();
        let id = conflict.id;
        self.store.insert_conflict(&conflict)?;
        self.advance(
            &sync_id,
            Goal::Conflict,
            DocumentPatch {
                conflict_id: Some(Some(id)),
                ..DocumentPatch::default()
            },
        )?;
        let fields: Vec<String> = conflict.fields.iter().map(ToString::to_string).collect();
        warn!(
            "Conflict {id} on {sync_id}: {} ({})",
            conflict.kind.as_str(),
            fields.join(", ")
        );
        self.event(
            &sync_id,
            SyncEventKind::ConflictDetected,
            &format!("{} conflict {id}", conflict.kind.as_str()),
        )?;

        match self.config.conflict_policy.automatic_strategy() {
            Some(strategy) => {
                self.resolve_conflict(&id, strategy).await?;
                Ok(PullOutcome::Resolved(id))
            }
            None => Ok(PullOutcome::Conflict(id)),
        }
    }

    /// Settle a conflict with `strategy`.
    ///
    /// The local side is re-read first, so edits made while the conflict was
    /// open are part of the outcome. Returns the stored document, or `None`
    /// when the remote deletion was accepted.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &ConflictId,
        strategy: ResolutionStrategy,
    ) -> Result<Option<Document>> {
        let mut conflict = self
            .store
            .get_conflict(conflict_id)?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
        let sync_id = conflict.sync_id.clone();
        let Some(current) = self.store.get(&sync_id)? else {
            self.store.delete_conflict(conflict_id)?;
            return Ok(None);
        };
        conflict.local = current;

        match resolve(&conflict, &strategy) {
            Resolution::Push(document) => {
                let stored = self.machine.apply_with(
                    &sync_id,
                    Trigger::Resolved { needs_push: true },
                    DocumentPatch::from_document(&document),
                )?;
                self.store.delete_conflict(conflict_id)?;
                self.ensure_queue()?;
                self.queue.enqueue(
                    &sync_id,
                    OperationType::Update,
                    OperationPayload::Document(Box::new(stored.clone())),
                    OperationType::Update.default_priority(),
                )?;
                info!("Conflict {conflict_id} resolved; version {} queued", stored.version);
                self.event(
                    &sync_id,
                    SyncEventKind::ConflictResolved,
                    &format!("conflict {conflict_id}, version {}", stored.version),
                )?;
                Ok(Some(stored))
            }
            Resolution::AcceptDeletion => {
                self.store.delete_conflict(conflict_id)?;
                self.event(
                    &sync_id,
                    SyncEventKind::ConflictResolved,
                    &format!("conflict {conflict_id}, remote deletion accepted"),
                )?;
                self.purge_local(&sync_id, "remote deletion accepted").await?;
                Ok(None)
            }
        }
    }

    pub fn list_conflicts(&self) -> Result<Vec<DocumentConflict>> {
        self.store.list_conflicts()
    }

    /// Drop every local trace of a document: row, queue entries and files
    pub(super) async fn purge_local(&self, sync_id: &SyncId, reason: &str) -> Result<()> {
        self.queue.remove_document(sync_id)?;
        if let Some(dir) = self.files_dir_for(sync_id) {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => warn!("Could not remove {}: {error}", dir.display()),
            }
        }
        self.store.purge(sync_id)?;
        info!("Purged {sync_id}: {reason}");
        self.event(sync_id, SyncEventKind::Deleted, reason)
    }

    pub(super) fn files_dir_for(&self, sync_id: &SyncId) -> Option<PathBuf> {
        self.config
            .files_dir
            .as_ref()
            .map(|dir| dir.join(sync_id.as_str()))
    }

    async fn push_document(&self, sync_id: &SyncId) -> Result<DispatchOutcome> {
        let Some(document) = self.store.get(sync_id)? else {
            return Ok(DispatchOutcome::Completed);
        };
        if document.deleted {
            return Ok(DispatchOutcome::Completed);
        }
        match document.sync_state {
            SyncState::Conflict => return Ok(DispatchOutcome::Conflict),
            SyncState::PendingDownload | SyncState::Downloading => {
                return Ok(DispatchOutcome::Deferred)
            }
            SyncState::Synced if !document.has_unpushed_changes() => {
                return Ok(DispatchOutcome::Completed)
            }
            _ => {}
        }

        let in_flight = self.advance(sync_id, Goal::Uploading, DocumentPatch::default())?;
        let expected = in_flight.base_version;
        let result = match self
            .remote("upsert", || self.metadata.upsert(&in_flight, expected))
            .await
        {
            Ok(version) => self.settle_upload(sync_id, version),
            Err(RemoteError::VersionConflict { actual, .. }) => {
                debug!("{sync_id} rejected: remote is at version {actual}, expected {expected}");
                self.reconcile_rejected(sync_id).await
            }
            Err(error) => Err(error.into()),
        };

        if let Err(error) = &result {
            self.fail_in_flight(sync_id, error)?;
        }
        result
    }

    fn settle_upload(&self, sync_id: &SyncId, version: i64) -> Result<DispatchOutcome> {
        let current = self.current(sync_id)?;
        if current.sync_state == SyncState::Uploading {
            self.machine.apply_with(
                sync_id,
                Trigger::RemoteAccepted,
                DocumentPatch {
                    version: Some(version),
                    base_version: Some(version),
                    ..DocumentPatch::default()
                },
            )?;
        } else {
            // edited while the write was in flight; those edits still need a push
            self.store.update_by_sync_id(
                sync_id,
                &DocumentPatch {
                    version: Some(current.version.max(version + 1)),
                    base_version: Some(version),
                    ..DocumentPatch::default()
                },
            )?;
        }
        self.event(sync_id, SyncEventKind::Uploaded, &format!("version {version}"))?;
        Ok(DispatchOutcome::Completed)
    }

    async fn reconcile_rejected(&self, sync_id: &SyncId) -> Result<DispatchOutcome> {
        let remote = self
            .remote("fetch", || self.metadata.fetch(sync_id))
            .await?;
        let local = self.current(sync_id)?;
        Ok(match self.reconcile(&local, &remote).await? {
            PullOutcome::Conflict(_) | PullOutcome::Resolved(_) => DispatchOutcome::Conflict,
            _ => DispatchOutcome::Completed,
        })
    }

    /// Leave the in-flight state after a failed remote write
    fn fail_in_flight(&self, sync_id: &SyncId, error: &Error) -> Result<()> {
        let Some(document) = self.store.get(sync_id)? else {
            return Ok(());
        };
        if document.sync_state.is_in_flight() {
            if needs_authentication(error) {
                // nothing is wrong with the document itself
                self.machine.apply_path(
                    sync_id,
                    &[Trigger::Failed, Trigger::Retry(Direction::Upload)],
                    DocumentPatch::default(),
                )?;
            } else {
                self.machine.apply(sync_id, Trigger::Failed)?;
            }
        }
        self.event(sync_id, SyncEventKind::Failed, &error.to_string())
    }

    /// Tombstone the remote record, remove its files and purge the local copy
    async fn delete_remote(&self, sync_id: &SyncId) -> Result<DispatchOutcome> {
        let document = self.store.get(sync_id)?;
        self.remote("soft_delete", || self.metadata.soft_delete(sync_id))
            .await?;

        let keys = document
            .iter()
            .flat_map(|document| &document.attachments)
            .filter_map(|attachment| attachment.remote_key.as_deref());
        for key in keys {
            if let Err(error) = self
                .remote("delete_blob", || self.migration.blobs().delete(key))
                .await
            {
                warn!("Could not delete {key} for {sync_id}: {error}");
            }
        }

        self.purge_local(sync_id, "deleted").await?;
        Ok(DispatchOutcome::Completed)
    }

    async fn upload_file(&self, sync_id: &SyncId, file_name: &str) -> Result<DispatchOutcome> {
        let Some(document) = self.store.get(sync_id)? else {
            return Ok(DispatchOutcome::Completed);
        };
        if document.deleted {
            return Ok(DispatchOutcome::Completed);
        }
        let Some(attachment) = document.attachment(file_name) else {
            return Ok(DispatchOutcome::Failed(format!(
                "{file_name} is no longer attached to {sync_id}"
            )));
        };
        let Some(local_path) = attachment.local_path.clone() else {
            return Ok(DispatchOutcome::Failed(format!(
                "{file_name} has no copy on this device"
            )));
        };
        let bytes = match tokio::fs::read(&local_path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DispatchOutcome::Failed(format!("{local_path} no longer exists")));
            }
            Err(error) => return Err(error.into()),
        };

        let stable_id = with_timeout(
            self.config.remote_timeout(),
            self.migration.identity().current_stable_id(),
        )
        .await?;
        let key = self
            .migration
            .resolver()
            .build_path(&stable_id, sync_id, file_name)?;
        self.remote("put", || self.migration.blobs().put(&key, &bytes))
            .await?;

        if attachment.remote_key.as_deref() != Some(key.as_str()) {
            // re-read: the document may have changed while the bytes were in flight
            let mut current = self.current(sync_id)?;
            if let Some(entry) = current
                .attachments
                .iter_mut()
                .find(|entry| entry.file_name == file_name)
            {
                entry.remote_key = Some(key.clone());
            }
            current.touch_local_edit();
            let stored = self.machine.apply_with(
                sync_id,
                Trigger::LocalEdit,
                DocumentPatch {
                    attachments: Some(current.attachments),
                    version: Some(current.version),
                    last_modified: Some(current.last_modified),
                    ..DocumentPatch::default()
                },
            )?;
            let push_pending = self
                .queue
                .pending_for(sync_id)
                .iter()
                .any(|operation| operation.op_type.is_document_level());
            if stored.sync_state != SyncState::Conflict && !push_pending {
                self.queue.enqueue(
                    sync_id,
                    OperationType::Update,
                    OperationPayload::Document(Box::new(stored)),
                    OperationType::Update.default_priority(),
                )?;
            }
        }

        self.event(sync_id, SyncEventKind::Uploaded, &format!("file {key}"))?;
        Ok(DispatchOutcome::Completed)
    }

    async fn download_file(&self, sync_id: &SyncId, file_name: &str) -> Result<DispatchOutcome> {
        let Some(dir) = self.files_dir_for(sync_id) else {
            return Ok(DispatchOutcome::Failed(
                "no files directory is configured".to_string(),
            ));
        };
        let Some(document) = self.store.get(sync_id)? else {
            return Ok(DispatchOutcome::Completed);
        };
        match document.attachment(file_name) {
            None => {
                return Ok(DispatchOutcome::Failed(format!(
                    "{file_name} is no longer attached to {sync_id}"
                )))
            }
            Some(attachment) if attachment.local_path.is_some() => {
                return Ok(DispatchOutcome::Completed)
            }
            Some(_) => {}
        }

        let bytes = self
            .migration
            .read_file_with_fallback(sync_id, file_name)
            .await?;
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(file_name);
        tokio::fs::write(&target, &bytes).await?;

        // device paths are not versioned content
        let mut current = self.current(sync_id)?;
        if let Some(entry) = current
            .attachments
            .iter_mut()
            .find(|entry| entry.file_name == file_name)
        {
            entry.local_path = Some(target.to_string_lossy().into_owned());
        }
        self.store.update_by_sync_id(
            sync_id,
            &DocumentPatch {
                attachments: Some(current.attachments),
                ..DocumentPatch::default()
            },
        )?;
        self.event(
            sync_id,
            SyncEventKind::Downloaded,
            &format!("file {file_name} ({} bytes)", bytes.len()),
        )?;
        Ok(DispatchOutcome::Completed)
    }

    /// Run the deferred startup work: reload the queue and sync once
    pub async fn on_app_launch(&self) -> Result<SyncSummary> {
        self.ensure_queue()?;
        self.trigger_sync().await
    }

    /// Record a connectivity change; coming back online starts a pass
    pub async fn on_connectivity_changed(&self, online: bool) -> Result<Option<SyncSummary>> {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            info!("Back online; syncing");
            return self.trigger_sync().await.map(Some);
        }
        if !online && was_online {
            info!("Went offline; changes stay queued");
        }
        Ok(None)
    }

    /// Mark a document as changed remotely so the next pass pulls it.
    ///
    /// Documents that cannot take the change right now are left alone; their
    /// own push will meet the newer version.
    pub fn on_remote_change(&self, sync_id: &SyncId) -> Result<Option<Document>> {
        match self.machine.apply(sync_id, Trigger::RemoteChanged) {
            Ok(document) => Ok(Some(document)),
            Err(Error::InvalidTransition { from, .. }) => {
                debug!("Remote change for {sync_id} ignored while {from}");
                Ok(None)
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    pub fn status(&self) -> Result<SyncStatus> {
        self.ensure_queue()?;
        let documents = self.store.list(true)?;
        let by_state = SyncState::ALL
            .into_iter()
            .map(|state| {
                let count = documents
                    .iter()
                    .filter(|document| document.sync_state == state)
                    .count();
                (state, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect();
        Ok(SyncStatus {
            online: self.is_online(),
            queue: self.queue.get_queue_status(),
            documents: by_state,
            open_conflicts: self.store.list_conflicts()?.len(),
            last_summary: lock_unpoisoned(&self.last_summary).clone(),
        })
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<SyncEventRecord>> {
        self.store.recent(limit)
    }
}

impl<M: MetadataStore, B: BlobStore, I: IdentityProvider> OperationDispatcher
    for SyncCoordinator<M, B, I>
{
    async fn dispatch(&self, operation: &QueuedOperation) -> DispatchOutcome {
        let sync_id = &operation.document_id;
        let Some(_claim) = self.claim(sync_id) else {
            debug!("{} for {sync_id} deferred: document is busy", operation.op_type);
            return DispatchOutcome::Deferred;
        };
        let result = match (operation.op_type, operation.payload.file_name()) {
            (OperationType::Upload | OperationType::Update, _) => {
                self.push_document(sync_id).await
            }
            (OperationType::Delete, _) => self.delete_remote(sync_id).await,
            (OperationType::FileUpload, Some(file_name)) => {
                self.upload_file(sync_id, file_name).await
            }
            (OperationType::FileDownload, Some(file_name)) => {
                self.download_file(sync_id, file_name).await
            }
            (op_type, None) => Ok(DispatchOutcome::Failed(format!(
                "{op_type} entry has no file reference"
            ))),
        };
        result.unwrap_or_else(|error| {
            debug!("{} for {sync_id} failed: {error}", operation.op_type);
            outcome_for(&error)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::identity::Principal;
    use crate::models::{DocumentCategory, FileAttachment};
    use crate::remote::{MemoryBlobStore, MemoryMetadataStore, StaticIdentityProvider};
    use crate::sync::{DocumentEdit, NewDocument, RetryPolicy};
    use pretty_assertions::assert_eq;

    type Coordinator = SyncCoordinator<
        Arc<MemoryMetadataStore>,
        Arc<MemoryBlobStore>,
        Arc<StaticIdentityProvider>,
    >;

    struct Harness {
        coordinator: Coordinator,
        metadata: Arc<MemoryMetadataStore>,
        blobs: Arc<MemoryBlobStore>,
        identity: Arc<StaticIdentityProvider>,
        files: tempfile::TempDir,
    }

    fn config() -> SyncConfig {
        SyncConfig {
            retry: RetryPolicy::immediate(3),
            max_queue_attempts: 3,
            ..SyncConfig::default()
        }
    }

    fn harness_with(mut config: SyncConfig) -> Harness {
        let files = tempfile::tempdir().unwrap();
        config.files_dir = Some(files.path().join("files"));
        let metadata = Arc::new(MemoryMetadataStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let identity = Arc::new(StaticIdentityProvider::new(Principal::signed_in(
            "u1", "alice",
        )));
        let coordinator = SyncCoordinator::new(
            LocalStore::open_in_memory().unwrap(),
            Arc::clone(&metadata),
            Arc::clone(&blobs),
            Arc::clone(&identity),
            config,
        )
        .unwrap();
        Harness {
            coordinator,
            metadata,
            blobs,
            identity,
            files,
        }
    }

    fn harness() -> Harness {
        harness_with(config())
    }

    fn lease() -> NewDocument {
        NewDocument {
            title: "Lease".to_string(),
            category: DocumentCategory::Contract,
            date: None,
            notes: None,
        }
    }

    fn retitle(title: &str) -> DocumentEdit {
        DocumentEdit {
            title: Some(title.to_string()),
            ..DocumentEdit::default()
        }
    }

    impl Harness {
        fn local(&self, sync_id: &SyncId) -> Document {
            self.coordinator.store().get(sync_id).unwrap().unwrap()
        }

        /// A document created here and accepted by the remote at version 1
        async fn synced_document(&self) -> Document {
            let document = self.coordinator.create_document(lease()).await.unwrap();
            self.coordinator.trigger_sync().await.unwrap();
            self.local(&document.sync_id)
        }

        /// Simulate another device writing the next version with a new title
        fn remote_edit(&self, sync_id: &SyncId, title: &str) -> Document {
            let mut remote = self.metadata.get(sync_id).unwrap();
            remote.title = title.to_string();
            remote.version += 1;
            remote.base_version = remote.version;
            self.metadata.insert(remote.clone());
            remote
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn created_document_is_uploaded_at_version_one() {
        let h = harness();
        let document = h.coordinator.create_document(lease()).await.unwrap();
        assert_eq!(document.owner_id, "u1");
        assert_eq!(h.coordinator.queue().len(), 1);

        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert_eq!(summary.uploaded, 1);

        let local = h.local(&document.sync_id);
        assert_eq!(local.sync_state, SyncState::Synced);
        assert_eq!((local.version, local.base_version), (1, 1));
        assert_eq!(h.metadata.get(&document.sync_id).unwrap().version, 1);
        assert!(h.coordinator.queue().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_edit_conflicts_and_keep_remote_settles_at_version_three() {
        let h = harness();
        let document = h.synced_document().await;
        h.remote_edit(&document.sync_id, "Lease (landlord)");
        h.coordinator
            .update_document(&document.sync_id, retitle("Lease (mine)"))
            .unwrap();

        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert_eq!(summary.conflicts, 1);
        let local = h.local(&document.sync_id);
        assert_eq!(local.sync_state, SyncState::Conflict);
        let conflicts = h.coordinator.list_conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(local.conflict_id, Some(conflicts[0].id));

        let resolved = h
            .coordinator
            .resolve_conflict(&conflicts[0].id, ResolutionStrategy::KeepRemote)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.version, 3);
        assert_eq!(resolved.sync_state, SyncState::PendingUpload);
        assert!(h.coordinator.list_conflicts().unwrap().is_empty());

        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert_eq!(summary.uploaded, 1);
        let local = h.local(&document.sync_id);
        assert_eq!(local.sync_state, SyncState::Synced);
        assert_eq!(local.title, "Lease (landlord)");
        assert_eq!((local.version, local.base_version), (3, 3));
        assert_eq!(local.conflict_id, None);
        assert_eq!(h.metadata.get(&document.sync_id).unwrap().version, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn versions_only_move_forward() {
        let h = harness();
        let document = h.synced_document().await;
        let mut seen = vec![h.local(&document.sync_id).version];

        h.coordinator
            .update_document(&document.sync_id, retitle("Lease v2"))
            .unwrap();
        h.coordinator.trigger_sync().await.unwrap();
        seen.push(h.local(&document.sync_id).version);

        // two edits before a push are one remote write
        h.coordinator
            .update_document(&document.sync_id, retitle("Lease v3"))
            .unwrap();
        h.coordinator
            .update_document(&document.sync_id, retitle("Lease v3, final"))
            .unwrap();
        assert_eq!(h.coordinator.queue().len(), 1);
        h.coordinator.trigger_sync().await.unwrap();
        seen.push(h.local(&document.sync_id).version);

        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(h.metadata.get(&document.sync_id).unwrap().title, "Lease v3, final");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overlapping_triggers_share_one_pass() {
        let h = harness();
        h.coordinator.create_document(lease()).await.unwrap();
        h.metadata.set_latency(Some(Duration::from_millis(50)));

        let (first, second) =
            tokio::join!(h.coordinator.trigger_sync(), h.coordinator.trigger_sync());
        let first = first.unwrap();
        assert_eq!(first, second.unwrap());
        assert_eq!(first.uploaded, 1);
        assert_eq!(h.metadata.call_count(), 1);

        // the slot is free again afterwards
        let third = h.coordinator.trigger_sync().await.unwrap();
        assert_eq!(third.uploaded, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_document_leaves_a_running_upload_alone() {
        let h = harness();
        let document = h.coordinator.create_document(lease()).await.unwrap();
        h.metadata.set_latency(Some(Duration::from_millis(100)));

        let (pass, single) = tokio::join!(h.coordinator.trigger_sync(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.coordinator.sync_document(&document.sync_id).await
        });
        assert_eq!(pass.unwrap().uploaded, 1);
        let during = single.unwrap().unwrap();
        assert_eq!(during.sync_state, SyncState::Uploading);

        assert_eq!(h.metadata.call_count(), 1);
        assert_eq!(h.metadata.get(&document.sync_id).unwrap().version, 1);
        assert_eq!(h.local(&document.sync_id).sync_state, SyncState::Synced);

        // released once the pass is done
        h.metadata.set_latency(None);
        h.coordinator.sync_document(&document.sync_id).await.unwrap();
        assert_eq!(h.metadata.call_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failure_is_retried_within_the_pass() {
        let h = harness();
        let document = h.coordinator.create_document(lease()).await.unwrap();
        h.metadata
            .fail_next(RemoteError::Transient("connection reset".to_string()));

        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.retried, 0);
        assert_eq!(h.metadata.call_count(), 2);
        assert_eq!(h.local(&document.sync_id).sync_state, SyncState::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn persistent_failure_parks_in_error_then_recovers() {
        let h = harness();
        let document = h.coordinator.create_document(lease()).await.unwrap();
        for _ in 0..4 {
            h.metadata
                .fail_next(RemoteError::Transient("503 service unavailable".to_string()));
        }

        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert_eq!(summary.retried, 1);
        assert_eq!(h.local(&document.sync_id).sync_state, SyncState::Error);
        let queued = h.coordinator.queue().snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].retry_count, 1);

        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert_eq!(summary.uploaded, 1);
        assert_eq!(h.local(&document.sync_id).sync_state, SyncState::Synced);
        assert!(h.coordinator.queue().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn entry_is_dropped_after_max_attempts() {
        let h = harness();
        let document = h.coordinator.create_document(lease()).await.unwrap();
        for _ in 0..12 {
            h.metadata
                .fail_next(RemoteError::Timeout(Duration::from_secs(1)));
        }

        let mut dropped = 0;
        for _ in 0..3 {
            dropped += h.coordinator.trigger_sync().await.unwrap().dropped;
        }
        assert_eq!(dropped, 1);
        assert!(h.coordinator.queue().is_empty());
        let events = h
            .coordinator
            .store()
            .for_document(&document.sync_id, 10)
            .unwrap();
        assert!(events
            .iter()
            .any(|event| event.kind == SyncEventKind::Failed && event.detail.contains("dropped")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn signed_out_pass_keeps_the_queue() {
        let h = harness();
        let document = h.coordinator.create_document(lease()).await.unwrap();
        h.identity.sign_out();

        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert!(summary.auth_required);
        assert_eq!(h.coordinator.queue().len(), 1);
        assert_eq!(h.local(&document.sync_id).sync_state, SyncState::PendingUpload);
        assert_eq!(h.metadata.call_count(), 0);

        h.identity.sign_in(Principal::signed_in("u1", "alice"));
        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert_eq!(summary.uploaded, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_tombstones_remote_and_purges_local() {
        let h = harness();
        let document = h.synced_document().await;
        h.coordinator.delete_document(&document.sync_id).await.unwrap();

        let tombstone = h.local(&document.sync_id);
        assert!(tombstone.deleted);
        assert_eq!(
            h.coordinator.queue().snapshot()[0].op_type,
            OperationType::Delete
        );

        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert_eq!(summary.deleted, 1);
        assert!(h.coordinator.store().get(&document.sync_id).unwrap().is_none());
        assert!(h.metadata.get(&document.sync_id).unwrap().deleted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn never_uploaded_document_is_deleted_locally_only() {
        let h = harness();
        let document = h.coordinator.create_document(lease()).await.unwrap();
        h.coordinator.delete_document(&document.sync_id).await.unwrap();

        assert!(h.coordinator.store().get(&document.sync_id).unwrap().is_none());
        assert!(h.coordinator.queue().is_empty());
        h.coordinator.trigger_sync().await.unwrap();
        assert_eq!(h.metadata.call_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_change_fast_forwards_a_clean_copy() {
        let h = harness();
        let document = h.synced_document().await;
        h.remote_edit(&document.sync_id, "Lease (renewed)");

        let marked = h.coordinator.on_remote_change(&document.sync_id).unwrap();
        assert_eq!(marked.unwrap().sync_state, SyncState::PendingDownload);

        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert_eq!(summary.downloaded, 1);
        let local = h.local(&document.sync_id);
        assert_eq!(local.title, "Lease (renewed)");
        assert_eq!((local.version, local.base_version), (2, 2));
        assert_eq!(local.sync_state, SyncState::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_creates_documents_from_other_devices() {
        let h = harness();
        let mut elsewhere = Document::new("u1", "Passport", DocumentCategory::Other).unwrap();
        elsewhere.version = 4;
        elsewhere.base_version = 4;
        elsewhere.sync_state = SyncState::Synced;
        h.metadata.insert(elsewhere.clone());

        let outcome = h.coordinator.pull_document(&elsewhere.sync_id).await.unwrap();
        assert_eq!(outcome, PullOutcome::Created);
        let local = h.local(&elsewhere.sync_id);
        assert_eq!(local.title, "Passport");
        assert_eq!(local.version, 4);
        assert_eq!(local.sync_state, SyncState::Synced);

        let missing = h.coordinator.pull_document(&SyncId::new()).await.unwrap();
        assert_eq!(missing, PullOutcome::NotFound);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_local_policy_resolves_without_the_caller() {
        let h = harness_with(SyncConfig {
            conflict_policy: crate::models::ConflictPolicy::KeepLocal,
            ..config()
        });
        let document = h.synced_document().await;
        h.remote_edit(&document.sync_id, "Lease (landlord)");
        h.coordinator
            .update_document(&document.sync_id, retitle("Lease (mine)"))
            .unwrap();

        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert_eq!(summary.conflicts, 1);
        assert!(h.coordinator.list_conflicts().unwrap().is_empty());
        assert_eq!(
            h.local(&document.sync_id).sync_state,
            SyncState::PendingUpload
        );

        h.coordinator.trigger_sync().await.unwrap();
        let remote = h.metadata.get(&document.sync_id).unwrap();
        assert_eq!(remote.title, "Lease (mine)");
        assert_eq!(remote.version, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edits_made_during_a_conflict_survive_resolution() {
        let h = harness();
        let document = h.synced_document().await;
        h.remote_edit(&document.sync_id, "Lease (landlord)");
        h.coordinator
            .update_document(&document.sync_id, retitle("Lease (mine)"))
            .unwrap();
        h.coordinator.trigger_sync().await.unwrap();

        let edited = h
            .coordinator
            .update_document(
                &document.sync_id,
                DocumentEdit {
                    notes: Some(Some("renewal signed".to_string())),
                    ..DocumentEdit::default()
                },
            )
            .unwrap();
        assert_eq!(edited.sync_state, SyncState::Conflict);
        assert!(h.coordinator.queue().is_empty());

        let conflict = h.coordinator.list_conflicts().unwrap().remove(0);
        let resolved = h
            .coordinator
            .resolve_conflict(&conflict.id, ResolutionStrategy::KeepLocal)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.title, "Lease (mine)");
        assert_eq!(resolved.notes.as_deref(), Some("renewal signed"));

        h.coordinator.trigger_sync().await.unwrap();
        let remote = h.metadata.get(&document.sync_id).unwrap();
        assert_eq!(remote.notes.as_deref(), Some("renewal signed"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identical_edits_on_both_sides_converge() {
        let h = harness();
        let document = h.synced_document().await;
        h.remote_edit(&document.sync_id, "Lease 2025");
        h.coordinator
            .update_document(&document.sync_id, retitle("Lease 2025"))
            .unwrap();

        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert_eq!(summary.conflicts, 0);
        let local = h.local(&document.sync_id);
        assert_eq!(local.sync_state, SyncState::Synced);
        assert_eq!((local.version, local.base_version), (2, 2));
        assert_eq!(h.metadata.get(&document.sync_id).unwrap().version, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attached_file_is_uploaded_under_the_stable_path() {
        let h = harness();
        let document = h.coordinator.create_document(lease()).await.unwrap();
        let source = h.files.path().join("a.pdf");
        std::fs::write(&source, b"%PDF-1.7").unwrap();

        let attachment = h
            .coordinator
            .attach_file(&document.sync_id, &source, Some("signed scan"))
            .await
            .unwrap();
        assert_eq!(attachment.label.as_deref(), Some("signed scan"));

        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert_eq!((summary.files_uploaded, summary.uploaded), (1, 1));

        let key = format!("private/u1/documents/{}/a.pdf", document.sync_id);
        assert!(h.blobs.contains(&key));
        let local = h.local(&document.sync_id);
        assert_eq!(local.attachments[0].remote_key.as_deref(), Some(key.as_str()));
        assert!(local.attachments[0].local_path.is_some());

        let remote = h.metadata.get(&document.sync_id).unwrap();
        assert_eq!(remote.attachments[0].remote_key.as_deref(), Some(key.as_str()));
        assert_eq!(remote.attachments[0].local_path, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_only_files_are_downloaded_into_the_files_dir() {
        let h = harness();
        let mut elsewhere = Document::new("u1", "Warranty", DocumentCategory::Warranty).unwrap();
        let key = format!("private/u1/documents/{}/b.pdf", elsewhere.sync_id);
        let mut attachment = FileAttachment::new_local("b.pdf", "/elsewhere/b.pdf", 5).unwrap();
        attachment.local_path = None;
        attachment.remote_key = Some(key.clone());
        elsewhere.attachments.push(attachment);
        elsewhere.base_version = 1;
        elsewhere.sync_state = SyncState::Synced;
        h.metadata.insert(elsewhere.clone());
        h.blobs.insert(&key, b"bytes".to_vec());

        h.coordinator.pull_document(&elsewhere.sync_id).await.unwrap();
        assert_eq!(
            h.coordinator.queue().snapshot()[0].op_type,
            OperationType::FileDownload
        );

        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert_eq!(summary.files_downloaded, 1);
        let local = h.local(&elsewhere.sync_id);
        let path = local.attachments[0].local_path.clone().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"bytes");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_changes_sync_when_connectivity_returns() {
        let h = harness();
        assert_eq!(h.coordinator.on_connectivity_changed(false).await.unwrap(), None);
        h.coordinator.create_document(lease()).await.unwrap();

        let summary = h.coordinator.trigger_sync().await.unwrap();
        assert!(summary.offline);
        assert_eq!(h.coordinator.queue().len(), 1);

        let summary = h
            .coordinator
            .on_connectivity_changed(true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.uploaded, 1);
        assert!(h.coordinator.status().unwrap().online);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_document_pushes_then_pulls_one_document() {
        let h = harness();
        let document = h.coordinator.create_document(lease()).await.unwrap();

        let synced = h
            .coordinator
            .sync_document(&document.sync_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(synced.sync_state, SyncState::Synced);
        assert!(h.coordinator.queue().is_empty());

        let status = h.coordinator.status().unwrap();
        assert_eq!(status.documents, vec![(SyncState::Synced, 1)]);
        assert_eq!(status.open_conflicts, 0);
    }
}
