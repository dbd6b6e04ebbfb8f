//! Applies sync state transitions to stored documents.

use tracing::debug;

use crate::db::{DocumentPatch, DocumentRepository};
use crate::error::{Error, Result};
use crate::models::{Document, SyncId};
use crate::state::Trigger;

/// Drives [`SyncState`](crate::state::SyncState) transitions through a document repository.
///
/// Every change is written with `update_by_sync_id` on the existing record,
/// never as a delete followed by an insert.
#[derive(Clone)]
pub struct StateMachine<R> {
    repo: R,
}

impl<R: DocumentRepository> StateMachine<R> {
    pub const fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn apply(&self, sync_id: &SyncId, trigger: Trigger) -> Result<Document> {
        self.apply_with(sync_id, trigger, DocumentPatch::default())
    }

    /// Apply `trigger` together with other column changes in one update
    pub fn apply_with(
        &self,
        sync_id: &SyncId,
        trigger: Trigger,
        patch: DocumentPatch,
    ) -> Result<Document> {
        self.apply_path(sync_id, &[trigger], patch)
    }

    /// Apply several triggers in order as a single write.
    ///
    /// Nothing is written unless every step exists in the transition table.
    /// An empty path writes `patch` without changing the state.
    pub fn apply_path(
        &self,
        sync_id: &SyncId,
        triggers: &[Trigger],
        patch: DocumentPatch,
    ) -> Result<Document> {
        let current = self
            .repo
            .get(sync_id)?
            .ok_or_else(|| Error::NotFound(sync_id.to_string()))?;
        let mut state = current.sync_state;
        for trigger in triggers {
            state = state
                .next(*trigger)
                .ok_or_else(|| Error::InvalidTransition {
                    sync_id: sync_id.to_string(),
                    from: state.to_string(),
                    trigger: trigger.to_string(),
                })?;
            debug!("Document {sync_id}: --{trigger}--> {state}");
        }
        self.repo
            .update_by_sync_id(sync_id, &patch.with_state(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentCategory;
    use crate::services::LocalStore;
    use crate::state::{Direction, SyncState};

    fn machine_with_document() -> (StateMachine<LocalStore>, Document) {
        let store = LocalStore::open_in_memory().unwrap();
        let document = Document::new("u1", "Lease", DocumentCategory::Contract).unwrap();
        store.insert(&document).unwrap();
        (StateMachine::new(store), document)
    }

    #[test]
    fn applies_valid_transitions_in_place() {
        let (machine, document) = machine_with_document();
        let uploading = machine.apply(&document.sync_id, Trigger::Dispatch).unwrap();
        assert_eq!(uploading.sync_state, SyncState::Uploading);
        assert_eq!(uploading.created_at, document.created_at);

        let synced = machine
            .apply_with(
                &document.sync_id,
                Trigger::RemoteAccepted,
                DocumentPatch {
                    base_version: Some(1),
                    ..DocumentPatch::default()
                },
            )
            .unwrap();
        assert_eq!(synced.sync_state, SyncState::Synced);
        assert_eq!(synced.base_version, 1);
    }

    #[test]
    fn rejects_transitions_missing_from_the_table() {
        let (machine, document) = machine_with_document();
        let error = machine
            .apply(&document.sync_id, Trigger::DownloadCompleted)
            .unwrap_err();
        assert!(matches!(error, Error::InvalidTransition { .. }));

        let unchanged = machine.repo.get(&document.sync_id).unwrap().unwrap();
        assert_eq!(unchanged.sync_state, SyncState::PendingUpload);
    }

    #[test]
    fn error_state_recovers_only_through_retry() {
        let (machine, document) = machine_with_document();
        machine.apply(&document.sync_id, Trigger::Dispatch).unwrap();
        machine.apply(&document.sync_id, Trigger::Failed).unwrap();

        assert!(machine
            .apply(&document.sync_id, Trigger::VersionRejected)
            .is_err());
        let retried = machine
            .apply(&document.sync_id, Trigger::Retry(Direction::Upload))
            .unwrap();
        assert_eq!(retried.sync_state, SyncState::PendingUpload);
    }

    #[test]
    fn path_is_all_or_nothing() {
        let (machine, document) = machine_with_document();
        let error = machine
            .apply_path(
                &document.sync_id,
                &[Trigger::Dispatch, Trigger::DownloadCompleted],
                DocumentPatch::default(),
            )
            .unwrap_err();
        assert!(matches!(error, Error::InvalidTransition { .. }));
        let unchanged = machine.repo.get(&document.sync_id).unwrap().unwrap();
        assert_eq!(unchanged.sync_state, SyncState::PendingUpload);

        let synced = machine
            .apply_path(
                &document.sync_id,
                &[Trigger::Dispatch, Trigger::RemoteAccepted],
                DocumentPatch::default(),
            )
            .unwrap();
        assert_eq!(synced.sync_state, SyncState::Synced);
    }

    #[test]
    fn missing_document_is_not_found() {
        let (machine, _) = machine_with_document();
        let error = machine.apply(&SyncId::new(), Trigger::Dispatch).unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));
    }
}
