//! Local mutations: every change lands in the local store first and is queued
//! for the next sync pass.

use std::path::Path;

use chrono::NaiveDate;
use tracing::info;

use crate::db::{ConflictRepository, DocumentPatch, DocumentRepository};
use crate::error::{Error, Result};
use crate::models::{
    Document, DocumentCategory, FileAttachment, FileReference, OperationPayload, OperationType,
    SyncEventKind, SyncId,
};
use crate::queue::EnqueueOutcome;
use crate::remote::{with_timeout, BlobStore, IdentityProvider, MetadataStore};
use crate::state::{SyncState, Trigger};
use crate::util::{normalize_text_option, unix_millis_now};

use super::SyncCoordinator;

/// Fields of a document created on this device
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub category: DocumentCategory,
    pub date: Option<NaiveDate>,
    pub notes: Option<String>,
}

/// A partial edit; `None` leaves a field unchanged, `Some(None)` clears it
#[derive(Debug, Clone, Default)]
pub struct DocumentEdit {
    pub title: Option<String>,
    pub category: Option<DocumentCategory>,
    pub date: Option<Option<NaiveDate>>,
    pub notes: Option<Option<String>>,
}

impl DocumentEdit {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none() && self.category.is_none() && self.date.is_none() && self.notes.is_none()
    }
}

impl<M: MetadataStore, B: BlobStore, I: IdentityProvider> SyncCoordinator<M, B, I> {
    /// Store a new document owned by the signed-in account and queue its upload
    pub async fn create_document(&self, new: NewDocument) -> Result<Document> {
        let owner = with_timeout(
            self.config().remote_timeout(),
            self.migration().identity().current_stable_id(),
        )
        .await?;
        let mut document = Document::new(owner.as_str(), new.title, new.category)?;
        document.date = new.date;
        document.notes = normalize_text_option(new.notes);

        self.store().insert(&document)?;
        self.ensure_queue()?;
        self.queue().enqueue(
            &document.sync_id,
            OperationType::Upload,
            OperationPayload::Document(Box::new(document.clone())),
            OperationType::Upload.default_priority(),
        )?;
        info!("Created {} ({})", document.sync_id, document.title);
        self.event(&document.sync_id, SyncEventKind::Queued, "upload")?;
        Ok(document)
    }

    /// Apply a user edit and queue it.
    ///
    /// Edits to a document in conflict are stored but not queued; they become
    /// part of the local side when the conflict is resolved.
    pub fn update_document(&self, sync_id: &SyncId, edit: DocumentEdit) -> Result<Document> {
        let mut document = self.current(sync_id)?;
        if document.deleted {
            return Err(Error::InvalidInput(format!("{sync_id} has been deleted")));
        }
        if edit.is_empty() {
            return Ok(document);
        }

        let title = match edit.title {
            Some(title) => {
                let title = title.trim().to_string();
                if title.is_empty() {
                    return Err(Error::InvalidInput(
                        "Document title cannot be empty".to_string(),
                    ));
                }
                Some(title)
            }
            None => None,
        };
        document.touch_local_edit();
        let stored = self.machine.apply_with(
            sync_id,
            Trigger::LocalEdit,
            DocumentPatch {
                title,
                category: edit.category,
                date: edit.date,
                notes: edit.notes.map(normalize_text_option),
                version: Some(document.version),
                last_modified: Some(document.last_modified),
                ..DocumentPatch::default()
            },
        )?;
        self.queue_update(&stored)?;
        Ok(stored)
    }

    fn queue_update(&self, document: &Document) -> Result<()> {
        if document.sync_state == SyncState::Conflict {
            return Ok(());
        }
        self.ensure_queue()?;
        let outcome = self.queue().enqueue(
            &document.sync_id,
            OperationType::Update,
            OperationPayload::Document(Box::new(document.clone())),
            OperationType::Update.default_priority(),
        )?;
        if matches!(outcome, EnqueueOutcome::Added(_)) {
            self.event(&document.sync_id, SyncEventKind::Queued, "update")?;
        }
        Ok(())
    }

    /// Delete a document.
    ///
    /// A document the remote has never seen is purged at once. Otherwise a
    /// tombstone is kept locally until the remote delete goes through; a
    /// pending conflict is discarded because the delete supersedes both sides.
    pub async fn delete_document(&self, sync_id: &SyncId) -> Result<()> {
        let mut document = self.current(sync_id)?;
        if document.deleted {
            return Ok(());
        }
        if document.base_version == 0 {
            return self
                .purge_local(sync_id, "deleted before first upload")
                .await;
        }

        let trigger = if document.sync_state == SyncState::Conflict {
            if let Some(conflict_id) = &document.conflict_id {
                self.store().delete_conflict(conflict_id)?;
            }
            Trigger::Resolved { needs_push: true }
        } else {
            Trigger::LocalEdit
        };

        let deleted_at = unix_millis_now();
        document.touch_local_edit();
        self.machine.apply_with(
            sync_id,
            trigger,
            DocumentPatch {
                deleted: Some(true),
                deleted_at: Some(Some(deleted_at)),
                conflict_id: Some(None),
                version: Some(document.version),
                last_modified: Some(document.last_modified),
                ..DocumentPatch::default()
            },
        )?;

        self.ensure_queue()?;
        self.queue().enqueue(
            sync_id,
            OperationType::Delete,
            OperationPayload::Tombstone { deleted_at },
            OperationType::Delete.default_priority(),
        )?;
        self.event(sync_id, SyncEventKind::Queued, "delete")
    }

    /// Attach a file from this device, replacing any attachment with the same name.
    ///
    /// The file is copied into the files directory when one is configured.
    /// Its upload is queued ahead of the document push so the pushed record
    /// already carries the storage key.
    pub async fn attach_file(
        &self,
        sync_id: &SyncId,
        source: &Path,
        label: Option<&str>,
    ) -> Result<FileAttachment> {
        let mut document = self.current(sync_id)?;
        if document.deleted {
            return Err(Error::InvalidInput(format!("{sync_id} has been deleted")));
        }
        let file_name = source
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                Error::InvalidInput(format!("{} has no usable file name", source.display()))
            })?
            .to_string();
        let size = tokio::fs::metadata(source).await?.len();
        let size = i64::try_from(size)
            .map_err(|_| Error::InvalidInput(format!("{file_name} is too large")))?;

        let local_path = match self.files_dir_for(sync_id) {
            Some(dir) => {
                tokio::fs::create_dir_all(&dir).await?;
                let target = dir.join(&file_name);
                tokio::fs::copy(source, &target).await?;
                target
            }
            None => source.to_path_buf(),
        };

        let mut attachment =
            FileAttachment::new_local(&file_name, local_path.to_string_lossy(), size)?;
        if let Some(label) = label {
            attachment = attachment.with_label(label);
        }
        match document
            .attachments
            .iter_mut()
            .find(|existing| existing.file_name == file_name)
        {
            Some(existing) => *existing = attachment.clone(),
            None => document.attachments.push(attachment.clone()),
        }

        document.touch_local_edit();
        let stored = self.machine.apply_with(
            sync_id,
            Trigger::LocalEdit,
            DocumentPatch {
                attachments: Some(document.attachments),
                version: Some(document.version),
                last_modified: Some(document.last_modified),
                ..DocumentPatch::default()
            },
        )?;
        self.queue_update(&stored)?;
        self.ensure_queue()?;
        self.queue().enqueue(
            sync_id,
            OperationType::FileUpload,
            OperationPayload::File(FileReference {
                file_name: file_name.clone(),
            }),
            OperationType::Update.default_priority() + 1,
        )?;
        self.event(sync_id, SyncEventKind::Queued, &format!("file {file_name}"))?;
        Ok(attachment)
    }

    /// Queue a download of an attachment that is only stored remotely
    pub fn request_file_download(&self, sync_id: &SyncId, file_name: &str) -> Result<EnqueueOutcome> {
        let document = self.current(sync_id)?;
        let attachment = document
            .attachment(file_name)
            .ok_or_else(|| Error::NotFound(format!("{file_name} on {sync_id}")))?;
        if attachment.remote_key.is_none() {
            return Err(Error::InvalidInput(format!(
                "{file_name} has not been uploaded yet"
            )));
        }
        self.ensure_queue()?;
        self.queue().enqueue(
            sync_id,
            OperationType::FileDownload,
            OperationPayload::File(FileReference {
                file_name: file_name.to_string(),
            }),
            OperationType::FileDownload.default_priority(),
        )
    }
}
