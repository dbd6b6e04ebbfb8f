//! Conflict detection and resolution between a local and a remote copy.

use std::collections::BTreeMap;

use crate::models::{
    ConflictId, ConflictKind, Document, DocumentConflict, DocumentField, FieldSelection,
    FileAttachment, ResolutionStrategy, Side,
};
use crate::state::SyncState;
use crate::util::unix_millis_now;

/// What comparing a local copy with the remote one found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// The remote has not moved past the version this copy was derived from
    UpToDate,
    /// The remote moved on and the local copy has nothing of its own to keep
    FastForward,
    /// Both sides changed to the same content; adopt the remote version
    Converged,
    Conflict(DocumentConflict),
}

/// Compare `local` with the freshly fetched `remote`.
///
/// A conflict needs all of: a remote version other than the local base, local
/// edits not yet accepted by the remote, and a user-visible difference (or a
/// remote tombstone).
#[must_use]
pub fn detect(local: &Document, remote: &Document) -> Detection {
    if remote.version == local.base_version {
        return Detection::UpToDate;
    }
    if !local.has_unpushed_changes() {
        return Detection::FastForward;
    }

    let fields = local.differing_fields(remote);
    let kind = if remote.deleted {
        ConflictKind::RemoteDeleted
    } else if fields.is_empty() {
        return Detection::Converged;
    } else {
        ConflictKind::Content
    };

    Detection::Conflict(DocumentConflict {
        id: ConflictId::new(),
        sync_id: local.sync_id.clone(),
        kind,
        fields,
        local: local.clone(),
        remote: remote.clone(),
        detected_at: unix_millis_now(),
    })
}

/// Outcome of applying a strategy to a conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A single document to store locally and push
    Push(Document),
    /// The remote deletion wins; the local copy is purged
    AcceptDeletion,
}

/// Produce the winning document for `strategy`.
///
/// The result is versioned past both candidates and based on the remote
/// version, so the next push is accepted without another conflict.
#[must_use]
pub fn resolve(conflict: &DocumentConflict, strategy: &ResolutionStrategy) -> Resolution {
    let local = &conflict.local;
    let remote = &conflict.remote;

    let mut resolved = match strategy {
        ResolutionStrategy::KeepLocal => local.clone(),
        ResolutionStrategy::KeepRemote if remote.deleted => return Resolution::AcceptDeletion,
        ResolutionStrategy::KeepRemote => {
            let mut kept = remote.clone();
            kept.attachments = carry_local_paths(&remote.attachments, local);
            kept
        }
        ResolutionStrategy::Merge(selection) => merge(local, remote, selection),
    };

    resolved.sync_id = local.sync_id.clone();
    resolved.owner_id = local.owner_id.clone();
    resolved.created_at = local.created_at.min(remote.created_at);
    resolved.version = local.version.max(remote.version) + 1;
    resolved.base_version = remote.version;
    resolved.last_modified = unix_millis_now();
    resolved.sync_state = SyncState::PendingUpload;
    resolved.conflict_id = None;
    resolved.deleted = false;
    resolved.deleted_at = None;
    Resolution::Push(resolved)
}

fn merge(local: &Document, remote: &Document, selection: &FieldSelection) -> Document {
    let pick = |field| match selection.side_for(field) {
        Side::Local => local,
        Side::Remote => remote,
    };

    let mut merged = local.clone();
    merged.title = pick(DocumentField::Title).title.clone();
    merged.category = pick(DocumentField::Category).category;
    merged.date = pick(DocumentField::Date).date;
    merged.notes = pick(DocumentField::Notes).notes.clone();
    merged.attachments = match selection.fields.get(&DocumentField::Attachments) {
        Some(Side::Local) => local.attachments.clone(),
        Some(Side::Remote) => carry_local_paths(&remote.attachments, local),
        None => union_attachments(local, remote, &selection.attachments),
    };
    merged
}

/// One copy per file name: local order first, then remote-only files.
///
/// Names present on both sides take the override when given, otherwise the
/// later `added_at`, with ties going to the local copy.
fn union_attachments(
    local: &Document,
    remote: &Document,
    overrides: &BTreeMap<String, Side>,
) -> Vec<FileAttachment> {
    let mut merged = Vec::with_capacity(local.attachments.len() + remote.attachments.len());
    for mine in &local.attachments {
        let chosen = match remote.attachment(&mine.file_name) {
            None => mine.clone(),
            Some(theirs) => {
                let side = overrides.get(&mine.file_name).copied().unwrap_or(
                    if theirs.added_at > mine.added_at {
                        Side::Remote
                    } else {
                        Side::Local
                    },
                );
                match side {
                    Side::Local => mine.clone(),
                    Side::Remote => with_local_path(theirs, Some(mine)),
                }
            }
        };
        merged.push(chosen);
    }
    merged.extend(
        remote
            .attachments
            .iter()
            .filter(|theirs| local.attachment(&theirs.file_name).is_none())
            .cloned(),
    );
    merged
}

/// Remote attachments, keeping this device's paths where the content is unchanged
pub(crate) fn carry_local_paths(
    attachments: &[FileAttachment],
    local: &Document,
) -> Vec<FileAttachment> {
    attachments
        .iter()
        .map(|attachment| with_local_path(attachment, local.attachment(&attachment.file_name)))
        .collect()
}

/// Keep the device copy only when it holds the same content
fn with_local_path(remote: &FileAttachment, local: Option<&FileAttachment>) -> FileAttachment {
    let mut attachment = remote.clone();
    if let Some(local) = local.filter(|local| local.content_eq(remote)) {
        attachment.local_path.clone_from(&local.local_path);
    }
    attachment
}
