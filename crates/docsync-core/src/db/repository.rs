//! Document repository implementation

use chrono::NaiveDate;
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::models::{ConflictId, Document, DocumentCategory, FileAttachment, SyncId};
use crate::state::SyncState;

const DATE_FORMAT: &str = "%Y-%m-%d";

const DOCUMENT_COLUMNS: &str = "sync_id, owner_id, title, category, date, notes, version, \
     base_version, created_at, last_modified, sync_state, conflict_id, deleted, deleted_at";

/// Partial update applied through [`DocumentRepository::update_by_sync_id`].
///
/// `None` leaves a column untouched. Nullable columns use a nested option so
/// they can be cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentPatch {
    pub title: Option<String>,
    pub category: Option<DocumentCategory>,
    pub date: Option<Option<NaiveDate>>,
    pub notes: Option<Option<String>>,
    /// Replaces the whole attachment list, order included
    pub attachments: Option<Vec<FileAttachment>>,
    pub version: Option<i64>,
    pub base_version: Option<i64>,
    pub last_modified: Option<i64>,
    pub sync_state: Option<SyncState>,
    pub conflict_id: Option<Option<ConflictId>>,
    pub deleted: Option<bool>,
    pub deleted_at: Option<Option<i64>>,
}

impl DocumentPatch {
    /// Patch that only moves the sync state
    #[must_use]
    pub fn state(state: SyncState) -> Self {
        Self {
            sync_state: Some(state),
            ..Self::default()
        }
    }

    /// Patch overwriting every mutable column with the values in `document`
    #[must_use]
    pub fn from_document(document: &Document) -> Self {
        Self {
            title: Some(document.title.clone()),
            category: Some(document.category),
            date: Some(document.date),
            notes: Some(document.notes.clone()),
            attachments: Some(document.attachments.clone()),
            version: Some(document.version),
            base_version: Some(document.base_version),
            last_modified: Some(document.last_modified),
            sync_state: Some(document.sync_state),
            conflict_id: Some(document.conflict_id),
            deleted: Some(document.deleted),
            deleted_at: Some(document.deleted_at),
        }
    }

    #[must_use]
    pub const fn with_state(mut self, state: SyncState) -> Self {
        self.sync_state = Some(state);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Trait for local document storage
pub trait DocumentRepository {
    /// Insert a new document with its attachments
    fn insert(&self, document: &Document) -> Result<()>;

    /// Get a document by sync id, tombstones included
    fn get(&self, sync_id: &SyncId) -> Result<Option<Document>>;

    /// List documents, most recently modified first
    fn list(&self, include_deleted: bool) -> Result<Vec<Document>>;

    /// List documents in the given sync state
    fn list_by_state(&self, state: SyncState) -> Result<Vec<Document>>;

    /// Apply a patch to an existing record and return the updated document
    fn update_by_sync_id(&self, sync_id: &SyncId, patch: &DocumentPatch) -> Result<Document>;

    /// Remove a document and everything attached to it. Returns whether a row existed.
    fn purge(&self, sync_id: &SyncId) -> Result<bool>;
}

/// `SQLite` implementation of `DocumentRepository`
pub struct SqliteDocumentRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteDocumentRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn load_attachments(&self, sync_id: &SyncId) -> Result<Vec<FileAttachment>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_name, label, local_path, remote_key, size_bytes, added_at
             FROM attachments
             WHERE sync_id = ?
             ORDER BY position ASC",
        )?;
        let attachments = stmt
            .query_map(params![sync_id.as_str()], |row| {
                Ok(FileAttachment {
                    file_name: row.get(0)?,
                    label: row.get(1)?,
                    local_path: row.get(2)?,
                    remote_key: row.get(3)?,
                    size_bytes: row.get(4)?,
                    added_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(attachments)
    }

    fn with_attachments(&self, mut documents: Vec<Document>) -> Result<Vec<Document>> {
        for document in &mut documents {
            document.attachments = self.load_attachments(&document.sync_id)?;
        }
        Ok(documents)
    }

    /// Parse a document from a database row, without attachments
    fn parse_document(row: &Row<'_>) -> rusqlite::Result<Document> {
        let date = row
            .get::<_, Option<String>>(4)?
            .map(|value| {
                NaiveDate::parse_from_str(&value, DATE_FORMAT)
                    .map_err(|error| conversion_error(4, error))
            })
            .transpose()?;
        let conflict_id = row
            .get::<_, Option<String>>(11)?
            .map(|value| {
                value
                    .parse::<ConflictId>()
                    .map_err(|error| conversion_error(11, error))
            })
            .transpose()?;

        Ok(Document {
            sync_id: parse_text(row, 0)?,
            owner_id: row.get(1)?,
            title: row.get(2)?,
            category: parse_text(row, 3)?,
            date,
            notes: row.get(5)?,
            attachments: Vec::new(),
            version: row.get(6)?,
            base_version: row.get(7)?,
            created_at: row.get(8)?,
            last_modified: row.get(9)?,
            sync_state: parse_text(row, 10)?,
            conflict_id,
            deleted: row.get::<_, i32>(12)? != 0,
            deleted_at: row.get(13)?,
        })
    }
}

fn parse_text<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value: String = row.get(index)?;
    value.parse().map_err(|error| conversion_error(index, error))
}

fn conversion_error(
    index: usize,
    error: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error))
}

fn write_attachments(
    conn: &Connection,
    sync_id: &SyncId,
    attachments: &[FileAttachment],
) -> Result<()> {
    conn.execute(
        "DELETE FROM attachments WHERE sync_id = ?",
        params![sync_id.as_str()],
    )?;
    for (position, attachment) in attachments.iter().enumerate() {
        let position = i64::try_from(position)
            .map_err(|_| Error::InvalidInput("too many attachments".to_string()))?;
        conn.execute(
            "INSERT INTO attachments
                (sync_id, file_name, position, label, local_path, remote_key, size_bytes, added_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                sync_id.as_str(),
                attachment.file_name,
                position,
                attachment.label,
                attachment.local_path,
                attachment.remote_key,
                attachment.size_bytes,
                attachment.added_at
            ],
        )?;
    }
    Ok(())
}

impl DocumentRepository for SqliteDocumentRepository<'_> {
    fn insert(&self, document: &Document) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO documents ({DOCUMENT_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                document.sync_id.as_str(),
                document.owner_id,
                document.title,
                document.category.as_str(),
                document.date.map(|date| date.format(DATE_FORMAT).to_string()),
                document.notes,
                document.version,
                document.base_version,
                document.created_at,
                document.last_modified,
                document.sync_state.as_str(),
                document.conflict_id.map(|id| id.to_string()),
                i32::from(document.deleted),
                document.deleted_at
            ],
        )?;
        write_attachments(&tx, &document.sync_id, &document.attachments)?;
        tx.commit()?;
        Ok(())
    }

    fn get(&self, sync_id: &SyncId) -> Result<Option<Document>> {
        let document = self
            .conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE sync_id = ?"),
                params![sync_id.as_str()],
                Self::parse_document,
            )
            .optional()?;

        match document {
            Some(mut document) => {
                document.attachments = self.load_attachments(sync_id)?;
                Ok(Some(document))
            }
            None => Ok(None),
        }
    }

    fn list(&self, include_deleted: bool) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS}
             FROM documents
             WHERE deleted = 0 OR ?1
             ORDER BY last_modified DESC, sync_id ASC"
        ))?;
        let documents = stmt
            .query_map(params![include_deleted], Self::parse_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        self.with_attachments(documents)
    }

    fn list_by_state(&self, state: SyncState) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS}
             FROM documents
             WHERE sync_state = ?
             ORDER BY last_modified ASC"
        ))?;
        let documents = stmt
            .query_map(params![state.as_str()], Self::parse_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        self.with_attachments(documents)
    }

    fn update_by_sync_id(&self, sync_id: &SyncId, patch: &DocumentPatch) -> Result<Document> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(title) = &patch.title {
            sets.push("title = ?");
            values.push(Box::new(title.clone()));
        }
        if let Some(category) = patch.category {
            sets.push("category = ?");
            values.push(Box::new(category.as_str()));
        }
        if let Some(date) = patch.date {
            sets.push("date = ?");
            values.push(Box::new(date.map(|date| date.format(DATE_FORMAT).to_string())));
        }
        if let Some(notes) = &patch.notes {
            sets.push("notes = ?");
            values.push(Box::new(notes.clone()));
        }
        if let Some(version) = patch.version {
            sets.push("version = ?");
            values.push(Box::new(version));
        }
        if let Some(base_version) = patch.base_version {
            sets.push("base_version = ?");
            values.push(Box::new(base_version));
        }
        if let Some(last_modified) = patch.last_modified {
            sets.push("last_modified = ?");
            values.push(Box::new(last_modified));
        }
        if let Some(state) = patch.sync_state {
            sets.push("sync_state = ?");
            values.push(Box::new(state.as_str()));
        }
        if let Some(conflict_id) = patch.conflict_id {
            sets.push("conflict_id = ?");
            values.push(Box::new(conflict_id.map(|id| id.to_string())));
        }
        if let Some(deleted) = patch.deleted {
            sets.push("deleted = ?");
            values.push(Box::new(i32::from(deleted)));
        }
        if let Some(deleted_at) = patch.deleted_at {
            sets.push("deleted_at = ?");
            values.push(Box::new(deleted_at));
        }

        let tx = self.conn.unchecked_transaction()?;
        let exists = if sets.is_empty() {
            tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM documents WHERE sync_id = ?)",
                params![sync_id.as_str()],
                |row| row.get::<_, bool>(0),
            )?
        } else {
            values.push(Box::new(sync_id.to_string()));
            let sql = format!(
                "UPDATE documents SET {} WHERE sync_id = ?",
                sets.join(", ")
            );
            tx.execute(&sql, params_from_iter(values.iter()))? > 0
        };
        if !exists {
            return Err(Error::NotFound(sync_id.to_string()));
        }
        if let Some(attachments) = &patch.attachments {
            write_attachments(&tx, sync_id, attachments)?;
        }
        tx.commit()?;

        self.get(sync_id)?
            .ok_or_else(|| Error::NotFound(sync_id.to_string()))
    }

    fn purge(&self, sync_id: &SyncId) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM documents WHERE sync_id = ?",
            params![sync_id.as_str()],
        )?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn sample(title: &str) -> Document {
        let mut document = Document::new("u1", title, DocumentCategory::Insurance).unwrap();
        document.date = NaiveDate::from_ymd_opt(2025, 3, 1);
        document.notes = Some("annual renewal".to_string());
        document.attachments.push(
            FileAttachment::new_local("policy.pdf", "/tmp/policy.pdf", 120)
                .unwrap()
                .with_label("Policy"),
        );
        document.attachments.push(FileAttachment::new_local("terms.pdf", "/tmp/terms.pdf", 40).unwrap());
        document
    }

    #[test]
    fn test_insert_and_get() {
        let db = setup();
        let repo = SqliteDocumentRepository::new(db.connection());
        let document = sample("Home insurance");

        repo.insert(&document).unwrap();
        let fetched = repo.get(&document.sync_id).unwrap().unwrap();
        assert_eq!(fetched, document);
    }

    #[test]
    fn test_get_missing_returns_none() {
        let db = setup();
        let repo = SqliteDocumentRepository::new(db.connection());
        assert!(repo.get(&SyncId::new()).unwrap().is_none());
    }

    #[test]
    fn test_update_by_sync_id_applies_only_patched_columns() {
        let db = setup();
        let repo = SqliteDocumentRepository::new(db.connection());
        let document = sample("Car insurance");
        repo.insert(&document).unwrap();

        let updated = repo
            .update_by_sync_id(
                &document.sync_id,
                &DocumentPatch {
                    title: Some("Car insurance 2025".to_string()),
                    notes: Some(None),
                    ..DocumentPatch::state(SyncState::Uploading)
                },
            )
            .unwrap();

        assert_eq!(updated.title, "Car insurance 2025");
        assert_eq!(updated.notes, None);
        assert_eq!(updated.sync_state, SyncState::Uploading);
        assert_eq!(updated.date, document.date);
        assert_eq!(updated.attachments, document.attachments);
        assert_eq!(updated.version, document.version);
    }

    #[test]
    fn test_update_replaces_attachments_in_order() {
        let db = setup();
        let repo = SqliteDocumentRepository::new(db.connection());
        let document = sample("Lease");
        repo.insert(&document).unwrap();

        let mut reordered = document.attachments.clone();
        reordered.reverse();
        reordered.pop();
        let updated = repo
            .update_by_sync_id(
                &document.sync_id,
                &DocumentPatch {
                    attachments: Some(reordered.clone()),
                    ..DocumentPatch::default()
                },
            )
            .unwrap();
        assert_eq!(updated.attachments, reordered);
    }

    #[test]
    fn test_update_missing_document_is_not_found() {
        let db = setup();
        let repo = SqliteDocumentRepository::new(db.connection());

        let error = repo
            .update_by_sync_id(&SyncId::new(), &DocumentPatch::state(SyncState::Synced))
            .unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));

        let error = repo
            .update_by_sync_id(&SyncId::new(), &DocumentPatch::default())
            .unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));
    }

    #[test]
    fn test_list_hides_tombstones_unless_requested() {
        let db = setup();
        let repo = SqliteDocumentRepository::new(db.connection());
        let kept = sample("Kept");
        let removed = sample("Removed");
        repo.insert(&kept).unwrap();
        repo.insert(&removed).unwrap();
        repo.update_by_sync_id(
            &removed.sync_id,
            &DocumentPatch {
                deleted: Some(true),
                deleted_at: Some(Some(1)),
                ..DocumentPatch::default()
            },
        )
        .unwrap();

        let visible = repo.list(false).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].sync_id, kept.sync_id);
        assert_eq!(repo.list(true).unwrap().len(), 2);
    }

    #[test]
    fn test_list_by_state() {
        let db = setup();
        let repo = SqliteDocumentRepository::new(db.connection());
        let pending = sample("Pending");
        let synced = sample("Synced");
        repo.insert(&pending).unwrap();
        repo.insert(&synced).unwrap();
        repo.update_by_sync_id(&synced.sync_id, &DocumentPatch::state(SyncState::Synced))
            .unwrap();

        let found = repo.list_by_state(SyncState::Synced).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sync_id, synced.sync_id);
    }

    #[test]
    fn test_purge_cascades_to_attachments() {
        let db = setup();
        let repo = SqliteDocumentRepository::new(db.connection());
        let document = sample("Warranty");
        repo.insert(&document).unwrap();

        assert!(repo.purge(&document.sync_id).unwrap());
        assert!(!repo.purge(&document.sync_id).unwrap());

        let orphans: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM attachments", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
    }
}
