//! Retained conflict candidates

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::models::{ConflictId, DocumentConflict, SyncId};

const CONFLICT_COLUMNS: &str =
    "id, sync_id, kind, fields, local_snapshot, remote_snapshot, detected_at";

/// Trait for conflict storage
pub trait ConflictRepository {
    fn insert_conflict(&self, conflict: &DocumentConflict) -> Result<()>;

    fn get_conflict(&self, id: &ConflictId) -> Result<Option<DocumentConflict>>;

    /// The open conflict for a document, if any
    fn conflict_for_document(&self, sync_id: &SyncId) -> Result<Option<DocumentConflict>>;

    /// Open conflicts, oldest first
    fn list_conflicts(&self) -> Result<Vec<DocumentConflict>>;

    fn delete_conflict(&self, id: &ConflictId) -> Result<()>;
}

/// `SQLite` implementation of `ConflictRepository`; snapshots are stored as JSON
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &Row<'_>) -> rusqlite::Result<DocumentConflict> {
        fn json<T: serde::de::DeserializeOwned>(
            row: &Row<'_>,
            index: usize,
        ) -> rusqlite::Result<T> {
            let value: String = row.get(index)?;
            serde_json::from_str(&value).map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error))
            })
        }
        fn text<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
        where
            T: std::str::FromStr,
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            let value: String = row.get(index)?;
            value.parse().map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error))
            })
        }

        Ok(DocumentConflict {
            id: text(row, 0)?,
            sync_id: text(row, 1)?,
            kind: text(row, 2)?,
            fields: json(row, 3)?,
            local: json(row, 4)?,
            remote: json(row, 5)?,
            detected_at: row.get(6)?,
        })
    }
}

impl ConflictRepository for SqliteConflictRepository<'_> {
    fn insert_conflict(&self, conflict: &DocumentConflict) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO document_conflicts ({CONFLICT_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                conflict.id.to_string(),
                conflict.sync_id.as_str(),
                conflict.kind.as_str(),
                serde_json::to_string(&conflict.fields)?,
                serde_json::to_string(&conflict.local)?,
                serde_json::to_string(&conflict.remote)?,
                conflict.detected_at
            ],
        )?;
        Ok(())
    }

    fn get_conflict(&self, id: &ConflictId) -> Result<Option<DocumentConflict>> {
        let conflict = self
            .conn
            .query_row(
                &format!("SELECT {CONFLICT_COLUMNS} FROM document_conflicts WHERE id = ?"),
                params![id.to_string()],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    fn conflict_for_document(&self, sync_id: &SyncId) -> Result<Option<DocumentConflict>> {
        let conflict = self
            .conn
            .query_row(
                &format!(
                    "SELECT {CONFLICT_COLUMNS} FROM document_conflicts
                     WHERE sync_id = ?
                     ORDER BY detected_at DESC
                     LIMIT 1"
                ),
                params![sync_id.as_str()],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    fn list_conflicts(&self) -> Result<Vec<DocumentConflict>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM document_conflicts ORDER BY detected_at ASC"
        ))?;
        let conflicts = stmt
            .query_map([], Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    fn delete_conflict(&self, id: &ConflictId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM document_conflicts WHERE id = ?",
            params![id.to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, DocumentRepository, SqliteDocumentRepository};
    use crate::models::{ConflictKind, Document, DocumentCategory, DocumentField};
    use pretty_assertions::assert_eq;

    fn stored_conflict(db: &Database) -> DocumentConflict {
        let local = Document::new("u1", "Lease", DocumentCategory::Contract).unwrap();
        SqliteDocumentRepository::new(db.connection())
            .insert(&local)
            .unwrap();
        let mut remote = local.clone();
        remote.title = "Lease (renewed)".to_string();
        remote.version = 3;

        DocumentConflict {
            id: ConflictId::new(),
            sync_id: local.sync_id.clone(),
            kind: ConflictKind::Content,
            fields: vec![DocumentField::Title],
            local,
            remote,
            detected_at: 100,
        }
    }

    #[test]
    fn test_insert_get_and_delete() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteConflictRepository::new(db.connection());
        let conflict = stored_conflict(&db);

        repo.insert_conflict(&conflict).unwrap();
        assert_eq!(repo.get_conflict(&conflict.id).unwrap().unwrap(), conflict);
        assert_eq!(
            repo.conflict_for_document(&conflict.sync_id).unwrap().unwrap().id,
            conflict.id
        );
        assert_eq!(repo.list_conflicts().unwrap().len(), 1);

        repo.delete_conflict(&conflict.id).unwrap();
        assert!(repo.get_conflict(&conflict.id).unwrap().is_none());
    }

    #[test]
    fn test_conflicts_are_removed_with_their_document() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteConflictRepository::new(db.connection());
        let conflict = stored_conflict(&db);
        repo.insert_conflict(&conflict).unwrap();

        SqliteDocumentRepository::new(db.connection())
            .purge(&conflict.sync_id)
            .unwrap();
        assert!(repo.list_conflicts().unwrap().is_empty());
    }
}
