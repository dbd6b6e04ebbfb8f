//! Shared handle to the local database used by the queue, migration and sync.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::db::{
    ConflictRepository, Database, DocumentPatch, DocumentRepository, EventLog, MappingRepository,
    PersistedOperation, QueueStore, SqliteConflictRepository, SqliteDocumentRepository,
    SqliteEventLog, SqliteMappingRepository, SqliteQueueStore,
};
use crate::models::{
    ConflictId, Document, DocumentConflict, MigrationMapping, OperationId, QueuedOperation,
    SyncEventKind, SyncEventRecord, SyncId,
};
use crate::state::SyncState;
use crate::util::lock_unpoisoned;
use crate::Result;

/// Thread-safe handle over one local database.
///
/// Every call takes the connection lock for the duration of one synchronous
/// statement or transaction; the lock is never held across an await point.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open the store at the given filesystem path.
    ///
    /// A file that is not a database is moved aside and a fresh one created.
    pub fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let db = match Database::open(&db_path) {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local database at {} is unreadable: {}. Moving it aside and starting fresh.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_files(&db_path)?;
                Database::open(&db_path)?
            }
            Err(error) => return Err(error),
        };
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open_in_memory()?)),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Run `f` with exclusive access to the connection
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let db = lock_unpoisoned(&self.db);
        f(db.connection())
    }

    fn is_corrupted_db_error(error: &crate::Error) -> bool {
        let message = error.to_string().to_ascii_lowercase();
        message.contains("file is not a database") || message.contains("malformed")
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        if !db_path.exists() {
            return Ok(());
        }
        let timestamp = chrono::Utc::now().timestamp_millis();
        let base_name = db_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("docsync.db");
        let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));
        std::fs::rename(db_path, &backup_path)?;
        tracing::warn!(
            "Moved corrupted local DB file from {} to {}",
            db_path.display(),
            backup_path.display()
        );

        for suffix in ["-wal", "-shm"] {
            let sidecar = db_path.with_file_name(format!("{base_name}{suffix}"));
            if sidecar.exists() {
                std::fs::remove_file(&sidecar)?;
            }
        }
        Ok(())
    }

    /// Move a document to a new sync state without touching anything else
    pub fn set_state(&self, sync_id: &SyncId, state: SyncState) -> Result<Document> {
        self.update_by_sync_id(sync_id, &DocumentPatch::state(state))
    }
}

impl DocumentRepository for LocalStore {
    fn insert(&self, document: &Document) -> Result<()> {
        self.with_connection(|conn| SqliteDocumentRepository::new(conn).insert(document))
    }

    fn get(&self, sync_id: &SyncId) -> Result<Option<Document>> {
        self.with_connection(|conn| SqliteDocumentRepository::new(conn).get(sync_id))
    }

    fn list(&self, include_deleted: bool) -> Result<Vec<Document>> {
        self.with_connection(|conn| SqliteDocumentRepository::new(conn).list(include_deleted))
    }

    fn list_by_state(&self, state: SyncState) -> Result<Vec<Document>> {
        self.with_connection(|conn| SqliteDocumentRepository::new(conn).list_by_state(state))
    }

    fn update_by_sync_id(&self, sync_id: &SyncId, patch: &DocumentPatch) -> Result<Document> {
        self.with_connection(|conn| {
            SqliteDocumentRepository::new(conn).update_by_sync_id(sync_id, patch)
        })
    }

    fn purge(&self, sync_id: &SyncId) -> Result<bool> {
        self.with_connection(|conn| SqliteDocumentRepository::new(conn).purge(sync_id))
    }
}

impl QueueStore for LocalStore {
    fn commit(&self, remove: &[OperationId], save: &[QueuedOperation]) -> Result<()> {
        self.with_connection(|conn| SqliteQueueStore::new(conn).commit(remove, save))
    }

    fn delete_for_document(&self, document_id: &SyncId) -> Result<usize> {
        self.with_connection(|conn| SqliteQueueStore::new(conn).delete_for_document(document_id))
    }

    fn load_all(&self) -> Result<Vec<PersistedOperation>> {
        self.with_connection(|conn| SqliteQueueStore::new(conn).load_all())
    }

    fn discard_row(&self, row_id: i64) -> Result<()> {
        self.with_connection(|conn| SqliteQueueStore::new(conn).discard_row(row_id))
    }
}

impl MappingRepository for LocalStore {
    fn upsert_mapping(&self, mapping: &MigrationMapping) -> Result<()> {
        self.with_connection(|conn| SqliteMappingRepository::new(conn).upsert_mapping(mapping))
    }

    fn get_mapping(&self, legacy_path: &str) -> Result<Option<MigrationMapping>> {
        self.with_connection(|conn| SqliteMappingRepository::new(conn).get_mapping(legacy_path))
    }

    fn mappings_for_owner(&self, owner_id: &str) -> Result<Vec<MigrationMapping>> {
        self.with_connection(|conn| SqliteMappingRepository::new(conn).mappings_for_owner(owner_id))
    }

    fn mappings_for_document(&self, document_id: &SyncId) -> Result<Vec<MigrationMapping>> {
        self.with_connection(|conn| {
            SqliteMappingRepository::new(conn).mappings_for_document(document_id)
        })
    }
}

impl ConflictRepository for LocalStore {
    fn insert_conflict(&self, conflict: &DocumentConflict) -> Result<()> {
        self.with_connection(|conn| SqliteConflictRepository::new(conn).insert_conflict(conflict))
    }

    fn get_conflict(&self, id: &ConflictId) -> Result<Option<DocumentConflict>> {
        self.with_connection(|conn| SqliteConflictRepository::new(conn).get_conflict(id))
    }

    fn conflict_for_document(&self, sync_id: &SyncId) -> Result<Option<DocumentConflict>> {
        self.with_connection(|conn| SqliteConflictRepository::new(conn).conflict_for_document(sync_id))
    }

    fn list_conflicts(&self) -> Result<Vec<DocumentConflict>> {
        self.with_connection(|conn| SqliteConflictRepository::new(conn).list_conflicts())
    }

    fn delete_conflict(&self, id: &ConflictId) -> Result<()> {
        self.with_connection(|conn| SqliteConflictRepository::new(conn).delete_conflict(id))
    }
}

impl EventLog for LocalStore {
    fn record(
        &self,
        sync_id: Option<&SyncId>,
        kind: SyncEventKind,
        detail: &str,
    ) -> Result<SyncEventRecord> {
        self.with_connection(|conn| SqliteEventLog::new(conn).record(sync_id, kind, detail))
    }

    fn recent(&self, limit: usize) -> Result<Vec<SyncEventRecord>> {
        self.with_connection(|conn| SqliteEventLog::new(conn).recent(limit))
    }

    fn for_document(&self, sync_id: &SyncId, limit: usize) -> Result<Vec<SyncEventRecord>> {
        self.with_connection(|conn| SqliteEventLog::new(conn).for_document(sync_id, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentCategory;
    use tempfile::tempdir;

    #[test]
    fn open_path_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("docsync.db");
        let document = Document::new("u1", "Passport", DocumentCategory::Other).unwrap();

        {
            let store = LocalStore::open_path(&path).unwrap();
            store.insert(&document).unwrap();
        }

        let store = LocalStore::open_path(&path).unwrap();
        let loaded = store.get(&document.sync_id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.title, "Passport");
        assert_eq!(store.db_path(), Some(path.as_path()));
    }

    #[test]
    fn open_path_quarantines_non_database_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("docsync.db");
        std::fs::write(&path, b"definitely not sqlite, just some bytes padding the header")
            .unwrap();

        let store = LocalStore::open_path(&path).unwrap();
        assert!(store.list(true).unwrap().is_empty());

        let quarantined = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .any(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(quarantined);
    }

    #[test]
    fn set_state_only_moves_state() {
        let store = LocalStore::open_in_memory().unwrap();
        let document = Document::new("u1", "Lease", DocumentCategory::Contract).unwrap();
        store.insert(&document).unwrap();

        let updated = store.set_state(&document.sync_id, SyncState::Uploading).unwrap();
        assert_eq!(updated.sync_state, SyncState::Uploading);
        assert_eq!(updated.title, document.title);
        assert_eq!(updated.version, document.version);
    }
}
