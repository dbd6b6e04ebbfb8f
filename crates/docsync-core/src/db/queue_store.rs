//! Durable storage for the offline operation queue

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::{OperationId, QueuedOperation, RawQueuedOperation, SyncId};

/// A persisted queue row with its storage key, before validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedOperation {
    pub row_id: i64,
    pub raw: RawQueuedOperation,
}

/// Trait for queue persistence.
///
/// All writes are synchronous and complete before the call returns, so an
/// accepted enqueue survives a crash.
pub trait QueueStore {
    /// Atomically remove `remove` and insert or replace `save`
    fn commit(&self, remove: &[OperationId], save: &[QueuedOperation]) -> Result<()>;

    /// Insert or replace one entry
    fn save(&self, operation: &QueuedOperation) -> Result<()> {
        self.commit(&[], std::slice::from_ref(operation))
    }

    /// Remove one entry
    fn delete(&self, id: &OperationId) -> Result<()> {
        self.commit(std::slice::from_ref(id), &[])
    }

    /// Remove every entry targeting `document_id`, returning how many were removed
    fn delete_for_document(&self, document_id: &SyncId) -> Result<usize>;

    /// Every stored row in insertion order, valid or not
    fn load_all(&self) -> Result<Vec<PersistedOperation>>;

    /// Remove a row by storage key; used for rows too damaged to have an id
    fn discard_row(&self, row_id: i64) -> Result<()>;
}

/// `SQLite` implementation of `QueueStore`
pub struct SqliteQueueStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteQueueStore<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl QueueStore for SqliteQueueStore<'_> {
    fn commit(&self, remove: &[OperationId], save: &[QueuedOperation]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for id in remove {
            tx.execute(
                "DELETE FROM queue_operations WHERE id = ?",
                params![id.to_string()],
            )?;
        }
        for operation in save {
            let payload = serde_json::to_string(&operation.payload)?;
            let seq = i64::try_from(operation.seq).unwrap_or(i64::MAX);
            tx.execute(
                "INSERT INTO queue_operations
                    (id, document_id, op_type, payload, priority, enqueued_at, retry_count, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    document_id = excluded.document_id,
                    op_type = excluded.op_type,
                    payload = excluded.payload,
                    priority = excluded.priority,
                    enqueued_at = excluded.enqueued_at,
                    retry_count = excluded.retry_count,
                    seq = excluded.seq",
                params![
                    operation.id.to_string(),
                    operation.document_id.as_str(),
                    operation.op_type.as_str(),
                    payload,
                    operation.priority,
                    operation.enqueued_at,
                    operation.retry_count,
                    seq
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_for_document(&self, document_id: &SyncId) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM queue_operations WHERE document_id = ?",
            params![document_id.as_str()],
        )?;
        Ok(rows)
    }

    fn load_all(&self) -> Result<Vec<PersistedOperation>> {
        let mut stmt = self.conn.prepare(
            "SELECT row_id, id, document_id, op_type, payload, priority, enqueued_at,
                    retry_count, seq
             FROM queue_operations
             ORDER BY row_id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PersistedOperation {
                    row_id: row.get(0)?,
                    raw: RawQueuedOperation {
                        id: row.get(1)?,
                        document_id: row.get(2)?,
                        op_type: row.get(3)?,
                        payload: row.get(4)?,
                        priority: row.get(5)?,
                        enqueued_at: row.get(6)?,
                        retry_count: row.get(7)?,
                        seq: row.get(8)?,
                    },
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn discard_row(&self, row_id: i64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM queue_operations WHERE row_id = ?",
            params![row_id],
        )?;
        Ok(())
    }
}
