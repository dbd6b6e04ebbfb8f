//! Append-only local log of sync activity

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::models::{SyncEventKind, SyncEventRecord, SyncId};
use crate::util::unix_millis_now;

/// Trait for sync event storage
pub trait EventLog {
    fn record(
        &self,
        sync_id: Option<&SyncId>,
        kind: SyncEventKind,
        detail: &str,
    ) -> Result<SyncEventRecord>;

    /// Most recent events first
    fn recent(&self, limit: usize) -> Result<Vec<SyncEventRecord>>;

    /// Most recent events for one document first
    fn for_document(&self, sync_id: &SyncId, limit: usize) -> Result<Vec<SyncEventRecord>>;
}

/// `SQLite` implementation of `EventLog`
pub struct SqliteEventLog<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteEventLog<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_event(row: &Row<'_>) -> rusqlite::Result<SyncEventRecord> {
        let conversion = |index: usize, error: crate::Error| {
            rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error))
        };
        let sync_id = row
            .get::<_, Option<String>>(1)?
            .map(|value| SyncId::parse(&value).map_err(|error| conversion(1, error)))
            .transpose()?;
        let kind: String = row.get(2)?;
        Ok(SyncEventRecord {
            id: row.get(0)?,
            sync_id,
            kind: kind.parse().map_err(|error| conversion(2, error))?,
            detail: row.get(3)?,
            recorded_at: row.get(4)?,
        })
    }
}

impl EventLog for SqliteEventLog<'_> {
    fn record(
        &self,
        sync_id: Option<&SyncId>,
        kind: SyncEventKind,
        detail: &str,
    ) -> Result<SyncEventRecord> {
        let recorded_at = unix_millis_now();
        self.conn.execute(
            "INSERT INTO sync_events (sync_id, kind, detail, recorded_at) VALUES (?, ?, ?, ?)",
            params![
                sync_id.map(SyncId::as_str),
                kind.as_str(),
                detail,
                recorded_at
            ],
        )?;
        Ok(SyncEventRecord {
            id: self.conn.last_insert_rowid(),
            sync_id: sync_id.cloned(),
            kind,
            detail: detail.to_string(),
            recorded_at,
        })
    }

    fn recent(&self, limit: usize) -> Result<Vec<SyncEventRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, sync_id, kind, detail, recorded_at
             FROM sync_events
             ORDER BY id DESC
             LIMIT ?",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let events = stmt
            .query_map(params![limit], Self::parse_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn for_document(&self, sync_id: &SyncId, limit: usize) -> Result<Vec<SyncEventRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, sync_id, kind, detail, recorded_at
             FROM sync_events
             WHERE sync_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let events = stmt
            .query_map(params![sync_id.as_str(), limit], Self::parse_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_and_recent_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let log = SqliteEventLog::new(db.connection());
        let sync_id = SyncId::new();

        log.record(Some(&sync_id), SyncEventKind::Queued, "upload queued")
            .unwrap();
        log.record(Some(&sync_id), SyncEventKind::Uploaded, "version 1")
            .unwrap();
        log.record(None, SyncEventKind::Migrated, "3 files").unwrap();

        let kinds: Vec<_> = log.recent(10).unwrap().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SyncEventKind::Migrated,
                SyncEventKind::Uploaded,
                SyncEventKind::Queued
            ]
        );
        assert_eq!(log.recent(1).unwrap().len(), 1);
    }

    #[test]
    fn test_for_document_filters() {
        let db = Database::open_in_memory().unwrap();
        let log = SqliteEventLog::new(db.connection());
        let first = SyncId::new();
        let second = SyncId::new();
        log.record(Some(&first), SyncEventKind::Queued, "a").unwrap();
        log.record(Some(&second), SyncEventKind::Queued, "b").unwrap();

        let events = log.for_document(&first, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sync_id.as_ref(), Some(&first));
        assert_eq!(events[0].detail, "a");
    }

    #[test]
    fn test_unbounded_limit_returns_everything() {
        let db = Database::open_in_memory().unwrap();
        let log = SqliteEventLog::new(db.connection());
        let sync_id = SyncId::new();
        log.record(Some(&sync_id), SyncEventKind::Queued, "a").unwrap();
        log.record(Some(&sync_id), SyncEventKind::Uploaded, "b").unwrap();

        assert_eq!(log.recent(usize::MAX).unwrap().len(), 2);
        assert_eq!(log.for_document(&sync_id, usize::MAX).unwrap().len(), 2);
    }
}
