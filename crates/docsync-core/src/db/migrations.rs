//! Database migrations

use crate::error::Result;
use rusqlite::{params, Connection};

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = current_version(conn)?;

    if version < 1 {
        apply(conn, 1, MIGRATION_V1)?;
    }
    if version < 2 {
        apply(conn, 2, MIGRATION_V2)?;
    }

    Ok(())
}

/// Get the current schema version (0 for a fresh database)
pub fn current_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn apply(conn: &mut Connection, version: i32, sql: &str) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(sql)?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Version 1: documents, attachments and the offline queue
const MIGRATION_V1: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS documents (
    sync_id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    title TEXT NOT NULL,
    category TEXT NOT NULL,
    date TEXT,
    notes TEXT,
    version INTEGER NOT NULL,
    base_version INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    last_modified INTEGER NOT NULL,
    sync_state TEXT NOT NULL,
    conflict_id TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_documents_state ON documents(sync_state);
CREATE INDEX IF NOT EXISTS idx_documents_modified ON documents(last_modified DESC);

CREATE TABLE IF NOT EXISTS attachments (
    sync_id TEXT NOT NULL REFERENCES documents(sync_id) ON DELETE CASCADE,
    file_name TEXT NOT NULL,
    position INTEGER NOT NULL,
    label TEXT,
    local_path TEXT,
    remote_key TEXT,
    size_bytes INTEGER NOT NULL,
    added_at INTEGER NOT NULL,
    PRIMARY KEY (sync_id, file_name)
);

-- columns are nullable so damaged rows can be loaded, reported and discarded
CREATE TABLE IF NOT EXISTS queue_operations (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT UNIQUE,
    document_id TEXT,
    op_type TEXT,
    payload TEXT,
    priority INTEGER,
    enqueued_at INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0,
    seq INTEGER
);
CREATE INDEX IF NOT EXISTS idx_queue_document ON queue_operations(document_id);
";

/// Version 2: path migration bookkeeping, retained conflicts and the sync event log
const MIGRATION_V2: &str = "
CREATE TABLE IF NOT EXISTS migration_mappings (
    legacy_path TEXT PRIMARY KEY,
    new_path TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    document_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    migrated_at INTEGER,
    verified INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_migration_owner ON migration_mappings(owner_id);
CREATE INDEX IF NOT EXISTS idx_migration_document ON migration_mappings(document_id);

CREATE TABLE IF NOT EXISTS document_conflicts (
    id TEXT PRIMARY KEY,
    sync_id TEXT NOT NULL REFERENCES documents(sync_id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    fields TEXT NOT NULL,
    local_snapshot TEXT NOT NULL,
    remote_snapshot TEXT NOT NULL,
    detected_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conflicts_sync_id ON document_conflicts(sync_id);

CREATE TABLE IF NOT EXISTS sync_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sync_id TEXT,
    kind TEXT NOT NULL,
    detail TEXT NOT NULL,
    recorded_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sync_events_recorded ON sync_events(recorded_at DESC);
";
