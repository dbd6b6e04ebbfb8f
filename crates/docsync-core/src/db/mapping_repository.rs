//! Persisted legacy-to-current path mappings

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::models::{MigrationMapping, SyncId};

const MAPPING_COLUMNS: &str =
    "legacy_path, new_path, owner_id, document_id, file_name, migrated_at, verified, last_error";

/// Trait for migration mapping storage
pub trait MappingRepository {
    /// Insert or replace the mapping keyed by its legacy path
    fn upsert_mapping(&self, mapping: &MigrationMapping) -> Result<()>;

    fn get_mapping(&self, legacy_path: &str) -> Result<Option<MigrationMapping>>;

    fn mappings_for_owner(&self, owner_id: &str) -> Result<Vec<MigrationMapping>>;

    fn mappings_for_document(&self, document_id: &SyncId) -> Result<Vec<MigrationMapping>>;
}

/// `SQLite` implementation of `MappingRepository`
pub struct SqliteMappingRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMappingRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_mapping(row: &Row<'_>) -> rusqlite::Result<MigrationMapping> {
        let document_id: String = row.get(3)?;
        let document_id = SyncId::parse(&document_id).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                Box::new(error),
            )
        })?;
        Ok(MigrationMapping {
            legacy_path: row.get(0)?,
            new_path: row.get(1)?,
            owner_id: row.get(2)?,
            document_id,
            file_name: row.get(4)?,
            migrated_at: row.get(5)?,
            verified: row.get::<_, i32>(6)? != 0,
            last_error: row.get(7)?,
        })
    }

    fn query(&self, filter: &str, value: &str) -> Result<Vec<MigrationMapping>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MAPPING_COLUMNS}
             FROM migration_mappings
             WHERE {filter} = ?
             ORDER BY document_id ASC, file_name ASC"
        ))?;
        let mappings = stmt
            .query_map(params![value], Self::parse_mapping)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(mappings)
    }
}

impl MappingRepository for SqliteMappingRepository<'_> {
    fn upsert_mapping(&self, mapping: &MigrationMapping) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO migration_mappings ({MAPPING_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                mapping.legacy_path,
                mapping.new_path,
                mapping.owner_id,
                mapping.document_id.as_str(),
                mapping.file_name,
                mapping.migrated_at,
                i32::from(mapping.verified),
                mapping.last_error
            ],
        )?;
        Ok(())
    }

    fn get_mapping(&self, legacy_path: &str) -> Result<Option<MigrationMapping>> {
        let mapping = self
            .conn
            .query_row(
                &format!("SELECT {MAPPING_COLUMNS} FROM migration_mappings WHERE legacy_path = ?"),
                params![legacy_path],
                Self::parse_mapping,
            )
            .optional()?;
        Ok(mapping)
    }

    fn mappings_for_owner(&self, owner_id: &str) -> Result<Vec<MigrationMapping>> {
        self.query("owner_id", owner_id)
    }

    fn mappings_for_document(&self, document_id: &SyncId) -> Result<Vec<MigrationMapping>> {
        self.query("document_id", document_id.as_str())
    }
}
