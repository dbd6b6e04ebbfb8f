//! Database layer for docsync

mod connection;
mod conflict_repository;
mod event_log;
mod mapping_repository;
mod migrations;
mod queue_store;
mod repository;

pub use conflict_repository::{ConflictRepository, SqliteConflictRepository};
pub use connection::Database;
pub use event_log::{EventLog, SqliteEventLog};
pub use mapping_repository::{MappingRepository, SqliteMappingRepository};
pub use queue_store::{PersistedOperation, QueueStore, SqliteQueueStore};
pub use repository::{DocumentPatch, DocumentRepository, SqliteDocumentRepository};
