//! Data models for docsync

mod attachment;
mod conflict;
mod document;
mod event;
mod migration;
mod queue;

pub use attachment::{validate_file_name, FileAttachment};
pub use conflict::{
    ConflictId, ConflictKind, ConflictPolicy, DocumentConflict, FieldSelection,
    ResolutionStrategy, Side,
};
pub use document::{Document, DocumentCategory, DocumentField, SyncId};
pub use event::{SyncEventKind, SyncEventRecord};
pub use migration::{
    FileMigrationProgress, FileMigrationStatus, MigrationMapping, MigrationProgress,
    MigrationReport, RollbackReport,
};
pub use queue::{
    FileReference, OperationId, OperationPayload, OperationType, QueueAnomaly, QueuedOperation,
    RawQueuedOperation,
};
