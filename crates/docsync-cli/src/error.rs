use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] docsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Document title cannot be empty")]
    EmptyTitle,
    #[error("Nothing to change; pass at least one of --title, --category, --date, --notes")]
    EmptyEdit,
    #[error("ID cannot be empty")]
    EmptyId,
    #[error("Document not found for id/prefix: {0}")]
    DocumentNotFound(String),
    #[error("Conflict not found for id/prefix: {0}")]
    ConflictNotFound(String),
    #[error("{0}")]
    AmbiguousId(String),
    #[error("Invalid date '{0}'; expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("Unknown document field '{0}'")]
    UnknownField(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Not signed in. Run `docsync config init --account-id <ID> --username <NAME>`.")]
    SignedOut,
}
