//! docsync-core - Offline-first document sync engine
//!
//! Local documents live in SQLite. Changes are queued while offline and
//! pushed to a versioned remote metadata store and a blob store when a sync
//! pass runs. Attachment files can be moved from the legacy per-username path
//! scheme to the per-account scheme without losing access to either copy.

pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod migration;
pub mod models;
pub mod queue;
pub mod remote;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{Document, SyncId};
pub use sync::SyncCoordinator;
