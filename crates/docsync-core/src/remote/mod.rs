//! Remote collaborators: identity provider, blob store and metadata store.
//!
//! The engine only talks to the outside world through these traits. Adapters
//! live in the submodules: in-memory stores for tests and demos, a local
//! filesystem blob store, an S3-compatible blob store and a metadata store
//! layered over any blob store.

mod blob_metadata;
mod fs;
mod memory;
mod s3;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::identity::{Principal, StableId};
use crate::models::{Document, SyncId};
use crate::state::SyncState;
use crate::util::unix_millis_now;

pub use blob_metadata::BlobMetadataStore;
pub use fs::FsBlobStore;
pub use memory::{MemoryBlobStore, MemoryMetadataStore, StaticIdentityProvider};
pub use s3::{S3BlobStore, S3Config};

/// Result type for remote calls
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Failure reported by a remote collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Remote object not found: {0}")]
    NotFound(String),

    /// The remote version no longer matches the version the write was based on
    #[error("Version conflict for {sync_id}: expected {expected}, remote has {actual}")]
    VersionConflict {
        sync_id: String,
        expected: i64,
        actual: i64,
    },

    /// Network failure, throttling or a 5xx response
    #[error("Transient remote failure: {0}")]
    Transient(String),

    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// The remote rejected the request itself; retrying cannot help
    #[error("Remote rejected request: {0}")]
    Validation(String),

    #[error("Identity unavailable: {0}")]
    IdentityUnavailable(String),
}

impl RemoteError {
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// Re-authentication is needed before any further remote call
    #[must_use]
    pub const fn needs_authentication(&self) -> bool {
        matches!(self, Self::AuthRequired(_) | Self::IdentityUnavailable(_))
    }

    /// Classify an HTTP status code returned by an object store
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::AuthRequired(message),
            404 => Self::NotFound(message),
            408 | 429 | 500..=599 => Self::Transient(message),
            _ => Self::Validation(message),
        }
    }
}

/// Run a remote call with a finite deadline; expiry becomes a retriable
/// [`RemoteError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> RemoteResult<T>
where
    F: Future<Output = RemoteResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(limit)),
    }
}

/// Source of the signed-in principal
#[allow(async_fn_in_trait)]
pub trait IdentityProvider {
    async fn authenticate(&self) -> RemoteResult<Principal>;

    async fn current_stable_id(&self) -> RemoteResult<StableId>;
}

/// Object storage addressed by slash-separated paths
#[allow(async_fn_in_trait)]
pub trait BlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> RemoteResult<()>;

    /// Fails with [`RemoteError::NotFound`] when nothing is stored at `path`
    async fn get(&self, path: &str) -> RemoteResult<Vec<u8>>;

    /// Deleting a missing object succeeds
    async fn delete(&self, path: &str) -> RemoteResult<()>;

    async fn exists(&self, path: &str) -> RemoteResult<bool>;

    /// Stored size in bytes, `None` when the object is missing
    async fn size(&self, path: &str) -> RemoteResult<Option<u64>> {
        match self.get(path).await {
            Ok(bytes) => Ok(Some(bytes.len() as u64)),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }
}

/// Authoritative document metadata with optimistic concurrency.
///
/// `upsert` is idempotent for a given `(document, expected_prior)` pair: the
/// write is accepted only when the stored version equals `expected_prior`
/// (0 for a document the remote has never seen), and the new version is
/// always `expected_prior + 1`.
#[allow(async_fn_in_trait)]
pub trait MetadataStore {
    async fn upsert(&self, document: &Document, expected_prior: i64) -> RemoteResult<i64>;

    /// Returns tombstoned documents too, with `deleted` set
    async fn fetch(&self, sync_id: &SyncId) -> RemoteResult<Document>;

    /// Tombstone the remote record; deleting a missing record succeeds
    async fn soft_delete(&self, sync_id: &SyncId) -> RemoteResult<()>;
}

/// Version check and normalization shared by the metadata store adapters.
fn accept_upsert(
    current: Option<&Document>,
    document: &Document,
    expected_prior: i64,
) -> RemoteResult<Document> {
    let actual = current.map_or(0, |stored| stored.version);
    if actual != expected_prior {
        return Err(RemoteError::VersionConflict {
            sync_id: document.sync_id.to_string(),
            expected: expected_prior,
            actual,
        });
    }

    let mut stored = document.clone();
    stored.version = expected_prior + 1;
    stored.base_version = stored.version;
    stored.sync_state = SyncState::Synced;
    stored.conflict_id = None;
    // device paths mean nothing to other devices
    for attachment in &mut stored.attachments {
        attachment.local_path = None;
    }
    Ok(stored)
}

fn tombstone(mut stored: Document) -> Document {
    if stored.deleted {
        return stored;
    }
    stored.version += 1;
    stored.base_version = stored.version;
    stored.deleted = true;
    stored.deleted_at = Some(unix_millis_now());
    stored
}

impl<T: IdentityProvider> IdentityProvider for Arc<T> {
    async fn authenticate(&self) -> RemoteResult<Principal> {
        self.as_ref().authenticate().await
    }

    async fn current_stable_id(&self) -> RemoteResult<StableId> {
        self.as_ref().current_stable_id().await
    }
}

impl<T: BlobStore> BlobStore for Arc<T> {
    async fn put(&self, path: &str, bytes: &[u8]) -> RemoteResult<()> {
        self.as_ref().put(path, bytes).await
    }

    async fn get(&self, path: &str) -> RemoteResult<Vec<u8>> {
        self.as_ref().get(path).await
    }

    async fn delete(&self, path: &str) -> RemoteResult<()> {
        self.as_ref().delete(path).await
    }

    async fn exists(&self, path: &str) -> RemoteResult<bool> {
        self.as_ref().exists(path).await
    }

    async fn size(&self, path: &str) -> RemoteResult<Option<u64>> {
        self.as_ref().size(path).await
    }
}

impl<T: MetadataStore> MetadataStore for Arc<T> {
    async fn upsert(&self, document: &Document, expected_prior: i64) -> RemoteResult<i64> {
        self.as_ref().upsert(document, expected_prior).await
    }

    async fn fetch(&self, sync_id: &SyncId) -> RemoteResult<Document> {
        self.as_ref().fetch(sync_id).await
    }

    async fn soft_delete(&self, sync_id: &SyncId) -> RemoteResult<()> {
        self.as_ref().soft_delete(sync_id).await
    }
}
