//! Metadata store layered over a blob store.
//!
//! Each document is one JSON object at `{prefix}/{sync_id}.json`. The version
//! check is read-then-write, serialized by an in-process lock; deployments
//! where several processes write the same bucket need a store with a native
//! conditional write instead.

use tokio::sync::Mutex;

use crate::models::{Document, SyncId};

use super::{
    accept_upsert, tombstone, BlobStore, MetadataStore, RemoteError, RemoteResult,
};

pub const DEFAULT_METADATA_PREFIX: &str = "metadata";

#[derive(Debug)]
pub struct BlobMetadataStore<B> {
    blobs: B,
    prefix: String,
    write_lock: Mutex<()>,
}

impl<B: BlobStore> BlobMetadataStore<B> {
    pub fn new(blobs: B) -> Self {
        Self::with_prefix(blobs, DEFAULT_METADATA_PREFIX)
    }

    pub fn with_prefix(blobs: B, prefix: &str) -> Self {
        Self {
            blobs,
            prefix: prefix.trim().trim_matches('/').to_string(),
            write_lock: Mutex::new(()),
        }
    }

    pub const fn blobs(&self) -> &B {
        &self.blobs
    }

    fn record_path(&self, sync_id: &SyncId) -> String {
        format!("{}/{sync_id}.json", self.prefix)
    }

    async fn read(&self, sync_id: &SyncId) -> RemoteResult<Option<Document>> {
        match self.blobs.get(&self.record_path(sync_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|error| {
                RemoteError::Validation(format!("corrupt metadata record for {sync_id}: {error}"))
            }),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn write(&self, document: &Document) -> RemoteResult<()> {
        let bytes = serde_json::to_vec(document).map_err(|error| {
            RemoteError::Validation(format!(
                "cannot encode metadata record for {}: {error}",
                document.sync_id
            ))
        })?;
        self.blobs
            .put(&self.record_path(&document.sync_id), &bytes)
            .await
    }
}

impl<B: BlobStore> MetadataStore for BlobMetadataStore<B> {
    async fn upsert(&self, document: &Document, expected_prior: i64) -> RemoteResult<i64> {
        let _guard = self.write_lock.lock().await;
        let current = self.read(&document.sync_id).await?;
        let stored = accept_upsert(current.as_ref(), document, expected_prior)?;
        self.write(&stored).await?;
        Ok(stored.version)
    }

    async fn fetch(&self, sync_id: &SyncId) -> RemoteResult<Document> {
        self.read(sync_id)
            .await?
            .ok_or_else(|| RemoteError::NotFound(sync_id.to_string()))
    }

    async fn soft_delete(&self, sync_id: &SyncId) -> RemoteResult<()> {
        let _guard = self.write_lock.lock().await;
        let Some(current) = self.read(sync_id).await? else {
            return Ok(());
        };
        if current.deleted {
            return Ok(());
        }
        self.write(&tombstone(current)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentCategory;
    use crate::remote::MemoryBlobStore;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread")]
    async fn records_are_json_objects_under_prefix() {
        let store = BlobMetadataStore::new(MemoryBlobStore::new());
        let doc = Document::new("u1", "Passport", DocumentCategory::Other).unwrap();

        assert_eq!(store.upsert(&doc, 0).await.unwrap(), 1);
        let path = format!("metadata/{}.json", doc.sync_id);
        assert!(store.blobs().contains(&path));

        let fetched = store.fetch(&doc.sync_id).await.unwrap();
        assert_eq!(fetched.title, "Passport");
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_upsert_is_rejected() {
        let store = BlobMetadataStore::new(MemoryBlobStore::new());
        let doc = Document::new("u1", "Lease", DocumentCategory::Contract).unwrap();
        store.upsert(&doc, 0).await.unwrap();
        store.upsert(&doc, 1).await.unwrap();

        assert!(matches!(
            store.upsert(&doc, 1).await,
            Err(RemoteError::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn soft_delete_keeps_a_tombstone() {
        let store = BlobMetadataStore::new(MemoryBlobStore::new());
        let doc = Document::new("u1", "Old car", DocumentCategory::Insurance).unwrap();
        store.upsert(&doc, 0).await.unwrap();

        store.soft_delete(&doc.sync_id).await.unwrap();
        let fetched = store.fetch(&doc.sync_id).await.unwrap();
        assert!(fetched.deleted);
        assert_eq!(fetched.version, 2);

        assert!(matches!(
            store.fetch(&SyncId::new()).await,
            Err(RemoteError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn corrupt_record_surfaces_as_validation_error() {
        let store = BlobMetadataStore::new(MemoryBlobStore::new());
        let sync_id = SyncId::parse("broken").unwrap();
        store.blobs().insert("metadata/broken.json", b"{not json".to_vec());

        assert!(matches!(
            store.fetch(&sync_id).await,
            Err(RemoteError::Validation(_))
        ));
    }
}
