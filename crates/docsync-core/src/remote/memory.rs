//! In-memory collaborators for tests and offline demos.
//!
//! Each store can be told to fail its next calls with a given error, and the
//! metadata store can add artificial latency so overlapping sync passes can be
//! exercised.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::Error;
use crate::identity::{PathResolver, Principal, StableId};
use crate::models::{Document, SyncId};
use crate::util::lock_unpoisoned;

use super::{
    accept_upsert, tombstone, BlobStore, IdentityProvider, MetadataStore, RemoteError,
    RemoteResult,
};

#[derive(Debug, Default)]
struct FailureQueue {
    pending: Mutex<VecDeque<RemoteError>>,
    calls: AtomicUsize,
}

impl FailureQueue {
    fn push(&self, error: RemoteError) {
        lock_unpoisoned(&self.pending).push_back(error);
    }

    /// Count the call and pop the next injected failure, if any
    fn check(&self) -> RemoteResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        lock_unpoisoned(&self.pending)
            .pop_front()
            .map_or(Ok(()), Err)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

/// Blob store backed by a map of path to bytes.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failures: FailureQueue,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call fail with `error`. Calls queue up in order.
    pub fn fail_next(&self, error: RemoteError) {
        self.failures.push(error);
    }

    /// Store bytes directly, bypassing failure injection
    pub fn insert(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        lock_unpoisoned(&self.objects).insert(path.to_string(), bytes.into());
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        lock_unpoisoned(&self.objects).contains_key(path)
    }

    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        lock_unpoisoned(&self.objects).keys().cloned().collect()
    }

    /// Number of trait calls made so far
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.failures.calls()
    }
}

impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> RemoteResult<()> {
        self.failures.check()?;
        lock_unpoisoned(&self.objects).insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, path: &str) -> RemoteResult<Vec<u8>> {
        self.failures.check()?;
        lock_unpoisoned(&self.objects)
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))
    }

    async fn delete(&self, path: &str) -> RemoteResult<()> {
        self.failures.check()?;
        lock_unpoisoned(&self.objects).remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> RemoteResult<bool> {
        self.failures.check()?;
        Ok(lock_unpoisoned(&self.objects).contains_key(path))
    }

    async fn size(&self, path: &str) -> RemoteResult<Option<u64>> {
        self.failures.check()?;
        Ok(lock_unpoisoned(&self.objects)
            .get(path)
            .map(|bytes| bytes.len() as u64))
    }
}

/// Metadata store keeping the authoritative copy of each document in memory.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: Mutex<BTreeMap<SyncId, Document>>,
    failures: FailureQueue,
    latency: Mutex<Option<Duration>>,
}

impl MemoryMetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: RemoteError) {
        self.failures.push(error);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock_unpoisoned(&self.latency) = latency;
    }

    /// Store a record as another device would have written it
    pub fn insert(&self, document: Document) {
        lock_unpoisoned(&self.records).insert(document.sync_id.clone(), document);
    }

    #[must_use]
    pub fn get(&self, sync_id: &SyncId) -> Option<Document> {
        lock_unpoisoned(&self.records).get(sync_id).cloned()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.failures.calls()
    }

    async fn before_call(&self) -> RemoteResult<()> {
        let latency = *lock_unpoisoned(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.failures.check()
    }
}

impl MetadataStore for MemoryMetadataStore {
    async fn upsert(&self, document: &Document, expected_prior: i64) -> RemoteResult<i64> {
        self.before_call().await?;
        let mut records = lock_unpoisoned(&self.records);
        let stored = accept_upsert(records.get(&document.sync_id), document, expected_prior)?;
        let version = stored.version;
        records.insert(stored.sync_id.clone(), stored);
        Ok(version)
    }

    async fn fetch(&self, sync_id: &SyncId) -> RemoteResult<Document> {
        self.before_call().await?;
        lock_unpoisoned(&self.records)
            .get(sync_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(sync_id.to_string()))
    }

    async fn soft_delete(&self, sync_id: &SyncId) -> RemoteResult<()> {
        self.before_call().await?;
        let mut records = lock_unpoisoned(&self.records);
        if let Some(stored) = records.remove(sync_id) {
            records.insert(sync_id.clone(), tombstone(stored));
        }
        Ok(())
    }
}

/// Identity provider returning a fixed principal that can be swapped at runtime.
#[derive(Debug, Default)]
pub struct StaticIdentityProvider {
    principal: Mutex<Principal>,
    resolver: PathResolver,
}

impl StaticIdentityProvider {
    #[must_use]
    pub fn new(principal: Principal) -> Self {
        Self {
            principal: Mutex::new(principal),
            resolver: PathResolver::default(),
        }
    }

    pub fn sign_in(&self, principal: Principal) {
        *lock_unpoisoned(&self.principal) = principal;
    }

    pub fn sign_out(&self) {
        *lock_unpoisoned(&self.principal) = Principal::signed_out();
    }
}

impl IdentityProvider for StaticIdentityProvider {
    async fn authenticate(&self) -> RemoteResult<Principal> {
        let principal = lock_unpoisoned(&self.principal).clone();
        if principal.authenticated {
            Ok(principal)
        } else {
            Err(RemoteError::AuthRequired("no signed-in user".to_string()))
        }
    }

    async fn current_stable_id(&self) -> RemoteResult<StableId> {
        let principal = lock_unpoisoned(&self.principal).clone();
        self.resolver
            .resolve_stable_id(&principal)
            .map_err(|error| match error {
                Error::IdentityUnavailable(message) => RemoteError::IdentityUnavailable(message),
                other => RemoteError::IdentityUnavailable(other.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentCategory;
    use crate::state::SyncState;
    use pretty_assertions::assert_eq;

    fn document() -> Document {
        Document::new("u1", "Boiler warranty", DocumentCategory::Warranty).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blob_store_roundtrip_and_missing_object() {
        let store = MemoryBlobStore::new();
        store.put("a/b.pdf", b"hello").await.unwrap();
        assert_eq!(store.get("a/b.pdf").await.unwrap(), b"hello".to_vec());
        assert_eq!(store.size("a/b.pdf").await.unwrap(), Some(5));
        assert!(store.exists("a/b.pdf").await.unwrap());

        store.delete("a/b.pdf").await.unwrap();
        store.delete("a/b.pdf").await.unwrap();
        assert!(matches!(
            store.get("a/b.pdf").await,
            Err(RemoteError::NotFound(_))
        ));
        assert_eq!(store.size("a/b.pdf").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn injected_failures_fire_once_in_order() {
        let store = MemoryBlobStore::new();
        store.fail_next(RemoteError::Transient("reset".to_string()));
        store.fail_next(RemoteError::AuthRequired("expired".to_string()));

        assert!(matches!(
            store.exists("x").await,
            Err(RemoteError::Transient(_))
        ));
        assert!(matches!(
            store.exists("x").await,
            Err(RemoteError::AuthRequired(_))
        ));
        assert!(!store.exists("x").await.unwrap());
        assert_eq!(store.call_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_upsert_checks_expected_prior() {
        let store = MemoryMetadataStore::new();
        let doc = document();

        assert_eq!(store.upsert(&doc, 0).await.unwrap(), 1);
        let error = store.upsert(&doc, 0).await.unwrap_err();
        assert_eq!(
            error,
            RemoteError::VersionConflict {
                sync_id: doc.sync_id.to_string(),
                expected: 0,
                actual: 1,
            }
        );
        assert_eq!(store.upsert(&doc, 1).await.unwrap(), 2);

        let stored = store.fetch(&doc.sync_id).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.base_version, 2);
        assert_eq!(stored.sync_state, SyncState::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_soft_delete_bumps_version_once() {
        let store = MemoryMetadataStore::new();
        let doc = document();
        store.upsert(&doc, 0).await.unwrap();

        store.soft_delete(&doc.sync_id).await.unwrap();
        store.soft_delete(&doc.sync_id).await.unwrap();
        store.soft_delete(&SyncId::new()).await.unwrap();

        let stored = store.get(&doc.sync_id).unwrap();
        assert!(stored.deleted);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upsert_strips_device_paths() {
        let store = MemoryMetadataStore::new();
        let mut doc = document();
        let mut attachment =
            crate::models::FileAttachment::new_local("a.pdf", "/tmp/a.pdf", 3).unwrap();
        attachment.remote_key = Some("private/u1/documents/x/a.pdf".to_string());
        doc.attachments.push(attachment);

        store.upsert(&doc, 0).await.unwrap();
        let stored = store.get(&doc.sync_id).unwrap();
        assert_eq!(stored.attachments[0].local_path, None);
        assert!(stored.attachments[0].remote_key.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn static_identity_follows_sign_in_state() {
        let provider = StaticIdentityProvider::new(Principal::signed_in("u-1", "alice"));
        assert_eq!(provider.current_stable_id().await.unwrap().as_str(), "u-1");

        provider.sign_out();
        assert!(matches!(
            provider.current_stable_id().await,
            Err(RemoteError::IdentityUnavailable(_))
        ));
        assert!(matches!(
            provider.authenticate().await,
            Err(RemoteError::AuthRequired(_))
        ));
    }
}
