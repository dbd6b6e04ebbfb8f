//! Blob store rooted at a local directory.
//!
//! Useful for single-machine setups and for pointing the CLI at a shared
//! network mount. Object paths map one-to-one onto relative file paths.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::util::is_path_segment;

use super::{BlobStore, RemoteError, RemoteResult};

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> RemoteResult<PathBuf> {
        let trimmed = path.trim().trim_matches('/');
        if trimmed.is_empty() || !trimmed.split('/').all(is_path_segment) {
            return Err(RemoteError::Validation(format!(
                "object path '{path}' is invalid"
            )));
        }
        Ok(trimmed
            .split('/')
            .fold(self.root.clone(), |acc, segment| acc.join(segment)))
    }
}

fn io_error(path: &str, error: &std::io::Error) -> RemoteError {
    match error.kind() {
        ErrorKind::NotFound => RemoteError::NotFound(path.to_string()),
        ErrorKind::PermissionDenied => {
            RemoteError::Validation(format!("permission denied for {path}: {error}"))
        }
        _ => RemoteError::Transient(format!("{path}: {error}")),
    }
}

impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> RemoteResult<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|error| io_error(path, &error))?;
        }

        // write then rename so readers never observe a partial object
        let staging = target.with_extension(format!("{}.partial", uuid::Uuid::now_v7()));
        fs::write(&staging, bytes)
            .await
            .map_err(|error| io_error(path, &error))?;
        if let Err(error) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(io_error(path, &error));
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> RemoteResult<Vec<u8>> {
        let target = self.resolve(path)?;
        fs::read(&target)
            .await
            .map_err(|error| io_error(path, &error))
    }

    async fn delete(&self, path: &str) -> RemoteResult<()> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(io_error(path, &error)),
        }
    }

    async fn exists(&self, path: &str) -> RemoteResult<bool> {
        let target = self.resolve(path)?;
        fs::try_exists(&target)
            .await
            .map_err(|error| io_error(path, &error))
    }

    async fn size(&self, path: &str) -> RemoteResult<Option<u64>> {
        let target = self.resolve(path)?;
        match fs::metadata(&target).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
            Ok(_) => Ok(None),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(io_error(path, &error)),
        }
    }
}
