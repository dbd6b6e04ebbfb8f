//! Account identity and storage path resolution.
//!
//! Attachment files live in the remote blob store under a prefix derived from
//! the account's stable id, which survives reinstalls and device changes.
//! Older installs addressed files by username under a different prefix; that
//! legacy scheme is still resolvable so the migration orchestrator and the
//! read fallback can find those files.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::models::SyncId;
use crate::util::{is_path_segment, normalize_text_option};

pub const DEFAULT_PATH_PREFIX: &str = "private";
pub const DEFAULT_LEGACY_PATH_PREFIX: &str = "protected";
const DOCUMENTS_SEGMENT: &str = "documents";

/// Durable account identifier used to namespace storage paths
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StableId(String);

impl StableId {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if !is_path_segment(value) {
            return Err(Error::InvalidInput(format!(
                "stable id '{value}' is not a valid path component"
            )));
        }
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An authenticated (or signed-out) user as reported by the identity provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Durable account id (e.g. the identity pool subject)
    pub account_id: Option<String>,
    /// Username used by the legacy path scheme
    pub username: Option<String>,
    pub authenticated: bool,
}

impl Principal {
    #[must_use]
    pub fn signed_in(account_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            account_id: Some(account_id.into()),
            username: Some(username.into()),
            authenticated: true,
        }
    }

    #[must_use]
    pub fn signed_out() -> Self {
        Self::default()
    }
}

/// Builds storage paths for both the current and the legacy scheme.
///
/// Path building is pure: identical inputs always yield identical strings and
/// no I/O is performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    prefix: String,
    legacy_prefix: String,
}

impl Default for PathResolver {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PATH_PREFIX.to_string(),
            legacy_prefix: DEFAULT_LEGACY_PATH_PREFIX.to_string(),
        }
    }
}

impl PathResolver {
    pub fn new(prefix: &str, legacy_prefix: &str) -> Result<Self> {
        let prefix = normalize_prefix(prefix)?;
        let legacy_prefix = normalize_prefix(legacy_prefix)?;
        if prefix == legacy_prefix {
            return Err(Error::InvalidInput(
                "current and legacy path prefixes must differ".to_string(),
            ));
        }
        Ok(Self {
            prefix,
            legacy_prefix,
        })
    }

    /// Derive the stable id for an authenticated principal.
    ///
    /// Fails with `IdentityUnavailable` when the principal is signed out or has
    /// no durable account id; callers must not retry until re-authentication.
    pub fn resolve_stable_id(&self, principal: &Principal) -> Result<StableId> {
        if !principal.authenticated {
            return Err(Error::IdentityUnavailable(
                "principal is not authenticated".to_string(),
            ));
        }
        let account_id = normalize_text_option(principal.account_id.clone()).ok_or_else(|| {
            Error::IdentityUnavailable("identity token did not include an account id".to_string())
        })?;
        StableId::parse(&account_id)
    }

    /// Current-scheme path for one attachment file
    pub fn build_path(
        &self,
        stable_id: &StableId,
        sync_id: &SyncId,
        file_name: &str,
    ) -> Result<String> {
        join_path(&self.prefix, stable_id.as_str(), sync_id, file_name)
    }

    /// Legacy-scheme path for one attachment file
    pub fn build_legacy_path(
        &self,
        legacy_username: &str,
        sync_id: &SyncId,
        file_name: &str,
    ) -> Result<String> {
        let legacy_username = legacy_username.trim();
        if !is_path_segment(legacy_username) {
            return Err(Error::InvalidInput(format!(
                "legacy username '{legacy_username}' is not a valid path component"
            )));
        }
        join_path(&self.legacy_prefix, legacy_username, sync_id, file_name)
    }

    /// Whether `path` is addressed under the legacy scheme
    #[must_use]
    pub fn is_legacy_path(&self, path: &str) -> bool {
        path.starts_with(&format!("{}/", self.legacy_prefix))
    }
}

fn join_path(prefix: &str, owner: &str, sync_id: &SyncId, file_name: &str) -> Result<String> {
    if !is_path_segment(file_name) {
        return Err(Error::InvalidInput(format!(
            "file name '{file_name}' is not a valid path component"
        )));
    }
    Ok(format!(
        "{prefix}/{owner}/{DOCUMENTS_SEGMENT}/{sync_id}/{file_name}"
    ))
}

fn normalize_prefix(prefix: &str) -> Result<String> {
    let prefix = prefix.trim().trim_matches('/');
    if prefix.is_empty() || prefix.split('/').any(|segment| !is_path_segment(segment)) {
        return Err(Error::InvalidInput(format!(
            "storage path prefix '{prefix}' is invalid"
        )));
    }
    Ok(prefix.to_string())
}
