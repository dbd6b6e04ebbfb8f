//! Sync engine configuration.
//!
//! Provides a `SyncConfig` struct loaded from a JSON file and adjusted by
//! `DOCSYNC_*` environment variables. Credentials never live here; object
//! storage credentials come from [`crate::remote::S3Config`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::{PathResolver, DEFAULT_LEGACY_PATH_PREFIX, DEFAULT_PATH_PREFIX};
use crate::models::ConflictPolicy;
use crate::queue::DEFAULT_MAX_ATTEMPTS;
use crate::sync::RetryPolicy;
use crate::util::normalize_text_option;

const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 30_000;

/// Tunables shared by the queue, the coordinator and the migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SyncConfig {
    /// Backoff for transient remote failures within one drain pass
    pub retry: RetryPolicy,
    /// Deadline for a single remote call
    pub remote_timeout_ms: u64,
    /// Drain passes an entry may fail before it is dropped
    pub max_queue_attempts: u32,
    pub conflict_policy: ConflictPolicy,
    pub path_prefix: String,
    pub legacy_path_prefix: String,
    /// Where downloaded and attached files are kept on this device
    pub files_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            remote_timeout_ms: DEFAULT_REMOTE_TIMEOUT_MS,
            max_queue_attempts: DEFAULT_MAX_ATTEMPTS,
            conflict_policy: ConflictPolicy::Manual,
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            legacy_path_prefix: DEFAULT_LEGACY_PATH_PREFIX.to_string(),
            files_dir: None,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON config, rejecting unknown fields.
    pub fn from_json(payload: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(payload)
            .map_err(|error| Error::InvalidInput(format!("invalid sync config JSON: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(payload) => Self::from_json(&payload),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(error.into()),
        }
    }

    /// Apply `DOCSYNC_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (testable without touching the environment).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| normalize_text_option(lookup(key));

        if let Some(value) = var("DOCSYNC_REMOTE_TIMEOUT_MS") {
            self.remote_timeout_ms = parse_number("DOCSYNC_REMOTE_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("DOCSYNC_MAX_QUEUE_ATTEMPTS") {
            self.max_queue_attempts = parse_number("DOCSYNC_MAX_QUEUE_ATTEMPTS", &value)?;
        }
        if let Some(value) = var("DOCSYNC_MAX_RETRIES") {
            self.retry.max_retries = parse_number("DOCSYNC_MAX_RETRIES", &value)?;
        }
        if let Some(value) = var("DOCSYNC_CONFLICT_POLICY") {
            self.conflict_policy = parse_conflict_policy(&value)?;
        }
        if let Some(value) = var("DOCSYNC_PATH_PREFIX") {
            self.path_prefix = value;
        }
        if let Some(value) = var("DOCSYNC_LEGACY_PATH_PREFIX") {
            self.legacy_path_prefix = value;
        }
        if let Some(value) = var("DOCSYNC_FILES_DIR") {
            self.files_dir = Some(PathBuf::from(value));
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote_timeout_ms == 0 {
            return Err(Error::InvalidInput(
                "remote_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_queue_attempts == 0 {
            return Err(Error::InvalidInput(
                "max_queue_attempts must be greater than zero".to_string(),
            ));
        }
        self.path_resolver().map(|_| ())
    }

    #[must_use]
    pub const fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn path_resolver(&self) -> Result<PathResolver> {
        PathResolver::new(&self.path_prefix, &self.legacy_path_prefix)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::InvalidInput(format!("{key} must be a non-negative integer, got '{value}'")))
}

fn parse_conflict_policy(value: &str) -> Result<ConflictPolicy> {
    match value.to_ascii_lowercase().replace('-', "_").as_str() {
        "manual" => Ok(ConflictPolicy::Manual),
        "keep_local" => Ok(ConflictPolicy::KeepLocal),
        "keep_remote" => Ok(ConflictPolicy::KeepRemote),
        other => Err(Error::InvalidInput(format!(
            "unknown conflict policy '{other}' (expected manual, keep_local or keep_remote)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.remote_timeout(), Duration::from_secs(30));
        assert_eq!(config.conflict_policy, ConflictPolicy::Manual);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            SyncConfig::from_json(r#"{ "conflict_policy": "keep_remote", "max_queue_attempts": 2 }"#)
                .unwrap();
        assert_eq!(config.conflict_policy, ConflictPolicy::KeepRemote);
        assert_eq!(config.max_queue_attempts, 2);
        assert_eq!(config.path_prefix, "private");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error = SyncConfig::from_json(r#"{ "remote_timeout": 5 }"#).unwrap_err();
        assert!(error.to_string().contains("unknown field"));
    }

    #[test]
    fn identical_prefixes_are_rejected() {
        let error = SyncConfig::from_json(r#"{ "path_prefix": "vault", "legacy_path_prefix": "vault" }"#);
        assert!(error.is_err());
    }

    #[test]
    fn env_overrides_apply_and_validate() {
        let config = SyncConfig::default()
            .with_overrides(lookup(&[
                ("DOCSYNC_REMOTE_TIMEOUT_MS", "1500"),
                ("DOCSYNC_CONFLICT_POLICY", "keep-local"),
                ("DOCSYNC_FILES_DIR", " /var/lib/docsync/files "),
                ("DOCSYNC_PATH_PREFIX", "   "),
            ]))
            .unwrap();
        assert_eq!(config.remote_timeout(), Duration::from_millis(1500));
        assert_eq!(config.conflict_policy, ConflictPolicy::KeepLocal);
        assert_eq!(
            config.files_dir.as_deref(),
            Some(Path::new("/var/lib/docsync/files"))
        );
        assert_eq!(config.path_prefix, "private");

        assert!(SyncConfig::default()
            .with_overrides(lookup(&[("DOCSYNC_MAX_QUEUE_ATTEMPTS", "0")]))
            .is_err());
        assert!(SyncConfig::default()
            .with_overrides(lookup(&[("DOCSYNC_CONFLICT_POLICY", "coin_flip")]))
            .is_err());
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, SyncConfig::default());

        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{ "remote_timeout_ms": 250 }"#).unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap().remote_timeout_ms, 250);
    }
}
