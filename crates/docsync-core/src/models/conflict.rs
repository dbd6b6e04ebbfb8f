//! Document conflict model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::document::{Document, DocumentField, SyncId};

/// A unique identifier for a conflict record, using UUID v7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Classification of a detected conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides alive with diverging user-visible fields
    Content,
    /// Remote copy was deleted while local copy has unpushed edits
    RemoteDeleted,
}

impl ConflictKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::RemoteDeleted => "remote_deleted",
        }
    }
}

impl FromStr for ConflictKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "content" => Ok(Self::Content),
            "remote_deleted" => Ok(Self::RemoteDeleted),
            other => Err(Error::InvalidInput(format!("unknown conflict kind '{other}'"))),
        }
    }
}

/// Both versions of a document that disagree, retained until resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentConflict {
    pub id: ConflictId,
    pub sync_id: SyncId,
    pub kind: ConflictKind,
    /// User-visible fields that differ
    pub fields: Vec<DocumentField>,
    /// Local candidate snapshot
    pub local: Document,
    /// Remote candidate snapshot
    pub remote: Document,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
}

/// Which candidate a merged value is taken from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    #[default]
    Local,
    Remote,
}

impl FromStr for Side {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(Error::InvalidInput(format!("unknown side '{other}'"))),
        }
    }
}

/// Per-field choices for a merge.
///
/// Fields without an explicit choice keep the local value. Attachment
/// overrides pick a side for one file name present on both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelection {
    #[serde(default)]
    pub fields: BTreeMap<DocumentField, Side>,
    #[serde(default)]
    pub attachments: BTreeMap<String, Side>,
}

impl FieldSelection {
    #[must_use]
    pub fn take(mut self, field: DocumentField, side: Side) -> Self {
        self.fields.insert(field, side);
        self
    }

    #[must_use]
    pub fn take_attachment(mut self, file_name: impl Into<String>, side: Side) -> Self {
        self.attachments.insert(file_name.into(), side);
        self
    }

    #[must_use]
    pub fn side_for(&self, field: DocumentField) -> Side {
        self.fields.get(&field).copied().unwrap_or_default()
    }
}

/// How a conflict is settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "selection", rename_all = "snake_case")]
pub enum ResolutionStrategy {
    KeepLocal,
    KeepRemote,
    Merge(FieldSelection),
}

/// Whether detected conflicts wait for the caller or resolve automatically
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    Manual,
    KeepLocal,
    KeepRemote,
}

impl ConflictPolicy {
    #[must_use]
    pub const fn automatic_strategy(self) -> Option<ResolutionStrategy> {
        match self {
            Self::Manual => None,
            Self::KeepLocal => Some(ResolutionStrategy::KeepLocal),
            Self::KeepRemote => Some(ResolutionStrategy::KeepRemote),
        }
    }
}
