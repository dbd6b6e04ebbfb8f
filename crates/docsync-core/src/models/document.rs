//! Document model

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::state::SyncState;

use super::attachment::FileAttachment;
use super::conflict::ConflictId;

/// Stable document identifier shared by every device and the remote store.
///
/// Locally generated ids are UUID v4 strings. Ids received from elsewhere are
/// accepted as long as they are a single path-safe token, since they end up
/// inside storage paths.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SyncId(String);

impl SyncId {
    /// Create a new random sync id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Validate and wrap an existing identifier
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::InvalidInput("sync id cannot be empty".to_string()));
        }
        if value.contains('/') || value == "." || value == ".." {
            return Err(Error::InvalidInput(format!(
                "sync id '{value}' is not a valid path component"
            )));
        }
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id has the shape of a locally generated id
    #[must_use]
    pub fn is_uuid(&self) -> bool {
        Uuid::parse_str(&self.0).is_ok()
    }
}

impl Default for SyncId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SyncId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SyncId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SyncId> for String {
    fn from(value: SyncId) -> Self {
        value.0
    }
}

/// Document category shown to the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentCategory {
    Insurance,
    Warranty,
    Subscription,
    Contract,
    Medical,
    Financial,
    #[default]
    Other,
}

impl DocumentCategory {
    pub const ALL: [Self; 7] = [
        Self::Insurance,
        Self::Warranty,
        Self::Subscription,
        Self::Contract,
        Self::Medical,
        Self::Financial,
        Self::Other,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insurance => "insurance",
            Self::Warranty => "warranty",
            Self::Subscription => "subscription",
            Self::Contract => "contract",
            Self::Medical => "medical",
            Self::Financial => "financial",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for DocumentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == wanted)
            .ok_or_else(|| Error::InvalidInput(format!("unknown document category '{s}'")))
    }
}

/// User-visible document fields, the unit of conflict reporting and merging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentField {
    Title,
    Category,
    Date,
    Notes,
    Attachments,
}

impl DocumentField {
    pub const ALL: [Self; 5] = [
        Self::Title,
        Self::Category,
        Self::Date,
        Self::Notes,
        Self::Attachments,
    ];
}

impl fmt::Display for DocumentField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Title => "title",
            Self::Category => "category",
            Self::Date => "date",
            Self::Notes => "notes",
            Self::Attachments => "attachments",
        };
        f.write_str(name)
    }
}

/// A synchronizable document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier, immutable once created
    pub sync_id: SyncId,
    /// Owning account (stable id)
    pub owner_id: String,
    pub title: String,
    pub category: DocumentCategory,
    /// Renewal, expiry or issue date
    pub date: Option<NaiveDate>,
    pub notes: Option<String>,
    /// Attachments in display order
    pub attachments: Vec<FileAttachment>,
    /// Monotonic version, +1 per accepted update
    pub version: i64,
    /// Remote version this copy was derived from (0 when never uploaded)
    pub base_version: i64,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last modification timestamp (Unix ms)
    pub last_modified: i64,
    pub sync_state: SyncState,
    pub conflict_id: Option<ConflictId>,
    /// Soft delete tombstone
    pub deleted: bool,
    pub deleted_at: Option<i64>,
}

impl Document {
    /// Create a new local document, not yet uploaded
    pub fn new(
        owner_id: impl Into<String>,
        title: impl Into<String>,
        category: DocumentCategory,
    ) -> Result<Self> {
        let owner_id = owner_id.into().trim().to_string();
        let title = title.into().trim().to_string();
        if owner_id.is_empty() {
            return Err(Error::InvalidInput(
                "Document owner_id cannot be empty".to_string(),
            ));
        }
        if title.is_empty() {
            return Err(Error::InvalidInput(
                "Document title cannot be empty".to_string(),
            ));
        }

        let now = chrono::Utc::now().timestamp_millis();
        Ok(Self {
            sync_id: SyncId::new(),
            owner_id,
            title,
            category,
            date: None,
            notes: None,
            attachments: Vec::new(),
            version: 1,
            base_version: 0,
            created_at: now,
            last_modified: now,
            sync_state: SyncState::PendingUpload,
            conflict_id: None,
            deleted: false,
            deleted_at: None,
        })
    }

    /// Whether local changes exist that the remote has not accepted yet
    #[must_use]
    pub const fn has_unpushed_changes(&self) -> bool {
        self.version > self.base_version
    }

    /// Bump the version for a local edit.
    ///
    /// Edits made before the next accepted push share one version step, because
    /// they reach the remote as a single consolidated write.
    pub fn touch_local_edit(&mut self) {
        if self.version <= self.base_version {
            self.version = self.base_version + 1;
        }
        self.last_modified = chrono::Utc::now().timestamp_millis();
    }

    /// Look up an attachment by file name
    #[must_use]
    pub fn attachment(&self, file_name: &str) -> Option<&FileAttachment> {
        self.attachments
            .iter()
            .find(|attachment| attachment.file_name == file_name)
    }

    /// User-visible fields whose values differ between `self` and `other`
    #[must_use]
    pub fn differing_fields(&self, other: &Self) -> Vec<DocumentField> {
        DocumentField::ALL
            .into_iter()
            .filter(|field| !self.field_eq(other, *field))
            .collect()
    }

    /// Whether every user-visible field matches
    #[must_use]
    pub fn content_eq(&self, other: &Self) -> bool {
        self.differing_fields(other).is_empty()
    }

    fn field_eq(&self, other: &Self, field: DocumentField) -> bool {
        match field {
            DocumentField::Title => self.title == other.title,
            DocumentField::Category => self.category == other.category,
            DocumentField::Date => self.date == other.date,
            DocumentField::Notes => self.notes == other.notes,
            DocumentField::Attachments => {
                self.attachments.len() == other.attachments.len()
                    && self
                        .attachments
                        .iter()
                        .zip(&other.attachments)
                        .all(|(left, right)| left.content_eq(right))
            }
        }
    }
}
