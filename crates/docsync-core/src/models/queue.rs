//! Offline queue entry model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::document::{Document, SyncId};

/// A unique identifier for a queued operation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of pending mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Upload,
    Update,
    Delete,
    FileUpload,
    FileDownload,
}

impl OperationType {
    pub const ALL: [Self; 5] = [
        Self::Upload,
        Self::Update,
        Self::Delete,
        Self::FileUpload,
        Self::FileDownload,
    ];

    /// Document-level operations are limited to one entry per document
    #[must_use]
    pub const fn is_document_level(self) -> bool {
        matches!(self, Self::Upload | Self::Update | Self::Delete)
    }

    #[must_use]
    pub const fn default_priority(self) -> i32 {
        match self {
            Self::Delete => 10,
            Self::Upload | Self::Update => 5,
            Self::FileUpload => 3,
            Self::FileDownload => 1,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::FileUpload => "file_upload",
            Self::FileDownload => "file_download",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op_type| op_type.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown operation type '{s}'")))
    }
}

/// Reference to one attachment of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub file_name: String,
}

/// Operation payload, serialized as JSON in the queue store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum OperationPayload {
    Document(Box<Document>),
    File(FileReference),
    Tombstone { deleted_at: i64 },
}

impl OperationPayload {
    /// Whether this payload shape is valid for the given operation type
    #[must_use]
    pub const fn matches(&self, op_type: OperationType) -> bool {
        matches!(
            (self, op_type),
            (Self::Document(_), OperationType::Upload | OperationType::Update)
                | (Self::Tombstone { .. }, OperationType::Delete)
                | (
                    Self::File(_),
                    OperationType::FileUpload | OperationType::FileDownload
                )
        )
    }

    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::File(reference) => Some(&reference.file_name),
            _ => None,
        }
    }
}

/// One pending mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: OperationId,
    pub document_id: SyncId,
    pub op_type: OperationType,
    pub payload: OperationPayload,
    /// Higher drains sooner
    pub priority: i32,
    /// Enqueue timestamp (Unix ms), replaced on consolidation
    pub enqueued_at: i64,
    /// Number of drain passes that failed this entry
    pub retry_count: u32,
    /// Insertion sequence used to break ordering ties
    pub seq: u64,
}

/// A queue row as read back from durable storage, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawQueuedOperation {
    pub id: Option<String>,
    pub document_id: Option<String>,
    pub op_type: Option<String>,
    pub payload: Option<String>,
    pub priority: Option<i64>,
    pub enqueued_at: Option<i64>,
    pub retry_count: Option<i64>,
    pub seq: Option<i64>,
}

/// Structural problem found in a persisted queue row
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueAnomaly {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid value for '{field}': {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("unknown operation type '{0}'")]
    UnknownType(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("payload does not match operation type {0}")]
    PayloadMismatch(OperationType),
    #[error("payload targets document {payload} but entry targets {entry}")]
    DocumentMismatch { entry: String, payload: String },
}

impl TryFrom<RawQueuedOperation> for QueuedOperation {
    type Error = QueueAnomaly;

    fn try_from(raw: RawQueuedOperation) -> std::result::Result<Self, QueueAnomaly> {
        let id = required(raw.id, "id")?;
        let id = id.parse::<OperationId>().map_err(|_| QueueAnomaly::InvalidField {
            field: "id",
            value: id.clone(),
        })?;

        let document_id = required(raw.document_id, "document_id")?;
        let document_id =
            SyncId::parse(&document_id).map_err(|_| QueueAnomaly::InvalidField {
                field: "document_id",
                value: document_id.clone(),
            })?;

        let op_type = required(raw.op_type, "op_type")?;
        let op_type = op_type
            .parse::<OperationType>()
            .map_err(|_| QueueAnomaly::UnknownType(op_type.clone()))?;

        let payload = required(raw.payload, "payload")?;
        let payload = serde_json::from_str::<OperationPayload>(&payload)
            .map_err(|error| QueueAnomaly::MalformedPayload(error.to_string()))?;
        if !payload.matches(op_type) {
            return Err(QueueAnomaly::PayloadMismatch(op_type));
        }
        if let OperationPayload::Document(document) = &payload {
            if document.sync_id != document_id {
                return Err(QueueAnomaly::DocumentMismatch {
                    entry: document_id.to_string(),
                    payload: document.sync_id.to_string(),
                });
            }
        }

        let priority = raw.priority.ok_or(QueueAnomaly::MissingField("priority"))?;
        let priority = i32::try_from(priority).map_err(|_| QueueAnomaly::InvalidField {
            field: "priority",
            value: priority.to_string(),
        })?;
        let enqueued_at = raw
            .enqueued_at
            .ok_or(QueueAnomaly::MissingField("enqueued_at"))?;
        let retry_count = u32::try_from(raw.retry_count.unwrap_or(0)).map_err(|_| {
            QueueAnomaly::InvalidField {
                field: "retry_count",
                value: raw.retry_count.unwrap_or_default().to_string(),
            }
        })?;
        let seq = u64::try_from(raw.seq.unwrap_or(0)).unwrap_or(0);

        Ok(Self {
            id,
            document_id,
            op_type,
            payload,
            priority,
            enqueued_at,
            retry_count,
            seq,
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> std::result::Result<String, QueueAnomaly> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(QueueAnomaly::MissingField(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentCategory;

    fn raw_update(document: &Document) -> RawQueuedOperation {
        RawQueuedOperation {
            id: Some(OperationId::new().as_str()),
            document_id: Some(document.sync_id.to_string()),
            op_type: Some("update".to_string()),
            payload: Some(
                serde_json::to_string(&OperationPayload::Document(Box::new(document.clone())))
                    .unwrap(),
            ),
            priority: Some(5),
            enqueued_at: Some(1_700_000_000_000),
            retry_count: Some(0),
            seq: Some(1),
        }
    }

    #[test]
    fn test_document_level_types() {
        assert!(OperationType::Upload.is_document_level());
        assert!(OperationType::Delete.is_document_level());
        assert!(!OperationType::FileUpload.is_document_level());
        assert!(!OperationType::FileDownload.is_document_level());
    }

    #[test]
    fn test_operation_type_parse() {
        for op_type in OperationType::ALL {
            assert_eq!(op_type.as_str().parse::<OperationType>().unwrap(), op_type);
        }
        assert!("sync".parse::<OperationType>().is_err());
    }

    #[test]
    fn test_payload_matches_type() {
        let file = OperationPayload::File(FileReference {
            file_name: "a.pdf".to_string(),
        });
        assert!(file.matches(OperationType::FileUpload));
        assert!(!file.matches(OperationType::Update));

        let tombstone = OperationPayload::Tombstone { deleted_at: 1 };
        assert!(tombstone.matches(OperationType::Delete));
        assert!(!tombstone.matches(OperationType::Upload));
    }

    #[test]
    fn test_raw_row_validates() {
        let document = Document::new("user", "Passport", DocumentCategory::Other).unwrap();
        let op = QueuedOperation::try_from(raw_update(&document)).unwrap();
        assert_eq!(op.op_type, OperationType::Update);
        assert_eq!(op.document_id, document.sync_id);
    }

    #[test]
    fn test_raw_row_anomalies() {
        let document = Document::new("user", "Passport", DocumentCategory::Other).unwrap();

        let mut missing = raw_update(&document);
        missing.document_id = None;
        assert_eq!(
            QueuedOperation::try_from(missing).unwrap_err(),
            QueueAnomaly::MissingField("document_id")
        );

        let mut mismatch = raw_update(&document);
        mismatch.op_type = Some("file_upload".to_string());
        assert_eq!(
            QueuedOperation::try_from(mismatch).unwrap_err(),
            QueueAnomaly::PayloadMismatch(OperationType::FileUpload)
        );

        let mut unknown = raw_update(&document);
        unknown.op_type = Some("teleport".to_string());
        assert!(matches!(
            QueuedOperation::try_from(unknown).unwrap_err(),
            QueueAnomaly::UnknownType(_)
        ));

        let mut garbage = raw_update(&document);
        garbage.payload = Some("{not json".to_string());
        assert!(matches!(
            QueuedOperation::try_from(garbage).unwrap_err(),
            QueueAnomaly::MalformedPayload(_)
        ));

        let mut wrong_doc = raw_update(&document);
        wrong_doc.document_id = Some("someone-else".to_string());
        assert!(matches!(
            QueuedOperation::try_from(wrong_doc).unwrap_err(),
            QueueAnomaly::DocumentMismatch { .. }
        ));
    }
}
