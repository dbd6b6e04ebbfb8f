//! File attachment model

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A file attached to a document.
///
/// Owned by exactly one document and deleted with it. `file_name` is unique
/// within the owning document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    /// File name, unique per document.
    pub file_name: String,
    /// Optional user label.
    pub label: Option<String>,
    /// Path on this device, when the bytes are available locally.
    pub local_path: Option<String>,
    /// Object key in the remote blob store, once uploaded.
    pub remote_key: Option<String>,
    /// Size in bytes.
    pub size_bytes: i64,
    /// Creation timestamp (Unix ms).
    pub added_at: i64,
}

impl FileAttachment {
    /// Create attachment metadata for a file that exists on this device.
    pub fn new_local(
        file_name: impl Into<String>,
        local_path: impl Into<String>,
        size_bytes: i64,
    ) -> Result<Self> {
        let file_name = validate_file_name(file_name.into())?;
        let local_path = local_path.into().trim().to_string();

        if local_path.is_empty() {
            return Err(Error::InvalidInput(
                "Attachment local_path cannot be empty".to_string(),
            ));
        }
        if size_bytes < 0 {
            return Err(Error::InvalidInput(
                "Attachment size_bytes cannot be negative".to_string(),
            ));
        }

        Ok(Self {
            file_name,
            label: None,
            local_path: Some(local_path),
            remote_key: None,
            size_bytes,
            added_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = crate::util::normalize_text_option(Some(label.into()));
        self
    }

    /// At least one of the local path or remote key is known
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.local_path.is_some() || self.remote_key.is_some()
    }

    /// Only a remote copy exists, so it must be downloaded before local access
    #[must_use]
    pub const fn needs_download(&self) -> bool {
        self.local_path.is_none() && self.remote_key.is_some()
    }

    /// Compare the user-visible parts, ignoring device paths and storage keys
    #[must_use]
    pub fn content_eq(&self, other: &Self) -> bool {
        self.file_name == other.file_name
            && self.label == other.label
            && self.size_bytes == other.size_bytes
    }
}

/// Trim and validate an attachment file name.
pub fn validate_file_name(file_name: String) -> Result<String> {
    let file_name = file_name.trim().to_string();
    if file_name.is_empty() {
        return Err(Error::InvalidInput(
            "Attachment file_name cannot be empty".to_string(),
        ));
    }
    if file_name.contains('/') || file_name == "." || file_name == ".." {
        return Err(Error::InvalidInput(format!(
            "Attachment file_name '{file_name}' must not contain path separators"
        )));
    }
    Ok(file_name)
}
