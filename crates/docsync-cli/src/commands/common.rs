use std::env;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use docsync_core::db::DocumentRepository;
use docsync_core::models::{
    ConflictId, DocumentCategory, DocumentConflict, DocumentField, SyncEventRecord,
};
use docsync_core::services::LocalStore;
use docsync_core::{Document, SyncId};
use serde::Serialize;

use crate::error::CliError;

const SHORT_ID_LEN: usize = 13;

#[derive(Debug, Serialize)]
pub struct DocumentListItem {
    pub id: String,
    pub title: String,
    pub category: String,
    pub date: Option<String>,
    pub attachments: usize,
    pub version: i64,
    pub sync_state: String,
    pub deleted: bool,
    pub last_modified: i64,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    pub id: String,
    pub document_id: String,
    pub kind: String,
    pub fields: Vec<String>,
    pub local_version: i64,
    pub remote_version: i64,
    pub detected_at: i64,
    pub detected_at_iso: String,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("DOCSYNC_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docsync")
}

pub fn default_db_path() -> PathBuf {
    data_dir().join("docsync.db")
}

pub fn default_remote_dir() -> PathBuf {
    data_dir().join("remote")
}

pub fn default_files_dir() -> PathBuf {
    data_dir().join("files")
}

pub fn open_store(path: &Path) -> Result<LocalStore, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(LocalStore::open_path(path)?)
}

pub fn normalize_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn normalize_title(parts: &[String]) -> Result<String, CliError> {
    let title = parts.join(" ");
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        Err(CliError::EmptyTitle)
    } else {
        Ok(title)
    }
}

/// Pick the single candidate whose id starts with `query`.
fn match_prefix<'a, T>(
    query: &str,
    candidates: &'a [T],
    id_of: impl Fn(&T) -> String,
    not_found: impl FnOnce(String) -> CliError,
) -> Result<&'a T, CliError> {
    if let Some(exact) = candidates.iter().find(|candidate| id_of(*candidate) == query) {
        return Ok(exact);
    }

    let matches = candidates
        .iter()
        .filter(|candidate| id_of(*candidate).starts_with(query))
        .collect::<Vec<_>>();

    match matches.as_slice() {
        [] => Err(not_found(query.to_string())),
        [single] => Ok(*single),
        several => {
            let options = several
                .iter()
                .take(3)
                .map(|candidate| short_id(&id_of(*candidate)))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn resolve_document(query: &str, store: &LocalStore) -> Result<Document, CliError> {
    let query = normalize_identifier(query)?;
    if let Ok(sync_id) = SyncId::parse(&query) {
        if let Some(document) = store.get(&sync_id)? {
            return Ok(document);
        }
    }

    let documents = store.list(true)?;
    match_prefix(
        &query,
        &documents,
        |document| document.sync_id.to_string(),
        CliError::DocumentNotFound,
    )
    .cloned()
}

pub fn resolve_conflict_id(
    query: &str,
    conflicts: &[DocumentConflict],
) -> Result<ConflictId, CliError> {
    let query = normalize_identifier(query)?;
    match_prefix(
        &query,
        conflicts,
        |conflict| conflict.id.to_string(),
        CliError::ConflictNotFound,
    )
    .map(|conflict| conflict.id)
}

pub fn parse_category(value: &str) -> Result<DocumentCategory, CliError> {
    Ok(value.parse::<DocumentCategory>()?)
}

/// `none` or an empty string clears the date.
pub fn parse_date_edit(value: &str) -> Result<Option<NaiveDate>, CliError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    parse_date(trimmed).map(Some)
}

pub fn parse_date(value: &str) -> Result<NaiveDate, CliError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| CliError::InvalidDate(value.to_string()))
}

pub fn parse_field(value: &str) -> Result<DocumentField, CliError> {
    let wanted = value.trim().to_ascii_lowercase();
    DocumentField::ALL
        .into_iter()
        .find(|field| field.to_string() == wanted)
        .ok_or_else(|| CliError::UnknownField(value.to_string()))
}

pub fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_document_lines(documents: &[Document]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    documents
        .iter()
        .map(|document| {
            let id = short_id(document.sync_id.as_str());
            let title = truncate(&document.title, 32);
            let category = document.category.as_str();
            let state = if document.deleted {
                "deleted".to_string()
            } else {
                document.sync_state.to_string()
            };
            let relative_time = format_relative_time(document.last_modified, now_ms);
            format!("{id:<13}  {title:<32}  {category:<12}  {state:<16}  {relative_time}")
        })
        .collect()
}

pub fn document_to_list_item(document: &Document) -> DocumentListItem {
    let now_ms = Utc::now().timestamp_millis();
    DocumentListItem {
        id: document.sync_id.to_string(),
        title: document.title.clone(),
        category: document.category.to_string(),
        date: document.date.map(|date| date.to_string()),
        attachments: document.attachments.len(),
        version: document.version,
        sync_state: document.sync_state.to_string(),
        deleted: document.deleted,
        last_modified: document.last_modified,
        relative_time: format_relative_time(document.last_modified, now_ms),
    }
}

pub fn format_document_details(document: &Document) -> Vec<String> {
    let mut lines = vec![
        format!("id:        {}", document.sync_id),
        format!("title:     {}", document.title),
        format!("category:  {}", document.category),
        format!(
            "date:      {}",
            document
                .date
                .map_or_else(|| "-".to_string(), |date| date.to_string())
        ),
        format!("state:     {}", document.sync_state),
        format!(
            "version:   {} (remote {})",
            document.version, document.base_version
        ),
        format!("modified:  {}", format_timestamp(document.last_modified)),
    ];
    if let Some(notes) = document.notes.as_deref() {
        lines.push(format!("notes:     {}", truncate(notes, 72)));
    }
    if let Some(conflict_id) = document.conflict_id {
        lines.push(format!("conflict:  {conflict_id}"));
    }
    for attachment in &document.attachments {
        let availability = match (&attachment.local_path, &attachment.remote_key) {
            (Some(_), Some(_)) => "local+remote",
            (Some(_), None) => "local only",
            (None, Some(_)) => "remote only",
            (None, None) => "missing",
        };
        lines.push(format!(
            "  - {}  {} bytes  {availability}",
            attachment.file_name, attachment.size_bytes
        ));
    }
    lines
}

pub fn conflict_to_item(conflict: &DocumentConflict) -> ConflictItem {
    ConflictItem {
        id: conflict.id.to_string(),
        document_id: conflict.sync_id.to_string(),
        kind: conflict.kind.as_str().to_string(),
        fields: conflict.fields.iter().map(ToString::to_string).collect(),
        local_version: conflict.local.version,
        remote_version: conflict.remote.version,
        detected_at: conflict.detected_at,
        detected_at_iso: format_timestamp(conflict.detected_at),
    }
}

pub fn format_conflict_lines(conflicts: &[DocumentConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let fields = conflict
                .fields
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            format!(
                "{}  {}  doc={}  {:<14}  fields={}  local=v{} remote=v{}",
                short_id(&conflict.id.to_string()),
                format_timestamp(conflict.detected_at),
                short_id(conflict.sync_id.as_str()),
                conflict.kind.as_str(),
                fields,
                conflict.local.version,
                conflict.remote.version
            )
        })
        .collect()
}

pub fn format_event_lines(events: &[SyncEventRecord]) -> Vec<String> {
    events
        .iter()
        .map(|event| {
            let document = event
                .sync_id
                .as_ref()
                .map_or_else(|| "-".to_string(), |sync_id| short_id(sync_id.as_str()));
            format!(
                "{}  {:<18}  {:<13}  {}",
                format_timestamp(event.recorded_at),
                event.kind.as_str(),
                document,
                event.detail
            )
        })
        .collect()
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
