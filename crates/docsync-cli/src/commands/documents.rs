use std::path::Path;

use docsync_core::db::{DocumentRepository, EventLog};
use docsync_core::queue::EnqueueOutcome;
use docsync_core::remote::{BlobStore, MetadataStore};
use docsync_core::sync::{DocumentEdit, NewDocument};
use serde::Serialize;

use crate::commands::common::{
    document_to_list_item, format_document_details, format_document_lines, format_event_lines,
    normalize_title, parse_category, parse_date, parse_date_edit, print_json, resolve_document,
    short_id, DocumentListItem,
};
use crate::commands::Coordinator;
use crate::error::CliError;

const SHOW_EVENT_LIMIT: usize = 5;

pub async fn run_add<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    title: &[String],
    category: &str,
    date: Option<&str>,
    notes: Option<String>,
) -> Result<(), CliError> {
    let new = NewDocument {
        title: normalize_title(title)?,
        category: parse_category(category)?,
        date: date.map(parse_date).transpose()?,
        notes,
    };

    let document = match coordinator.create_document(new).await {
        Err(docsync_core::Error::IdentityUnavailable(_)) => return Err(CliError::SignedOut),
        other => other?,
    };
    println!("{}", short_id(document.sync_id.as_str()));
    Ok(())
}

pub fn run_list<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    limit: usize,
    include_deleted: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let mut documents = coordinator.store().list(include_deleted)?;
    documents.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
    documents.truncate(limit);

    if as_json {
        let items = documents
            .iter()
            .map(document_to_list_item)
            .collect::<Vec<DocumentListItem>>();
        return print_json(&items);
    }

    if documents.is_empty() {
        println!("No documents yet. Add one with `docsync add <title>`.");
        return Ok(());
    }
    for line in format_document_lines(&documents) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_show<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    id: &str,
    as_json: bool,
) -> Result<(), CliError> {
    let document = resolve_document(id, coordinator.store())?;
    let events = coordinator
        .store()
        .for_document(&document.sync_id, SHOW_EVENT_LIMIT)?;

    if as_json {
        #[derive(Serialize)]
        struct Details<'a> {
            document: &'a docsync_core::Document,
            events: &'a [docsync_core::models::SyncEventRecord],
        }
        return print_json(&Details {
            document: &document,
            events: &events,
        });
    }

    for line in format_document_details(&document) {
        println!("{line}");
    }
    if !events.is_empty() {
        println!("recent events:");
        for line in format_event_lines(&events) {
            println!("  {line}");
        }
    }
    Ok(())
}

pub fn run_edit<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    id: &str,
    title: Option<String>,
    category: Option<&str>,
    date: Option<&str>,
    notes: Option<String>,
) -> Result<(), CliError> {
    let edit = DocumentEdit {
        title,
        category: category.map(parse_category).transpose()?,
        date: date.map(parse_date_edit).transpose()?,
        notes: notes.map(|notes| docsync_core::util::normalize_text_option(Some(notes))),
    };
    if edit.is_empty() {
        return Err(CliError::EmptyEdit);
    }

    let document = resolve_document(id, coordinator.store())?;
    let updated = coordinator.update_document(&document.sync_id, edit)?;
    println!(
        "Updated {} (v{}, {})",
        short_id(updated.sync_id.as_str()),
        updated.version,
        updated.sync_state
    );
    Ok(())
}

pub async fn run_delete<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    id: &str,
) -> Result<(), CliError> {
    let document = resolve_document(id, coordinator.store())?;
    coordinator.delete_document(&document.sync_id).await?;
    println!("Deleted {}", short_id(document.sync_id.as_str()));
    Ok(())
}

pub async fn run_attach<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    id: &str,
    path: &Path,
    label: Option<&str>,
) -> Result<(), CliError> {
    let document = resolve_document(id, coordinator.store())?;
    let attachment = coordinator
        .attach_file(&document.sync_id, path, label)
        .await?;
    println!(
        "Attached {} ({} bytes) to {}",
        attachment.file_name,
        attachment.size_bytes,
        short_id(document.sync_id.as_str())
    );
    Ok(())
}

pub fn run_fetch<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    id: &str,
    file_name: &str,
) -> Result<(), CliError> {
    let document = resolve_document(id, coordinator.store())?;
    match coordinator.request_file_download(&document.sync_id, file_name)? {
        EnqueueOutcome::Rejected => println!("{file_name} was not queued; a delete is pending"),
        _ => println!("Queued download of {file_name}; run `docsync sync` to fetch it"),
    }
    Ok(())
}
