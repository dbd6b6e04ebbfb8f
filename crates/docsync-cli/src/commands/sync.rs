use docsync_core::db::EventLog;
use docsync_core::models::{FieldSelection, ResolutionStrategy, Side};
use docsync_core::remote::{BlobStore, MetadataStore};
use docsync_core::sync::{SyncStatus, SyncSummary};

use crate::cli::StrategyArg;
use crate::commands::common::{
    conflict_to_item, format_conflict_lines, format_event_lines, parse_field, print_json,
    resolve_conflict_id, resolve_document, short_id, ConflictItem,
};
use crate::commands::Coordinator;
use crate::error::CliError;

pub async fn run_sync<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    id: Option<&str>,
    as_json: bool,
) -> Result<(), CliError> {
    if let Some(id) = id {
        let document = resolve_document(id, coordinator.store())?;
        let synced = coordinator.sync_document(&document.sync_id).await?;
        if as_json {
            return print_json(&synced);
        }
        match synced {
            Some(document) => println!(
                "{}  v{}  {}",
                short_id(document.sync_id.as_str()),
                document.version,
                document.sync_state
            ),
            None => println!("{} removed", short_id(document.sync_id.as_str())),
        }
        return Ok(());
    }

    let summary = coordinator.on_app_launch().await?;
    if as_json {
        return print_json(&summary);
    }
    for line in format_summary_lines(&summary) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_summary_lines(summary: &SyncSummary) -> Vec<String> {
    if summary.offline {
        return vec!["Offline; nothing was sent.".to_string()];
    }
    if summary.auth_required {
        return vec!["Sign-in required; pending changes stay queued.".to_string()];
    }

    let mut lines = vec![format!(
        "Sync completed: {} uploaded, {} downloaded, {} deleted, {} files up, {} files down",
        summary.uploaded,
        summary.downloaded,
        summary.deleted,
        summary.files_uploaded,
        summary.files_downloaded
    )];
    if summary.conflicts > 0 {
        lines.push(format!(
            "{} conflict(s); see `docsync conflicts`",
            summary.conflicts
        ));
    }
    if summary.retried + summary.deferred > 0 {
        lines.push(format!(
            "{} operation(s) will be retried",
            summary.retried + summary.deferred
        ));
    }
    if summary.failed + summary.dropped > 0 {
        lines.push(format!(
            "{} operation(s) failed; see `docsync events`",
            summary.failed + summary.dropped
        ));
    }
    lines
}

pub fn run_status<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    as_json: bool,
) -> Result<(), CliError> {
    let status = coordinator.status()?;
    if as_json {
        return print_json(&status);
    }
    for line in format_status_lines(&status) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_status_lines(status: &SyncStatus) -> Vec<String> {
    let mut lines = vec![format!("queue: {} pending", status.queue.total)];
    for (op_type, count) in &status.queue.by_type {
        lines.push(format!("  {:<14} {count}", op_type.as_str()));
    }
    lines.push("documents:".to_string());
    if status.documents.is_empty() {
        lines.push("  none".to_string());
    }
    for (state, count) in &status.documents {
        lines.push(format!("  {:<16} {count}", state.to_string()));
    }
    lines.push(format!("open conflicts: {}", status.open_conflicts));
    lines
}

pub fn run_conflicts<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    as_json: bool,
) -> Result<(), CliError> {
    let conflicts = coordinator.list_conflicts()?;

    if as_json {
        let items = conflicts
            .iter()
            .map(conflict_to_item)
            .collect::<Vec<ConflictItem>>();
        return print_json(&items);
    }

    if conflicts.is_empty() {
        println!("No unresolved conflicts.");
        return Ok(());
    }
    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

/// Merge keeps local values except for the fields named with `--remote`.
pub fn build_strategy(
    strategy: StrategyArg,
    remote_fields: &[String],
) -> Result<ResolutionStrategy, CliError> {
    match strategy {
        StrategyArg::KeepLocal => Ok(ResolutionStrategy::KeepLocal),
        StrategyArg::KeepRemote => Ok(ResolutionStrategy::KeepRemote),
        StrategyArg::Merge => {
            let mut selection = FieldSelection::default();
            for field in remote_fields {
                selection = selection.take(parse_field(field)?, Side::Remote);
            }
            Ok(ResolutionStrategy::Merge(selection))
        }
    }
}

pub async fn run_resolve<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    conflict: &str,
    strategy: StrategyArg,
    remote_fields: &[String],
) -> Result<(), CliError> {
    let strategy = build_strategy(strategy, remote_fields)?;
    let conflicts = coordinator.list_conflicts()?;
    let conflict_id = resolve_conflict_id(conflict, &conflicts)?;

    match coordinator.resolve_conflict(&conflict_id, strategy).await? {
        Some(document) => println!(
            "Resolved {}; {} is now {} (v{})",
            short_id(&conflict_id.to_string()),
            short_id(document.sync_id.as_str()),
            document.sync_state,
            document.version
        ),
        None => println!(
            "Resolved {}; the document was removed",
            short_id(&conflict_id.to_string())
        ),
    }
    Ok(())
}

pub fn run_events<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    limit: usize,
    document: Option<&str>,
    as_json: bool,
) -> Result<(), CliError> {
    let events = match document {
        Some(id) => {
            let document = resolve_document(id, coordinator.store())?;
            coordinator.store().for_document(&document.sync_id, limit)?
        }
        None => coordinator.recent_events(limit)?,
    };

    if as_json {
        return print_json(&events);
    }
    if events.is_empty() {
        println!("No sync events recorded.");
        return Ok(());
    }
    for line in format_event_lines(&events) {
        println!("{line}");
    }
    Ok(())
}
