use std::sync::atomic::AtomicBool;

use docsync_core::identity::StableId;
use docsync_core::models::{FileMigrationStatus, MigrationProgress, RollbackReport};
use docsync_core::remote::{BlobStore, IdentityProvider, MetadataStore, RemoteError};

use crate::cli::MigrateCommands;
use crate::commands::common::{print_json, resolve_document};
use crate::commands::Coordinator;
use crate::error::CliError;

pub async fn run_migrate<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    command: MigrateCommands,
) -> Result<(), CliError> {
    match command {
        MigrateCommands::Run { json } => run_migration(coordinator, json).await,
        MigrateCommands::Status { json } => run_migration_status(coordinator, json).await,
        MigrateCommands::Rollback { document } => {
            run_rollback(coordinator, document.as_deref()).await
        }
    }
}

async fn stable_id<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
) -> Result<StableId, CliError> {
    match coordinator.migration().identity().current_stable_id().await {
        Ok(stable_id) => Ok(stable_id),
        Err(RemoteError::AuthRequired(_) | RemoteError::IdentityUnavailable(_)) => {
            Err(CliError::SignedOut)
        }
        Err(error) => Err(docsync_core::Error::from(error).into()),
    }
}

async fn run_migration<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    as_json: bool,
) -> Result<(), CliError> {
    let stable_id = stable_id(coordinator).await?;
    let never_cancelled = AtomicBool::new(false);
    let report = coordinator
        .migration()
        .run_migration(&stable_id, &never_cancelled)
        .await?;

    if as_json {
        return print_json(&report);
    }
    println!(
        "Migration finished: {} migrated, {} already migrated, {} failed",
        report.migrated, report.already_migrated, report.failed
    );
    if report.failed > 0 {
        println!("Failed files stay on the legacy path; rerun `docsync migrate run` to retry.");
    }
    Ok(())
}

async fn run_migration_status<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    as_json: bool,
) -> Result<(), CliError> {
    let stable_id = stable_id(coordinator).await?;
    let progress = coordinator
        .migration()
        .get_migration_progress(&stable_id)
        .await?;

    if as_json {
        return print_json(&progress);
    }
    for line in format_progress_lines(&progress) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_progress_lines(progress: &MigrationProgress) -> Vec<String> {
    let mut lines = vec![format!(
        "{}/{} files migrated ({:.0}%)",
        progress.completed, progress.total, progress.percentage
    )];
    for status in [
        FileMigrationStatus::Pending,
        FileMigrationStatus::Migrated,
        FileMigrationStatus::MigratedLegacyDeleted,
        FileMigrationStatus::FailedMissingFiles,
    ] {
        let count = progress.count(status);
        if count > 0 {
            lines.push(format!("  {:<24} {count}", status.to_string()));
        }
    }
    if progress.can_rollback {
        lines.push("Rollback available: `docsync migrate rollback`".to_string());
    }
    lines
}

async fn run_rollback<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    document: Option<&str>,
) -> Result<(), CliError> {
    let report = if let Some(id) = document {
        let document = resolve_document(id, coordinator.store())?;
        coordinator
            .migration()
            .rollback_for_document(&document.sync_id)
            .await?
    } else {
        let stable_id = stable_id(coordinator).await?;
        coordinator
            .migration()
            .rollback_migration(&stable_id)
            .await?
    };
    println!("{}", format_rollback(&report));
    Ok(())
}

pub fn format_rollback(report: &RollbackReport) -> String {
    format!(
        "Rollback finished: {} removed, {} kept (legacy copy missing), {} already absent, {} failed",
        report.removed, report.skipped_legacy_missing, report.skipped_new_missing, report.failed
    )
}
