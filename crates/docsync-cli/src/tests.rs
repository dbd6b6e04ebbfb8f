use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{CommandFactory, Parser};
use docsync_core::config::SyncConfig;
use docsync_core::db::{DocumentRepository, EventLog};
use docsync_core::identity::Principal;
use docsync_core::models::{
    DocumentCategory, DocumentField, FieldSelection, ResolutionStrategy, Side, SyncEventKind,
};
use docsync_core::remote::{BlobMetadataStore, FsBlobStore, StaticIdentityProvider};
use docsync_core::services::LocalStore;
use docsync_core::state::SyncState;
use docsync_core::sync::{RetryPolicy, SyncSummary};
use docsync_core::{Document, SyncCoordinator, SyncId};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::cli::{Cli, Commands, CompletionShell, StrategyArg};
use crate::commands::common::{
    format_relative_time, format_timestamp, normalize_title, parse_category, parse_date,
    parse_date_edit, parse_field, resolve_document, truncate,
};
use crate::commands::completions::{render_completions, run_completions};
use crate::commands::config::{merge_profile, ProfileInit};
use crate::commands::sync::{build_strategy, format_summary_lines};
use crate::commands::{execute, Coordinator};
use crate::config_profiles::CliProfile;
use crate::error::CliError;

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn resolve_parses_merge_with_remote_fields() {
    let cli = Cli::try_parse_from([
        "docsync", "resolve", "0192", "--strategy", "merge", "--remote", "title", "--remote",
        "notes",
    ])
    .unwrap();
    match cli.command {
        Some(Commands::Resolve {
            conflict,
            strategy,
            remote_fields,
        }) => {
            assert_eq!(conflict, "0192");
            assert_eq!(strategy, StrategyArg::Merge);
            assert_eq!(remote_fields, vec!["title".to_string(), "notes".to_string()]);
        }
        _ => panic!("expected resolve command"),
    }
}

#[test]
fn global_profile_flag_reaches_subcommands() {
    let cli = Cli::try_parse_from(["docsync", "status", "--profile", "work"]).unwrap();
    assert_eq!(cli.profile.as_deref(), Some("work"));
}

#[test]
fn normalize_title_collapses_whitespace_and_rejects_empty() {
    let parts = vec!["  Home ".to_string(), "insurance\t2025".to_string()];
    assert_eq!(normalize_title(&parts).unwrap(), "Home insurance 2025");
    assert!(matches!(
        normalize_title(&[" ".to_string()]),
        Err(CliError::EmptyTitle)
    ));
}

#[test]
fn parse_category_is_case_insensitive() {
    assert_eq!(parse_category("Warranty").unwrap(), DocumentCategory::Warranty);
    assert!(parse_category("groceries").is_err());
}

#[test]
fn parse_date_accepts_iso_dates_only() {
    assert_eq!(
        parse_date("2025-03-01").unwrap(),
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    );
    assert!(matches!(
        parse_date("03/01/2025"),
        Err(CliError::InvalidDate(_))
    ));
}

#[test]
fn parse_date_edit_clears_with_none() {
    assert_eq!(parse_date_edit("none").unwrap(), None);
    assert_eq!(parse_date_edit("").unwrap(), None);
    assert_eq!(
        parse_date_edit("2026-01-31").unwrap(),
        NaiveDate::from_ymd_opt(2026, 1, 31)
    );
}

#[test]
fn parse_field_matches_display_names() {
    assert_eq!(parse_field("Notes").unwrap(), DocumentField::Notes);
    assert_eq!(parse_field("attachments").unwrap(), DocumentField::Attachments);
    assert!(matches!(
        parse_field("owner"),
        Err(CliError::UnknownField(_))
    ));
}

#[test]
fn build_strategy_takes_named_fields_from_remote() {
    let strategy = build_strategy(StrategyArg::Merge, &["date".to_string()]).unwrap();
    assert_eq!(
        strategy,
        ResolutionStrategy::Merge(FieldSelection::default().take(DocumentField::Date, Side::Remote))
    );
    assert_eq!(
        build_strategy(StrategyArg::KeepRemote, &[]).unwrap(),
        ResolutionStrategy::KeepRemote
    );
}

#[test]
fn truncate_adds_ellipsis() {
    assert_eq!(truncate("short", 10), "short");
    assert_eq!(truncate("a much longer title", 10), "a much ...");
}

#[test]
fn format_timestamp_returns_utc_label() {
    assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    assert_eq!(format_relative_time(now - 3 * 24 * 60 * 60_000, now), "3d ago");
    assert_eq!(format_relative_time(now + 5_000, now), "just now");
}

#[test]
fn summary_lines_explain_blocked_passes() {
    let offline = SyncSummary {
        offline: true,
        ..SyncSummary::default()
    };
    assert_eq!(format_summary_lines(&offline), vec!["Offline; nothing was sent."]);

    let busy = SyncSummary {
        uploaded: 2,
        conflicts: 1,
        retried: 1,
        ..SyncSummary::default()
    };
    let lines = format_summary_lines(&busy);
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("Sync completed: 2 uploaded"));
    assert!(lines[1].contains("docsync conflicts"));
}

#[test]
fn merge_profile_prefers_explicit_then_env_then_existing() {
    let existing = CliProfile {
        account_id: Some("old".to_string()),
        username: Some("olduser".to_string()),
        remote_dir: Some(PathBuf::from("/old/remote")),
        files_dir: None,
        sync_config: None,
    };
    let init = ProfileInit {
        username: Some("alice".to_string()),
        files_dir: Some(PathBuf::from("/files")),
        ..ProfileInit::default()
    };
    let merged = merge_profile(existing, init, |key| {
        (key == "DOCSYNC_ACCOUNT_ID").then(|| "from-env".to_string())
    });
    assert_eq!(merged.account_id.as_deref(), Some("from-env"));
    assert_eq!(merged.username.as_deref(), Some("alice"));
    assert_eq!(merged.remote_dir, Some(PathBuf::from("/old/remote")));
    assert_eq!(merged.files_dir, Some(PathBuf::from("/files")));
}

#[test]
fn completions_use_binary_name() {
    let script = String::from_utf8(render_completions(CompletionShell::Bash)).unwrap();
    assert!(script.contains("docsync"));
}

#[test]
fn run_completions_writes_script_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("completions").join("docsync.zsh");
    run_completions(CompletionShell::Zsh, Some(&path)).unwrap();
    let script = std::fs::read_to_string(path).unwrap();
    assert!(script.contains("#compdef docsync"));
}

#[test]
fn resolve_document_supports_exact_and_prefix_id() {
    let store = LocalStore::open_in_memory().unwrap();
    let document = Document::new("u1", "Lease", DocumentCategory::Contract).unwrap();
    store.insert(&document).unwrap();

    let id = document.sync_id.to_string();
    assert_eq!(resolve_document(&id, &store).unwrap().sync_id, document.sync_id);
    assert_eq!(
        resolve_document(&id[..8], &store).unwrap().sync_id,
        document.sync_id
    );
    assert!(matches!(
        resolve_document("zzzz", &store),
        Err(CliError::DocumentNotFound(_))
    ));
    assert!(matches!(
        resolve_document("  ", &store),
        Err(CliError::EmptyId)
    ));
}

#[test]
fn resolve_document_rejects_ambiguous_prefix() {
    let store = LocalStore::open_in_memory().unwrap();
    for (suffix, title) in [("1", "Lease"), ("2", "Passport")] {
        let mut document = Document::new("u1", title, DocumentCategory::Other).unwrap();
        document.sync_id = SyncId::parse(&format!("abcd0000-0000-4000-8000-00000000000{suffix}")).unwrap();
        store.insert(&document).unwrap();
    }

    assert!(matches!(
        resolve_document("abcd", &store),
        Err(CliError::AmbiguousId(_))
    ));
    assert_eq!(
        resolve_document("abcd0000-0000-4000-8000-000000000002", &store)
            .unwrap()
            .title,
        "Passport"
    );
}

struct Harness {
    _dir: TempDir,
    coordinator: Coordinator<BlobMetadataStore<FsBlobStore>, FsBlobStore>,
}

fn harness(principal: Principal) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::open_path(dir.path().join("docsync.db")).unwrap();
    let blobs = FsBlobStore::new(dir.path().join("remote"));
    let config = SyncConfig {
        retry: RetryPolicy::immediate(1),
        files_dir: Some(dir.path().join("files")),
        ..SyncConfig::default()
    };
    let coordinator = SyncCoordinator::new(
        store,
        BlobMetadataStore::new(blobs.clone()),
        blobs,
        StaticIdentityProvider::new(principal),
        config,
    )
    .unwrap();
    Harness {
        _dir: dir,
        coordinator,
    }
}

fn add_command(title: &str) -> Commands {
    Commands::Add {
        title: vec![title.to_string()],
        category: "insurance".to_string(),
        date: Some("2025-06-30".to_string()),
        notes: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn add_then_sync_uploads_to_filesystem_remote() {
    let harness = harness(Principal::signed_in("acct-1", "alice"));
    let coordinator = &harness.coordinator;

    execute(coordinator, add_command("Car insurance")).await.unwrap();
    let documents = coordinator.store().list(false).unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].sync_state, SyncState::PendingUpload);
    assert_eq!(documents[0].date, NaiveDate::from_ymd_opt(2025, 6, 30));

    execute(
        coordinator,
        Commands::Sync {
            id: None,
            json: true,
        },
    )
    .await
    .unwrap();

    let synced = coordinator
        .store()
        .get(&documents[0].sync_id)
        .unwrap()
        .unwrap();
    assert_eq!(synced.sync_state, SyncState::Synced);
    assert_eq!(synced.base_version, 1);
    assert!(coordinator.queue().is_empty());

    let events = coordinator
        .store()
        .for_document(&synced.sync_id, 10)
        .unwrap();
    assert!(events
        .iter()
        .any(|event| event.kind == SyncEventKind::Uploaded));
}

#[tokio::test(flavor = "multi_thread")]
async fn edit_and_delete_go_through_the_queue() {
    let harness = harness(Principal::signed_in("acct-1", "alice"));
    let coordinator = &harness.coordinator;

    execute(coordinator, add_command("Warranty card")).await.unwrap();
    let id = coordinator.store().list(false).unwrap()[0].sync_id.to_string();

    execute(
        coordinator,
        Commands::Edit {
            id: id[..8].to_string(),
            title: Some("Fridge warranty".to_string()),
            category: Some("warranty".to_string()),
            date: Some("none".to_string()),
            notes: None,
        },
    )
    .await
    .unwrap();
    let edited = resolve_document(&id, coordinator.store()).unwrap();
    assert_eq!(edited.title, "Fridge warranty");
    assert_eq!(edited.category, DocumentCategory::Warranty);
    assert_eq!(edited.date, None);

    let empty_edit = execute(
        coordinator,
        Commands::Edit {
            id: id.clone(),
            title: None,
            category: None,
            date: None,
            notes: None,
        },
    )
    .await;
    assert!(matches!(empty_edit, Err(CliError::EmptyEdit)));

    execute(coordinator, Commands::Delete { id: id.clone() })
        .await
        .unwrap();
    // never uploaded, so the document is gone locally without a remote call
    assert!(coordinator.store().list(true).unwrap().is_empty());
    assert!(coordinator.queue().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn add_while_signed_out_asks_for_sign_in() {
    let harness = harness(Principal::signed_out());
    let result = execute(&harness.coordinator, add_command("Passport")).await;
    assert!(matches!(result, Err(CliError::SignedOut)));
}
