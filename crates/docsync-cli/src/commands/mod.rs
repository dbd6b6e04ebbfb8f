pub mod common;
pub mod completions;
pub mod config;
pub mod documents;
pub mod migrate;
pub mod sync;

use std::path::PathBuf;

use docsync_core::config::SyncConfig;
use docsync_core::identity::Principal;
use docsync_core::remote::{
    BlobMetadataStore, BlobStore, FsBlobStore, MetadataStore, S3BlobStore, S3Config,
    StaticIdentityProvider,
};
use docsync_core::SyncCoordinator;
use tracing::{debug, info};

use crate::cli::Commands;
use crate::commands::common::{default_files_dir, default_remote_dir, open_store, resolve_db_path};
use crate::config_profiles::{config_dir, CliProfilesConfig};
use crate::error::CliError;

pub type Coordinator<M, B> = SyncCoordinator<M, B, StaticIdentityProvider>;

/// Everything a command needs before the remote is chosen.
#[derive(Debug)]
pub struct Settings {
    pub db_path: PathBuf,
    pub principal: Principal,
    pub remote_dir: PathBuf,
    pub sync: SyncConfig,
}

impl Settings {
    pub fn load(profile: Option<&str>, db_path: Option<PathBuf>) -> Result<Self, CliError> {
        let profiles = CliProfilesConfig::load().map_err(CliError::Config)?;
        let profile_name = profiles.resolve_profile_name(profile);
        let profile = profiles.profile(&profile_name).cloned().unwrap_or_default();
        debug!(profile = %profile_name, "Resolved CLI profile");

        let sync_config_path = profile
            .sync_config
            .clone()
            .unwrap_or_else(|| config_dir().join("sync.json"));
        let mut sync = SyncConfig::load(&sync_config_path)?.with_env_overrides()?;
        if sync.files_dir.is_none() {
            sync.files_dir = Some(profile.files_dir.clone().unwrap_or_else(default_files_dir));
        }

        Ok(Self {
            db_path: resolve_db_path(db_path),
            principal: profile.principal(),
            remote_dir: profile.remote_dir.clone().unwrap_or_else(default_remote_dir),
            sync,
        })
    }
}

/// Build the coordinator for the configured remote and run `command` on it.
///
/// `DOCSYNC_S3_*` selects an S3 bucket; otherwise a local directory stands in
/// for the remote.
pub async fn run_command(settings: Settings, command: Commands) -> Result<(), CliError> {
    let store = open_store(&settings.db_path)?;
    let identity = StaticIdentityProvider::new(settings.principal);

    if let Some(s3) = S3Config::from_env()? {
        info!(bucket = %s3.bucket, "Using S3 remote");
        let blobs = S3BlobStore::new(s3);
        let metadata = BlobMetadataStore::new(blobs.clone());
        let coordinator = SyncCoordinator::new(store, metadata, blobs, identity, settings.sync)?;
        execute(&coordinator, command).await
    } else {
        debug!(root = %settings.remote_dir.display(), "Using filesystem remote");
        let blobs = FsBlobStore::new(settings.remote_dir);
        let metadata = BlobMetadataStore::new(blobs.clone());
        let coordinator = SyncCoordinator::new(store, metadata, blobs, identity, settings.sync)?;
        execute(&coordinator, command).await
    }
}

pub(crate) async fn execute<M: MetadataStore, B: BlobStore>(
    coordinator: &Coordinator<M, B>,
    command: Commands,
) -> Result<(), CliError> {
    match command {
        Commands::Add {
            title,
            category,
            date,
            notes,
        } => documents::run_add(coordinator, &title, &category, date.as_deref(), notes).await,
        Commands::List { limit, all, json } => documents::run_list(coordinator, limit, all, json),
        Commands::Show { id, json } => documents::run_show(coordinator, &id, json),
        Commands::Edit {
            id,
            title,
            category,
            date,
            notes,
        } => documents::run_edit(
            coordinator,
            &id,
            title,
            category.as_deref(),
            date.as_deref(),
            notes,
        ),
        Commands::Delete { id } => documents::run_delete(coordinator, &id).await,
        Commands::Attach { id, path, label } => {
            documents::run_attach(coordinator, &id, &path, label.as_deref()).await
        }
        Commands::Fetch { id, file_name } => documents::run_fetch(coordinator, &id, &file_name),
        Commands::Sync { id, json } => sync::run_sync(coordinator, id.as_deref(), json).await,
        Commands::Status { json } => sync::run_status(coordinator, json),
        Commands::Conflicts { json } => sync::run_conflicts(coordinator, json),
        Commands::Resolve {
            conflict,
            strategy,
            remote_fields,
        } => sync::run_resolve(coordinator, &conflict, strategy, &remote_fields).await,
        Commands::Events {
            limit,
            document,
            json,
        } => sync::run_events(coordinator, limit, document.as_deref(), json),
        Commands::Migrate { command } => migrate::run_migrate(coordinator, command).await,
        Commands::Completions { .. } | Commands::Config { .. } => Err(CliError::Config(
            "command does not use the sync engine".to_string(),
        )),
    }
}
