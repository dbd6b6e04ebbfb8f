use std::env;
use std::path::PathBuf;

use docsync_core::config::SyncConfig;

use crate::cli::ConfigCommands;
use crate::commands::common::print_json;
use crate::config_profiles::{normalize_text_option, CliProfile, CliProfilesConfig};
use crate::error::CliError;

/// Values passed to `config init`; `None` keeps what the profile already has.
#[derive(Debug, Default)]
pub struct ProfileInit {
    pub account_id: Option<String>,
    pub username: Option<String>,
    pub remote_dir: Option<PathBuf>,
    pub files_dir: Option<PathBuf>,
    pub sync_config: Option<PathBuf>,
}

pub fn run_config(command: ConfigCommands, global_profile: Option<&str>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Init {
            account_id,
            username,
            remote_dir,
            files_dir,
            sync_config,
            no_activate,
        } => run_config_init(
            global_profile,
            ProfileInit {
                account_id,
                username,
                remote_dir,
                files_dir,
                sync_config,
            },
            no_activate,
        ),
        ConfigCommands::Show => run_config_show(global_profile),
    }
}

pub fn run_config_init(
    profile_name: Option<&str>,
    init: ProfileInit,
    no_activate: bool,
) -> Result<(), CliError> {
    let mut config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = config.resolve_profile_name(profile_name);
    let existing = config.profile(&profile_name).cloned().unwrap_or_default();

    let merged = merge_profile(existing, init, |key| env::var(key).ok());
    if let Some(path) = merged.sync_config.as_deref() {
        SyncConfig::load(path)
            .map_err(|error| CliError::Config(format!("{}: {error}", path.display())))?;
    }
    *config.profile_mut_or_default(&profile_name) = merged;

    if !no_activate {
        config.active_profile = Some(profile_name.clone());
    }

    let path = config.save().map_err(CliError::Config)?;
    println!(
        "Profile '{}' initialized at {}",
        profile_name,
        path.display()
    );

    let profile = config
        .profile(&profile_name)
        .ok_or_else(|| CliError::Config("Failed to persist profile".to_string()))?;
    if profile.account_id.is_none() {
        println!("Profile '{profile_name}' is missing: account_id (sync stays signed out)");
    }

    Ok(())
}

fn run_config_show(profile_name: Option<&str>) -> Result<(), CliError> {
    let config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = config.resolve_profile_name(profile_name);
    let profile = config.profile(&profile_name).cloned().unwrap_or_default();
    println!("profile: {profile_name}");
    print_json(&profile)
}

/// Explicit values win over `DOCSYNC_ACCOUNT_ID`/`DOCSYNC_USERNAME`, which
/// win over the stored profile.
pub fn merge_profile(
    existing: CliProfile,
    init: ProfileInit,
    lookup: impl Fn(&str) -> Option<String>,
) -> CliProfile {
    let account_id = normalize_text_option(init.account_id)
        .or_else(|| normalize_text_option(lookup("DOCSYNC_ACCOUNT_ID")))
        .or(existing.account_id);
    let username = normalize_text_option(init.username)
        .or_else(|| normalize_text_option(lookup("DOCSYNC_USERNAME")))
        .or(existing.username);

    CliProfile {
        account_id,
        username,
        remote_dir: init.remote_dir.or(existing.remote_dir),
        files_dir: init.files_dir.or(existing.files_dir),
        sync_config: init.sync_config.or(existing.sync_config),
    }
}
