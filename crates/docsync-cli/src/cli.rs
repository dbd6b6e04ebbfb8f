use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "docsync")]
#[command(about = "Keep personal documents in sync across devices")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile name for identity and remote configuration
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new document
    #[command(alias = "new")]
    Add {
        /// Document title
        title: Vec<String>,
        /// Document category
        #[arg(short, long, default_value = "other")]
        category: String,
        /// Renewal, expiry or issue date (YYYY-MM-DD)
        #[arg(short, long, value_name = "DATE")]
        date: Option<String>,
        /// Free-form notes
        #[arg(short, long)]
        notes: Option<String>,
    },
    /// List documents
    List {
        /// Number of documents to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Include deleted documents
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one document with its attachments and recent events
    Show {
        /// Document ID or unique ID prefix
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit an existing document
    Edit {
        /// Document ID or unique ID prefix
        id: String,
        #[arg(short, long)]
        title: Option<String>,
        #[arg(short, long)]
        category: Option<String>,
        /// New date (YYYY-MM-DD); pass "none" to clear it
        #[arg(short, long, value_name = "DATE")]
        date: Option<String>,
        /// New notes; pass an empty string to clear them
        #[arg(short, long)]
        notes: Option<String>,
    },
    /// Delete a document
    Delete {
        /// Document ID or unique ID prefix
        id: String,
    },
    /// Attach a file to a document
    Attach {
        /// Document ID or unique ID prefix
        id: String,
        /// File to attach
        path: PathBuf,
        /// Optional label shown next to the file
        #[arg(short, long)]
        label: Option<String>,
    },
    /// Queue a download for an attachment that is only stored remotely
    Fetch {
        /// Document ID or unique ID prefix
        id: String,
        /// Attachment file name
        file_name: String,
    },
    /// Run a sync pass, or sync a single document
    Sync {
        /// Document ID or unique ID prefix; all pending work when omitted
        id: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show queue depth and document states
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List unresolved conflicts
    Conflicts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a conflict
    Resolve {
        /// Conflict ID or unique ID prefix
        conflict: String,
        #[arg(short, long, value_enum)]
        strategy: StrategyArg,
        /// With `merge`: take this field from the remote copy (repeatable)
        #[arg(long = "remote", value_name = "FIELD")]
        remote_fields: Vec<String>,
    },
    /// Storage path migration
    Migrate {
        #[command(subcommand)]
        command: MigrateCommands,
    },
    /// Show recent sync events
    Events {
        /// Number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Only events for this document ID or unique ID prefix
        #[arg(long, value_name = "ID")]
        document: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Configure CLI profiles
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    #[value(name = "powershell")]
    PowerShell,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum StrategyArg {
    KeepLocal,
    KeepRemote,
    Merge,
}

#[derive(Subcommand)]
pub enum MigrateCommands {
    /// Copy legacy files to the current path scheme
    Run {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show per-file migration progress
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove verified copies that still have a legacy source
    Rollback {
        /// Only roll back files of this document ID or unique ID prefix
        #[arg(long, value_name = "ID")]
        document: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Initialize or update profile config
    Init {
        /// Durable account id of the signed-in user
        #[arg(long, value_name = "ID")]
        account_id: Option<String>,
        /// Username, used to locate files stored under the legacy path scheme
        #[arg(long, value_name = "NAME")]
        username: Option<String>,
        /// Directory used as the remote when no S3 bucket is configured
        #[arg(long, value_name = "PATH")]
        remote_dir: Option<PathBuf>,
        /// Directory for attachment files on this device
        #[arg(long, value_name = "PATH")]
        files_dir: Option<PathBuf>,
        /// Sync engine config file (JSON)
        #[arg(long, value_name = "PATH")]
        sync_config: Option<PathBuf>,
        /// Keep current active profile instead of activating this one
        #[arg(long)]
        no_activate: bool,
    },
    /// Print the resolved profile
    Show,
}
