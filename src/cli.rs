/// CLI argument parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "docker-stack-backup")]
#[command(author, version = VERSION_WITH_BUILD, about = "Crash-safe backups of docker compose stacks with restic and rclone", long_about = None)]
pub struct Cli {
    /// Config file (default: $DOCKER_STACK_BACKUP_CONFIG, then ~/.config/docker-stack-backup/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stop, back up and restart every enabled stack
    Run {
        /// Preview restic and rclone operations without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Don't write a per-run log file
        #[arg(long)]
        no_log_file: bool,
    },

    /// Manage the directory list
    Dirs {
        #[command(subcommand)]
        command: DirsCommands,
    },

    /// List snapshots in the repository
    Snapshots {
        /// Only snapshots with this tag
        #[arg(short, long)]
        tag: Option<String>,

        /// Most recent N snapshots
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show what the latest snapshot of a directory contains
    RestorePreview {
        /// Snapshot tag (directory name, or external path with '/' as '_')
        tag: String,
    },

    /// Initialize the restic repository if it doesn't exist yet
    Init,

    /// Check that docker, restic and the repository are usable
    Check,

    /// Upload the repository to the cloud remote
    Upload {
        #[arg(long)]
        dry_run: bool,
    },

    /// Download the repository from the cloud remote
    Download {
        /// Directory to restore into
        #[arg(short, long)]
        target: PathBuf,

        /// Overwrite a non-empty target directory
        #[arg(short, long)]
        force: bool,

        #[arg(long)]
        dry_run: bool,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
pub enum DirsCommands {
    /// Show all entries and their state
    List,

    /// Reconcile the list with the managed directory
    Sync,

    /// Include a directory in backups
    Enable { identifier: String },

    /// Exclude a directory from backups
    Disable { identifier: String },

    /// Register a stack outside the managed directory
    Add {
        /// Absolute path
        path: PathBuf,

        /// Register disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Unregister an external stack
    Remove { path: String },
}
