/// Shared constants: file names, tags, timing, exit codes and config defaults

use std::time::Duration;

pub const APP_NAME: &str = "docker-stack-backup";

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "DOCKER_STACK_BACKUP_CONFIG";

/// Environment variable holding an `EnvFilter` directive
pub const LOG_ENV: &str = "DOCKER_STACK_BACKUP_LOG";

/// Manifest names that make a directory a stack, in lookup order
pub const MANIFEST_FILES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

// Directory list

pub const DIRLIST_FILE_NAME: &str = "dirlist";
pub const DIRLIST_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

// Stack lifecycle

/// Pause after `stop` before the first status check
pub const STOP_SETTLE_DELAY: Duration = Duration::from_secs(2);
pub const STOP_VERIFY_ATTEMPTS: u32 = 3;
pub const STOP_VERIFY_INTERVAL: Duration = Duration::from_secs(3);
/// Added on top of the compose stop timeout for the command ceiling
pub const STOP_TIMEOUT_BUFFER: Duration = Duration::from_secs(30);

// Backup engine

pub const BACKUP_TAG: &str = "docker-backup";
pub const SELECTIVE_BACKUP_TAG: &str = "selective-backup";
pub const REPOSITORY_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

// Cloud transfer

/// Backoff unit, multiplied by the attempt number
pub const TRANSFER_RETRY_DELAY: Duration = Duration::from_secs(30);
pub const CONNECTIVITY_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const WRITE_PROBE_FILE: &str = ".docker-stack-backup-write-test";
/// Entries every restic repository has at its root
pub const REPOSITORY_MARKERS: &[&str] = &["config", "data", "index", "keys", "snapshots"];

// Config defaults (seconds)

pub const DEFAULT_STOP_TIMEOUT: u64 = 300;
pub const DEFAULT_START_TIMEOUT: u64 = 300;
pub const DEFAULT_STATUS_TIMEOUT: u64 = 30;
pub const DEFAULT_BACKUP_TIMEOUT: u64 = 3600;
pub const DEFAULT_TRANSFER_TIMEOUT: u64 = 6 * 3600;
pub const DEFAULT_TRANSFERS: u32 = 4;
pub const DEFAULT_TRANSFER_RETRIES: u32 = 3;

// Process exit codes

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_ALREADY_RUNNING: i32 = 3;
/// 128 + SIGINT
pub const EXIT_INTERRUPTED: i32 = 130;
