/// Error types for the backup pipeline
///
/// Every component reports a typed error; the orchestrator folds fatal ones
/// into a `PipelineError` carrying its `ErrorKind`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::command::CommandResult;

/// Failure category, used to decide whether the run continues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid settings, aborts before any mutation
    Configuration,
    /// Missing tool, unreachable repository or remote
    Precondition,
    /// Stop, backup or start failure for one directory
    PerDirectory,
    /// Verification or retention failure, logged only
    Advisory,
    /// Lock or PID file contention
    Concurrency,
    /// External command exceeded its budget
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Precondition => "precondition failed",
            ErrorKind::PerDirectory => "directory failed",
            ErrorKind::Advisory => "advisory",
            ErrorKind::Concurrency => "concurrency error",
            ErrorKind::Timeout => "timeout",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}", humantime::format_duration(*timeout))]
    TimedOut {
        program: String,
        timeout: Duration,
        result: Box<CommandResult>,
    },

    #[error("{program} exited with code {code}: {stderr}")]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::TimedOut { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_timeout() {
            ErrorKind::Timeout
        } else {
            ErrorKind::PerDirectory
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {} waiting for lock {}", humantime::format_duration(*timeout), path.display())]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("another instance is running (pid {pid}, pid file {})", path.display())]
    AlreadyRunning { pid: i32, path: PathBuf },

    #[error("lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum DirListError {
    #[error("invalid directory name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid external path '{}': {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: &'static str },

    #[error("directory '{0}' is not in the directory list")]
    UnknownEntry(String),

    #[error("'{0}' is a discovered directory and cannot be removed manually")]
    NotExternal(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StackError {
    #[error("stack '{dir}' did not stop after {attempts} verification attempts")]
    DidNotStop { dir: String, attempts: u32 },

    #[error("{action} failed for stack '{dir}': {source}")]
    Command {
        dir: String,
        action: &'static str,
        #[source]
        source: CommandError,
    },

    #[error("container tool unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup engine '{0}' not found in PATH")]
    EngineMissing(String),

    #[error("cannot access repository: {0}")]
    RepositoryAccess(String),

    #[error("credential setup failed: {0}")]
    Credentials(String),

    #[error("no snapshot found for tag '{0}'")]
    SnapshotNotFound(String),

    #[error("{operation} failed: {detail}")]
    Failed {
        operation: &'static str,
        detail: String,
    },

    #[error("failed to parse engine output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("sync tool '{0}' not found in PATH")]
    ToolMissing(String),

    #[error("remote '{remote}' is unreachable: {detail}")]
    Unreachable { remote: String, detail: String },

    #[error("target directory {} is not empty (use --force to overwrite)", .0.display())]
    TargetNotEmpty(PathBuf),

    #[error("target directory {} is not writable: {source}", path.display())]
    NotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source {} does not exist", .0.display())]
    SourceMissing(PathBuf),

    #[error("{operation} failed after {attempts} attempt(s): {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        last: Box<CommandError>,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {} not found", .0.display())]
    NotFound(PathBuf),

    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Fatal error that stops the pipeline
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        Self::new(ErrorKind::Configuration, err.to_string())
    }
}

impl From<LockError> for PipelineError {
    fn from(err: LockError) -> Self {
        let kind = match err {
            LockError::Io { .. } => ErrorKind::Precondition,
            _ => ErrorKind::Concurrency,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<DirListError> for PipelineError {
    fn from(err: DirListError) -> Self {
        let kind = match err {
            DirListError::Lock(_) => ErrorKind::Concurrency,
            _ => ErrorKind::Precondition,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<StackError> for PipelineError {
    fn from(err: StackError) -> Self {
        Self::new(ErrorKind::Precondition, err.to_string())
    }
}

impl From<BackupError> for PipelineError {
    fn from(err: BackupError) -> Self {
        let kind = match &err {
            BackupError::Credentials(_) => ErrorKind::Configuration,
            BackupError::Command(e) if e.is_timeout() => ErrorKind::Timeout,
            _ => ErrorKind::Precondition,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<CloudError> for PipelineError {
    fn from(err: CloudError) -> Self {
        let kind = match &err {
            CloudError::Exhausted { last, .. } if last.is_timeout() => ErrorKind::Timeout,
            _ => ErrorKind::Precondition,
        };
        Self::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_errors_map_to_concurrency() {
        let err = LockError::AlreadyRunning {
            pid: 42,
            path: PathBuf::from("/run/backup.pid"),
        };
        let pipeline: PipelineError = err.into();
        assert_eq!(pipeline.kind, ErrorKind::Concurrency);
        assert!(pipeline.message.contains("pid 42"));
    }

    #[test]
    fn test_timeout_is_distinct_from_failure() {
        let timed_out = CommandError::TimedOut {
            program: "restic".into(),
            timeout: Duration::from_secs(5),
            result: Box::default(),
        };
        let failed = CommandError::Failed {
            program: "restic".into(),
            code: 1,
            stderr: "boom".into(),
        };
        assert_eq!(timed_out.kind(), ErrorKind::Timeout);
        assert_eq!(failed.kind(), ErrorKind::PerDirectory);
        assert!(timed_out.to_string().contains("timed out after 5s"));
    }
}
