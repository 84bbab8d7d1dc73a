/// Rclone cloud transfer wrapper
///
/// Uploads the backup repository to a remote and pulls it back down. Both
/// directions share one retry loop: attempt `n` failing waits `n * delay`
/// before the next one.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::command::{self, CommandOptions, OutputSink, TracingSink};
use crate::core::error::{CloudError, CommandError};
use crate::utils::constants::{
    CONNECTIVITY_PROBE_TIMEOUT, REPOSITORY_MARKERS, TRANSFER_RETRY_DELAY, WRITE_PROBE_FILE,
};
use crate::utils::helpers::format_bytes;

#[derive(Debug, Clone)]
pub struct RcloneSettings {
    /// Remote spec, e.g. `b2:my-bucket`
    pub remote: String,
    /// Path below the remote
    pub path: String,
    pub transfers: u32,
    pub bandwidth_limit: Option<String>,
    pub retries: u32,
    pub transfer_timeout: Duration,
    pub dry_run: bool,
}

/// What landed in the target directory after a restore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub files: u64,
    pub bytes: u64,
    pub looks_like_repository: bool,
}

pub struct Rclone {
    binary: String,
    settings: RcloneSettings,
    retry_delay: Duration,
    sink: Arc<dyn OutputSink>,
}

impl Rclone {
    pub fn new(settings: RcloneSettings) -> Self {
        Self {
            binary: "rclone".to_string(),
            settings,
            retry_delay: TRANSFER_RETRY_DELAY,
            sink: Arc::new(TracingSink::new("rclone")),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Full remote destination, `remote:path`
    pub fn destination(&self) -> String {
        let path = self.settings.path.trim_matches('/');
        let remote = &self.settings.remote;
        if path.is_empty() {
            remote.clone()
        } else if remote.ends_with(':') {
            format!("{}{}", remote, path)
        } else {
            format!("{}/{}", remote.trim_end_matches('/'), path)
        }
    }

    /// Short listing of the remote root. Fails fast when the remote is unusable.
    pub async fn test_connectivity(&self) -> Result<(), CloudError> {
        if command::find_in_path(&self.binary).is_none() {
            return Err(CloudError::ToolMissing(self.binary.clone()));
        }

        let options = CommandOptions::captured().timeout(CONNECTIVITY_PROBE_TIMEOUT);
        let args = ["lsd", self.settings.remote.as_str(), "--max-depth", "1"];
        let unreachable = |detail: String| CloudError::Unreachable {
            remote: self.settings.remote.clone(),
            detail,
        };

        let result = command::run(&self.binary, &args, &options)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        if !result.is_success() {
            return Err(unreachable(result.stderr_tail(2)));
        }

        debug!(remote = %self.settings.remote, "Remote reachable");
        Ok(())
    }

    /// Upload `source` to the remote, mirroring it
    pub async fn sync(&self, source: &Path) -> Result<(), CloudError> {
        if !source.is_dir() {
            return Err(CloudError::SourceMissing(source.to_path_buf()));
        }
        self.test_connectivity().await?;

        let destination = self.destination();
        info!(source = %source.display(), %destination, "Uploading repository");
        self.transfer("sync", "upload", &source.to_string_lossy(), &destination)
            .await?;
        info!(%destination, "Upload complete");
        Ok(())
    }

    /// Download the remote copy into `target`
    pub async fn restore(&self, target: &Path, force: bool) -> Result<RestoreReport, CloudError> {
        self.test_connectivity().await?;
        prepare_target(target, force, self.settings.dry_run)?;

        let source = self.destination();
        info!(%source, target = %target.display(), "Restoring repository from remote");
        self.transfer("copy", "restore", &source, &target.to_string_lossy())
            .await?;

        if self.settings.dry_run {
            return Ok(RestoreReport::default());
        }

        let report = inspect_restore(target)?;
        info!(
            files = report.files,
            size = %format_bytes(report.bytes),
            "Restore complete"
        );
        if !report.looks_like_repository {
            warn!(
                target = %target.display(),
                "Restored data does not look like a restic repository"
            );
        }
        Ok(report)
    }

    fn transfer_args(&self, verb: &str, from: &str, to: &str) -> Vec<String> {
        let mut args = vec![
            verb.to_string(),
            from.to_string(),
            to.to_string(),
            "--progress".to_string(),
            "--verbose".to_string(),
            "--links".to_string(),
            "--transfers".to_string(),
            self.settings.transfers.max(1).to_string(),
        ];
        if let Some(limit) = &self.settings.bandwidth_limit {
            args.push("--bwlimit".into());
            args.push(limit.clone());
        }
        if self.settings.dry_run {
            args.push("--dry-run".into());
        }
        args
    }

    async fn transfer(
        &self,
        verb: &str,
        operation: &'static str,
        from: &str,
        to: &str,
    ) -> Result<(), CloudError> {
        let args = self.transfer_args(verb, from, to);
        let options = CommandOptions::captured()
            .timeout(self.settings.transfer_timeout)
            .streamed(Arc::clone(&self.sink));
        let attempts = self.settings.retries.max(1);

        let mut last_error = None;
        for attempt in 1..=attempts {
            let outcome = match command::run(&self.binary, &args, &options).await {
                Ok(result) if result.is_success() => return Ok(()),
                Ok(result) => CommandError::Failed {
                    program: self.binary.clone(),
                    code: result.exit_code,
                    stderr: result.stderr_tail(3),
                },
                Err(e) => e,
            };

            warn!(operation, attempt, attempts, error = %outcome, "Transfer attempt failed");
            last_error = Some(outcome);

            if attempt < attempts {
                let delay = self.retry_delay * attempt;
                info!(delay = %humantime::format_duration(delay), "Retrying transfer");
                tokio::time::sleep(delay).await;
            }
        }

        Err(CloudError::Exhausted {
            operation,
            attempts,
            last: Box::new(last_error.unwrap_or(CommandError::Failed {
                program: self.binary.clone(),
                code: command::EXIT_UNKNOWN,
                stderr: String::new(),
            })),
        })
    }
}

/// Refuse non-empty targets unless forced, and prove the target is writable.
/// A dry run only checks an existing target and leaves the filesystem alone.
fn prepare_target(target: &Path, force: bool, dry_run: bool) -> Result<(), CloudError> {
    if dry_run {
        if target.is_dir() {
            ensure_empty(target, force)?;
        }
        return Ok(());
    }

    fs::create_dir_all(target).map_err(|source| CloudError::Io {
        path: target.to_path_buf(),
        source,
    })?;
    ensure_empty(target, force)?;

    let probe = target.join(WRITE_PROBE_FILE);
    fs::write(&probe, b"probe").map_err(|source| CloudError::NotWritable {
        path: target.to_path_buf(),
        source,
    })?;
    fs::remove_file(&probe).map_err(|source| CloudError::NotWritable {
        path: target.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn ensure_empty(target: &Path, force: bool) -> Result<(), CloudError> {
    let mut listing = fs::read_dir(target).map_err(|source| CloudError::Io {
        path: target.to_path_buf(),
        source,
    })?;
    if listing.next().is_some() {
        if !force {
            return Err(CloudError::TargetNotEmpty(target.to_path_buf()));
        }
        warn!(target = %target.display(), "Target is not empty, overwriting (forced)");
    }
    Ok(())
}

fn inspect_restore(target: &Path) -> Result<RestoreReport, CloudError> {
    let (files, bytes) = tally(target).map_err(|source| CloudError::Io {
        path: target.to_path_buf(),
        source,
    })?;
    let looks_like_repository = REPOSITORY_MARKERS
        .iter()
        .all(|marker| target.join(marker).exists());

    Ok(RestoreReport {
        files,
        bytes,
        looks_like_repository,
    })
}

/// Count regular files and their total size below `dir`
fn tally(dir: &Path) -> std::io::Result<(u64, u64)> {
    let mut files = 0;
    let mut bytes = 0;
    let mut pending: Vec<PathBuf> = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files += 1;
                bytes += entry.metadata()?.len();
            }
        }
    }

    Ok((files, bytes))
}
