/// Restic backup engine wrapper
///
/// Creates, verifies, lists and prunes snapshots by invoking `restic`.
/// Repository location and credentials travel through environment variables;
/// an inline password is written to an owner-only temporary file and passed
/// by path so it never shows up in the process table.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::core::command::{self, CommandOptions, CommandResult, OutputSink, TracingSink};
use crate::core::error::BackupError;
use crate::utils::constants::{BACKUP_TAG, REPOSITORY_PROBE_TIMEOUT, SELECTIVE_BACKUP_TAG};

/// Where restic gets the repository password from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordSource {
    Inline(String),
    File(PathBuf),
    Command(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyDepth {
    /// List the snapshot tree
    #[default]
    Metadata,
    /// List every file with its metadata
    Files,
    /// Read back and check all pack data
    Data,
}

/// Keep counts for forget/prune. Zero means "not set".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    pub keep_yearly: u32,
}

impl RetentionPolicy {
    pub fn is_empty(&self) -> bool {
        self.keep_daily == 0 && self.keep_weekly == 0 && self.keep_monthly == 0 && self.keep_yearly == 0
    }

    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (flag, count) in [
            ("--keep-daily", self.keep_daily),
            ("--keep-weekly", self.keep_weekly),
            ("--keep-monthly", self.keep_monthly),
            ("--keep-yearly", self.keep_yearly),
        ] {
            if count > 0 {
                args.push(flag.to_string());
                args.push(count.to_string());
            }
        }
        args
    }
}

#[derive(Debug, Clone)]
pub struct ResticSettings {
    pub repository: String,
    pub password: PasswordSource,
    pub verify: bool,
    pub verify_depth: VerifyDepth,
    pub auto_prune: bool,
    pub retention: RetentionPolicy,
    pub backup_timeout: Duration,
    pub dry_run: bool,
}

/// Snapshot metadata as reported by `restic snapshots --json`
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: Option<String>,
    pub time: DateTime<FixedOffset>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl Snapshot {
    pub fn short(&self) -> &str {
        match &self.short_id {
            Some(short) => short,
            None => &self.id[..self.id.len().min(8)],
        }
    }
}

/// What a restore of the latest snapshot for a tag would bring back
#[derive(Debug, Clone)]
pub struct RestorePreview {
    pub snapshot: Snapshot,
    pub files: u64,
    pub directories: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Done,
    Skipped(&'static str),
}

/// Snapshot engine operations used by the pipeline
#[allow(async_fn_in_trait)]
pub trait SnapshotEngine {
    /// Preflight: engine present and repository readable
    async fn check_repository(&self) -> Result<(), BackupError>;

    async fn backup(&self, path: &Path, tag: &str, hostname: Option<&str>) -> Result<(), BackupError>;

    async fn verify(&self, tag: &str) -> Result<StepOutcome, BackupError>;

    async fn apply_retention(&self, tag: &str, hostname: Option<&str>) -> Result<StepOutcome, BackupError>;

    /// Release credential material. Called on every exit path.
    fn cleanup(&mut self);
}

pub struct Restic {
    binary: String,
    settings: ResticSettings,
    /// Owner-only copy of an inline password, removed on cleanup or drop
    password_file: Option<NamedTempFile>,
    sink: Arc<dyn OutputSink>,
}

impl Restic {
    pub fn new(settings: ResticSettings) -> Result<Self, BackupError> {
        let password_file = match &settings.password {
            PasswordSource::Inline(password) => Some(write_password_file(password)?),
            PasswordSource::File(path) => {
                if !path.is_file() {
                    return Err(BackupError::Credentials(format!(
                        "password file {} does not exist",
                        path.display()
                    )));
                }
                None
            }
            PasswordSource::Command(cmd) => {
                if cmd.trim().is_empty() {
                    return Err(BackupError::Credentials("password command is empty".into()));
                }
                None
            }
        };

        Ok(Self {
            binary: "restic".to_string(),
            settings,
            password_file,
            sink: Arc::new(TracingSink::new("restic")),
        })
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn settings(&self) -> &ResticSettings {
        &self.settings
    }

    /// Environment handed to every restic invocation
    fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![(
            "RESTIC_REPOSITORY".to_string(),
            self.settings.repository.clone(),
        )];
        match (&self.settings.password, &self.password_file) {
            (PasswordSource::Inline(_), Some(file)) => env.push((
                "RESTIC_PASSWORD_FILE".to_string(),
                file.path().to_string_lossy().into_owned(),
            )),
            (PasswordSource::File(path), _) => env.push((
                "RESTIC_PASSWORD_FILE".to_string(),
                path.to_string_lossy().into_owned(),
            )),
            (PasswordSource::Command(cmd), _) => {
                env.push(("RESTIC_PASSWORD_COMMAND".to_string(), cmd.clone()))
            }
            // Credentials already released
            (PasswordSource::Inline(_), None) => {}
        }
        env
    }

    fn options(&self, timeout: Duration) -> CommandOptions {
        CommandOptions::captured().envs(&self.env()).timeout(timeout)
    }

    async fn restic(&self, args: &[String], timeout: Duration) -> Result<CommandResult, BackupError> {
        Ok(command::run(&self.binary, args, &self.options(timeout)).await?)
    }

    async fn restic_streamed(
        &self,
        operation: &'static str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandResult, BackupError> {
        let options = self.options(timeout).streamed(Arc::clone(&self.sink));
        let result = command::run(&self.binary, args, &options).await?;
        if !result.is_success() {
            return Err(BackupError::Failed {
                operation,
                detail: failure_detail(&result),
            });
        }
        Ok(result)
    }

    /// Create the repository unless it already exists. Returns true if created.
    pub async fn init_repository(&self) -> Result<bool, BackupError> {
        self.ensure_binary()?;
        let probe = self
            .restic(&strings(&["cat", "config"]), REPOSITORY_PROBE_TIMEOUT)
            .await?;
        if probe.is_success() {
            info!("Repository already initialized");
            return Ok(false);
        }

        if self.settings.dry_run {
            info!(repository = %self.settings.repository, "[dry-run] would initialize repository");
            return Ok(false);
        }

        self.restic_streamed("init", &strings(&["init"]), REPOSITORY_PROBE_TIMEOUT)
            .await?;
        info!(repository = %self.settings.repository, "Repository initialized");
        Ok(true)
    }

    fn ensure_binary(&self) -> Result<(), BackupError> {
        command::find_in_path(&self.binary)
            .map(|path| debug!(path = %path.display(), "Found restic"))
            .ok_or_else(|| BackupError::EngineMissing(self.binary.clone()))
    }

    /// Snapshots, newest first, optionally filtered by tag and capped at `limit`
    pub async fn list_snapshots(&self, tag: Option<&str>, limit: usize) -> Result<Vec<Snapshot>, BackupError> {
        let mut args = strings(&["snapshots", "--json"]);
        if let Some(tag) = tag {
            args.push("--tag".into());
            args.push(tag.to_string());
        }
        if limit > 0 {
            args.push("--latest".into());
            args.push(limit.to_string());
        }

        let result = self.restic(&args, REPOSITORY_PROBE_TIMEOUT).await?;
        if !result.is_success() {
            return Err(BackupError::Failed {
                operation: "snapshot listing",
                detail: failure_detail(&result),
            });
        }

        let mut snapshots = parse_snapshots(&result.stdout)?;
        snapshots.sort_by(|a, b| b.time.cmp(&a.time));
        if limit > 0 {
            snapshots.truncate(limit);
        }
        Ok(snapshots)
    }

    pub async fn latest_snapshot(&self, tag: &str) -> Result<Snapshot, BackupError> {
        self.list_snapshots(Some(tag), 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackupError::SnapshotNotFound(tag.to_string()))
    }

    /// Summarize what restoring the latest snapshot for `tag` would produce
    pub async fn restore_preview(&self, tag: &str) -> Result<Option<RestorePreview>, BackupError> {
        let snapshot = match self.latest_snapshot(tag).await {
            Ok(snapshot) => snapshot,
            Err(BackupError::SnapshotNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let args = strings(&["ls", "--json", &snapshot.id]);
        let result = self.restic(&args, self.settings.backup_timeout).await?;
        if !result.is_success() {
            return Err(BackupError::Failed {
                operation: "snapshot listing",
                detail: failure_detail(&result),
            });
        }

        let (files, directories, total_bytes) = count_nodes(&result.stdout);
        Ok(Some(RestorePreview {
            snapshot,
            files,
            directories,
            total_bytes,
        }))
    }
}

impl SnapshotEngine for Restic {
    async fn check_repository(&self) -> Result<(), BackupError> {
        self.ensure_binary()
            .map_err(|e| BackupError::RepositoryAccess(e.to_string()))?;
        let result = self
            .restic(&strings(&["list", "keys", "--quiet"]), REPOSITORY_PROBE_TIMEOUT)
            .await
            .map_err(|e| BackupError::RepositoryAccess(e.to_string()))?;
        if !result.is_success() {
            return Err(BackupError::RepositoryAccess(failure_detail(&result)));
        }
        debug!(repository = %self.settings.repository, "Repository accessible");
        Ok(())
    }

    async fn backup(&self, path: &Path, tag: &str, hostname: Option<&str>) -> Result<(), BackupError> {
        let date = Local::now().format("%Y-%m-%d").to_string();
        let mut args = vec!["backup".to_string(), path.to_string_lossy().into_owned()];
        for t in [BACKUP_TAG, SELECTIVE_BACKUP_TAG, tag, date.as_str()] {
            args.push("--tag".into());
            args.push(t.to_string());
        }
        if let Some(host) = hostname {
            args.push("--host".into());
            args.push(host.to_string());
        }

        if self.settings.dry_run {
            info!(dir = tag, path = %path.display(), "[dry-run] would run: restic {}", args.join(" "));
            return Ok(());
        }

        info!(dir = tag, path = %path.display(), "Creating snapshot");
        let result = self
            .restic_streamed("backup", &args, self.settings.backup_timeout)
            .await?;
        info!(dir = tag, elapsed = ?result.duration, "Snapshot created");
        Ok(())
    }

    async fn verify(&self, tag: &str) -> Result<StepOutcome, BackupError> {
        if !self.settings.verify {
            return Ok(StepOutcome::Skipped("verification disabled"));
        }
        if self.settings.dry_run {
            info!(dir = tag, "[dry-run] would verify latest snapshot");
            return Ok(StepOutcome::Skipped("dry run"));
        }

        let snapshot = self.latest_snapshot(tag).await?;
        info!(dir = tag, snapshot = snapshot.short(), depth = ?self.settings.verify_depth, "Verifying snapshot");

        let args = match self.settings.verify_depth {
            VerifyDepth::Metadata => strings(&["ls", &snapshot.id]),
            VerifyDepth::Files => strings(&["ls", "--long", &snapshot.id]),
            VerifyDepth::Data => strings(&["check", "--read-data"]),
        };
        let result = self.restic(&args, self.settings.backup_timeout).await?;
        if !result.is_success() {
            return Err(BackupError::Failed {
                operation: "verification",
                detail: failure_detail(&result),
            });
        }

        info!(dir = tag, snapshot = snapshot.short(), "Snapshot verified");
        Ok(StepOutcome::Done)
    }

    async fn apply_retention(&self, tag: &str, hostname: Option<&str>) -> Result<StepOutcome, BackupError> {
        if !self.settings.auto_prune {
            warn!(dir = tag, "Auto-prune disabled, skipping retention");
            return Ok(StepOutcome::Skipped("auto-prune disabled"));
        }
        if self.settings.retention.is_empty() {
            warn!(dir = tag, "Auto-prune enabled but no keep counts configured, skipping retention");
            return Ok(StepOutcome::Skipped("no keep counts"));
        }

        let mut args = strings(&["forget", "--tag", tag]);
        if let Some(host) = hostname {
            args.push("--host".into());
            args.push(host.to_string());
        }
        args.extend(self.settings.retention.args());
        args.push("--prune".into());

        if self.settings.dry_run {
            info!(dir = tag, "[dry-run] would run: restic {}", args.join(" "));
            return Ok(StepOutcome::Skipped("dry run"));
        }

        info!(dir = tag, "Applying retention policy");
        self.restic_streamed("retention", &args, self.settings.backup_timeout)
            .await?;
        Ok(StepOutcome::Done)
    }

    fn cleanup(&mut self) {
        if let Some(file) = self.password_file.take() {
            let path = file.path().to_path_buf();
            match file.close() {
                Ok(()) => debug!(path = %path.display(), "Removed temporary password file"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary password file"),
            }
        }
    }
}

fn write_password_file(password: &str) -> Result<NamedTempFile, BackupError> {
    let cred_err = |e: std::io::Error| BackupError::Credentials(e.to_string());

    let mut file = tempfile::Builder::new()
        .prefix(".restic-pass-")
        .tempfile()
        .map_err(cred_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
            .map_err(cred_err)?;
    }

    file.write_all(password.as_bytes()).map_err(cred_err)?;
    file.flush().map_err(cred_err)?;
    Ok(file)
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn failure_detail(result: &CommandResult) -> String {
    let tail = result.stderr_tail(3);
    if tail.is_empty() {
        format!("exit code {}", result.exit_code)
    } else {
        format!("exit code {}: {}", result.exit_code, tail)
    }
}

pub fn parse_snapshots(json: &str) -> Result<Vec<Snapshot>, BackupError> {
    let trimmed = json.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// Count file and directory nodes in `restic ls --json` output
fn count_nodes(output: &str) -> (u64, u64, u64) {
    let mut files = 0;
    let mut dirs = 0;
    let mut bytes = 0;

    for line in output.lines() {
        let Ok(node) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if node.get("struct_type").and_then(|v| v.as_str()) != Some("node") {
            continue;
        }
        match node.get("type").and_then(|v| v.as_str()) {
            Some("file") => {
                files += 1;
                bytes += node.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
            }
            Some("dir") => dirs += 1,
            _ => {}
        }
    }

    (files, dirs, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(password: PasswordSource) -> ResticSettings {
        ResticSettings {
            repository: "/srv/restic".into(),
            password,
            verify: true,
            verify_depth: VerifyDepth::Metadata,
            auto_prune: true,
            retention: RetentionPolicy {
                keep_daily: 7,
                keep_weekly: 4,
                ..Default::default()
            },
            backup_timeout: Duration::from_secs(30),
            dry_run: false,
        }
    }

    /// Fake restic that records its arguments and environment
    #[cfg(unix)]
    fn fake_restic(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("restic");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> \"{log}\"\necho \"PWFILE=$RESTIC_PASSWORD_FILE\" >> \"{log}\"\n{body}\n",
            log = dir.join("calls.log").display(),
            body = body
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_inline_password_goes_to_private_file() {
        let mut restic = Restic::new(settings(PasswordSource::Inline("s3cret".into()))).unwrap();
        let env = restic.env();

        assert!(env.iter().all(|(_, v)| v != "s3cret"));
        let (_, path) = env
            .iter()
            .find(|(k, _)| k == "RESTIC_PASSWORD_FILE")
            .unwrap();
        let path = PathBuf::from(path);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "s3cret");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        restic.cleanup();
        assert!(!path.exists());
        restic.cleanup();
    }

    #[test]
    fn test_missing_password_file_is_rejected() {
        let err = Restic::new(settings(PasswordSource::File("/nonexistent/pw".into())))
            .err()
            .unwrap();
        assert!(matches!(err, BackupError::Credentials(_)));
    }

    #[test]
    fn test_password_command_is_exported() {
        let restic = Restic::new(settings(PasswordSource::Command("pass show restic".into()))).unwrap();
        assert!(restic
            .env()
            .contains(&("RESTIC_PASSWORD_COMMAND".to_string(), "pass show restic".to_string())));
    }

    #[test]
    fn test_parse_snapshots() {
        let json = r#"[
            {"id":"4f1e2d3c4b5a69788796a5b4c3d2e1f04f1e2d3c4b5a69788796a5b4c3d2e1f0","time":"2026-10-14T02:00:01.123456789+02:00","hostname":"nas","tags":["docker-backup","webapp"],"paths":["/stacks/webapp"]},
            {"id":"aa","short_id":"aa","time":"2026-10-15T02:00:00Z","hostname":"nas","paths":["/stacks/cache"]}
        ]"#;
        let snapshots = parse_snapshots(json).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].short(), "4f1e2d3c");
        assert_eq!(snapshots[1].short(), "aa");
        assert!(snapshots[1].tags.is_empty());
        assert!(parse_snapshots("null").unwrap().is_empty());
    }

    #[test]
    fn test_count_nodes() {
        let output = concat!(
            "{\"struct_type\":\"snapshot\",\"id\":\"x\"}\n",
            "{\"struct_type\":\"node\",\"type\":\"dir\",\"path\":\"/a\"}\n",
            "{\"struct_type\":\"node\",\"type\":\"file\",\"path\":\"/a/b\",\"size\":10}\n",
            "{\"struct_type\":\"node\",\"type\":\"file\",\"path\":\"/a/c\",\"size\":32}\n",
        );
        assert_eq!(count_nodes(output), (2, 1, 42));
    }

    #[test]
    fn test_retention_args_skip_zero_counts() {
        let policy = RetentionPolicy {
            keep_daily: 7,
            keep_monthly: 6,
            ..Default::default()
        };
        assert_eq!(policy.args(), vec!["--keep-daily", "7", "--keep-monthly", "6"]);
        assert!(RetentionPolicy::default().is_empty());
    }

    #[tokio::test]
    async fn test_retention_without_keep_counts_is_noop() {
        let mut s = settings(PasswordSource::Command("true".into()));
        s.retention = RetentionPolicy::default();
        let restic = Restic::new(s).unwrap().with_binary("/nonexistent/restic");
        assert_eq!(
            restic.apply_retention("webapp", None).await.unwrap(),
            StepOutcome::Skipped("no keep counts")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_backup_invocation_carries_tags_and_host() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_restic(dir.path(), "exit 0");
        let restic = Restic::new(settings(PasswordSource::Inline("pw".into())))
            .unwrap()
            .with_binary(binary);

        restic
            .backup(Path::new("/stacks/webapp"), "webapp", Some("nas"))
            .await
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        let call = log.lines().next().unwrap();
        assert!(call.starts_with("backup /stacks/webapp --tag docker-backup --tag selective-backup --tag webapp --tag "));
        assert!(call.ends_with("--host nas"));
        assert!(log.contains("PWFILE=/"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dry_run_backup_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_restic(dir.path(), "exit 0");
        let mut s = settings(PasswordSource::Command("true".into()));
        s.dry_run = true;
        let restic = Restic::new(s).unwrap().with_binary(binary);

        restic.backup(Path::new("/stacks/webapp"), "webapp", None).await.unwrap();
        assert!(!dir.path().join("calls.log").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_backup_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_restic(dir.path(), "echo 'repository is locked' >&2; exit 1");
        let restic = Restic::new(settings(PasswordSource::Command("true".into())))
            .unwrap()
            .with_binary(binary);

        let err = restic
            .backup(Path::new("/stacks/webapp"), "webapp", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("repository is locked"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_verify_without_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_restic(dir.path(), "echo '[]'");
        let restic = Restic::new(settings(PasswordSource::Command("true".into())))
            .unwrap()
            .with_binary(binary);

        let err = restic.verify("webapp").await.unwrap_err();
        assert!(matches!(err, BackupError::SnapshotNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_retention_scoped_to_tag_and_host() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_restic(dir.path(), "exit 0");
        let restic = Restic::new(settings(PasswordSource::Command("true".into())))
            .unwrap()
            .with_binary(binary);

        let outcome = restic.apply_retention("webapp", Some("nas")).await.unwrap();
        assert_eq!(outcome, StepOutcome::Done);
        let log = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert!(log.starts_with(
            "forget --tag webapp --host nas --keep-daily 7 --keep-weekly 4 --prune"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_check_repository_requires_engine() {
        let restic = Restic::new(settings(PasswordSource::Command("true".into())))
            .unwrap()
            .with_binary("/nonexistent/restic");
        let err = restic.check_repository().await.unwrap_err();
        assert!(matches!(err, BackupError::RepositoryAccess(_)));
        assert_eq!(
            err.to_string(),
            "cannot access repository: backup engine '/nonexistent/restic' not found in PATH"
        );

        let dir = tempfile::tempdir().unwrap();
        let binary = fake_restic(dir.path(), "echo 'wrong password' >&2; exit 1");
        let restic = Restic::new(settings(PasswordSource::Command("true".into())))
            .unwrap()
            .with_binary(binary);
        let err = restic.check_repository().await.unwrap_err();
        assert!(matches!(err, BackupError::RepositoryAccess(_)));
        assert!(err.to_string().starts_with("cannot access repository"));
    }

    /// Answers `snapshots` with two entries out of time order, everything else succeeds
    #[cfg(unix)]
    const SNAPSHOT_LISTING: &str = concat!(
        "if [ \"$1\" = snapshots ]; then echo '[",
        "{\"id\":\"older1\",\"time\":\"2026-10-13T02:00:00Z\",\"hostname\":\"nas\",\"paths\":[\"/stacks/webapp\"]},",
        "{\"id\":\"newer2\",\"time\":\"2026-10-14T02:00:00Z\",\"hostname\":\"nas\",\"paths\":[\"/stacks/webapp\"]}",
        "]'; fi\nexit 0"
    );

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_snapshots_newest_first_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_restic(dir.path(), SNAPSHOT_LISTING);
        let restic = Restic::new(settings(PasswordSource::Command("true".into())))
            .unwrap()
            .with_binary(binary);

        let all = restic.list_snapshots(Some("webapp"), 0).await.unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["newer2", "older1"]);

        let capped = restic.list_snapshots(None, 1).await.unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, "newer2");

        let log = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        let calls: Vec<_> = log.lines().filter(|l| !l.starts_with("PWFILE=")).collect();
        assert_eq!(calls, vec!["snapshots --json --tag webapp", "snapshots --json --latest 1"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_verify_invocation_per_depth() {
        let cases = [
            (VerifyDepth::Metadata, "ls newer2"),
            (VerifyDepth::Files, "ls --long newer2"),
            (VerifyDepth::Data, "check --read-data"),
        ];

        for (depth, expected) in cases {
            let dir = tempfile::tempdir().unwrap();
            let binary = fake_restic(dir.path(), SNAPSHOT_LISTING);
            let mut s = settings(PasswordSource::Command("true".into()));
            s.verify_depth = depth;
            let restic = Restic::new(s).unwrap().with_binary(binary);

            assert_eq!(restic.verify("webapp").await.unwrap(), StepOutcome::Done);

            let log = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
            let calls: Vec<_> = log.lines().filter(|l| !l.starts_with("PWFILE=")).collect();
            assert_eq!(calls, vec!["snapshots --json --tag webapp --latest 1", expected]);
        }
    }
}
