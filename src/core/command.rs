/// External command execution
///
/// Every external tool (docker, restic, rclone) goes through `run`. The child
/// is placed in its own process group so that a timeout can take down the
/// helpers it spawned along with it.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::error::CommandError;

/// Exit code reported when the real one is unavailable: the process could
/// not be started, was killed by a signal, or timed out.
pub const EXIT_UNKNOWN: i32 = -1;

/// How long output readers may keep draining once the child is gone
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Ceiling for reaping a child after the kill signal was sent
const REAP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Receives live output lines from a running command
pub trait OutputSink: Send + Sync {
    fn line(&self, stream: StreamKind, line: &str);
}

/// Forwards command output to the log
pub struct TracingSink {
    label: String,
}

impl TracingSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl OutputSink for TracingSink {
    fn line(&self, stream: StreamKind, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match stream {
            StreamKind::Stdout => info!(tool = %self.label, "{}", line),
            StreamKind::Stderr => debug!(tool = %self.label, stream = "stderr", "{}", line),
        }
    }
}

/// Options for a single command invocation
#[derive(Clone, Default)]
pub struct CommandOptions {
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Zero means unbounded
    pub timeout: Duration,
    pub stdin: Option<Vec<u8>>,
    pub capture_stdout: bool,
    pub capture_stderr: bool,
    pub stream_stdout: bool,
    pub stream_stderr: bool,
    pub sink: Option<Arc<dyn OutputSink>>,
}

impl CommandOptions {
    /// Capture both stdout and stderr
    pub fn captured() -> Self {
        Self {
            capture_stdout: true,
            capture_stderr: true,
            ..Default::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend_from_slice(vars);
        self
    }

    pub fn input(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Stream both stdout and stderr to `sink`, in addition to any capture
    pub fn streamed(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.stream_stdout = true;
        self.stream_stderr = true;
        self.sink = Some(sink);
        self
    }

    fn wants(&self, stream: StreamKind) -> bool {
        match stream {
            StreamKind::Stdout => self.capture_stdout || self.stream_stdout,
            StreamKind::Stderr => self.capture_stderr || self.stream_stderr,
        }
    }

    fn sink_for(&self, stream: StreamKind) -> Option<Arc<dyn OutputSink>> {
        let enabled = match stream {
            StreamKind::Stdout => self.stream_stdout,
            StreamKind::Stderr => self.stream_stderr,
        };
        if enabled {
            self.sink.clone()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr lines, for error messages
    pub fn stderr_tail(&self, lines: usize) -> String {
        let tail: Vec<&str> = self
            .stderr
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        let start = tail.len().saturating_sub(lines);
        tail[start..].join("; ")
    }
}

/// Run `program` with `args` and wait for it.
///
/// A non-zero exit is not an error here, callers inspect the result. A
/// timeout always returns `CommandError::TimedOut`, after the whole process
/// group has been killed.
pub async fn run<S: AsRef<OsStr>>(
    program: &str,
    args: &[S],
    options: &CommandOptions,
) -> Result<CommandResult, CommandError> {
    let started = Instant::now();

    debug!(
        program,
        args = ?args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()).collect::<Vec<_>>(),
        dir = ?options.working_dir,
        "Running command"
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(pipe_if(options.stdin.is_some()))
        .stdout(pipe_if(options.wants(StreamKind::Stdout)))
        .stderr(pipe_if(options.wants(StreamKind::Stderr)));

    if let Some(dir) = &options.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &options.env {
        cmd.env(key, value);
    }

    // New process group with the child as leader, so killpg reaches every
    // descendant that did not detach on its own
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
        program: program.to_string(),
        source,
    })?;

    if let Some(input) = options.stdin.clone() {
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(error = %e, "Failed to write command stdin");
                }
            });
        }
    }

    let stdout = child.stdout.take().map(|out| {
        OutputReader::spawn(
            out,
            StreamKind::Stdout,
            options.capture_stdout,
            options.sink_for(StreamKind::Stdout),
        )
    });
    let stderr = child.stderr.take().map(|err| {
        OutputReader::spawn(
            err,
            StreamKind::Stderr,
            options.capture_stderr,
            options.sink_for(StreamKind::Stderr),
        )
    });

    let waited = if options.timeout.is_zero() {
        Some(child.wait().await)
    } else {
        tokio::time::timeout(options.timeout, child.wait()).await.ok()
    };

    let (exit_code, timed_out) = match waited {
        Some(Ok(status)) => (status.code().unwrap_or(EXIT_UNKNOWN), false),
        Some(Err(source)) => {
            return Err(CommandError::Io {
                program: program.to_string(),
                source,
            })
        }
        None => {
            warn!(
                program,
                timeout = %humantime::format_duration(options.timeout),
                "Command timed out, killing process group"
            );
            terminate_tree(&mut child).await;
            (EXIT_UNKNOWN, true)
        }
    };

    let result = CommandResult {
        exit_code,
        stdout: OutputReader::finish(stdout).await,
        stderr: OutputReader::finish(stderr).await,
        duration: started.elapsed(),
        timed_out,
    };

    debug!(program, exit_code, elapsed = ?result.duration, "Command finished");

    if timed_out {
        return Err(CommandError::TimedOut {
            program: program.to_string(),
            timeout: options.timeout,
            result: Box::new(result),
        });
    }

    Ok(result)
}

/// Like `run`, but a non-zero exit becomes `CommandError::Failed`
pub async fn run_checked<S: AsRef<OsStr>>(
    program: &str,
    args: &[S],
    options: &CommandOptions,
) -> Result<CommandResult, CommandError> {
    let result = run(program, args, options).await?;
    if !result.is_success() {
        return Err(CommandError::Failed {
            program: program.to_string(),
            code: result.exit_code,
            stderr: result.stderr_tail(3),
        });
    }
    Ok(result)
}

/// Locate an executable the way the shell would
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn pipe_if(wanted: bool) -> Stdio {
    if wanted {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

/// Kill the child and everything in its process group, then reap it
#[cfg(unix)]
async fn terminate_tree(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!(pid, error = %e, "Failed to kill process group");
        }
    }
    // Covers the case where the group is already gone but the child is not
    let _ = child.start_kill();
    if tokio::time::timeout(REAP_GRACE, child.wait()).await.is_err() {
        warn!("Child did not exit after SIGKILL");
    }
}

/// Without process groups, walk the tree with taskkill
#[cfg(not(unix))]
async fn terminate_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
    let _ = child.start_kill();
    if tokio::time::timeout(REAP_GRACE, child.wait()).await.is_err() {
        warn!("Child did not exit after kill");
    }
}

/// Background task draining one output pipe
struct OutputReader {
    buffer: Arc<Mutex<String>>,
    task: JoinHandle<()>,
}

impl OutputReader {
    fn spawn<R>(
        reader: R,
        stream: StreamKind,
        capture: bool,
        sink: Option<Arc<dyn OutputSink>>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(String::new()));
        let shared = Arc::clone(&buffer);

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&raw);
                        let line = line.trim_end_matches(['\n', '\r']);
                        if let Some(sink) = &sink {
                            sink.line(stream, line);
                        }
                        if capture {
                            if let Ok(mut buf) = shared.lock() {
                                buf.push_str(line);
                                buf.push('\n');
                            }
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "Output reader stopped");
                        break;
                    }
                }
            }
        });

        Self { buffer, task }
    }

    /// Wait for the pipe to close (bounded) and return what was captured
    async fn finish(reader: Option<Self>) -> String {
        let Some(mut reader) = reader else {
            return String::new();
        };
        if tokio::time::timeout(DRAIN_GRACE, &mut reader.task).await.is_err() {
            debug!("Output pipe still open after child exit, abandoning reader");
            reader.task.abort();
        }
        reader
            .buffer
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<(StreamKind, String)>>,
    }

    impl OutputSink for RecordingSink {
        fn line(&self, stream: StreamKind, line: &str) {
            self.lines.lock().unwrap().push((stream, line.to_string()));
        }
    }

    fn pid_alive(pid: i32) -> bool {
        // Zombies count as dead: they hold no resources besides the slot
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => {
                let state = stat
                    .rsplit_once(')')
                    .and_then(|(_, rest)| rest.split_whitespace().next())
                    .unwrap_or("");
                state != "Z" && state != "X"
            }
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let result = run(
            "sh",
            &["-c", "echo out; echo err >&2; exit 3"],
            &CommandOptions::captured(),
        )
        .await
        .unwrap();

        assert_eq!(result.exit_code, 3);
        assert!(!result.is_success());
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_stream_and_capture_combine() {
        let sink = Arc::new(RecordingSink::default());
        let options = CommandOptions::captured().streamed(sink.clone());

        let result = run("sh", &["-c", "echo one; echo two"], &options)
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.stdout, "one\ntwo\n");
        let lines = sink.lines.lock().unwrap();
        assert_eq!(
            *lines,
            vec![
                (StreamKind::Stdout, "one".to_string()),
                (StreamKind::Stdout, "two".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_working_dir_env_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let options = CommandOptions::captured()
            .dir(dir.path())
            .env("GREETING", "hello")
            .input("piped\n");

        let result = run("sh", &["-c", "pwd; echo $GREETING; cat"], &options)
            .await
            .unwrap();

        let lines: Vec<&str> = result.stdout.lines().collect();
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(Path::new(lines[0]).canonicalize().unwrap(), canonical);
        assert_eq!(lines[1], "hello");
        assert_eq!(lines[2], "piped");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let err = run(
            "/nonexistent/definitely-not-a-tool",
            &["x"],
            &CommandOptions::captured(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_run_checked_maps_nonzero_exit() {
        let err = run_checked("sh", &["-c", "echo nope >&2; exit 7"], &CommandOptions::captured())
            .await
            .unwrap_err();
        match err {
            CommandError::Failed { code, stderr, .. } => {
                assert_eq!(code, 7);
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_whole_process_group() {
        // The grandchild ignores SIGTERM and would outlive a plain kill of sh
        let script = "trap '' TERM; sleep 60 & echo $!; wait";
        let options = CommandOptions::captured().timeout(Duration::from_millis(500));

        let started = Instant::now();
        let err = run("sh", &["-c", script], &options).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(20));

        let result = match err {
            CommandError::TimedOut { result, .. } => result,
            other => panic!("expected timeout, got {other}"),
        };
        assert!(result.timed_out);
        assert_eq!(result.exit_code, EXIT_UNKNOWN);
        assert!(!result.is_success());

        let grandchild: i32 = result.stdout.trim().parse().unwrap();
        let mut alive = true;
        for _ in 0..50 {
            if !pid_alive(grandchild) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!alive, "grandchild {} survived the timeout", grandchild);
    }

    #[test]
    fn test_find_in_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-tool-xyz").is_none());
    }

    #[test]
    fn test_stderr_tail() {
        let result = CommandResult {
            stderr: "a\n\nb\nc\n".into(),
            ..Default::default()
        };
        assert_eq!(result.stderr_tail(2), "b; c");
    }
}
