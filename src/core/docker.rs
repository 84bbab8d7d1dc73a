/// Docker Compose stack lifecycle
///
/// `ComposeRuntime` talks to `docker compose` through the command layer.
/// `StackController` layers the state-aware stop/start rules on top: only a
/// stack that was running (or whose state could not be observed) is stopped
/// and later started again.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::command::{self, CommandOptions, OutputSink, TracingSink};
use crate::core::dirlist::find_manifest;
use crate::core::error::{CommandError, StackError};
use crate::utils::constants::{
    STOP_SETTLE_DELAY, STOP_TIMEOUT_BUFFER, STOP_VERIFY_ATTEMPTS, STOP_VERIFY_INTERVAL,
};

/// Observed state of a stack before the run touches it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    Running,
    Stopped,
    NotFound,
    /// The status probe failed
    Unknown,
}

impl StackState {
    /// Running and Unknown stacks are stopped before backup and started after
    pub fn needs_restart(&self) -> bool {
        matches!(self, StackState::Running | StackState::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StackState::Running => "running",
            StackState::Stopped => "stopped",
            StackState::NotFound => "not found",
            StackState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a lifecycle call ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Performed,
    Skipped,
}

/// Container runtime operations on one stack directory
#[allow(async_fn_in_trait)]
pub trait StackRuntime {
    /// Probe the stack. Never fails: an unusable probe reports `Unknown`.
    async fn status(&self, dir: &Path) -> StackState;

    async fn stop(&self, dir: &Path) -> Result<(), CommandError>;

    async fn start(&self, dir: &Path) -> Result<(), CommandError>;

    /// Preflight: is the container tool usable at all
    async fn check_available(&self) -> Result<(), StackError>;
}

/// `docker compose` runtime
pub struct ComposeRuntime {
    docker_bin: String,
    stop_timeout: Duration,
    start_timeout: Duration,
    status_timeout: Duration,
    sink: Arc<dyn OutputSink>,
}

impl ComposeRuntime {
    pub fn new(stop_timeout: Duration, start_timeout: Duration, status_timeout: Duration) -> Self {
        Self {
            docker_bin: "docker".to_string(),
            stop_timeout,
            start_timeout,
            status_timeout,
            sink: Arc::new(TracingSink::new("docker")),
        }
    }

    pub fn with_binary(mut self, docker_bin: impl Into<String>) -> Self {
        self.docker_bin = docker_bin.into();
        self
    }

    /// Execute a compose subcommand inside the stack directory
    async fn compose_command(
        &self,
        dir: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<command::CommandResult, CommandError> {
        let mut full = vec!["compose"];
        full.extend_from_slice(args);

        let options = CommandOptions::captured()
            .dir(dir)
            .timeout(timeout)
            .streamed(Arc::clone(&self.sink));
        command::run_checked(&self.docker_bin, &full, &options).await
    }
}

impl StackRuntime for ComposeRuntime {
    async fn status(&self, dir: &Path) -> StackState {
        if !dir.is_dir() || find_manifest(dir).is_none() {
            return StackState::NotFound;
        }

        let options = CommandOptions::captured()
            .dir(dir)
            .timeout(self.status_timeout);
        let args = ["compose", "ps", "--status", "running", "--quiet"];

        match command::run_checked(&self.docker_bin, &args, &options).await {
            Ok(result) => {
                let running = result
                    .stdout
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .count();
                debug!(dir = %dir.display(), running, "Stack status probed");
                if running > 0 {
                    StackState::Running
                } else {
                    StackState::Stopped
                }
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Status probe failed");
                StackState::Unknown
            }
        }
    }

    async fn stop(&self, dir: &Path) -> Result<(), CommandError> {
        let grace = self.stop_timeout.as_secs().to_string();
        // Leave compose time for a graceful shutdown before our own kill
        let ceiling = self.stop_timeout + STOP_TIMEOUT_BUFFER;
        self.compose_command(dir, &["stop", "--timeout", &grace], ceiling)
            .await
            .map(|_| ())
    }

    async fn start(&self, dir: &Path) -> Result<(), CommandError> {
        self.compose_command(dir, &["up", "-d"], self.start_timeout)
            .await
            .map(|_| ())
    }

    async fn check_available(&self) -> Result<(), StackError> {
        let options = CommandOptions::captured().timeout(self.status_timeout);
        command::run_checked(&self.docker_bin, &["compose", "version"], &options)
            .await
            .map(|result| debug!(version = %result.stdout.trim(), "docker compose available"))
            .map_err(|e| StackError::Unavailable(e.to_string()))
    }
}

/// Timing of the post-stop verification
#[derive(Debug, Clone, Copy)]
pub struct StopVerification {
    pub settle: Duration,
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for StopVerification {
    fn default() -> Self {
        Self {
            settle: STOP_SETTLE_DELAY,
            attempts: STOP_VERIFY_ATTEMPTS,
            interval: STOP_VERIFY_INTERVAL,
        }
    }
}

/// State-aware stop/start of stacks
pub struct StackController<R> {
    runtime: R,
    verification: StopVerification,
    dry_run: bool,
}

impl<R: StackRuntime> StackController<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            runtime,
            verification: StopVerification::default(),
            dry_run: false,
        }
    }

    /// Log stop/start instead of touching live stacks
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_verification(mut self, verification: StopVerification) -> Self {
        self.verification = verification;
        self
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub async fn probe(&self, dir: &Path) -> StackState {
        self.runtime.status(dir).await
    }

    /// Stop the stack if its pre-run state calls for it, then confirm it
    /// actually went down
    pub async fn stop(
        &self,
        id: &str,
        dir: &Path,
        state: StackState,
    ) -> Result<LifecycleAction, StackError> {
        match state {
            StackState::Stopped => {
                debug!(dir = id, "Stack already stopped, leaving it alone");
                return Ok(LifecycleAction::Skipped);
            }
            StackState::NotFound => {
                warn!(dir = id, "Stack not found, nothing to stop");
                return Ok(LifecycleAction::Skipped);
            }
            StackState::Unknown => {
                warn!(dir = id, "Stack state unknown, stopping defensively");
            }
            StackState::Running => {
                info!(dir = id, "Stopping stack");
            }
        }

        if self.dry_run {
            info!(dir = id, "[dry-run] would stop stack");
            return Ok(LifecycleAction::Skipped);
        }

        self.runtime
            .stop(dir)
            .await
            .map_err(|source| StackError::Command {
                dir: id.to_string(),
                action: "stop",
                source,
            })?;

        tokio::time::sleep(self.verification.settle).await;

        let attempts = self.verification.attempts.max(1);
        for attempt in 1..=attempts {
            match self.runtime.status(dir).await {
                StackState::Stopped | StackState::NotFound => {
                    info!(dir = id, "Stack stopped");
                    return Ok(LifecycleAction::Performed);
                }
                state => {
                    debug!(dir = id, attempt, %state, "Stack not confirmed stopped yet");
                    if attempt < attempts {
                        tokio::time::sleep(self.verification.interval).await;
                    }
                }
            }
        }

        Err(StackError::DidNotStop {
            dir: id.to_string(),
            attempts,
        })
    }

    /// Start the stack again if it was running (or unobservable) before the run
    pub async fn start(
        &self,
        id: &str,
        dir: &Path,
        state: StackState,
    ) -> Result<LifecycleAction, StackError> {
        if !state.needs_restart() {
            debug!(dir = id, %state, "Stack was not running before, not starting");
            return Ok(LifecycleAction::Skipped);
        }
        if self.dry_run {
            info!(dir = id, %state, "[dry-run] would start stack");
            return Ok(LifecycleAction::Skipped);
        }
        if state == StackState::Unknown {
            warn!(dir = id, "Stack state was unknown, starting defensively");
        } else {
            info!(dir = id, "Starting stack");
        }

        self.runtime
            .start(dir)
            .await
            .map_err(|source| StackError::Command {
                dir: id.to_string(),
                action: "start",
                source,
            })?;

        info!(dir = id, "Stack started");
        Ok(LifecycleAction::Performed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted runtime: statuses are popped in order, the last one repeats
    struct ScriptedRuntime {
        statuses: Mutex<VecDeque<StackState>>,
        calls: Mutex<Vec<&'static str>>,
        fail_stop: bool,
    }

    impl ScriptedRuntime {
        fn new(statuses: &[StackState]) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
                fail_stop: false,
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl StackRuntime for ScriptedRuntime {
        async fn status(&self, _dir: &Path) -> StackState {
            self.calls.lock().unwrap().push("status");
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                statuses.pop_front().unwrap()
            } else {
                statuses.front().copied().unwrap_or(StackState::Unknown)
            }
        }

        async fn stop(&self, _dir: &Path) -> Result<(), CommandError> {
            self.calls.lock().unwrap().push("stop");
            if self.fail_stop {
                return Err(CommandError::Failed {
                    program: "docker".into(),
                    code: 1,
                    stderr: "daemon gone".into(),
                });
            }
            Ok(())
        }

        async fn start(&self, _dir: &Path) -> Result<(), CommandError> {
            self.calls.lock().unwrap().push("start");
            Ok(())
        }

        async fn check_available(&self) -> Result<(), StackError> {
            Ok(())
        }
    }

    fn fast() -> StopVerification {
        StopVerification {
            settle: Duration::ZERO,
            attempts: 3,
            interval: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_running_stack_is_stopped_and_verified() {
        let runtime = ScriptedRuntime::new(&[StackState::Running, StackState::Stopped]);
        let controller = StackController::new(runtime).with_verification(fast());

        let action = controller
            .stop("webapp", Path::new("/stacks/webapp"), StackState::Running)
            .await
            .unwrap();
        assert_eq!(action, LifecycleAction::Performed);
        assert_eq!(controller.runtime().calls(), vec!["stop", "status", "status"]);
    }

    #[tokio::test]
    async fn test_stack_that_keeps_running_fails_after_attempts() {
        let runtime = ScriptedRuntime::new(&[StackState::Running]);
        let controller = StackController::new(runtime).with_verification(fast());

        let err = controller
            .stop("webapp", Path::new("/stacks/webapp"), StackState::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::DidNotStop { attempts: 3, .. }));
        let statuses = controller
            .runtime()
            .calls()
            .iter()
            .filter(|c| **c == "status")
            .count();
        assert_eq!(statuses, 3);
    }

    #[tokio::test]
    async fn test_stopped_and_missing_stacks_are_left_alone() {
        for state in [StackState::Stopped, StackState::NotFound] {
            let controller =
                StackController::new(ScriptedRuntime::new(&[state])).with_verification(fast());
            let dir = Path::new("/stacks/idle");

            assert_eq!(
                controller.stop("idle", dir, state).await.unwrap(),
                LifecycleAction::Skipped
            );
            assert_eq!(
                controller.start("idle", dir, state).await.unwrap(),
                LifecycleAction::Skipped
            );
            assert!(controller.runtime().calls().is_empty());
        }
    }

    #[tokio::test]
    async fn test_unknown_state_is_treated_as_running() {
        let runtime = ScriptedRuntime::new(&[StackState::Stopped]);
        let controller = StackController::new(runtime).with_verification(fast());
        let dir = Path::new("/stacks/mystery");

        controller.stop("mystery", dir, StackState::Unknown).await.unwrap();
        controller.start("mystery", dir, StackState::Unknown).await.unwrap();
        assert_eq!(controller.runtime().calls(), vec!["stop", "status", "start"]);
    }

    #[tokio::test]
    async fn test_stop_command_failure_is_reported() {
        let mut runtime = ScriptedRuntime::new(&[StackState::Running]);
        runtime.fail_stop = true;
        let controller = StackController::new(runtime).with_verification(fast());

        let err = controller
            .stop("webapp", Path::new("/stacks/webapp"), StackState::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::Command { action: "stop", .. }));
    }

    #[tokio::test]
    async fn test_missing_directory_probes_as_not_found() {
        let runtime = ComposeRuntime::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(runtime.status(&dir.path().join("gone")).await, StackState::NotFound);
        assert_eq!(runtime.status(dir.path()).await, StackState::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_probe_reports_unknown() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("compose.yml"), "services: {}\n").unwrap();
        let runtime = ComposeRuntime::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .with_binary("false");
        assert_eq!(runtime.status(dir.path()).await, StackState::Unknown);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_live_stack_running() {
        let controller = StackController::new(ScriptedRuntime::new(&[StackState::Running]))
            .with_verification(fast())
            .with_dry_run(true);
        let dir = Path::new("/stacks/webapp");

        for state in [StackState::Running, StackState::Unknown] {
            assert_eq!(
                controller.stop("webapp", dir, state).await.unwrap(),
                LifecycleAction::Skipped
            );
            assert_eq!(
                controller.start("webapp", dir, state).await.unwrap(),
                LifecycleAction::Skipped
            );
        }
        assert!(controller.runtime().calls().is_empty());
    }
}
