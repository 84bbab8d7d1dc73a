/// Backup pipeline
///
/// One invocation walks `preflight -> discover/sync -> per directory
/// (stop, backup, verify, retention, start) -> summarize`. Directories are
/// processed one at a time in identifier order. A failing directory is
/// counted and skipped; only preflight and discovery errors abort the run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::core::backup::{SnapshotEngine, StepOutcome};
use crate::core::dirlist::DirListManager;
use crate::core::docker::{StackController, StackRuntime, StackState};
use crate::core::error::{BackupError, DirListError, ErrorKind, PipelineError, StackError};
use crate::core::lock::PidFile;
use crate::core::shutdown::{Interrupted, Shutdown};
use crate::utils::helpers::{format_duration, format_timestamp};

/// Counters for one run
#[derive(Debug, Clone)]
pub struct RunStats {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_dirs: Vec<String>,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            processed: 0,
            succeeded: 0,
            failed: 0,
            failed_dirs: Vec::new(),
        }
    }

    pub fn record_success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, id: &str) {
        self.processed += 1;
        self.failed += 1;
        self.failed_dirs.push(id.to_string());
    }

    pub fn finish(&mut self) {
        self.finished_at.get_or_insert_with(Utc::now);
    }

    pub fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre-run stack states, iterated in identifier order
#[derive(Debug, Default, Clone)]
pub struct StateTable {
    states: BTreeMap<String, StackState>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the state seen before the run touched the stack. The first
    /// observation wins; returns false if one was already recorded.
    pub fn capture(&mut self, id: &str, state: StackState) -> bool {
        if self.states.contains_key(id) {
            return false;
        }
        self.states.insert(id.to_string(), state);
        true
    }

    pub fn get(&self, id: &str) -> Option<StackState> {
        self.states.get(id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, StackState)> {
        self.states.iter().map(|(id, state)| (id.as_str(), *state))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunStats),
    Interrupted(RunStats),
}

impl RunOutcome {
    pub fn stats(&self) -> &RunStats {
        match self {
            RunOutcome::Completed(stats) | RunOutcome::Interrupted(stats) => stats,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed(stats) if stats.is_success())
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub pid_file: PathBuf,
    /// Passed to the engine so retention only touches this host's snapshots
    pub hostname: Option<String>,
}

/// Why `execute` stopped early
enum Abort {
    Interrupted,
    Fatal(PipelineError),
}

impl From<Interrupted> for Abort {
    fn from(_: Interrupted) -> Self {
        Abort::Interrupted
    }
}

impl From<PipelineError> for Abort {
    fn from(err: PipelineError) -> Self {
        Abort::Fatal(err)
    }
}

impl From<StackError> for Abort {
    fn from(err: StackError) -> Self {
        Abort::Fatal(err.into())
    }
}

impl From<BackupError> for Abort {
    fn from(err: BackupError) -> Self {
        Abort::Fatal(err.into())
    }
}

impl From<DirListError> for Abort {
    fn from(err: DirListError) -> Self {
        Abort::Fatal(err.into())
    }
}

/// The directory being worked on, for cleanup after an interrupt
#[derive(Debug, Clone)]
struct InFlight {
    id: String,
    path: PathBuf,
}

struct Target {
    id: String,
    tag: String,
    path: PathBuf,
}

pub struct Orchestrator<R, E> {
    controller: StackController<R>,
    engine: E,
    dirlist: DirListManager,
    options: RunOptions,
    shutdown: Shutdown,
    states: StateTable,
    in_flight: Option<InFlight>,
    pid_file: Option<PidFile>,
}

impl<R: StackRuntime, E: SnapshotEngine> Orchestrator<R, E> {
    pub fn new(
        controller: StackController<R>,
        engine: E,
        dirlist: DirListManager,
        options: RunOptions,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            controller,
            engine,
            dirlist,
            options,
            shutdown,
            states: StateTable::new(),
            in_flight: None,
            pid_file: None,
        }
    }

    pub fn states(&self) -> &StateTable {
        &self.states
    }

    /// Run the pipeline once. Cleanup runs on every path out of here.
    pub async fn run(&mut self) -> Result<RunOutcome, PipelineError> {
        let mut stats = RunStats::new();
        info!(started = %format_timestamp(stats.started_at), "Backup run starting");

        // Nothing to clean up if another instance owns the run
        self.pid_file = Some(PidFile::acquire(&self.options.pid_file)?);

        let result = self.execute(&mut stats).await;
        let interrupted = matches!(result, Err(Abort::Interrupted));

        self.cleanup(interrupted).await;
        stats.finish();

        match result {
            Ok(()) => {
                summarize(&stats, false);
                Ok(RunOutcome::Completed(stats))
            }
            Err(Abort::Interrupted) => {
                summarize(&stats, true);
                Ok(RunOutcome::Interrupted(stats))
            }
            Err(Abort::Fatal(err)) => {
                error!(kind = %err.kind, error = %err.message, "Backup run aborted");
                Err(err)
            }
        }
    }

    async fn execute(&mut self, stats: &mut RunStats) -> Result<(), Abort> {
        self.preflight().await?;
        let targets = self.discover().await?;

        if targets.is_empty() {
            warn!("No enabled directories, nothing to back up");
            return Ok(());
        }

        for target in &targets {
            let state = self.shutdown.guard(self.controller.probe(&target.path)).await?;
            self.states.capture(&target.id, state);
            debug!(dir = %target.id, %state, "Captured pre-run state");
        }

        let total = targets.len();
        for (index, target) in targets.iter().enumerate() {
            if self.shutdown.is_triggered() {
                return Err(Abort::Interrupted);
            }
            info!(dir = %target.id, "Processing directory {}/{}", index + 1, total);

            self.in_flight = Some(InFlight {
                id: target.id.clone(),
                path: target.path.clone(),
            });
            let ok = self.process(target).await?;
            self.in_flight = None;

            if ok {
                stats.record_success();
            } else {
                stats.record_failure(&target.id);
            }
        }

        Ok(())
    }

    async fn preflight(&mut self) -> Result<(), Abort> {
        info!("Running preflight checks");
        self.shutdown
            .guard(self.controller.runtime().check_available())
            .await??;
        self.shutdown
            .guard(self.engine.check_repository())
            .await??;
        Ok(())
    }

    async fn discover(&mut self) -> Result<Vec<Target>, Abort> {
        self.dirlist.load()?;
        let report = self.dirlist.sync()?;
        if !report.is_empty() {
            info!(
                added = report.added.len(),
                removed = report.removed.len(),
                "Directory list changed, saving"
            );
            self.shutdown.guard(self.dirlist.save_async()).await??;
        }

        info!(
            enabled = self.dirlist.enabled_count(),
            disabled = self.dirlist.disabled_count(),
            "Directory list loaded"
        );

        Ok(self
            .dirlist
            .enabled()
            .into_iter()
            .map(|entry| Target {
                id: entry.identifier.clone(),
                tag: entry.tag(),
                path: self.dirlist.full_path(entry),
            })
            .collect())
    }

    /// One directory. Returns whether stop, backup and start all went through.
    async fn process(&self, target: &Target) -> Result<bool, Abort> {
        let id = target.id.as_str();
        let state = self.states.get(id).unwrap_or(StackState::Unknown);
        let mut ok = true;

        let stopped = self
            .shutdown
            .guard(self.controller.stop(id, &target.path, state))
            .await?;
        if let Err(e) = stopped {
            error!(dir = id, kind = %ErrorKind::PerDirectory, error = %e, "Stop failed, skipping backup");
            ok = false;
        }

        if ok {
            ok = self.back_up(target).await?;
        }

        // Always attempted, the controller only starts what was running
        let started = self
            .shutdown
            .guard(self.controller.start(id, &target.path, state))
            .await?;
        if let Err(e) = started {
            error!(dir = id, kind = %ErrorKind::PerDirectory, error = %e, "Start failed");
            ok = false;
        }

        if ok {
            info!(dir = id, "Directory done");
        } else {
            warn!(dir = id, "Directory failed");
        }
        Ok(ok)
    }

    async fn back_up(&self, target: &Target) -> Result<bool, Abort> {
        let id = target.id.as_str();
        let hostname = self.options.hostname.as_deref();

        info!(dir = id, tag = %target.tag, "Backing up");
        let backed_up = self
            .shutdown
            .guard(self.engine.backup(&target.path, &target.tag, hostname))
            .await?;
        if let Err(e) = backed_up {
            error!(dir = id, kind = %ErrorKind::PerDirectory, error = %e, "Backup failed");
            return Ok(false);
        }

        // Verification and retention never change the directory outcome
        let verified = self.shutdown.guard(self.engine.verify(&target.tag)).await?;
        report_advisory(id, "verify", verified);

        let pruned = self
            .shutdown
            .guard(self.engine.apply_retention(&target.tag, hostname))
            .await?;
        report_advisory(id, "retention", pruned);

        Ok(true)
    }

    async fn cleanup(&mut self, interrupted: bool) {
        if interrupted {
            if let Some(in_flight) = self.in_flight.take() {
                self.restore_in_flight(&in_flight).await;
            }
        }

        self.engine.cleanup();

        if let Some(mut pid_file) = self.pid_file.take() {
            pid_file.release();
            debug!(path = %pid_file.path().display(), "PID file released");
        }
    }

    async fn restore_in_flight(&self, in_flight: &InFlight) {
        let state = self
            .states
            .get(&in_flight.id)
            .unwrap_or(StackState::Unknown);
        if !state.needs_restart() {
            info!(dir = %in_flight.id, %state, "Interrupted directory was not running, leaving it");
            return;
        }

        warn!(dir = %in_flight.id, "Interrupted mid-directory, restarting stack");
        if let Err(e) = self
            .controller
            .start(&in_flight.id, &in_flight.path, state)
            .await
        {
            error!(dir = %in_flight.id, error = %e, "Could not restart interrupted stack");
        }
    }
}

fn report_advisory<D: std::fmt::Display>(
    id: &str,
    step: &'static str,
    outcome: Result<StepOutcome, D>,
) {
    match outcome {
        Ok(StepOutcome::Done) => debug!(dir = id, step, "Step done"),
        Ok(StepOutcome::Skipped(reason)) => debug!(dir = id, step, reason, "Step skipped"),
        Err(e) => warn!(dir = id, step, kind = %ErrorKind::Advisory, error = %e, "Step failed, continuing"),
    }
}

fn summarize(stats: &RunStats, interrupted: bool) {
    let elapsed = format_duration(stats.elapsed());
    info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        failed = stats.failed,
        %elapsed,
        "Backup run summary"
    );

    if !stats.failed_dirs.is_empty() {
        error!(dirs = %stats.failed_dirs.join(", "), "Failed directories");
    }
    if interrupted {
        warn!("Run was interrupted before all directories were processed");
    } else if stats.is_success() {
        info!("Backup run completed successfully");
    } else {
        error!("Backup run completed with failures");
    }
}
