mod cli;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;

use cli::{Cli, Commands, DirsCommands};
use docker_stack_backup::core::backup::{Restic, SnapshotEngine};
use docker_stack_backup::core::cloud::Rclone;
use docker_stack_backup::core::docker::{StackController, StackRuntime};
use docker_stack_backup::core::error::{BackupError, ConfigError, ErrorKind, LockError, PipelineError};
use docker_stack_backup::core::orchestrator::{Orchestrator, RunOptions, RunOutcome, RunStats};
use docker_stack_backup::core::shutdown;
use docker_stack_backup::utils::constants::*;
use docker_stack_backup::utils::logging::{LogOptions, RunLogger};
use docker_stack_backup::utils::{format_bytes, format_duration, AppConfig};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Current-thread runtime keeps every task under the run's log subscriber
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{} Failed to start runtime: {}", "✗".red(), e);
            return exit_code(EXIT_FAILURE);
        }
    };

    exit_code(runtime.block_on(dispatch(cli)))
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn dispatch(cli: Cli) -> i32 {
    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            return EXIT_CONFIG;
        }
    };

    if let Commands::Run { dry_run, no_log_file } = cli.command {
        return handle_run(config, cli.verbose, dry_run, no_log_file).await;
    }

    let logger = match RunLogger::init(&LogOptions {
        verbose: cli.verbose,
        log_dir: None,
    }) {
        Ok(logger) => Some(logger),
        Err(e) => {
            eprintln!("Warning: logging unavailable: {}", e);
            None
        }
    };

    let result = match cli.command {
        Commands::Run { .. } => Ok(()),
        Commands::Dirs { command } => handle_dirs(&config, command),
        Commands::Snapshots { tag, limit } => handle_snapshots(&config, tag, limit).await,
        Commands::RestorePreview { tag } => handle_restore_preview(&config, &tag).await,
        Commands::Init => handle_init(&config).await,
        Commands::Check => handle_check(&config).await,
        Commands::Upload { dry_run } => handle_upload(config, dry_run).await,
        Commands::Download {
            target,
            force,
            dry_run,
        } => handle_download(config, &target, force, dry_run).await,
        Commands::Config => handle_config(&config, cli.config.as_deref()),
    };

    if let Some(logger) = logger {
        logger.close();
    }

    match result {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("{} Error: {:#}", "✗".red(), e);
            classify(&e)
        }
    }
}

/// Exit code for an error surfaced by a handler
fn classify(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    if let Some(BackupError::Credentials(_)) = err.downcast_ref::<BackupError>() {
        return EXIT_CONFIG;
    }
    if let Some(LockError::AlreadyRunning { .. }) = err.downcast_ref::<LockError>() {
        return EXIT_ALREADY_RUNNING;
    }
    EXIT_FAILURE
}

async fn handle_run(mut config: AppConfig, verbose: bool, dry_run: bool, no_log_file: bool) -> i32 {
    if dry_run {
        config.backup.dry_run = true;
        config.cloud.dry_run = true;
    }

    // Configuration problems abort before anything is created or touched
    if let Err(e) = config.validate() {
        eprintln!("{} {}", "✗".red(), e);
        return EXIT_CONFIG;
    }

    let log_options = LogOptions {
        verbose,
        log_dir: (!no_log_file).then(|| config.paths.log_dir.clone()),
    };
    let logger = match RunLogger::init(&log_options) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Warning: cannot open log file ({}), logging to stderr only", e);
            match RunLogger::init(&LogOptions { verbose, log_dir: None }) {
                Ok(logger) => logger,
                Err(e) => {
                    eprintln!("{} Logging setup failed: {}", "✗".red(), e);
                    return EXIT_FAILURE;
                }
            }
        }
    };

    let code = match run_pipeline(&config).await {
        Ok(outcome) => {
            print_summary(outcome.stats());
            match outcome {
                RunOutcome::Interrupted(_) => EXIT_INTERRUPTED,
                RunOutcome::Completed(stats) if stats.is_success() => EXIT_SUCCESS,
                RunOutcome::Completed(_) => EXIT_FAILURE,
            }
        }
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            match e.kind {
                ErrorKind::Configuration => EXIT_CONFIG,
                ErrorKind::Concurrency => EXIT_ALREADY_RUNNING,
                _ => EXIT_FAILURE,
            }
        }
    };

    logger.close();
    code
}

async fn run_pipeline(config: &AppConfig) -> std::result::Result<RunOutcome, PipelineError> {
    let engine = Restic::new(config.restic_settings()?)?;
    let dirlist = config.dirlist_manager()?;
    let controller = StackController::new(config.compose_runtime()).with_dry_run(config.backup.dry_run);

    let (shutdown, listener) = shutdown::spawn_signal_listener();
    let mut orchestrator = Orchestrator::new(
        controller,
        engine,
        dirlist,
        RunOptions {
            pid_file: config.paths.pid_file.clone(),
            hostname: config.backup.hostname.clone(),
        },
        shutdown,
    );

    let outcome = orchestrator.run().await;
    listener.abort();
    outcome
}

fn print_summary(stats: &RunStats) {
    println!("\n{}", "Backup Summary".bold());
    println!("{}", "-".repeat(40));
    println!("  Processed:  {}", stats.processed);
    println!("  Succeeded:  {}", stats.succeeded.to_string().green());
    if stats.failed > 0 {
        println!("  Failed:     {}", stats.failed.to_string().red());
    } else {
        println!("  Failed:     0");
    }
    println!("  Elapsed:    {}", format_duration(stats.elapsed()));

    for dir in &stats.failed_dirs {
        println!("  {} {}", "✗".red(), dir);
    }
}

fn handle_dirs(config: &AppConfig, command: DirsCommands) -> Result<()> {
    let mut manager = config.dirlist_manager()?;
    manager.load()?;

    match command {
        DirsCommands::List => {
            println!("Directory list: {}\n", manager.list_file().display());
            println!("{:<45} {:<10} {:<10}", "Directory", "Enabled", "Type");
            println!("{}", "-".repeat(65));

            for entry in manager.entries() {
                let enabled = if entry.enabled {
                    "yes".green()
                } else {
                    "no".dimmed()
                };
                let kind = if entry.is_external { "external" } else { "managed" };
                println!("{:<45} {:<10} {:<10}", entry.identifier, enabled, kind);
            }

            println!(
                "\n{} enabled, {} disabled",
                manager.enabled_count(),
                manager.disabled_count()
            );
        }
        DirsCommands::Sync => {
            let report = manager.sync()?;
            if report.is_empty() {
                println!("{} Directory list is up to date", "✓".green());
                return Ok(());
            }
            manager.save()?;
            for id in &report.added {
                println!("  {} {}", "+".green(), id);
            }
            for id in &report.removed {
                println!("  {} {}", "-".red(), id);
            }
            println!(
                "{} Saved ({} added, {} removed)",
                "✓".green(),
                report.added.len(),
                report.removed.len()
            );
        }
        DirsCommands::Enable { identifier } => {
            manager.set_enabled(&identifier, true)?;
            manager.save()?;
            println!("{} {} enabled", "✓".green(), identifier);
        }
        DirsCommands::Disable { identifier } => {
            manager.set_enabled(&identifier, false)?;
            manager.save()?;
            println!("{} {} disabled", "✓".green(), identifier);
        }
        DirsCommands::Add { path, disabled } => {
            manager.add_external(&path, !disabled)?;
            manager.save()?;
            println!("{} Registered {}", "✓".green(), path.display());
        }
        DirsCommands::Remove { path } => {
            manager.remove_external(&path)?;
            manager.save()?;
            println!("{} Removed {}", "✓".green(), path);
        }
    }

    Ok(())
}

fn restic(config: &AppConfig) -> Result<Restic> {
    let settings = config.restic_settings()?;
    Ok(Restic::new(settings)?)
}

async fn handle_snapshots(config: &AppConfig, tag: Option<String>, limit: usize) -> Result<()> {
    let restic = restic(config)?;
    let snapshots = restic.list_snapshots(tag.as_deref(), limit).await?;

    if snapshots.is_empty() {
        println!("No snapshots found");
        return Ok(());
    }

    println!("{:<10} {:<20} {:<15} {:<30}", "ID", "Time", "Host", "Tags");
    println!("{}", "-".repeat(80));
    for snapshot in &snapshots {
        println!(
            "{:<10} {:<20} {:<15} {:<30}",
            snapshot.short(),
            snapshot.time.format("%Y-%m-%d %H:%M:%S"),
            snapshot.hostname,
            snapshot.tags.join(",")
        );
    }
    println!("\n{} snapshot(s)", snapshots.len());
    Ok(())
}

async fn handle_restore_preview(config: &AppConfig, tag: &str) -> Result<()> {
    let restic = restic(config)?;
    let Some(preview) = restic.restore_preview(tag).await? else {
        println!("No snapshot found for tag '{}'", tag);
        return Ok(());
    };

    let snapshot = &preview.snapshot;
    println!("Latest snapshot for '{}'\n", tag);
    println!("  ID:           {}", snapshot.short());
    println!("  Time:         {}", snapshot.time.format("%Y-%m-%d %H:%M:%S %z"));
    println!("  Host:         {}", snapshot.hostname);
    println!("  Paths:        {}", snapshot.paths.join(", "));
    println!("  Files:        {}", preview.files);
    println!("  Directories:  {}", preview.directories);
    println!("  Total size:   {}", format_bytes(preview.total_bytes));
    Ok(())
}

async fn handle_init(config: &AppConfig) -> Result<()> {
    let restic = restic(config)?;
    if restic.init_repository().await? {
        println!("{} Repository initialized at {}", "✓".green(), config.backup.repository);
    } else {
        println!("Repository at {} already exists", config.backup.repository);
    }
    Ok(())
}

async fn handle_check(config: &AppConfig) -> Result<()> {
    config.validate()?;
    println!("{} Configuration valid", "✓".green());

    config.compose_runtime().check_available().await?;
    println!("{} docker compose available", "✓".green());

    restic(config)?.check_repository().await?;
    println!("{} Repository accessible", "✓".green());

    if config.cloud.remote.is_some() {
        let rclone = Rclone::new(config.rclone_settings()?);
        rclone.test_connectivity().await?;
        println!("{} Remote {} reachable", "✓".green(), rclone.destination());
    }
    Ok(())
}

async fn handle_upload(mut config: AppConfig, dry_run: bool) -> Result<()> {
    config.cloud.dry_run |= dry_run;
    let rclone = Rclone::new(config.rclone_settings()?);

    let source = PathBuf::from(&config.backup.repository);
    if !source.is_absolute() {
        anyhow::bail!(
            "backup.repository '{}' is not a local path, nothing to upload",
            config.backup.repository
        );
    }

    rclone
        .sync(&source)
        .await
        .with_context(|| format!("Upload to {} failed", rclone.destination()))?;
    println!("{} Uploaded {} to {}", "✓".green(), source.display(), rclone.destination());
    Ok(())
}

async fn handle_download(mut config: AppConfig, target: &Path, force: bool, dry_run: bool) -> Result<()> {
    config.cloud.dry_run |= dry_run;
    let rclone = Rclone::new(config.rclone_settings()?);

    let report = rclone
        .restore(target, force)
        .await
        .with_context(|| format!("Download from {} failed", rclone.destination()))?;

    if config.cloud.dry_run {
        println!("Dry run finished, nothing written");
        return Ok(());
    }

    println!(
        "{} Restored {} files ({}) into {}",
        "✓".green(),
        report.files,
        format_bytes(report.bytes),
        target.display()
    );
    if !report.looks_like_repository {
        println!("{} Target does not look like a restic repository", "!".yellow());
    }
    Ok(())
}

fn handle_config(config: &AppConfig, explicit: Option<&Path>) -> Result<()> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(AppConfig::default_path);
    println!("# {}", path.display());
    print!("{}", config.to_redacted_toml().context("Failed to render configuration")?);
    Ok(())
}
