/// Run-scoped logging
///
/// `RunLogger::init` installs a subscriber for the current thread only and
/// `close` removes it again, so nothing global outlives a run.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use tracing::info;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::utils::constants::LOG_ENV;
use crate::utils::helpers::format_duration;

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    /// Write a per-run log file here as well as to stderr
    pub log_dir: Option<PathBuf>,
}

pub struct RunLogger {
    guard: Option<DefaultGuard>,
    log_file: Option<PathBuf>,
    started: Instant,
}

impl RunLogger {
    pub fn init(options: &LogOptions) -> io::Result<Self> {
        let (file, log_file) = match &options.log_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let path = dir.join(log_file_name());
                (Some(File::create(&path)?), Some(path))
            }
            None => (None, None),
        };

        let file_layer = file.map(|file| {
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Arc::new(file))
        });

        let guard = tracing_subscriber::registry()
            .with(filter(options.verbose))
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(io::stderr),
            )
            .with(file_layer)
            .set_default();

        if let Some(path) = &log_file {
            info!(file = %path.display(), "Logging to file");
        }

        Ok(Self {
            guard: Some(guard),
            log_file,
            started: Instant::now(),
        })
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn close(mut self) {
        if self.log_file.is_some() {
            info!(
                elapsed = %format_duration(self.started.elapsed()),
                "Log closed"
            );
        }
        self.guard.take();
    }
}

/// `$DOCKER_STACK_BACKUP_LOG` wins over the verbosity flag
fn filter(verbose: bool) -> EnvFilter {
    if let Ok(directive) = std::env::var(LOG_ENV) {
        if let Ok(filter) = EnvFilter::try_new(&directive) {
            return filter;
        }
    }
    if verbose {
        EnvFilter::new("docker_stack_backup=debug")
    } else {
        EnvFilter::new("docker_stack_backup=info")
    }
}

fn log_file_name() -> String {
    format!("backup-{}.log", Local::now().format("%Y%m%d-%H%M%S"))
}
