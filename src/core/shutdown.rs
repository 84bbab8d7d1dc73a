/// Cooperative cancellation driven by OS signals
///
/// A listener task turns SIGINT/SIGTERM/SIGHUP into a flag on a watch
/// channel. The pipeline races each suspension point against that flag and
/// stops starting new work once it flips; cleanup stays with the pipeline.

use std::future::Future;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The pipeline was asked to stop while waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted by shutdown signal")]
pub struct Interrupted;

/// Sending half, owned by the signal listener (or a test)
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving half, cheap to clone
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl Shutdown {
    /// A handle that never fires
    pub fn never() -> Self {
        channel().1
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // A dropped trigger means no signal can arrive anymore
        if rx.wait_for(|triggered| *triggered).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Run `fut` unless shutdown arrives first.
    ///
    /// A future that loses the race is dropped. Child processes it started
    /// keep running in their own process group.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        if self.is_triggered() {
            return Err(Interrupted);
        }
        tokio::select! {
            biased;
            _ = self.wait() => Err(Interrupted),
            out = fut => Ok(out),
        }
    }
}

/// Wait for SIGINT, SIGTERM or SIGHUP
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sighup.recv() => "SIGHUP",
    };
    Ok(name)
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}

/// Spawn the listener task and hand back the receiving side
pub fn spawn_signal_listener() -> (Shutdown, JoinHandle<()>) {
    let (trigger, shutdown) = channel();
    let handle = tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(signal) => {
                warn!(signal, "Received shutdown signal, finishing up");
                trigger.trigger();
            }
            Err(e) => {
                warn!(error = %e, "Could not register signal handlers");
                // Keep the channel open so the pipeline runs to completion
                std::future::pending::<()>().await;
            }
        }
        debug!("Signal listener finished");
    });
    (shutdown, handle)
}
