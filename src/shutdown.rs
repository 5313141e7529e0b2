//! Shutdown coordination
//! A signal-driven cancellation root shared by listeners and background workers

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Cancellation handle observed by long-lived tasks
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Resolves once shutdown has been triggered (or the coordinator is gone)
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Fires once: on SIGINT, SIGTERM or SIGHUP it cancels every [`Shutdown`]
/// handle and writes a timestamped marker file.
///
/// In-flight requests are not drained; listeners stop accepting and the
/// process exits after at most `grace`.
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
    marker_path: PathBuf,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new<P: AsRef<Path>>(marker_path: P, grace: Duration) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            marker_path: marker_path.as_ref().to_path_buf(),
            grace,
        }
    }

    /// New handle on the cancellation root
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }

    /// How long callers should wait for tasks to wind down
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Cancel all handles and run the cleanup action. Cleanup failures are
    /// logged and do not prevent exit.
    pub fn trigger(&self) {
        self.tx.send_replace(true);

        match write_cleanup_marker(&self.marker_path) {
            Ok(()) => info!("Cleanup marker written to {}", self.marker_path.display()),
            Err(e) => error!("Cleanup failed: {:#}", e),
        }
    }
}

/// Write `This File was created at: <now>` to `path`
pub fn write_cleanup_marker(path: &Path) -> Result<()> {
    let contents = format!("This File was created at: {}", chrono::Local::now());
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

/// Wait for SIGINT, SIGTERM or SIGHUP and return the signal's name
#[cfg(unix)]
pub async fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
    };

    Ok(name)
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl-C handler")?;
    Ok("Ctrl-C")
}
