//! Browser process supervision.
//!
//! A launched browser is owned by exactly one [`BrowserProcess`] handle.
//! The handle wraps a supervisor task that holds the child process,
//! reports its natural exit over a watch channel, and serves kill
//! requests so that termination is idempotent no matter how many times
//! or from how many tasks it is requested.
//!
//! # Lifecycle
//!
//! 1. [`BrowserProcess::launch`] spawns the child and the supervisor.
//! 2. [`BrowserProcess::on_exit`] yields a receiver that flips to `true`
//!    once, whether the browser crashed, was closed by the user, or was
//!    killed through this handle.
//! 3. [`BrowserProcess::kill`] terminates the child if still alive and
//!    resolves once it has been reaped.

// ============================================================================
// Imports
// ============================================================================

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::error::{Error, Result};

// ============================================================================
// BrowserProcess
// ============================================================================

/// Owned handle to a launched browser process.
///
/// Dropping the handle does not kill the browser; teardown is explicit
/// via [`BrowserProcess::kill`], invoked from the runner's exit path.
/// The supervisor task exits once the process is reaped and all handles
/// are gone.
#[derive(Clone)]
pub struct BrowserProcess {
    /// Process ID for logging.
    pid: u32,
    /// Kill requests; each carries an ack channel.
    kill_tx: mpsc::Sender<oneshot::Sender<()>>,
    /// Flips to `true` exactly once when the process has exited.
    exited_rx: watch::Receiver<bool>,
}

impl BrowserProcess {
    /// Launches a browser binary with the given arguments.
    ///
    /// Stdio is detached; the browser's own output is not captured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LaunchFailed`] if the process cannot be spawned.
    pub fn launch(binary: &Path, args: &[String]) -> Result<Self> {
        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn().map_err(Error::launch_failed)?;
        let pid = child.id().unwrap_or(0);
        info!(pid, binary = %binary.display(), "Browser process spawned");

        Ok(Self::supervise(child, pid))
    }

    /// Wraps an already-spawned child in a supervisor.
    fn supervise(child: Child, pid: u32) -> Self {
        let (kill_tx, kill_rx) = mpsc::channel::<oneshot::Sender<()>>(4);
        let (exited_tx, exited_rx) = watch::channel(false);

        tokio::spawn(Self::run_supervisor(child, pid, kill_rx, exited_tx));

        Self {
            pid,
            kill_tx,
            exited_rx,
        }
    }

    /// Returns the OS process ID.
    #[inline]
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns `true` if the process has already exited.
    #[inline]
    #[must_use]
    pub fn has_exited(&self) -> bool {
        *self.exited_rx.borrow()
    }

    /// Returns a receiver that flips to `true` when the process exits.
    ///
    /// The signal fires for natural exit, crash, and explicit kill
    /// alike; it never fires twice.
    #[inline]
    #[must_use]
    pub fn on_exit(&self) -> watch::Receiver<bool> {
        self.exited_rx.clone()
    }

    /// Terminates the process if still alive and waits until it is
    /// reaped.
    ///
    /// Safe to call repeatedly and concurrently; every caller resolves
    /// once the process is gone.
    pub async fn kill(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.kill_tx.send(ack_tx).await.is_err() {
            // Supervisor already finished; the process is reaped.
            return;
        }
        let _ = ack_rx.await;
    }

    /// Supervisor task: owns the child until it is reaped.
    async fn run_supervisor(
        mut child: Child,
        pid: u32,
        mut kill_rx: mpsc::Receiver<oneshot::Sender<()>>,
        exited_tx: watch::Sender<bool>,
    ) {
        let mut exited = false;

        loop {
            tokio::select! {
                status = child.wait(), if !exited => {
                    match status {
                        Ok(status) => debug!(pid, %status, "Browser process exited"),
                        Err(e) => debug!(pid, error = %e, "Failed to wait for browser process"),
                    }
                    exited = true;
                    let _ = exited_tx.send(true);
                }

                request = kill_rx.recv() => {
                    match request {
                        Some(ack) => {
                            if !exited {
                                debug!(pid, "Killing browser process");
                                if let Err(e) = child.start_kill() {
                                    debug!(pid, error = %e, "Failed to send kill signal");
                                }
                                if let Err(e) = child.wait().await {
                                    debug!(pid, error = %e, "Failed to reap browser process");
                                }
                                info!(pid, "Browser process terminated");
                                exited = true;
                                let _ = exited_tx.send(true);
                            }
                            let _ = ack.send(());
                        }
                        // All handles dropped.
                        None => break,
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for BrowserProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserProcess")
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;
    use std::time::Duration;

    fn sleep_binary() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_kill_terminates_process() {
        let process = BrowserProcess::launch(
            &sleep_binary(),
            &["-c".to_string(), "sleep 30".to_string()],
        )
        .expect("launch");

        assert!(!process.has_exited());
        process.kill().await;
        assert!(process.has_exited());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_kill_is_idempotent() {
        let process = BrowserProcess::launch(
            &sleep_binary(),
            &["-c".to_string(), "sleep 30".to_string()],
        )
        .expect("launch");

        process.kill().await;
        process.kill().await;
        process.kill().await;
        assert!(process.has_exited());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_natural_exit_signals_watchers() {
        let process = BrowserProcess::launch(&sleep_binary(), &["-c".to_string(), "exit 0".into()])
            .expect("launch");

        let mut on_exit = process.on_exit();
        tokio::time::timeout(Duration::from_secs(10), on_exit.wait_for(|exited| *exited))
            .await
            .expect("process should exit promptly")
            .expect("watch channel alive");

        assert!(process.has_exited());
        // Kill after natural exit is a no-op.
        process.kill().await;
    }

    #[test]
    fn test_launch_missing_binary_fails() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let _guard = rt.enter();

        let result = BrowserProcess::launch(Path::new("/nonexistent/browser-binary"), &[]);
        assert!(matches!(result, Err(Error::LaunchFailed { .. })));
    }
}
