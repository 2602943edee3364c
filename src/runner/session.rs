//! Session lifecycle state machine.
//!
//! Teardown can be triggered from several places at once: an explicit
//! `exit()` call, a second concurrent `exit()` call, or the browser
//! process closing on its own. The [`ExitGate`] makes "exit triggered
//! twice" a provably safe no-op: the phase transition is checked and set
//! under one lock, exactly one trigger wins, and every other trigger
//! waits for that winner to finish.

// ============================================================================
// Imports
// ============================================================================

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Error, Result};

// ============================================================================
// SessionPhase
// ============================================================================

/// Lifecycle phase of one runner instance.
///
/// Transitions: `NotStarted -> Running -> Exiting -> Exited`.
/// `exit()` may also fire from `NotStarted` (setup never began or
/// failed early).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// `run()` has not been invoked.
    NotStarted,
    /// The session is live: process launched, channel connected.
    Running,
    /// Teardown is in progress on exactly one task.
    Exiting,
    /// Teardown has completed; all resources are released.
    Exited,
}

// ============================================================================
// ExitDecision
// ============================================================================

/// Outcome of attempting to start teardown.
pub enum ExitDecision {
    /// This caller won the transition and must perform teardown.
    Proceed,
    /// Another caller is tearing down; await this receiver until it
    /// reads `true`.
    InProgress(watch::Receiver<bool>),
    /// Teardown already completed.
    AlreadyExited,
}

// ============================================================================
// ExitGate
// ============================================================================

/// Atomic lifecycle gate shared by all teardown triggers of a session.
pub struct ExitGate {
    phase: Mutex<SessionPhase>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl ExitGate {
    /// Creates a gate in [`SessionPhase::NotStarted`].
    #[must_use]
    pub fn new() -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            phase: Mutex::new(SessionPhase::NotStarted),
            done_tx,
            done_rx,
        }
    }

    /// Returns the current phase.
    #[inline]
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    /// Marks the session as running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] unless the session is in
    /// [`SessionPhase::NotStarted`]; `run()` is a once-only operation.
    pub fn begin_run(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        match *phase {
            SessionPhase::NotStarted => {
                *phase = SessionPhase::Running;
                Ok(())
            }
            current => Err(Error::config(format!(
                "run() is only valid once per runner instance (phase: {current:?})"
            ))),
        }
    }

    /// Attempts to start teardown.
    ///
    /// Exactly one caller ever receives [`ExitDecision::Proceed`]; that
    /// caller must call [`ExitGate::finish_exit`] when done.
    #[must_use]
    pub fn begin_exit(&self) -> ExitDecision {
        let mut phase = self.phase.lock();
        match *phase {
            SessionPhase::NotStarted | SessionPhase::Running => {
                *phase = SessionPhase::Exiting;
                ExitDecision::Proceed
            }
            SessionPhase::Exiting => ExitDecision::InProgress(self.done_rx.clone()),
            SessionPhase::Exited => ExitDecision::AlreadyExited,
        }
    }

    /// Marks teardown complete and releases all waiting triggers.
    pub fn finish_exit(&self) {
        *self.phase.lock() = SessionPhase::Exited;
        let _ = self.done_tx.send(true);
    }

    /// Returns `true` once teardown has started or finished.
    #[inline]
    #[must_use]
    pub fn is_exiting_or_exited(&self) -> bool {
        matches!(
            *self.phase.lock(),
            SessionPhase::Exiting | SessionPhase::Exited
        )
    }
}

impl Default for ExitGate {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_phase() {
        let gate = ExitGate::new();
        assert_eq!(gate.phase(), SessionPhase::NotStarted);
        assert!(!gate.is_exiting_or_exited());
    }

    #[test]
    fn test_begin_run_transitions_to_running() {
        let gate = ExitGate::new();
        gate.begin_run().expect("first run");
        assert_eq!(gate.phase(), SessionPhase::Running);
    }

    #[test]
    fn test_begin_run_twice_fails() {
        let gate = ExitGate::new();
        gate.begin_run().expect("first run");
        assert!(gate.begin_run().is_err());
    }

    #[test]
    fn test_exit_before_run_proceeds() {
        let gate = ExitGate::new();
        assert!(matches!(gate.begin_exit(), ExitDecision::Proceed));
        assert_eq!(gate.phase(), SessionPhase::Exiting);
    }

    #[test]
    fn test_only_first_exit_proceeds() {
        let gate = ExitGate::new();
        gate.begin_run().expect("run");

        assert!(matches!(gate.begin_exit(), ExitDecision::Proceed));
        assert!(matches!(gate.begin_exit(), ExitDecision::InProgress(_)));
        assert!(matches!(gate.begin_exit(), ExitDecision::InProgress(_)));

        gate.finish_exit();
        assert!(matches!(gate.begin_exit(), ExitDecision::AlreadyExited));
        assert_eq!(gate.phase(), SessionPhase::Exited);
    }

    #[tokio::test]
    async fn test_waiters_released_on_finish() {
        let gate = std::sync::Arc::new(ExitGate::new());
        assert!(matches!(gate.begin_exit(), ExitDecision::Proceed));

        let ExitDecision::InProgress(mut rx) = gate.begin_exit() else {
            panic!("expected InProgress");
        };

        let waiter = tokio::spawn(async move {
            rx.wait_for(|done| *done).await.expect("gate alive");
        });

        gate.finish_exit();
        waiter.await.expect("waiter completes");
    }
}
