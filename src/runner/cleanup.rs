//! Ordered teardown callbacks.
//!
//! Every runner instance carries one [`CleanupCoordinator`]. Callbacks
//! run in registration order during `exit()`; a failing callback is
//! caught and logged, never rethrown, and never prevents the callbacks
//! after it from running.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

// ============================================================================
// Types
// ============================================================================

/// Boxed future returned by a cleanup callback.
pub type CleanupFuture = BoxFuture<'static, Result<()>>;

/// A registered teardown callback.
pub type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send>;

// ============================================================================
// CleanupCoordinator
// ============================================================================

/// Per-session ordered list of teardown callbacks.
///
/// The list is drained when run, so a second invocation (which the exit
/// gate already prevents) would find nothing to do.
pub struct CleanupCoordinator {
    callbacks: Mutex<Vec<(String, CleanupFn)>>,
}

impl CleanupCoordinator {
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Appends a teardown callback.
    ///
    /// The label identifies the callback in teardown logs.
    pub fn register<F, Fut>(&self, label: impl Into<String>, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_boxed(label.into(), Box::new(move || Box::pin(callback())));
    }

    /// Appends an already-boxed teardown callback.
    pub fn register_boxed(&self, label: String, callback: CleanupFn) {
        self.callbacks.lock().push((label, callback));
    }

    /// Returns the number of callbacks not yet run.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Returns `true` if no callbacks are registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }

    /// Runs every registered callback in registration order.
    ///
    /// Failures are logged and swallowed; the full list always runs to
    /// completion before this returns.
    pub async fn run_all(&self) {
        let callbacks: Vec<_> = self.callbacks.lock().drain(..).collect();
        let total = callbacks.len();

        for (label, callback) in callbacks {
            if let Err(e) = callback().await {
                warn!(cleanup = %label, error = %e, "Cleanup callback failed");
            } else {
                debug!(cleanup = %label, "Cleanup callback finished");
            }
        }

        if total > 0 {
            debug!(count = total, "Cleanup callbacks completed");
        }
    }
}

impl Default for CleanupCoordinator {
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

    use std::sync::Arc;

    use crate::error::Error;

    #[tokio::test]
    async fn test_callbacks_run_in_registration_order() {
        let coordinator = CleanupCoordinator::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            coordinator.register(format!("cb-{i}"), move || async move {
                order.lock().push(i);
                Ok(())
            });
        }

        assert_eq!(coordinator.len(), 5);
        coordinator.run_all().await;

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert!(coordinator.is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_callbacks() {
        let coordinator = CleanupCoordinator::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        {
            let order = Arc::clone(&order);
            coordinator.register("first", move || async move {
                order.lock().push("first");
                Ok(())
            });
        }
        coordinator.register("failing", || async {
            Err(Error::reload("socket already closed"))
        });
        {
            let order = Arc::clone(&order);
            coordinator.register("last", move || async move {
                order.lock().push("last");
                Ok(())
            });
        }

        coordinator.run_all().await;
        assert_eq!(*order.lock(), vec!["first", "last"]);
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let coordinator = CleanupCoordinator::new();
        let count = Arc::new(Mutex::new(0u32));

        {
            let count = Arc::clone(&count);
            coordinator.register("once", move || async move {
                *count.lock() += 1;
                Ok(())
            });
        }

        coordinator.run_all().await;
        coordinator.run_all().await;
        assert_eq!(*count.lock(), 1);
    }

    #[tokio::test]
    async fn test_empty_coordinator() {
        let coordinator = CleanupCoordinator::new();
        assert!(coordinator.is_empty());
        coordinator.run_all().await;
    }
}
