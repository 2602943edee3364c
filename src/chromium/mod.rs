//! Chromium extension runner.
//!
//! Chromium sessions load the development extensions directly through
//! `--load-extension`, with the generated reload-manager companion
//! first in the list. Reload commands travel over the companion's
//! WebSocket connection back to [`reload::ReloadManagerChannel`].
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`companion`] | Generated reload-manager extension |
//! | [`reload`] | WebSocket broadcast channel |

// ============================================================================
// Submodules
// ============================================================================

/// Generated reload-manager companion extension.
pub mod companion;

/// WebSocket reload channel.
pub mod reload;

// ============================================================================
// Re-exports
// ============================================================================

pub use companion::CompanionExtension;
pub use reload::ReloadManagerChannel;

// ============================================================================
// Imports
// ============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::BrowserProcess;
use crate::runner::{
    CleanupCoordinator, CleanupFn, ExitDecision, ExitGate, ExtensionRunner, RunnerParams,
};

// ============================================================================
// Launch flags
// ============================================================================

/// The stock flag set for an automated Chromium launch.
///
/// `--disable-extensions` appears here because it belongs to the stock
/// set; [`default_flags`] strips it, since disabling extensions would
/// defeat the whole exercise.
const STOCK_FLAGS: &[&str] = &[
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-breakpad",
    "--disable-client-side-phishing-detection",
    "--disable-default-apps",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-hang-monitor",
    "--disable-popup-blocking",
    "--disable-prompt-on-repost",
    "--disable-sync",
    "--metrics-recording-only",
    "--no-first-run",
    "--password-store=basic",
    "--use-mock-keychain",
];

/// Returns the default launch flags: the stock set minus
/// `--disable-extensions`.
#[must_use]
pub fn default_flags() -> Vec<String> {
    STOCK_FLAGS
        .iter()
        .filter(|flag| **flag != "--disable-extensions")
        .map(|flag| (*flag).to_string())
        .collect()
}

/// Computes the Chromium launch arguments.
///
/// Order: default flags, the `--load-extension` list (companion first),
/// optional `--user-data-dir`, caller binary args, the second and later
/// start URLs as trailing arguments, and finally the first start URL as
/// the dedicated starting URL.
#[must_use]
pub fn chromium_launch_args(
    params: &RunnerParams,
    companion_dir: &Path,
    profile_dir: Option<&Path>,
) -> Vec<String> {
    let mut args = default_flags();

    let mut load_list = vec![companion_dir.display().to_string()];
    load_list.extend(
        params
            .extensions
            .iter()
            .map(|e| e.source_dir.display().to_string()),
    );
    args.push(format!("--load-extension={}", load_list.join(",")));

    if let Some(profile) = profile_dir {
        args.push(format!("--user-data-dir={}", profile.display()));
    }

    args.extend(params.binary_args.iter().cloned());

    let mut start_urls = params.start_urls.iter();
    let starting_url = start_urls.next().cloned();
    args.extend(start_urls.cloned());
    if let Some(url) = starting_url {
        args.push(url);
    }

    args
}

// ============================================================================
// Session state
// ============================================================================

/// Mutable per-session state, populated as setup steps complete.
#[derive(Default)]
struct SessionState {
    process: Option<BrowserProcess>,
    channel: Option<Arc<ReloadManagerChannel>>,
    companion: Option<CompanionExtension>,
    temp_profile: Option<TempDir>,
    setup_error: Option<String>,
}

struct ChromiumInner {
    params: RunnerParams,
    gate: ExitGate,
    cleanup: CleanupCoordinator,
    /// Held for the whole of `run()`; `exit()` acquires it to wait for
    /// an in-flight setup to settle.
    run_lock: tokio::sync::Mutex<()>,
    session: Mutex<SessionState>,
}

// ============================================================================
// ChromiumRunner
// ============================================================================

/// Runs one or more extensions in a development Chromium session.
#[derive(Clone)]
pub struct ChromiumRunner {
    inner: Arc<ChromiumInner>,
}

impl ChromiumRunner {
    /// Creates a runner; nothing is launched until `run()`.
    #[must_use]
    pub fn new(params: RunnerParams) -> Self {
        Self {
            inner: Arc::new(ChromiumInner {
                params,
                gate: ExitGate::new(),
                cleanup: CleanupCoordinator::new(),
                run_lock: tokio::sync::Mutex::new(()),
                session: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Resolves the Chromium binary, validating an explicit path.
    fn resolve_binary(&self) -> Result<PathBuf> {
        match &self.inner.params.binary {
            Some(path) => {
                // Bare command names resolve through PATH at spawn time.
                if path.components().count() > 1 && !path.exists() {
                    return Err(Error::binary_not_found(path));
                }
                Ok(path.clone())
            }
            None => Ok(PathBuf::from("chromium")),
        }
    }

    /// Performs the full setup sequence.
    async fn try_setup(&self) -> Result<()> {
        let params = &self.inner.params;
        params.validate()?;
        let binary = self.resolve_binary()?;

        let channel = Arc::new(ReloadManagerChannel::start().await?);
        let companion = CompanionExtension::generate(channel.port())?;

        // A caller profile is used in place; otherwise the session owns
        // a disposable user-data-dir.
        let temp_profile = match params.profile_dir {
            Some(_) => None,
            None => Some(
                TempDir::with_prefix("webext-runner-chromium-")
                    .map_err(|e| Error::profile(format!("Failed to create user data dir: {e}")))?,
            ),
        };
        let profile_dir = params
            .profile_dir
            .as_deref()
            .or_else(|| temp_profile.as_ref().map(TempDir::path));

        let args = chromium_launch_args(params, companion.dir(), profile_dir);
        let process = BrowserProcess::launch(&binary, &args)?;

        {
            let mut session = self.inner.session.lock();
            session.channel = Some(Arc::clone(&channel));
            session.companion = Some(companion);
            session.temp_profile = temp_profile;
            session.process = Some(process.clone());
        }

        self.arm_exit_watch(&process);
        info!(
            pid = process.pid(),
            reload_port = channel.port(),
            "Chromium session running"
        );
        Ok(())
    }

    /// Spawns the task that converts a browser-initiated close into
    /// the shared teardown path.
    fn arm_exit_watch(&self, process: &BrowserProcess) {
        let runner = self.clone();
        let mut on_exit = process.on_exit();

        tokio::spawn(async move {
            if on_exit.wait_for(|exited| *exited).await.is_err() {
                return;
            }
            if runner.inner.gate.is_exiting_or_exited() {
                return;
            }
            info!("Chromium closed; tearing down session");
            if let Err(e) = ExtensionRunner::exit(&runner).await {
                warn!(error = %e, "Teardown after browser close failed");
            }
        });
    }

    /// The single teardown cycle; only the exit-gate winner runs this.
    async fn teardown(&self) {
        debug!("Tearing down Chromium session");
        self.inner.cleanup.run_all().await;

        let (channel, process, companion, temp_profile) = {
            let mut session = self.inner.session.lock();
            (
                session.channel.take(),
                session.process.take(),
                session.companion.take(),
                session.temp_profile.take(),
            )
        };

        if let Some(channel) = channel {
            channel.close();
        }
        if let Some(process) = process {
            process.kill().await;
        }
        // Dropping these removes the companion dir and the disposable
        // user-data-dir.
        drop(companion);
        drop(temp_profile);

        self.inner.gate.finish_exit();
        info!("Chromium session ended");
    }
}

// ============================================================================
// ChromiumRunner - ExtensionRunner
// ============================================================================

#[async_trait]
impl ExtensionRunner for ChromiumRunner {
    fn name(&self) -> &'static str {
        "Chromium"
    }

    async fn run(&self) -> Result<()> {
        let _run_guard = self.inner.run_lock.lock().await;
        self.inner.gate.begin_run()?;

        match self.try_setup().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.session.lock().setup_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn reload(&self, source_dir: Option<&Path>) -> Result<()> {
        let channel = self.inner.session.lock().channel.clone();
        let Some(channel) = channel else {
            return Err(Error::reload(
                "No active reload channel; run() must complete first",
            ));
        };

        match source_dir {
            Some(dir) => channel.reload_extension_by_source_dir(dir).await,
            None => channel.reload_all_extensions().await,
        }
    }

    async fn exit(&self) -> Result<()> {
        // Wait for an in-flight run() to settle before tearing down.
        {
            let _run_guard = self.inner.run_lock.lock().await;
            if let Some(err) = self.inner.session.lock().setup_error.take() {
                debug!(error = %err, "Ignoring setup failure during teardown");
            }
        }

        match self.inner.gate.begin_exit() {
            ExitDecision::Proceed => {
                self.teardown().await;
                Ok(())
            }
            ExitDecision::InProgress(mut done) => {
                let _ = done.wait_for(|finished| *finished).await;
                Ok(())
            }
            ExitDecision::AlreadyExited => Ok(()),
        }
    }

    fn register_cleanup(&self, label: String, callback: CleanupFn) {
        self.inner.cleanup.register_boxed(label, callback);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::runner::ExtensionDescriptor;

    fn params() -> RunnerParams {
        RunnerParams::new(vec![ExtensionDescriptor::new("/src/ext1")])
    }

    #[test]
    fn test_default_flags_keep_extensions_enabled() {
        let flags = default_flags();
        assert!(!flags.iter().any(|f| f == "--disable-extensions"));
        assert!(flags.iter().any(|f| f == "--no-first-run"));
    }

    #[test]
    fn test_launch_args_start_url_splitting_exact_list() {
        let params = params().with_start_urls(["url1", "url2", "url3"]);

        let args = chromium_launch_args(&params, Path::new("/tmp/companion"), None);

        let mut expected = default_flags();
        expected.push("--load-extension=/tmp/companion,/src/ext1".to_string());
        expected.push("url2".to_string());
        expected.push("url3".to_string());
        expected.push("url1".to_string());

        assert_eq!(args, expected);
    }

    #[test]
    fn test_launch_args_with_profile_and_binary_args() {
        let params = params()
            .with_binary_args(["--headless=new"])
            .with_start_urls(["https://example.com"]);

        let args = chromium_launch_args(
            &params,
            Path::new("/tmp/companion"),
            Some(Path::new("/tmp/user-data")),
        );

        let mut expected = default_flags();
        expected.push("--load-extension=/tmp/companion,/src/ext1".to_string());
        expected.push("--user-data-dir=/tmp/user-data".to_string());
        expected.push("--headless=new".to_string());
        expected.push("https://example.com".to_string());

        assert_eq!(args, expected);
    }

    #[tokio::test]
    async fn test_reload_before_run_is_rejected() {
        let runner = ChromiumRunner::new(params());
        let err = runner.reload(None).await.unwrap_err();
        assert!(matches!(err, Error::Reload { .. }));
    }

    #[tokio::test]
    async fn test_setup_failure_then_exit_resolves() {
        let runner = ChromiumRunner::new(params().with_binary("/nonexistent/dir/chromium"));

        let run_err = runner.run().await.unwrap_err();
        assert!(matches!(run_err, Error::BinaryNotFound { .. }));

        runner.exit().await.expect("exit resolves after failed run");
        runner.exit().await.expect("and stays idempotent");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_browser_close_triggers_one_teardown() {
        // A shell that exits immediately stands in for a browser the
        // user closed right after startup.
        let runner = ChromiumRunner::new(params().with_binary("/bin/sh"));

        let cleanup_count = Arc::new(Mutex::new(0u32));
        {
            let cleanup_count = Arc::clone(&cleanup_count);
            runner.register_cleanup(
                "count".to_string(),
                Box::new(move || {
                    let cleanup_count = Arc::clone(&cleanup_count);
                    Box::pin(async move {
                        *cleanup_count.lock() += 1;
                        Ok(())
                    })
                }),
            );
        }

        runner.run().await.expect("run");

        // The exit watcher must complete exactly one teardown cycle.
        tokio::time::timeout(Duration::from_secs(10), async {
            while *cleanup_count.lock() == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("teardown after process exit");

        // Explicit exits afterwards share the same cycle.
        runner.exit().await.expect("exit");
        runner.exit().await.expect("exit again");
        assert_eq!(*cleanup_count.lock(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_exits_share_one_teardown() {
        let runner = ChromiumRunner::new(params());

        let cleanup_count = Arc::new(Mutex::new(0u32));
        {
            let cleanup_count = Arc::clone(&cleanup_count);
            runner.register_cleanup(
                "count".to_string(),
                Box::new(move || {
                    let cleanup_count = Arc::clone(&cleanup_count);
                    Box::pin(async move {
                        *cleanup_count.lock() += 1;
                        Ok(())
                    })
                }),
            );
        }

        let first = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.exit().await })
        };
        let second = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.exit().await })
        };

        first.await.expect("join").expect("exit");
        second.await.expect("join").expect("exit");
        assert_eq!(*cleanup_count.lock(), 1);
    }

    #[test]
    fn test_runner_name() {
        let runner = ChromiumRunner::new(params());
        assert_eq!(runner.name(), "Chromium");
    }
}
