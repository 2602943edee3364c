//! Firefox extension runner.
//!
//! The Firefox path launches the browser with its remote debugging
//! server enabled, connects a [`rdp::RemoteFirefox`] client over the
//! length-framed TCP control channel, and installs each extension as a
//! temporary add-on so it can be reloaded in place. With `pre_install`
//! the extensions are installed by proxy file in the profile instead,
//! at the cost of remote reloading.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`port`] | Free-port discovery for the debug server |
//! | [`rdp`] | Remote debugging protocol client |
//! | [`profile`] | Profile preparation and proxy installs |
//! | [`preferences`] | `user.js` serialization |

// ============================================================================
// Submodules
// ============================================================================

/// Free-port discovery for the remote debugging server.
pub mod port;

/// Firefox preference serialization.
pub mod preferences;

/// Profile preparation.
pub mod profile;

/// Remote debugging protocol client.
pub mod rdp;

// ============================================================================
// Re-exports
// ============================================================================

pub use port::PortFinder;
pub use preferences::{FirefoxPreference, PreferenceValue};
pub use profile::Profile;
pub use rdp::{PacketDecoder, RdpClient, RdpEvent, RemoteFirefox};

// ============================================================================
// Imports
// ============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::BrowserProcess;
use crate::runner::{
    CleanupCoordinator, CleanupFn, ExitDecision, ExitGate, ExtensionRunner, RunnerParams,
};

// ============================================================================
// Constants
// ============================================================================

/// Preferred remote debugging port; the finder verifies it is free.
const DEFAULT_DEBUGGER_PORT: u16 = 6005;

// ============================================================================
// Launch arguments
// ============================================================================

/// Computes the Firefox launch arguments.
///
/// Debugger and profile flags first, then caller args, then one
/// `--url <u>` pair per start URL.
#[must_use]
pub fn firefox_launch_args(port: u16, profile_path: &Path, params: &RunnerParams) -> Vec<String> {
    let mut args = vec![
        "-start-debugger-server".to_string(),
        port.to_string(),
        "-profile".to_string(),
        profile_path.display().to_string(),
        "-foreground".to_string(),
        "-no-remote".to_string(),
    ];

    args.extend(params.binary_args.iter().cloned());

    for url in &params.start_urls {
        args.push("--url".to_string());
        args.push(url.clone());
    }

    args
}

// ============================================================================
// Session state
// ============================================================================

/// An extension installed over the control channel.
#[derive(Debug, Clone)]
struct InstalledExtension {
    source_dir: PathBuf,
    addon_id: String,
}

/// Mutable per-session state, populated as setup steps complete.
#[derive(Default)]
struct SessionState {
    process: Option<BrowserProcess>,
    remote: Option<RemoteFirefox>,
    profile: Option<Profile>,
    installed: Vec<InstalledExtension>,
    setup_error: Option<String>,
}

struct FirefoxInner {
    params: RunnerParams,
    gate: ExitGate,
    cleanup: CleanupCoordinator,
    /// Held for the whole of `run()`; `exit()` acquires it to wait for
    /// an in-flight setup to settle.
    run_lock: tokio::sync::Mutex<()>,
    session: Mutex<SessionState>,
}

// ============================================================================
// FirefoxRunner
// ============================================================================

/// Runs one or more extensions in a development Firefox session.
#[derive(Clone)]
pub struct FirefoxRunner {
    inner: Arc<FirefoxInner>,
}

impl FirefoxRunner {
    /// Creates a runner; nothing is launched until `run()`.
    #[must_use]
    pub fn new(params: RunnerParams) -> Self {
        Self {
            inner: Arc::new(FirefoxInner {
                params,
                gate: ExitGate::new(),
                cleanup: CleanupCoordinator::new(),
                run_lock: tokio::sync::Mutex::new(()),
                session: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Resolves the Firefox binary, validating an explicit path.
    fn resolve_binary(&self) -> Result<PathBuf> {
        match &self.inner.params.binary {
            Some(path) => {
                // Bare command names resolve through PATH at spawn time.
                if path.components().count() > 1 && !path.exists() {
                    return Err(Error::binary_not_found(path));
                }
                Ok(path.clone())
            }
            None => Ok(PathBuf::from("firefox")),
        }
    }

    /// Performs the full setup sequence.
    async fn try_setup(&self) -> Result<()> {
        let params = &self.inner.params;
        params.validate()?;
        let binary = self.resolve_binary()?;

        let port = PortFinder::new().find(DEFAULT_DEBUGGER_PORT).await?;

        let profile = Profile::prepare(
            params.profile_dir.as_deref(),
            params.keep_profile_changes,
        )?;
        profile.write_prefs(&Profile::development_prefs())?;

        if params.pre_install {
            for extension in &params.extensions {
                profile.install_proxy(extension)?;
            }
        }

        let args = firefox_launch_args(port, profile.path(), params);
        let process = BrowserProcess::launch(&binary, &args)?;

        {
            let mut session = self.inner.session.lock();
            session.profile = Some(profile);
            session.process = Some(process.clone());
        }

        if params.pre_install {
            debug!("Proxy install selected; skipping remote debugging connection");
        } else {
            let remote = RemoteFirefox::connect(port).await?;

            let mut installed = Vec::with_capacity(params.extensions.len());
            for extension in &params.extensions {
                let addon_id = remote
                    .install_temporary_addon(&extension.source_dir)
                    .await?;
                installed.push(InstalledExtension {
                    source_dir: extension.source_dir.clone(),
                    addon_id,
                });
            }

            let mut session = self.inner.session.lock();
            session.remote = Some(remote);
            session.installed = installed;
        }

        self.arm_exit_watch(&process);
        info!(port, pid = process.pid(), "Firefox session running");
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
            info!("Firefox closed; tearing down session");
            if let Err(e) = ExtensionRunner::exit(&runner).await {
                warn!(error = %e, "Teardown after browser close failed");
            }
        });
    }

    /// The single teardown cycle; only the exit-gate winner runs this.
    async fn teardown(&self) {
        debug!("Tearing down Firefox session");
        self.inner.cleanup.run_all().await;

        let (remote, process, profile) = {
            let mut session = self.inner.session.lock();
            session.installed.clear();
            (
                session.remote.take(),
                session.process.take(),
                session.profile.take(),
            )
        };

        if let Some(remote) = remote {
            remote.disconnect();
        }
        if let Some(process) = process {
            process.kill().await;
        }
        // Dropping the profile removes a temp directory, if any.
        drop(profile);

        self.inner.gate.finish_exit();
        info!("Firefox session ended");
    }
}

// ============================================================================
// FirefoxRunner - ExtensionRunner
// ============================================================================

#[async_trait]
impl ExtensionRunner for FirefoxRunner {
    fn name(&self) -> &'static str {
        "Firefox"
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
        let (remote, installed) = {
            let session = self.inner.session.lock();
            (session.remote.clone(), session.installed.clone())
        };

        let Some(remote) = remote else {
            return Err(Error::reload(
                "No active control channel; run() must complete first \
                 (proxy installs cannot be reloaded remotely)",
            ));
        };

        match source_dir {
            Some(dir) => {
                let extension = installed
                    .iter()
                    .find(|e| e.source_dir == dir)
                    .ok_or_else(|| {
                        Error::reload(format!(
                            "No installed extension with source directory {}",
                            dir.display()
                        ))
                    })?;
                remote.reload_addon(&extension.addon_id).await
            }
            None => {
                for extension in &installed {
                    remote.reload_addon(&extension.addon_id).await?;
                }
                Ok(())
            }
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

    use crate::runner::ExtensionDescriptor;

    fn params() -> RunnerParams {
        RunnerParams::new(vec![ExtensionDescriptor::new("/src/my-ext")])
    }

    #[test]
    fn test_launch_args_exact_list() {
        let params = params()
            .with_binary_args(["-headless"])
            .with_start_urls(["https://one.test", "https://two.test"]);

        let args = firefox_launch_args(6005, Path::new("/tmp/profile"), &params);
        assert_eq!(
            args,
            vec![
                "-start-debugger-server".to_string(),
                "6005".to_string(),
                "-profile".to_string(),
                "/tmp/profile".to_string(),
                "-foreground".to_string(),
                "-no-remote".to_string(),
                "-headless".to_string(),
                "--url".to_string(),
                "https://one.test".to_string(),
                "--url".to_string(),
                "https://two.test".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_reload_before_run_is_rejected() {
        let runner = FirefoxRunner::new(params());
        let err = runner.reload(None).await.unwrap_err();
        assert!(matches!(err, Error::Reload { .. }));
    }

    #[tokio::test]
    async fn test_exit_without_run_resolves() {
        let runner = FirefoxRunner::new(params());
        runner.exit().await.expect("exit is safe before run");
        runner.exit().await.expect("and idempotent");
    }

    #[tokio::test]
    async fn test_setup_failure_then_exit_resolves() {
        let runner = FirefoxRunner::new(
            params().with_binary("/nonexistent/dir/firefox"),
        );

        let run_err = runner.run().await.unwrap_err();
        assert!(matches!(run_err, Error::BinaryNotFound { .. }));

        // The recorded setup error is swallowed by teardown.
        runner.exit().await.expect("exit resolves after failed run");
    }

    #[tokio::test]
    async fn test_run_after_exit_is_rejected() {
        let runner = FirefoxRunner::new(params());
        runner.exit().await.expect("exit");
        assert!(runner.run().await.is_err());
    }

    #[test]
    fn test_runner_name() {
        let runner = FirefoxRunner::new(params());
        assert_eq!(runner.name(), "Firefox");
    }
}
