//! webext-runner - Live-reload extension runner for browser development.
//!
//! This library launches a target browser with a development extension
//! installed, keeps a control channel open to it, and pushes "reload"
//! commands to the running extension when the surrounding tooling
//! detects source changes. Teardown is deterministic and idempotent no
//! matter how the session ends: normal exit, browser crash, setup
//! failure, or user interrupt.
//!
//! # Architecture
//!
//! Two runner implementations share one contract:
//!
//! - **Firefox**: the browser is launched with its remote debugging
//!   server enabled; a TCP client speaking length-framed JSON packets
//!   installs the extensions as temporary add-ons and reloads them.
//! - **Chromium**: the extensions are loaded through
//!   `--load-extension` together with a generated companion extension
//!   that dials back into a local WebSocket server; reloads are
//!   broadcast over that channel.
//!
//! Key design principles:
//!
//! - Each session exclusively owns its process handle, control channel,
//!   and temp directories; cleanup under the exit gate is the only
//!   release path.
//! - Exit is a small state machine (`NotStarted -> Running -> Exiting
//!   -> Exited`), so concurrent triggers (explicit `exit()`, browser
//!   close, setup failure) share exactly one teardown cycle.
//! - Event-driven: process exit and channel traffic push through tasks
//!   and channels, never polling.
//!
//! # Quick Start
//!
//! ```no_run
//! use webext_runner::{ExtensionDescriptor, ExtensionRunner, FirefoxRunner, RunnerParams, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let params = RunnerParams::new(vec![ExtensionDescriptor::new("./my-extension")])
//!         .with_binary("/usr/bin/firefox")
//!         .with_start_urls(["https://example.com"]);
//!
//!     let runner = FirefoxRunner::new(params);
//!     runner.run().await?;
//!
//!     // Called by the file watcher on source changes:
//!     runner.reload(None).await?;
//!
//!     runner.exit().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`runner`] | Uniform runner contract, params, cleanup, exit gate |
//! | [`firefox`] | Firefox runner and remote debugging protocol client |
//! | [`chromium`] | Chromium runner, companion extension, reload channel |
//! | [`process`] | Supervised browser process handle |
//! | [`manifest`] | Extension manifest loading and validation |
//! | [`error`] | Error types and [`Result`] alias |

// ============================================================================
// Modules
// ============================================================================

/// Chromium runner, companion extension, and reload channel.
pub mod chromium;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Firefox runner and remote debugging protocol client.
pub mod firefox;

/// Extension manifest loading and validation.
pub mod manifest;

/// Supervised browser process handle.
pub mod process;

/// Uniform runner contract and shared session machinery.
pub mod runner;

// ============================================================================
// Re-exports
// ============================================================================

// Runner contract
pub use runner::{
    CleanupCoordinator, CleanupFn, ExtensionDescriptor, ExtensionRunner, RunnerParams,
    SessionPhase,
};

// Runner implementations
pub use chromium::{ChromiumRunner, ReloadManagerChannel};
pub use firefox::{FirefoxRunner, PortFinder, RemoteFirefox};

// Process supervision
pub use process::BrowserProcess;

// Manifest collaborator
pub use manifest::{ManifestData, load_manifest};

// Error types
pub use error::{Error, Result};
