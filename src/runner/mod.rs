//! Runner contract and shared session machinery.
//!
//! Both browser targets expose the same surface to the surrounding CLI:
//!
//! | Operation | Purpose |
//! |-----------|---------|
//! | `name` | Human-readable identity ("Firefox" \| "Chromium") |
//! | `run` | Launch process, install extensions, open control channel |
//! | `reload` | Reload one or all extensions over the channel |
//! | `exit` | Idempotent teardown of every launched resource |
//! | `register_cleanup` | Append a teardown callback |
//!
//! The file-system watcher and argument parsing live outside this crate;
//! the watcher calls back into [`ExtensionRunner::reload`] on change.

// ============================================================================
// Imports
// ============================================================================

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::manifest::{self, ManifestData};

// ============================================================================
// Submodules
// ============================================================================

/// Ordered teardown callbacks.
pub mod cleanup;

/// Session lifecycle state machine.
pub mod session;

// ============================================================================
// Re-exports
// ============================================================================

pub use cleanup::{CleanupCoordinator, CleanupFn, CleanupFuture};
pub use session::{ExitDecision, ExitGate, SessionPhase};

// ============================================================================
// ExtensionDescriptor
// ============================================================================

/// One extension under development.
///
/// Owned by the caller and read-only to the runner.
#[derive(Debug, Clone)]
pub struct ExtensionDescriptor {
    /// Directory containing `manifest.json` and the extension sources.
    pub source_dir: PathBuf,

    /// Manifest contents, when the caller has already loaded them.
    pub manifest: Option<ManifestData>,
}

impl ExtensionDescriptor {
    /// Creates a descriptor without manifest data.
    ///
    /// The extension id will be assigned by the target browser at
    /// install time.
    #[inline]
    #[must_use]
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            manifest: None,
        }
    }

    /// Creates a descriptor by loading and validating the manifest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Manifest`] if the manifest is missing or invalid.
    pub fn validated(source_dir: impl Into<PathBuf>) -> Result<Self> {
        let source_dir = source_dir.into();
        let manifest = manifest::load_manifest(&source_dir)?;
        Ok(Self {
            source_dir,
            manifest: Some(manifest),
        })
    }

    /// Returns the extension id derived from the manifest, if declared.
    #[must_use]
    pub fn computed_id(&self) -> Option<&str> {
        self.manifest.as_ref().and_then(ManifestData::gecko_id)
    }
}

// ============================================================================
// RunnerParams
// ============================================================================

/// Immutable configuration for one runner instance.
///
/// Built with `with_*` methods and never mutated after construction.
#[derive(Debug, Clone, Default)]
pub struct RunnerParams {
    /// Extensions to install.
    pub extensions: Vec<ExtensionDescriptor>,

    /// Profile directory supplied by the caller; a temp profile is
    /// created when absent.
    pub profile_dir: Option<PathBuf>,

    /// Browser binary override.
    pub binary: Option<PathBuf>,

    /// Extra arguments inserted before trailing start URLs.
    pub binary_args: Vec<String>,

    /// Page(s) to open on startup.
    pub start_urls: Vec<String>,

    /// Run against the caller's profile directory in place instead of a
    /// disposable copy.
    pub keep_profile_changes: bool,

    /// Firefox only: install by proxy file in the profile instead of a
    /// remote `installTemporaryAddon` request.
    pub pre_install: bool,
}

impl RunnerParams {
    /// Creates params for the given extensions.
    #[must_use]
    pub fn new(extensions: Vec<ExtensionDescriptor>) -> Self {
        Self {
            extensions,
            ..Self::default()
        }
    }

    /// Sets the profile directory.
    #[inline]
    #[must_use]
    pub fn with_profile_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.profile_dir = Some(path.into());
        self
    }

    /// Sets the browser binary override.
    #[inline]
    #[must_use]
    pub fn with_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary = Some(path.into());
        self
    }

    /// Adds extra binary arguments.
    #[inline]
    #[must_use]
    pub fn with_binary_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.binary_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds starting URL(s).
    #[inline]
    #[must_use]
    pub fn with_start_urls(mut self, urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.start_urls.extend(urls.into_iter().map(Into::into));
        self
    }

    /// Keeps changes in the caller-supplied profile.
    #[inline]
    #[must_use]
    pub fn with_keep_profile_changes(mut self) -> Self {
        self.keep_profile_changes = true;
        self
    }

    /// Enables proxy-file installation (Firefox).
    #[inline]
    #[must_use]
    pub fn with_pre_install(mut self) -> Self {
        self.pre_install = true;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no extensions are configured.
    pub fn validate(&self) -> Result<()> {
        if self.extensions.is_empty() {
            return Err(Error::config(
                "At least one extension source directory is required",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// ExtensionRunner
// ============================================================================

/// Uniform contract implemented by the Firefox and Chromium runners.
///
/// # Lifecycle rules
///
/// - The control channel is established before `run()` resolves;
///   `reload()` is only valid afterward.
/// - `exit()` is idempotent: any number of calls, concurrent or
///   sequential, and a browser process closing on its own, all share
///   one teardown cycle.
/// - If `run()` is still in flight when `exit()` is called, `exit()`
///   waits for it to settle and swallows a setup failure (logged at
///   debug level), since the session is being torn down anyway.
#[async_trait]
pub trait ExtensionRunner: Send + Sync {
    /// Human-readable runner identity.
    fn name(&self) -> &'static str;

    /// Launches the browser, installs the extensions, and establishes
    /// the control channel.
    ///
    /// # Errors
    ///
    /// Rejects if any setup step fails; `exit()` afterwards still
    /// safely cleans up whatever partially succeeded.
    async fn run(&self) -> Result<()>;

    /// Reloads one extension (by source directory) or all extensions.
    async fn reload(&self, source_dir: Option<&Path>) -> Result<()>;

    /// Tears the session down: cleanup callbacks in registration
    /// order, control channel closed, browser process terminated if
    /// still alive.
    async fn exit(&self) -> Result<()>;

    /// Appends a teardown callback; callbacks run in registration
    /// order on `exit()`.
    fn register_cleanup(&self, label: String, callback: CleanupFn);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_without_manifest_has_no_id() {
        let descriptor = ExtensionDescriptor::new("/src/my-ext");
        assert_eq!(descriptor.computed_id(), None);
        assert_eq!(descriptor.source_dir, PathBuf::from("/src/my-ext"));
    }

    #[test]
    fn test_validated_descriptor_exposes_gecko_id() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            tmp.path().join("manifest.json"),
            r#"{
                "name": "ext",
                "version": "1.0",
                "manifest_version": 2,
                "browser_specific_settings": {"gecko": {"id": "dev@example.com"}}
            }"#,
        )
        .expect("write manifest");

        let descriptor = ExtensionDescriptor::validated(tmp.path()).expect("validated");
        assert_eq!(descriptor.computed_id(), Some("dev@example.com"));
    }

    #[test]
    fn test_params_builder_chain() {
        let params = RunnerParams::new(vec![ExtensionDescriptor::new("/src/ext")])
            .with_binary("/usr/bin/firefox")
            .with_binary_args(["--headless"])
            .with_start_urls(["https://example.com"])
            .with_profile_dir("/tmp/profile")
            .with_keep_profile_changes()
            .with_pre_install();

        assert_eq!(params.extensions.len(), 1);
        assert_eq!(params.binary, Some(PathBuf::from("/usr/bin/firefox")));
        assert_eq!(params.binary_args, vec!["--headless".to_string()]);
        assert_eq!(params.start_urls, vec!["https://example.com".to_string()]);
        assert!(params.keep_profile_changes);
        assert!(params.pre_install);
        params.validate().expect("valid");
    }

    #[test]
    fn test_params_require_extensions() {
        let params = RunnerParams::new(Vec::new());
        assert!(params.validate().is_err());
    }
}
