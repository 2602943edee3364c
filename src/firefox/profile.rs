//! Firefox profile preparation.
//!
//! A run session owns exactly one profile directory:
//!
//! - no caller profile: a fresh temp directory, deleted on drop;
//! - caller profile without `keep_profile_changes`: a disposable copy
//!   of the caller's directory, so the original is never mutated;
//! - caller profile with `keep_profile_changes`: the directory itself.
//!
//! The session writes development preferences to `user.js` and, for
//! proxy installs, drops an extension proxy file pointing at the
//! extension's source directory.

// ============================================================================
// Imports
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::error::{Error, Result};
use crate::runner::ExtensionDescriptor;

use super::preferences::FirefoxPreference;

// ============================================================================
// Constants
// ============================================================================

/// Header comment for `user.js`.
const USER_JS_HEADER: &str = "// webext-runner user.js\n\
                              // Auto-generated preferences for extension development\n\n";

// ============================================================================
// Profile
// ============================================================================

/// A Firefox profile directory owned by one run session.
pub struct Profile {
    /// Keeps a temp directory alive until the profile is dropped.
    _temp_dir: Option<TempDir>,

    /// Path to the profile directory.
    path: PathBuf,
}

// ============================================================================
// Profile - Constructors
// ============================================================================

impl Profile {
    /// Creates a fresh temporary profile.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Profile`] if the temp directory cannot be
    /// created.
    pub fn new_temp() -> Result<Self> {
        let temp_dir = TempDir::with_prefix("webext-runner-profile-")
            .map_err(|e| Error::profile(format!("Failed to create temp profile: {e}")))?;

        let path = temp_dir.path().to_path_buf();
        debug!(path = %path.display(), "Created temporary profile");

        Ok(Self {
            _temp_dir: Some(temp_dir),
            path,
        })
    }

    /// Prepares the session profile from runner parameters.
    ///
    /// A caller-supplied directory is copied into a disposable temp
    /// directory unless `keep_profile_changes` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Profile`] if the directory is missing or the
    /// copy fails.
    pub fn prepare(profile_dir: Option<&Path>, keep_profile_changes: bool) -> Result<Self> {
        let Some(source) = profile_dir else {
            return Self::new_temp();
        };

        if !source.is_dir() {
            return Err(Error::profile(format!(
                "Profile directory does not exist: {}",
                source.display()
            )));
        }

        if keep_profile_changes {
            debug!(path = %source.display(), "Using caller profile in place");
            return Ok(Self {
                _temp_dir: None,
                path: source.to_path_buf(),
            });
        }

        let temp_dir = TempDir::with_prefix("webext-runner-profile-")
            .map_err(|e| Error::profile(format!("Failed to create temp profile: {e}")))?;
        copy_dir_recursive(source, temp_dir.path())?;

        let path = temp_dir.path().to_path_buf();
        debug!(
            source = %source.display(),
            copy = %path.display(),
            "Copied caller profile into disposable directory"
        );

        Ok(Self {
            _temp_dir: Some(temp_dir),
            path,
        })
    }
}

// ============================================================================
// Profile - Accessors
// ============================================================================

impl Profile {
    /// Returns the path to the profile directory.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the extensions directory, creating it if necessary.
    fn extensions_dir(&self) -> Result<PathBuf> {
        let dir = self.path.join("extensions");
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                Error::profile(format!(
                    "Failed to create extensions directory at {}: {e}",
                    dir.display()
                ))
            })?;
        }
        Ok(dir)
    }
}

// ============================================================================
// Profile - Preferences
// ============================================================================

impl Profile {
    /// Writes preferences to `user.js`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Profile`] if the file cannot be written.
    pub fn write_prefs(&self, prefs: &[FirefoxPreference]) -> Result<()> {
        let file_path = self.path.join("user.js");

        let mut content = String::from(USER_JS_HEADER);
        for pref in prefs {
            content.push_str(&pref.to_user_pref_line());
            content.push('\n');
        }

        fs::write(&file_path, content).map_err(|e| {
            Error::profile(format!(
                "Failed to write user.js at {}: {e}",
                file_path.display()
            ))
        })?;

        debug!(
            path = %file_path.display(),
            pref_count = prefs.len(),
            "Wrote preferences to user.js"
        );

        Ok(())
    }

    /// Returns the preferences for a development run.
    ///
    /// Enables the remote debugging server and unsigned extensions;
    /// silences first-run UI, session restore, updates, and telemetry
    /// so a disposable profile starts clean every time.
    #[must_use]
    pub fn development_prefs() -> Vec<FirefoxPreference> {
        vec![
            // Remote debugging control channel.
            FirefoxPreference::new("devtools.debugger.remote-enabled", true),
            FirefoxPreference::new("devtools.debugger.prompt-connection", false),
            FirefoxPreference::new("devtools.chrome.enabled", true),
            // Development extensions are unsigned.
            FirefoxPreference::new("xpinstall.signatures.required", false),
            FirefoxPreference::new("extensions.autoDisableScopes", 0),
            FirefoxPreference::new("extensions.update.enabled", false),
            // Fast, quiet startup.
            FirefoxPreference::new("browser.startup.page", 0),
            FirefoxPreference::new("browser.shell.checkDefaultBrowser", false),
            FirefoxPreference::new("browser.startup.homepage_override.mstone", "ignore"),
            FirefoxPreference::new("browser.sessionstore.resume_from_crash", false),
            FirefoxPreference::new("browser.warnOnQuit", false),
            FirefoxPreference::new("startup.homepage_welcome_url", "about:blank"),
            // No updates or telemetry from a dev profile.
            FirefoxPreference::new("app.update.service.enabled", false),
            FirefoxPreference::new("toolkit.telemetry.enabled", false),
            FirefoxPreference::new("datareporting.policy.dataSubmissionEnabled", false),
        ]
    }
}

// ============================================================================
// Profile - Proxy install
// ============================================================================

impl Profile {
    /// Installs an extension by proxy file.
    ///
    /// Writes `<profile>/extensions/<id>` containing the extension's
    /// source directory path, so Firefox loads the sources in place and
    /// live edits are picked up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the extension manifest declares
    /// no gecko id (a proxy file needs an explicit id), or
    /// [`Error::Profile`] on write failure.
    pub fn install_proxy(&self, extension: &ExtensionDescriptor) -> Result<()> {
        let id = extension.computed_id().ok_or_else(|| {
            Error::config(format!(
                "Proxy install requires an explicit gecko id in the manifest of {}",
                extension.source_dir.display()
            ))
        })?;

        let proxy_path = self.extensions_dir()?.join(id);
        let source = extension.source_dir.to_string_lossy();

        fs::write(&proxy_path, source.as_bytes()).map_err(|e| {
            Error::profile(format!(
                "Failed to write extension proxy file at {}: {e}",
                proxy_path.display()
            ))
        })?;

        debug!(
            extension_id = id,
            proxy = %proxy_path.display(),
            source = %source,
            "Installed extension proxy file"
        );

        Ok(())
    }
}

// ============================================================================
// Private Helpers
// ============================================================================

/// Recursively copies a directory and all its contents.
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst).map_err(Error::Io)?;
    }

    for entry in fs::read_dir(src).map_err(Error::Io)? {
        let entry = entry.map_err(Error::Io)?;
        let file_type = entry.file_type().map_err(Error::Io)?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).map_err(Error::Io)?;
        }
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_profile_cleanup_on_drop() {
        let path = {
            let profile = Profile::new_temp().expect("create temp profile");
            let path = profile.path().to_path_buf();
            assert!(path.exists());
            path
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_prepare_without_dir_creates_temp() {
        let profile = Profile::prepare(None, false).expect("prepare");
        assert!(profile.path().is_dir());
    }

    #[test]
    fn test_prepare_copies_caller_profile() {
        let source = tempfile::tempdir().expect("source dir");
        fs::write(source.path().join("prefs.js"), "// existing prefs\n").expect("seed");

        let profile = Profile::prepare(Some(source.path()), false).expect("prepare");
        assert_ne!(profile.path(), source.path());
        assert!(profile.path().join("prefs.js").exists());

        // Mutating the session copy leaves the original untouched.
        fs::write(profile.path().join("user.js"), "user_pref(\"x\", 1);\n").expect("write");
        assert!(!source.path().join("user.js").exists());
    }

    #[test]
    fn test_prepare_keep_profile_changes_uses_dir_in_place() {
        let source = tempfile::tempdir().expect("source dir");
        let profile = Profile::prepare(Some(source.path()), true).expect("prepare");
        assert_eq!(profile.path(), source.path());
    }

    #[test]
    fn test_prepare_missing_dir_fails() {
        let result = Profile::prepare(Some(Path::new("/nonexistent/profile-dir")), false);
        assert!(matches!(result, Err(Error::Profile { .. })));
    }

    #[test]
    fn test_write_prefs_content() {
        let profile = Profile::new_temp().expect("profile");
        profile
            .write_prefs(&Profile::development_prefs())
            .expect("write prefs");

        let content =
            fs::read_to_string(profile.path().join("user.js")).expect("read user.js");
        assert!(content.contains("user_pref(\"devtools.debugger.remote-enabled\", true);"));
        assert!(content.contains("user_pref(\"devtools.debugger.prompt-connection\", false);"));
        assert!(content.contains("user_pref(\"xpinstall.signatures.required\", false);"));
    }

    #[test]
    fn test_install_proxy_writes_source_path() {
        let ext_dir = tempfile::tempdir().expect("ext dir");
        fs::write(
            ext_dir.path().join("manifest.json"),
            r#"{
                "name": "ext",
                "version": "1.0",
                "manifest_version": 2,
                "browser_specific_settings": {"gecko": {"id": "dev@example.com"}}
            }"#,
        )
        .expect("manifest");

        let descriptor = ExtensionDescriptor::validated(ext_dir.path()).expect("descriptor");
        let profile = Profile::new_temp().expect("profile");
        profile.install_proxy(&descriptor).expect("proxy install");

        let proxy_path = profile.path().join("extensions").join("dev@example.com");
        let content = fs::read_to_string(proxy_path).expect("read proxy file");
        assert_eq!(content, ext_dir.path().to_string_lossy());
    }

    #[test]
    fn test_install_proxy_requires_gecko_id() {
        let descriptor = ExtensionDescriptor::new("/src/no-id-ext");
        let profile = Profile::new_temp().expect("profile");
        let result = profile.install_proxy(&descriptor);
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
