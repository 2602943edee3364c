//! Reload-manager companion extension.
//!
//! Chromium has no remote-install channel comparable to the Firefox
//! debugging protocol, so reload commands travel through a privileged
//! companion extension generated at launch time. The companion is
//! loaded first in the `--load-extension` list, dials back into the
//! local WebSocket server, and fans reload commands out to every
//! development extension via the `management` API.

// ============================================================================
// Imports
// ============================================================================

use std::fs;
use std::path::Path;

use serde_json::json;
use tempfile::TempDir;
use tracing::debug;

use crate::error::{Error, Result};
use crate::manifest::{self, ManifestData};

// ============================================================================
// Background script
// ============================================================================

/// Background script template; `__RELOAD_PORT__` is substituted with
/// the WebSocket server port.
const BACKGROUND_JS: &str = r#"(function reloadManager() {
  var socket = new WebSocket('ws://127.0.0.1:__RELOAD_PORT__');

  socket.onmessage = function (event) {
    var message = JSON.parse(event.data);
    if (message.type === 'webExtReloadAllExtensions') {
      reloadAllDevelopmentExtensions();
    }
  };

  function reloadAllDevelopmentExtensions() {
    chrome.management.getAll(function (extensions) {
      extensions.forEach(function (extension) {
        if (extension.installType !== 'development' ||
            extension.id === chrome.runtime.id) {
          return;
        }
        chrome.management.setEnabled(extension.id, false, function () {
          chrome.management.setEnabled(extension.id, true);
        });
      });
    });
  }
})();
"#;

// ============================================================================
// CompanionExtension
// ============================================================================

/// A generated companion extension living in an owned temp directory.
///
/// The directory is removed when the value is dropped, which happens
/// only on the session teardown path.
pub struct CompanionExtension {
    _temp_dir: TempDir,
    manifest: ManifestData,
}

impl CompanionExtension {
    /// Generates the companion extension for a reload server port.
    ///
    /// The written manifest is validated through the same loader as
    /// user extensions before the companion is handed to the launcher.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Profile`] if the files cannot be written, or a
    /// manifest error if the generated manifest fails validation.
    pub fn generate(reload_port: u16) -> Result<Self> {
        let temp_dir = TempDir::with_prefix("webext-runner-companion-")
            .map_err(|e| Error::profile(format!("Failed to create companion dir: {e}")))?;

        let manifest_json = json!({
            "name": "webext-runner Reload Manager",
            "version": "1.0",
            "manifest_version": 2,
            "permissions": ["management", "tabs"],
            "background": {
                "scripts": ["background.js"],
                "persistent": true,
            },
        });

        fs::write(
            temp_dir.path().join("manifest.json"),
            serde_json::to_string_pretty(&manifest_json)?,
        )?;

        let background = BACKGROUND_JS.replace("__RELOAD_PORT__", &reload_port.to_string());
        fs::write(temp_dir.path().join("background.js"), background)?;

        let manifest = manifest::load_manifest(temp_dir.path())?;

        debug!(
            dir = %temp_dir.path().display(),
            reload_port,
            "Generated reload-manager companion extension"
        );

        Ok(Self {
            _temp_dir: temp_dir,
            manifest,
        })
    }

    /// Returns the companion's directory for `--load-extension`.
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        self._temp_dir.path()
    }

    /// Returns the validated companion manifest.
    #[inline]
    #[must_use]
    pub fn manifest(&self) -> &ManifestData {
        &self.manifest
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_manifest_validates() {
        let companion = CompanionExtension::generate(34567).expect("generate");
        let manifest = companion.manifest();

        assert_eq!(manifest.manifest_version, 2);
        assert!(manifest.permissions.iter().any(|p| p == "management"));
        assert!(manifest.permissions.iter().any(|p| p == "tabs"));
    }

    #[test]
    fn test_background_script_carries_port() {
        let companion = CompanionExtension::generate(40123).expect("generate");
        let background =
            fs::read_to_string(companion.dir().join("background.js")).expect("read bg");

        assert!(background.contains("ws://127.0.0.1:40123"));
        assert!(background.contains("webExtReloadAllExtensions"));
        assert!(!background.contains("__RELOAD_PORT__"));
    }

    #[test]
    fn test_directory_removed_on_drop() {
        let dir = {
            let companion = CompanionExtension::generate(34567).expect("generate");
            companion.dir().to_path_buf()
        };
        assert!(!dir.exists());
    }
}
