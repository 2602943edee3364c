//! WebExtension manifest loading and validation.
//!
//! The runner only needs a small slice of `manifest.json`: enough to
//! confirm the directory holds a real extension and to derive the gecko
//! extension id when one is declared. The generated reload-manager
//! extension is validated through the same entry point as user
//! extensions.

// ============================================================================
// Imports
// ============================================================================

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// ManifestData
// ============================================================================

/// Validated `manifest.json` contents.
///
/// Unknown fields are preserved in [`ManifestData::rest`] so callers can
/// inspect browser-specific sections without this module modeling them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestData {
    /// Extension display name.
    pub name: String,

    /// Extension version string.
    pub version: String,

    /// Manifest schema version (2 or 3).
    pub manifest_version: u32,

    /// Requested permissions.
    #[serde(default)]
    pub permissions: Vec<String>,

    /// All remaining manifest fields.
    #[serde(flatten)]
    pub rest: Value,
}

impl ManifestData {
    /// Returns the declared gecko extension id, if any.
    ///
    /// Checks `browser_specific_settings.gecko.id` first, then the
    /// legacy `applications.gecko.id` location.
    #[must_use]
    pub fn gecko_id(&self) -> Option<&str> {
        self.rest
            .pointer("/browser_specific_settings/gecko/id")
            .or_else(|| self.rest.pointer("/applications/gecko/id"))
            .and_then(Value::as_str)
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Loads and validates `manifest.json` from an extension directory.
///
/// # Errors
///
/// Returns [`Error::Manifest`] if the file is missing, unparsable, or
/// lacks a required field (`name`, `version`, `manifest_version`).
pub fn load_manifest(dir: &Path) -> Result<ManifestData> {
    let manifest_path = dir.join("manifest.json");

    let content = fs::read_to_string(&manifest_path)
        .map_err(|e| Error::manifest(dir, format!("manifest.json not readable: {e}")))?;

    let manifest: ManifestData = serde_json::from_str(&content)
        .map_err(|e| Error::manifest(dir, format!("invalid manifest.json: {e}")))?;

    if manifest.name.is_empty() {
        return Err(Error::manifest(dir, "manifest 'name' must not be empty"));
    }
    if manifest.version.is_empty() {
        return Err(Error::manifest(dir, "manifest 'version' must not be empty"));
    }
    if !(2..=3).contains(&manifest.manifest_version) {
        return Err(Error::manifest(
            dir,
            format!(
                "unsupported manifest_version {}",
                manifest.manifest_version
            ),
        ));
    }

    debug!(
        dir = %dir.display(),
        name = %manifest.name,
        version = %manifest.version,
        "Loaded extension manifest"
    );

    Ok(manifest)
}

// ============================================================================
// Tests
// ============================================================================
