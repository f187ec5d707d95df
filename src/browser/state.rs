//! Persisted browser state
//!
//! Snapshot of cookies and per-origin localStorage, stored as JSON so a later
//! run can pick up an authenticated browsing context without logging in again.
//! The on-disk document round-trips exactly: `{ "cookies": [...],
//! "origins": [{ "origin": ..., "localStorage": [...] }] }`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::BrowserError;

/// One persisted cookie record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Seconds since the UNIX epoch. Absent for session cookies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

/// One localStorage key/value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub name: String,
    pub value: String,
}

/// localStorage contents for a single origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginState {
    pub origin: String,
    #[serde(default)]
    pub local_storage: Vec<StorageEntry>,
}

/// Snapshot of cookies and localStorage across all open pages' origins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<StoredCookie>,
    #[serde(default)]
    pub origins: Vec<OriginState>,
}

impl StorageState {
    /// Load a snapshot from disk.
    ///
    /// Malformed content fails with `CorruptState` and is never silently
    /// ignored.
    pub fn load(path: &Path) -> Result<Self, BrowserError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            BrowserError::CorruptState(format!("{}: {}", path.display(), e))
        })
    }

    /// Write the snapshot to disk atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), BrowserError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BrowserError::Configuration(format!(
                        "state directory {} is not writable: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BrowserError::CorruptState(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        info!(
            "Saved browser state to {} ({} cookies, {} origins)",
            path.display(),
            self.cookies.len(),
            self.origins.len()
        );
        Ok(())
    }
}
