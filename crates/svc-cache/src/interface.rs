//! Cache of service descriptions keyed by `(name, version)`.
//!
//! Entries live at `<root>/<name>_<version>.json`. The file's modification
//! time is the entry's stored time: an entry is only trusted while it is at
//! least as new as the service's manifest.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use svc_meta::ServiceDescription;
use tracing::{debug, warn};

use crate::io::{remove_path, write_atomic};
use crate::{Error, Result};

/// Disk store of [`ServiceDescription`]s.
///
/// Owned by whoever drives scanning and passed around by reference; there
/// is no process-wide instance.
#[derive(Debug, Clone)]
pub struct InterfaceCache {
    root: PathBuf,
}

impl InterfaceCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the entry for `(name, version)`, or `None` when either part
    /// is empty.
    pub fn entry_path(&self, name: &str, version: &str) -> Option<PathBuf> {
        if name.is_empty() || version.is_empty() {
            return None;
        }
        Some(self.root.join(format!("{name}_{version}.json")))
    }

    /// True iff an entry exists and was stored at or after `t`.
    pub fn is_newer_than(&self, name: &str, version: &str, t: SystemTime) -> bool {
        let Some(path) = self.entry_path(name, version) else {
            return false;
        };
        fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(|stored| stored >= t)
            .unwrap_or(false)
    }

    /// Load the cached description. Missing and corrupt entries are both a
    /// miss.
    pub fn get(&self, name: &str, version: &str) -> Option<ServiceDescription> {
        let path = self.entry_path(name, version)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "interface cache entry unreadable");
                return None;
            }
        };
        match serde_json::from_slice::<ServiceDescription>(&bytes) {
            Ok(description) => Some(description),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "interface cache entry corrupt, ignoring"
                );
                None
            }
        }
    }

    /// Store `description`, replacing any previous entry.
    pub fn set(&self, name: &str, version: &str, description: &ServiceDescription) -> Result<()> {
        let Some(path) = self.entry_path(name, version) else {
            warn!(name, version, "not caching description of a service without identity");
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(description)?;
        write_atomic(&path, &bytes)?;
        debug!(name, version, "cached service description");
        Ok(())
    }

    /// Delete the entry for `(name, version)` if present.
    pub fn purge(&self, name: &str, version: &str) -> Result<()> {
        let Some(path) = self.entry_path(name, version) else {
            return Ok(());
        };
        remove_path(&path)?;
        debug!(name, version, "purged cached service description");
        Ok(())
    }

    /// Delete every entry in the cache.
    pub fn clear(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io(&self.root, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.root, e))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                remove_path(&path)?;
            }
        }
        Ok(())
    }
}
