//! Staging area for downloaded service packages.
//!
//! Packages are unpacked to `<root>/<name>/<version>`, the same layout as
//! the service root, so the pending area can be read with the ordinary
//! manifest logic and installed with a directory move.

use std::fs;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use svc_meta::{ServiceSummary, ServiceVersion};
use tar::Archive;
use tracing::{debug, info, warn};

use crate::io::{move_dir, remove_path};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct PendingUpdateCache {
    root: PathBuf,
}

impl PendingUpdateCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn package_dir(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(name).join(version)
    }

    /// Checked `package_dir`: `name` must be a single plain path component
    /// and `version` a complete `M.m.u` version.
    fn checked_package_dir(&self, name: &str, version: &str) -> Result<PathBuf> {
        check_identity(name, version)?;
        Ok(self.package_dir(name, version))
    }

    /// Summaries of every valid package in the staging area. Packages whose
    /// manifest fails to parse are skipped with a warning.
    pub fn cached(&self) -> Vec<ServiceSummary> {
        let mut out = Vec::new();
        for name_dir in subdirectories(&self.root) {
            for version_dir in subdirectories(&name_dir) {
                match ServiceSummary::detect(&version_dir) {
                    Ok(summary) if summary.has_identity() => out.push(summary),
                    Ok(_) => warn!(
                        path = %version_dir.display(),
                        "pending package has no identity, skipping"
                    ),
                    Err(e) => warn!(
                        path = %version_dir.display(),
                        error = %e,
                        "pending package unreadable, skipping"
                    ),
                }
            }
        }
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    pub fn summary(&self, name: &str, version: &str) -> Option<ServiceSummary> {
        let dir = self.checked_package_dir(name, version).ok()?;
        ServiceSummary::detect(&dir).ok()
    }

    pub fn is_cached(&self, name: &str, version: &str) -> bool {
        self.summary(name, version).is_some()
    }

    /// Unpack a gzip-compressed tar package into the staging area,
    /// replacing any earlier copy of the same version.
    ///
    /// The package is unpacked next to its final location first and only
    /// moved into place once its manifest checks out.
    pub fn save(&self, name: &str, version: &str, package: &[u8]) -> Result<ServiceSummary> {
        let dest = self.checked_package_dir(name, version)?;
        let unpack_err = |reason: String| Error::Unpack {
            name: name.to_string(),
            version: version.to_string(),
            reason,
        };

        let staging = self.root.join(format!(".{name}_{version}.partial"));
        remove_path(&staging)?;
        fs::create_dir_all(&staging).map_err(|e| Error::io(&staging, e))?;

        let mut archive = Archive::new(GzDecoder::new(package));
        if let Err(e) = archive.unpack(&staging) {
            remove_path(&staging)?;
            return Err(unpack_err(e.to_string()));
        }

        move_dir(&staging, &dest)?;

        match ServiceSummary::detect(&dest) {
            Ok(summary) => {
                info!(name, version, "package staged for install");
                Ok(summary)
            }
            Err(e) => {
                remove_path(&dest)?;
                self.remove_empty_parent(name);
                Err(unpack_err(format!("package has no valid manifest: {e}")))
            }
        }
    }

    /// Move a staged package into `<service_root>/<name>/<version>`,
    /// replacing an existing install of that version.
    pub fn install(&self, name: &str, version: &str, service_root: &Path) -> Result<PathBuf> {
        let src = self.checked_package_dir(name, version)?;
        if !src.is_dir() {
            return Err(Error::NotCached {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
        let dest = service_root.join(name).join(version);
        move_dir(&src, &dest)?;
        self.remove_empty_parent(name);
        info!(name, version, dest = %dest.display(), "installed pending package");
        Ok(dest)
    }

    /// Drop one staged package.
    pub fn remove(&self, name: &str, version: &str) -> Result<()> {
        remove_path(&self.checked_package_dir(name, version)?)?;
        self.remove_empty_parent(name);
        Ok(())
    }

    /// Empty the whole staging area.
    pub fn purge(&self) -> Result<()> {
        remove_path(&self.root)?;
        info!(root = %self.root.display(), "purged pending update cache");
        Ok(())
    }

    fn remove_empty_parent(&self, name: &str) {
        let parent = self.root.join(name);
        let empty = fs::read_dir(&parent).map(|mut d| d.next().is_none()).unwrap_or(false);
        if !empty {
            return;
        }
        match fs::remove_dir(&parent) {
            Ok(()) => debug!(path = %parent.display(), "removed empty pending directory"),
            Err(e) => warn!(
                path = %parent.display(),
                error = %e,
                "failed to remove empty pending directory"
            ),
        }
    }
}

/// Reject identities that would not map to exactly `<name>/<version>`
/// below a root, such as `../x`, `.hidden` or a partial version.
fn check_identity(name: &str, version: &str) -> Result<()> {
    let invalid = |reason: &str| Error::Unpack {
        name: name.to_string(),
        version: version.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(invalid("service name is not a plain directory name"));
    }
    match ServiceVersion::parse(version) {
        Ok(v) if v.is_complete() && v.to_string() == version => Ok(()),
        _ => Err(invalid("version must have the form MAJOR.MINOR.MICRO")),
    }
}

fn subdirectories(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    dirs.sort();
    dirs
}
