//! Collaborators outside the engine: where packages come from and how
//! installed services are removed.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use svc_meta::{ServiceSummary, ServiceVersion};
use svc_resolve::AvailableService;
use tracing::info;

use crate::error::{Error, Result};

/// A distribution point for service packages.
#[async_trait]
pub trait PackageSource: Send + Sync {
    /// Everything the source can offer.
    async fn list(&self) -> Result<Vec<AvailableService>>;

    /// The gzip-compressed tar package of one service version.
    async fn fetch(&self, name: &str, version: &ServiceVersion) -> Result<Vec<u8>>;
}

/// Packages mirrored in a local directory: an `index.json` listing
/// [`AvailableService`]s next to `<name>-<version>.tar.gz` files.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub const INDEX_FILE: &'static str = "index.json";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn package_path(&self, name: &str, version: &ServiceVersion) -> PathBuf {
        self.root.join(format!("{name}-{version}.tar.gz"))
    }
}

#[async_trait]
impl PackageSource for DirectorySource {
    async fn list(&self) -> Result<Vec<AvailableService>> {
        let path = self.root.join(Self::INDEX_FILE);
        let bytes = tokio::fs::read(&path).await.map_err(|e| Error::io(&path, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Source(format!("{}: {e}", path.display())))
    }

    async fn fetch(&self, name: &str, version: &ServiceVersion) -> Result<Vec<u8>> {
        let path = self.package_path(name, version);
        tokio::fs::read(&path).await.map_err(|e| Error::io(&path, e))
    }
}

/// Removes an installed service from disk.
pub trait Uninstaller: Send + Sync {
    fn uninstall(&self, summary: &ServiceSummary) -> Result<()>;
}

/// Deletes the service's version directory, and its name directory once
/// no versions are left.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveDirectory;

impl Uninstaller for RemoveDirectory {
    fn uninstall(&self, summary: &ServiceSummary) -> Result<()> {
        remove_service_dir(summary.path())
    }
}

pub(crate) fn remove_service_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(path, e)),
    }
    if let Some(parent) = path.parent() {
        let empty = fs::read_dir(parent).map(|mut d| d.next().is_none()).unwrap_or(false);
        if empty {
            let _ = fs::remove_dir(parent);
        }
    }
    info!(path = %path.display(), "removed service from disk");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_directory_source_lists_and_fetches() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("index.json"),
            r#"[{ "name": "Echo", "version": "1.1.0", "size": 3 }]"#,
        )
        .unwrap();
        fs::write(temp.path().join("Echo-1.1.0.tar.gz"), b"abc").unwrap();

        let source = DirectorySource::new(temp.path());
        let listed = source.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Echo");

        let bytes = source.fetch("Echo", &listed[0].version).await.unwrap();
        assert_eq!(bytes, b"abc");
        assert!(source.fetch("Echo", &ServiceVersion::new(9, 9, 9)).await.is_err());
    }

    #[test]
    fn test_remove_service_dir_cleans_empty_parent() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("Echo/1.0.0");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("manifest.json"), "{}").unwrap();

        remove_service_dir(&dir).unwrap();

        assert!(!temp.path().join("Echo").exists());
        remove_service_dir(&dir).unwrap();
    }
}
