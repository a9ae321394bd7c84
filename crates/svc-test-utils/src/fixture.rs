//! [`ServiceTree`] builder for engine test scenarios.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use tempfile::TempDir;

/// A temporary engine data directory. Services live under
/// [`service_dir`](Self::service_dir) as `<name>/<version>/manifest.json`,
/// matching the default engine layout.
///
/// # Example
///
/// ```rust,no_run
/// use svc_test_utils::ServiceTree;
///
/// let tree = ServiceTree::new();
/// tree.standalone("Echo", "1.0.0");
/// tree.assert_installed("Echo", "1.0.0");
/// ```
pub struct ServiceTree {
    temp_dir: TempDir,
}

impl Default for ServiceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceTree {
    pub fn new() -> Self {
        let tree = Self {
            temp_dir: TempDir::new().unwrap(),
        };
        fs::create_dir_all(tree.service_dir()).unwrap();
        tree
    }

    /// Root of the data directory.
    pub fn data_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn service_dir(&self) -> PathBuf {
        self.data_dir().join("services")
    }

    pub fn interface_dir(&self) -> PathBuf {
        self.data_dir().join("interfaces")
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.data_dir().join("pending")
    }

    pub fn service_path(&self, name: &str, version: &str) -> PathBuf {
        self.service_dir().join(name).join(version)
    }

    /// Write `manifest` as `<service_dir>/<name>/<version>/manifest.json`.
    pub fn write_manifest(&self, name: &str, version: &str, manifest: &Value) -> PathBuf {
        let dir = self.service_path(name, version);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("manifest.json"), serde_json::to_vec_pretty(manifest).unwrap()).unwrap();
        dir
    }

    pub fn standalone(&self, name: &str, version: &str) -> PathBuf {
        self.write_manifest(name, version, &standalone_manifest())
    }

    pub fn provider(&self, name: &str, version: &str) -> PathBuf {
        self.write_manifest(name, version, &provider_manifest())
    }

    pub fn dependent(
        &self,
        name: &str,
        version: &str,
        provider: &str,
        minversion: &str,
    ) -> PathBuf {
        self.write_manifest(name, version, &dependent_manifest(provider, minversion))
    }

    /// Standalone service that lingers `secs` after its last instance.
    pub fn standalone_with_delay(&self, name: &str, version: &str, secs: u64) -> PathBuf {
        let mut manifest = standalone_manifest();
        manifest["shutdownDelaySecs"] = json!(secs);
        self.write_manifest(name, version, &manifest)
    }

    /// Push the manifest's mtime into the future so the next scan sees it
    /// as changed.
    pub fn touch_manifest(&self, name: &str, version: &str) {
        let path = self.service_path(name, version).join("manifest.json");
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(10))
            .unwrap();
    }

    /// Create an arbitrary directory under the service root.
    pub fn mkdir(&self, relative: &str) -> PathBuf {
        let dir = self.service_dir().join(relative);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Assert that `<name>/<version>/manifest.json` exists.
    ///
    /// # Panics
    /// Panics with a descriptive message if it does not.
    pub fn assert_installed(&self, name: &str, version: &str) {
        let path = self.service_path(name, version).join("manifest.json");
        assert!(path.exists(), "Expected service to be installed: {}", path.display());
    }

    /// Assert that the `<name>/<version>` directory is gone.
    ///
    /// # Panics
    /// Panics with a descriptive message if it exists.
    pub fn assert_removed(&self, name: &str, version: &str) {
        let path = self.service_path(name, version);
        assert!(!path.exists(), "Expected service to be removed: {}", path.display());
    }
}

pub fn standalone_manifest() -> Value {
    json!({
        "type": "standalone",
        "ServiceLibrary": "lib/libservice.so",
        "strings": {
            "en": { "title": "Test service", "summary": "Used by tests" }
        }
    })
}

pub fn provider_manifest() -> Value {
    json!({
        "type": "provider",
        "ServiceLibrary": "lib/libprovider.so",
        "strings": {
            "en": { "title": "Test provider", "summary": "Hosts dependents" }
        }
    })
}

pub fn dependent_manifest(provider: &str, minversion: &str) -> Value {
    json!({
        "type": "dependent",
        "uses": { "service": provider, "minversion": minversion },
        "arguments": { "script": "main.js" },
        "strings": {
            "en": { "title": "Test dependent", "summary": "Runs inside a provider" }
        }
    })
}

/// A gzip-compressed tar package holding `manifest` plus a dummy library.
pub fn package(manifest: &Value) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in [
        ("manifest.json", serde_json::to_vec_pretty(manifest).unwrap()),
        ("lib/libservice.so", b"\x7fELF".to_vec()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data.as_slice()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}
