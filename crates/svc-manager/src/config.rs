//! Engine configuration.
//!
//! Loaded from TOML. Every key is optional:
//!
//! ```toml
//! service_dir = "/var/lib/svcd/services"
//! runner_path = "/usr/libexec/svc-runner"
//! describe_concurrency = 4
//! blacklist = ["Untrusted", "Echo/0.9.0"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const APP_DIR: &str = "svcd";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Root of installed services, laid out as `<name>/<version>`.
    pub service_dir: PathBuf,
    pub interface_cache_dir: PathBuf,
    /// Staging area for downloaded, not yet installed packages.
    pub pending_dir: PathBuf,
    /// Executable spawned to host every service.
    pub runner_path: PathBuf,
    /// Forwarded to spawned services.
    pub log_level: Option<String>,
    /// Upper bound on services spawned at once while scanning.
    pub describe_concurrency: usize,
    pub describe_timeout_secs: u64,
    /// Wait after killing a process before touching its files.
    pub kill_grace_ms: u64,
    pub locale: String,
    /// `name` or `name/version` entries that may never run.
    pub blacklist: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::rooted_at(Self::default_data_dir())
    }
}

impl EngineConfig {
    /// All engine directories under one data directory.
    pub fn rooted_at(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            service_dir: data_dir.join("services"),
            interface_cache_dir: data_dir.join("interfaces"),
            pending_dir: data_dir.join("pending"),
            runner_path: PathBuf::from("svc-runner"),
            log_level: None,
            describe_concurrency: 4,
            describe_timeout_secs: 30,
            kill_grace_ms: 250,
            locale: "en".to_string(),
            blacklist: Vec::new(),
        }
    }

    /// Platform data directory for the daemon, e.g.
    /// `~/.local/share/svcd` on Linux.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR)
    }

    /// `<config_dir>/svcd/config.toml`, when the platform has a config dir.
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        toml::from_str(&content).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load `path` if given, else the default config file if it exists,
    /// else built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_config_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn describe_timeout(&self) -> Duration {
        Duration::from_secs(self.describe_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_rooted_layout() {
        let cfg = EngineConfig::rooted_at("/data");
        assert_eq!(cfg.service_dir, PathBuf::from("/data/services"));
        assert_eq!(cfg.interface_cache_dir, PathBuf::from("/data/interfaces"));
        assert_eq!(cfg.pending_dir, PathBuf::from("/data/pending"));
        assert_eq!(cfg.describe_concurrency, 4);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
service_dir = "/srv/services"
describe_concurrency = 2
blacklist = ["Untrusted"]
"#,
        )
        .unwrap();

        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.service_dir, PathBuf::from("/srv/services"));
        assert_eq!(cfg.describe_concurrency, 2);
        assert_eq!(cfg.blacklist, vec!["Untrusted".to_string()]);
        assert_eq!(cfg.locale, "en");
        assert_eq!(cfg.kill_grace(), Duration::from_millis(250));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "sevice_dir = \"/typo\"\n").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(Error::Config { .. })));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        assert!(EngineConfig::load_or_default(Some(&temp.path().join("absent.toml"))).is_err());
    }
}
