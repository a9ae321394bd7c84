//! Typed summaries of on-disk service manifests.
//!
//! A service lives at `<root>/<name>/<version>/manifest.json`. The manifest
//! is JSON:
//!
//! ```json
//! {
//!   "type": "dependent",
//!   "strings": { "en": { "title": "Echo", "summary": "Echoes input" } },
//!   "shutdownDelaySecs": 30,
//!   "permissions": ["FileAccess"],
//!   "uses": { "service": "Interpreter", "minversion": "2.0" },
//!   "arguments": { "ScriptFile": "echo.py" }
//! }
//! ```
//!
//! [`ServiceSummary::detect`] validates the manifest and records its
//! modification time so later scans can tell whether it changed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::MANIFEST_FILE;
use crate::error::ManifestError;
use crate::locale;
use crate::version::ServiceVersion;

/// Accepted keys for the library path of standalone and provider services.
const LIBRARY_KEYS: [&str; 2] = ["ServiceLibrary", "CoreletLibrary"];
/// Accepted keys naming a dependent's provider inside `uses`.
const PROVIDER_KEYS: [&str; 2] = ["service", "corelet"];

/// Identity of a service: its name plus its version string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ServiceKey {
    pub name: String,
    pub version: String,
}

impl ServiceKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Coarse service type, as written in the manifest's `type` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Standalone,
    Dependent,
    Provider,
    BuiltIn,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceType::Standalone => "standalone",
            ServiceType::Dependent => "dependent",
            ServiceType::Provider => "provider",
            ServiceType::BuiltIn => "built-in",
        })
    }
}

/// What a dependent service needs from its provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderRequirement {
    pub name: String,
    pub version: ServiceVersion,
    pub minversion: ServiceVersion,
    /// Flat arguments passed to the provider when it hosts this service.
    pub arguments: BTreeMap<String, String>,
}

/// Type-specific payload of a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServiceKind {
    Standalone { library: PathBuf },
    Provider { library: PathBuf },
    Dependent(ProviderRequirement),
    BuiltIn,
}

/// Title and one-line summary for a single locale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Localization {
    pub title: String,
    pub summary: String,
}

/// Parsed manifest of one installed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSummary {
    name: String,
    version: String,
    path: PathBuf,
    kind: ServiceKind,
    localizations: BTreeMap<String, Localization>,
    permissions: BTreeSet<String>,
    shutdown_delay_secs: Option<u64>,
    #[serde(skip)]
    manifest_mtime: Option<SystemTime>,
}

impl ServiceSummary {
    /// Read and validate `<directory>/manifest.json`.
    ///
    /// Name and version are inferred from the layout: when the directory's
    /// own name parses as a version, it is the version and its parent's name
    /// is the service name. Otherwise both stay empty.
    pub fn detect(directory: &Path) -> Result<Self, ManifestError> {
        let manifest_path = directory.join(MANIFEST_FILE);
        let metadata = match fs::metadata(&manifest_path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(ManifestError::MissingManifest(manifest_path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ManifestError::MissingManifest(manifest_path));
            }
            Err(source) => {
                return Err(ManifestError::Unreadable {
                    path: manifest_path,
                    source,
                });
            }
        };
        let text = fs::read_to_string(&manifest_path).map_err(|source| ManifestError::Unreadable {
            path: manifest_path.clone(),
            source,
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|source| ManifestError::SyntaxError {
            path: manifest_path.clone(),
            source,
        })?;

        let reader = ManifestReader { path: &manifest_path };
        let root = reader.object(&value, "manifest")?;

        let type_name = reader.string(reader.required(root, "type")?, "type")?;
        let localizations = reader.localizations(root)?;
        let shutdown_delay_secs = match root.get("shutdownDelaySecs") {
            Some(v) => Some(v.as_u64().ok_or_else(|| {
                reader.mismatch("shutdownDelaySecs", "a non-negative integer")
            })?),
            None => None,
        };
        let permissions = match root.get("permissions") {
            Some(v) => reader.string_list(v, "permissions")?,
            None => BTreeSet::new(),
        };

        let kind = match type_name {
            "standalone" => ServiceKind::Standalone {
                library: reader.library(root)?,
            },
            "provider" => ServiceKind::Provider {
                library: reader.library(root)?,
            },
            "dependent" => ServiceKind::Dependent(reader.provider_requirement(root)?),
            other => {
                return Err(ManifestError::InvalidType {
                    path: manifest_path,
                    value: other.to_string(),
                });
            }
        };

        let (name, version) = infer_identity(directory);

        Ok(Self {
            name,
            version,
            path: directory.to_path_buf(),
            kind,
            localizations,
            permissions,
            shutdown_delay_secs,
            manifest_mtime: metadata.modified().ok(),
        })
    }

    /// Summary for a service compiled into the host. Never scanned from disk.
    pub fn built_in(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            path: PathBuf::new(),
            kind: ServiceKind::BuiltIn,
            localizations: BTreeMap::new(),
            permissions: BTreeSet::new(),
            shutdown_delay_secs: None,
            manifest_mtime: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Parsed version; unset when the identity could not be inferred.
    pub fn parsed_version(&self) -> ServiceVersion {
        ServiceVersion::parse(&self.version).unwrap_or_default()
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.name, &self.version)
    }

    /// True when the directory layout yielded both a name and a version.
    pub fn has_identity(&self) -> bool {
        !self.name.is_empty() && !self.version.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> &ServiceKind {
        &self.kind
    }

    pub fn service_type(&self) -> ServiceType {
        match self.kind {
            ServiceKind::Standalone { .. } => ServiceType::Standalone,
            ServiceKind::Provider { .. } => ServiceType::Provider,
            ServiceKind::Dependent(_) => ServiceType::Dependent,
            ServiceKind::BuiltIn => ServiceType::BuiltIn,
        }
    }

    pub fn is_provider(&self) -> bool {
        matches!(self.kind, ServiceKind::Provider { .. })
    }

    pub fn is_dependent(&self) -> bool {
        matches!(self.kind, ServiceKind::Dependent(_))
    }

    /// Library path relative to the service directory, for standalone and
    /// provider services.
    pub fn library(&self) -> Option<&Path> {
        match &self.kind {
            ServiceKind::Standalone { library } | ServiceKind::Provider { library } => {
                Some(library)
            }
            _ => None,
        }
    }

    pub fn provider_requirement(&self) -> Option<&ProviderRequirement> {
        match &self.kind {
            ServiceKind::Dependent(req) => Some(req),
            _ => None,
        }
    }

    pub fn permissions(&self) -> &BTreeSet<String> {
        &self.permissions
    }

    pub fn shutdown_delay_secs(&self) -> Option<u64> {
        self.shutdown_delay_secs
    }

    pub fn manifest_mtime(&self) -> Option<SystemTime> {
        self.manifest_mtime
    }

    pub fn localizations(&self) -> &BTreeMap<String, Localization> {
        &self.localizations
    }

    /// Look up the strings for `locale`, falling back through the locale
    /// candidate chain down to English.
    pub fn localization(&self, locale: &str) -> Option<&Localization> {
        locale::candidates(locale)
            .iter()
            .find_map(|candidate| self.localizations.get(candidate))
    }

    /// True when the manifest changed on disk since this summary was read,
    /// or can no longer be found.
    pub fn is_out_of_date(&self) -> bool {
        if matches!(self.kind, ServiceKind::BuiltIn) {
            return false;
        }
        let current = fs::metadata(self.path.join(MANIFEST_FILE)).and_then(|m| m.modified());
        match (current, self.manifest_mtime) {
            (Ok(now), Some(recorded)) => now > recorded,
            _ => true,
        }
    }
}

impl fmt::Display for ServiceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.path.display())?;
        writeln!(f, "  service:  {} {}", self.name, self.version)?;
        writeln!(f, "  type:     {}", self.service_type())?;
        match &self.kind {
            ServiceKind::Standalone { library } | ServiceKind::Provider { library } => {
                writeln!(f, "  library:  {}", library.display())?;
            }
            ServiceKind::Dependent(req) => {
                write!(f, "  uses:     {}", req.name)?;
                if req.version.is_set() {
                    write!(f, " version {}", req.version)?;
                }
                if req.minversion.is_set() {
                    write!(f, " minversion {}", req.minversion)?;
                }
                writeln!(f)?;
                for (key, value) in &req.arguments {
                    writeln!(f, "    {key} = {value}")?;
                }
            }
            ServiceKind::BuiltIn => {}
        }
        if let Some(delay) = self.shutdown_delay_secs {
            writeln!(f, "  shutdown delay: {delay}s")?;
        }
        for (locale, strings) in &self.localizations {
            writeln!(f, "  [{locale}] {}: {}", strings.title, strings.summary)?;
        }
        if !self.permissions.is_empty() {
            let perms: Vec<&str> = self.permissions.iter().map(String::as_str).collect();
            writeln!(f, "  permissions: {}", perms.join(", "))?;
        }
        Ok(())
    }
}

/// `(name, version)` from a `<name>/<version>` directory, or two empty
/// strings.
fn infer_identity(directory: &Path) -> (String, String) {
    let version = directory.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let name = directory
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    let parsed = ServiceVersion::parse(version);
    if name.is_empty() || !matches!(parsed, Ok(v) if v.is_set()) {
        debug!(directory = %directory.display(), "no <name>/<version> layout, identity left empty");
        return (String::new(), String::new());
    }
    (name.to_string(), version.to_string())
}

/// Field accessors that turn JSON shape problems into [`ManifestError`]s.
struct ManifestReader<'a> {
    path: &'a Path,
}

impl ManifestReader<'_> {
    fn mismatch(&self, key: &str, expected: &'static str) -> ManifestError {
        ManifestError::TypeMismatch {
            path: self.path.to_path_buf(),
            key: key.to_string(),
            expected,
        }
    }

    fn missing(&self, key: &str) -> ManifestError {
        ManifestError::MissingField {
            path: self.path.to_path_buf(),
            key: key.to_string(),
        }
    }

    fn required<'v>(
        &self,
        map: &'v Map<String, Value>,
        key: &str,
    ) -> Result<&'v Value, ManifestError> {
        map.get(key).ok_or_else(|| self.missing(key))
    }

    fn object<'v>(
        &self,
        value: &'v Value,
        key: &str,
    ) -> Result<&'v Map<String, Value>, ManifestError> {
        value.as_object().ok_or_else(|| self.mismatch(key, "an object"))
    }

    fn string<'v>(&self, value: &'v Value, key: &str) -> Result<&'v str, ManifestError> {
        value.as_str().ok_or_else(|| self.mismatch(key, "a string"))
    }

    fn string_list(&self, value: &Value, key: &str) -> Result<BTreeSet<String>, ManifestError> {
        let items = value.as_array().ok_or_else(|| self.mismatch(key, "a list of strings"))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.mismatch(key, "a list of strings"))
            })
            .collect()
    }

    fn version(
        &self,
        map: &Map<String, Value>,
        key: &str,
        qualified: &str,
    ) -> Result<ServiceVersion, ManifestError> {
        let Some(value) = map.get(key) else {
            return Ok(ServiceVersion::default());
        };
        let text = self.string(value, qualified)?;
        ServiceVersion::parse(text).map_err(|_| ManifestError::MalformedVersion {
            path: self.path.to_path_buf(),
            key: qualified.to_string(),
            value: text.to_string(),
        })
    }

    fn localizations(
        &self,
        root: &Map<String, Value>,
    ) -> Result<BTreeMap<String, Localization>, ManifestError> {
        let strings = self.object(self.required(root, "strings")?, "strings")?;
        if !strings.contains_key(locale::DEFAULT_LOCALE) {
            return Err(self.missing("strings.en"));
        }

        let mut out = BTreeMap::new();
        for (locale, entry) in strings {
            let key = format!("strings.{locale}");
            let entry = self.object(entry, &key)?;
            let title_key = format!("{key}.title");
            let summary_key = format!("{key}.summary");
            let title = entry.get("title").ok_or_else(|| self.missing(&title_key))?;
            let title = self.string(title, &title_key)?;
            let summary = entry.get("summary").ok_or_else(|| self.missing(&summary_key))?;
            let summary = self.string(summary, &summary_key)?;
            out.insert(
                locale.clone(),
                Localization {
                    title: title.to_string(),
                    summary: summary.to_string(),
                },
            );
        }
        Ok(out)
    }

    fn library(&self, root: &Map<String, Value>) -> Result<PathBuf, ManifestError> {
        for key in LIBRARY_KEYS {
            if let Some(value) = root.get(key) {
                return Ok(PathBuf::from(self.string(value, key)?));
            }
        }
        Err(self.missing(LIBRARY_KEYS[0]))
    }

    fn provider_requirement(
        &self,
        root: &Map<String, Value>,
    ) -> Result<ProviderRequirement, ManifestError> {
        let uses = self.object(self.required(root, "uses")?, "uses")?;

        let mut name = None;
        for key in PROVIDER_KEYS {
            if let Some(value) = uses.get(key) {
                name = Some(self.string(value, &format!("uses.{key}"))?.to_string());
                break;
            }
        }
        let name = name.ok_or_else(|| self.missing("uses.service"))?;

        let version = self.version(uses, "version", "uses.version")?;
        let minversion = self.version(uses, "minversion", "uses.minversion")?;

        let mut arguments = BTreeMap::new();
        if let Some(args) = root.get("arguments") {
            for (key, value) in self.object(args, "arguments")? {
                let value = self.string(value, &format!("arguments.{key}"))?;
                arguments.insert(key.clone(), value.to_string());
            }
        }

        Ok(ProviderRequirement {
            name,
            version,
            minversion,
            arguments,
        })
    }
}
