use std::fmt;

use serde::{Deserialize, Serialize};
use svc_meta::{ServiceKind, ServiceSummary, ServiceVersion, is_newer_match};

use crate::Result;

/// One thing a caller needs: a service name plus optional exact and
/// minimum version constraints. Empty constraints match anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequireStatement {
    pub name: String,
    #[serde(default)]
    pub version: ServiceVersion,
    #[serde(default)]
    pub minversion: ServiceVersion,
}

impl RequireStatement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: ServiceVersion::default(),
            minversion: ServiceVersion::default(),
        }
    }

    /// Build from string constraints, failing on a malformed version.
    pub fn parse(name: &str, version: &str, minversion: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            version: ServiceVersion::parse(version)?,
            minversion: ServiceVersion::parse(minversion)?,
        })
    }

    /// Whether a service called `name` at `version` satisfies this
    /// statement.
    pub fn is_satisfied_by(&self, name: &str, version: &ServiceVersion) -> bool {
        self.name == name && is_newer_match(version, None, &self.version, &self.minversion)
    }
}

impl fmt::Display for RequireStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.version.is_set() {
            write!(f, " version {}", self.version)?;
        }
        if self.minversion.is_set() {
            write!(f, " minversion {}", self.minversion)?;
        }
        Ok(())
    }
}

/// The provider a dependent candidate needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConstraint {
    pub name: String,
    #[serde(default)]
    pub version: ServiceVersion,
    #[serde(default)]
    pub minversion: ServiceVersion,
}

impl From<&ProviderConstraint> for RequireStatement {
    fn from(p: &ProviderConstraint) -> Self {
        Self {
            name: p.name.clone(),
            version: p.version,
            minversion: p.minversion,
        }
    }
}

/// A candidate from any pool: installed, pending or remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableService {
    pub name: String,
    pub version: ServiceVersion,
    /// Download size in bytes; zero for installed services.
    #[serde(default)]
    pub size: u64,
    /// Set when the candidate is a dependent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConstraint>,
}

impl AvailableService {
    pub fn standalone(name: &str, version: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            version: ServiceVersion::parse(version)?,
            size: 0,
            provider: None,
        })
    }

    pub fn dependent(
        name: &str,
        version: &str,
        provider: &str,
        provider_version: &str,
        provider_min: &str,
    ) -> Result<Self> {
        Ok(Self {
            provider: Some(ProviderConstraint {
                name: provider.to_string(),
                version: ServiceVersion::parse(provider_version)?,
                minversion: ServiceVersion::parse(provider_min)?,
            }),
            ..Self::standalone(name, version)?
        })
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Candidate for an installed or pending service.
    pub fn from_summary(summary: &ServiceSummary) -> Self {
        let provider = match summary.kind() {
            ServiceKind::Dependent(req) => Some(ProviderConstraint {
                name: req.name.clone(),
                version: req.version,
                minversion: req.minversion,
            }),
            _ => None,
        };
        Self {
            name: summary.name().to_string(),
            version: summary.parsed_version(),
            size: 0,
            provider,
        }
    }

    pub fn is_dependent(&self) -> bool {
        self.provider.is_some()
    }

    /// Same name and version as `other`, regardless of pool.
    pub fn same_identity(&self, other: &AvailableService) -> bool {
        self.name == other.name && self.version == other.version
    }
}

impl fmt::Display for AvailableService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}
