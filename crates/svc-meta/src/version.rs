//! Service version parsing, ordering and matching.
//!
//! A service version has up to three numeric components: `major`,
//! `major.minor` or `major.minor.micro`. Components that were not given are
//! *unset*. Unset components sort below every set component, and when a
//! version is used as a constraint they act as wildcards:
//!
//! ```
//! use svc_meta::version::ServiceVersion;
//!
//! let want = ServiceVersion::parse("1.2").unwrap();
//! assert!(ServiceVersion::parse("1.2.7").unwrap().matches(&want));
//! assert!(!ServiceVersion::parse("1.3.0").unwrap().matches(&want));
//! ```
//!
//! The empty string is a valid version with nothing set; as a constraint it
//! matches everything.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A parsed, possibly partial, service version.
///
/// The derived ordering compares `(major, minor, micro)` lexicographically
/// with `None < Some(0)`, which gives a strict total order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceVersion {
    major: Option<u32>,
    minor: Option<u32>,
    micro: Option<u32>,
}

impl ServiceVersion {
    /// Build a fully specified version.
    pub const fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self {
            major: Some(major),
            minor: Some(minor),
            micro: Some(micro),
        }
    }

    /// Parse `""`, `"M"`, `"M.m"` or `"M.m.u"`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedVersion`] for anything else, including
    /// empty components, signs and more than three components.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }

        let mut parts = [None; 3];
        let mut count = 0;
        for piece in trimmed.split('.') {
            let numeric = !piece.is_empty() && piece.bytes().all(|b| b.is_ascii_digit());
            if count == parts.len() || !numeric {
                return Err(Error::MalformedVersion(s.to_string()));
            }
            let value = piece
                .parse::<u32>()
                .map_err(|_| Error::MalformedVersion(s.to_string()))?;
            parts[count] = Some(value);
            count += 1;
        }

        Ok(Self {
            major: parts[0],
            minor: parts[1],
            micro: parts[2],
        })
    }

    pub fn major(&self) -> Option<u32> {
        self.major
    }

    pub fn minor(&self) -> Option<u32> {
        self.minor
    }

    pub fn micro(&self) -> Option<u32> {
        self.micro
    }

    /// True when at least the major component was given.
    pub fn is_set(&self) -> bool {
        self.major.is_some()
    }

    /// True when all three components were given.
    pub fn is_complete(&self) -> bool {
        self.micro.is_some()
    }

    /// Check this version against `pattern`, treating every unset component
    /// of the pattern as a wildcard.
    pub fn matches(&self, pattern: &ServiceVersion) -> bool {
        fn component(have: Option<u32>, want: Option<u32>) -> bool {
            want.is_none() || have == want
        }
        component(self.major, pattern.major)
            && component(self.minor, pattern.minor)
            && component(self.micro, pattern.micro)
    }

    /// Convert to a [`semver::Version`], filling unset components with zero.
    pub fn to_semver(&self) -> semver::Version {
        semver::Version::new(
            u64::from(self.major.unwrap_or(0)),
            u64::from(self.minor.unwrap_or(0)),
            u64::from(self.micro.unwrap_or(0)),
        )
    }
}

/// Lexicographic comparison of two versions. Equivalent to `a.cmp(b)`.
pub fn compare(a: &ServiceVersion, b: &ServiceVersion) -> Ordering {
    a.cmp(b)
}

/// The one rule for "is `candidate` a better pick than what we have".
///
/// True iff `candidate` satisfies the exact constraint (unset matches
/// anything), is at least `minimum`, and is strictly newer than
/// `current_best` when there is one.
pub fn is_newer_match(
    candidate: &ServiceVersion,
    current_best: Option<&ServiceVersion>,
    exact: &ServiceVersion,
    minimum: &ServiceVersion,
) -> bool {
    if exact.is_set() && !candidate.matches(exact) {
        return false;
    }
    if minimum.is_set() && candidate < minimum {
        return false;
    }
    match current_best {
        Some(best) if best.is_set() => candidate > best,
        _ => true,
    }
}

impl fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.major, self.minor, self.micro) {
            (Some(ma), Some(mi), Some(u)) => write!(f, "{ma}.{mi}.{u}"),
            (Some(ma), Some(mi), None) => write!(f, "{ma}.{mi}"),
            (Some(ma), None, _) => write!(f, "{ma}"),
            _ => Ok(()),
        }
    }
}

impl std::str::FromStr for ServiceVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServiceVersion {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ServiceVersion> for String {
    fn from(value: ServiceVersion) -> Self {
        value.to_string()
    }
}

impl From<&semver::Version> for ServiceVersion {
    fn from(v: &semver::Version) -> Self {
        Self {
            major: u32::try_from(v.major).ok(),
            minor: u32::try_from(v.minor).ok(),
            micro: u32::try_from(v.patch).ok(),
        }
    }
}
