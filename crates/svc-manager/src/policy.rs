//! Which services may run at all.

use std::collections::BTreeSet;

use svc_meta::ServiceSummary;

/// Blacklist of services, by name or by exact name and version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionPolicy {
    names: BTreeSet<String>,
    versions: BTreeSet<(String, String)>,
}

impl PermissionPolicy {
    /// Build from `name` and `name/version` entries.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            match entry.split_once('/') {
                Some((name, version)) => {
                    policy.versions.insert((name.to_string(), version.to_string()));
                }
                None if !entry.is_empty() => {
                    policy.names.insert(entry.to_string());
                }
                None => {}
            }
        }
        policy
    }

    pub fn may_run(&self, summary: &ServiceSummary) -> bool {
        !self.names.contains(summary.name())
            && !self
                .versions
                .contains(&(summary.name().to_string(), summary.version().to_string()))
    }
}
