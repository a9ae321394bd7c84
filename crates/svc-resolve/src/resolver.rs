//! Picking candidates for requirements.

use std::collections::VecDeque;

use svc_meta::{ServiceVersion, is_newer_match};
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::ServiceGraph;
use crate::types::{AvailableService, RequireStatement};

/// Best candidate in `pool` named `name` that satisfies the constraints,
/// using the same newer-match rule as every other selection.
pub fn find_best_match<'a>(
    name: &str,
    version: &ServiceVersion,
    minversion: &ServiceVersion,
    pool: &'a [AvailableService],
) -> Option<&'a AvailableService> {
    let mut best: Option<&AvailableService> = None;
    for candidate in pool.iter().filter(|c| c.name == name) {
        if is_newer_match(&candidate.version, best.map(|b| &b.version), version, minversion) {
            best = Some(candidate);
        }
    }
    best
}

fn best_for<'a>(
    req: &RequireStatement,
    pool: &'a [AvailableService],
) -> Option<&'a AvailableService> {
    find_best_match(&req.name, &req.version, &req.minversion, pool)
}

/// Resolve `requirements` into a dependency-closed set ordered with
/// providers first.
///
/// For each requirement the installed candidate wins unless nothing
/// installed fits, or `prefer_newest` is set and the available candidate
/// is strictly newer. Choosing a dependent queues a requirement for its
/// provider. A dependency cycle is logged and the partial order returned.
///
/// # Errors
///
/// [`Error::UnsatisfiableDependency`] when neither pool covers a
/// requirement, including providers pulled in transitively.
pub fn find_satisfying_set(
    requirements: &[RequireStatement],
    installed: &[AvailableService],
    available: &[AvailableService],
    prefer_newest: bool,
) -> Result<Vec<AvailableService>> {
    let mut work: VecDeque<RequireStatement> = requirements.iter().cloned().collect();
    let mut need: Vec<AvailableService> = Vec::new();

    while let Some(req) = work.pop_front() {
        if need.iter().any(|s| req.is_satisfied_by(&s.name, &s.version)) {
            continue;
        }

        let chosen = match (best_for(&req, installed), best_for(&req, available)) {
            (None, None) => {
                return Err(Error::UnsatisfiableDependency {
                    name: req.name.clone(),
                    version: req.version.to_string(),
                    minversion: req.minversion.to_string(),
                });
            }
            (Some(local), None) => local,
            (None, Some(remote)) => remote,
            (Some(local), Some(remote)) => {
                if prefer_newest && remote.version > local.version {
                    remote
                } else {
                    local
                }
            }
        };

        debug!(requirement = %req, chosen = %chosen, "resolved requirement");
        if let Some(provider) = &chosen.provider {
            work.push_back(RequireStatement::from(provider));
        }
        need.push(chosen.clone());
    }

    Ok(ServiceGraph::from_services(&need).sort_logging_cycles())
}

/// What must be downloaded so `requirements` resolve with the newest
/// versions in `updates`.
pub fn have_updates(
    requirements: &[RequireStatement],
    installed: &[AvailableService],
    updates: &[AvailableService],
) -> Result<Vec<AvailableService>> {
    let resolved = find_satisfying_set(requirements, installed, updates, true)?;
    Ok(resolved
        .into_iter()
        .filter(|s| !installed.iter().any(|i| i.same_identity(s)))
        .collect())
}
