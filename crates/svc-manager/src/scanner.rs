//! Incremental scanning of the service root.
//!
//! A scan walks `<root>` depth first. A directory holding a valid
//! `manifest.json` is a service; a directory without one is a container
//! whose children are walked in turn; containers that end up bearing no
//! service are deleted. Every discovered service ends up in the returned
//! [`Catalog`] together with its [`ServiceDescription`], obtained from
//! (in order of preference) the previous scan, the [`InterfaceCache`], or
//! by spawning the service and asking it.
//!
//! Providers are always settled before dependents, because describing a
//! dependent means running it inside its provider. If any provider had to
//! be described afresh, every dependent that is not currently running is
//! re-described too and its cache entry dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use svc_cache::InterfaceCache;
use svc_meta::{ManifestError, ServiceDescription, ServiceKey, ServiceSummary, is_newer_match};
use svc_runner::{
    Controller, ControllerId, ControllerOutcome, ControllerState, ProcessHost, SpawnRequest,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::policy::PermissionPolicy;
use crate::source::remove_service_dir;

/// A scanned service and its interface.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub summary: ServiceSummary,
    pub description: ServiceDescription,
}

pub type Catalog = BTreeMap<ServiceKey, CatalogEntry>;

/// Counters for one scan pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    /// Described by spawning the service.
    pub loaded: usize,
    /// Unchanged since the previous pass.
    pub carried_over: usize,
    /// Hydrated from the interface cache.
    pub cached: usize,
    /// Changed on disk since the previous pass.
    pub refreshed: usize,
    /// Changed on disk but running, so left alone.
    pub postponed: usize,
    /// Failed to load and removed from disk.
    pub bogus: usize,
    /// Blacklisted and removed from disk.
    pub blacklisted: usize,
    /// Empty containers removed from disk.
    pub pruned: usize,
    /// Left on disk but not loaded.
    pub skipped: usize,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub catalog: Catalog,
    /// Directories of services that failed to load. Already deleted.
    pub bogus: Vec<PathBuf>,
    pub stats: ScanStats,
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Services spawned at once while describing.
    pub concurrency: usize,
    pub describe_timeout: Duration,
    /// Time a described service gets to exit before it is killed.
    pub kill_grace: Duration,
    pub log_level: Option<String>,
}

impl ScanSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            concurrency: config.describe_concurrency.max(1),
            describe_timeout: config.describe_timeout(),
            kill_grace: config.kill_grace(),
            log_level: config.log_level.clone(),
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            describe_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_millis(250),
            log_level: None,
        }
    }
}

#[derive(Debug)]
enum DescribeFailure {
    /// The runner could not be started. Says nothing about the service.
    Spawn(svc_runner::Error),
    /// The service itself is broken.
    Bogus(String),
}

#[derive(Debug, Default)]
struct Discovery {
    services: Vec<ServiceSummary>,
    bogus: Vec<PathBuf>,
    blacklisted: usize,
    pruned: usize,
    skipped: usize,
}

pub struct DiskScanner<'a> {
    root: &'a Path,
    cache: &'a InterfaceCache,
    policy: &'a PermissionPolicy,
    host: Arc<dyn ProcessHost>,
    settings: ScanSettings,
}

impl<'a> DiskScanner<'a> {
    pub fn new(
        root: &'a Path,
        cache: &'a InterfaceCache,
        policy: &'a PermissionPolicy,
        host: Arc<dyn ProcessHost>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            root,
            cache,
            policy,
            host,
            settings,
        }
    }

    /// Scan the root, reusing what `previous` already knows. Services in
    /// `running` are never reloaded.
    pub async fn scan(&self, previous: &Catalog, running: &BTreeSet<ServiceKey>) -> ScanOutcome {
        let mut discovery = Discovery::default();
        if self.root.is_dir() {
            self.walk(self.root, &mut discovery);
        } else {
            debug!(root = %self.root.display(), "service root does not exist");
        }

        let mut stats = ScanStats {
            bogus: discovery.bogus.len(),
            blacklisted: discovery.blacklisted,
            pruned: discovery.pruned,
            skipped: discovery.skipped,
            ..ScanStats::default()
        };
        let mut bogus = discovery.bogus;
        let mut catalog = Catalog::new();
        let mut needed = Vec::new();

        for summary in discovery.services {
            let key = summary.key();
            match previous.get(&key) {
                Some(entry) if !entry.summary.is_out_of_date() => {
                    stats.carried_over += 1;
                    catalog.insert(key, entry.clone());
                }
                Some(entry) if running.contains(&key) => {
                    info!(service = %key, "manifest changed while running, postponing reload");
                    stats.postponed += 1;
                    catalog.insert(key, entry.clone());
                }
                Some(_) => {
                    stats.refreshed += 1;
                    self.purge_cached(&key);
                    needed.push(summary);
                }
                None => needed.push(summary),
            }
        }

        let (providers, mut others): (Vec<_>, Vec<_>) =
            needed.into_iter().partition(ServiceSummary::is_provider);

        let providers = self.hydrate(providers, false, &mut catalog, &mut stats);
        let providers_changed = !providers.is_empty();
        let jobs = providers.into_iter().map(|s| (s, None)).collect();
        self.describe_into(jobs, &mut catalog, &mut bogus, &mut stats).await;

        if providers_changed {
            let stale: Vec<ServiceKey> = catalog
                .iter()
                .filter(|(key, entry)| entry.summary.is_dependent() && !running.contains(*key))
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                if let Some(entry) = catalog.remove(&key) {
                    stats.carried_over = stats.carried_over.saturating_sub(1);
                    stats.refreshed += 1;
                    others.push(entry.summary);
                }
            }
            for summary in others.iter().filter(|s| s.is_dependent()) {
                self.purge_cached(&summary.key());
            }
        }

        let others = self.hydrate(others, providers_changed, &mut catalog, &mut stats);
        let mut jobs = Vec::with_capacity(others.len());
        for summary in others {
            match summary.provider_requirement() {
                None => jobs.push((summary, None)),
                Some(_) => match best_provider(&catalog, &summary) {
                    Some(provider) => jobs.push((summary, Some(provider))),
                    None => {
                        warn!(
                            service = %summary.key(),
                            "no installed provider satisfies dependent, skipping"
                        );
                        stats.skipped += 1;
                    }
                },
            }
        }
        self.describe_into(jobs, &mut catalog, &mut bogus, &mut stats).await;

        info!(
            services = catalog.len(),
            loaded = stats.loaded,
            carried_over = stats.carried_over,
            cached = stats.cached,
            refreshed = stats.refreshed,
            postponed = stats.postponed,
            bogus = stats.bogus,
            "scan complete"
        );

        ScanOutcome { catalog, bogus, stats }
    }

    /// Returns whether `dir` bears at least one service. Barren children
    /// are deleted here only when `dir` itself survives.
    fn walk(&self, dir: &Path, found: &mut Discovery) -> bool {
        let mut bears_services = false;
        let mut barren = Vec::new();
        for child in subdirectories(dir) {
            match ServiceSummary::detect(&child) {
                Ok(summary) if !summary.has_identity() => {
                    warn!(
                        path = %child.display(),
                        "service is not laid out as <name>/<version>, skipping"
                    );
                    found.skipped += 1;
                    bears_services = true;
                }
                Ok(summary) if !self.policy.may_run(&summary) => {
                    warn!(service = %summary.key(), "service is blacklisted, removing");
                    if let Err(e) = remove_service_dir(&child) {
                        error!(error = %e, "failed to remove blacklisted service");
                    }
                    self.purge_cached(&summary.key());
                    found.blacklisted += 1;
                }
                Ok(summary) => {
                    found.services.push(summary);
                    bears_services = true;
                }
                Err(ManifestError::MissingManifest(_)) => {
                    if self.walk(&child, found) {
                        bears_services = true;
                    } else {
                        barren.push(child);
                    }
                }
                Err(e) => {
                    warn!(
                        path = %child.display(),
                        error = %e,
                        "invalid manifest, removing service"
                    );
                    if let Err(e) = std::fs::remove_dir_all(&child) {
                        error!(
                            path = %child.display(),
                            error = %e,
                            "failed to remove invalid service"
                        );
                    }
                    found.bogus.push(child);
                }
            }
        }

        if bears_services || dir == self.root {
            for child in barren {
                info!(path = %child.display(), "pruning directory without services");
                match std::fs::remove_dir_all(&child) {
                    Ok(()) => found.pruned += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        error!(path = %child.display(), error = %e, "failed to prune directory")
                    }
                }
            }
        }
        bears_services
    }

    /// Fill `catalog` from the interface cache where possible and return
    /// the summaries that still need describing.
    fn hydrate(
        &self,
        summaries: Vec<ServiceSummary>,
        bypass_for_dependents: bool,
        catalog: &mut Catalog,
        stats: &mut ScanStats,
    ) -> Vec<ServiceSummary> {
        let mut remaining = Vec::new();
        for summary in summaries {
            if bypass_for_dependents && summary.is_dependent() {
                remaining.push(summary);
                continue;
            }
            let fresh = summary.manifest_mtime().is_some_and(|mtime| {
                self.cache.is_newer_than(summary.name(), summary.version(), mtime)
            });
            match fresh.then(|| self.cache.get(summary.name(), summary.version())).flatten() {
                Some(description) => {
                    debug!(service = %summary.key(), "description loaded from cache");
                    stats.cached += 1;
                    catalog.insert(summary.key(), CatalogEntry { summary, description });
                }
                None => remaining.push(summary),
            }
        }
        remaining
    }

    async fn describe_into(
        &self,
        jobs: Vec<(ServiceSummary, Option<PathBuf>)>,
        catalog: &mut Catalog,
        bogus: &mut Vec<PathBuf>,
        stats: &mut ScanStats,
    ) {
        if jobs.is_empty() {
            return;
        }
        for (summary, result) in self.describe_all(jobs).await {
            let key = summary.key();
            match result {
                Ok(description) => {
                    let cached = self
                        .cache
                        .set(summary.name(), summary.version(), &description);
                    if let Err(e) = cached {
                        warn!(service = %key, error = %e, "failed to cache description");
                    }
                    stats.loaded += 1;
                    catalog.insert(key, CatalogEntry { summary, description });
                }
                Err(DescribeFailure::Spawn(e)) => {
                    error!(service = %key, error = %e, "could not start service to describe it");
                    stats.skipped += 1;
                }
                Err(DescribeFailure::Bogus(reason)) => {
                    error!(service = %key, %reason, "service failed to load, removing");
                    if let Err(e) = remove_service_dir(summary.path()) {
                        error!(service = %key, error = %e, "failed to remove broken service");
                    }
                    self.purge_cached(&key);
                    stats.bogus += 1;
                    bogus.push(summary.path().to_path_buf());
                }
            }
        }
    }

    /// Describe every job, keeping at most `concurrency` processes alive.
    async fn describe_all(
        &self,
        jobs: Vec<(ServiceSummary, Option<PathBuf>)>,
    ) -> Vec<(ServiceSummary, Result<ServiceDescription, DescribeFailure>)> {
        let limit = self.settings.concurrency.max(1);
        let mut results = Vec::with_capacity(jobs.len());
        let mut window = JoinSet::new();
        let mut jobs = jobs.into_iter();
        let mut next_id = 0u64;

        loop {
            while window.len() < limit {
                let Some((summary, provider)) = jobs.next() else {
                    break;
                };
                next_id += 1;
                let host = Arc::clone(&self.host);
                let settings = self.settings.clone();
                let id = ControllerId(next_id);
                window.spawn(async move {
                    let result = describe_one(host, id, &summary, provider, &settings).await;
                    (summary, result)
                });
            }
            match window.join_next().await {
                Some(Ok(done)) => results.push(done),
                Some(Err(e)) => error!(error = %e, "describe task failed"),
                None => break,
            }
        }
        results
    }

    fn purge_cached(&self, key: &ServiceKey) {
        if let Err(e) = self.cache.purge(&key.name, &key.version) {
            warn!(service = %key, error = %e, "failed to purge cached description");
        }
    }
}

/// Directory of the newest scanned provider satisfying `dependent`.
pub fn best_provider(catalog: &Catalog, dependent: &ServiceSummary) -> Option<PathBuf> {
    let req = dependent.provider_requirement()?;
    let mut best: Option<&CatalogEntry> = None;
    for entry in catalog.values() {
        if !entry.summary.is_provider() || entry.summary.name() != req.name {
            continue;
        }
        let current = best.map(|b| b.summary.parsed_version());
        if is_newer_match(
            &entry.summary.parsed_version(),
            current.as_ref(),
            &req.version,
            &req.minversion,
        ) {
            best = Some(entry);
        }
    }
    best.map(|entry| entry.summary.path().to_path_buf())
}

/// How long past its kill grace a described process may take to be reaped.
const EXIT_WAIT: Duration = Duration::from_secs(2);

/// Spawn a service just long enough to learn its interface.
async fn describe_one(
    host: Arc<dyn ProcessHost>,
    id: ControllerId,
    summary: &ServiceSummary,
    provider: Option<PathBuf>,
    settings: &ScanSettings,
) -> Result<ServiceDescription, DescribeFailure> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut controller = Controller::new(id, summary.key());

    let mut request = SpawnRequest::new(summary.path());
    if let Some(provider) = provider {
        request = request.with_provider(provider);
    }
    if let Some(level) = &settings.log_level {
        request = request.with_log_level(level.clone());
    }
    controller
        .start(host.as_ref(), &request, tx)
        .map_err(DescribeFailure::Spawn)?;
    controller
        .describe()
        .map_err(|e| DescribeFailure::Bogus(e.to_string()))?;

    let exchange = async {
        while let Some(event) = rx.recv().await {
            for outcome in controller.handle(event.event) {
                match outcome {
                    ControllerOutcome::Described(description) => return Ok(description),
                    ControllerOutcome::DescribeFailed(reason) => {
                        return Err(DescribeFailure::Bogus(reason));
                    }
                    ControllerOutcome::Ended { reason, .. } => {
                        return Err(DescribeFailure::Bogus(format!(
                            "process {reason} before describing itself"
                        )));
                    }
                    _ => {}
                }
            }
        }
        Err(DescribeFailure::Bogus("lost contact with process".to_string()))
    };
    let result = timeout(settings.describe_timeout, exchange).await.unwrap_or_else(|_| {
        Err(DescribeFailure::Bogus(format!(
            "no description within {}s",
            settings.describe_timeout.as_secs()
        )))
    });

    // The window slot stays taken until the process is gone.
    controller.shutdown(settings.kill_grace);
    let ended = async {
        while controller.state() != ControllerState::Ended {
            match rx.recv().await {
                Some(event) => {
                    controller.handle(event.event);
                }
                None => break,
            }
        }
    };
    if timeout(settings.kill_grace + EXIT_WAIT, ended).await.is_err() {
        warn!(service = %summary.key(), "service process did not exit after describe");
    }
    result
}

fn subdirectories(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "cannot read directory");
            return Vec::new();
        }
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
