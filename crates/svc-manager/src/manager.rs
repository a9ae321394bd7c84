//! The engine facade handed to the command dispatcher.
//!
//! [`DynamicServiceManager`] owns the scanned catalog, every running
//! [`Controller`] and every instance. It never calls back into its caller:
//! results of asynchronous work are queued as [`ManagerEvent`]s on the
//! channel returned by [`DynamicServiceManager::new`].
//!
//! The caller drives process I/O by awaiting
//! [`next_runner_event`](DynamicServiceManager::next_runner_event) and
//! feeding each event to
//! [`handle_runner_event`](DynamicServiceManager::handle_runner_event),
//! typically from one `tokio::select!` loop.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use svc_cache::{InterfaceCache, PendingUpdateCache};
use svc_meta::{ServiceDescription, ServiceKey, ServiceSummary, ServiceVersion, is_newer_match};
use svc_resolve::{AvailableService, RequireStatement, find_satisfying_set, have_updates};
use svc_runner::{
    AllocationContext, AllocationId, Controller, ControllerId, ControllerOutcome, ProcessHost,
    RunnerEvent, SpawnRequest,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::policy::PermissionPolicy;
use crate::scanner::{Catalog, CatalogEntry, DiskScanner, ScanSettings, ScanStats, best_provider};
use crate::source::{PackageSource, RemoveDirectory, Uninstaller};
use crate::state::{ControllerEntry, EngineState, Instance, InstanceId};

/// Error code for failures raised by the service itself.
pub const CODE_INSTANCE_ERROR: &str = "instance_error";
/// Error code when the process behind an instance is gone.
pub const CODE_SERVICE_UNAVAILABLE: &str = "service_unavailable";
pub const CODE_INVALID_ARGUMENTS: &str = "invalid_arguments";

/// Asynchronous outcome of an earlier manager call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ManagerEvent {
    Instantiated {
        instance: InstanceId,
    },
    InstantiateFailed {
        instance: InstanceId,
        reason: String,
    },
    Result {
        instance: InstanceId,
        tid: u64,
        result: Value,
    },
    Error {
        instance: InstanceId,
        tid: u64,
        code: String,
        message: String,
    },
    Callback {
        instance: InstanceId,
        tid: u64,
        callback: u32,
        params: Value,
    },
    Prompt {
        instance: InstanceId,
        tid: u64,
        prompt: u32,
        dialog: PathBuf,
        args: Value,
    },
    /// The instance is gone without having been destroyed.
    InstanceEnded {
        instance: InstanceId,
        reason: String,
    },
}

/// Result of resolving requirements against installed and remote pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    /// Every service needed, providers before their dependents.
    pub ordered: Vec<AvailableService>,
    /// The part of `ordered` that is not installed or pending.
    pub to_download: Vec<AvailableService>,
}

pub struct DynamicServiceManager {
    config: EngineConfig,
    host: Arc<dyn ProcessHost>,
    interface_cache: InterfaceCache,
    pending: PendingUpdateCache,
    policy: PermissionPolicy,
    uninstaller: Box<dyn Uninstaller>,
    catalog: Catalog,
    last_scan: ScanStats,
    state: EngineState,
    runner_tx: mpsc::UnboundedSender<RunnerEvent>,
    runner_rx: mpsc::UnboundedReceiver<RunnerEvent>,
    events: mpsc::UnboundedSender<ManagerEvent>,
}

impl DynamicServiceManager {
    /// Create a manager with an empty catalog. Call
    /// [`force_rescan`](Self::force_rescan) to load installed services.
    pub fn new(
        config: EngineConfig,
        host: Arc<dyn ProcessHost>,
    ) -> (Self, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (runner_tx, runner_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            interface_cache: InterfaceCache::new(&config.interface_cache_dir),
            pending: PendingUpdateCache::new(&config.pending_dir),
            policy: PermissionPolicy::from_entries(&config.blacklist),
            uninstaller: Box::new(RemoveDirectory),
            catalog: Catalog::new(),
            last_scan: ScanStats::default(),
            state: EngineState::default(),
            config,
            host,
            runner_tx,
            runner_rx,
            events,
        };
        (manager, events_rx)
    }

    pub fn with_uninstaller(mut self, uninstaller: impl Uninstaller + 'static) -> Self {
        self.uninstaller = Box::new(uninstaller);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn interface_cache(&self) -> &InterfaceCache {
        &self.interface_cache
    }

    pub fn pending_cache(&self) -> &PendingUpdateCache {
        &self.pending
    }

    pub fn last_scan(&self) -> &ScanStats {
        &self.last_scan
    }

    // ---------------------------------------------------------------------
    // Catalog
    // ---------------------------------------------------------------------

    /// Rescan the service root. Running services that disappeared from
    /// disk are stopped.
    pub async fn force_rescan(&mut self) -> ScanStats {
        let running = self.running_services();
        let settings = ScanSettings::from_config(&self.config);
        let outcome = DiskScanner::new(
            &self.config.service_dir,
            &self.interface_cache,
            &self.policy,
            Arc::clone(&self.host),
            settings,
        )
        .scan(&self.catalog, &running)
        .await;
        self.catalog = outcome.catalog;

        for key in running {
            if !self.catalog.contains_key(&key) {
                warn!(service = %key, "running service vanished from disk, stopping it");
                self.stop_service(&key);
            }
        }

        self.last_scan = outcome.stats.clone();
        outcome.stats
    }

    pub fn available_services(&self) -> Vec<ServiceKey> {
        self.catalog.keys().cloned().collect()
    }

    pub fn available_summaries(&self) -> Vec<&ServiceSummary> {
        self.catalog.values().map(|e| &e.summary).collect()
    }

    pub fn summary(&self, name: &str, version: &str, minversion: &str) -> Result<&ServiceSummary> {
        Ok(&self.lookup(name, version, minversion)?.summary)
    }

    pub fn describe(
        &self,
        name: &str,
        version: &str,
        minversion: &str,
    ) -> Result<&ServiceDescription> {
        Ok(&self.lookup(name, version, minversion)?.description)
    }

    /// Whether an installed service matches. Malformed versions match
    /// nothing.
    pub fn have_service(&self, name: &str, version: &str, minversion: &str) -> bool {
        self.lookup(name, version, minversion).is_ok()
    }

    /// Newest catalog entry called `name` satisfying both constraints.
    fn lookup(&self, name: &str, version: &str, minversion: &str) -> Result<&CatalogEntry> {
        let exact = ServiceVersion::parse(version)?;
        let minimum = ServiceVersion::parse(minversion)?;
        let mut best: Option<&CatalogEntry> = None;
        for entry in self.catalog.values().filter(|e| e.summary.name() == name) {
            let current = best.map(|b| b.summary.parsed_version());
            if is_newer_match(&entry.summary.parsed_version(), current.as_ref(), &exact, &minimum) {
                best = Some(entry);
            }
        }
        best.ok_or_else(|| Error::ServiceNotFound {
            name: name.to_string(),
            version: version.to_string(),
            minversion: minversion.to_string(),
        })
    }

    // ---------------------------------------------------------------------
    // Instances
    // ---------------------------------------------------------------------

    /// Start allocating an instance of the newest installed `name` matching
    /// `version`. Completion arrives as [`ManagerEvent::Instantiated`] or
    /// [`ManagerEvent::InstantiateFailed`].
    pub fn instantiate(
        &mut self,
        name: &str,
        version: &str,
        context: AllocationContext,
    ) -> Result<InstanceId> {
        let summary = self.lookup(name, version, "")?.summary.clone();
        let key = summary.key();
        let controller_id = self.ensure_controller(&summary)?;

        let entry = self
            .state
            .controllers
            .get_mut(&controller_id)
            .ok_or_else(|| Error::ServiceUnavailable(key.to_string()))?;
        let allocation = entry.controller.allocate(context)?;
        entry.idle_since = None;

        let instance = self.state.next_instance_id();
        self.state.insert_instance(
            instance,
            Instance {
                controller: controller_id,
                allocation,
                key: key.clone(),
                allocated: false,
            },
        );
        debug!(service = %key, %instance, controller = %controller_id, "instance requested");
        Ok(instance)
    }

    /// The live controller for `summary`, spawning one if needed.
    fn ensure_controller(&mut self, summary: &ServiceSummary) -> Result<ControllerId> {
        let key = summary.key();
        if let Some(id) = self.state.live_controller(&key) {
            return Ok(id);
        }

        let mut request = SpawnRequest::new(summary.path());
        if summary.is_dependent() {
            let provider = best_provider(&self.catalog, summary).ok_or_else(|| {
                Error::ServiceUnavailable(format!("no installed provider for {key}"))
            })?;
            request = request.with_provider(provider);
        }
        if let Some(level) = &self.config.log_level {
            request = request.with_log_level(level.clone());
        }

        let id = self.state.next_controller_id();
        let mut controller = Controller::new(id, key.clone());
        controller.start(self.host.as_ref(), &request, self.runner_tx.clone())?;
        info!(service = %key, controller = %id, "spawned service process");

        self.state.controllers.insert(
            id,
            ControllerEntry {
                controller,
                summary: summary.clone(),
                idle_since: None,
                stop_requested: false,
            },
        );
        self.state.by_service.insert(key, id);
        Ok(id)
    }

    /// Call `function` on an instance. The outcome arrives as a
    /// [`ManagerEvent`] carrying `tid`. Failures that can be decided
    /// locally are queued the same way.
    pub fn execute(
        &mut self,
        instance: InstanceId,
        tid: u64,
        function: &str,
        args: Value,
    ) -> Result<()> {
        let (controller_id, allocation, key, allocated) = {
            let i = self.state.instances.get(&instance).ok_or(Error::InstanceUnknown(instance))?;
            (i.controller, i.allocation, i.key.clone(), i.allocated)
        };
        if !allocated {
            self.emit_error(
                instance,
                tid,
                CODE_INSTANCE_ERROR,
                "instance is not allocated yet".to_string(),
            );
            return Ok(());
        }

        if let Some(entry) = self.catalog.get(&key) {
            let checked = match &args {
                Value::Object(map) => entry
                    .description
                    .validate_arguments(function, map)
                    .map_err(|e| e.to_string()),
                Value::Null => entry
                    .description
                    .validate_arguments(function, &Map::new())
                    .map_err(|e| e.to_string()),
                other => Err(format!("arguments must be an object, got {other}")),
            };
            if let Err(message) = checked {
                self.emit_error(instance, tid, CODE_INVALID_ARGUMENTS, message);
                return Ok(());
            }
        }

        let invoked = match self.state.controllers.get_mut(&controller_id) {
            Some(entry) => entry.controller.invoke(allocation, tid, function, args),
            None => Err(svc_runner::Error::NotConnected(key.to_string())),
        };
        if let Err(e) = invoked {
            warn!(%instance, service = %key, error = %e, "invoke failed locally");
            self.emit_error(instance, tid, CODE_SERVICE_UNAVAILABLE, e.to_string());
        }
        Ok(())
    }

    /// Relay the user's answer to a prompt raised by `instance`.
    pub fn prompt_response(
        &mut self,
        instance: InstanceId,
        prompt: u32,
        response: Value,
    ) -> Result<()> {
        let (controller_id, allocation) = self
            .state
            .instances
            .get(&instance)
            .map(|i| (i.controller, i.allocation))
            .ok_or(Error::InstanceUnknown(instance))?;
        let Some(entry) = self.state.controllers.get_mut(&controller_id) else {
            warn!(%instance, prompt, "prompt answered after its process ended");
            return Err(Error::ServiceUnavailable(instance.to_string()));
        };
        entry.controller.prompt_response(allocation, prompt, response).map_err(|e| {
            warn!(%instance, prompt, error = %e, "dropping prompt response");
            Error::from(e)
        })
    }

    /// Destroy an instance. Calls still open on it fail. The process stops
    /// once its last instance is gone, after the service's shutdown delay.
    pub fn destroy(&mut self, instance: InstanceId) -> Result<()> {
        let removed = self
            .state
            .remove_instance(instance)
            .ok_or(Error::InstanceUnknown(instance))?;

        let Some(entry) = self.state.controllers.get_mut(&removed.controller) else {
            return Ok(());
        };
        let abandoned = entry.controller.destroy(removed.allocation);
        let idle = entry.controller.instance_count() == 0;
        let delay = entry.summary.shutdown_delay_secs().unwrap_or(0);
        debug!(%instance, service = %removed.key, "instance destroyed");

        if idle {
            if delay > 0 {
                entry.idle_since = Some(Instant::now());
                debug!(service = %removed.key, delay, "service idle");
            } else {
                self.stop_controller(removed.controller);
            }
        }
        for tid in abandoned {
            self.emit_error(instance, tid, CODE_INSTANCE_ERROR, "instance destroyed".to_string());
        }
        Ok(())
    }

    /// Stop idle services whose shutdown delay expired by `now`. Returns
    /// how many were stopped.
    pub fn reap_idle(&mut self, now: Instant) -> usize {
        let expired: Vec<ControllerId> = self
            .state
            .controllers
            .iter()
            .filter(|(_, e)| e.controller.instance_count() == 0)
            .filter(|(_, e)| idle_deadline(e).is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.stop_controller(*id);
        }
        expired.len()
    }

    /// Earliest moment [`reap_idle`](Self::reap_idle) has work to do.
    pub fn next_idle_deadline(&self) -> Option<Instant> {
        self.state
            .controllers
            .values()
            .filter(|e| !e.stop_requested)
            .filter_map(idle_deadline)
            .min()
    }

    /// Stop the process of a service, if it runs. Its instances end once
    /// the process is gone.
    pub fn stop_service(&mut self, key: &ServiceKey) -> bool {
        match self.state.by_service.get(key).copied() {
            Some(id) => self.stop_controller(id),
            None => false,
        }
    }

    /// Stop every process. Returns how many were asked to stop.
    pub fn stop_all(&mut self) -> usize {
        let ids: Vec<ControllerId> = self.state.controllers.keys().copied().collect();
        ids.into_iter().filter(|id| self.stop_controller(*id)).count()
    }

    fn stop_controller(&mut self, id: ControllerId) -> bool {
        let Some(entry) = self.state.controllers.get_mut(&id) else {
            return false;
        };
        if entry.stop_requested {
            return false;
        }
        entry.stop_requested = true;
        entry.idle_since = None;
        entry.controller.shutdown(self.config.kill_grace());
        true
    }

    /// Stop, forget and uninstall a service, then rescan.
    pub async fn purge_service(&mut self, name: &str, version: &str) -> Result<()> {
        let key = ServiceKey::new(name, version);
        let summary = self
            .catalog
            .get(&key)
            .map(|e| e.summary.clone())
            .ok_or_else(|| Error::ServiceNotFound {
                name: name.to_string(),
                version: version.to_string(),
                minversion: String::new(),
            })?;

        if self.stop_service(&key) {
            tokio::time::sleep(self.config.kill_grace()).await;
        }
        self.interface_cache.purge(name, version)?;
        self.uninstaller.uninstall(&summary)?;
        info!(service = %key, "service purged");
        self.force_rescan().await;
        Ok(())
    }

    /// Any process running or starting.
    pub fn is_busy(&self) -> bool {
        !self.state.controllers.is_empty()
    }

    /// Services with a live process.
    pub fn running_services(&self) -> BTreeSet<ServiceKey> {
        self.state
            .by_service
            .keys()
            .filter(|key| self.state.live_controller(key).is_some())
            .cloned()
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.state.instances.len()
    }

    // ---------------------------------------------------------------------
    // Process events
    // ---------------------------------------------------------------------

    /// Next event from any service process.
    pub async fn next_runner_event(&mut self) -> Option<RunnerEvent> {
        self.runner_rx.recv().await
    }

    pub fn handle_runner_event(&mut self, event: RunnerEvent) {
        let Some(entry) = self.state.controllers.get_mut(&event.controller) else {
            debug!(controller = %event.controller, "event for a forgotten controller");
            return;
        };
        let outcomes = entry.controller.handle(event.event);
        for outcome in outcomes {
            self.apply(event.controller, outcome);
        }
    }

    fn apply(&mut self, controller: ControllerId, outcome: ControllerOutcome) {
        match outcome {
            ControllerOutcome::Ready { .. } => {}
            ControllerOutcome::Described(_) | ControllerOutcome::DescribeFailed(_) => {
                debug!(%controller, "unsolicited description ignored");
            }
            ControllerOutcome::Allocated(allocation) => {
                let Some(instance) = self.instance_at(controller, allocation) else {
                    return;
                };
                if let Some(i) = self.state.instances.get_mut(&instance) {
                    i.allocated = true;
                }
                self.emit(ManagerEvent::Instantiated { instance });
            }
            ControllerOutcome::InvokeResult { allocation, tid, result } => {
                if let Some(instance) = self.instance_at(controller, allocation) {
                    self.emit(ManagerEvent::Result { instance, tid, result });
                }
            }
            ControllerOutcome::InvokeError {
                allocation,
                tid,
                code,
                message,
            } => {
                if let Some(instance) = self.instance_at(controller, allocation) {
                    self.emit(ManagerEvent::Error {
                        instance,
                        tid,
                        code,
                        message,
                    });
                }
            }
            ControllerOutcome::Callback {
                allocation,
                tid,
                callback,
                params,
            } => {
                if let Some(instance) = self.instance_at(controller, allocation) {
                    self.emit(ManagerEvent::Callback {
                        instance,
                        tid,
                        callback,
                        params,
                    });
                }
            }
            ControllerOutcome::Prompt {
                allocation,
                tid,
                prompt,
                dialog,
                args,
            } => {
                if let Some(instance) = self.instance_at(controller, allocation) {
                    self.emit(ManagerEvent::Prompt {
                        instance,
                        tid,
                        prompt,
                        dialog,
                        args,
                    });
                }
            }
            ControllerOutcome::Ended {
                reached_ready,
                reason,
                failed,
                abandoned,
            } => {
                let reason = svc_runner::Error::ProcessCrashed {
                    reached_ready,
                    reason: reason.to_string(),
                }
                .to_string();
                self.on_controller_ended(controller, reached_ready, &reason, &failed, &abandoned);
            }
        }
    }

    fn on_controller_ended(
        &mut self,
        controller: ControllerId,
        reached_ready: bool,
        reason: &str,
        failed: &[AllocationId],
        abandoned: &[(AllocationId, u64)],
    ) {
        for (allocation, tid) in abandoned {
            if let Some(instance) = self.state.instance_for(controller, *allocation) {
                self.emit_error(instance, *tid, CODE_SERVICE_UNAVAILABLE, reason.to_string());
            }
        }

        let mut ended: Vec<InstanceId> = failed
            .iter()
            .filter_map(|a| self.state.instance_for(controller, *a))
            .collect();
        ended.extend(self.state.instances_of(controller));
        ended.sort();
        ended.dedup();
        for instance in ended {
            let Some(removed) = self.state.remove_instance(instance) else {
                continue;
            };
            let reason = reason.to_string();
            if removed.allocated {
                self.emit(ManagerEvent::InstanceEnded { instance, reason });
            } else {
                self.emit(ManagerEvent::InstantiateFailed { instance, reason });
            }
        }

        let Some(entry) = self.state.remove_controller(controller) else {
            return;
        };
        if !reached_ready && !entry.stop_requested {
            error!(service = %entry.summary.key(), %reason, "service failed to start, removing it");
            self.remove_broken(&entry.summary);
        }
    }

    /// Forget a service that cannot start so it is not retried forever.
    fn remove_broken(&mut self, summary: &ServiceSummary) {
        let key = summary.key();
        if let Err(e) = self.uninstaller.uninstall(summary) {
            error!(service = %key, error = %e, "failed to uninstall broken service");
        }
        if let Err(e) = self.interface_cache.purge(&key.name, &key.version) {
            warn!(service = %key, error = %e, "failed to purge cached description");
        }
        self.catalog.remove(&key);
    }

    fn instance_at(
        &self,
        controller: ControllerId,
        allocation: AllocationId,
    ) -> Option<InstanceId> {
        let found = self.state.instance_for(controller, allocation);
        if found.is_none() {
            debug!(
                %controller,
                allocation = allocation.0,
                "outcome for a destroyed instance dropped"
            );
        }
        found
    }

    fn emit(&self, event: ManagerEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    fn emit_error(&self, instance: InstanceId, tid: u64, code: &str, message: String) {
        self.emit(ManagerEvent::Error {
            instance,
            tid,
            code: code.to_string(),
            message,
        });
    }

    // ---------------------------------------------------------------------
    // Updates
    // ---------------------------------------------------------------------

    /// Installed and pending services as resolver candidates.
    pub fn installed_pool(&self) -> Vec<AvailableService> {
        let mut pool: Vec<AvailableService> = self
            .catalog
            .values()
            .map(|e| AvailableService::from_summary(&e.summary))
            .collect();
        for summary in self.pending.cached() {
            let candidate = AvailableService::from_summary(&summary);
            if !pool.iter().any(|c| c.same_identity(&candidate)) {
                pool.push(candidate);
            }
        }
        pool
    }

    pub fn satisfy_requirements(
        &self,
        requirements: &[RequireStatement],
        available: &[AvailableService],
        prefer_newest: bool,
    ) -> Result<Resolution> {
        let installed = self.installed_pool();
        let ordered = find_satisfying_set(requirements, &installed, available, prefer_newest)?;
        let to_download = ordered
            .iter()
            .filter(|s| !installed.iter().any(|i| i.same_identity(s)))
            .cloned()
            .collect();
        Ok(Resolution { ordered, to_download })
    }

    /// Download into the pending cache whatever `source` offers that makes
    /// `requirements` resolve to newer versions. Returns what was staged.
    pub async fn fetch_updates(
        &self,
        source: &dyn PackageSource,
        requirements: &[RequireStatement],
    ) -> Result<Vec<ServiceSummary>> {
        let remote = source.list().await?;
        let updates = have_updates(requirements, &self.installed_pool(), &remote)?;

        let mut staged = Vec::new();
        for update in updates {
            let version = update.version.to_string();
            if self.pending.is_cached(&update.name, &version) {
                continue;
            }
            let package = source.fetch(&update.name, &update.version).await?;
            let summary = self.pending.save(&update.name, &version, &package)?;
            info!(service = %update, bytes = package.len(), "update staged");
            staged.push(summary);
        }
        Ok(staged)
    }

    /// Move every pending package whose service is not running into the
    /// service root, then rescan.
    pub async fn install_updates(&mut self) -> Result<Vec<ServiceKey>> {
        let running = self.running_services();
        let mut installed = Vec::new();
        for summary in self.pending.cached() {
            let key = summary.key();
            if running.contains(&key) {
                info!(service = %key, "service is running, postponing its update");
                continue;
            }
            self.pending
                .install(&key.name, &key.version, &self.config.service_dir)?;
            info!(service = %key, "update installed");
            installed.push(key);
        }
        if !installed.is_empty() {
            self.force_rescan().await;
        }
        Ok(installed)
    }
}

fn idle_deadline(entry: &ControllerEntry) -> Option<Instant> {
    let since = entry.idle_since?;
    let delay = entry.summary.shutdown_delay_secs().unwrap_or(0);
    Some(since + Duration::from_secs(delay))
}
