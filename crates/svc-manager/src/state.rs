//! Owning tables for controllers and instances.
//!
//! Controllers and instances refer to each other only by id; every lookup
//! goes through [`EngineState`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use svc_meta::{ServiceKey, ServiceSummary};
use svc_runner::{AllocationId, Controller, ControllerId};

/// Handle returned by `instantiate`, valid until the instance is destroyed
/// or its process ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) struct Instance {
    pub controller: ControllerId,
    pub allocation: AllocationId,
    pub key: ServiceKey,
    /// Set once the process confirmed the allocation.
    pub allocated: bool,
}

#[derive(Debug)]
pub(crate) struct ControllerEntry {
    pub controller: Controller,
    pub summary: ServiceSummary,
    /// When the last instance went away, for services with a shutdown delay.
    pub idle_since: Option<Instant>,
    /// Stopped on purpose; an early exit must not count as a broken install.
    pub stop_requested: bool,
}

#[derive(Debug, Default)]
pub(crate) struct EngineState {
    next_controller: u64,
    next_instance: u64,
    pub controllers: BTreeMap<ControllerId, ControllerEntry>,
    /// At most one live controller per service.
    pub by_service: HashMap<ServiceKey, ControllerId>,
    pub instances: BTreeMap<InstanceId, Instance>,
    pub by_allocation: HashMap<(ControllerId, AllocationId), InstanceId>,
}

impl EngineState {
    pub fn next_controller_id(&mut self) -> ControllerId {
        self.next_controller += 1;
        ControllerId(self.next_controller)
    }

    pub fn next_instance_id(&mut self) -> InstanceId {
        self.next_instance += 1;
        InstanceId(self.next_instance)
    }

    pub fn live_controller(&self, key: &ServiceKey) -> Option<ControllerId> {
        let id = *self.by_service.get(key)?;
        let entry = self.controllers.get(&id)?;
        (entry.controller.is_alive() && !entry.stop_requested).then_some(id)
    }

    pub fn insert_instance(&mut self, id: InstanceId, instance: Instance) {
        self.by_allocation
            .insert((instance.controller, instance.allocation), id);
        self.instances.insert(id, instance);
    }

    pub fn remove_instance(&mut self, id: InstanceId) -> Option<Instance> {
        let instance = self.instances.remove(&id)?;
        self.by_allocation
            .remove(&(instance.controller, instance.allocation));
        Some(instance)
    }

    pub fn instance_for(
        &self,
        controller: ControllerId,
        allocation: AllocationId,
    ) -> Option<InstanceId> {
        self.by_allocation.get(&(controller, allocation)).copied()
    }

    /// Instances bound to `controller`, in id order.
    pub fn instances_of(&self, controller: ControllerId) -> Vec<InstanceId> {
        self.instances
            .iter()
            .filter(|(_, i)| i.controller == controller)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn remove_controller(&mut self, id: ControllerId) -> Option<ControllerEntry> {
        let entry = self.controllers.remove(&id)?;
        if self.by_service.get(entry.controller.key()) == Some(&id) {
            self.by_service.remove(entry.controller.key());
        }
        Some(entry)
    }
}
