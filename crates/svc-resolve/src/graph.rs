//! Provider-first ordering of a resolved service set.
//!
//! Edges point from dependent to provider. Kahn's algorithm runs from the
//! nodes nobody depends on, and the emitted order is reversed so providers
//! come first.

use std::collections::{BTreeMap, BinaryHeap};

use tracing::error;

use crate::error::{Error, Result};
use crate::types::AvailableService;

/// Result of a best-effort sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOutcome {
    /// Providers before dependents. Nodes stuck in a cycle are appended at
    /// the end in insertion order.
    pub order: Vec<AvailableService>,
    /// Nodes that could not be ordered because they are part of, or hang
    /// off, a cycle.
    pub cyclic: Vec<AvailableService>,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceGraph {
    nodes: Vec<AvailableService>,
    /// dependent index -> provider index
    edges: BTreeMap<usize, usize>,
}

impl ServiceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph for a resolved set, linking every dependent to the
    /// best node in the set that satisfies its provider constraint.
    pub fn from_services(services: &[AvailableService]) -> Self {
        let mut graph = Self::new();
        for service in services {
            graph.add_node(service.clone());
        }
        for (from, service) in services.iter().enumerate() {
            let Some(provider) = &service.provider else {
                continue;
            };
            let mut best: Option<usize> = None;
            for (to, candidate) in services.iter().enumerate() {
                if candidate.name != provider.name {
                    continue;
                }
                let current = best.map(|i| &services[i].version);
                if svc_meta::is_newer_match(
                    &candidate.version,
                    current,
                    &provider.version,
                    &provider.minversion,
                ) {
                    best = Some(to);
                }
            }
            if let Some(to) = best {
                graph.add_edge(from, to);
            }
        }
        graph
    }

    /// Add a node and return its index.
    pub fn add_node(&mut self, service: AvailableService) -> usize {
        self.nodes.push(service);
        self.nodes.len() - 1
    }

    /// Record that node `from` is hosted by node `to`. A dependent has a
    /// single provider, so a later edge from the same node replaces the
    /// earlier one. Out-of-range indexes are ignored.
    pub fn add_edge(&mut self, from: usize, to: usize) {
        if from < self.nodes.len() && to < self.nodes.len() {
            self.edges.insert(from, to);
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Order the nodes, tolerating cycles.
    ///
    /// Independent nodes keep their insertion order.
    pub fn sort(&self) -> SortOutcome {
        let mut edges = self.edges.clone();
        let mut incoming = vec![0usize; self.nodes.len()];
        for &to in edges.values() {
            incoming[to] += 1;
        }

        // Max-heap: the highest index is emitted first, so after the final
        // reversal lower indexes come first.
        let mut ready: BinaryHeap<usize> =
            (0..self.nodes.len()).filter(|&i| incoming[i] == 0).collect();
        let mut emitted = Vec::with_capacity(self.nodes.len());
        let mut done = vec![false; self.nodes.len()];

        while let Some(node) = ready.pop() {
            emitted.push(node);
            done[node] = true;
            if let Some(to) = edges.remove(&node) {
                incoming[to] -= 1;
                if incoming[to] == 0 {
                    ready.push(to);
                }
            }
        }
        emitted.reverse();

        let stuck: Vec<usize> = (0..self.nodes.len()).filter(|&i| !done[i]).collect();
        let mut order: Vec<AvailableService> =
            emitted.iter().map(|&i| self.nodes[i].clone()).collect();
        let cyclic: Vec<AvailableService> =
            stuck.iter().map(|&i| self.nodes[i].clone()).collect();
        order.extend(cyclic.iter().cloned());

        SortOutcome { order, cyclic }
    }

    /// Order the nodes, failing with [`Error::CyclicDependency`] if any
    /// edges remain.
    pub fn topological_sort(&self) -> Result<Vec<AvailableService>> {
        let outcome = self.sort();
        if !outcome.cyclic.is_empty() {
            let participants = outcome.cyclic.iter().map(ToString::to_string).collect();
            return Err(Error::CyclicDependency { participants });
        }
        Ok(outcome.order)
    }

    /// Best-effort order that logs a cycle instead of failing.
    pub fn sort_logging_cycles(&self) -> Vec<AvailableService> {
        let outcome = self.sort();
        if !outcome.cyclic.is_empty() {
            let participants: Vec<String> =
                outcome.cyclic.iter().map(ToString::to_string).collect();
            error!(
                participants = %participants.join(", "),
                "dependency cycle detected, returning partial order"
            );
        }
        outcome.order
    }
}
