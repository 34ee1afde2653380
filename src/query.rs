//! Query service: cluster, node, and application load rollups with
//! reservation folded in.
//!
//! Every rollup reflects the engine's own post-decision state (any
//! move already committed this refresh, even before the Failover
//! Manager executes it), never the raw entity store. Every value here
//! is computed fresh over live state rather than cached in a stored
//! field.

use crate::entity::{Application, Node, Partition, Service};
use crate::reservation::ReservationAccountant;
use crate::{ApplicationName, MetricName, NodeId, PlbError, Result};
use crate::load::LoadTable;
use std::collections::HashMap;

/// `capacity`, `bufferedCapacity`, `load`, `remainingUnbuffered`,
/// `remainingBuffered`, `isCapacityViolation` for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadInformation {
    /// Declared capacity for the metric.
    pub capacity: i64,
    /// `capacity * (1 - bufferPercent)`.
    pub buffered_capacity: i64,
    /// Effective load: actual load plus reservation carry.
    pub load: i64,
    /// `capacity - load`.
    pub remaining_unbuffered: i64,
    /// `buffered_capacity - load`.
    pub remaining_buffered: i64,
    /// Whether `load` exceeds `capacity`.
    pub is_capacity_violation: bool,
}

impl LoadInformation {
    fn new(capacity: i64, load: i64, buffer_percent: f64) -> Self {
        let buffered_capacity = (capacity as f64 * (1.0 - buffer_percent)) as i64;
        Self {
            capacity,
            buffered_capacity,
            load,
            remaining_unbuffered: capacity - load,
            remaining_buffered: buffered_capacity - load,
            is_capacity_violation: load > capacity,
        }
    }
}

/// Query service over one refreshed snapshot. Constructed fresh after
/// every successful `Refresh`; queries against a stale or absent
/// snapshot return [`PlbError::PlbNotReady`].
pub struct QueryService<'a> {
    nodes: &'a [Node],
    applications: &'a [Application],
    services: &'a [Service],
    partitions: &'a [Partition],
    load_table: &'a LoadTable,
    buffer_percent: f64,
}

impl<'a> QueryService<'a> {
    /// Build a query view over a snapshot.
    pub fn new(nodes: &'a [Node], applications: &'a [Application], services: &'a [Service], partitions: &'a [Partition], load_table: &'a LoadTable, buffer_percent: f64) -> Self {
        Self {
            nodes,
            applications,
            services,
            partitions,
            load_table,
            buffer_percent,
        }
    }

    /// Cluster-wide load rollup for `metric`.
    pub fn cluster_load(&self, metric: &str) -> LoadInformation {
        let capacity: i64 = self.nodes.iter().map(|n| n.capacity(metric)).sum();
        let actual: i64 = self.total_actual_load(metric);
        let carry: i64 = self
            .applications
            .iter()
            .map(|app| app.reserved_capacity(metric))
            .sum::<i64>()
            .saturating_sub(Self::reserved_load_used(self.applications, &self.app_actual_loads(metric), metric));
        LoadInformation::new(capacity, actual + carry.max(0), self.buffer_percent)
    }

    /// Per-node load rollup for `metric`. Returns `None` if `node` is
    /// unknown.
    pub fn node_load(&self, node: NodeId, metric: &str) -> Option<LoadInformation> {
        let node = self.nodes.iter().find(|n| n.instance.id == node)?;
        let actual = self.node_actual_load(node.instance.id, metric);
        let carry = self.node_reservation_carry(node.instance.id, metric);
        Some(LoadInformation::new(node.capacity(metric), actual + carry, self.buffer_percent))
    }

    /// Per-application load rollup for `metric`. Capacity is the
    /// declared total capacity (or the sum of constituent nodes'
    /// capacity when unbounded).
    pub fn application_load(&self, app: &str, metric: &str) -> Option<LoadInformation> {
        let app = self.applications.iter().find(|a| a.name == app)?;
        let capacity = app
            .capacities
            .get(metric)
            .and_then(|c| c.total_capacity)
            .unwrap_or_else(|| self.nodes.iter().map(|n| n.capacity(metric)).sum());
        let actual = self.app_actual_loads(metric).get(&app.name).copied().unwrap_or(0);
        Some(LoadInformation::new(capacity, actual, self.buffer_percent))
    }

    fn total_actual_load(&self, metric: &str) -> i64 {
        self.partitions
            .iter()
            .filter_map(|p| self.services.iter().find(|s| s.name == p.service).map(|s| (p, s)))
            .map(|(p, s)| self.load_table.partition_total_load(p.id, s, &p.replicas, metric))
            .sum()
    }

    fn node_actual_load(&self, node: NodeId, metric: &str) -> i64 {
        self.partitions
            .iter()
            .filter_map(|p| self.services.iter().find(|s| s.name == p.service).map(|s| (p, s)))
            .flat_map(|(p, s)| {
                p.live_replicas()
                    .filter(move |r| r.node.id == node && r.counts_toward_capacity())
                    .map(move |r| self.load_table.replica_load(p.id, s, r, metric))
            })
            .sum()
    }

    fn app_actual_loads(&self, metric: &str) -> HashMap<ApplicationName, i64> {
        let mut out = HashMap::new();
        for service in self.services {
            let Some(app_name) = &service.application else { continue };
            let total: i64 = self
                .partitions
                .iter()
                .filter(|p| p.service == service.name)
                .map(|p| self.load_table.partition_total_load(p.id, service, &p.replicas, metric))
                .sum();
            *out.entry(app_name.clone()).or_insert(0) += total;
        }
        out
    }

    fn node_reservation_carry(&self, node: NodeId, metric: &str) -> i64 {
        self.applications
            .iter()
            .map(|app| {
                let actual_on_node: i64 = self
                    .services
                    .iter()
                    .filter(|s| s.application.as_deref() == Some(app.name.as_str()))
                    .flat_map(|s| {
                        self.partitions
                            .iter()
                            .filter(move |p| p.service == s.name)
                            .flat_map(move |p| {
                                p.live_replicas()
                                    .filter(move |r| r.node.id == node)
                                    .map(move |r| self.load_table.replica_load(p.id, s, r, metric))
                            })
                    })
                    .sum();
                ReservationAccountant::app_node_carry(app, metric, actual_on_node)
            })
            .sum()
    }

    fn reserved_load_used(applications: &[Application], actual_by_app: &HashMap<ApplicationName, i64>, metric: &str) -> i64 {
        ReservationAccountant::cluster_reserved_load_used(applications, actual_by_app, metric)
    }
}

/// Guard that every `Query*` call should run through: returns
/// [`PlbError::PlbNotReady`] until the engine's first refresh
/// completes.
pub fn require_ready(has_refreshed: bool) -> Result<()> {
    if has_refreshed {
        Ok(())
    } else {
        Err(PlbError::PlbNotReady)
    }
}
