//! Reservation accountant: per-application reserved load across nodes.
//!
//! Two views are maintained, both computed from the current entity
//! snapshot rather than cached, so they can never drift from the
//! source of truth:
//!
//! - **Cluster view**: `reservedCapacity = Σ(minNodes × perNodeReservation)`
//!   across every application with an active reservation;
//!   `reservedLoadUsed = Σ min(appActualLoad, appReservedCapacity)`.
//! - **Per-node view**: for every node and every application with an
//!   active reservation, `appNodeReserved = max(0, perNodeReservation
//!   − actualLoadOfAppOnNode)`. This carry is summed into a node's
//!   *effective load* for capacity decisions even on nodes the
//!   application does not yet occupy — an application's unused
//!   reservation counts against a node's free capacity the moment the
//!   reservation exists, not only once the application lands there.

use crate::entity::{Application, ApplicationMetricCapacity};
use crate::{ApplicationName, MetricName, NodeId, PlbError, Result};
use std::collections::HashMap;

/// Stateless reservation accounting over a point-in-time snapshot of
/// applications and their actual loads.
pub struct ReservationAccountant;

impl ReservationAccountant {
    /// Cluster-wide reserved capacity for `metric`: the sum, over
    /// every application with an active reservation on `metric`, of
    /// `minNodeCount * perNodeReservation`.
    pub fn cluster_reserved_capacity(apps: &[Application], metric: &str) -> i64 {
        apps.iter().map(|a| a.reserved_capacity(metric)).sum()
    }

    /// Cluster-wide reserved load actually used for `metric`: the sum,
    /// over every application with an active reservation, of
    /// `min(actualLoad, reservedCapacity)`.
    pub fn cluster_reserved_load_used(
        apps: &[Application],
        actual_load_by_app: &HashMap<ApplicationName, i64>,
        metric: &str,
    ) -> i64 {
        apps.iter()
            .filter(|a| a.reservation_active(metric).is_some())
            .map(|a| {
                let reserved = a.reserved_capacity(metric);
                let actual = actual_load_by_app.get(&a.name).copied().unwrap_or(0);
                actual.min(reserved)
            })
            .sum()
    }

    /// Reservation carry one application contributes on one node:
    /// `max(0, perNodeReservation − actualLoadOnNode)`. Returns `0`
    /// when the application has no active reservation on `metric`.
    pub fn app_node_carry(app: &Application, metric: &str, actual_load_on_node: i64) -> i64 {
        match app.reservation_active(metric) {
            Some(per_node_reservation) => (per_node_reservation - actual_load_on_node).max(0),
            None => 0,
        }
    }

    /// Total reservation carry across every reservation-active
    /// application for one node and metric.
    pub fn node_carry<'a>(
        apps_with_actual_load: impl Iterator<Item = (&'a Application, i64)>,
        metric: &str,
    ) -> i64 {
        apps_with_actual_load
            .map(|(app, actual)| Self::app_node_carry(app, metric, actual))
            .sum()
    }

    /// A node's effective load for capacity decisions: actual load
    /// plus every application's reservation carry on that node.
    pub fn effective_node_load(actual_load: i64, carry: i64) -> i64 {
        actual_load + carry
    }

    /// Validate that creating or updating `candidate` would not push
    /// any metric's cluster-wide reserved capacity above that
    /// metric's cluster capacity.
    ///
    /// `other_apps` must already exclude the prior version of
    /// `candidate` (if any) so the comparison doesn't double-count the
    /// application being replaced. Lowering or removing a reservation
    /// always succeeds — this only rejects increases that overrun
    /// capacity.
    pub fn validate_application_update(
        other_apps: &[Application],
        candidate: &Application,
        cluster_capacity_by_metric: &HashMap<MetricName, i64>,
    ) -> Result<()> {
        for (metric, cap) in &candidate.capacities {
            if candidate.min_node_count <= 0 || cap.per_node_reservation <= 0 {
                continue;
            }
            let existing_reserved: i64 = other_apps.iter().map(|a| a.reserved_capacity(metric)).sum();
            let candidate_reserved = candidate.reserved_capacity(metric);
            let total_reserved = existing_reserved + candidate_reserved;
            let cluster_capacity = cluster_capacity_by_metric.get(metric).copied().unwrap_or(0);

            if total_reserved > cluster_capacity {
                return Err(PlbError::InsufficientClusterCapacity {
                    metric: metric.clone(),
                    requested: total_reserved,
                    available: cluster_capacity,
                });
            }
        }
        Ok(())
    }
}

/// Per-node rollup used by [`crate::query`] and the capacity
/// constraint.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeReservationView {
    /// Raw reported load on the node.
    pub actual_load: i64,
    /// Sum of every application's reservation carry on the node.
    pub reserved_carry: i64,
}

impl NodeReservationView {
    /// Effective load for capacity checks: `actual_load + reserved_carry`.
    pub fn effective_load(&self) -> i64 {
        self.actual_load + self.reserved_carry
    }
}
