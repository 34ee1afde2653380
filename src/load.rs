//! Load table: per-partition, per-metric reported loads.
//!
//! A load report is keyed by `(partition, metric)`, not by the node
//! currently hosting a role — a stateful report carries a primary
//! value and a per-node secondary map; which physical node is
//! "primary" right now is a property of the partition's replica list,
//! not of the load table. This is why a role change (e.g. a primary
//! swap) never needs to rewrite a load entry: callers resolve the
//! value for a replica by looking up its *current* role against the
//! stored record.

use crate::entity::{Replica, ReplicaRole, Service};
use crate::{MetricName, NodeId, PartitionId};
use dashmap::DashMap;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LoadKey {
    partition: PartitionId,
    metric: MetricName,
}

/// One metric's reported load for a partition.
#[derive(Debug, Clone, Default)]
struct LoadRecord {
    /// Reported load of whichever replica currently holds the primary
    /// role. `None` until a report arrives.
    primary: Option<i64>,
    /// Reported load per node for secondary (or instance, for
    /// stateless services) replicas.
    per_node: HashMap<NodeId, i64>,
}

/// Concurrent, mergeable load table.
#[derive(Debug, Default)]
pub struct LoadTable {
    records: DashMap<LoadKey, LoadRecord>,
}

impl LoadTable {
    /// Create an empty load table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a stateful load report. `primary`, when `Some`, replaces
    /// the stored primary value; entries in `secondary` update only
    /// the named nodes, leaving all other nodes' previously reported
    /// values untouched.
    pub fn report_stateful(
        &self,
        partition: PartitionId,
        metric: &str,
        primary: Option<i64>,
        secondary: &HashMap<NodeId, i64>,
    ) {
        let key = LoadKey {
            partition,
            metric: metric.to_string(),
        };
        let mut entry = self.records.entry(key).or_default();
        if let Some(p) = primary {
            entry.primary = Some(p);
        }
        for (&node, &load) in secondary {
            entry.per_node.insert(node, load);
        }
        tracing::debug!(
            partition = %partition,
            metric = %metric,
            primary = ?primary,
            secondary_count = secondary.len(),
            "load report merged"
        );
    }

    /// Merge a stateless (instance) load report: updates only the
    /// named nodes.
    pub fn report_stateless(&self, partition: PartitionId, metric: &str, per_node: &HashMap<NodeId, i64>) {
        let key = LoadKey {
            partition,
            metric: metric.to_string(),
        };
        let mut entry = self.records.entry(key).or_default();
        for (&node, &load) in per_node {
            entry.per_node.insert(node, load);
        }
    }

    /// Resolve the load for `replica` of `partition`'s `metric`,
    /// falling back to `service`'s declared default by role when no
    /// value was ever reported.
    pub fn replica_load(&self, partition: PartitionId, service: &Service, replica: &Replica, metric: &str) -> i64 {
        let default = service
            .metrics
            .iter()
            .find(|m| m.name == metric)
            .map(|m| (m.primary_default, m.secondary_default))
            .unwrap_or((0, 0));

        let key = LoadKey {
            partition,
            metric: metric.to_string(),
        };
        let Some(record) = self.records.get(&key) else {
            return if replica.role == ReplicaRole::Primary {
                default.0
            } else {
                default.1
            };
        };

        if !service.is_stateful {
            return record.per_node.get(&replica.node.id).copied().unwrap_or(default.0);
        }

        match replica.role {
            ReplicaRole::Primary => record.primary.unwrap_or(default.0),
            _ => record
                .per_node
                .get(&replica.node.id)
                .copied()
                .unwrap_or(default.1),
        }
    }

    /// Total reported (or defaulted) load for `metric` across every
    /// live replica of `partition`.
    pub fn partition_total_load(&self, partition: PartitionId, service: &Service, replicas: &[Replica], metric: &str) -> i64 {
        replicas
            .iter()
            .filter(|r| r.counts_toward_capacity())
            .map(|r| self.replica_load(partition, service, r, metric))
            .sum()
    }

    /// Drop every load entry for a partition; called when the
    /// partition is tombstoned.
    pub fn forget_partition(&self, partition: PartitionId) {
        self.records.retain(|k, _| k.partition != partition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{MoveCost, NodeInstance, ReplicaFlags, ReplicaState, ServiceMetric};

    fn stateful_service() -> Service {
        Service {
            name: "S0".into(),
            service_type: "T".into(),
            application: None,
            is_stateful: true,
            has_persisted_state: true,
            target_replica_set_size: 3,
            partition_count: 1,
            placement_constraint: None,
            affinity_parent: None,
            aligned_affinity: true,
            metrics: vec![ServiceMetric {
                name: "CPU".into(),
                weight: 1.0,
                primary_default: 10,
                secondary_default: 5,
                is_defrag_metric: false,
            }],
            default_move_cost: MoveCost::Low,
            service_package: None,
            scaling_policies: vec![],
            on_every_node: false,
            version: 1,
        }
    }

    fn replica(node: NodeId, role: ReplicaRole) -> Replica {
        Replica {
            node: NodeInstance::new(node, 1),
            role,
            state: ReplicaState::Ready,
            up: true,
            flags: ReplicaFlags::default(),
        }
    }

    #[test]
    fn missing_report_falls_back_to_service_default() {
        let table = LoadTable::new();
        let svc = stateful_service();
        let p = PartitionId::from_u128(1);
        assert_eq!(table.replica_load(p, &svc, &replica(0, ReplicaRole::Primary), "CPU"), 10);
        assert_eq!(table.replica_load(p, &svc, &replica(1, ReplicaRole::Secondary), "CPU"), 5);
    }

    #[test]
    fn partial_report_never_resets_other_nodes() {
        let table = LoadTable::new();
        let svc = stateful_service();
        let p = PartitionId::from_u128(1);
        let mut secondary = HashMap::new();
        secondary.insert(1, 7);
        table.report_stateful(p, "CPU", Some(20), &secondary);

        let mut only_node_2 = HashMap::new();
        only_node_2.insert(2, 9);
        table.report_stateful(p, "CPU", None, &only_node_2);

        assert_eq!(table.replica_load(p, &svc, &replica(0, ReplicaRole::Primary), "CPU"), 20);
        assert_eq!(table.replica_load(p, &svc, &replica(1, ReplicaRole::Secondary), "CPU"), 7);
        assert_eq!(table.replica_load(p, &svc, &replica(2, ReplicaRole::Secondary), "CPU"), 9);
    }

    #[test]
    fn role_change_reads_new_role_without_rewriting_table() {
        let table = LoadTable::new();
        let svc = stateful_service();
        let p = PartitionId::from_u128(1);
        let mut secondary = HashMap::new();
        secondary.insert(1, 7);
        table.report_stateful(p, "CPU", Some(20), &secondary);

        // Node 1 is promoted to primary; load table is untouched, but
        // the resolved load for node 1 now reads the primary slot.
        assert_eq!(table.replica_load(p, &svc, &replica(1, ReplicaRole::Primary), "CPU"), 20);
    }

    #[test]
    fn partition_total_sums_live_replicas_only() {
        let table = LoadTable::new();
        let svc = stateful_service();
        let p = PartitionId::from_u128(1);
        let mut secondary = HashMap::new();
        secondary.insert(1, 7);
        secondary.insert(2, 3);
        table.report_stateful(p, "CPU", Some(20), &secondary);

        let replicas = vec![
            replica(0, ReplicaRole::Primary),
            replica(1, ReplicaRole::Secondary),
            replica(2, ReplicaRole::Secondary),
        ];
        assert_eq!(table.partition_total_load(p, &svc, &replicas, "CPU"), 30);
    }
}
