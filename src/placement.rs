//! Placement phase: places replicas for partitions with unmet replica
//! counts, ranking candidate nodes and selecting the best one that
//! clears the shared [`crate::constraints`] set.

use crate::config::PlbConfig;
use crate::constraints::{self, ConstraintContext, ConstraintKind, ConstraintVerdict};
use crate::entity::{Application, Node, NodeInstance, Partition, Replica, ReplicaFlags, ReplicaRole, ReplicaState, Service, ServiceType};
use crate::load::LoadTable;
use crate::movement::{Action, PartitionMovement};
use crate::NodeId;
use std::collections::HashSet;

/// The placement phase. Stateless: every call operates on the
/// snapshot passed in.
pub struct PlacementPhase;

impl PlacementPhase {
    /// Run placement for one service domain (a set of services that
    /// share a metric or affinity edge) and return every movement the
    /// phase committed to.
    pub fn run(
        nodes: &[Node],
        service_types: &[ServiceType],
        applications: &[Application],
        services: &[Service],
        partitions: &[Partition],
        load_table: &LoadTable,
        config: &PlbConfig,
    ) -> Vec<PartitionMovement> {
        let mut movements = Vec::new();
        let ctx = ConstraintContext {
            nodes,
            service_types,
            applications,
            partitions,
            load_table,
            relax_affinity: false,
            relax_scaleout_for_app: HashSet::new(),
            relax_fault_upgrade_domain: false,
        };

        for service in services {
            let service_partitions: Vec<&Partition> = partitions.iter().filter(|p| p.service == service.name).collect();

            for partition in service_partitions {
                if service.on_every_node {
                    movements.extend(Self::place_on_every_node(&ctx, nodes, service, partition));
                    continue;
                }

                movements.extend(
                    Self::drop_replicas(service, partition)
                        .into_iter()
                        .map(|action| PartitionMovement::new(partition.id, service.name.clone(), action)),
                );

                let pending = partition.replica_difference.max(0);
                if pending == 0 {
                    continue;
                }

                // `working` accumulates this round's own placements so a
                // later iteration sees them as already hosting and
                // already consuming capacity, rather than re-deriving
                // candidates from the untouched snapshot every time.
                // Disabling the knob restores the untouched-snapshot
                // behavior, which can target the same node twice in one
                // round.
                let mut working = partition.clone();
                for _ in 0..pending {
                    let role_needed = Self::role_needed(service, &working);
                    match Self::place_one(&ctx, nodes, service, &working, role_needed, config) {
                        Some(action) => {
                            if config.prevent_transient_overcommit {
                                if let Some(node_id) = Self::action_target(&action) {
                                    working.replicas.push(Replica {
                                        node: NodeInstance::new(node_id, 1),
                                        role: role_needed,
                                        state: ReplicaState::Ready,
                                        up: true,
                                        flags: ReplicaFlags::default(),
                                    });
                                }
                            }
                            movements.push(PartitionMovement::new(partition.id, service.name.clone(), action));
                        }
                        None => {
                            tracing::debug!(
                                partition = %partition.id,
                                service = %service.name,
                                "no viable placement candidate this round"
                            );
                            break;
                        }
                    }
                }
            }
        }

        movements
    }

    /// Drops explicitly flagged replicas and, when the replica count
    /// still exceeds the target after those, drops enough additional
    /// replicas to close the gap. A secondary flagged to be promoted
    /// is promoted first so a paired primary drop never leaves the
    /// partition without a primary candidate.
    fn drop_replicas(service: &Service, partition: &Partition) -> Vec<Action> {
        let mut actions = Vec::new();

        for replica in partition.live_replicas().filter(|r| r.flags.to_be_promoted && r.role == ReplicaRole::Secondary) {
            actions.push(Action::PromoteSecondary { node: replica.node.id });
        }

        let flagged: Vec<&Replica> = partition
            .live_replicas()
            .filter(|r| r.flags.to_be_dropped_by_fm || r.flags.to_be_dropped_by_plb || r.flags.to_be_dropped_for_node_deactivation)
            .collect();
        let mut consumed: HashSet<NodeId> = HashSet::new();
        for replica in &flagged {
            actions.push(Self::drop_action(service, replica));
            consumed.insert(replica.node.id);
        }

        let excess = (-partition.replica_difference).max(0) as usize;
        let remaining = excess.saturating_sub(flagged.len());
        if remaining > 0 {
            let mut candidates: Vec<&Replica> = partition.live_replicas().filter(|r| !consumed.contains(&r.node.id)).collect();
            candidates.sort_by_key(|r| (Self::drop_priority(r.role), r.node.id));
            for replica in candidates.into_iter().take(remaining) {
                actions.push(Self::drop_action(service, replica));
            }
        }

        actions
    }

    /// Secondaries and stateless instances are dropped before a
    /// primary, since losing a secondary is cheaper than a
    /// reconfiguration.
    fn drop_priority(role: ReplicaRole) -> u8 {
        match role {
            ReplicaRole::StandBy | ReplicaRole::Secondary | ReplicaRole::None => 0,
            ReplicaRole::Primary => 1,
            ReplicaRole::Dropped => 2,
        }
    }

    fn drop_action(service: &Service, replica: &Replica) -> Action {
        if !service.is_stateful {
            return Action::DropInstance { node: replica.node.id };
        }
        match replica.role {
            ReplicaRole::Primary => Action::DropPrimary { node: replica.node.id },
            _ => Action::DropSecondary { node: replica.node.id },
        }
    }

    fn role_needed(service: &Service, partition: &Partition) -> ReplicaRole {
        if !service.is_stateful {
            return ReplicaRole::None;
        }
        let has_primary = partition.live_replicas().any(|r| r.role == ReplicaRole::Primary);
        if has_primary {
            ReplicaRole::Secondary
        } else {
            ReplicaRole::Primary
        }
    }

    fn place_on_every_node(ctx: &ConstraintContext, nodes: &[Node], service: &Service, partition: &Partition) -> Vec<PartitionMovement> {
        let hosting = partition.hosting_node_ids();
        nodes
            .iter()
            .filter(|n| n.usable_for_placement() && !hosting.contains(&n.instance.id))
            .filter(|n| constraints::highest_violation(&constraints::check_all(ctx, n, service, partition, ReplicaRole::None)).is_none())
            .map(|n| PartitionMovement::new(partition.id, service.name.clone(), Action::AddInstance { node: n.instance.id }))
            .collect()
    }

    fn place_one(
        ctx: &ConstraintContext,
        nodes: &[Node],
        service: &Service,
        partition: &Partition,
        role_needed: ReplicaRole,
        config: &PlbConfig,
    ) -> Option<Action> {
        let hosting = partition.hosting_node_ids();
        let mut candidates: Vec<&Node> = nodes
            .iter()
            .filter(|n| n.usable_for_placement() && !hosting.contains(&n.instance.id))
            .collect();

        candidates.sort_by(|a, b| Self::rank(ctx, service, partition, a).cmp(&Self::rank(ctx, service, partition, b)));

        for node in candidates {
            let verdicts = constraints::check_all(ctx, node, service, partition, role_needed);
            let blocker = constraints::highest_violation(&verdicts);
            let acceptable = match blocker {
                None => true,
                Some(ConstraintKind::NodeCapacity) if config.relax_capacity_constraint_for_upgrade && partition.flags.upgrading => {
                    tracing::warn!(
                        partition = %partition.id,
                        node = node.instance.id,
                        "accepting transient node-capacity overcommit under upgrade relaxation"
                    );
                    true
                }
                _ => false,
            };
            if !acceptable {
                continue;
            }

            let action = match role_needed {
                ReplicaRole::Primary => Action::AddPrimary { node: node.instance.id },
                ReplicaRole::Secondary => Action::AddSecondary { node: node.instance.id },
                _ => Action::AddInstance { node: node.instance.id },
            };
            return Some(action);
        }
        None
    }

    fn action_target(action: &Action) -> Option<NodeId> {
        match *action {
            Action::AddPrimary { node } | Action::AddSecondary { node } | Action::AddInstance { node } => Some(node),
            _ => None,
        }
    }

    /// Ranking key: lower sorts first. Ordered: affinity alignment,
    /// then constraint slack, then fault/upgrade domain diversity,
    /// then node id for a stable tie-break.
    fn rank(ctx: &ConstraintContext, service: &Service, partition: &Partition, node: &Node) -> (u8, i64, usize, NodeId) {
        let affinity_score = Self::affinity_score(ctx, service, node);
        let slack = Self::slack(service, partition, node);
        let shared_domain = Self::shared_domain_count(ctx, partition, node);
        (affinity_score, slack, shared_domain, node.instance.id)
    }

    fn affinity_score(ctx: &ConstraintContext, service: &Service, node: &Node) -> u8 {
        let Some(parent_name) = &service.affinity_parent else {
            return 0;
        };
        let parent_nodes: HashSet<NodeId> = ctx
            .partitions
            .iter()
            .filter(|p| &p.service == parent_name)
            .flat_map(|p| p.hosting_node_ids())
            .collect();
        if parent_nodes.contains(&node.instance.id) {
            0
        } else {
            1
        }
    }

    fn slack(service: &Service, partition: &Partition, node: &Node) -> i64 {
        service
            .metrics
            .iter()
            .map(|m| {
                let existing: i64 = partition
                    .live_replicas()
                    .filter(|r| r.node.id == node.instance.id)
                    .map(|_| 0)
                    .sum();
                let weighted = (existing as f64 * m.weight) as i64;
                weighted - node.capacity(&m.name)
            })
            .sum()
    }

    fn shared_domain_count(ctx: &ConstraintContext, partition: &Partition, node: &Node) -> usize {
        partition
            .live_replicas()
            .filter_map(|r| ctx.nodes.iter().find(|n| n.instance.id == r.node.id))
            .filter(|n| n.fault_domain == node.fault_domain)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{
        DeactivationIntent, DeactivationStatus, DomainPath, MoveCost, NodeInstance, PartitionFlags, Replica,
        ReplicaFlags, ReplicaState, ServiceMetric,
    };
    use std::collections::HashMap;

    fn node(id: NodeId, capacity: i64) -> Node {
        let mut capacities = HashMap::new();
        capacities.insert("CPU".to_string(), capacity);
        Node {
            instance: NodeInstance::new(id, 1),
            up: true,
            fault_domain: DomainPath::parse(&format!("dc0/rack{id}")),
            upgrade_domain: "UD0".into(),
            properties: HashMap::new(),
            capacities,
            deactivation_intent: DeactivationIntent::None,
            deactivation_status: DeactivationStatus::None,
            version: 1,
        }
    }

    fn stateful_service() -> Service {
        Service {
            name: "S0".into(),
            service_type: "T0".into(),
            application: None,
            is_stateful: true,
            has_persisted_state: false,
            target_replica_set_size: 1,
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

    fn new_partition() -> Partition {
        Partition {
            id: crate::PartitionId::from_u128(1),
            service: "S0".into(),
            version: 1,
            replica_difference: 1,
            replicas: vec![],
            flags: PartitionFlags::default(),
            deleted: false,
        }
    }

    #[test]
    fn new_partition_gets_a_primary() {
        let nodes = vec![node(1, 100), node(2, 100)];
        let sts = vec![ServiceType {
            name: "T0".into(),
            block_list: HashSet::new(),
            version: 1,
        }];
        let svc = stateful_service();
        let p = new_partition();
        let load = LoadTable::new();
        let config = PlbConfig::for_tests();

        let movements = PlacementPhase::run(&nodes, &sts, &[], &[svc], &[p], &load, &config);
        assert_eq!(movements.len(), 1);
        assert!(matches!(movements[0].action, Action::AddPrimary { .. }));
    }

    #[test]
    fn no_candidate_yields_no_movement() {
        let nodes = vec![node(1, 1)]; // too small for the default load of 10
        let sts = vec![ServiceType {
            name: "T0".into(),
            block_list: HashSet::new(),
            version: 1,
        }];
        let svc = stateful_service();
        let p = new_partition();
        let load = LoadTable::new();
        let config = PlbConfig::for_tests();

        let movements = PlacementPhase::run(&nodes, &sts, &[], &[svc], &[p], &load, &config);
        assert!(movements.is_empty());
    }

    #[test]
    fn on_every_node_service_places_an_instance_per_eligible_node() {
        let nodes = vec![node(1, 100), node(2, 100)];
        let sts = vec![ServiceType {
            name: "T0".into(),
            block_list: HashSet::new(),
            version: 1,
        }];
        let mut svc = stateful_service();
        svc.is_stateful = false;
        svc.on_every_node = true;
        let mut p = new_partition();
        p.replica_difference = 0;
        let load = LoadTable::new();
        let config = PlbConfig::for_tests();

        let movements = PlacementPhase::run(&nodes, &sts, &[], &[svc], &[p], &load, &config);
        assert_eq!(movements.len(), 2);
        assert!(movements.iter().all(|m| matches!(m.action, Action::AddInstance { .. })));
    }

    fn ready_replica(node: NodeId, role: ReplicaRole) -> Replica {
        Replica {
            node: NodeInstance::new(node, 1),
            role,
            state: ReplicaState::Ready,
            up: true,
            flags: ReplicaFlags::default(),
        }
    }

    #[test]
    fn negative_replica_difference_drops_a_secondary_before_the_primary() {
        let nodes = vec![node(1, 100), node(2, 100)];
        let sts = vec![ServiceType {
            name: "T0".into(),
            block_list: HashSet::new(),
            version: 1,
        }];
        let svc = stateful_service();
        let mut p = new_partition();
        p.replica_difference = -1;
        p.replicas = vec![ready_replica(1, ReplicaRole::Primary), ready_replica(2, ReplicaRole::Secondary)];
        let load = LoadTable::new();
        let config = PlbConfig::for_tests();

        let movements = PlacementPhase::run(&nodes, &sts, &[], &[svc], &[p], &load, &config);
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].action, Action::DropSecondary { node: 2 });
    }

    #[test]
    fn prevent_transient_overcommit_spreads_multiple_new_replicas_across_distinct_nodes() {
        let nodes = vec![node(0, 100), node(1, 100), node(2, 100)];
        let sts = vec![ServiceType { name: "T0".into(), block_list: HashSet::new(), version: 1 }];
        let mut svc = stateful_service();
        svc.target_replica_set_size = 3;
        let mut p = new_partition();
        p.replica_difference = 2;
        p.replicas = vec![ready_replica(0, ReplicaRole::Primary)];
        let load = LoadTable::new();
        let config = PlbConfig::for_tests();
        assert!(config.prevent_transient_overcommit);

        let movements = PlacementPhase::run(&nodes, &sts, &[], &[svc], &[p], &load, &config);
        assert_eq!(movements.len(), 2);
        let targets: HashSet<NodeId> = movements
            .iter()
            .filter_map(|m| match m.action {
                Action::AddSecondary { node } => Some(node),
                _ => None,
            })
            .collect();
        assert_eq!(targets.len(), 2, "{movements:?}");
    }

    #[test]
    fn disabling_transient_overcommit_guard_can_target_the_same_node_twice() {
        let nodes = vec![node(0, 100), node(1, 100), node(2, 100)];
        let sts = vec![ServiceType { name: "T0".into(), block_list: HashSet::new(), version: 1 }];
        let svc = stateful_service();
        let mut p = new_partition();
        p.replica_difference = 2;
        p.replicas = vec![ready_replica(0, ReplicaRole::Primary)];
        let load = LoadTable::new();
        let mut config = PlbConfig::for_tests();
        config.prevent_transient_overcommit = false;

        let movements = PlacementPhase::run(&nodes, &sts, &[], &[svc], &[p], &load, &config);
        assert_eq!(movements.len(), 2);
        assert!(movements.iter().all(|m| matches!(m.action, Action::AddSecondary { node: 1 })));
    }

    #[test]
    fn flagged_replica_is_dropped_regardless_of_replica_difference() {
        let nodes = vec![node(1, 100), node(2, 100)];
        let sts = vec![ServiceType {
            name: "T0".into(),
            block_list: HashSet::new(),
            version: 1,
        }];
        let svc = stateful_service();
        let mut p = new_partition();
        p.replica_difference = 0;
        let mut flagged = ready_replica(2, ReplicaRole::Secondary);
        flagged.flags.to_be_dropped_by_plb = true;
        p.replicas = vec![ready_replica(1, ReplicaRole::Primary), flagged];
        let load = LoadTable::new();
        let config = PlbConfig::for_tests();

        let movements = PlacementPhase::run(&nodes, &sts, &[], &[svc], &[p], &load, &config);
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].action, Action::DropSecondary { node: 2 });
    }
}
