//! Upgrade coordinator: singleton-replica upgrade placement, scaleout
//! relaxation, general upgrade moves, and preferred-location
//! restoration.
//!
//! Each singleton-replica rule builds an atomic plan across an
//! affinity or scaleout-1 closure: either every leg of the plan is
//! feasible and all of it lands, or none of it does.

use crate::config::PlbConfig;
use crate::constraints::{self, ConstraintContext};
use crate::entity::{Application, Node, Partition, ReplicaFlags, ReplicaRole, Service, ServiceType};
use crate::load::LoadTable;
use crate::movement::{Action, PartitionMovement};
use crate::NodeId;
use std::collections::{HashMap, HashSet};

/// Cluster-wide upgrade status, set by `UpdateClusterUpgrade`.
#[derive(Debug, Clone, Default)]
pub struct ClusterUpgradeStatus {
    /// Whether a cluster upgrade is currently in progress.
    pub in_progress: bool,
    /// Upgrade domains that have completed so far.
    pub completed_upgrade_domains: HashSet<String>,
}

/// The upgrade coordinator.
pub struct UpgradeCoordinator;

impl UpgradeCoordinator {
    /// Run every upgrade-aware rule and return the movements they
    /// produce. Order matters: singleton-replica placements run
    /// first, then general upgrade moves, then preferred-location
    /// restoration, so a partition touched by an earlier rule isn't
    /// double-proposed by a later one in the same pass.
    pub fn run(
        nodes: &[Node],
        service_types: &[ServiceType],
        applications: &[Application],
        services: &[Service],
        partitions: &[Partition],
        load_table: &LoadTable,
        config: &PlbConfig,
        cluster_upgrade: &ClusterUpgradeStatus,
    ) -> Vec<PartitionMovement> {
        let mut touched: HashSet<crate::PartitionId> = HashSet::new();
        let mut movements = Vec::new();

        let relax_scaleout_for_app = Self::apps_under_scaleout_relaxation(applications, partitions, config);
        let ctx = ConstraintContext {
            nodes,
            service_types,
            applications,
            partitions,
            load_table,
            relax_affinity: config.relax_affinity_constraint_during_upgrade && cluster_upgrade.in_progress,
            relax_scaleout_for_app: relax_scaleout_for_app.clone(),
            relax_fault_upgrade_domain: config.relax_fault_domain_constraint_during_upgrade && cluster_upgrade.in_progress,
        };

        if config.check_affinity_for_upgrade_placement {
            for m in Self::singleton_affinity_upgrade(&ctx, nodes, services, partitions, cluster_upgrade) {
                if touched.insert(m.partition) {
                    movements.push(m);
                }
            }
        }

        if config.relax_scaleout_constraint_during_upgrade {
            for m in Self::singleton_scaleout_one_upgrade(&ctx, nodes, services, partitions, &relax_scaleout_for_app) {
                if touched.insert(m.partition) {
                    movements.push(m);
                }
            }
        }

        if config.is_singleton_replica_move_allowed_during_upgrade_entry {
            for m in Self::general_upgrade_moves(nodes, services, partitions) {
                if touched.insert(m.partition) {
                    movements.push(m);
                }
            }
        }

        if !cluster_upgrade.in_progress {
            for m in Self::preferred_location_restoration(&ctx, nodes, services, partitions) {
                if touched.insert(m.partition) {
                    movements.push(m);
                }
            }
        }

        movements
    }

    /// Applications currently eligible for the scaleout-1 relaxation:
    /// `max_node_count == 1` and at least one partition has an
    /// upgrading replica with a positive replica difference.
    fn apps_under_scaleout_relaxation(applications: &[Application], partitions: &[Partition], config: &PlbConfig) -> HashSet<String> {
        if !config.relax_scaleout_constraint_during_upgrade {
            return HashSet::new();
        }
        applications
            .iter()
            .filter(|a| a.max_node_count == 1)
            .filter(|a| {
                partitions
                    .iter()
                    .any(|p| p.flags.upgrading && p.replica_difference > 0)
            })
            .map(|a| a.name.clone())
            .collect()
    }

    /// Singleton-replica upgrade for an affinity closure: when a
    /// replica in the closure is marked upgrading with a +1 replica
    /// difference, place it and move the zero-diff affinity partners
    /// onto the same node atomically; if any leg of the plan fails,
    /// nothing in the closure moves.
    fn singleton_affinity_upgrade(
        ctx: &ConstraintContext,
        nodes: &[Node],
        services: &[Service],
        partitions: &[Partition],
        cluster_upgrade: &ClusterUpgradeStatus,
    ) -> Vec<PartitionMovement> {
        let mut out = Vec::new();
        for partition in partitions.iter().filter(|p| p.flags.upgrading && p.replica_difference > 0) {
            let Some(service) = services.iter().find(|s| s.name == partition.service) else {
                continue;
            };
            let Some(parent_name) = &service.affinity_parent else {
                continue;
            };
            let partners: Vec<&Partition> = partitions.iter().filter(|p| &p.service == parent_name).collect();

            let Some(target) = Self::best_upgrade_target(ctx, nodes, service, partition, cluster_upgrade) else {
                continue;
            };

            let mut plan = vec![PartitionMovement::new(
                partition.id,
                service.name.clone(),
                Action::AddSecondary { node: target },
            )];
            let mut feasible = true;
            for partner in &partners {
                if partner.hosting_node_ids().contains(&target) {
                    continue;
                }
                let Some(partner_service) = services.iter().find(|s| s.name == partner.service) else {
                    feasible = false;
                    break;
                };
                // A partner already placed elsewhere is moved to stay
                // co-located with the parent's new home; only a
                // partner with no live replica yet is a genuine add.
                let current_replica = partner.live_replicas().find(|r| r.role != ReplicaRole::Dropped);
                let check_role = current_replica.map(|r| r.role).unwrap_or(if partner_service.is_stateful {
                    ReplicaRole::Primary
                } else {
                    ReplicaRole::None
                });
                let verdicts = constraints::check_all(ctx, nodes.iter().find(|n| n.instance.id == target).unwrap(), partner_service, partner, check_role);
                if constraints::highest_violation(&verdicts).is_some() {
                    feasible = false;
                    break;
                }
                let action = match current_replica {
                    Some(r) => match r.role {
                        ReplicaRole::Primary => Action::MovePrimary { from: r.node.id, to: target },
                        ReplicaRole::None => Action::MoveInstance { from: r.node.id, to: target },
                        _ => Action::MoveSecondary { from: r.node.id, to: target },
                    },
                    None if partner_service.is_stateful => Action::AddPrimary { node: target },
                    None => Action::AddInstance { node: target },
                };
                plan.push(PartitionMovement::new(partner.id, partner.service.clone(), action));
            }

            if feasible {
                out.extend(plan);
            }
        }
        out
    }

    /// The same atomic singleton-replica rule, applied when an
    /// application's scaleout is relaxed from 1 to 2 during upgrade.
    fn singleton_scaleout_one_upgrade(
        ctx: &ConstraintContext,
        nodes: &[Node],
        services: &[Service],
        partitions: &[Partition],
        relaxed_apps: &HashSet<String>,
    ) -> Vec<PartitionMovement> {
        let mut out = Vec::new();
        for partition in partitions.iter().filter(|p| p.flags.upgrading && p.replica_difference > 0) {
            let Some(service) = services.iter().find(|s| s.name == partition.service) else {
                continue;
            };
            let Some(app_name) = &service.application else { continue };
            if !relaxed_apps.contains(app_name) {
                continue;
            }
            if let Some(target) = Self::best_upgrade_target(ctx, nodes, service, partition, &ClusterUpgradeStatus::default()) {
                out.push(PartitionMovement::new(partition.id, service.name.clone(), Action::AddSecondary { node: target }));
            }
        }
        out
    }

    /// Candidate node ranking preferring already-completed upgrade
    /// domains, then the shared placement ranking criteria.
    fn best_upgrade_target(ctx: &ConstraintContext, nodes: &[Node], service: &Service, partition: &Partition, cluster_upgrade: &ClusterUpgradeStatus) -> Option<NodeId> {
        let hosting = partition.hosting_node_ids();
        let mut candidates: Vec<&Node> = nodes.iter().filter(|n| n.usable_for_placement() && !hosting.contains(&n.instance.id)).collect();

        candidates.sort_by_key(|n| {
            let completed_ud = cluster_upgrade.completed_upgrade_domains.contains(&n.upgrade_domain);
            (!completed_ud, n.instance.id)
        });

        candidates
            .into_iter()
            .find(|n| {
                let verdicts = constraints::check_all(ctx, n, service, partition, ReplicaRole::Secondary);
                constraints::highest_violation(&verdicts).is_none()
            })
            .map(|n| n.instance.id)
    }

    /// Swap a `PrimaryToBeSwappedOut` primary with a viable secondary,
    /// and void stale in-flight moves whose destination is no longer
    /// viable.
    fn general_upgrade_moves(nodes: &[Node], services: &[Service], partitions: &[Partition]) -> Vec<PartitionMovement> {
        let mut out = Vec::new();
        let node_by_id: HashMap<NodeId, &Node> = nodes.iter().map(|n| (n.instance.id, n)).collect();

        for partition in partitions {
            let Some(service) = services.iter().find(|s| s.name == partition.service) else {
                continue;
            };
            if let Some(primary) = partition
                .live_replicas()
                .find(|r| r.role == ReplicaRole::Primary && r.flags.primary_to_be_swapped_out)
            {
                if let Some(secondary) = Self::viable_swap_secondary(partition, &node_by_id) {
                    out.push(PartitionMovement::new(
                        partition.id,
                        service.name.clone(),
                        Action::SwapPrimarySecondary {
                            primary: primary.node.id,
                            secondary,
                        },
                    ));
                }
            }

            for replica in partition.live_replicas() {
                if replica.flags.move_in_progress && Self::destination_no_longer_viable(replica, &node_by_id) {
                    out.push(PartitionMovement::new(
                        partition.id,
                        service.name.clone(),
                        Action::RequestedPlacementNotPossible { node: replica.node.id },
                    ));
                }
            }
        }
        out
    }

    fn viable_swap_secondary(partition: &Partition, node_by_id: &HashMap<NodeId, &Node>) -> Option<NodeId> {
        partition
            .live_replicas()
            .filter(|r| r.role == ReplicaRole::Secondary && r.is_movable())
            .find(|r| node_by_id.get(&r.node.id).map(|n| n.usable_for_placement()).unwrap_or(false))
            .map(|r| r.node.id)
    }

    fn destination_no_longer_viable(replica: &crate::entity::Replica, node_by_id: &HashMap<NodeId, &Node>) -> bool {
        !node_by_id
            .get(&replica.node.id)
            .map(|n| n.usable_for_placement())
            .unwrap_or(false)
    }

    /// Pull replicas carrying `PreferredPrimaryLocation` or
    /// `PreferredReplicaLocation` back to that node, subject to every
    /// constraint, once the cluster upgrade that displaced them has
    /// completed.
    fn preferred_location_restoration(ctx: &ConstraintContext, nodes: &[Node], services: &[Service], partitions: &[Partition]) -> Vec<PartitionMovement> {
        let mut out = Vec::new();
        for partition in partitions {
            let Some(service) = services.iter().find(|s| s.name == partition.service) else {
                continue;
            };
            for replica in partition.live_replicas() {
                let preferred = Self::preferred_node(&replica.flags);
                let Some(preferred) = preferred else { continue };
                if replica.node.id == preferred {
                    continue;
                }
                let Some(target) = nodes.iter().find(|n| n.instance.id == preferred) else {
                    continue;
                };
                let role = if replica.flags.preferred_primary_location.is_some() {
                    ReplicaRole::Primary
                } else {
                    ReplicaRole::Secondary
                };
                let verdicts = constraints::check_all(ctx, target, service, partition, role);
                if constraints::highest_violation(&verdicts).is_some() {
                    continue;
                }
                let action = if role == ReplicaRole::Primary {
                    Action::MovePrimary { from: replica.node.id, to: preferred }
                } else {
                    Action::MoveSecondary { from: replica.node.id, to: preferred }
                };
                out.push(PartitionMovement::new(partition.id, service.name.clone(), action));
            }
        }
        out
    }

    fn preferred_node(flags: &ReplicaFlags) -> Option<NodeId> {
        flags.preferred_primary_location.or(flags.preferred_replica_location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{
        DeactivationIntent, DeactivationStatus, DomainPath, MoveCost, NodeInstance, PartitionFlags, Replica,
        ReplicaState, ServiceMetric,
    };
    use std::collections::HashMap as StdHashMap;

    fn node(id: NodeId, ud: &str) -> Node {
        let mut capacities = StdHashMap::new();
        capacities.insert("CPU".to_string(), 1000);
        Node {
            instance: NodeInstance::new(id, 1),
            up: true,
            fault_domain: DomainPath::parse(&format!("dc0/rack{id}")),
            upgrade_domain: ud.into(),
            properties: StdHashMap::new(),
            capacities,
            deactivation_intent: DeactivationIntent::None,
            deactivation_status: DeactivationStatus::None,
            version: 1,
        }
    }

    fn service() -> Service {
        Service {
            name: "S0".into(),
            service_type: "T0".into(),
            application: None,
            is_stateful: true,
            has_persisted_state: false,
            target_replica_set_size: 2,
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

    fn replica(node: NodeId, role: ReplicaRole, flags: ReplicaFlags) -> Replica {
        Replica {
            node: NodeInstance::new(node, 1),
            role,
            state: ReplicaState::Ready,
            up: true,
            flags,
        }
    }

    #[test]
    fn primary_to_be_swapped_out_swaps_with_viable_secondary() {
        let nodes = vec![node(0, "UD0"), node(1, "UD0")];
        let svc = service();
        let mut primary_flags = ReplicaFlags::default();
        primary_flags.primary_to_be_swapped_out = true;
        let p = Partition {
            id: crate::PartitionId::from_u128(1),
            service: "S0".into(),
            version: 1,
            replica_difference: 0,
            replicas: vec![
                replica(0, ReplicaRole::Primary, primary_flags),
                replica(1, ReplicaRole::Secondary, ReplicaFlags::default()),
            ],
            flags: PartitionFlags::default(),
            deleted: false,
        };

        let movements = UpgradeCoordinator::general_upgrade_moves(&nodes, &[svc], &[p]);
        assert_eq!(movements.len(), 1);
        assert!(matches!(
            movements[0].action,
            Action::SwapPrimarySecondary { primary: 0, secondary: 1 }
        ));
    }

    #[test]
    fn move_in_progress_to_dead_node_is_voided() {
        let mut dead = node(1, "UD0");
        dead.up = false;
        let nodes = vec![node(0, "UD0"), dead];
        let svc = service();
        let mut flags = ReplicaFlags::default();
        flags.move_in_progress = true;
        let p = Partition {
            id: crate::PartitionId::from_u128(1),
            service: "S0".into(),
            version: 1,
            replica_difference: 0,
            replicas: vec![
                replica(0, ReplicaRole::Primary, ReplicaFlags::default()),
                replica(1, ReplicaRole::Secondary, flags),
            ],
            flags: PartitionFlags::default(),
            deleted: false,
        };

        let movements = UpgradeCoordinator::general_upgrade_moves(&nodes, &[svc], &[p]);
        assert!(movements.iter().any(|m| matches!(m.action, Action::RequestedPlacementNotPossible { node: 1 })));
    }

    #[test]
    fn preferred_location_pulls_replica_back_after_upgrade() {
        let nodes = vec![node(0, "UD0"), node(1, "UD0")];
        let svc = service();
        let mut flags = ReplicaFlags::default();
        flags.preferred_primary_location = Some(1);
        let p = Partition {
            id: crate::PartitionId::from_u128(1),
            service: "S0".into(),
            version: 1,
            replica_difference: 0,
            replicas: vec![replica(0, ReplicaRole::Primary, flags)],
            flags: PartitionFlags::default(),
            deleted: false,
        };
        let sts = vec![ServiceType { name: "T0".into(), block_list: HashSet::new(), version: 1 }];
        let load = LoadTable::new();
        let ctx = ConstraintContext {
            nodes: &nodes,
            service_types: &sts,
            applications: &[],
            partitions: std::slice::from_ref(&p),
            load_table: &load,
            relax_affinity: false,
            relax_scaleout_for_app: HashSet::new(),
            relax_fault_upgrade_domain: false,
        };

        let movements = UpgradeCoordinator::preferred_location_restoration(&ctx, &nodes, &[svc], std::slice::from_ref(&p));
        assert_eq!(movements.len(), 1);
        assert!(matches!(movements[0].action, Action::MovePrimary { from: 0, to: 1 }));
    }

    #[test]
    fn scaleout_one_relaxation_only_applies_to_flagged_apps() {
        let config = PlbConfig::for_tests();
        let app = Application {
            name: "A".into(),
            min_node_count: 0,
            max_node_count: 1,
            capacities: StdHashMap::new(),
            upgrade_in_progress: true,
            completed_upgrade_domains: HashSet::new(),
            service_packages: vec![],
            version: 1,
        };
        let p = Partition {
            id: crate::PartitionId::from_u128(1),
            service: "S0".into(),
            version: 1,
            replica_difference: 1,
            replicas: vec![],
            flags: PartitionFlags { upgrading: true, ..PartitionFlags::default() },
            deleted: false,
        };
        let mut relax_config = config.clone();
        relax_config.relax_scaleout_constraint_during_upgrade = true;
        let relaxed = UpgradeCoordinator::apps_under_scaleout_relaxation(&[app], std::slice::from_ref(&p), &relax_config);
        assert!(relaxed.contains("A"));

        let not_relaxed = UpgradeCoordinator::apps_under_scaleout_relaxation(&[], std::slice::from_ref(&p), &config);
        assert!(not_relaxed.is_empty());
    }

    #[test]
    fn singleton_affinity_partner_already_placed_elsewhere_moves_instead_of_adding() {
        let nodes = vec![node(0, "UD0"), node(5, "UD1")];

        let mut parent = service();
        parent.name = "A".into();
        parent.target_replica_set_size = 1;

        let mut child = service();
        child.name = "B".into();
        child.target_replica_set_size = 1;
        child.affinity_parent = Some("A".into());
        child.aligned_affinity = true;

        let pa0 = Partition {
            id: crate::PartitionId::from_u128(10),
            service: "A".into(),
            version: 1,
            replica_difference: 0,
            replicas: vec![replica(0, ReplicaRole::Primary, ReplicaFlags::default())],
            flags: PartitionFlags::default(),
            deleted: false,
        };
        let pa1 = Partition {
            id: crate::PartitionId::from_u128(11),
            service: "A".into(),
            version: 1,
            replica_difference: 0,
            replicas: vec![replica(5, ReplicaRole::Primary, ReplicaFlags::default())],
            flags: PartitionFlags::default(),
            deleted: false,
        };
        let pb = Partition {
            id: crate::PartitionId::from_u128(20),
            service: "B".into(),
            version: 1,
            replica_difference: 1,
            replicas: vec![],
            flags: PartitionFlags { upgrading: true, ..PartitionFlags::default() },
            deleted: false,
        };

        let partitions = vec![pa0, pa1, pb];
        let sts = vec![ServiceType { name: "T0".into(), block_list: HashSet::new(), version: 1 }];
        let load = LoadTable::new();
        let ctx = ConstraintContext {
            nodes: &nodes,
            service_types: &sts,
            applications: &[],
            partitions: &partitions,
            load_table: &load,
            relax_affinity: false,
            relax_scaleout_for_app: HashSet::new(),
            relax_fault_upgrade_domain: false,
        };

        let movements = UpgradeCoordinator::singleton_affinity_upgrade(
            &ctx,
            &nodes,
            &[parent, child],
            &partitions,
            &ClusterUpgradeStatus::default(),
        );

        let child_id = crate::PartitionId::from_u128(20);
        let parent_partner_id = crate::PartitionId::from_u128(11);

        assert!(movements.iter().any(|m| m.partition == child_id && matches!(m.action, Action::AddSecondary { node: 0 })));
        assert!(movements
            .iter()
            .any(|m| m.partition == parent_partner_id && matches!(m.action, Action::MovePrimary { from: 5, to: 0 })));
        assert!(!movements
            .iter()
            .any(|m| m.partition == parent_partner_id && matches!(m.action, Action::AddSecondary { .. })));
    }
}
