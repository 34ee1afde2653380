//! Load balancing phase: simulated annealing over a domain's scored
//! cluster state.
//!
//! The convergence target is a low-variance load distribution; the
//! lag tolerance below which no correction is attempted is
//! [`crate::config::PlbConfig::balancing_threshold`].

use crate::config::PlbConfig;
use crate::constraints::{self, ConstraintContext};
use crate::entity::{Application, Node, Partition, ReplicaRole, Service, ServiceType};
use crate::load::LoadTable;
use crate::movement::{Action, PartitionMovement};
use crate::NodeId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};

/// The load balancing phase.
pub struct BalancingPhase;

impl BalancingPhase {
    /// Run simulated annealing for one service domain and return the
    /// sequence of moves accepted during the search.
    pub fn run(
        nodes: &[Node],
        service_types: &[ServiceType],
        applications: &[Application],
        services: &[Service],
        partitions: &[Partition],
        load_table: &LoadTable,
        config: &PlbConfig,
    ) -> Vec<PartitionMovement> {
        let metrics = Self::domain_metrics(services);
        if metrics.is_empty() {
            return Vec::new();
        }

        let per_metric_scores: Vec<f64> = metrics
            .iter()
            .map(|m| Self::metric_score(nodes, services, partitions, load_table, m))
            .collect();
        if per_metric_scores.iter().all(|&s| s < config.balancing_threshold) {
            tracing::debug!("cluster already balanced below threshold; skipping");
            return Vec::new();
        }

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

        let mut working: Vec<Partition> = partitions.to_vec();
        let mut score = Self::cluster_score(nodes, services, &working, load_table, &metrics);
        let mut movements = Vec::new();
        let mut rng = StdRng::seed_from_u64(config.annealing_seed);

        for iteration in 0..config.max_simulated_annealing_iterations {
            let Some((p_idx, r_idx, target)) = Self::random_move(&mut rng, nodes, &working) else {
                continue;
            };
            let partition = &working[p_idx];
            let Some(service) = services.iter().find(|s| s.name == partition.service) else {
                continue;
            };
            let replica_role = partition.replicas[r_idx].role;
            let from_node = partition.replicas[r_idx].node.id;

            let Some(target_node) = nodes.iter().find(|n| n.instance.id == target) else {
                continue;
            };
            let verdicts = constraints::check_all(&ctx, target_node, service, partition, replica_role);
            if constraints::highest_violation(&verdicts).is_some() {
                continue;
            }

            let mut candidate = working.clone();
            candidate[p_idx].replicas[r_idx].node.id = target;
            let candidate_score = Self::cluster_score(nodes, services, &candidate, load_table, &metrics);

            let temperature = Self::temperature(iteration, config.max_simulated_annealing_iterations);
            let accept = candidate_score <= score
                || rng.gen::<f64>() < ((score - candidate_score) / temperature.max(1e-9)).exp();

            if accept {
                let action = if replica_role == ReplicaRole::Primary {
                    Action::MovePrimary { from: from_node, to: target }
                } else {
                    Action::MoveSecondary { from: from_node, to: target }
                };
                movements.push(PartitionMovement::new(partition.id, service.name.clone(), action));
                working = candidate;
                score = candidate_score;
            }
        }

        movements
    }

    fn domain_metrics(services: &[Service]) -> Vec<(String, f64, bool)> {
        let mut seen = HashMap::new();
        for service in services {
            for m in &service.metrics {
                seen.entry(m.name.clone()).or_insert((m.weight, m.is_defrag_metric));
            }
        }
        seen.into_iter().map(|(name, (weight, defrag))| (name, weight, defrag)).collect()
    }

    fn metric_score(nodes: &[Node], services: &[Service], partitions: &[Partition], load_table: &LoadTable, metric: &(String, f64, bool)) -> f64 {
        let loads = Self::node_loads(nodes, services, partitions, load_table, &metric.0);
        if metric.2 {
            Self::defrag_component(&loads)
        } else {
            Self::stddev(&loads)
        }
    }

    fn cluster_score(nodes: &[Node], services: &[Service], partitions: &[Partition], load_table: &LoadTable, metrics: &[(String, f64, bool)]) -> f64 {
        metrics.iter().map(|m| m.1 * Self::metric_score(nodes, services, partitions, load_table, m)).sum()
    }

    fn node_loads(nodes: &[Node], services: &[Service], partitions: &[Partition], load_table: &LoadTable, metric: &str) -> Vec<i64> {
        let mut by_node: HashMap<NodeId, i64> = nodes.iter().map(|n| (n.instance.id, 0)).collect();
        for partition in partitions {
            let Some(service) = services.iter().find(|s| s.name == partition.service) else {
                continue;
            };
            if !service.metric_names().any(|m| m == metric) {
                continue;
            }
            for replica in partition.live_replicas().filter(|r| r.counts_toward_capacity()) {
                let load = load_table.replica_load(partition.id, service, replica, metric);
                *by_node.entry(replica.node.id).or_insert(0) += load;
            }
        }
        by_node.into_values().collect()
    }

    fn stddev(values: &[i64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mean = values.iter().sum::<i64>() as f64 / values.len() as f64;
        let variance = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / values.len() as f64;
        variance.sqrt()
    }

    /// Fewer distinct nodes carrying load scores better for a defrag
    /// metric: concentration is rewarded, spread is penalized.
    fn defrag_component(values: &[i64]) -> f64 {
        values.iter().filter(|&&v| v > 0).count() as f64
    }

    fn temperature(iteration: u32, max_iterations: u32) -> f64 {
        if max_iterations == 0 {
            return 1e-9;
        }
        let progress = iteration as f64 / max_iterations as f64;
        (1.0 - progress).max(1e-9)
    }

    fn random_move(rng: &mut StdRng, nodes: &[Node], partitions: &[Partition]) -> Option<(usize, usize, NodeId)> {
        let movable: Vec<(usize, usize)> = partitions
            .iter()
            .enumerate()
            .flat_map(|(pi, p)| p.replicas.iter().enumerate().filter(|(_, r)| r.is_movable()).map(move |(ri, _)| (pi, ri)))
            .collect();
        if movable.is_empty() || nodes.is_empty() {
            return None;
        }
        let (p_idx, r_idx) = movable[rng.gen_range(0..movable.len())];
        let current = partitions[p_idx].replicas[r_idx].node.id;
        let eligible: Vec<NodeId> = nodes
            .iter()
            .filter(|n| n.usable_for_placement() && n.instance.id != current)
            .map(|n| n.instance.id)
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let target = eligible[rng.gen_range(0..eligible.len())];
        Some((p_idx, r_idx, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{
        DeactivationIntent, DeactivationStatus, DomainPath, MoveCost, NodeInstance, PartitionFlags, Replica,
        ReplicaFlags, ReplicaState, ServiceMetric,
    };
    use std::collections::HashMap as StdHashMap;

    fn node(id: NodeId) -> Node {
        let mut capacities = StdHashMap::new();
        capacities.insert("CPU".to_string(), 1000);
        Node {
            instance: NodeInstance::new(id, 1),
            up: true,
            fault_domain: DomainPath::parse(&format!("dc0/rack{id}")),
            upgrade_domain: "UD0".into(),
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
            partition_count: 2,
            placement_constraint: None,
            affinity_parent: None,
            aligned_affinity: true,
            metrics: vec![ServiceMetric {
                name: "CPU".into(),
                weight: 1.0,
                primary_default: 50,
                secondary_default: 20,
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
    fn skips_when_already_balanced() {
        let nodes = vec![node(0), node(1)];
        let svc = service();
        let partitions = vec![
            Partition {
                id: crate::PartitionId::from_u128(1),
                service: "S0".into(),
                version: 1,
                replica_difference: 0,
                replicas: vec![replica(0, ReplicaRole::Primary), replica(1, ReplicaRole::Secondary)],
                flags: PartitionFlags::default(),
                deleted: false,
            },
        ];
        let sts = vec![ServiceType { name: "T0".into(), block_list: HashSet::new(), version: 1 }];
        let load = LoadTable::new();
        let mut config = PlbConfig::for_tests();
        config.balancing_threshold = 1_000_000.0;

        let movements = BalancingPhase::run(&nodes, &sts, &[], &[svc], &partitions, &load, &config);
        assert!(movements.is_empty());
    }

    #[test]
    fn imbalanced_cluster_proposes_moves_under_seeded_rng() {
        let nodes = vec![node(0), node(1), node(2)];
        let svc = service();
        let partitions = vec![
            Partition {
                id: crate::PartitionId::from_u128(1),
                service: "S0".into(),
                version: 1,
                replica_difference: 0,
                replicas: vec![replica(0, ReplicaRole::Primary), replica(0, ReplicaRole::Secondary)],
                flags: PartitionFlags::default(),
                deleted: false,
            },
            Partition {
                id: crate::PartitionId::from_u128(2),
                service: "S0".into(),
                version: 1,
                replica_difference: 0,
                replicas: vec![replica(0, ReplicaRole::Primary), replica(0, ReplicaRole::Secondary)],
                flags: PartitionFlags::default(),
                deleted: false,
            },
        ];
        let sts = vec![ServiceType { name: "T0".into(), block_list: HashSet::new(), version: 1 }];
        let load = LoadTable::new();
        let mut config = PlbConfig::for_tests();
        config.balancing_threshold = 0.0;
        config.max_simulated_annealing_iterations = 200;

        let movements = BalancingPhase::run(&nodes, &sts, &[], &[svc], &partitions, &load, &config);
        // All load starts on node 0; a correctly functioning search
        // must find at least one accepted move off of it.
        assert!(!movements.is_empty());
    }

    #[test]
    fn zero_iterations_yields_no_movement() {
        let nodes = vec![node(0), node(1)];
        let svc = service();
        let partitions = vec![Partition {
            id: crate::PartitionId::from_u128(1),
            service: "S0".into(),
            version: 1,
            replica_difference: 0,
            replicas: vec![replica(0, ReplicaRole::Primary), replica(0, ReplicaRole::Secondary)],
            flags: PartitionFlags::default(),
            deleted: false,
        }];
        let sts = vec![ServiceType { name: "T0".into(), block_list: HashSet::new(), version: 1 }];
        let load = LoadTable::new();
        let mut config = PlbConfig::for_tests();
        config.balancing_threshold = 0.0;
        config.max_simulated_annealing_iterations = 0;

        let movements = BalancingPhase::run(&nodes, &sts, &[], &[svc], &partitions, &load, &config);
        assert!(movements.is_empty());
    }
}
