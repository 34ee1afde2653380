//! Load balancing phase benchmarks: simulated annealing convergence
//! cost as cluster size and imbalance grow.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fabric_plb::balancing::BalancingPhase;
use fabric_plb::config::PlbConfig;
use fabric_plb::entity::{
    DeactivationIntent, DeactivationStatus, DomainPath, MoveCost, Node, NodeInstance, Partition,
    PartitionFlags, Replica, ReplicaFlags, ReplicaRole, ReplicaState, Service, ServiceMetric,
    ServiceType,
};
use fabric_plb::load::LoadTable;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

fn node(id: u64, capacity: i64) -> Node {
    let mut capacities = HashMap::new();
    capacities.insert("CPU".to_string(), capacity);
    Node {
        instance: NodeInstance::new(id, 1),
        up: true,
        fault_domain: DomainPath::parse(&format!("dc0/rack{}", id % 8)),
        upgrade_domain: format!("UD{}", id % 5),
        properties: HashMap::new(),
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
        target_replica_set_size: 1,
        partition_count: 1,
        placement_constraint: None,
        affinity_parent: None,
        aligned_affinity: true,
        metrics: vec![ServiceMetric {
            name: "CPU".into(),
            weight: 1.0,
            primary_default: 10,
            secondary_default: 0,
            is_defrag_metric: false,
        }],
        default_move_cost: MoveCost::Low,
        service_package: None,
        scaling_policies: vec![],
        on_every_node: false,
        version: 1,
    }
}

/// Pile every partition's lone primary on node 0, the worst-case
/// imbalance the annealing loop has to unwind.
fn skewed_partitions(count: usize) -> Vec<Partition> {
    (0..count)
        .map(|_| Partition {
            id: Uuid::new_v4(),
            service: "S0".into(),
            version: 1,
            replica_difference: 0,
            replicas: vec![Replica {
                node: NodeInstance::new(0, 1),
                role: ReplicaRole::Primary,
                state: ReplicaState::Ready,
                up: true,
                flags: ReplicaFlags::default(),
            }],
            flags: PartitionFlags::default(),
            deleted: false,
        })
        .collect()
}

fn bench_convergence_by_cluster_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("balancing_by_cluster_size");
    let sts = vec![ServiceType {
        name: "T0".into(),
        block_list: HashSet::new(),
        version: 1,
    }];
    let svc = service();
    let load = LoadTable::new();
    let mut config = PlbConfig::for_tests();
    config.max_simulated_annealing_iterations = 500;
    let partitions = skewed_partitions(100);

    for node_count in [10u64, 50, 200] {
        let nodes: Vec<Node> = (0..node_count).map(|id| node(id, 10_000)).collect();
        group.throughput(Throughput::Elements(node_count));
        group.bench_with_input(BenchmarkId::from_parameter(node_count), &node_count, |b, _| {
            b.iter(|| {
                black_box(BalancingPhase::run(&nodes, &sts, &[], std::slice::from_ref(&svc), &partitions, &load, &config))
            });
        });
    }

    group.finish();
}

fn bench_convergence_by_iteration_budget(c: &mut Criterion) {
    let mut group = c.benchmark_group("balancing_by_iteration_budget");
    let sts = vec![ServiceType {
        name: "T0".into(),
        block_list: HashSet::new(),
        version: 1,
    }];
    let svc = service();
    let nodes: Vec<Node> = (0..50u64).map(|id| node(id, 10_000)).collect();
    let load = LoadTable::new();
    let partitions = skewed_partitions(100);

    for iterations in [100u32, 500, 2000] {
        let mut config = PlbConfig::for_tests();
        config.max_simulated_annealing_iterations = iterations;
        group.throughput(Throughput::Elements(iterations as u64));
        group.bench_with_input(BenchmarkId::from_parameter(iterations), &iterations, |b, _| {
            b.iter(|| {
                black_box(BalancingPhase::run(&nodes, &sts, &[], std::slice::from_ref(&svc), &partitions, &load, &config))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_convergence_by_cluster_size, bench_convergence_by_iteration_budget);
criterion_main!(benches);
