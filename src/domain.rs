//! Service domain partitioner.
//!
//! Every phase (placement, constraint check, balancing) operates on
//! one *domain* at a time: the set of services that share a metric
//! name or an affinity edge, computed as the connected components of
//! a graph whose nodes are services and whose edges are "shares a
//! metric with" and "is an affinity parent/child of". Two services
//! with nothing in common can be decided independently and in
//! parallel; two services that share a metric must be decided
//! together, since a placement decision for one changes the other's
//! remaining capacity.

use crate::entity::Service;
use crate::ServiceName;
use std::collections::{HashMap, HashSet};

/// One connected component of the service graph: every service in it
/// must be decided together by a single phase invocation.
#[derive(Debug, Clone, Default)]
pub struct ServiceDomain {
    /// Services in this domain, in no particular order.
    pub services: Vec<ServiceName>,
}

/// Partitions a service list into independent domains using union-find
/// over the "shares a metric" and "affinity-linked" edge predicates.
pub struct DomainPartitioner;

impl DomainPartitioner {
    /// Compute domains for `services`. Every input service appears in
    /// exactly one output domain.
    pub fn partition(services: &[Service]) -> Vec<ServiceDomain> {
        let index: HashMap<&str, usize> = services
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut uf = UnionFind::new(services.len());

        // Edge: two services share a metric name.
        let mut by_metric: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, s) in services.iter().enumerate() {
            for metric in s.metric_names() {
                by_metric.entry(metric).or_default().push(i);
            }
        }
        for group in by_metric.values() {
            for window in group.windows(2) {
                uf.union(window[0], window[1]);
            }
        }

        // Edge: affinity parent/child.
        for (i, s) in services.iter().enumerate() {
            if let Some(parent) = &s.affinity_parent {
                if let Some(&j) = index.get(parent.as_str()) {
                    uf.union(i, j);
                }
            }
        }

        let mut groups: HashMap<usize, Vec<ServiceName>> = HashMap::new();
        for (i, s) in services.iter().enumerate() {
            groups.entry(uf.find(i)).or_default().push(s.name.clone());
        }

        groups
            .into_values()
            .map(|services| ServiceDomain { services })
            .collect()
    }

    /// Every metric name reachable within `domain` from `services`.
    pub fn domain_metrics(domain: &ServiceDomain, services: &[Service]) -> HashSet<String> {
        let names: HashSet<&str> = domain.services.iter().map(|s| s.as_str()).collect();
        services
            .iter()
            .filter(|s| names.contains(s.name.as_str()))
            .flat_map(|s| s.metric_names().map(str::to_string))
            .collect()
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{MoveCost, ServiceMetric};

    fn svc(name: &str, metric: &str, affinity_parent: Option<&str>) -> Service {
        Service {
            name: name.into(),
            service_type: "T".into(),
            application: None,
            is_stateful: true,
            has_persisted_state: false,
            target_replica_set_size: 1,
            partition_count: 1,
            placement_constraint: None,
            affinity_parent: affinity_parent.map(String::from),
            aligned_affinity: true,
            metrics: vec![ServiceMetric {
                name: metric.into(),
                weight: 1.0,
                primary_default: 0,
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

    #[test]
    fn unrelated_services_land_in_separate_domains() {
        let services = vec![svc("A", "CPU", None), svc("B", "Memory", None)];
        let domains = DomainPartitioner::partition(&services);
        assert_eq!(domains.len(), 2);
    }

    #[test]
    fn shared_metric_merges_domains() {
        let services = vec![svc("A", "CPU", None), svc("B", "CPU", None), svc("C", "Memory", None)];
        let domains = DomainPartitioner::partition(&services);
        assert_eq!(domains.len(), 2);
        let merged = domains.iter().find(|d| d.services.len() == 2).unwrap();
        assert!(merged.services.contains(&"A".to_string()));
        assert!(merged.services.contains(&"B".to_string()));
    }

    #[test]
    fn affinity_edge_merges_domains_despite_disjoint_metrics() {
        let services = vec![svc("Parent", "CPU", None), svc("Child", "Memory", Some("Parent"))];
        let domains = DomainPartitioner::partition(&services);
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].services.len(), 2);
    }

    #[test]
    fn transitive_affinity_chain_is_one_domain() {
        let services = vec![
            svc("A", "CPU", None),
            svc("B", "Memory", Some("A")),
            svc("C", "Disk", Some("B")),
        ];
        let domains = DomainPartitioner::partition(&services);
        assert_eq!(domains.len(), 1);
    }

    #[test]
    fn domain_metrics_collects_every_metric_in_the_component() {
        let services = vec![svc("A", "CPU", None), svc("B", "CPU", None)];
        let domains = DomainPartitioner::partition(&services);
        let metrics = DomainPartitioner::domain_metrics(&domains[0], &services);
        assert_eq!(metrics.len(), 1);
        assert!(metrics.contains("CPU"));
    }
}
