//! Entity store: in-memory registry of nodes, applications, service
//! types, services, partitions and replicas.
//!
//! Every entity carries a monotonically increasing version. Upserts
//! are idempotent: a replace carrying a version no higher than the
//! one already stored is rejected with [`PlbError::AlreadyExists`]
//! without mutating anything. The store never mutates identity — only
//! content under a higher version.

use crate::{ApplicationName, MetricName, NodeId, PartitionId, PlbError, Result, ServiceName, ServiceTypeName};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// `(node id, instance number)`. A node restart bumps the instance
/// number; movements that target a stale instance are void.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInstance {
    /// Stable node identifier.
    pub id: NodeId,
    /// Instance number, bumped on every node process restart.
    pub instance: u64,
}

impl NodeInstance {
    /// Construct a node instance.
    pub fn new(id: NodeId, instance: u64) -> Self {
        Self { id, instance }
    }
}

/// Node deactivation intent, as requested by an administrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeactivationIntent {
    /// No deactivation requested.
    None,
    /// Node should be paused: no new placement, existing replicas stay.
    Pause,
    /// Node will restart; replicas may be temporarily unavailable.
    Restart,
    /// Node's data should be evacuated before deactivation.
    RemoveData,
    /// Node is being permanently removed from the cluster.
    RemoveNode,
}

/// Node deactivation status, as tracked by the engine's safety checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeactivationStatus {
    /// Not deactivating.
    None,
    /// Safety checks (e.g. quorum preservation) are in progress.
    InProgress,
    /// Safety checks passed; replicas may be evacuated.
    SafetyCheckComplete,
    /// Deactivation is complete; node hosts no replicas.
    Complete,
}

/// A cluster node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Identity and instance number.
    pub instance: NodeInstance,
    /// Whether the node is currently reachable.
    pub up: bool,
    /// Fault-domain path, e.g. `["dc0", "rack0"]`.
    pub fault_domain: DomainPath,
    /// Upgrade-domain tag, e.g. `"UD2"`.
    pub upgrade_domain: String,
    /// Arbitrary string properties used by placement constraint
    /// expressions.
    pub properties: HashMap<String, String>,
    /// Per-metric capacity. Reported even when the node is down, for
    /// query purposes.
    pub capacities: HashMap<MetricName, i64>,
    /// Administrator-requested deactivation intent.
    pub deactivation_intent: DeactivationIntent,
    /// Engine-tracked deactivation status.
    pub deactivation_status: DeactivationStatus,
    /// Monotonically increasing version.
    pub version: u64,
}

impl Node {
    /// A node is usable for new placement only when up and not
    /// deactivated beyond the in-progress level.
    pub fn usable_for_placement(&self) -> bool {
        self.up
            && matches!(
                self.deactivation_status,
                DeactivationStatus::None | DeactivationStatus::InProgress
            )
    }

    /// Capacity for `metric`, or `0` if the node declares none.
    pub fn capacity(&self, metric: &str) -> i64 {
        self.capacities.get(metric).copied().unwrap_or(0)
    }
}

/// Slash-separated fault or upgrade domain path (e.g. `"dc0/rack0"`
/// parses to `["dc0", "rack0"]`), compared by ancestor prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainPath(pub Vec<String>);

impl DomainPath {
    /// Parse a slash-separated domain path. An empty string yields an
    /// empty (root) path.
    pub fn parse(path: &str) -> Self {
        if path.is_empty() {
            DomainPath(Vec::new())
        } else {
            DomainPath(path.split('/').map(str::to_string).collect())
        }
    }

    /// `self` is an ancestor of (or equal to) `other`.
    pub fn is_ancestor_of(&self, other: &DomainPath) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }

    /// Length of the shared prefix with `other`.
    pub fn common_prefix_len(&self, other: &DomainPath) -> usize {
        self.0.iter().zip(other.0.iter()).take_while(|(a, b)| a == b).count()
    }
}

/// Block-list of nodes that a service type may never place instances
/// on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceType {
    /// Unique identity.
    pub name: ServiceTypeName,
    /// Nodes forbidden for services of this type.
    pub block_list: HashSet<NodeId>,
    /// Monotonically increasing version.
    pub version: u64,
}

/// One metric a service reports load for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetric {
    /// Metric name, shared across services that should share a
    /// domain.
    pub name: MetricName,
    /// Relative weight used when ranking placement candidates and
    /// scoring balancing state.
    pub weight: f64,
    /// Default primary-replica load when unreported.
    pub primary_default: i64,
    /// Default secondary-replica load when unreported.
    pub secondary_default: i64,
    /// When set, the balancing phase prefers packing this metric's
    /// load onto fewer nodes rather than spreading it.
    pub is_defrag_metric: bool,
}

/// Relative cost of moving a replica of a service, used to break ties
/// and to weight the balancing phase's move selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveCost {
    /// Negligible cost to move.
    Zero,
    /// Cheap to move (e.g. stateless, no persisted state).
    Low,
    /// Moderate cost.
    Medium,
    /// Expensive to move (e.g. large persisted state).
    High,
}

/// A service's auto-scaling policy, scoped to either partition count
/// or per-partition instance count. The engine stores these
/// opaquely — they drive the Failover Manager's scaling decisions,
/// not placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingPolicy {
    /// Metric the policy scales on.
    pub metric: MetricName,
    /// Load below which scale-in is considered.
    pub lower_load_threshold: f64,
    /// Load above which scale-out is considered.
    pub upper_load_threshold: f64,
    /// Minimum count (partitions or instances, policy-dependent).
    pub min_count: i64,
    /// Maximum count.
    pub max_count: i64,
}

/// A service: a template for one or more partitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Unique name.
    pub name: ServiceName,
    /// Service type identity.
    pub service_type: ServiceTypeName,
    /// Owning application, if any.
    pub application: Option<ApplicationName>,
    /// Whether replicas have a Primary/Secondary role split.
    pub is_stateful: bool,
    /// Whether replicas persist state across restarts.
    pub has_persisted_state: bool,
    /// Desired replica set size per partition.
    pub target_replica_set_size: i32,
    /// Number of partitions.
    pub partition_count: i32,
    /// Boolean expression over node properties; `None` means
    /// unconstrained.
    pub placement_constraint: Option<String>,
    /// Affinity parent service name, if this service's replicas should
    /// be co-located with the parent's.
    pub affinity_parent: Option<ServiceName>,
    /// When true, affinity requires matching role-to-node alignment
    /// with the parent; when false, only co-existence on some nodes is
    /// required.
    pub aligned_affinity: bool,
    /// Metrics this service reports load for.
    pub metrics: Vec<ServiceMetric>,
    /// Default move cost used when none is specified per replica.
    pub default_move_cost: MoveCost,
    /// Service package identity, if packaged.
    pub service_package: Option<String>,
    /// Auto-scaling policies.
    pub scaling_policies: Vec<ScalingPolicy>,
    /// Whether instances should be placed on every eligible node
    /// (stateless "on every node" services).
    pub on_every_node: bool,
    /// Monotonically increasing version.
    pub version: u64,
}

impl Service {
    /// Metric names this service shares, used by the domain
    /// partitioner.
    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|m| m.name.as_str())
    }
}

/// Replica role within a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    /// No role assigned yet.
    None,
    /// Primary replica (stateful services only).
    Primary,
    /// Secondary replica (stateful services only).
    Secondary,
    /// Stand-by replica, not counted toward the active replica set.
    StandBy,
    /// Replica is being dropped.
    Dropped,
}

/// Replica lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaState {
    /// Fully built and serving.
    Ready,
    /// Being built; counts toward capacity but cannot be moved.
    InBuild,
    /// Standing by; counts toward capacity but cannot be moved.
    StandBy,
    /// Being torn down.
    Dropped,
}

/// Replica flags tracked independently of role and lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaFlags {
    /// Primary is marked to be swapped out (e.g. during upgrade).
    pub primary_to_be_swapped_out: bool,
    /// Primary needs to be (re)placed.
    pub primary_to_be_placed: bool,
    /// Replica needs to be (re)placed.
    pub replica_to_be_placed: bool,
    /// A move for this replica is already in flight.
    pub move_in_progress: bool,
    /// The Failover Manager has requested this replica be dropped.
    pub to_be_dropped_by_fm: bool,
    /// The engine has requested this replica be dropped.
    pub to_be_dropped_by_plb: bool,
    /// This replica is being dropped as part of node deactivation.
    pub to_be_dropped_for_node_deactivation: bool,
    /// This secondary is to be promoted to primary.
    pub to_be_promoted: bool,
    /// Marked for removal but not yet removed.
    pub pending_remove: bool,
    /// Logically deleted; the engine stops accounting it.
    pub deleted: bool,
    /// Node this replica's primary should be restored to.
    pub preferred_primary_location: Option<NodeId>,
    /// Whether the replica's communication endpoint is available.
    pub endpoint_available: bool,
    /// Node this replica should be restored to (any role).
    pub preferred_replica_location: Option<NodeId>,
}

/// One replica within a partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    /// Node (and instance) hosting this replica.
    pub node: NodeInstance,
    /// Current role.
    pub role: ReplicaRole,
    /// Current lifecycle state.
    pub state: ReplicaState,
    /// Whether the hosting node considers this replica up.
    pub up: bool,
    /// Replica flags.
    pub flags: ReplicaFlags,
}

impl Replica {
    /// Only ready, non-deleted, non-dropped replicas without an
    /// in-flight move count toward most constraints as movable.
    pub fn is_movable(&self) -> bool {
        self.state == ReplicaState::Ready
            && !self.flags.deleted
            && !self.flags.move_in_progress
            && self.role != ReplicaRole::Dropped
    }

    /// Ready and ready-adjacent (StandBy, InBuild) replicas
    /// participate in capacity accounting.
    pub fn counts_toward_capacity(&self) -> bool {
        matches!(
            self.state,
            ReplicaState::Ready | ReplicaState::StandBy | ReplicaState::InBuild
        ) && !self.flags.deleted
    }
}

/// Per-partition boolean flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFlags {
    /// A service-level upgrade is touching this partition.
    pub upgrading: bool,
    /// An application-level upgrade is touching this partition.
    pub application_upgrade: bool,
    /// The partition is mid-reconfiguration.
    pub reconfiguration: bool,
    /// The primary is flagged to be swapped out.
    pub primary_to_be_swapped_out: bool,
}

/// A failover unit (partition): a GUID-identified replicated unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    /// GUID identity.
    pub id: PartitionId,
    /// Owning service.
    pub service: ServiceName,
    /// Monotonically increasing version.
    pub version: u64,
    /// Desired minus current replica count. Positive triggers
    /// placement, negative triggers drop.
    pub replica_difference: i32,
    /// Current replicas, in no particular order.
    pub replicas: Vec<Replica>,
    /// Partition-level flags.
    pub flags: PartitionFlags,
    /// Logically deleted (service being torn down); the engine
    /// tolerates this and stops accounting it.
    pub deleted: bool,
}

impl Partition {
    /// Replicas eligible to be considered by constraints and phases.
    pub fn live_replicas(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter().filter(|r| !r.flags.deleted)
    }

    /// Node ids currently hosting a live replica of this partition.
    pub fn hosting_node_ids(&self) -> HashSet<NodeId> {
        self.live_replicas().map(|r| r.node.id).collect()
    }
}

/// Per-metric application capacity declaration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ApplicationMetricCapacity {
    /// Cluster-wide total capacity cap for this metric, or `None` for
    /// unlimited.
    pub total_capacity: Option<i64>,
    /// Per-node capacity cap for this metric, or `None` for unlimited.
    pub per_node_capacity: Option<i64>,
    /// Per-node reservation: guaranteed headroom on each node the
    /// application occupies. `0` means no reservation.
    pub per_node_reservation: i64,
}

/// An application: a grouping of services with scaleout and
/// reservation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    /// Unique name.
    pub name: ApplicationName,
    /// Minimum node count. Reservation is active only when this is
    /// greater than zero.
    pub min_node_count: i32,
    /// Maximum distinct nodes this application may occupy. `0` means
    /// unlimited (no scaleout constraint).
    pub max_node_count: i32,
    /// Per-metric capacity declarations.
    pub capacities: HashMap<MetricName, ApplicationMetricCapacity>,
    /// Whether an application-level upgrade is in progress.
    pub upgrade_in_progress: bool,
    /// Upgrade domains that have completed, when upgrading.
    pub completed_upgrade_domains: HashSet<String>,
    /// Owning service package identities.
    pub service_packages: Vec<String>,
    /// Monotonically increasing version.
    pub version: u64,
}

impl Application {
    /// Reservation is active for `metric` when `min_node_count > 0`
    /// and a reservation was declared for that metric.
    pub fn reservation_active(&self, metric: &str) -> Option<i64> {
        if self.min_node_count <= 0 {
            return None;
        }
        self.capacities
            .get(metric)
            .map(|c| c.per_node_reservation)
            .filter(|&r| r > 0)
    }

    /// Cluster-wide reserved capacity for `metric`:
    /// `min_node_count * per_node_reservation`.
    pub fn reserved_capacity(&self, metric: &str) -> i64 {
        self.reservation_active(metric)
            .map(|per_node| per_node * self.min_node_count as i64)
            .unwrap_or(0)
    }
}

/// In-memory, versioned registry of all cluster entities.
///
/// Backed by `dashmap::DashMap` per entity kind so independent entity
/// kinds can be updated concurrently without a shared lock.
#[derive(Debug, Default)]
pub struct EntityStore {
    nodes: DashMap<NodeId, Node>,
    service_types: DashMap<ServiceTypeName, ServiceType>,
    services: DashMap<ServiceName, Service>,
    applications: DashMap<ApplicationName, Application>,
    partitions: DashMap<PartitionId, Partition>,
}

impl EntityStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace (or insert) a node. Always succeeds: nodes are
    /// replaced wholesale under a higher version.
    pub fn upsert_node(&self, node: Node) -> Result<()> {
        check_version(self.nodes.get(&node.instance.id).map(|n| n.version), node.version)?;
        tracing::debug!(node_id = node.instance.id, version = node.version, "node upserted");
        self.nodes.insert(node.instance.id, node);
        Ok(())
    }

    /// Look up a node by id.
    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.nodes.get(&id).map(|n| n.clone())
    }

    /// All nodes.
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.iter().map(|e| e.value().clone()).collect()
    }

    /// Insert or replace a service type.
    pub fn upsert_service_type(&self, st: ServiceType) -> Result<()> {
        check_version(self.service_types.get(&st.name).map(|x| x.version), st.version)?;
        self.service_types.insert(st.name.clone(), st);
        Ok(())
    }

    /// Delete a service type.
    pub fn delete_service_type(&self, name: &str) {
        self.service_types.remove(name);
    }

    /// Look up a service type.
    pub fn service_type(&self, name: &str) -> Option<ServiceType> {
        self.service_types.get(name).map(|x| x.clone())
    }

    /// All service types.
    pub fn service_types(&self) -> Vec<ServiceType> {
        self.service_types.iter().map(|e| e.value().clone()).collect()
    }

    /// Insert or replace a service, validating its references.
    pub fn upsert_service(&self, service: Service) -> Result<()> {
        if self.service_types.get(&service.service_type).is_none() {
            return Err(PlbError::InvalidServiceType(service.service_type.clone()));
        }
        if let Some(app) = &service.application {
            if self.applications.get(app).is_none() {
                return Err(PlbError::InvalidApplication(app.clone()));
            }
        }
        if let Some(existing) = self.services.get(&service.name) {
            if existing.service_type != service.service_type {
                return Err(PlbError::InvalidServiceType(format!(
                    "service {} already registered with type {}",
                    service.name, existing.service_type
                )));
            }
        }
        check_version(self.services.get(&service.name).map(|x| x.version), service.version)?;
        tracing::debug!(service = %service.name, version = service.version, "service upserted");
        self.services.insert(service.name.clone(), service);
        Ok(())
    }

    /// Delete a service.
    pub fn delete_service(&self, name: &str) {
        self.services.remove(name);
    }

    /// Look up a service.
    pub fn service(&self, name: &str) -> Option<Service> {
        self.services.get(name).map(|x| x.clone())
    }

    /// All services.
    pub fn services(&self) -> Vec<Service> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }

    /// Insert or replace an application. Capacity feasibility is
    /// validated by the caller (the reservation accountant) before
    /// this is invoked, since it requires cluster-wide node capacity
    /// that this store doesn't itself aggregate.
    pub fn upsert_application(&self, app: Application) -> Result<()> {
        check_version(self.applications.get(&app.name).map(|x| x.version), app.version)?;
        tracing::debug!(application = %app.name, version = app.version, "application upserted");
        self.applications.insert(app.name.clone(), app);
        Ok(())
    }

    /// Delete an application.
    pub fn delete_application(&self, name: &str) {
        self.applications.remove(name);
    }

    /// Look up an application.
    pub fn application(&self, name: &str) -> Option<Application> {
        self.applications.get(name).map(|x| x.clone())
    }

    /// All applications.
    pub fn applications(&self) -> Vec<Application> {
        self.applications.iter().map(|e| e.value().clone()).collect()
    }

    /// Insert or replace a partition, validating its service
    /// reference.
    pub fn upsert_partition(&self, partition: Partition) -> Result<()> {
        if self.services.get(&partition.service).is_none() {
            return Err(PlbError::UnknownEntity(format!(
                "partition {} references unknown service {}",
                partition.id, partition.service
            )));
        }
        check_version(self.partitions.get(&partition.id).map(|x| x.version), partition.version)?;
        tracing::debug!(
            partition = %partition.id,
            version = partition.version,
            replica_difference = partition.replica_difference,
            "partition upserted"
        );
        self.partitions.insert(partition.id, partition);
        Ok(())
    }

    /// Tombstone a partition: delete form of `UpdateFailoverUnit`.
    pub fn delete_partition(&self, id: PartitionId) {
        if let Some(mut p) = self.partitions.get_mut(&id) {
            p.deleted = true;
            p.replicas.clear();
        }
    }

    /// Look up a partition.
    pub fn partition(&self, id: PartitionId) -> Option<Partition> {
        self.partitions.get(&id).map(|p| p.clone())
    }

    /// All non-deleted partitions.
    pub fn partitions(&self) -> Vec<Partition> {
        self.partitions
            .iter()
            .map(|e| e.value().clone())
            .filter(|p| !p.deleted)
            .collect()
    }

    /// Partitions belonging to one service.
    pub fn partitions_for_service(&self, service: &str) -> Vec<Partition> {
        self.partitions()
            .into_iter()
            .filter(|p| p.service == service)
            .collect()
    }
}

fn check_version(existing: Option<u64>, attempted: u64) -> Result<()> {
    if let Some(current) = existing {
        if attempted <= current {
            return Err(PlbError::AlreadyExists { current, attempted });
        }
    }
    Ok(())
}
