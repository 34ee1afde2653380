//! Engine façade: the `Update*` ingress surface, `ProcessPendingUpdates`,
//! `Refresh`, and the movement egress.
//!
//! One struct owns every piece of mutable runtime state behind a
//! config, with a single entry point (`refresh`) that drains pending
//! updates and runs each phase in order.

use crate::balancing::BalancingPhase;
use crate::config::PlbConfig;
use crate::constraint_check::ConstraintCheckPhase;
use crate::domain::DomainPartitioner;
use crate::entity::{Application, EntityStore, Node, Partition, Replica, ReplicaRole, Service, ServiceType};
use crate::load::LoadTable;
use crate::movement::{Action, PartitionMovement};
use crate::placement::PlacementPhase;
use crate::query::{require_ready, LoadInformation, QueryService};
use crate::reservation::ReservationAccountant;
use crate::upgrade::{ClusterUpgradeStatus, UpgradeCoordinator};
use crate::{ApplicationName, NodeId, PartitionId, PlbError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
enum PendingUpdate {
    Node(Node),
    ServiceType(ServiceType),
    DeleteServiceType(String),
    Service(Service),
    DeleteService(String),
    Application(Application),
    DeleteApplication(String),
    Partition(Partition),
    DeletePartition(PartitionId),
    Load {
        partition: PartitionId,
        metric: String,
        stateful: bool,
        primary: Option<i64>,
        per_node: HashMap<NodeId, i64>,
    },
}

/// Whether placement/balancing and constraint-check are currently
/// permitted to emit movements. `SetMovementEnabled` flips these;
/// phases still run (so queries stay current) but produce no
/// movements while disabled.
#[derive(Debug, Clone, Copy, Default)]
struct MovementEnabled {
    placement_or_balancing: bool,
    constraint_check: bool,
}

#[derive(Default)]
struct PhaseClock {
    last_placement: Option<Instant>,
    last_constraint_check: Option<Instant>,
    last_balancing: Option<Instant>,
    last_topology_change: Option<Instant>,
}

/// The placement and load balancing engine.
pub struct PlacementAndLoadBalancing {
    config: PlbConfig,
    entities: EntityStore,
    loads: LoadTable,
    pending: Mutex<Vec<PendingUpdate>>,
    deleted_applications: Mutex<HashSet<ApplicationName>>,
    movement_enabled: Mutex<MovementEnabled>,
    cluster_upgrade: Mutex<ClusterUpgradeStatus>,
    clock: Mutex<PhaseClock>,
    last_movements: Mutex<Vec<PartitionMovement>>,
    /// Partitions as they'd look if every movement from the most recent
    /// refresh were already executed. Queries read this instead of the
    /// raw entity store, so a caller asking for load right after a
    /// refresh sees the proposed placement, not the one it supersedes.
    last_adjusted_partitions: Mutex<Vec<Partition>>,
    has_refreshed: AtomicBool,
}

impl PlacementAndLoadBalancing {
    /// Construct a new engine with the given configuration. No
    /// refresh has completed yet: queries return `PlbNotReady` until
    /// [`Self::refresh`] runs once.
    pub fn new(config: PlbConfig) -> Self {
        Self {
            config,
            entities: EntityStore::new(),
            loads: LoadTable::new(),
            pending: Mutex::new(Vec::new()),
            deleted_applications: Mutex::new(HashSet::new()),
            movement_enabled: Mutex::new(MovementEnabled {
                placement_or_balancing: true,
                constraint_check: true,
            }),
            cluster_upgrade: Mutex::new(ClusterUpgradeStatus::default()),
            clock: Mutex::new(PhaseClock::default()),
            last_movements: Mutex::new(Vec::new()),
            last_adjusted_partitions: Mutex::new(Vec::new()),
            has_refreshed: AtomicBool::new(false),
        }
    }

    // ---- Ingress ----------------------------------------------------

    /// Enqueue a node update, applied on the next `ProcessPendingUpdates`.
    pub fn update_node(&self, node: Node) {
        self.pending.lock().push(PendingUpdate::Node(node));
    }

    /// Enqueue a service type update.
    pub fn update_service_type(&self, st: ServiceType) {
        self.pending.lock().push(PendingUpdate::ServiceType(st));
    }

    /// Enqueue a service type deletion.
    pub fn delete_service_type(&self, name: impl Into<String>) {
        self.pending.lock().push(PendingUpdate::DeleteServiceType(name.into()));
    }

    /// Validate and enqueue a service update. Returns an error
    /// synchronously when the service references an unknown service
    /// type, an unknown or deleted application, or collides with an
    /// existing service of a different type.
    pub fn update_service(&self, service: Service) -> Result<()> {
        if self.entities.service_type(&service.service_type).is_none() {
            return Err(PlbError::InvalidServiceType(service.service_type.clone()));
        }
        if let Some(app_name) = &service.application {
            if self.deleted_applications.lock().contains(app_name) {
                return Err(PlbError::ApplicationInstanceDeleted(app_name.clone()));
            }
            if self.entities.application(app_name).is_none() {
                return Err(PlbError::InvalidApplication(app_name.clone()));
            }
        }
        if let Some(existing) = self.entities.service(&service.name) {
            if existing.service_type != service.service_type {
                return Err(PlbError::InvalidServiceType(format!(
                    "service {} already registered with type {}",
                    service.name, existing.service_type
                )));
            }
        }
        self.pending.lock().push(PendingUpdate::Service(service));
        Ok(())
    }

    /// Enqueue a service deletion.
    pub fn delete_service(&self, name: impl Into<String>) {
        self.pending.lock().push(PendingUpdate::DeleteService(name.into()));
    }

    /// Validate and enqueue an application update. Returns
    /// `InsufficientClusterCapacity` if the update's reservation would
    /// exceed cluster capacity for any metric.
    pub fn update_application(&self, application: Application) -> Result<()> {
        let others: Vec<Application> = self
            .entities
            .applications()
            .into_iter()
            .filter(|a| a.name != application.name)
            .collect();
        let cluster_capacity: HashMap<String, i64> = application
            .capacities
            .keys()
            .map(|metric| (metric.clone(), self.entities.nodes().iter().map(|n| n.capacity(metric)).sum()))
            .collect();
        ReservationAccountant::validate_application_update(&others, &application, &cluster_capacity)?;
        self.deleted_applications.lock().remove(&application.name);
        self.pending.lock().push(PendingUpdate::Application(application));
        Ok(())
    }

    /// Enqueue an application deletion. Services registered against
    /// this application after deletion are rejected with
    /// `ApplicationInstanceDeleted` until the name is reused via
    /// `update_application`.
    pub fn delete_application(&self, name: impl Into<String>) {
        let name = name.into();
        self.deleted_applications.lock().insert(name.clone());
        self.pending.lock().push(PendingUpdate::DeleteApplication(name));
    }

    /// Enqueue a partition (failover unit) update.
    pub fn update_failover_unit(&self, partition: Partition) {
        self.pending.lock().push(PendingUpdate::Partition(partition));
    }

    /// Enqueue a partition deletion (tombstone).
    pub fn delete_failover_unit(&self, id: PartitionId) {
        self.pending.lock().push(PendingUpdate::DeletePartition(id));
    }

    /// Enqueue a load report. `secondary_by_node` carries per-node
    /// loads for secondaries (stateful) or instances (stateless).
    pub fn update_load_or_move_cost(&self, partition: PartitionId, metric: impl Into<String>, stateful: bool, primary: Option<i64>, secondary_by_node: HashMap<NodeId, i64>) {
        self.pending.lock().push(PendingUpdate::Load {
            partition,
            metric: metric.into(),
            stateful,
            primary,
            per_node: secondary_by_node,
        });
    }

    /// Apply every enqueued update to the entity store and load table,
    /// in FIFO order. Apply-time failures (e.g. a stale version racing
    /// a newer one already committed) are logged and dropped rather
    /// than surfaced, since `Update*` already validated what it could
    /// synchronously.
    pub fn process_pending_updates(&self) {
        let batch: Vec<PendingUpdate> = std::mem::take(&mut *self.pending.lock());
        for update in batch {
            self.apply_one(update);
        }
    }

    fn apply_one(&self, update: PendingUpdate) {
        match update {
            PendingUpdate::Node(node) => {
                let is_new = self.entities.node(node.instance.id).is_none();
                let was_up = self.entities.node(node.instance.id).map(|n| n.up);
                if let Err(e) = self.entities.upsert_node(node.clone()) {
                    tracing::warn!(error = %e, "dropping stale node update");
                    return;
                }
                if is_new || was_up == Some(true) && !node.up {
                    self.clock.lock().last_topology_change = Some(Instant::now());
                }
            }
            PendingUpdate::ServiceType(st) => {
                if let Err(e) = self.entities.upsert_service_type(st) {
                    tracing::warn!(error = %e, "dropping stale service type update");
                }
            }
            PendingUpdate::DeleteServiceType(name) => self.entities.delete_service_type(&name),
            PendingUpdate::Service(service) => {
                if let Err(e) = self.entities.upsert_service(service) {
                    tracing::warn!(error = %e, "dropping stale or invalid service update");
                }
            }
            PendingUpdate::DeleteService(name) => self.entities.delete_service(&name),
            PendingUpdate::Application(app) => {
                if let Err(e) = self.entities.upsert_application(app) {
                    tracing::warn!(error = %e, "dropping stale application update");
                }
            }
            PendingUpdate::DeleteApplication(name) => self.entities.delete_application(&name),
            PendingUpdate::Partition(partition) => {
                if let Err(e) = self.entities.upsert_partition(partition) {
                    tracing::warn!(error = %e, "dropping stale or invalid partition update");
                }
            }
            PendingUpdate::DeletePartition(id) => {
                self.entities.delete_partition(id);
                self.loads.forget_partition(id);
            }
            PendingUpdate::Load {
                partition,
                metric,
                stateful,
                primary,
                per_node,
            } => {
                if stateful {
                    self.loads.report_stateful(partition, &metric, primary, &per_node);
                } else {
                    self.loads.report_stateless(partition, &metric, &per_node);
                }
            }
        }
    }

    // ---- Control ------------------------------------------------------

    /// Enable or disable movement emission for placement/balancing and
    /// constraint check independently. Phases still run so queries
    /// stay current; they simply emit nothing while disabled.
    pub fn set_movement_enabled(&self, placement_or_balancing: bool, constraint_check: bool) {
        let mut m = self.movement_enabled.lock();
        m.placement_or_balancing = placement_or_balancing;
        m.constraint_check = constraint_check;
    }

    /// Update cluster-wide upgrade status.
    pub fn update_cluster_upgrade(&self, in_progress: bool, completed_upgrade_domains: HashSet<String>) {
        let mut u = self.cluster_upgrade.lock();
        u.in_progress = in_progress;
        u.completed_upgrade_domains = completed_upgrade_domains;
    }

    /// Directly propose swapping the primary on `source_node` with the
    /// secondary on `target_node` for `(service, partition)`. A
    /// `service` that does not own `partition` is a no-op rather than
    /// a fatal error: this call is driven by external, possibly
    /// stale, topology observations, and a caller acting on the wrong
    /// service should not crash the engine.
    pub fn trigger_swap_primary(&self, service: &str, partition: PartitionId, source_node: NodeId, target_node: NodeId) -> Result<Option<PartitionMovement>> {
        let Some(p) = self.entities.partition(partition) else {
            return Err(PlbError::UnknownEntity(format!("partition {partition}")));
        };
        if p.service != service {
            return Ok(None);
        }
        let has_primary = p.live_replicas().any(|r| r.role == ReplicaRole::Primary && r.node.id == source_node);
        let has_secondary = p.live_replicas().any(|r| r.role == ReplicaRole::Secondary && r.node.id == target_node);
        if !has_primary || !has_secondary {
            return Err(PlbError::UnknownEntity(format!(
                "partition {partition} has no primary on {source_node} or secondary on {target_node}"
            )));
        }
        Ok(Some(PartitionMovement::new(
            partition,
            service,
            Action::SwapPrimarySecondary {
                primary: source_node,
                secondary: target_node,
            },
        )))
    }

    /// Compare two nodes as promotion targets for a partition's next
    /// primary: `-1` if `node_a` is preferred, `1` if `node_b` is,
    /// `0` if equivalent. Preference is fewer simulated constraint
    /// violations, then lower combined metric load.
    pub fn compare_node_for_promotion(&self, service: &str, partition: PartitionId, node_a: NodeId, node_b: NodeId) -> Result<i32> {
        let p = self
            .entities
            .partition(partition)
            .ok_or_else(|| PlbError::UnknownEntity(format!("partition {partition}")))?;
        let svc = self
            .entities
            .service(service)
            .ok_or_else(|| PlbError::InvalidServiceType(service.to_string()))?;
        let nodes = self.entities.nodes();
        let service_types = self.entities.service_types();
        let applications = self.entities.applications();
        let partitions = self.entities.partitions();

        let ctx = crate::constraints::ConstraintContext {
            nodes: &nodes,
            service_types: &service_types,
            applications: &applications,
            partitions: &partitions,
            load_table: &self.loads,
            relax_affinity: false,
            relax_scaleout_for_app: HashSet::new(),
            relax_fault_upgrade_domain: false,
        };

        let score = |node_id: NodeId| -> (usize, i64) {
            let Some(node) = nodes.iter().find(|n| n.instance.id == node_id) else {
                return (usize::MAX, i64::MAX);
            };
            let verdicts = crate::constraints::check_all(&ctx, node, &svc, &p, ReplicaRole::Primary);
            let violations = verdicts.iter().filter(|(_, v)| v.blocks_commit()).count();
            let load: i64 = svc.metric_names().map(|m| self.loads.replica_load(partition, &svc, &primary_stub(node_id), m)).sum();
            (violations, load)
        };

        Ok(match score(node_a).cmp(&score(node_b)) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Greater => 1,
            std::cmp::Ordering::Equal => 0,
        })
    }

    // ---- Refresh --------------------------------------------------

    /// Run placement, constraint check, and load balancing, each
    /// gated by its own minimum interval, and return every movement
    /// proposed this refresh. The result is also retained for query
    /// purposes until the next refresh.
    pub fn refresh(&self, now: Instant) -> Vec<PartitionMovement> {
        let nodes = self.entities.nodes();
        let service_types = self.entities.service_types();
        let applications = self.entities.applications();
        let services = self.entities.services();
        let partitions = self.entities.partitions();
        let domains = DomainPartitioner::partition(&services);

        let enabled = *self.movement_enabled.lock();
        let mut clock = self.clock.lock();
        let mut movements = Vec::new();

        let run_placement = Self::interval_elapsed(clock.last_placement, now, self.config.min_placement_interval);
        let run_constraint_check = Self::interval_elapsed(clock.last_constraint_check, now, self.config.min_constraint_check_interval);
        let balancing_delay_ok = clock
            .last_topology_change
            .map(|t| now.duration_since(t) >= self.config.balancing_delay_after_node_down.max(self.config.balancing_delay_after_new_node))
            .unwrap_or(true);
        let run_balancing = balancing_delay_ok && Self::interval_elapsed(clock.last_balancing, now, self.config.min_load_balancing_interval);

        for domain in &domains {
            let domain_services: Vec<Service> = services.iter().filter(|s| domain.services.contains(&s.name)).cloned().collect();
            let domain_partitions: Vec<Partition> = partitions
                .iter()
                .filter(|p| domain_services.iter().any(|s| s.name == p.service))
                .cloned()
                .collect();

            if run_placement && enabled.placement_or_balancing {
                movements.extend(PlacementPhase::run(&nodes, &service_types, &applications, &domain_services, &domain_partitions, &self.loads, &self.config));
            }

            if run_constraint_check && enabled.constraint_check {
                movements.extend(ConstraintCheckPhase::run(&nodes, &service_types, &applications, &domain_services, &domain_partitions, &self.loads, &self.config));
            }

            let cluster_upgrade = self.cluster_upgrade.lock().clone();
            movements.extend(UpgradeCoordinator::run(
                &nodes,
                &service_types,
                &applications,
                &domain_services,
                &domain_partitions,
                &self.loads,
                &self.config,
                &cluster_upgrade,
            ));

            if run_balancing && enabled.placement_or_balancing {
                movements.extend(BalancingPhase::run(&nodes, &service_types, &applications, &domain_services, &domain_partitions, &self.loads, &self.config));
            }
        }

        if run_placement {
            clock.last_placement = Some(now);
        }
        if run_constraint_check {
            clock.last_constraint_check = Some(now);
        }
        if run_balancing {
            clock.last_balancing = Some(now);
        }
        drop(clock);

        *self.last_adjusted_partitions.lock() = apply_movements(&partitions, &movements);
        *self.last_movements.lock() = movements.clone();
        self.has_refreshed.store(true, Ordering::Release);
        movements
    }

    fn interval_elapsed(last: Option<Instant>, now: Instant, min_interval: Duration) -> bool {
        match last {
            None => true,
            Some(t) if now < t => true,
            Some(t) => now.duration_since(t) >= min_interval,
        }
    }

    /// The movements proposed by the most recent refresh.
    pub fn last_movements(&self) -> Vec<PartitionMovement> {
        self.last_movements.lock().clone()
    }

    // ---- Query ------------------------------------------------------

    /// Cluster-wide load rollup for `metric`.
    pub fn cluster_load_information(&self, metric: &str) -> Result<LoadInformation> {
        require_ready(self.has_refreshed.load(Ordering::Acquire))?;
        let (nodes, applications, services, partitions) = self.snapshot();
        let qs = QueryService::new(&nodes, &applications, &services, &partitions, &self.loads, self.config.buffer_percent);
        Ok(qs.cluster_load(metric))
    }

    /// Per-node load rollup for `metric`.
    pub fn node_load_information(&self, node: NodeId, metric: &str) -> Result<LoadInformation> {
        require_ready(self.has_refreshed.load(Ordering::Acquire))?;
        let (nodes, applications, services, partitions) = self.snapshot();
        let qs = QueryService::new(&nodes, &applications, &services, &partitions, &self.loads, self.config.buffer_percent);
        qs.node_load(node, metric).ok_or_else(|| PlbError::UnknownEntity(format!("node {node}")))
    }

    /// Per-application load rollup for `metric`.
    pub fn application_load_information(&self, application: &str, metric: &str) -> Result<LoadInformation> {
        require_ready(self.has_refreshed.load(Ordering::Acquire))?;
        let (nodes, applications, services, partitions) = self.snapshot();
        let qs = QueryService::new(&nodes, &applications, &services, &partitions, &self.loads, self.config.buffer_percent);
        qs.application_load(application, metric).ok_or_else(|| PlbError::InvalidApplication(application.to_string()))
    }

    fn snapshot(&self) -> (Vec<Node>, Vec<Application>, Vec<Service>, Vec<Partition>) {
        (self.entities.nodes(), self.entities.applications(), self.entities.services(), self.last_adjusted_partitions.lock().clone())
    }
}

/// Folds every proposed movement onto a clone of `partitions`, as if
/// the Failover Manager had already executed each one. Queries read
/// this adjusted view rather than the raw entity store so they reflect
/// the refresh that just ran, not the placement it's replacing.
fn apply_movements(partitions: &[Partition], movements: &[PartitionMovement]) -> Vec<Partition> {
    let mut adjusted: Vec<Partition> = partitions.to_vec();
    for m in movements {
        let Some(partition) = adjusted.iter_mut().find(|p| p.id == m.partition) else {
            continue;
        };
        match m.action {
            Action::AddPrimary { node } | Action::AddSecondary { node } | Action::AddInstance { node } => {
                if let Some(role) = m.action.resulting_role() {
                    partition.replicas.push(Replica {
                        node: crate::entity::NodeInstance::new(node, 1),
                        role,
                        state: crate::entity::ReplicaState::Ready,
                        up: true,
                        flags: crate::entity::ReplicaFlags::default(),
                    });
                }
            }
            Action::MoveSecondary { from, to } | Action::MovePrimary { from, to } | Action::MoveInstance { from, to } => {
                if let Some(replica) = partition.replicas.iter_mut().find(|r| r.node.id == from) {
                    replica.node = crate::entity::NodeInstance::new(to, 1);
                }
            }
            Action::SwapPrimarySecondary { primary, secondary } => {
                let primary_role = partition.replicas.iter().find(|r| r.node.id == primary).map(|r| r.role);
                let secondary_role = partition.replicas.iter().find(|r| r.node.id == secondary).map(|r| r.role);
                for replica in partition.replicas.iter_mut() {
                    if replica.node.id == primary {
                        if let Some(role) = secondary_role {
                            replica.role = role;
                        }
                    } else if replica.node.id == secondary {
                        if let Some(role) = primary_role {
                            replica.role = role;
                        }
                    }
                }
            }
            Action::PromoteSecondary { node } => {
                if let Some(replica) = partition.replicas.iter_mut().find(|r| r.node.id == node) {
                    replica.role = ReplicaRole::Primary;
                }
            }
            Action::DropPrimary { node } | Action::DropSecondary { node } | Action::DropInstance { node } => {
                partition.replicas.retain(|r| r.node.id != node);
            }
            Action::RequestedPlacementNotPossible { .. } => {}
        }
    }
    adjusted
}

// A stub replica used only to resolve a node's declared default load
// for `compare_node_for_promotion`, which compares candidate primaries
// that do not yet host a replica.
fn primary_stub(node_id: NodeId) -> Replica {
    Replica {
        node: crate::entity::NodeInstance::new(node_id, 1),
        role: ReplicaRole::Primary,
        state: crate::entity::ReplicaState::Ready,
        up: true,
        flags: crate::entity::ReplicaFlags::default(),
    }
}
