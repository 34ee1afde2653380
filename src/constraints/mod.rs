//! Constraint set shared by the placement, constraint-check, and
//! balancing phases.
//!
//! Constraints are a closed set of variants dispatched through
//! [`ConstraintKind`] rather than trait objects: adding a constraint
//! means adding a variant and a match arm, not a new implementor of an
//! open trait.

mod expr;

use crate::entity::{Application, DomainPath, Node, Partition, ReplicaRole, Service, ServiceType};
use crate::load::LoadTable;
use crate::reservation::ReservationAccountant;
use crate::NodeId;
use std::collections::HashSet;

/// The nine placement constraints, in descending priority. Lower
/// index is higher priority: a violation of `BlockList` can never be
/// traded off against a lower-priority constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    /// Service type's block-list excludes the candidate node.
    BlockList,
    /// Service's placement-constraint expression over node properties.
    PlacementConstraint,
    /// Application's distinct-node footprint (scaleout) ceiling.
    Scaleout,
    /// Per-node, per-metric capacity.
    NodeCapacity,
    /// Application's total and per-node capacity ceilings.
    ApplicationCapacity,
    /// Application's per-node reservation floor.
    Reservation,
    /// Affinity between a service and its affinity parent.
    Affinity,
    /// Fault-domain and upgrade-domain spread.
    FaultUpgradeDomain,
    /// Best-effort attraction back to a preferred location.
    PreferredLocation,
}

impl ConstraintKind {
    /// All constraint kinds in priority order, highest first.
    pub const ALL: [ConstraintKind; 9] = [
        ConstraintKind::BlockList,
        ConstraintKind::PlacementConstraint,
        ConstraintKind::Scaleout,
        ConstraintKind::NodeCapacity,
        ConstraintKind::ApplicationCapacity,
        ConstraintKind::Reservation,
        ConstraintKind::Affinity,
        ConstraintKind::FaultUpgradeDomain,
        ConstraintKind::PreferredLocation,
    ];

    /// Lower number is higher priority.
    pub fn priority(&self) -> u8 {
        Self::ALL.iter().position(|k| k == self).unwrap() as u8
    }
}

/// Outcome of evaluating one constraint against a proposed or current
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintVerdict {
    /// No violation.
    Satisfied,
    /// Violated, and the proposal does not reduce the violation.
    Violated,
    /// Still violated, but strictly less so than the state being
    /// compared against (used by constraint-check's partial-plan
    /// acceptance).
    ImprovesButStillViolated,
    /// Violated in the raw sense, but an active relaxation makes this
    /// an allowed state (e.g. scaleout-1 upgrade relaxation).
    RelaxedAllowed,
}

impl ConstraintVerdict {
    /// Whether this verdict blocks committing the proposal outright.
    pub fn blocks_commit(&self) -> bool {
        matches!(self, ConstraintVerdict::Violated)
    }
}

/// Read-only view over the entities and tunables a constraint check
/// needs. Borrowed for the lifetime of one phase invocation.
pub struct ConstraintContext<'a> {
    /// Every node in the cluster, including down/deactivated ones.
    pub nodes: &'a [Node],
    /// Every service type.
    pub service_types: &'a [ServiceType],
    /// Every application.
    pub applications: &'a [Application],
    /// Every partition in the domain under consideration.
    pub partitions: &'a [Partition],
    /// Reported loads.
    pub load_table: &'a LoadTable,
    /// Active relaxations (see [`crate::config::PlbConfig`] and
    /// [`crate::upgrade`]).
    pub relax_affinity: bool,
    /// Applications currently under the scaleout-1 upgrade relaxation.
    pub relax_scaleout_for_app: HashSet<String>,
    /// Demotes fault-domain and upgrade-domain spread to best-effort,
    /// e.g. while a cluster upgrade is in progress.
    pub relax_fault_upgrade_domain: bool,
}

impl<'a> ConstraintContext<'a> {
    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.instance.id == id)
    }

    fn service_type(&self, name: &str) -> Option<&ServiceType> {
        self.service_types.iter().find(|t| t.name == name)
    }

    fn application(&self, name: &str) -> Option<&Application> {
        self.applications.iter().find(|a| a.name == name)
    }
}

/// Evaluate every constraint, in priority order, for placing a
/// replica with `proposed_role` of `partition` (owned by `service`)
/// onto `node`.
pub fn check_all(ctx: &ConstraintContext, node: &Node, service: &Service, partition: &Partition, proposed_role: ReplicaRole) -> Vec<(ConstraintKind, ConstraintVerdict)> {
    ConstraintKind::ALL
        .iter()
        .map(|&kind| (kind, check_one(ctx, kind, node, service, partition, proposed_role)))
        .collect()
}

/// The highest-priority violated constraint among `verdicts`, if any.
pub fn highest_violation(verdicts: &[(ConstraintKind, ConstraintVerdict)]) -> Option<ConstraintKind> {
    verdicts
        .iter()
        .filter(|(_, v)| v.blocks_commit())
        .min_by_key(|(k, _)| k.priority())
        .map(|(k, _)| *k)
}

fn check_one(
    ctx: &ConstraintContext,
    kind: ConstraintKind,
    node: &Node,
    service: &Service,
    partition: &Partition,
    proposed_role: ReplicaRole,
) -> ConstraintVerdict {
    match kind {
        ConstraintKind::BlockList => check_block_list(ctx, node, service),
        ConstraintKind::PlacementConstraint => check_placement_constraint(node, service),
        ConstraintKind::Scaleout => check_scaleout(ctx, node, service, partition),
        ConstraintKind::NodeCapacity => check_node_capacity(ctx, node, service, partition, proposed_role),
        ConstraintKind::ApplicationCapacity => check_application_capacity(ctx, node, service, partition, proposed_role),
        ConstraintKind::Reservation => check_reservation(ctx, service),
        ConstraintKind::Affinity => check_affinity(ctx, node, service, partition),
        ConstraintKind::FaultUpgradeDomain => check_fault_upgrade_domain(ctx, node, partition),
        ConstraintKind::PreferredLocation => check_preferred_location(node, partition),
    }
}

fn check_block_list(ctx: &ConstraintContext, node: &Node, service: &Service) -> ConstraintVerdict {
    match ctx.service_type(&service.service_type) {
        Some(st) if st.block_list.contains(&node.instance.id) => ConstraintVerdict::Violated,
        _ => ConstraintVerdict::Satisfied,
    }
}

fn check_placement_constraint(node: &Node, service: &Service) -> ConstraintVerdict {
    let expr = service.placement_constraint.as_deref().unwrap_or("");
    if expr::evaluate(expr, &node.properties) {
        ConstraintVerdict::Satisfied
    } else {
        ConstraintVerdict::Violated
    }
}

fn check_scaleout(ctx: &ConstraintContext, node: &Node, service: &Service, partition: &Partition) -> ConstraintVerdict {
    let Some(app_name) = &service.application else {
        return ConstraintVerdict::Satisfied;
    };
    let Some(app) = ctx.application(app_name) else {
        return ConstraintVerdict::Satisfied;
    };
    let effective_max = if ctx.relax_scaleout_for_app.contains(app_name) && app.max_node_count == 1 {
        2
    } else {
        app.max_node_count
    };
    if effective_max <= 0 {
        return ConstraintVerdict::Satisfied;
    }

    let mut footprint: HashSet<NodeId> = partition.hosting_node_ids();
    let already_there = footprint.contains(&node.instance.id);
    footprint.insert(node.instance.id);

    if footprint.len() as i32 <= effective_max {
        ConstraintVerdict::Satisfied
    } else if already_there {
        ConstraintVerdict::Satisfied
    } else if ctx.relax_scaleout_for_app.contains(app_name) {
        ConstraintVerdict::RelaxedAllowed
    } else {
        ConstraintVerdict::Violated
    }
}

fn check_node_capacity(ctx: &ConstraintContext, node: &Node, service: &Service, partition: &Partition, proposed_role: ReplicaRole) -> ConstraintVerdict {
    for metric in service.metric_names() {
        let default_for_role = service
            .metrics
            .iter()
            .find(|m| m.name == metric)
            .map(|m| if proposed_role == ReplicaRole::Primary { m.primary_default } else { m.secondary_default })
            .unwrap_or(0);

        let existing_load: i64 = partition
            .live_replicas()
            .filter(|r| r.node.id == node.instance.id)
            .map(|r| ctx.load_table.replica_load(partition.id, service, r, metric))
            .sum();

        let carry: i64 = ctx
            .applications
            .iter()
            .filter_map(|app| {
                let actual = if service.application.as_deref() == Some(app.name.as_str()) {
                    existing_load
                } else {
                    0
                };
                let c = ReservationAccountant::app_node_carry(app, metric, actual);
                (c > 0).then_some(c)
            })
            .sum();

        let projected = existing_load + default_for_role + carry;
        if projected > node.capacity(metric) {
            return ConstraintVerdict::Violated;
        }
    }
    ConstraintVerdict::Satisfied
}

fn check_application_capacity(ctx: &ConstraintContext, node: &Node, service: &Service, partition: &Partition, proposed_role: ReplicaRole) -> ConstraintVerdict {
    let Some(app_name) = &service.application else {
        return ConstraintVerdict::Satisfied;
    };
    let Some(app) = ctx.application(app_name) else {
        return ConstraintVerdict::Satisfied;
    };

    for (metric, cap) in &app.capacities {
        let default_for_role = service
            .metrics
            .iter()
            .find(|m| &m.name == metric)
            .map(|m| if proposed_role == ReplicaRole::Primary { m.primary_default } else { m.secondary_default })
            .unwrap_or(0);

        if let Some(per_node) = cap.per_node_capacity {
            let existing_on_node: i64 = partition
                .live_replicas()
                .filter(|r| r.node.id == node.instance.id)
                .map(|r| ctx.load_table.replica_load(partition.id, service, r, metric))
                .sum();
            if existing_on_node + default_for_role > per_node {
                return ConstraintVerdict::Violated;
            }
        }
        if let Some(total) = cap.total_capacity {
            let existing_total: i64 = ctx
                .partitions
                .iter()
                .flat_map(|p| p.live_replicas().map(move |r| (p, r)))
                .map(|(p, r)| ctx.load_table.replica_load(p.id, service, r, metric))
                .sum();
            if existing_total + default_for_role > total {
                return ConstraintVerdict::Violated;
            }
        }
    }
    ConstraintVerdict::Satisfied
}

fn check_reservation(ctx: &ConstraintContext, service: &Service) -> ConstraintVerdict {
    let Some(app_name) = &service.application else {
        return ConstraintVerdict::Satisfied;
    };
    let Some(app) = ctx.application(app_name) else {
        return ConstraintVerdict::Satisfied;
    };

    for metric in service.metric_names() {
        let Some(per_node_reservation) = app.reservation_active(metric) else {
            continue;
        };
        let hosting_nodes: HashSet<NodeId> = ctx
            .partitions
            .iter()
            .filter(|p| p.service == service.name)
            .flat_map(|p| p.hosting_node_ids())
            .collect();

        for &node_id in &hosting_nodes {
            let Some(node) = ctx.node(node_id) else { continue };
            if node.capacity(metric) < per_node_reservation {
                return ConstraintVerdict::Violated;
            }
        }
    }
    ConstraintVerdict::Satisfied
}

fn check_affinity(ctx: &ConstraintContext, node: &Node, service: &Service, partition: &Partition) -> ConstraintVerdict {
    let Some(parent_name) = &service.affinity_parent else {
        return ConstraintVerdict::Satisfied;
    };
    if ctx.relax_affinity {
        return ConstraintVerdict::RelaxedAllowed;
    }

    let parent_partitions: Vec<&Partition> = ctx.partitions.iter().filter(|p| &p.service == parent_name).collect();
    if parent_partitions.is_empty() {
        return ConstraintVerdict::Satisfied;
    }
    let parent_nodes: HashSet<NodeId> = parent_partitions.iter().flat_map(|p| p.hosting_node_ids()).collect();

    if service.aligned_affinity {
        if parent_nodes.contains(&node.instance.id) {
            ConstraintVerdict::Satisfied
        } else {
            ConstraintVerdict::Violated
        }
    } else {
        let child_nodes = partition.hosting_node_ids();
        if child_nodes.iter().any(|n| parent_nodes.contains(n)) || parent_nodes.contains(&node.instance.id) {
            ConstraintVerdict::Satisfied
        } else {
            ConstraintVerdict::Violated
        }
    }
}

fn check_fault_upgrade_domain(ctx: &ConstraintContext, node: &Node, partition: &Partition) -> ConstraintVerdict {
    let siblings: Vec<&Node> = partition
        .live_replicas()
        .filter(|r| r.node.id != node.instance.id)
        .filter_map(|r| ctx.node(r.node.id))
        .collect();

    let shares_fault_domain = siblings.iter().any(|n| n.fault_domain == node.fault_domain);
    let shares_upgrade_domain = siblings.iter().any(|n| n.upgrade_domain == node.upgrade_domain);

    if !shares_fault_domain && !shares_upgrade_domain {
        ConstraintVerdict::Satisfied
    } else if ctx.relax_fault_upgrade_domain {
        ConstraintVerdict::RelaxedAllowed
    } else {
        ConstraintVerdict::Violated
    }
}

fn check_preferred_location(node: &Node, partition: &Partition) -> ConstraintVerdict {
    let wants_here = partition.live_replicas().any(|r| {
        r.flags.preferred_primary_location == Some(node.instance.id)
            || r.flags.preferred_replica_location == Some(node.instance.id)
    });
    if wants_here {
        ConstraintVerdict::Satisfied
    } else {
        ConstraintVerdict::ImprovesButStillViolated
    }
}
