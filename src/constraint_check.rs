//! Constraint check phase: detects existing violations in the current
//! observed state and searches for moves that resolve them without
//! introducing any higher-priority violation, bounded by an iteration
//! cap and a wall-clock search budget.

use crate::config::PlbConfig;
use crate::constraints::{self, ConstraintContext, ConstraintKind};
use crate::entity::{Application, Node, Partition, ReplicaRole, Service, ServiceType};
use crate::load::LoadTable;
use crate::movement::{Action, PartitionMovement};
use crate::NodeId;
use std::collections::HashSet;
use std::time::{Duration, Instant};

struct Violation<'a> {
    partition: &'a Partition,
    service: &'a Service,
    node_id: NodeId,
    role: ReplicaRole,
    kind: ConstraintKind,
}

/// The constraint check phase.
pub struct ConstraintCheckPhase;

impl ConstraintCheckPhase {
    /// Find and attempt to fix every constraint violation in the
    /// current state, most severe first, bounded by
    /// `constraint_check_iterations_per_round` and
    /// `constraint_check_search_timeout`.
    pub fn run(
        nodes: &[Node],
        service_types: &[ServiceType],
        applications: &[Application],
        services: &[Service],
        partitions: &[Partition],
        load_table: &LoadTable,
        config: &PlbConfig,
    ) -> Vec<PartitionMovement> {
        let start = Instant::now();
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

        let mut violations = Self::find_violations(&ctx, services, partitions);
        violations.sort_by_key(|v| v.kind.priority());

        let mut movements = Vec::new();
        let mut iterations = 0u32;

        for violation in &violations {
            if iterations >= config.constraint_check_iterations_per_round {
                tracing::debug!("constraint check iteration budget exhausted");
                break;
            }
            if config.constraint_check_search_timeout > Duration::ZERO && start.elapsed() >= config.constraint_check_search_timeout {
                tracing::debug!("constraint check search timeout reached");
                break;
            }
            iterations += 1;

            if let Some(action) = Self::search_fix(&ctx, nodes, violation) {
                let movement = PartitionMovement::new(violation.partition.id, violation.service.name.clone(), action);
                tracing::info!(kind = ?violation.kind, rendered = %movement.render(), "constraint check proposed a fix");
                movements.push(movement);
            }
        }

        movements
    }

    fn find_violations<'a>(ctx: &ConstraintContext, services: &'a [Service], partitions: &'a [Partition]) -> Vec<Violation<'a>> {
        let mut out = Vec::new();
        for partition in partitions {
            let Some(service) = services.iter().find(|s| s.name == partition.service) else {
                continue;
            };
            for replica in partition.live_replicas() {
                let Some(node) = ctx.nodes.iter().find(|n| n.instance.id == replica.node.id) else {
                    continue;
                };
                let verdicts = constraints::check_all(ctx, node, service, partition, replica.role);
                if let Some(kind) = constraints::highest_violation(&verdicts) {
                    out.push(Violation {
                        partition,
                        service,
                        node_id: node.instance.id,
                        role: replica.role,
                        kind,
                    });
                }
            }
        }
        out
    }

    fn search_fix(ctx: &ConstraintContext, nodes: &[Node], violation: &Violation) -> Option<Action> {
        let hosting = violation.partition.hosting_node_ids();
        let mut candidates: Vec<&Node> = nodes
            .iter()
            .filter(|n| n.usable_for_placement() && !hosting.contains(&n.instance.id))
            .collect();
        candidates.sort_by_key(|n| n.instance.id);

        for candidate in candidates {
            let verdicts = constraints::check_all(ctx, candidate, violation.service, violation.partition, violation.role);
            let blocker = constraints::highest_violation(&verdicts);
            let introduces_worse = blocker.map(|k| k.priority() < violation.kind.priority()).unwrap_or(false);
            if introduces_worse {
                continue;
            }

            return Some(match violation.role {
                ReplicaRole::Primary => Action::MovePrimary {
                    from: violation.node_id,
                    to: candidate.instance.id,
                },
                _ => Action::MoveSecondary {
                    from: violation.node_id,
                    to: candidate.instance.id,
                },
            });
        }
        None
    }
}
