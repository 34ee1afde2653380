//! Movement proposals: the engine's output surface.
//!
//! Every phase emits zero or more [`PartitionMovement`]s instead of
//! mutating the entity store directly — the Failover Manager is the
//! only actor that ever executes a movement; the engine only ever
//! proposes.

use crate::entity::ReplicaRole;
use crate::{NodeId, PartitionId, ServiceName};
use serde::{Deserialize, Serialize};

/// One proposed change to a partition's replica placement, named after
/// the engine's egress action set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Add a primary replica on `node` (new or newly-placed partition).
    AddPrimary {
        /// Target node.
        node: NodeId,
    },
    /// Add a secondary replica on `node`.
    AddSecondary {
        /// Target node.
        node: NodeId,
    },
    /// Add a stateless instance on `node`.
    AddInstance {
        /// Target node.
        node: NodeId,
    },
    /// Move a secondary replica from one node to another.
    MoveSecondary {
        /// Current node.
        from: NodeId,
        /// Destination node.
        to: NodeId,
    },
    /// Move a primary replica from one node to another (constraint
    /// check and balancing only; placement never moves a primary).
    MovePrimary {
        /// Current node.
        from: NodeId,
        /// Destination node.
        to: NodeId,
    },
    /// Move a stateless instance from one node to another.
    MoveInstance {
        /// Current node.
        from: NodeId,
        /// Destination node.
        to: NodeId,
    },
    /// Swap primary and secondary roles between two nodes already
    /// hosting replicas of the same partition.
    SwapPrimarySecondary {
        /// Node currently hosting the primary.
        primary: NodeId,
        /// Node currently hosting the secondary to promote.
        secondary: NodeId,
    },
    /// Promote the secondary on `node` to primary without an
    /// accompanying demotion target (the prior primary is gone).
    PromoteSecondary {
        /// Node whose secondary is promoted.
        node: NodeId,
    },
    /// Drop the primary replica on `node`.
    DropPrimary {
        /// Node hosting the replica to drop.
        node: NodeId,
    },
    /// Drop the secondary replica on `node`.
    DropSecondary {
        /// Node hosting the replica to drop.
        node: NodeId,
    },
    /// Drop the stateless instance on `node`.
    DropInstance {
        /// Node hosting the instance to drop.
        node: NodeId,
    },
    /// Clear a stale `MoveInProgress` flag without performing any
    /// actual transfer, because the original destination is no longer
    /// viable.
    RequestedPlacementNotPossible {
        /// Node the stale move flag points at.
        node: NodeId,
    },
}

impl Action {
    /// The role a successfully executed action leaves on its primary
    /// target node, when that's well defined.
    pub fn resulting_role(&self) -> Option<ReplicaRole> {
        match self {
            Action::AddPrimary { .. } | Action::MovePrimary { .. } | Action::PromoteSecondary { .. } => Some(ReplicaRole::Primary),
            Action::AddSecondary { .. } | Action::MoveSecondary { .. } => Some(ReplicaRole::Secondary),
            Action::AddInstance { .. } | Action::MoveInstance { .. } => Some(ReplicaRole::None),
            Action::SwapPrimarySecondary { .. }
            | Action::DropPrimary { .. }
            | Action::DropSecondary { .. }
            | Action::DropInstance { .. }
            | Action::RequestedPlacementNotPossible { .. } => None,
        }
    }

    /// A textual rendering in the consumer's expected form, e.g.
    /// `"<fu> swap primary a<=>b"`, `"<fu> move primary a=>b"`.
    pub fn render(&self, partition: PartitionId) -> String {
        match self {
            Action::AddPrimary { node } => format!("{partition} add primary {node}"),
            Action::AddSecondary { node } => format!("{partition} add secondary {node}"),
            Action::AddInstance { node } => format!("{partition} add instance {node}"),
            Action::MoveSecondary { from, to } => format!("{partition} move secondary {from}=>{to}"),
            Action::MovePrimary { from, to } => format!("{partition} move primary {from}=>{to}"),
            Action::MoveInstance { from, to } => format!("{partition} move instance {from}=>{to}"),
            Action::SwapPrimarySecondary { primary, secondary } => {
                format!("{partition} swap primary {primary}<=>{secondary}")
            }
            Action::PromoteSecondary { node } => format!("{partition} promote secondary {node}"),
            Action::DropPrimary { node } => format!("{partition} drop primary {node}"),
            Action::DropSecondary { node } => format!("{partition} drop secondary {node}"),
            Action::DropInstance { node } => format!("{partition} drop instance {node}"),
            Action::RequestedPlacementNotPossible { node } => format!("{partition} void movement {node}"),
        }
    }
}

/// A movement proposal for one partition, identified by the owning
/// service for logging and the FM's routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMovement {
    /// Partition the action applies to.
    pub partition: PartitionId,
    /// Owning service, carried for diagnostics only.
    pub service: ServiceName,
    /// The proposed action.
    pub action: Action,
}

impl PartitionMovement {
    /// Construct a movement proposal.
    pub fn new(partition: PartitionId, service: impl Into<ServiceName>, action: Action) -> Self {
        Self {
            partition,
            service: service.into(),
            action,
        }
    }

    /// Textual rendering of this movement, see [`Action::render`].
    pub fn render(&self) -> String {
        self.action.render(self.partition)
    }
}
