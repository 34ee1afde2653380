//! Placement and Load Balancing Engine
//!
//! The core decision engine for a cluster-wide, replicated stateful
//! service platform. Given the most recently observed cluster snapshot
//! (nodes, applications, services, partitions, replicas, reported
//! loads) the engine decides which physical nodes should host each
//! partition's replicas and emits a set of replica movements for an
//! external Failover Manager to execute.
//!
//! # Architecture
//!
//! - **Entity store** ([`entity`]): versioned registry of nodes,
//!   applications, service types, services, partitions and replicas.
//! - **Load table** ([`load`]): per-partition, per-replica, per-metric
//!   reported loads with merge and defaulting semantics.
//! - **Reservation accountant** ([`reservation`]): cluster-wide and
//!   per-node reserved capacity bookkeeping.
//! - **Service domains** ([`domain`]): services partitioned into the
//!   connected components each phase operates on independently.
//! - **Constraint set** ([`constraints`]): the nine prioritized
//!   placement constraints shared by all three phases.
//! - **Phases**: [`placement`], [`constraint_check`], [`balancing`].
//! - **Upgrade coordinator** ([`upgrade`]): atomic singleton-replica
//!   upgrade placement, scaleout relaxation, preferred-location
//!   restoration.
//! - **Query service** ([`query`]): cluster/node/application load
//!   rollups with reservation folded in.
//! - **Engine façade** ([`engine`]): the `Update*` ingress surface,
//!   `ProcessPendingUpdates`, `Refresh`, and the movement map egress
//!   ([`movement`]).

#![warn(missing_docs)]

pub mod balancing;
pub mod config;
pub mod constraint_check;
pub mod constraints;
pub mod domain;
pub mod engine;
pub mod entity;
pub mod load;
pub mod movement;
pub mod placement;
pub mod query;
pub mod reservation;
pub mod upgrade;

pub use config::PlbConfig;
pub use engine::PlacementAndLoadBalancing;
pub use entity::{Application, Node, NodeInstance, Partition, Replica, Service, ServiceType};
pub use movement::{Action, PartitionMovement};

use thiserror::Error;

/// Engine version, surfaced for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors returned by the engine's `Update*` and query surface.
///
/// These are the only errors the engine ever returns synchronously;
/// search failures (no plan found within budget) are not errors, see
/// [`constraint_check`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlbError {
    /// No refresh has completed yet; queries are not meaningful.
    #[error("PLB not ready: no refresh has completed")]
    PlbNotReady,

    /// An application, service, or reservation update would commit
    /// more capacity than the cluster has for some metric.
    #[error("insufficient cluster capacity for metric {metric}: requested {requested}, available {available}")]
    InsufficientClusterCapacity {
        /// Metric whose capacity would be exceeded.
        metric: String,
        /// Capacity the update would require, in milli-units (fixed
        /// point, see [`entity`]).
        requested: i64,
        /// Capacity actually available, in milli-units.
        available: i64,
    },

    /// A service was added to an application after that application
    /// was deleted.
    #[error("application instance deleted: {0}")]
    ApplicationInstanceDeleted(String),

    /// Reference to a service type that does not exist, or a
    /// service/service-type name collision with mismatched types.
    #[error("invalid service type: {0}")]
    InvalidServiceType(String),

    /// Reference to an application that does not exist, or an
    /// application update that is otherwise invalid.
    #[error("invalid application: {0}")]
    InvalidApplication(String),

    /// The update carries a version no higher than the currently
    /// stored version for that entity (version regression).
    #[error("entity already exists at version {current} (update carried version {attempted})")]
    AlreadyExists {
        /// Version currently stored.
        current: u64,
        /// Version carried by the rejected update.
        attempted: u64,
    },

    /// A partition, service, node, or application reference does not
    /// resolve to a known entity.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, PlbError>;

/// A metric name, e.g. `"CPU"` or `"MemoryInMB"`.
pub type MetricName = String;

/// A stable node identifier, distinct from [`NodeInstance`]'s instance
/// number.
pub type NodeId = u64;

/// A service name, unique within the cluster.
pub type ServiceName = String;

/// A service type name, unique within the cluster.
pub type ServiceTypeName = String;

/// An application name, unique within the cluster.
pub type ApplicationName = String;

/// A failover unit (partition) identifier.
pub type PartitionId = uuid::Uuid;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plb_not_ready_is_distinct_from_invariant_errors() {
        let e = PlbError::PlbNotReady;
        assert_eq!(e.to_string(), "PLB not ready: no refresh has completed");
    }

    #[test]
    fn already_exists_carries_both_versions() {
        let e = PlbError::AlreadyExists {
            current: 5,
            attempted: 5,
        };
        assert!(e.to_string().contains('5'));
    }

    #[test]
    fn version_reports_crate_version() {
        assert!(!VERSION.is_empty());
    }
}
