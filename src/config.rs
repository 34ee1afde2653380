//! Engine configuration.
//!
//! Minimum phase intervals, search budgets, and upgrade relaxation
//! toggles all live on one struct so a test or caller can flip a
//! single field without touching engine internals.

use std::time::Duration;

/// Engine-wide configuration.
///
/// `Default` matches the conservative defaults a freshly started
/// cluster should run with: balancing and constraint-check enabled,
/// no upgrade relaxations active, one-second minimum phase intervals.
#[derive(Clone, Debug)]
pub struct PlbConfig {
    /// Minimum time between two placement phase runs.
    pub min_placement_interval: Duration,
    /// Minimum time between two constraint check phase runs.
    pub min_constraint_check_interval: Duration,
    /// Minimum time between two load balancing phase runs.
    pub min_load_balancing_interval: Duration,
    /// Delay before resuming balancing after a node goes down.
    pub balancing_delay_after_node_down: Duration,
    /// Delay before resuming balancing after a new node joins.
    pub balancing_delay_after_new_node: Duration,

    /// Upper bound on fix-plan search rounds per constraint check run.
    pub constraint_check_iterations_per_round: u32,
    /// Wall-clock budget for constraint check search per run.
    pub constraint_check_search_timeout: Duration,
    /// Upper bound on simulated annealing steps per balancing run.
    pub max_simulated_annealing_iterations: u32,

    /// Require every intermediate placement state to satisfy capacity,
    /// not just the final state.
    pub prevent_transient_overcommit: bool,
    /// Allow upgrade-marked partitions to place even if capacity
    /// tightens by one replica's load.
    pub relax_capacity_constraint_for_upgrade: bool,
    /// Treat affinity-correlated replicas in the same upgrade closure
    /// as a single atomic placement unit.
    pub check_affinity_for_upgrade_placement: bool,
    /// Raise effective scaleout from 1 to 2 (and relax per-node
    /// capacity) for scaleout-1 applications mid-upgrade.
    pub relax_scaleout_constraint_during_upgrade: bool,
    /// Allow a primary marked `PrimaryToBeSwappedOut` to swap with a
    /// viable secondary during upgrade entry.
    pub is_singleton_replica_move_allowed_during_upgrade_entry: bool,
    /// Demote affinity to best-effort globally while a cluster upgrade
    /// is in progress.
    pub relax_affinity_constraint_during_upgrade: bool,
    /// Demote fault-domain and upgrade-domain spread to best-effort
    /// while a cluster upgrade is in progress.
    pub relax_fault_domain_constraint_during_upgrade: bool,

    /// Per-metric balancing score threshold below which the balancing
    /// phase is skipped entirely for that metric's domain.
    pub balancing_threshold: f64,
    /// Fraction of capacity held back from `bufferedCapacity` in query
    /// rollups (0.0 = no buffer).
    pub buffer_percent: f64,

    /// RNG seed for simulated annealing's random move selection, so
    /// balancing runs are reproducible in tests.
    pub annealing_seed: u64,
}

impl Default for PlbConfig {
    fn default() -> Self {
        Self {
            min_placement_interval: Duration::from_secs(1),
            min_constraint_check_interval: Duration::from_secs(1),
            min_load_balancing_interval: Duration::from_secs(1),
            balancing_delay_after_node_down: Duration::from_secs(120),
            balancing_delay_after_new_node: Duration::from_secs(120),

            constraint_check_iterations_per_round: 200,
            constraint_check_search_timeout: Duration::from_secs(5),
            max_simulated_annealing_iterations: 1000,

            prevent_transient_overcommit: true,
            relax_capacity_constraint_for_upgrade: false,
            check_affinity_for_upgrade_placement: false,
            relax_scaleout_constraint_during_upgrade: false,
            is_singleton_replica_move_allowed_during_upgrade_entry: false,
            relax_affinity_constraint_during_upgrade: false,
            relax_fault_domain_constraint_during_upgrade: false,

            balancing_threshold: 0.05,
            buffer_percent: 0.0,

            annealing_seed: 0x5150_u64,
        }
    }
}

impl PlbConfig {
    /// Configuration with every phase interval and search budget
    /// zeroed out, so tests can drive `Refresh` deterministically on
    /// every call without waiting for intervals to elapse.
    pub fn for_tests() -> Self {
        Self {
            min_placement_interval: Duration::ZERO,
            min_constraint_check_interval: Duration::ZERO,
            min_load_balancing_interval: Duration::ZERO,
            balancing_delay_after_node_down: Duration::ZERO,
            balancing_delay_after_new_node: Duration::ZERO,
            constraint_check_search_timeout: Duration::ZERO,
            ..Self::default()
        }
    }
}
