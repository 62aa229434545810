//! Aggregation contracts.
//!
//! # Responsibility
//! - Define the whole-set reducer (`Aggregator`) and the pairwise reducer
//!   (`Melder`) used to derive a secondary view from merged atoms.
//! - Provide the partition-and-fold aggregator built from a melder.
//!
//! # Invariants
//! - Aggregators receive every merged atom at once and own no store state.
//! - For a fixed input order, output is deterministic.

mod partition;

use crate::behavior::capability::BehaviorError;
use crate::model::atom::Atom;

pub use partition::PartitionAggregator;

/// Reduces the full merged atom set to derived atoms.
pub trait Aggregator: Send + Sync {
    fn aggregate(&self, atoms: &[Atom]) -> Result<Vec<Atom>, BehaviorError>;
}

/// Combines two atoms sharing a collation key into one.
pub trait Melder: Send + Sync {
    fn meld(&self, left: &Atom, right: &Atom) -> Result<Atom, BehaviorError>;
}

impl std::fmt::Debug for dyn Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Aggregator")
    }
}

impl std::fmt::Debug for dyn Melder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Melder")
    }
}
