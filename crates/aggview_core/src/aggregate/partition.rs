//! Partition-and-fold aggregator.

use crate::aggregate::{Aggregator, Melder};
use crate::behavior::capability::BehaviorError;
use crate::model::atom::Atom;
use indexmap::map::Entry;
use indexmap::IndexMap;
use std::sync::Arc;

/// Groups atoms by their collation-id values and folds each group with a
/// melder, left to right in encounter order.
///
/// A collation id missing from an atom projects to "absent", so atoms
/// lacking the same ids share a group. Groups come out in order of first
/// appearance; singleton groups pass through unmelded.
#[derive(Clone)]
pub struct PartitionAggregator {
    collation_ids: Vec<String>,
    melder: Arc<dyn Melder>,
}

impl PartitionAggregator {
    pub fn new(collation_ids: Vec<String>, melder: Arc<dyn Melder>) -> Self {
        Self {
            collation_ids,
            melder,
        }
    }

    pub fn collation_ids(&self) -> &[String] {
        &self.collation_ids
    }

    fn collation_key(&self, atom: &Atom) -> Vec<Option<String>> {
        self.collation_ids
            .iter()
            .map(|id| atom.field(id).map(str::to_string))
            .collect()
    }
}

impl Aggregator for PartitionAggregator {
    fn aggregate(&self, atoms: &[Atom]) -> Result<Vec<Atom>, BehaviorError> {
        let mut groups: IndexMap<Vec<Option<String>>, Atom> = IndexMap::new();
        for atom in atoms {
            match groups.entry(self.collation_key(atom)) {
                Entry::Vacant(slot) => {
                    slot.insert(atom.clone());
                }
                Entry::Occupied(mut slot) => {
                    let merged = self.melder.meld(slot.get(), atom)?;
                    slot.insert(merged);
                }
            }
        }
        Ok(groups.into_values().collect())
    }
}

impl std::fmt::Debug for PartitionAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionAggregator")
            .field("collation_ids", &self.collation_ids)
            .finish_non_exhaustive()
    }
}
