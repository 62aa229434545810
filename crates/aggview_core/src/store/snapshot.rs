//! Point-in-time atom snapshots.

use crate::model::atom::{Atom, CompoundKey, IdentifierSchema, SOURCE_TAG_FIELD};
use crate::store::merge_store::SourceTable;
use std::collections::{btree_map, BTreeMap};
use std::sync::Arc;

/// Copy of every source table and exception taken under one lock
/// acquisition.
///
/// Iteration is lazy and restartable: each call to [`AtomSnapshot::iter`]
/// walks the same frozen state from the beginning.
#[derive(Debug, Clone)]
pub struct AtomSnapshot {
    schema: IdentifierSchema,
    tables: Vec<(String, Arc<SourceTable>)>,
    exceptions: BTreeMap<String, String>,
    include_source_tag: bool,
    revision: u64,
}

impl AtomSnapshot {
    pub(crate) fn new(
        schema: IdentifierSchema,
        tables: Vec<(String, Arc<SourceTable>)>,
        exceptions: BTreeMap<String, String>,
        include_source_tag: bool,
        revision: u64,
    ) -> Self {
        Self {
            schema,
            tables,
            exceptions,
            include_source_tag,
            revision,
        }
    }

    pub fn iter(&self) -> SnapshotIter<'_> {
        SnapshotIter {
            snapshot: self,
            next_table: 0,
            current: None,
        }
    }

    /// Store revision the snapshot was taken at.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn schema(&self) -> &IdentifierSchema {
        &self.schema
    }

    /// Exceptions recorded at the snapshot's revision.
    pub fn exceptions(&self) -> &BTreeMap<String, String> {
        &self.exceptions
    }

    pub fn len(&self) -> usize {
        self.tables.iter().map(|(_, table)| table.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|(source, _)| source.as_str())
    }

    pub fn to_vec(&self) -> Vec<Atom> {
        self.iter().collect()
    }

    fn assemble(&self, source: &str, stored: &Atom) -> Atom {
        let mut atom = stored.clone();
        if self.include_source_tag {
            atom.set_identifier(SOURCE_TAG_FIELD, source);
        }
        atom
    }
}

impl<'a> IntoIterator for &'a AtomSnapshot {
    type Item = Atom;
    type IntoIter = SnapshotIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator over the atoms of one snapshot.
pub struct SnapshotIter<'a> {
    snapshot: &'a AtomSnapshot,
    next_table: usize,
    current: Option<(&'a str, btree_map::Values<'a, CompoundKey, Atom>)>,
}

impl Iterator for SnapshotIter<'_> {
    type Item = Atom;

    fn next(&mut self) -> Option<Self::Item> {
        let snapshot = self.snapshot;
        loop {
            if let Some((source, entries)) = self.current.as_mut() {
                if let Some(stored) = entries.next() {
                    return Some(snapshot.assemble(source, stored));
                }
            }
            let (source, table) = snapshot.tables.get(self.next_table)?;
            self.next_table += 1;
            self.current = Some((source.as_str(), table.values()));
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::model::atom::{Atom, SOURCE_TAG_FIELD};
    use crate::store::{AtomOperation, MergeStore};

    fn site(id: &str, load: &str) -> Atom {
        Atom::new()
            .with_identifier("siteId", id)
            .with_value("load", load)
    }

    #[test]
    fn snapshot_is_restartable() {
        let store = MergeStore::new();
        store
            .apply_batch("north", &[AtomOperation::add(site("A", "1"))])
            .unwrap();
        store
            .apply_batch("south", &[AtomOperation::add(site("B", "2"))])
            .unwrap();

        let snapshot = store.snapshot_atoms(false);
        let first: Vec<_> = snapshot.iter().collect();
        let second: Vec<_> = (&snapshot).into_iter().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(snapshot.source_ids().collect::<Vec<_>>(), ["north", "south"]);
    }

    #[test]
    fn source_tag_is_added_as_identifier() {
        let store = MergeStore::new();
        store
            .apply_batch("north", &[AtomOperation::add(site("A", "1"))])
            .unwrap();

        let atom = store
            .snapshot_atoms(true)
            .iter()
            .next()
            .expect("one atom");
        assert_eq!(atom.identifier(SOURCE_TAG_FIELD), Some("north"));
        assert_eq!(atom.identifier("siteId"), Some("A"));
    }

    #[test]
    fn snapshot_ignores_later_mutations() {
        let store = MergeStore::new();
        store
            .apply_batch("north", &[AtomOperation::add(site("A", "1"))])
            .unwrap();
        let snapshot = store.snapshot_atoms(false);

        store
            .apply_batch(
                "north",
                &[
                    AtomOperation::change(site("A", "9")),
                    AtomOperation::add(site("C", "3")),
                ],
            )
            .unwrap();

        assert_eq!(snapshot.to_vec(), vec![site("A", "1")]);
        assert_eq!(store.snapshot_atoms(false).len(), 2);
    }
}
