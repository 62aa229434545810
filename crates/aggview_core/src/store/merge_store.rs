//! Merge store implementation.

use crate::config::{BatchFailurePolicy, ExceptionRetention, StorePolicy};
use crate::model::atom::{Atom, AtomError, CompoundKey, IdentifierSchema};
use crate::store::document::{SourceDocument, StoreDocument};
use crate::store::snapshot::AtomSnapshot;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Keyed atoms reported by one source.
pub type SourceTable = BTreeMap<CompoundKey, Atom>;

/// How a store derives the keys of its atoms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Keying {
    /// By the identifier schema learned from the first merged atom.
    #[default]
    Schema,
    /// By position in an ordered list; atoms keep whatever identifiers
    /// they carry and never overwrite one another.
    Ordinal,
}

/// Kind of one decoded delta operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Add,
    Change,
    Remove,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Change => "change",
            Self::Remove => "remove",
        }
    }

    fn is_upsert(self) -> bool {
        matches!(self, Self::Add | Self::Change)
    }
}

/// One decoded delta operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomOperation {
    pub kind: OperationKind,
    pub atom: Atom,
}

impl AtomOperation {
    pub fn add(atom: Atom) -> Self {
        Self {
            kind: OperationKind::Add,
            atom,
        }
    }

    pub fn change(atom: Atom) -> Self {
        Self {
            kind: OperationKind::Change,
            atom,
        }
    }

    pub fn remove(atom: Atom) -> Self {
        Self {
            kind: OperationKind::Remove,
            atom,
        }
    }
}

/// Operation skipped under `BatchFailurePolicy::SkipInvalid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOperation {
    /// Position of the operation inside its batch.
    pub index: usize,
    pub error: AtomError,
}

/// Result of one applied batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: usize,
    pub rejected: Vec<RejectedOperation>,
}

/// Merge store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    InvalidSourceId(String),
    /// Batches sent to a position-keyed store.
    OrdinalStore(String),
    KeyDerivation {
        source_id: String,
        index: usize,
        error: AtomError,
    },
    Document(String),
}

impl Display for MergeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSourceId(value) => write!(f, "source id is invalid: `{value}`"),
            Self::OrdinalStore(source_id) => write!(
                f,
                "batch from source `{source_id}` rejected: store holds an ordered list"
            ),
            Self::KeyDerivation {
                source_id,
                index,
                error,
            } => write!(
                f,
                "operation {index} from source `{source_id}` rejected: {error}"
            ),
            Self::Document(message) => write!(f, "store document error: {message}"),
        }
    }
}

impl Error for MergeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::KeyDerivation { error, .. } => Some(error),
            Self::InvalidSourceId(_) | Self::OrdinalStore(_) | Self::Document(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StoreState {
    pub(crate) keying: Keying,
    pub(crate) schema: Option<IdentifierSchema>,
    pub(crate) tables: BTreeMap<String, Arc<SourceTable>>,
    pub(crate) exceptions: BTreeMap<String, String>,
    pub(crate) responded: BTreeSet<String>,
    pub(crate) revision: u64,
}

/// Thread-safe table of per-source keyed atoms for one query.
#[derive(Debug, Default)]
pub struct MergeStore {
    policy: StorePolicy,
    state: Mutex<StoreState>,
}

type PlannedOp<'a> = (OperationKind, CompoundKey, &'a Atom);

impl MergeStore {
    /// Creates an empty store with default policies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store with explicit policies.
    pub fn with_policy(policy: StorePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Creates an empty position-keyed store.
    pub fn ordinal(policy: StorePolicy) -> Self {
        let store = Self::with_policy(policy);
        store.state().keying = Keying::Ordinal;
        store
    }

    /// Builds a position-keyed store holding `atoms` under `source_id`,
    /// in the given order.
    ///
    /// # Errors
    /// - `InvalidSourceId` for a blank source id.
    /// - `KeyDerivation` when an atom has a blank or duplicated field name.
    pub fn from_ordered_atoms(
        policy: StorePolicy,
        source_id: &str,
        atoms: Vec<Atom>,
    ) -> Result<Self, MergeError> {
        let source_id = normalize_source_id(source_id)?;
        let table = ordinal_table(&source_id, atoms)?;
        let store = Self::ordinal(policy);
        {
            let mut state = store.state();
            state.responded.insert(source_id.clone());
            if !table.is_empty() {
                state.tables.insert(source_id, Arc::new(table));
            }
        }
        Ok(store)
    }

    pub fn policy(&self) -> StorePolicy {
        self.policy
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies an ordered batch of operations reported by one source.
    ///
    /// `add` and `change` overwrite by key; `remove` of an absent key is a
    /// no-op. The source is marked as responded even when the batch is
    /// rejected.
    ///
    /// # Errors
    /// - `InvalidSourceId` for a blank source id.
    /// - `OrdinalStore` when the store is position-keyed.
    /// - `KeyDerivation` under `BatchFailurePolicy::Atomic` when any atom
    ///   cannot produce a key; in that case nothing is applied and the schema
    ///   stays unlearned.
    pub fn apply_batch(
        &self,
        source_id: &str,
        ops: &[AtomOperation],
    ) -> Result<BatchOutcome, MergeError> {
        let source_id = normalize_source_id(source_id)?;
        let mut state = self.state();
        if state.keying == Keying::Ordinal {
            return Err(MergeError::OrdinalStore(source_id));
        }
        state.responded.insert(source_id.clone());

        let schema = match &state.schema {
            Some(schema) => schema.clone(),
            None => match learn_schema(ops) {
                Some(schema) => schema,
                // Only removals against a store that has never held an atom.
                None if !ops.iter().any(|op| op.kind.is_upsert()) => {
                    return Ok(BatchOutcome::default())
                }
                // No valid upsert; planning rejects each one below.
                None => IdentifierSchema::default(),
            },
        };

        let mut planned: Vec<PlannedOp<'_>> = Vec::with_capacity(ops.len());
        let mut rejected = Vec::new();
        for (index, op) in ops.iter().enumerate() {
            match plan_operation(&schema, op) {
                Ok(key) => planned.push((op.kind, key, &op.atom)),
                Err(error) => match self.policy.batch_failure {
                    BatchFailurePolicy::Atomic => {
                        warn!(
                            "event=batch_rejected module=merge status=error source={} index={} op={}",
                            source_id,
                            index,
                            op.kind.as_str()
                        );
                        return Err(MergeError::KeyDerivation {
                            source_id,
                            index,
                            error,
                        });
                    }
                    BatchFailurePolicy::SkipInvalid => {
                        rejected.push(RejectedOperation { index, error });
                    }
                },
            }
        }

        if state.schema.is_none() && planned.iter().any(|(kind, _, _)| kind.is_upsert()) {
            debug!(
                "event=schema_fixed module=merge status=ok source={} identifiers={}",
                source_id,
                schema.len()
            );
            state.schema = Some(schema.clone());
        }

        let applied = planned.len();
        apply_planned(&mut state, &source_id, &schema, planned);
        let clear_exception = rejected.is_empty()
            && self.policy.exception_retention == ExceptionRetention::ClearOnUpdate;
        if clear_exception {
            state.exceptions.remove(source_id.as_str());
        }
        state.revision += 1;

        debug!(
            "event=batch_applied module=merge status=ok source={} applied={} rejected={} revision={}",
            source_id,
            applied,
            rejected.len(),
            state.revision
        );
        Ok(BatchOutcome { applied, rejected })
    }

    /// Records a processing failure reported by a source.
    ///
    /// Existing data for the source is left untouched.
    pub fn record_exception(&self, source_id: &str, message: &str) -> Result<(), MergeError> {
        let source_id = normalize_source_id(source_id)?;
        let mut state = self.state();
        state.responded.insert(source_id.clone());
        state.exceptions.insert(source_id.clone(), message.to_string());
        state.revision += 1;
        debug!(
            "event=exception_recorded module=merge status=ok source={} revision={}",
            source_id, state.revision
        );
        Ok(())
    }

    /// Takes one consistent copy of all tables and exceptions for lock-free
    /// iteration.
    ///
    /// With `include_source_tag`, every produced atom carries an extra
    /// identifier naming its source.
    pub fn snapshot_atoms(&self, include_source_tag: bool) -> AtomSnapshot {
        let state = self.state();
        AtomSnapshot::new(
            state.schema.clone().unwrap_or_default(),
            state
                .tables
                .iter()
                .map(|(source, table)| (source.clone(), Arc::clone(table)))
                .collect(),
            state.exceptions.clone(),
            include_source_tag,
            state.revision,
        )
    }

    /// Replaces keying, schema, tables and exceptions with another store's
    /// state.
    pub fn replace_all(&self, other: &MergeStore) {
        let incoming = other.export_state();
        let mut state = self.state();
        state.keying = incoming.keying;
        state.schema = incoming.schema;
        state.tables = incoming.tables;
        state.exceptions = incoming.exceptions;
        state.revision += 1;
    }

    /// Builds the serializable document under the lock; encoding happens
    /// after the lock is released.
    pub fn to_document(&self) -> StoreDocument {
        let state = self.state();
        let keying = state.keying;
        let schema = state.schema.clone();
        let sources = state
            .tables
            .iter()
            .map(|(source, table)| (source.clone(), Arc::clone(table)))
            .collect::<Vec<_>>();
        let exceptions = state.exceptions.clone();
        let responded = state.responded.clone();
        drop(state);

        let sources = sources
            .into_iter()
            .map(|(id, table)| SourceDocument {
                id,
                atoms: table.values().cloned().collect(),
            })
            .collect();
        StoreDocument {
            keying,
            schema,
            exceptions,
            responded,
            sources,
        }
    }

    /// Deterministic textual projection of sources, atoms and exceptions.
    pub fn serialize(&self) -> Result<String, MergeError> {
        serde_json::to_string(&self.to_document())
            .map_err(|err| MergeError::Document(err.to_string()))
    }

    /// Streams the projection produced by [`MergeStore::serialize`].
    pub fn serialize_to<W: Write>(&self, writer: W) -> Result<(), MergeError> {
        serde_json::to_writer(writer, &self.to_document())
            .map_err(|err| MergeError::Document(err.to_string()))
    }

    /// Rebuilds a store from [`MergeStore::serialize`] output.
    pub fn from_document(raw: &str, policy: StorePolicy) -> Result<Self, MergeError> {
        let document: StoreDocument =
            serde_json::from_str(raw).map_err(|err| MergeError::Document(err.to_string()))?;
        let mut state = StoreState {
            keying: document.keying,
            schema: document.schema,
            responded: document.responded,
            ..StoreState::default()
        };
        for source in document.sources {
            let source_id = normalize_source_id(&source.id)?;
            let table = match state.keying {
                Keying::Ordinal => ordinal_table(&source_id, source.atoms)?,
                Keying::Schema => {
                    if state.schema.is_none() {
                        state.schema = source.atoms.first().map(IdentifierSchema::from_atom);
                    }
                    let schema = state.schema.clone().unwrap_or_default();
                    keyed_table(&schema, &source_id, source.atoms)?
                }
            };
            if !table.is_empty() {
                state.tables.insert(source_id.clone(), Arc::new(table));
            }
            state.responded.insert(source_id);
        }
        for (source_id, message) in document.exceptions {
            let source_id = normalize_source_id(&source_id)?;
            state.responded.insert(source_id.clone());
            state.exceptions.insert(source_id, message);
        }
        Ok(Self {
            policy,
            state: Mutex::new(state),
        })
    }

    /// Source ids that have sent data or an exception.
    pub fn responding_sources(&self) -> BTreeSet<String> {
        self.state().responded.clone()
    }

    pub fn exception_map(&self) -> BTreeMap<String, String> {
        self.state().exceptions.clone()
    }

    pub fn has_exceptions(&self) -> bool {
        !self.state().exceptions.is_empty()
    }

    /// Exception messages in source-id order, each followed by a separator.
    pub fn exception_summary(&self) -> String {
        let exceptions = self.exception_map();
        let mut summary = String::new();
        for message in exceptions.values() {
            summary.push_str(message);
            summary.push_str(EXCEPTION_SEPARATOR);
        }
        summary
    }

    pub fn schema(&self) -> Option<IdentifierSchema> {
        self.state().schema.clone()
    }

    pub fn keying(&self) -> Keying {
        self.state().keying
    }

    /// Monotonic mutation counter.
    pub fn revision(&self) -> u64 {
        self.state().revision
    }

    pub fn atom_count(&self) -> usize {
        self.state().tables.values().map(|table| table.len()).sum()
    }

    fn export_state(&self) -> StoreState {
        self.state().clone()
    }
}

const EXCEPTION_SEPARATOR: &str = "\n-----------------------------\n";

fn normalize_source_id(source_id: &str) -> Result<String, MergeError> {
    let trimmed = source_id.trim();
    if trimmed.is_empty() {
        return Err(MergeError::InvalidSourceId(source_id.to_string()));
    }
    Ok(trimmed.to_string())
}

/// First valid upsert atom defines the schema of a fresh store.
fn learn_schema(ops: &[AtomOperation]) -> Option<IdentifierSchema> {
    ops.iter()
        .filter(|op| op.kind.is_upsert())
        .find(|op| op.atom.validate().is_ok())
        .map(|op| IdentifierSchema::from_atom(&op.atom))
}

fn plan_operation(schema: &IdentifierSchema, op: &AtomOperation) -> Result<CompoundKey, AtomError> {
    if op.kind.is_upsert() {
        op.atom.validate()?;
    }
    schema.derive_key(&op.atom)
}

fn apply_planned(
    state: &mut StoreState,
    source_id: &str,
    schema: &IdentifierSchema,
    planned: Vec<PlannedOp<'_>>,
) {
    for (kind, key, atom) in planned {
        if kind.is_upsert() {
            let stored = schema.assemble(&key, &atom.values);
            let table = state.tables.entry(source_id.to_string()).or_default();
            Arc::make_mut(table).insert(key, stored);
        } else if let Some(table) = state.tables.get_mut(source_id) {
            if table.contains_key(&key) {
                Arc::make_mut(table).remove(&key);
            }
        }
    }
}

/// Table of schema-keyed atoms; a later atom with an equal key wins.
fn keyed_table(
    schema: &IdentifierSchema,
    source_id: &str,
    atoms: Vec<Atom>,
) -> Result<SourceTable, MergeError> {
    let mut table = SourceTable::new();
    for (index, atom) in atoms.into_iter().enumerate() {
        let key = atom
            .validate()
            .and_then(|()| schema.derive_key(&atom))
            .map_err(|error| key_error(source_id, index, error))?;
        let stored = schema.assemble(&key, &atom.values);
        table.insert(key, stored);
    }
    Ok(table)
}

/// Table holding `atoms` in list order, one entry per atom.
fn ordinal_table(source_id: &str, atoms: Vec<Atom>) -> Result<SourceTable, MergeError> {
    let mut table = SourceTable::new();
    for (index, atom) in atoms.into_iter().enumerate() {
        atom.validate()
            .map_err(|error| key_error(source_id, index, error))?;
        table.insert(ordinal_key(index), atom);
    }
    Ok(table)
}

/// Zero-padded so key order equals list order.
fn ordinal_key(index: usize) -> CompoundKey {
    CompoundKey::new(vec![format!("{index:020}")])
}

fn key_error(source_id: &str, index: usize, error: AtomError) -> MergeError {
    MergeError::KeyDerivation {
        source_id: source_id.to_string(),
        index,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::{AtomOperation, Keying, MergeError, MergeStore};
    use crate::config::{BatchFailurePolicy, ExceptionRetention, StorePolicy};
    use crate::model::atom::{Atom, AtomError};

    fn site(id: &str, load: &str) -> Atom {
        Atom::new()
            .with_identifier("siteId", id)
            .with_value("load", load)
    }

    #[test]
    fn upsert_overwrites_by_key() {
        let store = MergeStore::new();
        store
            .apply_batch("north", &[AtomOperation::add(site("A", "1"))])
            .expect("add");
        store
            .apply_batch("north", &[AtomOperation::change(site("A", "2"))])
            .expect("change");

        let atoms = store.snapshot_atoms(false).to_vec();
        assert_eq!(atoms, vec![site("A", "2")]);
    }

    #[test]
    fn later_operations_observe_earlier_ones() {
        let store = MergeStore::new();
        let outcome = store
            .apply_batch(
                "north",
                &[
                    AtomOperation::add(site("A", "1")),
                    AtomOperation::remove(Atom::new().with_identifier("siteId", "A")),
                    AtomOperation::add(site("B", "4")),
                ],
            )
            .expect("batch");
        assert_eq!(outcome.applied, 3);
        assert_eq!(store.snapshot_atoms(false).to_vec(), vec![site("B", "4")]);
    }

    #[test]
    fn atomic_policy_rejects_whole_batch() {
        let store = MergeStore::new();
        let err = store
            .apply_batch(
                "north",
                &[
                    AtomOperation::add(site("A", "1")),
                    AtomOperation::add(Atom::new().with_value("load", "9")),
                ],
            )
            .expect_err("second atom has no siteId");
        assert!(matches!(
            err,
            MergeError::KeyDerivation {
                index: 1,
                error: AtomError::MissingIdentifier(_),
                ..
            }
        ));
        assert_eq!(store.atom_count(), 0);
        assert!(store.schema().is_none());
        assert!(store.responding_sources().contains("north"));
    }

    #[test]
    fn skip_invalid_policy_applies_valid_operations() {
        let store = MergeStore::with_policy(StorePolicy {
            batch_failure: BatchFailurePolicy::SkipInvalid,
            ..StorePolicy::default()
        });
        let outcome = store
            .apply_batch(
                "north",
                &[
                    AtomOperation::add(site("A", "1")),
                    AtomOperation::add(Atom::new().with_value("load", "9")),
                    AtomOperation::add(site("B", "2")),
                ],
            )
            .expect("batch");
        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].index, 1);
        assert_eq!(store.atom_count(), 2);
    }

    #[test]
    fn exception_retention_policies() {
        let retaining = MergeStore::new();
        retaining.record_exception("north", "timeout").unwrap();
        retaining
            .apply_batch("north", &[AtomOperation::add(site("A", "1"))])
            .unwrap();
        assert!(retaining.has_exceptions());

        let clearing = MergeStore::with_policy(StorePolicy {
            exception_retention: ExceptionRetention::ClearOnUpdate,
            ..StorePolicy::default()
        });
        clearing.record_exception("north", "timeout").unwrap();
        clearing
            .apply_batch("north", &[AtomOperation::add(site("A", "1"))])
            .unwrap();
        assert!(!clearing.has_exceptions());
    }

    #[test]
    fn removals_before_any_schema_are_noops() {
        let store = MergeStore::new();
        let outcome = store
            .apply_batch("north", &[AtomOperation::remove(site("A", "1"))])
            .expect("remove on empty store");
        assert_eq!(outcome.applied, 0);
        assert!(store.schema().is_none());
        assert!(store.responding_sources().contains("north"));
    }

    #[test]
    fn invalid_first_batch_is_rejected_without_fixing_schema() {
        let store = MergeStore::new();
        let err = store
            .apply_batch(
                "north",
                &[AtomOperation::add(Atom::new().with_identifier(" ", "x"))],
            )
            .expect_err("blank field name");
        assert!(matches!(
            err,
            MergeError::KeyDerivation {
                error: AtomError::EmptyFieldName,
                ..
            }
        ));
        assert!(store.schema().is_none());
    }

    #[test]
    fn rejects_blank_source_id() {
        let store = MergeStore::new();
        let err = store.record_exception("  ", "boom").unwrap_err();
        assert!(matches!(err, MergeError::InvalidSourceId(_)));
    }

    #[test]
    fn exception_summary_lists_messages_in_source_order() {
        let store = MergeStore::new();
        store.record_exception("south", "disk full").unwrap();
        store.record_exception("north", "timeout").unwrap();
        let summary = store.exception_summary();
        let north = summary.find("timeout").expect("north message");
        let south = summary.find("disk full").expect("south message");
        assert!(north < south);
    }

    #[test]
    fn revision_advances_on_every_mutation() {
        let store = MergeStore::new();
        assert_eq!(store.revision(), 0);
        store
            .apply_batch("north", &[AtomOperation::add(site("A", "1"))])
            .unwrap();
        store.record_exception("south", "timeout").unwrap();
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn ordinal_store_keeps_every_atom_in_order() {
        let atoms = vec![
            site("A", "1"),
            site("A", "2"),
            Atom::new()
                .with_identifier("region", "eu")
                .with_value("n", "2"),
        ];
        let store =
            MergeStore::from_ordered_atoms(StorePolicy::default(), "aggregate", atoms.clone())
                .expect("ordered store");
        assert_eq!(store.keying(), Keying::Ordinal);
        assert!(store.schema().is_none());
        assert_eq!(store.snapshot_atoms(false).to_vec(), atoms);

        let err = store
            .apply_batch("north", &[AtomOperation::add(site("B", "1"))])
            .expect_err("ordered stores take no batches");
        assert_eq!(err, MergeError::OrdinalStore("north".into()));
    }

    #[test]
    fn ordinal_order_survives_more_than_ten_atoms() {
        let atoms = (0..12)
            .map(|index| site("A", &index.to_string()))
            .collect::<Vec<_>>();
        let store =
            MergeStore::from_ordered_atoms(StorePolicy::default(), "aggregate", atoms.clone())
                .expect("ordered store");
        assert_eq!(store.snapshot_atoms(false).to_vec(), atoms);
    }

    #[test]
    fn replace_all_adopts_keying() {
        let derived = MergeStore::new();
        let fresh = MergeStore::from_ordered_atoms(
            StorePolicy::default(),
            "aggregate",
            vec![site("A", "1"), site("A", "2")],
        )
        .expect("ordered store");
        derived.replace_all(&fresh);
        assert_eq!(derived.keying(), Keying::Ordinal);
        assert_eq!(derived.atom_count(), 2);
    }

    #[test]
    fn snapshot_carries_exceptions_of_the_same_revision() {
        let store = MergeStore::new();
        store.record_exception("north", "timeout").unwrap();
        let snapshot = store.snapshot_atoms(false);
        store.record_exception("south", "disk full").unwrap();

        assert_eq!(snapshot.exceptions().len(), 1);
        assert_eq!(
            snapshot.exceptions().get("north").map(String::as_str),
            Some("timeout")
        );
        assert_eq!(store.exception_map().len(), 2);
    }
}
