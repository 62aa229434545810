//! Per-query merge store of source-keyed atoms.
//!
//! # Responsibility
//! - Keep one keyed table per responding source and apply ordered batches.
//! - Record per-source exception reports alongside the data.
//! - Hand out lock-free snapshots and deterministic serializations.
//!
//! # Invariants
//! - In a schema-keyed store every stored key conforms to the identifier
//!   schema; a position-keyed store holds an ordered list as given.
//! - The mutex is held only to mutate state or to copy it; consumers of
//!   snapshots and documents never run under it.

mod document;
mod merge_store;
mod snapshot;

pub use document::{SourceDocument, StoreDocument};
pub use merge_store::{
    AtomOperation, BatchOutcome, Keying, MergeError, MergeStore, OperationKind,
    RejectedOperation, SourceTable,
};
pub use snapshot::{AtomSnapshot, SnapshotIter};
