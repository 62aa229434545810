//! Serialized merge-store document.
//!
//! JSON encoding escapes quote, backslash and control characters in field
//! values, so any reported text survives a round trip.

use crate::model::atom::{Atom, IdentifierSchema};
use crate::store::merge_store::Keying;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Projection of one merge store: schema, atoms per source, exceptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub keying: Keying,
    #[serde(default)]
    pub schema: Option<IdentifierSchema>,
    /// Recorded exception message per source id.
    #[serde(default)]
    pub exceptions: BTreeMap<String, String>,
    /// Every source that sent data or an exception, including those that
    /// left nothing behind.
    #[serde(default)]
    pub responded: BTreeSet<String>,
    /// Sources in id order.
    #[serde(default)]
    pub sources: Vec<SourceDocument>,
}

/// Current atoms of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    #[serde(default)]
    pub atoms: Vec<Atom>,
}
