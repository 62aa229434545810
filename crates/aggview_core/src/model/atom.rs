//! Atom, identifier schema and compound key.
//!
//! # Responsibility
//! - Define the canonical record shape reported by every source.
//! - Split an atom into identifier fields (keying) and value fields (payload).
//! - Derive deterministic compound keys from an atom and a schema.
//!
//! # Invariants
//! - Field names are non-empty and never appear in both field groups.
//! - Key derivation fails when a schema-declared identifier is absent.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Identifier name added to snapshot atoms to carry their source id.
pub const SOURCE_TAG_FIELD: &str = "cluster";

/// Ordered string-valued field mapping.
pub type FieldMap = IndexMap<String, String>;

/// One flat record reported by a source.
///
/// Equality ignores field order; identifier and value groups are compared
/// separately.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
    /// Fields used for keying once a schema is fixed.
    #[serde(default)]
    pub identifiers: FieldMap,
    /// Carried payload fields.
    #[serde(default)]
    pub values: FieldMap,
}

impl Atom {
    /// Creates an empty atom.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style identifier insertion.
    pub fn with_identifier(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.identifiers.insert(name.into(), value.into());
        self
    }

    /// Builder-style value insertion.
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Inserts or replaces one identifier field.
    pub fn set_identifier(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.identifiers.insert(name.into(), value.into());
    }

    /// Inserts or replaces one value field.
    pub fn set_value(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn identifier(&self, name: &str) -> Option<&str> {
        self.identifiers.get(name).map(String::as_str)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Looks a field up among identifiers first, then among values.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.identifier(name).or_else(|| self.value(name))
    }

    /// Identifier names in insertion order.
    pub fn identifier_names(&self) -> impl Iterator<Item = &str> {
        self.identifiers.keys().map(String::as_str)
    }

    /// Validates field-name invariants.
    ///
    /// # Errors
    /// - `EmptyFieldName` when any field name is blank.
    /// - `DuplicateField` when a name is both identifier and value.
    pub fn validate(&self) -> Result<(), AtomError> {
        for name in self.identifiers.keys().chain(self.values.keys()) {
            if name.trim().is_empty() {
                return Err(AtomError::EmptyFieldName);
            }
        }
        if let Some(name) = self
            .identifiers
            .keys()
            .find(|name| self.values.contains_key(name.as_str()))
        {
            return Err(AtomError::DuplicateField(name.clone()));
        }
        Ok(())
    }
}

/// Ordered identifier-field names learned from the first merged atom.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentifierSchema {
    names: Vec<String>,
}

impl IdentifierSchema {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Learns the schema from an atom's identifier names.
    pub fn from_atom(atom: &Atom) -> Self {
        Self::new(atom.identifier_names().map(str::to_string).collect())
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Projects an atom onto this schema.
    ///
    /// # Errors
    /// - `MissingIdentifier` when a declared identifier is absent from the
    ///   atom's identifier fields.
    pub fn derive_key(&self, atom: &Atom) -> Result<CompoundKey, AtomError> {
        self.names
            .iter()
            .map(|name| {
                atom.identifier(name)
                    .map(str::to_string)
                    .ok_or_else(|| AtomError::MissingIdentifier(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(CompoundKey)
    }

    /// Rebuilds a full atom from a stored key and its value fields.
    pub fn assemble(&self, key: &CompoundKey, values: &FieldMap) -> Atom {
        let identifiers = self
            .names
            .iter()
            .cloned()
            .zip(key.parts().iter().cloned())
            .collect();
        Atom {
            identifiers,
            values: values.clone(),
        }
    }
}

/// Identifier values of one atom, in schema order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompoundKey(Vec<String>);

impl CompoundKey {
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

/// Atom shape and key-derivation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomError {
    EmptyFieldName,
    DuplicateField(String),
    MissingIdentifier(String),
}

impl Display for AtomError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyFieldName => write!(f, "atom field name must not be empty"),
            Self::DuplicateField(name) => {
                write!(f, "atom field is both identifier and value: {name}")
            }
            Self::MissingIdentifier(name) => {
                write!(f, "atom is missing schema identifier field: {name}")
            }
        }
    }
}

impl Error for AtomError {}

#[cfg(test)]
mod tests {
    use super::{Atom, AtomError, CompoundKey, IdentifierSchema};

    fn site(id: &str, load: &str) -> Atom {
        Atom::new()
            .with_identifier("siteId", id)
            .with_value("load", load)
    }

    #[test]
    fn schema_follows_identifier_order() {
        let atom = Atom::new()
            .with_identifier("region", "eu")
            .with_identifier("siteId", "A");
        let schema = IdentifierSchema::from_atom(&atom);
        assert_eq!(schema.names(), ["region", "siteId"]);

        let key = schema.derive_key(&atom).expect("key derivation");
        assert_eq!(key, CompoundKey::new(vec!["eu".into(), "A".into()]));
    }

    #[test]
    fn derive_key_rejects_missing_identifier() {
        let schema = IdentifierSchema::new(vec!["siteId".into(), "rack".into()]);
        let err = schema
            .derive_key(&site("A", "1"))
            .expect_err("rack is missing");
        assert_eq!(err, AtomError::MissingIdentifier("rack".into()));
    }

    #[test]
    fn derive_key_ignores_value_fields_with_identifier_names() {
        let schema = IdentifierSchema::new(vec!["load".into()]);
        let err = schema.derive_key(&site("A", "1")).unwrap_err();
        assert!(matches!(err, AtomError::MissingIdentifier(_)));
    }

    #[test]
    fn assemble_restores_atom() {
        let atom = site("B", "7");
        let schema = IdentifierSchema::from_atom(&atom);
        let key = schema.derive_key(&atom).unwrap();
        assert_eq!(schema.assemble(&key, &atom.values), atom);
    }

    #[test]
    fn validate_rejects_overlapping_fields() {
        let atom = site("A", "1").with_value("siteId", "B");
        assert_eq!(
            atom.validate().unwrap_err(),
            AtomError::DuplicateField("siteId".into())
        );
        let blank = Atom::new().with_identifier(" ", "x");
        assert_eq!(blank.validate().unwrap_err(), AtomError::EmptyFieldName);
    }

    #[test]
    fn field_prefers_identifiers() {
        let atom = site("A", "3");
        assert_eq!(atom.field("siteId"), Some("A"));
        assert_eq!(atom.field("load"), Some("3"));
        assert_eq!(atom.field("missing"), None);
    }
}
