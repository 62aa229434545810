//! Runtime capability contracts and the handles that carry them.
//!
//! # Responsibility
//! - Define the predicate and encoder capabilities resolved from specs.
//! - Carry any produced behavior (ready instance or single-argument
//!   callable) between back-ends and the resolver.
//! - Adapt callables to the sole method of each capability.

use crate::aggregate::{Aggregator, Melder};
use crate::model::atom::Atom;
use crate::query::alert::Alert;
use crate::store::MergeStore;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

/// Source-side filter deciding which records feed a query.
pub trait AtomPredicate: Send + Sync {
    fn matches(&self, atom: &Atom) -> Result<bool, BehaviorError>;
}

/// Client-facing projection of a set of atoms.
pub trait ViewEncoder: Send + Sync {
    fn encode(&self, atoms: &[Atom]) -> Result<String, BehaviorError>;
}

impl Debug for dyn AtomPredicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("AtomPredicate")
    }
}

impl Debug for dyn ViewEncoder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("ViewEncoder")
    }
}

/// Value exchanged with a single-argument callable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptValue {
    Unit,
    Bool(bool),
    Text(String),
    Atom(Atom),
    Atoms(Vec<Atom>),
}

impl ScriptValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Bool(_) => "bool",
            Self::Text(_) => "text",
            Self::Atom(_) => "atom",
            Self::Atoms(_) => "atoms",
        }
    }
}

/// Single-argument callable produced by a back-end.
pub type ScriptFunction =
    Arc<dyn Fn(ScriptValue) -> Result<ScriptValue, BehaviorError> + Send + Sync>;

/// Product of a native factory or a script evaluation.
#[derive(Clone)]
pub enum BehaviorHandle {
    Predicate(Arc<dyn AtomPredicate>),
    Encoder(Arc<dyn ViewEncoder>),
    Alert(Arc<dyn Alert>),
    Aggregator(Arc<dyn Aggregator>),
    Melder(Arc<dyn Melder>),
    Function(ScriptFunction),
}

impl BehaviorHandle {
    /// Wraps a closure as a callable product.
    pub fn function<F>(function: F) -> Self
    where
        F: Fn(ScriptValue) -> Result<ScriptValue, BehaviorError> + Send + Sync + 'static,
    {
        Self::Function(Arc::new(function))
    }

    pub fn product_name(&self) -> &'static str {
        match self {
            Self::Predicate(_) => "predicate",
            Self::Encoder(_) => "encoder",
            Self::Alert(_) => "alert",
            Self::Aggregator(_) => "aggregator",
            Self::Melder(_) => "melder",
            Self::Function(_) => "function",
        }
    }

    pub(crate) fn into_predicate(self) -> Result<Arc<dyn AtomPredicate>, &'static str> {
        match self {
            Self::Predicate(predicate) => Ok(predicate),
            Self::Function(function) => Ok(Arc::new(FunctionPredicate(function))),
            other => Err(other.product_name()),
        }
    }

    pub(crate) fn into_encoder(self) -> Result<Arc<dyn ViewEncoder>, &'static str> {
        match self {
            Self::Encoder(encoder) => Ok(encoder),
            Self::Function(function) => Ok(Arc::new(FunctionEncoder(function))),
            other => Err(other.product_name()),
        }
    }

    pub(crate) fn into_alert(self) -> Result<Arc<dyn Alert>, &'static str> {
        match self {
            Self::Alert(alert) => Ok(alert),
            Self::Function(function) => Ok(Arc::new(FunctionAlert(function))),
            other => Err(other.product_name()),
        }
    }

    pub(crate) fn into_aggregator(self) -> Result<Arc<dyn Aggregator>, &'static str> {
        match self {
            Self::Aggregator(aggregator) => Ok(aggregator),
            Self::Function(function) => Ok(Arc::new(FunctionAggregator(function))),
            other => Err(other.product_name()),
        }
    }

    pub(crate) fn into_melder(self) -> Result<Arc<dyn Melder>, &'static str> {
        match self {
            Self::Melder(melder) => Ok(melder),
            Self::Function(function) => Ok(Arc::new(FunctionMelder(function))),
            other => Err(other.product_name()),
        }
    }
}

impl Debug for BehaviorHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BehaviorHandle::{}", self.product_name())
    }
}

/// Resolved behavior of whichever kind a spec declares.
#[derive(Clone)]
pub enum Behavior {
    Predicate(Arc<dyn AtomPredicate>),
    Encoder(Arc<dyn ViewEncoder>),
    Alert(Arc<dyn Alert>),
    Aggregator(Arc<dyn Aggregator>),
}

impl Debug for Behavior {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Predicate(_) => "predicate",
            Self::Encoder(_) => "encoder",
            Self::Alert(_) => "alert",
            Self::Aggregator(_) => "aggregator",
        };
        write!(f, "Behavior::{kind}")
    }
}

/// Failure raised while a resolved behavior runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BehaviorError {
    UnexpectedResult {
        expected: &'static str,
        produced: &'static str,
    },
    InvalidInput(String),
    Failed(String),
}

impl Display for BehaviorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedResult { expected, produced } => {
                write!(f, "callable returned {produced}, expected {expected}")
            }
            Self::InvalidInput(message) => write!(f, "invalid behavior input: {message}"),
            Self::Failed(message) => write!(f, "behavior failed: {message}"),
        }
    }
}

impl Error for BehaviorError {}

fn unexpected(expected: &'static str, produced: &ScriptValue) -> BehaviorError {
    BehaviorError::UnexpectedResult {
        expected,
        produced: produced.type_name(),
    }
}

struct FunctionPredicate(ScriptFunction);

impl AtomPredicate for FunctionPredicate {
    fn matches(&self, atom: &Atom) -> Result<bool, BehaviorError> {
        match (self.0)(ScriptValue::Atom(atom.clone()))? {
            ScriptValue::Bool(matched) => Ok(matched),
            other => Err(unexpected("bool", &other)),
        }
    }
}

struct FunctionEncoder(ScriptFunction);

impl ViewEncoder for FunctionEncoder {
    fn encode(&self, atoms: &[Atom]) -> Result<String, BehaviorError> {
        match (self.0)(ScriptValue::Atoms(atoms.to_vec()))? {
            ScriptValue::Text(text) => Ok(text),
            other => Err(unexpected("text", &other)),
        }
    }
}

struct FunctionAlert(ScriptFunction);

impl Alert for FunctionAlert {
    fn evaluate(&self, view: &MergeStore) -> Result<bool, BehaviorError> {
        let atoms = view.snapshot_atoms(false).to_vec();
        match (self.0)(ScriptValue::Atoms(atoms))? {
            ScriptValue::Bool(triggered) => Ok(triggered),
            other => Err(unexpected("bool", &other)),
        }
    }
}

struct FunctionAggregator(ScriptFunction);

impl Aggregator for FunctionAggregator {
    fn aggregate(&self, atoms: &[Atom]) -> Result<Vec<Atom>, BehaviorError> {
        match (self.0)(ScriptValue::Atoms(atoms.to_vec()))? {
            ScriptValue::Atoms(output) => Ok(output),
            ScriptValue::Atom(single) => Ok(vec![single]),
            ScriptValue::Unit => Ok(Vec::new()),
            other => Err(unexpected("atoms", &other)),
        }
    }
}

/// Melding callables receive both atoms as a two-element list.
struct FunctionMelder(ScriptFunction);

impl Melder for FunctionMelder {
    fn meld(&self, left: &Atom, right: &Atom) -> Result<Atom, BehaviorError> {
        match (self.0)(ScriptValue::Atoms(vec![left.clone(), right.clone()]))? {
            ScriptValue::Atom(merged) => Ok(merged),
            other => Err(unexpected("atom", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BehaviorError, BehaviorHandle, ScriptValue};
    use crate::model::atom::Atom;

    #[test]
    fn function_adapts_to_predicate() {
        let handle = BehaviorHandle::function(|value| match value {
            ScriptValue::Atom(atom) => Ok(ScriptValue::Bool(atom.field("siteId") == Some("A"))),
            other => Err(BehaviorError::InvalidInput(other.type_name().into())),
        });
        let predicate = handle.into_predicate().expect("function adapts");
        let a = Atom::new().with_identifier("siteId", "A");
        let b = Atom::new().with_identifier("siteId", "B");
        assert!(predicate.matches(&a).unwrap());
        assert!(!predicate.matches(&b).unwrap());
    }

    #[test]
    fn function_with_wrong_result_type_fails() {
        let handle = BehaviorHandle::function(|_| Ok(ScriptValue::Text("yes".into())));
        let predicate = handle.into_predicate().unwrap();
        let err = predicate.matches(&Atom::new()).unwrap_err();
        assert_eq!(
            err,
            BehaviorError::UnexpectedResult {
                expected: "bool",
                produced: "text"
            }
        );
    }

    #[test]
    fn function_melder_receives_both_atoms() {
        let handle = BehaviorHandle::function(|value| match value {
            ScriptValue::Atoms(mut pair) if pair.len() == 2 => Ok(ScriptValue::Atom(pair.remove(1))),
            other => Err(BehaviorError::InvalidInput(other.type_name().into())),
        });
        let melder = handle.into_melder().unwrap();
        let left = Atom::new().with_value("n", "1");
        let right = Atom::new().with_value("n", "2");
        assert_eq!(melder.meld(&left, &right).unwrap(), right);
    }

    #[test]
    fn typed_product_does_not_adapt_to_other_capability() {
        let handle = BehaviorHandle::function(|_| Ok(ScriptValue::Unit));
        let aggregator = handle.into_aggregator().unwrap();
        let err = BehaviorHandle::Aggregator(aggregator)
            .into_predicate()
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, "aggregator");
    }
}
