//! Built-in native implementations.
//!
//! Installed by [`NativeRegistry::with_builtins`]. Parameters are read by
//! name; see each factory for the accepted set.

use crate::aggregate::{Aggregator, Melder};
use crate::behavior::capability::{AtomPredicate, BehaviorError, BehaviorHandle, ViewEncoder};
use crate::behavior::native::{NativeFactory, NativeParams, NativeRegistry};
use crate::behavior::resolver::ResolveError;
use crate::model::atom::Atom;
use crate::query::alert::Alert;
use crate::store::MergeStore;
use indexmap::IndexMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

pub const ALWAYS_PREDICATE: &str = "builtin.predicate.always";
pub const FIELD_EQUALS_PREDICATE: &str = "builtin.predicate.field_equals";
pub const JSON_ENCODER: &str = "builtin.encoder.json";
pub const THRESHOLD_ALERT: &str = "builtin.alert.threshold";
pub const COUNT_AGGREGATOR: &str = "builtin.aggregator.count";
pub const SUM_MELDER: &str = "builtin.melder.sum";

const DEFAULT_COUNT_LABEL: &str = "count";

pub(crate) fn install(registry: &mut NativeRegistry) {
    registry.insert(
        ALWAYS_PREDICATE,
        factory(|_| Ok(BehaviorHandle::Predicate(Arc::new(AlwaysPredicate)))),
    );
    registry.insert(
        FIELD_EQUALS_PREDICATE,
        factory(|params| {
            Ok(BehaviorHandle::Predicate(Arc::new(FieldEqualsPredicate {
                field: params.required("field")?,
                value: params.required("value")?,
            })))
        }),
    );
    registry.insert(
        JSON_ENCODER,
        factory(|params| {
            let pretty = params.parsed::<bool>("pretty")?.unwrap_or(false);
            Ok(BehaviorHandle::Encoder(Arc::new(JsonEncoder { pretty })))
        }),
    );
    registry.insert(
        THRESHOLD_ALERT,
        factory(|params| {
            let field = params.required("field")?;
            let threshold = params.required_parsed::<f64>("threshold")?;
            if !threshold.is_finite() {
                return Err(params.invalid("threshold", "must be finite"));
            }
            let direction = params
                .parsed::<ThresholdDirection>("direction")?
                .unwrap_or_default();
            Ok(BehaviorHandle::Alert(Arc::new(ThresholdAlert {
                field,
                threshold,
                direction,
            })))
        }),
    );
    registry.insert(
        COUNT_AGGREGATOR,
        factory(|params| {
            let label = params
                .optional("label")
                .unwrap_or_else(|| DEFAULT_COUNT_LABEL.to_string());
            if label.trim().is_empty() {
                return Err(params.invalid("label", "must not be blank"));
            }
            Ok(BehaviorHandle::Aggregator(Arc::new(CountAggregator { label })))
        }),
    );
    registry.insert(
        SUM_MELDER,
        factory(|params| {
            Ok(BehaviorHandle::Melder(Arc::new(SumMelder {
                field: params.required("field")?,
            })))
        }),
    );
}

fn factory<F>(build: F) -> NativeFactory
where
    F: Fn(&mut NativeParams) -> Result<BehaviorHandle, ResolveError> + Send + Sync + 'static,
{
    Arc::new(build)
}

/// Accepts every atom.
#[derive(Debug, Clone, Copy)]
pub struct AlwaysPredicate;

impl AtomPredicate for AlwaysPredicate {
    fn matches(&self, _atom: &Atom) -> Result<bool, BehaviorError> {
        Ok(true)
    }
}

/// Accepts atoms whose `field` (identifier or value) equals `value`.
#[derive(Debug, Clone)]
pub struct FieldEqualsPredicate {
    pub field: String,
    pub value: String,
}

impl AtomPredicate for FieldEqualsPredicate {
    fn matches(&self, atom: &Atom) -> Result<bool, BehaviorError> {
        Ok(atom.field(&self.field) == Some(self.value.as_str()))
    }
}

/// Encodes atoms as a JSON array.
#[derive(Debug, Clone, Copy)]
pub struct JsonEncoder {
    pub pretty: bool,
}

impl ViewEncoder for JsonEncoder {
    fn encode(&self, atoms: &[Atom]) -> Result<String, BehaviorError> {
        let encoded = if self.pretty {
            serde_json::to_string_pretty(atoms)
        } else {
            serde_json::to_string(atoms)
        };
        encoded.map_err(|err| BehaviorError::Failed(err.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThresholdDirection {
    #[default]
    Above,
    Below,
}

impl FromStr for ThresholdDirection {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "above" => Ok(Self::Above),
            "below" => Ok(Self::Below),
            other => Err(format!("expected `above` or `below`, got `{other}`")),
        }
    }
}

/// Fires while any atom's numeric `field` is strictly past `threshold`.
///
/// Atoms where the field is absent or not numeric are ignored.
#[derive(Debug, Clone)]
pub struct ThresholdAlert {
    pub field: String,
    pub threshold: f64,
    pub direction: ThresholdDirection,
}

impl Alert for ThresholdAlert {
    fn evaluate(&self, view: &MergeStore) -> Result<bool, BehaviorError> {
        let snapshot = view.snapshot_atoms(false);
        let triggered = snapshot.iter().any(|atom| {
            let Some(value) = atom.field(&self.field).and_then(|raw| raw.trim().parse::<f64>().ok())
            else {
                return false;
            };
            match self.direction {
                ThresholdDirection::Above => value > self.threshold,
                ThresholdDirection::Below => value < self.threshold,
            }
        });
        Ok(triggered)
    }
}

/// Emits one atom per distinct identifier set, carrying the group size
/// under `label`.
#[derive(Debug, Clone)]
pub struct CountAggregator {
    pub label: String,
}

impl Aggregator for CountAggregator {
    fn aggregate(&self, atoms: &[Atom]) -> Result<Vec<Atom>, BehaviorError> {
        let mut groups: IndexMap<Vec<(String, String)>, (Atom, u64)> = IndexMap::new();
        for atom in atoms {
            let key = atom
                .identifiers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect::<Vec<_>>();
            groups
                .entry(key)
                .or_insert_with(|| {
                    let mut group = Atom::new();
                    group.identifiers = atom.identifiers.clone();
                    (group, 0)
                })
                .1 += 1;
        }
        Ok(groups
            .into_values()
            .map(|(mut atom, count)| {
                atom.set_value(self.label.as_str(), count.to_string());
                atom
            })
            .collect())
    }
}

/// Sums a numeric `field`; every other field comes from the left atom.
#[derive(Debug, Clone)]
pub struct SumMelder {
    pub field: String,
}

impl Melder for SumMelder {
    fn meld(&self, left: &Atom, right: &Atom) -> Result<Atom, BehaviorError> {
        let total = Number::read(left, &self.field)?.plus(Number::read(right, &self.field)?);
        let mut merged = left.clone();
        if merged.identifiers.contains_key(self.field.as_str()) {
            merged.set_identifier(self.field.as_str(), total.to_string());
        } else {
            merged.set_value(self.field.as_str(), total.to_string());
        }
        Ok(merged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn read(atom: &Atom, field: &str) -> Result<Self, BehaviorError> {
        let raw = atom
            .field(field)
            .ok_or_else(|| BehaviorError::InvalidInput(format!("field `{field}` is missing")))?
            .trim();
        if let Ok(value) = raw.parse::<i64>() {
            return Ok(Self::Int(value));
        }
        match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(Self::Float(value)),
            _ => Err(BehaviorError::InvalidInput(format!(
                "field `{field}` is not numeric"
            ))),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Self::Int(value) => value as f64,
            Self::Float(value) => value,
        }
    }

    fn plus(self, other: Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_add(b)
                .map(Self::Int)
                .unwrap_or(Self::Float(a as f64 + b as f64)),
            (a, b) => Self::Float(a.as_f64() + b.as_f64()),
        }
    }
}

impl Display for Number {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
        }
    }
}
