//! Declarative behavior spec document.
//!
//! # Responsibility
//! - Describe which behavior to build, by which back-end, from which source.
//! - Round-trip through JSON without loss.
//!
//! # Invariants
//! - Unrecognized implementation kinds are preserved verbatim so they can
//!   be resolved to "absent" instead of failing to decode.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

static COLLATION_SEPARATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ ,;\t\r\n]+").expect("valid collation separator regex"));

/// Capability a spec asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorKind {
    Predicate,
    Encoder,
    Alert,
    Aggregator,
}

impl BehaviorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Predicate => "predicate",
            Self::Encoder => "encoder",
            Self::Alert => "alert",
            Self::Aggregator => "aggregator",
        }
    }
}

impl Display for BehaviorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Back-end family selected by a spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ImplementationKind {
    Native,
    Scripted,
    /// Kind written by a newer producer; resolves to absent.
    Other(String),
}

impl ImplementationKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Native => "native",
            Self::Scripted => "scripted",
            Self::Other(value) => value.as_str(),
        }
    }
}

impl From<String> for ImplementationKind {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "native" => Self::Native,
            "scripted" => Self::Scripted,
            _ => Self::Other(value),
        }
    }
}

impl From<ImplementationKind> for String {
    fn from(value: ImplementationKind) -> Self {
        value.as_str().to_string()
    }
}

/// How an aggregator spec's source is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Source yields an aggregator outright.
    #[default]
    Direct,
    /// Source yields a melder folded per collation-id partition.
    Melder,
}

/// Declarative description of one behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorSpec {
    pub kind: BehaviorKind,
    pub implementation: ImplementationKind,
    /// Script dialect tag; only meaningful for scripted specs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AggregationStrategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collation_ids: Vec<String>,
    /// Script text, or the registered name of a native implementation.
    pub source: String,
    /// Named configuration applied to native implementations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl BehaviorSpec {
    fn base(kind: BehaviorKind, implementation: ImplementationKind, source: String) -> Self {
        Self {
            kind,
            implementation,
            dialect: None,
            aggregation: None,
            collation_ids: Vec::new(),
            source,
            params: BTreeMap::new(),
        }
    }

    /// Spec resolved through the native registry by `name`.
    pub fn native(kind: BehaviorKind, name: impl Into<String>) -> Self {
        Self::base(kind, ImplementationKind::Native, name.into())
    }

    /// Spec evaluated by the script host registered for `dialect`.
    pub fn scripted(kind: BehaviorKind, dialect: impl Into<String>, source: impl Into<String>) -> Self {
        let mut spec = Self::base(kind, ImplementationKind::Scripted, source.into());
        spec.dialect = Some(dialect.into());
        spec
    }

    /// Native aggregator yielding an aggregator outright.
    pub fn native_aggregator(name: impl Into<String>) -> Self {
        let mut spec = Self::native(BehaviorKind::Aggregator, name);
        spec.aggregation = Some(AggregationStrategy::Direct);
        spec
    }

    /// Native melder partitioned by `collation_ids`.
    pub fn native_melder<I, S>(name: impl Into<String>, collation_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = Self::native(BehaviorKind::Aggregator, name);
        spec.aggregation = Some(AggregationStrategy::Melder);
        spec.collation_ids = collation_ids.into_iter().map(Into::into).collect();
        spec
    }

    /// Scripted aggregator; `strategy` picks what the script yields.
    pub fn scripted_aggregator(
        dialect: impl Into<String>,
        source: impl Into<String>,
        strategy: AggregationStrategy,
        collation_ids: &str,
    ) -> Self {
        let mut spec = Self::scripted(BehaviorKind::Aggregator, dialect, source);
        spec.aggregation = Some(strategy);
        spec.collation_ids = parse_collation_ids(collation_ids);
        spec
    }

    /// Builder-style parameter insertion.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Strategy of an aggregator spec; `direct` when unspecified.
    pub fn aggregation_strategy(&self) -> AggregationStrategy {
        self.aggregation.unwrap_or_default()
    }

    /// Collation ids joined with single spaces.
    pub fn collation_id_string(&self) -> String {
        self.collation_ids.join(" ")
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Splits a delimited collation-id string on spaces, commas, semicolons,
/// tabs and line breaks.
pub fn parse_collation_ids(raw: &str) -> Vec<String> {
    COLLATION_SEPARATOR_RE
        .split(raw)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
