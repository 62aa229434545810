//! Query definition.

use crate::behavior::capability::AtomPredicate;
use crate::behavior::resolver::{BehaviorResolver, ResolveResult};
use crate::behavior::spec::BehaviorSpec;
use crate::query::error::QueryError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Immutable description of one distributed query.
///
/// `predicate` travels to the sources; `aggregation`, when present, derives
/// the client-facing view from the merged results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    id: String,
    name: String,
    predicate: BehaviorSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aggregation: Option<BehaviorSpec>,
    /// Source ids the query was dispatched to.
    #[serde(default)]
    sources: Vec<String>,
}

impl Query {
    /// Creates a query with a generated id.
    pub fn new(name: impl Into<String>, predicate: BehaviorSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            predicate,
            aggregation: None,
            sources: Vec::new(),
        }
    }

    /// Creates a query under a caller-chosen id.
    pub fn with_id(
        id: &str,
        name: impl Into<String>,
        predicate: BehaviorSpec,
    ) -> Result<Self, QueryError> {
        let id = id.trim();
        if !is_valid_query_id(id) {
            return Err(QueryError::InvalidId(id.to_string()));
        }
        let mut query = Self::new(name, predicate);
        query.id = id.to_string();
        Ok(query)
    }

    pub fn with_aggregation(mut self, aggregation: BehaviorSpec) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn predicate(&self) -> &BehaviorSpec {
        &self.predicate
    }

    pub fn aggregation(&self) -> Option<&BehaviorSpec> {
        self.aggregation.as_ref()
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Resolves the source-side filter.
    pub fn resolve_predicate(
        &self,
        resolver: &BehaviorResolver,
    ) -> ResolveResult<Arc<dyn AtomPredicate>> {
        resolver.resolve_predicate(&self.predicate)
    }
}

pub(crate) fn is_valid_query_id(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    value.chars().all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' || c == '.'
    })
}
