//! In-process query registry.
//!
//! Routes source results to the orchestrator of the query they answer.

use crate::behavior::resolver::BehaviorResolver;
use crate::config::{EngineConfig, StorePolicy};
use crate::query::definition::{is_valid_query_id, Query};
use crate::query::error::QueryError;
use crate::query::orchestrator::QueryOrchestrator;
use crate::store::{AtomOperation, BatchOutcome};
use log::info;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Registered queries keyed by id.
#[derive(Debug)]
pub struct QueryRegistry {
    resolver: Arc<BehaviorResolver>,
    policy: StorePolicy,
    queries: RwLock<BTreeMap<String, Arc<QueryOrchestrator>>>,
}

impl QueryRegistry {
    pub fn new(resolver: Arc<BehaviorResolver>, policy: StorePolicy) -> Self {
        Self {
            resolver,
            policy,
            queries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &EngineConfig, resolver: Arc<BehaviorResolver>) -> Self {
        Self::new(resolver, config.store)
    }

    pub fn resolver(&self) -> &BehaviorResolver {
        &self.resolver
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<QueryOrchestrator>>> {
        self.queries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<QueryOrchestrator>>> {
        self.queries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the orchestrator for `query` and registers it.
    ///
    /// # Errors
    /// - `InvalidId` / `DuplicateQuery` for a bad or taken id.
    /// - `Resolve` when the aggregation spec fails to resolve.
    pub fn register(&self, query: Query) -> Result<Arc<QueryOrchestrator>, QueryError> {
        let query_id = query.id().to_string();
        if !is_valid_query_id(&query_id) {
            return Err(QueryError::InvalidId(query_id));
        }
        if self.read().contains_key(&query_id) {
            return Err(QueryError::DuplicateQuery(query_id));
        }

        let orchestrator = Arc::new(QueryOrchestrator::new(query, &self.resolver, self.policy)?);
        let mut queries = self.write();
        if queries.contains_key(&query_id) {
            return Err(QueryError::DuplicateQuery(query_id));
        }
        queries.insert(query_id.clone(), Arc::clone(&orchestrator));
        drop(queries);

        info!(
            "event=query_registered module=query status=ok query_id={} aggregating={} sources={}",
            query_id,
            orchestrator.has_aggregator(),
            orchestrator.query().sources().len()
        );
        Ok(orchestrator)
    }

    /// Drops a query and detaches its alerts; absent ids are a no-op.
    pub fn unregister(&self, query_id: &str) -> Option<Arc<QueryOrchestrator>> {
        let removed = self.write().remove(query_id.trim())?;
        removed.detach_all_alerts();
        info!(
            "event=query_unregistered module=query status=ok query_id={}",
            removed.id()
        );
        Some(removed)
    }

    pub fn get(&self, query_id: &str) -> Option<Arc<QueryOrchestrator>> {
        self.read().get(query_id.trim()).cloned()
    }

    /// Returns sorted query ids.
    pub fn query_ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Routes one source batch to its query.
    pub fn update_results(
        &self,
        query_id: &str,
        source_id: &str,
        ops: &[AtomOperation],
    ) -> Result<BatchOutcome, QueryError> {
        self.require(query_id)?.update_results(source_id, ops)
    }

    /// Routes one source exception to its query.
    pub fn record_exception(
        &self,
        query_id: &str,
        source_id: &str,
        message: &str,
    ) -> Result<(), QueryError> {
        self.require(query_id)?.record_exception(source_id, message)
    }

    // The map lock is released before the orchestrator runs.
    fn require(&self, query_id: &str) -> Result<Arc<QueryOrchestrator>, QueryError> {
        self.get(query_id)
            .ok_or_else(|| QueryError::QueryNotFound(query_id.trim().to_string()))
    }
}
