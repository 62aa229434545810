//! Per-query orchestrator.
//!
//! # Responsibility
//! - Own the raw merge store of one query and, when the query aggregates,
//!   the derived store that clients read.
//! - Recompute the derived view from a fresh snapshot after each raw
//!   mutation and notify attached alerts.
//!
//! # Invariants
//! - Alerts run with no store or registry lock held.
//! - A derived view is installed only when computed from a raw revision
//!   newer than the installed one.
//! - A failed recompute leaves the previous derived view in place and
//!   fires no notification.
//! - The derived view holds the aggregator's output list as produced,
//!   keyed by position, together with the exceptions of the same raw
//!   revision.

use crate::aggregate::Aggregator;
use crate::behavior::resolver::BehaviorResolver;
use crate::behavior::spec::{BehaviorKind, BehaviorSpec};
use crate::config::StorePolicy;
use crate::query::alert::{AlertDescriptor, AlertRegistry, AttachedAlert};
use crate::query::definition::Query;
use crate::query::error::QueryError;
use crate::store::{AtomOperation, BatchOutcome, MergeStore, StoreDocument};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Source id under which derived atoms are stored.
pub const DERIVED_SOURCE_ID: &str = "aggregate";

struct AggregationStage {
    aggregator: Arc<dyn Aggregator>,
    derived: MergeStore,
    /// Raw revision the installed view was computed from.
    installed_revision: Mutex<Option<u64>>,
}

/// Serialized form of a query and its active view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDocument {
    pub id: String,
    pub query: Query,
    pub view: StoreDocument,
    #[serde(default)]
    pub alerts: Vec<AlertDescriptor>,
}

/// Glue between one query, its merge store and its alerts.
pub struct QueryOrchestrator {
    query: Query,
    raw: MergeStore,
    aggregation: Option<AggregationStage>,
    alerts: AlertRegistry,
    notifications: AtomicU64,
}

impl QueryOrchestrator {
    /// Builds the orchestrator, resolving the query's aggregation spec.
    ///
    /// A spec naming an unavailable back-end leaves the query without
    /// aggregation.
    pub fn new(
        query: Query,
        resolver: &BehaviorResolver,
        policy: StorePolicy,
    ) -> Result<Self, QueryError> {
        let aggregator = match query.aggregation() {
            Some(spec) => {
                let resolved = resolver.resolve_aggregator(spec)?;
                if resolved.is_none() {
                    warn!(
                        "event=aggregation_unavailable module=query status=skipped query_id={} implementation={}",
                        query.id(),
                        spec.implementation.as_str()
                    );
                }
                resolved
            }
            None => None,
        };
        Ok(Self::with_aggregator(query, aggregator, policy))
    }

    /// Builds the orchestrator around an already resolved aggregator.
    pub fn with_aggregator(
        query: Query,
        aggregator: Option<Arc<dyn Aggregator>>,
        policy: StorePolicy,
    ) -> Self {
        let aggregation = aggregator.map(|aggregator| AggregationStage {
            aggregator,
            derived: MergeStore::ordinal(policy),
            installed_revision: Mutex::new(None),
        });
        Self {
            query,
            raw: MergeStore::with_policy(policy),
            aggregation,
            alerts: AlertRegistry::new(),
            notifications: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        self.query.id()
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn has_aggregator(&self) -> bool {
        self.aggregation.is_some()
    }

    /// Merged results exactly as the sources reported them.
    pub fn raw_view(&self) -> &MergeStore {
        &self.raw
    }

    /// The derived view when aggregating, the raw view otherwise.
    pub fn active_view(&self) -> &MergeStore {
        match &self.aggregation {
            Some(stage) => &stage.derived,
            None => &self.raw,
        }
    }

    /// Applies one source batch, recomputes and notifies.
    ///
    /// # Errors
    /// - `Merge` when the batch is rejected; nothing else happens.
    /// - `Aggregation` when the aggregator fails; the raw change stays
    ///   applied and no notification fires.
    pub fn update_results(
        &self,
        source_id: &str,
        ops: &[AtomOperation],
    ) -> Result<BatchOutcome, QueryError> {
        let outcome = self.raw.apply_batch(source_id, ops)?;
        self.after_raw_mutation()?;
        Ok(outcome)
    }

    /// Records a source failure, recomputes and notifies.
    pub fn record_exception(&self, source_id: &str, message: &str) -> Result<(), QueryError> {
        self.raw.record_exception(source_id, message)?;
        self.after_raw_mutation()
    }

    fn after_raw_mutation(&self) -> Result<(), QueryError> {
        self.recompute()?;
        self.notify();
        Ok(())
    }

    /// Rebuilds the derived view from the current raw state.
    ///
    /// No-op for queries without aggregation.
    pub fn recompute(&self) -> Result<(), QueryError> {
        let Some(stage) = &self.aggregation else {
            return Ok(());
        };

        let snapshot = self.raw.snapshot_atoms(false);
        let atoms = snapshot.to_vec();
        let derived_atoms = stage.aggregator.aggregate(&atoms).map_err(|err| {
            warn!(
                "event=aggregation_failed module=query status=error query_id={} revision={}",
                self.id(),
                snapshot.revision()
            );
            QueryError::Aggregation(err)
        })?;

        let fresh = MergeStore::from_ordered_atoms(
            stage.derived.policy(),
            DERIVED_SOURCE_ID,
            derived_atoms,
        )?;
        for (source_id, message) in snapshot.exceptions() {
            fresh.record_exception(source_id, message)?;
        }

        let mut installed = stage
            .installed_revision
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if installed.is_some_and(|revision| revision >= snapshot.revision()) {
            debug!(
                "event=derived_view_stale module=query status=skipped query_id={} revision={}",
                self.id(),
                snapshot.revision()
            );
            return Ok(());
        }
        stage.derived.replace_all(&fresh);
        *installed = Some(snapshot.revision());
        debug!(
            "event=derived_view_installed module=query status=ok query_id={} revision={} atoms={}",
            self.id(),
            snapshot.revision(),
            fresh.atom_count()
        );
        Ok(())
    }

    fn notify(&self) {
        self.notifications.fetch_add(1, Ordering::SeqCst);
        let view = self.active_view();
        for alert in self.alerts.snapshot() {
            alert.notify(self.id(), view);
        }
    }

    /// Number of change notifications dispatched so far.
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::SeqCst)
    }

    /// Dispatched sources that have neither sent data nor an exception.
    pub fn awaiting_sources(&self) -> Vec<String> {
        let responded = self.raw.responding_sources();
        self.query
            .sources()
            .iter()
            .filter(|source| !responded.contains(source.trim()))
            .cloned()
            .collect()
    }

    /// Attaches an alert; it is evaluated on the next change.
    pub fn attach_alert(&self, alert: AttachedAlert) -> Result<Arc<AttachedAlert>, QueryError> {
        let attached = self.alerts.add(alert)?;
        attached.on_attached(self.id());
        info!(
            "event=alert_attached module=query status=ok query_id={} alert={}",
            self.id(),
            attached.name()
        );
        Ok(attached)
    }

    /// Resolves `spec` and attaches the resulting alert under `name`.
    ///
    /// # Errors
    /// - `Unavailable` when the spec's back-end is not present.
    pub fn attach_alert_spec(
        &self,
        name: &str,
        spec: BehaviorSpec,
        resolver: &BehaviorResolver,
    ) -> Result<Arc<AttachedAlert>, QueryError> {
        let alert = resolver
            .resolve_alert(&spec)?
            .ok_or(QueryError::Unavailable(BehaviorKind::Alert))?;
        self.attach_alert(AttachedAlert::from_spec(name, spec, alert))
    }

    /// Detaches the alert named `name`; absent names are a no-op.
    pub fn detach_alert(&self, name: &str) -> Option<Arc<AttachedAlert>> {
        let detached = self.alerts.remove(name)?;
        detached.on_detached(self.id());
        info!(
            "event=alert_detached module=query status=ok query_id={} alert={}",
            self.id(),
            detached.name()
        );
        Some(detached)
    }

    pub(crate) fn detach_all_alerts(&self) {
        for alert in self.alerts.drain() {
            alert.on_detached(self.id());
        }
    }

    /// Attached alerts in dispatch order.
    pub fn alerts(&self) -> Vec<Arc<AttachedAlert>> {
        self.alerts.snapshot()
    }

    pub fn alert_descriptors(&self) -> Vec<AlertDescriptor> {
        self.alerts
            .snapshot()
            .iter()
            .map(|alert| alert.descriptor(self.id()))
            .collect()
    }

    pub fn to_document(&self) -> QueryDocument {
        QueryDocument {
            id: self.id().to_string(),
            query: self.query.clone(),
            view: self.active_view().to_document(),
            alerts: self.alert_descriptors(),
        }
    }

    pub fn serialize(&self) -> Result<String, QueryError> {
        serde_json::to_string(&self.to_document())
            .map_err(|err| QueryError::Document(err.to_string()))
    }
}

impl std::fmt::Debug for QueryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOrchestrator")
            .field("query", &self.query)
            .field("aggregating", &self.has_aggregator())
            .field("notifications", &self.notifications())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{QueryOrchestrator, DERIVED_SOURCE_ID};
    use crate::aggregate::Aggregator;
    use crate::behavior::capability::BehaviorError;
    use crate::behavior::resolver::BehaviorResolver;
    use crate::behavior::spec::{BehaviorKind, BehaviorSpec};
    use crate::config::StorePolicy;
    use crate::model::atom::Atom;
    use crate::query::definition::Query;
    use crate::query::error::QueryError;
    use crate::store::{AtomOperation, Keying};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn site(id: &str, load: &str) -> Atom {
        Atom::new()
            .with_identifier("siteId", id)
            .with_value("load", load)
    }

    fn query() -> Query {
        Query::new(
            "load",
            BehaviorSpec::native(BehaviorKind::Predicate, "builtin.predicate.always"),
        )
        .with_sources(["north", "south"])
    }

    /// Passes atoms through unless told to fail.
    #[derive(Default)]
    struct Switchable {
        fail: AtomicBool,
    }

    impl Aggregator for Switchable {
        fn aggregate(&self, atoms: &[Atom]) -> Result<Vec<Atom>, BehaviorError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BehaviorError::Failed("switched off".into()));
            }
            Ok(atoms.to_vec())
        }
    }

    #[test]
    fn without_aggregation_active_view_is_raw() {
        let orchestrator = QueryOrchestrator::new(
            query(),
            &BehaviorResolver::with_builtins(),
            StorePolicy::default(),
        )
        .expect("orchestrator");
        orchestrator
            .update_results("north", &[AtomOperation::add(site("A", "1"))])
            .expect("update");
        assert!(!orchestrator.has_aggregator());
        assert!(std::ptr::eq(orchestrator.active_view(), orchestrator.raw_view()));
        assert_eq!(orchestrator.notifications(), 1);
    }

    #[test]
    fn derived_view_lives_under_reserved_source() {
        let orchestrator = QueryOrchestrator::with_aggregator(
            query(),
            Some(Arc::new(Switchable::default())),
            StorePolicy::default(),
        );
        orchestrator
            .update_results("north", &[AtomOperation::add(site("A", "1"))])
            .expect("update");
        let snapshot = orchestrator.active_view().snapshot_atoms(false);
        assert_eq!(snapshot.source_ids().collect::<Vec<_>>(), [DERIVED_SOURCE_ID]);
        assert_eq!(orchestrator.active_view().keying(), Keying::Ordinal);
    }

    /// Emits one total atom plus one atom keyed by a different identifier.
    struct Totals;

    impl Aggregator for Totals {
        fn aggregate(&self, atoms: &[Atom]) -> Result<Vec<Atom>, BehaviorError> {
            let count = atoms.len().to_string();
            Ok(vec![
                Atom::new()
                    .with_identifier("siteId", "ALL")
                    .with_value("n", count.clone()),
                Atom::new()
                    .with_identifier("region", "eu")
                    .with_value("n", count),
            ])
        }
    }

    #[test]
    fn derived_atoms_may_carry_different_identifiers() {
        let orchestrator = QueryOrchestrator::with_aggregator(
            query(),
            Some(Arc::new(Totals)),
            StorePolicy::default(),
        );
        orchestrator
            .update_results("north", &[AtomOperation::add(site("A", "1"))])
            .expect("mixed identifiers install");
        orchestrator
            .update_results("south", &[AtomOperation::add(site("B", "1"))])
            .expect("second install");

        let view = orchestrator.active_view().snapshot_atoms(false).to_vec();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].identifier("siteId"), Some("ALL"));
        assert_eq!(view[1].identifier("region"), Some("eu"));
        assert_eq!(view[1].value("n"), Some("2"));
        assert_eq!(orchestrator.notifications(), 2);
    }

    #[test]
    fn aggregation_failure_keeps_previous_view() {
        let aggregator = Arc::new(Switchable::default());
        let orchestrator = QueryOrchestrator::with_aggregator(
            query(),
            Some(aggregator.clone()),
            StorePolicy::default(),
        );
        orchestrator
            .update_results("north", &[AtomOperation::add(site("A", "1"))])
            .expect("first update");

        aggregator.fail.store(true, Ordering::SeqCst);
        let err = orchestrator
            .update_results("north", &[AtomOperation::change(site("A", "2"))])
            .expect_err("aggregator fails");
        assert!(matches!(err, QueryError::Aggregation(_)));
        assert_eq!(orchestrator.notifications(), 1);
        assert_eq!(
            orchestrator.active_view().snapshot_atoms(false).to_vec(),
            vec![site("A", "1")]
        );
        assert_eq!(
            orchestrator.raw_view().snapshot_atoms(false).to_vec(),
            vec![site("A", "2")]
        );
    }

    #[test]
    fn rejected_batch_does_not_notify() {
        let orchestrator = QueryOrchestrator::with_aggregator(query(), None, StorePolicy::default());
        orchestrator
            .update_results("north", &[AtomOperation::add(site("A", "1"))])
            .expect("first update");
        let err = orchestrator
            .update_results("north", &[AtomOperation::add(Atom::new().with_value("load", "9"))])
            .expect_err("missing siteId");
        assert!(matches!(err, QueryError::Merge(_)));
        assert_eq!(orchestrator.notifications(), 1);
    }

    #[test]
    fn awaiting_sources_shrink_as_sources_respond() {
        let orchestrator = QueryOrchestrator::with_aggregator(query(), None, StorePolicy::default());
        assert_eq!(orchestrator.awaiting_sources(), ["north", "south"]);
        orchestrator
            .record_exception("south", "timeout")
            .expect("exception");
        assert_eq!(orchestrator.awaiting_sources(), ["north"]);
    }

    #[test]
    fn exceptions_reach_the_derived_view() {
        let orchestrator = QueryOrchestrator::with_aggregator(
            query(),
            Some(Arc::new(Switchable::default())),
            StorePolicy::default(),
        );
        orchestrator
            .record_exception("south", "timeout")
            .expect("exception");
        assert_eq!(
            orchestrator.active_view().exception_map().get("south").map(String::as_str),
            Some("timeout")
        );
    }
}
