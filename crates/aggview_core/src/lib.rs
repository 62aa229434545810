//! Core engine for aggregated distributed query views.
//! Sources report keyed atoms; queries merge them per source, optionally
//! aggregate the merged set, and notify attached alerts.

pub mod aggregate;
pub mod behavior;
pub mod config;
pub mod logging;
pub mod model;
pub mod query;
pub mod store;

pub use aggregate::{Aggregator, Melder, PartitionAggregator};
pub use behavior::capability::{
    AtomPredicate, Behavior, BehaviorError, BehaviorHandle, ScriptFunction, ScriptValue,
    ViewEncoder,
};
pub use behavior::native::{NativeParams, NativeRegistry};
pub use behavior::resolver::{BehaviorResolver, ResolveError, ResolveResult};
pub use behavior::script::{ScriptError, ScriptHost, SCRIPT_ENTRY_POINT};
pub use behavior::spec::{
    parse_collation_ids, AggregationStrategy, BehaviorKind, BehaviorSpec, ImplementationKind,
};
pub use config::{
    default_log_level, BatchFailurePolicy, ConfigError, EngineConfig, ExceptionRetention,
    LoggingConfig, StorePolicy,
};
pub use logging::{init_file_logging, init_logging, logging_status, LoggingError};
pub use model::atom::{Atom, AtomError, CompoundKey, FieldMap, IdentifierSchema, SOURCE_TAG_FIELD};
pub use query::alert::{Alert, AlertDescriptor, AlertRegistry, AttachedAlert};
pub use query::definition::Query;
pub use query::error::QueryError;
pub use query::orchestrator::{QueryDocument, QueryOrchestrator, DERIVED_SOURCE_ID};
pub use query::registry::QueryRegistry;
pub use store::{
    AtomOperation, AtomSnapshot, BatchOutcome, Keying, MergeError, MergeStore, OperationKind,
    RejectedOperation, StoreDocument,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
