//! Spec-to-behavior resolution.
//!
//! # Responsibility
//! - Check a spec's declared kind against the requested capability.
//! - Dispatch to the native registry or to the script host of the spec's
//!   dialect, then adapt the product to the requested capability.
//!
//! # Invariants
//! - The kind check runs before any back-end is touched.
//! - Unknown implementation kinds and unregistered dialects resolve to
//!   `Ok(None)`; they are never errors.

use crate::aggregate::{Aggregator, PartitionAggregator};
use crate::behavior::capability::{AtomPredicate, Behavior, BehaviorHandle, ViewEncoder};
use crate::behavior::native::NativeRegistry;
use crate::behavior::script::{ScriptError, ScriptHost};
use crate::behavior::spec::{AggregationStrategy, BehaviorKind, BehaviorSpec, ImplementationKind};
use crate::query::alert::Alert;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

pub type ResolveResult<T> = Result<Option<T>, ResolveError>;

/// Resolution errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    TypeMismatch {
        requested: BehaviorKind,
        declared: BehaviorKind,
    },
    UnknownImplementation(String),
    UnknownParameter {
        implementation: String,
        name: String,
    },
    InvalidParameter {
        implementation: String,
        name: String,
        message: String,
    },
    MissingParameter {
        implementation: String,
        name: String,
    },
    Script {
        dialect: String,
        error: ScriptError,
    },
    ProductMismatch {
        expected: &'static str,
        produced: &'static str,
    },
    DuplicateRegistration(String),
    InvalidSpec(String),
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TypeMismatch {
                requested,
                declared,
            } => write!(f, "requested a {requested} but spec declares a {declared}"),
            Self::UnknownImplementation(name) => {
                write!(f, "no native implementation named `{name}`")
            }
            Self::UnknownParameter {
                implementation,
                name,
            } => write!(f, "`{implementation}` has no parameter `{name}`"),
            Self::InvalidParameter {
                implementation,
                name,
                message,
            } => write!(
                f,
                "invalid value for parameter `{name}` of `{implementation}`: {message}"
            ),
            Self::MissingParameter {
                implementation,
                name,
            } => write!(f, "`{implementation}` requires parameter `{name}`"),
            Self::Script { dialect, error } => write!(f, "{dialect} script failed: {error}"),
            Self::ProductMismatch { expected, produced } => {
                write!(f, "back-end produced a {produced}, expected a {expected}")
            }
            Self::DuplicateRegistration(name) => write!(f, "already registered: {name}"),
            Self::InvalidSpec(message) => write!(f, "invalid behavior spec: {message}"),
        }
    }
}

impl Error for ResolveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Script { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Turns behavior specs into runtime capabilities.
#[derive(Clone, Default)]
pub struct BehaviorResolver {
    native: NativeRegistry,
    hosts: BTreeMap<String, Arc<dyn ScriptHost>>,
}

impl BehaviorResolver {
    pub fn new(native: NativeRegistry) -> Self {
        Self {
            native,
            hosts: BTreeMap::new(),
        }
    }

    /// Resolver over the built-in native implementations, no script hosts.
    pub fn with_builtins() -> Self {
        Self::new(NativeRegistry::with_builtins())
    }

    /// Adds the host for a new dialect.
    ///
    /// # Errors
    /// - `InvalidSpec` for a blank dialect tag.
    /// - `DuplicateRegistration` when the dialect already has a host.
    pub fn register_host(&mut self, host: Arc<dyn ScriptHost>) -> Result<(), ResolveError> {
        let dialect = normalize_dialect(host.dialect());
        if dialect.is_empty() {
            return Err(ResolveError::InvalidSpec("blank script dialect".to_string()));
        }
        if self.hosts.contains_key(&dialect) {
            return Err(ResolveError::DuplicateRegistration(dialect));
        }
        debug!(
            "event=script_host_registered module=behavior status=ok dialect={}",
            dialect
        );
        self.hosts.insert(dialect, host);
        Ok(())
    }

    pub fn dialects(&self) -> Vec<&str> {
        self.hosts.keys().map(String::as_str).collect()
    }

    pub fn native_registry(&self) -> &NativeRegistry {
        &self.native
    }

    pub fn native_registry_mut(&mut self) -> &mut NativeRegistry {
        &mut self.native
    }

    /// Resolves a spec to whichever capability it declares.
    pub fn resolve(&self, spec: &BehaviorSpec) -> ResolveResult<Behavior> {
        Ok(match spec.kind {
            BehaviorKind::Predicate => self.resolve_predicate(spec)?.map(Behavior::Predicate),
            BehaviorKind::Encoder => self.resolve_encoder(spec)?.map(Behavior::Encoder),
            BehaviorKind::Alert => self.resolve_alert(spec)?.map(Behavior::Alert),
            BehaviorKind::Aggregator => self.resolve_aggregator(spec)?.map(Behavior::Aggregator),
        })
    }

    pub fn resolve_predicate(&self, spec: &BehaviorSpec) -> ResolveResult<Arc<dyn AtomPredicate>> {
        check_kind(spec, BehaviorKind::Predicate)?;
        self.produce(spec)?
            .map(|handle| adapt(handle, BehaviorHandle::into_predicate, "predicate"))
            .transpose()
    }

    pub fn resolve_encoder(&self, spec: &BehaviorSpec) -> ResolveResult<Arc<dyn ViewEncoder>> {
        check_kind(spec, BehaviorKind::Encoder)?;
        self.produce(spec)?
            .map(|handle| adapt(handle, BehaviorHandle::into_encoder, "encoder"))
            .transpose()
    }

    pub fn resolve_alert(&self, spec: &BehaviorSpec) -> ResolveResult<Arc<dyn Alert>> {
        check_kind(spec, BehaviorKind::Alert)?;
        self.produce(spec)?
            .map(|handle| adapt(handle, BehaviorHandle::into_alert, "alert"))
            .transpose()
    }

    /// Resolves an aggregator spec.
    ///
    /// With the `melder` strategy the product is a melder, wrapped into a
    /// [`PartitionAggregator`] over the spec's collation ids.
    pub fn resolve_aggregator(&self, spec: &BehaviorSpec) -> ResolveResult<Arc<dyn Aggregator>> {
        check_kind(spec, BehaviorKind::Aggregator)?;
        let Some(handle) = self.produce(spec)? else {
            return Ok(None);
        };
        let strategy = spec.aggregation_strategy();
        if strategy == AggregationStrategy::Melder && spec.collation_ids.is_empty() {
            return Err(ResolveError::InvalidSpec(
                "melder aggregation requires at least one collation id".to_string(),
            ));
        }
        let aggregator = match strategy {
            AggregationStrategy::Direct => {
                adapt(handle, BehaviorHandle::into_aggregator, "aggregator")?
            }
            AggregationStrategy::Melder => {
                let melder = adapt(handle, BehaviorHandle::into_melder, "melder")?;
                Arc::new(PartitionAggregator::new(spec.collation_ids.clone(), melder))
            }
        };
        Ok(Some(aggregator))
    }

    fn produce(&self, spec: &BehaviorSpec) -> ResolveResult<BehaviorHandle> {
        match &spec.implementation {
            ImplementationKind::Native => self.native.instantiate(&spec.source, &spec.params).map(Some),
            ImplementationKind::Scripted => {
                let Some(dialect) = spec.dialect.as_deref().map(normalize_dialect) else {
                    debug!(
                        "event=resolve_skipped module=behavior status=skipped kind={} reason=no_dialect",
                        spec.kind
                    );
                    return Ok(None);
                };
                let Some(host) = self.hosts.get(&dialect) else {
                    debug!(
                        "event=resolve_skipped module=behavior status=skipped kind={} dialect={}",
                        spec.kind, dialect
                    );
                    return Ok(None);
                };
                match host.evaluate(&spec.source) {
                    Ok(handle) => Ok(Some(handle)),
                    Err(error) => {
                        warn!(
                            "event=script_failed module=behavior status=error kind={} dialect={}",
                            spec.kind, dialect
                        );
                        Err(ResolveError::Script { dialect, error })
                    }
                }
            }
            ImplementationKind::Other(name) => {
                debug!(
                    "event=resolve_skipped module=behavior status=skipped kind={} implementation={}",
                    spec.kind, name
                );
                Ok(None)
            }
        }
    }
}

impl Debug for BehaviorResolver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorResolver")
            .field("native", &self.native)
            .field("dialects", &self.dialects())
            .finish()
    }
}

fn check_kind(spec: &BehaviorSpec, requested: BehaviorKind) -> Result<(), ResolveError> {
    if spec.kind != requested {
        return Err(ResolveError::TypeMismatch {
            requested,
            declared: spec.kind,
        });
    }
    Ok(())
}

fn adapt<T>(
    handle: BehaviorHandle,
    convert: fn(BehaviorHandle) -> Result<T, &'static str>,
    expected: &'static str,
) -> Result<T, ResolveError> {
    convert(handle).map_err(|produced| ResolveError::ProductMismatch { expected, produced })
}

fn normalize_dialect(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}
