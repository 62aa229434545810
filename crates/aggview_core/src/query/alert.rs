//! Alerts attached to a query.
//!
//! # Responsibility
//! - Define the alert capability notified after every successful change.
//! - Keep the attached set behind its own lock, apart from any store lock.
//!
//! # Invariants
//! - Alert names are unique per query.
//! - Dispatch iterates over a copy of the attached set; alerts may attach
//!   or detach alerts while being notified.

use crate::behavior::capability::BehaviorError;
use crate::behavior::spec::BehaviorSpec;
use crate::query::error::QueryError;
use crate::store::MergeStore;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Condition checked against a query's active view.
pub trait Alert: Send + Sync {
    /// Returns whether the alert condition currently holds.
    fn evaluate(&self, view: &MergeStore) -> Result<bool, BehaviorError>;

    /// Called once the alert is attached to `query_id`.
    fn attached(&self, _query_id: &str) {}

    /// Called once the alert is detached from `query_id`.
    fn detached(&self, _query_id: &str) {}
}

impl Debug for dyn Alert {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Alert")
    }
}

/// One alert registered on a query.
pub struct AttachedAlert {
    name: String,
    spec: Option<BehaviorSpec>,
    alert: Arc<dyn Alert>,
    triggered: AtomicBool,
}

impl AttachedAlert {
    pub fn new(name: impl Into<String>, alert: Arc<dyn Alert>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            spec: None,
            alert,
            triggered: AtomicBool::new(false),
        }
    }

    /// Alert built from `spec`; the spec is kept for serialization.
    pub fn from_spec(name: impl Into<String>, spec: BehaviorSpec, alert: Arc<dyn Alert>) -> Self {
        let mut attached = Self::new(name, alert);
        attached.spec = Some(spec);
        attached
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> Option<&BehaviorSpec> {
        self.spec.as_ref()
    }

    /// Outcome of the last successful evaluation.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn descriptor(&self, query_id: &str) -> AlertDescriptor {
        AlertDescriptor {
            name: self.name.clone(),
            query_id: query_id.to_string(),
            spec: self.spec.clone(),
            triggered: self.is_triggered(),
        }
    }

    /// Evaluates against `view`; a failing evaluation keeps the last state.
    pub(crate) fn notify(&self, query_id: &str, view: &MergeStore) {
        match self.alert.evaluate(view) {
            Ok(triggered) => self.triggered.store(triggered, Ordering::SeqCst),
            Err(err) => warn!(
                "event=alert_failed module=query status=error query_id={} alert={} error={}",
                query_id, self.name, err
            ),
        }
    }

    pub(crate) fn on_attached(&self, query_id: &str) {
        self.alert.attached(query_id);
    }

    pub(crate) fn on_detached(&self, query_id: &str) {
        self.alert.detached(query_id);
    }
}

impl Debug for AttachedAlert {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedAlert")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .field("triggered", &self.is_triggered())
            .finish_non_exhaustive()
    }
}

/// Serialized form of one attached alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertDescriptor {
    pub name: String,
    pub query_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<BehaviorSpec>,
    pub triggered: bool,
}

/// Ordered set of alerts attached to one query.
#[derive(Debug, Default)]
pub struct AlertRegistry {
    entries: Mutex<Vec<Arc<AttachedAlert>>>,
}

impl AlertRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Arc<AttachedAlert>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an alert at the end of the dispatch order.
    ///
    /// # Errors
    /// - `InvalidAlertName` for a blank name.
    /// - `DuplicateAlert` when the name is already attached.
    pub fn add(&self, alert: AttachedAlert) -> Result<Arc<AttachedAlert>, QueryError> {
        if alert.name().is_empty() {
            return Err(QueryError::InvalidAlertName(alert.name().to_string()));
        }
        let mut entries = self.entries();
        if entries.iter().any(|entry| entry.name() == alert.name()) {
            return Err(QueryError::DuplicateAlert(alert.name().to_string()));
        }
        let alert = Arc::new(alert);
        entries.push(Arc::clone(&alert));
        Ok(alert)
    }

    /// Removes the alert named `name`; absent names are a no-op.
    pub fn remove(&self, name: &str) -> Option<Arc<AttachedAlert>> {
        let mut entries = self.entries();
        let index = entries.iter().position(|entry| entry.name() == name.trim())?;
        Some(entries.remove(index))
    }

    /// Copy of the attached set in dispatch order.
    pub fn snapshot(&self) -> Vec<Arc<AttachedAlert>> {
        self.entries().clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<AttachedAlert>> {
        self.entries()
            .iter()
            .find(|entry| entry.name() == name.trim())
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries()
            .iter()
            .map(|entry| entry.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Removes every alert, returning them in dispatch order.
    pub(crate) fn drain(&self) -> Vec<Arc<AttachedAlert>> {
        std::mem::take(&mut *self.entries())
    }
}
