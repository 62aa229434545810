//! Query orchestration.
//!
//! # Responsibility
//! - Describe queries and keep one orchestrator per registered query.
//! - Apply source batches, derive the aggregated view and notify alerts.
//!
//! # Invariants
//! - Query ids are unique within a registry.
//! - Notification happens after the mutating call has released every
//!   store lock.

pub mod alert;
pub mod definition;
pub mod error;
pub mod orchestrator;
pub mod registry;
