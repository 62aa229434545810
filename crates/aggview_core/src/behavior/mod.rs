//! Pluggable behaviors built from declarative specs.
//!
//! # Responsibility
//! - Round-trip behavior specs (kind, back-end, source, parameters).
//! - Resolve a spec to a predicate, encoder, alert or aggregator through
//!   the native registry or a per-dialect script host.
//!
//! # Invariants
//! - Resolution never fails for a back-end it does not know; it returns
//!   `Ok(None)` instead.
//! - New dialects are added by registering a host, without touching the
//!   resolver.

pub mod builtin;
pub mod capability;
pub mod native;
pub mod resolver;
pub mod script;
pub mod spec;
