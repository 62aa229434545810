//! Record model shared by merge, aggregation and behavior layers.
//!
//! # Responsibility
//! - Define the flat atom record reported by sources.
//! - Derive compound keys from atoms under a fixed identifier schema.
//!
//! # Invariants
//! - An identifier schema never changes once learned by a store.
//! - Compound keys compare and hash by value, in schema order.

pub mod atom;
