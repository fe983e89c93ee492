//! Flexibase shared types: runtime values and filter predicates.
//!
//! This crate defines the types that cross the boundary between the
//! schema/refactoring core and its callers, using rkyv for zero-copy
//! serialization.
//!
//! # Modules
//!
//! - [`value`] - Runtime value types stored in object rows
//! - [`filter`] - Predicate IR used by object filters
//! - [`error`] - Encoding error types
//!
//! # Serialization
//!
//! All types derive `rkyv::Archive`, `rkyv::Serialize`, and
//! `rkyv::Deserialize` so they can be persisted directly. Serde derives
//! are carried as well for report rendering.

pub mod error;
pub mod filter;
pub mod value;

pub use error::Error;
pub use filter::{FilterExpr, SimpleFilter};
pub use value::Value;
