//! Core error types.

use crate::schema::{ClassId, PropertyId};
use crate::store::ObjectId;
use thiserror::Error;

/// Core errors for schema and refactoring operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error. Always fatal to the current operation.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Shared type encoding error.
    #[error("proto error: {0}")]
    Proto(#[from] flexibase_proto::Error),

    /// A class or property name collides with an existing one.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// A class is still referenced by link properties of other classes.
    #[error("class {0} is referenced by property {1} of class {2}")]
    ReferentialConflict(ClassId, PropertyId, ClassId),

    /// A required property would end up without a value.
    #[error("cardinality violation: property {property} of object {object} requires at least {min} value(s)")]
    CardinalityViolation {
        /// Violating property.
        property: PropertyId,
        /// Affected object.
        object: ObjectId,
        /// Minimum occurrences required.
        min: u32,
    },

    /// Schema state conflicts with the requested change.
    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    /// No matching counterpart for a batch item.
    #[error("no match for object {0}")]
    NoMatch(ObjectId),

    /// Unknown class.
    #[error("class {0} not found")]
    ClassNotFound(ClassId),

    /// Unknown class name.
    #[error("class '{0}' not found")]
    ClassNameNotFound(String),

    /// Unknown property.
    #[error("property {0} not found in class {1}")]
    PropertyNotFound(PropertyId, ClassId),

    /// Unknown object.
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    /// A value violates its property's validation rules.
    #[error("validation failure for property {property}: {reason}")]
    ValidationFailure {
        /// Violating property.
        property: PropertyId,
        /// Human-readable reason.
        reason: String,
    },

    /// Class-level lock contention. Callers may retry.
    #[error("concurrent operation in progress on class {0}")]
    ConcurrencyConflict(ClassId),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Key decoding error.
    #[error("invalid key format")]
    InvalidKey,
}

impl Error {
    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict(_))
    }
}
