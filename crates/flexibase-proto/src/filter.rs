//! Predicate IR for object filters.
//!
//! The core treats this expression form as opaque: it is resolved into a
//! set of matching object ids by an evaluator at the edge of each
//! refactoring operation.

use crate::value::Value;
use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

/// A filter expression over named property values.
///
/// Compound expressions are a flat, single-level list of
/// [`SimpleFilter`]s to avoid recursion issues with rkyv.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub enum FilterExpr {
    /// Property equals value.
    Eq { field: String, value: Value },
    /// Property not equals value.
    Ne { field: String, value: Value },
    /// Property less than value.
    Lt { field: String, value: Value },
    /// Property less than or equal to value.
    Le { field: String, value: Value },
    /// Property greater than value.
    Gt { field: String, value: Value },
    /// Property greater than or equal to value.
    Ge { field: String, value: Value },
    /// Property is in a set of values.
    In { field: String, values: Vec<Value> },
    /// Property is null or absent.
    IsNull { field: String },
    /// Property is present and non-null.
    IsNotNull { field: String },
    /// Property matches a LIKE pattern.
    Like { field: String, pattern: String },
    /// All conditions must be true (flat list, single level).
    And(Vec<SimpleFilter>),
    /// At least one condition must be true (flat list, single level).
    Or(Vec<SimpleFilter>),
}

/// A simple (non-compound) filter for use in And/Or expressions.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub enum SimpleFilter {
    /// Property equals value.
    Eq { field: String, value: Value },
    /// Property not equals value.
    Ne { field: String, value: Value },
    /// Property less than value.
    Lt { field: String, value: Value },
    /// Property less than or equal to value.
    Le { field: String, value: Value },
    /// Property greater than value.
    Gt { field: String, value: Value },
    /// Property greater than or equal to value.
    Ge { field: String, value: Value },
    /// Property is in a set of values.
    In { field: String, values: Vec<Value> },
    /// Property is null or absent.
    IsNull { field: String },
    /// Property is present and non-null.
    IsNotNull { field: String },
    /// Property matches a LIKE pattern.
    Like { field: String, pattern: String },
}

impl FilterExpr {
    /// Shorthand for an equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterExpr::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Collect all property names referenced by this expression.
    pub fn referenced_fields(&self) -> Vec<&str> {
        match self {
            FilterExpr::Eq { field, .. }
            | FilterExpr::Ne { field, .. }
            | FilterExpr::Lt { field, .. }
            | FilterExpr::Le { field, .. }
            | FilterExpr::Gt { field, .. }
            | FilterExpr::Ge { field, .. }
            | FilterExpr::In { field, .. }
            | FilterExpr::IsNull { field }
            | FilterExpr::IsNotNull { field }
            | FilterExpr::Like { field, .. } => vec![field.as_str()],
            FilterExpr::And(filters) | FilterExpr::Or(filters) => {
                filters.iter().map(SimpleFilter::field).collect()
            }
        }
    }
}

impl SimpleFilter {
    /// The property name this condition applies to.
    pub fn field(&self) -> &str {
        match self {
            SimpleFilter::Eq { field, .. }
            | SimpleFilter::Ne { field, .. }
            | SimpleFilter::Lt { field, .. }
            | SimpleFilter::Le { field, .. }
            | SimpleFilter::Gt { field, .. }
            | SimpleFilter::Ge { field, .. }
            | SimpleFilter::In { field, .. }
            | SimpleFilter::IsNull { field }
            | SimpleFilter::IsNotNull { field }
            | SimpleFilter::Like { field, .. } => field,
        }
    }
}
