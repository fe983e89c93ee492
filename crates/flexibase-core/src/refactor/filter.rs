//! Object selection for refactoring operations.
//!
//! Every operation takes an [`ObjectFilter`] scoping which objects it
//! touches: an explicit id set, a predicate over property values, both
//! (intersection), or neither (all objects of the class).

use crate::error::Error;
use crate::schema::ClassDef;
use crate::store::{ObjectData, ObjectId};
use flexibase_proto::{FilterExpr, SimpleFilter, Value};

/// Selection criterion shared by all refactoring operations.
#[derive(Debug, Clone, Default)]
pub struct ObjectFilter {
    /// Restrict to these object ids, if set.
    pub ids: Option<Vec<ObjectId>>,
    /// Restrict to objects matching this predicate, if set.
    pub predicate: Option<FilterExpr>,
}

impl ObjectFilter {
    /// Match all objects of the class.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match a single object.
    pub fn by_id(id: ObjectId) -> Self {
        Self {
            ids: Some(vec![id]),
            predicate: None,
        }
    }

    /// Match an explicit id set.
    pub fn by_ids(ids: Vec<ObjectId>) -> Self {
        Self {
            ids: Some(ids),
            predicate: None,
        }
    }

    /// Match objects satisfying a predicate.
    pub fn matching(predicate: FilterExpr) -> Self {
        Self {
            ids: None,
            predicate: Some(predicate),
        }
    }

    /// Whether an object passes this filter.
    pub fn matches(
        &self,
        class: &ClassDef,
        id: ObjectId,
        data: &ObjectData,
    ) -> Result<bool, Error> {
        if let Some(ids) = &self.ids {
            if !ids.contains(&id) {
                return Ok(false);
            }
        }
        if let Some(predicate) = &self.predicate {
            let row = named_row(class, data);
            return PredicateEvaluator::evaluate(predicate, &row);
        }
        Ok(true)
    }
}

/// Project object data into (name, value) pairs for predicate
/// evaluation. Multi-valued properties contribute their first value.
pub fn named_row(class: &ClassDef, data: &ObjectData) -> Vec<(String, Value)> {
    let mut row = Vec::with_capacity(data.len());
    for (property, values) in data.iter() {
        if let Some(def) = class.get_property(property) {
            if let Some(value) = values.first() {
                row.push((def.name.clone(), value.clone()));
            }
        }
    }
    row
}

/// Evaluates predicate expressions against named rows.
pub struct PredicateEvaluator;

impl PredicateEvaluator {
    /// Evaluate a filter expression against a row of named values.
    pub fn evaluate(filter: &FilterExpr, row: &[(String, Value)]) -> Result<bool, Error> {
        match filter {
            FilterExpr::Eq { field, value } => {
                Self::compare_field(row, field, value, Self::values_equal)
            }
            FilterExpr::Ne { field, value } => {
                Self::compare_field(row, field, value, |a, b| !Self::values_equal(a, b))
            }
            FilterExpr::Lt { field, value } => Self::compare_field(row, field, value, |a, b| {
                Self::compare_values(a, b).map(|o| o.is_lt()).unwrap_or(false)
            }),
            FilterExpr::Le { field, value } => Self::compare_field(row, field, value, |a, b| {
                Self::compare_values(a, b).map(|o| o.is_le()).unwrap_or(false)
            }),
            FilterExpr::Gt { field, value } => Self::compare_field(row, field, value, |a, b| {
                Self::compare_values(a, b).map(|o| o.is_gt()).unwrap_or(false)
            }),
            FilterExpr::Ge { field, value } => Self::compare_field(row, field, value, |a, b| {
                Self::compare_values(a, b).map(|o| o.is_ge()).unwrap_or(false)
            }),
            FilterExpr::In { field, values } => match Self::get_field(row, field) {
                Some(fv) => Ok(values.iter().any(|v| Self::values_equal(fv, v))),
                None => Ok(false),
            },
            FilterExpr::IsNull { field } => {
                Ok(matches!(Self::get_field(row, field), None | Some(Value::Null)))
            }
            FilterExpr::IsNotNull { field } => {
                Ok(!matches!(Self::get_field(row, field), None | Some(Value::Null)))
            }
            FilterExpr::Like { field, pattern } => match Self::get_field(row, field) {
                Some(Value::Text(s)) => Ok(Self::like_match(s, pattern)),
                _ => Ok(false),
            },
            FilterExpr::And(filters) => {
                for f in filters {
                    if !Self::evaluate_simple(f, row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            FilterExpr::Or(filters) => {
                for f in filters {
                    if Self::evaluate_simple(f, row)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Evaluate a simple (non-compound) condition.
    fn evaluate_simple(filter: &SimpleFilter, row: &[(String, Value)]) -> Result<bool, Error> {
        let expr = match filter.clone() {
            SimpleFilter::Eq { field, value } => FilterExpr::Eq { field, value },
            SimpleFilter::Ne { field, value } => FilterExpr::Ne { field, value },
            SimpleFilter::Lt { field, value } => FilterExpr::Lt { field, value },
            SimpleFilter::Le { field, value } => FilterExpr::Le { field, value },
            SimpleFilter::Gt { field, value } => FilterExpr::Gt { field, value },
            SimpleFilter::Ge { field, value } => FilterExpr::Ge { field, value },
            SimpleFilter::In { field, values } => FilterExpr::In { field, values },
            SimpleFilter::IsNull { field } => FilterExpr::IsNull { field },
            SimpleFilter::IsNotNull { field } => FilterExpr::IsNotNull { field },
            SimpleFilter::Like { field, pattern } => FilterExpr::Like { field, pattern },
        };
        Self::evaluate(&expr, row)
    }

    fn get_field<'a>(row: &'a [(String, Value)], field: &str) -> Option<&'a Value> {
        row.iter().find(|(name, _)| name == field).map(|(_, v)| v)
    }

    fn compare_field<F>(
        row: &[(String, Value)],
        field: &str,
        value: &Value,
        comparator: F,
    ) -> Result<bool, Error>
    where
        F: FnOnce(&Value, &Value) -> bool,
    {
        match Self::get_field(row, field) {
            Some(fv) => Ok(comparator(fv, value)),
            // Missing field matches nothing
            None => Ok(false),
        }
    }

    /// Value equality with numeric coercion between Int and Float.
    pub fn values_equal(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) => (*a as f64) == *b,
            (Value::Float(a), Value::Int(b)) => *a == (*b as f64),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::ObjectRef(a), Value::ObjectRef(b)) => a == b,
            (Value::NestedRef(a), Value::NestedRef(b)) => a == b,
            _ => false,
        }
    }

    /// Compare two values, returning their ordering if comparable.
    fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
        match (a, b) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Match a string against a SQL LIKE pattern.
    ///
    /// `%` matches zero or more characters, `_` exactly one; `\%` and
    /// `\_` match the literal characters.
    pub fn like_match(value: &str, pattern: &str) -> bool {
        let mut chars = value.chars().peekable();
        let mut pattern_chars = pattern.chars().peekable();
        Self::like_match_recursive(&mut chars, &mut pattern_chars)
    }

    fn like_match_recursive(
        chars: &mut std::iter::Peekable<std::str::Chars>,
        pattern: &mut std::iter::Peekable<std::str::Chars>,
    ) -> bool {
        loop {
            match (pattern.peek().copied(), chars.peek().copied()) {
                (None, None) => return true,
                (None, Some(_)) => return false,
                (Some('%'), _) => {
                    pattern.next();
                    if pattern.peek().is_none() {
                        return true;
                    }
                    // Try matching % with 0, 1, 2, ... characters
                    loop {
                        let mut pattern_clone = pattern.clone();
                        let mut chars_clone = chars.clone();
                        if Self::like_match_recursive(&mut chars_clone, &mut pattern_clone) {
                            return true;
                        }
                        if chars.next().is_none() {
                            return false;
                        }
                    }
                }
                (Some('_'), Some(_)) => {
                    pattern.next();
                    chars.next();
                }
                (Some('_'), None) => return false,
                (Some('\\'), _) => {
                    pattern.next();
                    match (pattern.peek().copied(), chars.peek().copied()) {
                        (Some(p), Some(c)) if p == c => {
                            pattern.next();
                            chars.next();
                        }
                        _ => return false,
                    }
                }
                (Some(p), Some(c)) => {
                    if p == c {
                        pattern.next();
                        chars.next();
                    } else {
                        return false;
                    }
                }
                (Some(_), None) => return false,
            }
        }
    }
}
