//! Property definitions for classes.

use super::{ClassId, PropertyId};
use crate::error::Error;
use dashmap::DashMap;
use flexibase_proto::Value;
use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};
use std::sync::OnceLock;

/// Logical data type of a property.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub enum DataType {
    /// Boolean value.
    Bool,
    /// 64-bit signed integer.
    Integer,
    /// 64-bit floating point.
    Float,
    /// UTF-8 text.
    Text,
    /// Binary data.
    Blob,
    /// Timestamp in microseconds since Unix epoch.
    DateTime,
    /// Link to an independently addressable object of another class.
    Link,
    /// Embedded sub-object (not separately addressable).
    Nested,
}

impl DataType {
    /// Whether values of this type reference another object.
    pub fn is_reference(&self) -> bool {
        matches!(self, DataType::Link | DataType::Nested)
    }
}

/// Process-wide cache of compiled patterns. Validation runs the same
/// few patterns over every row, so each pattern compiles once; a cache
/// hit hands out a clone of the shared compiled program.
static PATTERN_CACHE: OnceLock<DashMap<String, regex::Regex>> = OnceLock::new();

/// Compile a pattern, reusing an earlier compilation when available.
pub(crate) fn compiled_regex(pattern: &str) -> Result<regex::Regex, regex::Error> {
    let cache = PATTERN_CACHE.get_or_init(DashMap::new);
    if let Some(re) = cache.get(pattern) {
        return Ok(re.clone());
    }
    let re = regex::Regex::new(pattern)?;
    cache.insert(pattern.to_string(), re.clone());
    Ok(re)
}

/// A property definition within a class.
///
/// A property is either plain (scalar data) or a reference
/// (`referenced_class` set), never both. Multi-valued properties
/// (`max_occurs > 1`) always live in overflow storage.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub struct PropertyDef {
    /// Property id, unique across the database. `PropertyId::UNASSIGNED`
    /// until the registry allocates one.
    pub id: PropertyId,
    /// Property name, unique within the owning class.
    pub name: String,
    /// Logical data type.
    pub data_type: DataType,
    /// Minimum number of values; 1 or more makes the property required.
    pub min_occurs: u32,
    /// Maximum number of values; greater than 1 makes it multi-valued.
    pub max_occurs: u32,
    /// Values must be unique across objects of the class.
    pub unique: bool,
    /// Maintain a secondary index for this property.
    pub indexed: bool,
    /// Record value changes in the change log.
    pub track_changes: bool,
    /// Default applied when a required value is absent.
    pub default_value: Option<Value>,
    /// Regular expression text values must match.
    pub validation_regex: Option<String>,
    /// Maximum accepted text length in characters.
    pub max_length: Option<u32>,
    /// Target class for Link/Nested properties.
    pub referenced_class: Option<ClassId>,
    /// Reverse property on the target class, if bidirectional.
    pub reverse_property: Option<PropertyId>,
    /// Rename marker consumed by `alter_class`: when set, the property
    /// keeps its id and data but takes this name.
    pub rename_to: Option<String>,
}

impl PropertyDef {
    /// Create a new single-valued optional property.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: PropertyId::UNASSIGNED,
            name: name.into(),
            data_type,
            min_occurs: 0,
            max_occurs: 1,
            unique: false,
            indexed: false,
            track_changes: false,
            default_value: None,
            validation_regex: None,
            max_length: None,
            referenced_class: None,
            reverse_property: None,
            rename_to: None,
        }
    }

    /// Create a link property to another class.
    pub fn link(name: impl Into<String>, target: ClassId) -> Self {
        let mut def = Self::new(name, DataType::Link);
        def.referenced_class = Some(target);
        def
    }

    /// Create an embedded sub-object property.
    pub fn nested(name: impl Into<String>, target: ClassId) -> Self {
        let mut def = Self::new(name, DataType::Nested);
        def.referenced_class = Some(target);
        def
    }

    /// Create a bounded text property.
    pub fn text(name: impl Into<String>, max_length: u32) -> Self {
        let mut def = Self::new(name, DataType::Text);
        def.max_length = Some(max_length);
        def
    }

    /// Mark as required (at least one value).
    pub fn required(mut self) -> Self {
        self.min_occurs = 1;
        self
    }

    /// Allow up to `max` values.
    pub fn multi_valued(mut self, max: u32) -> Self {
        self.max_occurs = max;
        self
    }

    /// Set the default value.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default_value = Some(default);
        self
    }

    /// Set the validation pattern.
    pub fn with_regex(mut self, pattern: impl Into<String>) -> Self {
        self.validation_regex = Some(pattern.into());
        self
    }

    /// Mark as unique.
    pub fn with_unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark as indexed.
    pub fn with_index(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Enable change tracking.
    pub fn with_track_changes(mut self) -> Self {
        self.track_changes = true;
        self
    }

    /// Set the rename marker for `alter_class`.
    pub fn renamed_to(mut self, name: impl Into<String>) -> Self {
        self.rename_to = Some(name.into());
        self
    }

    /// Set an explicit id (used when altering existing properties).
    pub fn with_id(mut self, id: PropertyId) -> Self {
        self.id = id;
        self
    }

    /// Whether this property references another object.
    pub fn is_reference(&self) -> bool {
        self.referenced_class.is_some()
    }

    /// Whether this property holds more than one value.
    pub fn is_multi_valued(&self) -> bool {
        self.max_occurs > 1
    }

    /// Whether at least one value is required.
    pub fn is_required(&self) -> bool {
        self.min_occurs >= 1
    }

    /// Whether this property is eligible for a fixed column slot.
    ///
    /// Multi-valued, reference, binary, and unbounded text properties
    /// always live in overflow storage.
    pub fn is_mappable(&self) -> bool {
        if self.is_multi_valued() || self.is_reference() {
            return false;
        }
        match self.data_type {
            DataType::Blob => false,
            DataType::Text => self.max_length.is_some(),
            _ => true,
        }
    }

    /// Validate the definition itself.
    pub fn validate_definition(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::SchemaConflict("property name is empty".into()));
        }
        if self.max_occurs < self.min_occurs.max(1) {
            return Err(Error::SchemaConflict(format!(
                "property '{}': max_occurs {} below min_occurs {}",
                self.name, self.max_occurs, self.min_occurs
            )));
        }
        match (self.data_type.is_reference(), self.referenced_class) {
            (true, None) => Err(Error::SchemaConflict(format!(
                "property '{}' is a reference type without a target class",
                self.name
            ))),
            (false, Some(_)) => Err(Error::SchemaConflict(format!(
                "property '{}' is plain but declares a target class",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    /// Validate a single value against this definition.
    pub fn validate_value(&self, value: &Value) -> Result<(), Error> {
        if value.is_null() {
            if self.is_required() {
                return Err(Error::ValidationFailure {
                    property: self.id,
                    reason: "null value for required property".into(),
                });
            }
            return Ok(());
        }

        let type_ok = matches!(
            (self.data_type, value),
            (DataType::Bool, Value::Bool(_))
                | (DataType::Integer, Value::Int(_))
                | (DataType::Float, Value::Float(_))
                | (DataType::Float, Value::Int(_))
                | (DataType::Text, Value::Text(_))
                | (DataType::Blob, Value::Bytes(_))
                | (DataType::DateTime, Value::Timestamp(_))
                | (DataType::Link, Value::ObjectRef(_))
                | (DataType::Nested, Value::NestedRef(_))
        );
        if !type_ok {
            return Err(Error::ValidationFailure {
                property: self.id,
                reason: format!("value {:?} does not match type {:?}", value, self.data_type),
            });
        }

        if let Value::Text(s) = value {
            if let Some(max) = self.max_length {
                if s.chars().count() > max as usize {
                    return Err(Error::ValidationFailure {
                        property: self.id,
                        reason: format!("text exceeds max length {}", max),
                    });
                }
            }
            if let Some(pattern) = &self.validation_regex {
                let re = compiled_regex(pattern).map_err(|e| Error::ValidationFailure {
                    property: self.id,
                    reason: format!("invalid validation pattern: {}", e),
                })?;
                if !re.is_match(s) {
                    return Err(Error::ValidationFailure {
                        property: self.id,
                        reason: format!("value does not match pattern '{}'", pattern),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_builder() {
        let prop = PropertyDef::text("Email", 120)
            .required()
            .with_unique()
            .with_regex("^[^@]+@[^@]+$");

        assert_eq!(prop.name, "Email");
        assert!(prop.is_required());
        assert!(prop.unique);
        assert!(prop.is_mappable());
        assert!(prop.validate_definition().is_ok());
    }

    #[test]
    fn test_pattern_validation_reuses_compilation() {
        let prop = PropertyDef::text("Code", 10)
            .with_regex(r"^[A-Z]{2}\d{3}$")
            .with_id(PropertyId(1));

        // Repeated validation of the same pattern goes through the
        // shared cache; behavior stays identical across calls.
        for _ in 0..3 {
            assert!(prop.validate_value(&Value::Text("AB123".into())).is_ok());
            assert!(prop.validate_value(&Value::Text("nope".into())).is_err());
        }
    }

    #[test]
    fn test_reference_needs_target() {
        let mut prop = PropertyDef::new("Owner", DataType::Link);
        assert!(prop.validate_definition().is_err());

        prop.referenced_class = Some(ClassId(3));
        assert!(prop.validate_definition().is_ok());
        assert!(!prop.is_mappable());
    }

    #[test]
    fn test_plain_with_target_rejected() {
        let mut prop = PropertyDef::new("Age", DataType::Integer);
        prop.referenced_class = Some(ClassId(3));
        assert!(prop.validate_definition().is_err());
    }

    #[test]
    fn test_multi_valued_not_mappable() {
        let prop = PropertyDef::new("Tags", DataType::Text).multi_valued(10);
        assert!(prop.is_multi_valued());
        assert!(!prop.is_mappable());
    }

    #[test]
    fn test_unbounded_text_not_mappable() {
        let prop = PropertyDef::new("Notes", DataType::Text);
        assert!(!prop.is_mappable());
        assert!(PropertyDef::text("Code", 16).is_mappable());
    }

    #[test]
    fn test_validate_value_type() {
        let prop = PropertyDef::new("Age", DataType::Integer).with_id(PropertyId(1));
        assert!(prop.validate_value(&Value::Int(30)).is_ok());
        assert!(prop.validate_value(&Value::Text("x".into())).is_err());
        assert!(prop.validate_value(&Value::Null).is_ok());
    }

    #[test]
    fn test_validate_value_null_required() {
        let prop = PropertyDef::new("Age", DataType::Integer)
            .required()
            .with_id(PropertyId(1));
        assert!(prop.validate_value(&Value::Null).is_err());
    }

    #[test]
    fn test_validate_value_regex_and_length() {
        let prop = PropertyDef::text("Code", 3)
            .with_regex("^[A-Z]+$")
            .with_id(PropertyId(1));
        assert!(prop.validate_value(&Value::Text("ABC".into())).is_ok());
        assert!(prop.validate_value(&Value::Text("ABCD".into())).is_err());
        assert!(prop.validate_value(&Value::Text("abc".into())).is_err());
    }
}
