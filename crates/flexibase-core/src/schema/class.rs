//! Class definitions.

use super::{ClassId, ColumnMapping, PropertyDef, PropertyId};
use crate::error::Error;
use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};
use std::collections::HashSet;

/// A class definition: a named logical entity type with a mutable,
/// versioned property set and its current column mapping.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub struct ClassDef {
    /// Stable class id.
    pub id: ClassId,
    /// Class name, unique across the database.
    pub name: String,
    /// Schema version, bumped on every mutation. Object records carry
    /// the version they were written under.
    pub version: u64,
    /// Property definitions in declaration order.
    pub properties: Vec<PropertyDef>,
    /// Current assignment of properties to fixed column slots.
    pub mapping: ColumnMapping,
}

impl ClassDef {
    /// Create a new class definition at version 1 with no properties.
    pub fn new(id: ClassId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            version: 1,
            properties: Vec::new(),
            mapping: ColumnMapping::empty(),
        }
    }

    /// Add a property.
    pub fn with_property(mut self, prop: PropertyDef) -> Self {
        self.properties.push(prop);
        self
    }

    /// Set the column mapping.
    pub fn with_mapping(mut self, mapping: ColumnMapping) -> Self {
        self.mapping = mapping;
        self
    }

    /// Get a property by id.
    pub fn get_property(&self, id: PropertyId) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.id == id)
    }

    /// Get a property by name.
    pub fn get_property_by_name(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Get a property by id, or fail with `PropertyNotFound`.
    pub fn require_property(&self, id: PropertyId) -> Result<&PropertyDef, Error> {
        self.get_property(id)
            .ok_or(Error::PropertyNotFound(id, self.id))
    }

    /// Iterate over required properties.
    pub fn required_properties(&self) -> impl Iterator<Item = &PropertyDef> {
        self.properties.iter().filter(|p| p.is_required())
    }

    /// Iterate over reference (Link/Nested) properties.
    pub fn reference_properties(&self) -> impl Iterator<Item = &PropertyDef> {
        self.properties.iter().filter(|p| p.is_reference())
    }

    /// Validate the definition: property definitions are well-formed and
    /// names and ids are unique within the class.
    pub fn validate(&self) -> Result<(), Error> {
        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for prop in &self.properties {
            prop.validate_definition()?;
            if !names.insert(prop.name.as_str()) {
                return Err(Error::DuplicateName(format!(
                    "property '{}' in class '{}'",
                    prop.name, self.name
                )));
            }
            if !prop.id.is_unassigned() && !ids.insert(prop.id) {
                return Err(Error::SchemaConflict(format!(
                    "property id {} appears twice in class '{}'",
                    prop.id, self.name
                )));
            }
        }
        Ok(())
    }

    /// Serialize to bytes using rkyv.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes using rkyv.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        // sled may hand back unaligned inline buffers; rkyv needs alignment.
        let mut aligned = rkyv::util::AlignedVec::<16>::new();
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{allocate_columns, DataType};

    fn person() -> ClassDef {
        let props = vec![
            PropertyDef::text("FirstName", 60).with_id(PropertyId(1)),
            PropertyDef::text("LastName", 60).with_id(PropertyId(2)),
            PropertyDef::new("Age", DataType::Integer).with_id(PropertyId(3)),
        ];
        let mapping = allocate_columns(&props);
        ClassDef {
            id: ClassId(1),
            name: "Person".into(),
            version: 1,
            properties: props,
            mapping,
        }
    }

    #[test]
    fn test_lookup() {
        let class = person();
        assert!(class.get_property(PropertyId(1)).is_some());
        assert!(class.get_property(PropertyId(9)).is_none());
        assert_eq!(
            class.get_property_by_name("Age").unwrap().id,
            PropertyId(3)
        );
        assert!(class.require_property(PropertyId(9)).is_err());
    }

    #[test]
    fn test_duplicate_property_name_rejected() {
        let class = person().with_property(PropertyDef::text("Age", 10).with_id(PropertyId(4)));
        assert!(matches!(class.validate(), Err(Error::DuplicateName(_))));
    }

    #[test]
    fn test_duplicate_property_id_rejected() {
        let mut class = person();
        class
            .properties
            .push(PropertyDef::text("Extra", 10).with_id(PropertyId(1)));
        assert!(matches!(class.validate(), Err(Error::SchemaConflict(_))));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let class = person();
        let bytes = class.to_bytes().unwrap();
        let decoded = ClassDef::from_bytes(&bytes).unwrap();
        assert_eq!(class, decoded);
    }
}
