//! Stored object records and their logical property view.

use super::key::current_timestamp;
use crate::error::Error;
use crate::schema::{PropertyId, COLUMN_SLOTS};
use flexibase_proto::Value;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::BTreeMap;

/// A stored object row: fixed column slots plus row metadata.
///
/// Values of properties without a slot assignment live in separate
/// overflow attribute rows keyed by (object, property, occurrence).
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Owning class id.
    pub class: u64,

    /// Schema version of the class this row was written under. A
    /// mismatch against the current class version means the row was not
    /// migrated and must not be interpreted through the current mapping.
    pub schema_version: u64,

    /// Fixed column slot values, always `COLUMN_SLOTS` long. Unassigned
    /// or absent slots hold `Value::Null`.
    pub slots: Vec<Value>,

    /// Embedded sub-object rows are excluded from class scans and only
    /// reachable through a `NestedRef` on the owner.
    pub embedded: bool,

    /// Creation timestamp in microseconds since Unix epoch.
    pub created_at: u64,

    /// Timestamp of the last write, microseconds since Unix epoch.
    pub updated_at: u64,

    /// Whether this record is a tombstone.
    pub deleted: bool,
}

impl ObjectRecord {
    /// Create a new empty record for a class at a schema version.
    pub fn new(class: u64, schema_version: u64, embedded: bool) -> Self {
        let now = current_timestamp();
        Self {
            class,
            schema_version,
            slots: vec![Value::Null; COLUMN_SLOTS],
            embedded,
            created_at: now,
            updated_at: now,
            deleted: false,
        }
    }

    /// Create a tombstone for a deleted object.
    pub fn tombstone(class: u64, schema_version: u64) -> Self {
        let now = current_timestamp();
        Self {
            class,
            schema_version,
            slots: Vec::new(),
            embedded: false,
            created_at: now,
            updated_at: now,
            deleted: true,
        }
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

/// Serialize a single overflow value.
pub(crate) fn encode_value(value: &Value) -> Result<Vec<u8>, Error> {
    rkyv::to_bytes::<rkyv::rancor::Error>(value)
        .map(|v| v.to_vec())
        .map_err(|e| Error::Serialization(e.to_string()))
}

/// Deserialize a single overflow value.
pub(crate) fn decode_value(bytes: &[u8]) -> Result<Value, Error> {
    // sled may hand back unaligned inline buffers; rkyv needs alignment.
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<Value, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Deserialization(e.to_string()))
}

/// The logical property view of one object, independent of where each
/// value is physically stored.
///
/// Values are kept per property in occurrence order; single-valued
/// properties hold a one-element list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectData {
    values: BTreeMap<PropertyId, Vec<Value>>,
}

impl ObjectData {
    /// Create empty object data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property to a single value, replacing prior values.
    pub fn set(&mut self, property: PropertyId, value: Value) -> &mut Self {
        self.values.insert(property, vec![value]);
        self
    }

    /// Append a value to a property's occurrence list.
    pub fn push(&mut self, property: PropertyId, value: Value) -> &mut Self {
        self.values.entry(property).or_default().push(value);
        self
    }

    /// Builder-style single value set.
    pub fn with(mut self, property: PropertyId, value: Value) -> Self {
        self.set(property, value);
        self
    }

    /// The first value of a property, if present.
    pub fn get(&self, property: PropertyId) -> Option<&Value> {
        self.values.get(&property).and_then(|v| v.first())
    }

    /// All values of a property in occurrence order.
    pub fn get_all(&self, property: PropertyId) -> &[Value] {
        self.values.get(&property).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remove a property entirely, returning its values.
    pub fn remove(&mut self, property: PropertyId) -> Option<Vec<Value>> {
        self.values.remove(&property)
    }

    /// Whether any value is stored for a property.
    pub fn contains(&self, property: PropertyId) -> bool {
        self.values.get(&property).is_some_and(|v| !v.is_empty())
    }

    /// Iterate over (property, values) pairs in property id order.
    pub fn iter(&self) -> impl Iterator<Item = (PropertyId, &[Value])> {
        self.values.iter().map(|(p, v)| (*p, v.as_slice()))
    }

    /// Property ids present in this object.
    pub fn properties(&self) -> impl Iterator<Item = PropertyId> + '_ {
        self.values.keys().copied()
    }

    /// Number of properties with at least one value.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no property has a value.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Flatten into (property, occurrence list) pairs. Used for report
    /// row snapshots.
    pub fn to_pairs(&self) -> Vec<(PropertyId, Vec<Value>)> {
        self.values.iter().map(|(p, v)| (*p, v.clone())).collect()
    }

    /// Rebuild from snapshot pairs.
    pub fn from_pairs(pairs: Vec<(PropertyId, Vec<Value>)>) -> Self {
        Self {
            values: pairs.into_iter().collect(),
        }
    }
}
