//! Schema catalog: class and property definitions, column mapping, and
//! the persisted registry.

mod allocator;
mod class;
mod mapping;
mod property;
mod registry;

pub use allocator::allocate_columns;
pub use class::ClassDef;
pub use mapping::{ColumnMapping, SlotAssignment, SlotFlags, COLUMN_SLOTS};
pub use property::{DataType, PropertyDef};
pub(crate) use property::compiled_regex;
pub use registry::SchemaRegistry;

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};
use std::fmt;

/// Stable surrogate key of a class.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct ClassId(pub u64);

/// Stable surrogate key of a class property.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct PropertyId(pub u64);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PropertyId {
    /// Marker for a property definition that has not been assigned an id
    /// by the registry yet.
    pub const UNASSIGNED: PropertyId = PropertyId(0);

    /// Whether this id is the unassigned marker.
    pub fn is_unassigned(&self) -> bool {
        self.0 == 0
    }
}
