//! Column mapping: assignment of properties to fixed physical slots.
//!
//! A bounded alphabet of physical column slots is multiplexed across
//! many logical classes; a slot reused by different properties over time
//! stays unambiguous because each assignment records the occupant's data
//! type and named flags.

use super::{DataType, PropertyDef, PropertyId};
use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

/// Number of fixed column slots available per object record.
pub const COLUMN_SLOTS: usize = 10;

/// Named control flags of a slot occupant.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct SlotFlags {
    /// Slot participates in a secondary index.
    pub indexed: bool,
    /// Slot values are unique across the class.
    pub unique: bool,
    /// Slot value changes are tracked.
    pub tracked: bool,
}

impl SlotFlags {
    /// Derive flags from a property definition.
    pub fn from_property(prop: &PropertyDef) -> Self {
        Self {
            indexed: prop.indexed,
            unique: prop.unique,
            tracked: prop.track_changes,
        }
    }
}

/// One slot-to-property assignment.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub struct SlotAssignment {
    /// Slot index, 0-based, below `COLUMN_SLOTS`.
    pub slot: u8,
    /// Occupant property.
    pub property: PropertyId,
    /// Logical data type stored in the slot for this class.
    pub data_type: DataType,
    /// Control flags of the occupant.
    pub flags: SlotFlags,
}

/// The slot assignment table of one class.
///
/// Properties absent from the table live in overflow attribute rows.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Default,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct ColumnMapping {
    /// Assignments ordered by slot index.
    pub slots: Vec<SlotAssignment>,
}

impl ColumnMapping {
    /// An empty mapping (everything in overflow storage).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of assigned slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slots are assigned.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The slot assigned to a property, if any.
    pub fn slot_for(&self, property: PropertyId) -> Option<u8> {
        self.slots
            .iter()
            .find(|a| a.property == property)
            .map(|a| a.slot)
    }

    /// The assignment occupying a slot, if any.
    pub fn occupant(&self, slot: u8) -> Option<&SlotAssignment> {
        self.slots.iter().find(|a| a.slot == slot)
    }

    /// Iterate over mapped property ids.
    pub fn mapped_properties(&self) -> impl Iterator<Item = PropertyId> + '_ {
        self.slots.iter().map(|a| a.property)
    }
}
