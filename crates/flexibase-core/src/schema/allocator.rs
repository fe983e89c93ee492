//! Column slot allocation.
//!
//! Pure and deterministic: the same property list always yields the same
//! mapping, which keeps `alter_class` idempotent when reapplied.

use super::{ColumnMapping, PropertyDef, SlotAssignment, SlotFlags, COLUMN_SLOTS};

/// Compute the default column mapping for a property list.
///
/// Mappable properties (single-valued scalars with bounded storage) are
/// greedily assigned to the fixed slot alphabet in declaration order,
/// ties broken by ascending property id. Remaining mappable properties
/// and all overflow-only properties fall back to attribute-row storage.
pub fn allocate_columns(properties: &[PropertyDef]) -> ColumnMapping {
    let mut candidates: Vec<(usize, &PropertyDef)> = properties
        .iter()
        .enumerate()
        .filter(|(_, p)| p.is_mappable())
        .collect();
    candidates.sort_by_key(|(idx, p)| (*idx, p.id));

    let slots = candidates
        .into_iter()
        .take(COLUMN_SLOTS)
        .enumerate()
        .map(|(slot, (_, prop))| SlotAssignment {
            slot: slot as u8,
            property: prop.id,
            data_type: prop.data_type,
            flags: SlotFlags::from_property(prop),
        })
        .collect();

    ColumnMapping { slots }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ClassId, DataType, PropertyId};

    fn prop(id: u64, name: &str, data_type: DataType) -> PropertyDef {
        let mut p = PropertyDef::new(name, data_type);
        if data_type == DataType::Text {
            p.max_length = Some(64);
        }
        p.with_id(PropertyId(id))
    }

    #[test]
    fn test_declaration_order_assignment() {
        let props = vec![
            prop(3, "C", DataType::Integer),
            prop(1, "A", DataType::Text),
            prop(2, "B", DataType::Float),
        ];
        let mapping = allocate_columns(&props);

        assert_eq!(mapping.len(), 3);
        assert_eq!(mapping.slot_for(PropertyId(3)), Some(0));
        assert_eq!(mapping.slot_for(PropertyId(1)), Some(1));
        assert_eq!(mapping.slot_for(PropertyId(2)), Some(2));
    }

    #[test]
    fn test_overflow_only_excluded() {
        let props = vec![
            prop(1, "Name", DataType::Text),
            prop(2, "Photo", DataType::Blob),
            prop(3, "Tags", DataType::Text).multi_valued(5),
            PropertyDef::link("Owner", ClassId(9)).with_id(PropertyId(4)),
            PropertyDef::new("Notes", DataType::Text).with_id(PropertyId(5)),
        ];
        let mapping = allocate_columns(&props);

        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.slot_for(PropertyId(1)), Some(0));
        assert_eq!(mapping.slot_for(PropertyId(2)), None);
        assert_eq!(mapping.slot_for(PropertyId(3)), None);
        assert_eq!(mapping.slot_for(PropertyId(4)), None);
        // Unbounded text stays in overflow storage.
        assert_eq!(mapping.slot_for(PropertyId(5)), None);
    }

    #[test]
    fn test_slot_exhaustion() {
        let props: Vec<PropertyDef> = (1..=15)
            .map(|i| prop(i, &format!("P{}", i), DataType::Integer))
            .collect();
        let mapping = allocate_columns(&props);

        assert_eq!(mapping.len(), COLUMN_SLOTS);
        assert_eq!(mapping.slot_for(PropertyId(10)), Some(9));
        assert_eq!(mapping.slot_for(PropertyId(11)), None);
    }

    #[test]
    fn test_deterministic() {
        let props = vec![
            prop(7, "X", DataType::Integer),
            prop(2, "Y", DataType::Text),
            prop(5, "Z", DataType::Bool),
        ];
        let a = allocate_columns(&props);
        let b = allocate_columns(&props);
        assert_eq!(a, b);
    }

    #[test]
    fn test_flags_carried_into_slot() {
        let props = vec![prop(1, "Email", DataType::Text)
            .with_unique()
            .with_index()
            .with_track_changes()];
        let mapping = allocate_columns(&props);
        let slot = mapping.occupant(0).unwrap();
        assert!(slot.flags.indexed);
        assert!(slot.flags.unique);
        assert!(slot.flags.tracked);
        assert_eq!(slot.data_type, DataType::Text);
    }
}
