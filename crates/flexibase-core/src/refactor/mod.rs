//! Structural refactoring: schema+data transformations executed as
//! atomic, auditable and (where possible) reversible operations.

pub mod engine;
pub mod expr;
pub mod filter;
pub mod lock;
pub mod report;

pub use engine::{RefactoringEngine, TargetClass};
pub use expr::{eval_concat, SplitRule, SurvivorCandidate, SurvivorPolicy};
pub use filter::{named_row, ObjectFilter, PredicateEvaluator};
pub use lock::{ClassLockGuard, ClassLockManager};
pub use report::{ActionReport, RowDelta, SchemaDelta, SkippedObject};

use crate::schema::PropertyId;

/// One (source property -> target property) pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyMapEntry {
    /// Property on the source side.
    pub source: PropertyId,
    /// Property on the target side. `PropertyId::UNASSIGNED` asks the
    /// operation to create a matching property on the target.
    pub target: PropertyId,
}

/// An ordered set of property pairings used whenever an operation
/// reconciles properties across two classes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyMap {
    /// Pairings in declaration order.
    pub entries: Vec<PropertyMapEntry>,
}

impl PropertyMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pairing.
    pub fn map(mut self, source: PropertyId, target: PropertyId) -> Self {
        self.entries.push(PropertyMapEntry { source, target });
        self
    }

    /// Add a pairing that creates the target property.
    pub fn map_to_new(self, source: PropertyId) -> Self {
        self.map(source, PropertyId::UNASSIGNED)
    }

    /// The target paired with a source property.
    pub fn get(&self, source: PropertyId) -> Option<PropertyId> {
        self.entries
            .iter()
            .find(|e| e.source == source)
            .map(|e| e.target)
    }

    /// Swap the direction of every pairing.
    pub fn inverse(&self) -> PropertyMap {
        PropertyMap {
            entries: self
                .entries
                .iter()
                .map(|e| PropertyMapEntry {
                    source: e.target,
                    target: e.source,
                })
                .collect(),
        }
    }

    /// Source properties in order.
    pub fn sources(&self) -> impl Iterator<Item = PropertyId> + '_ {
        self.entries.iter().map(|e| e.source)
    }

    /// Number of pairings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no pairings.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_map_lookup_and_inverse() {
        let map = PropertyMap::new()
            .map(PropertyId(1), PropertyId(10))
            .map(PropertyId(2), PropertyId(20));

        assert_eq!(map.get(PropertyId(1)), Some(PropertyId(10)));
        assert_eq!(map.get(PropertyId(3)), None);
        assert_eq!(map.inverse().get(PropertyId(10)), Some(PropertyId(1)));
        assert_eq!(map.len(), 2);
    }
}
