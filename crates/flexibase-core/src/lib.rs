//! Flexibase core - dynamic-schema catalog, column mapping, object
//! storage, and the structural refactoring engine.
//!
//! Classes and their properties can be redefined, split, merged, or
//! migrated at runtime. Property values live either in a bounded set of
//! reusable fixed column slots or in overflow attribute rows; the
//! refactoring engine rewrites schema and bulk object data together as
//! atomic, auditable operations.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod error;
pub mod refactor;
pub mod schema;
pub mod store;

pub use error::Error;
pub use refactor::{
    ActionReport, ClassLockManager, ObjectFilter, PropertyMap, PropertyMapEntry,
    RefactoringEngine, RowDelta, SchemaDelta, SplitRule, SurvivorPolicy, TargetClass,
};
pub use schema::{
    allocate_columns, ClassDef, ClassId, ColumnMapping, DataType, PropertyDef, PropertyId,
    SchemaRegistry, SlotAssignment, SlotFlags, COLUMN_SLOTS,
};
pub use store::{ObjectData, ObjectId, ObjectRecord, ObjectStore, StoreConfig, Transaction};

/// Re-export shared protocol types.
pub use flexibase_proto as proto;
