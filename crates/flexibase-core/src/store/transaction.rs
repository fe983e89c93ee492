//! Atomic multi-tree write batches.
//!
//! Refactoring operations touch many objects across the object, overflow
//! and index trees; all of those writes commit together or not at all.

use std::collections::HashMap;

use sled::Transactional;

use super::key::{class_index_key, overflow_key, ref_index_key, ObjectId};
use super::record::{encode_value, ObjectRecord};
use super::ObjectStore;
use crate::error::Error;
use crate::schema::{ClassId, PropertyId};
use flexibase_proto::Value;

/// A pending operation in a write batch.
#[derive(Debug, Clone)]
pub enum TxOp {
    /// Put an object record (insert, update or tombstone).
    PutRecord {
        /// Object id.
        id: ObjectId,
        /// Record to write.
        record: ObjectRecord,
    },
    /// Remove an object record entirely. Used when reversing a create.
    DeleteRecord {
        /// Object id.
        id: ObjectId,
    },
    /// Put an overflow attribute value.
    PutOverflow {
        /// Owning object.
        id: ObjectId,
        /// Property the value belongs to.
        property: PropertyId,
        /// Occurrence index within the property.
        occurrence: u32,
        /// The value.
        value: Value,
    },
    /// Remove an overflow attribute value.
    DeleteOverflow {
        /// Owning object.
        id: ObjectId,
        /// Property the value belongs to.
        property: PropertyId,
        /// Occurrence index within the property.
        occurrence: u32,
    },
    /// Add a class membership entry.
    PutClassIndex {
        /// Class.
        class: ClassId,
        /// Member object.
        id: ObjectId,
    },
    /// Remove a class membership entry.
    DeleteClassIndex {
        /// Class.
        class: ClassId,
        /// Member object.
        id: ObjectId,
    },
    /// Add a reverse reference entry.
    PutRefIndex {
        /// Referenced object.
        target: ObjectId,
        /// Referencing object.
        source: ObjectId,
        /// Referencing property.
        property: PropertyId,
    },
    /// Remove a reverse reference entry.
    DeleteRefIndex {
        /// Referenced object.
        target: ObjectId,
        /// Referencing object.
        source: ObjectId,
        /// Referencing property.
        property: PropertyId,
    },
}

/// Which tree a planned write targets.
enum TreeSlot {
    Objects,
    Overflow,
    ClassIndex,
    RefIndex,
}

/// A fully serialized write, ready to apply inside the sled closure.
struct PlannedWrite {
    tree: TreeSlot,
    key: Vec<u8>,
    /// None removes the key.
    value: Option<Vec<u8>>,
}

/// A write batch over the object store.
///
/// Operations are collected and executed atomically on commit. Record
/// reads within the batch see uncommitted writes.
pub struct Transaction<'a> {
    store: &'a ObjectStore,
    ops: Vec<TxOp>,
    /// Uncommitted record states (None marks a pending delete/tombstone).
    write_cache: HashMap<ObjectId, Option<ObjectRecord>>,
}

impl<'a> Transaction<'a> {
    /// Create a new empty batch.
    pub(crate) fn new(store: &'a ObjectStore) -> Self {
        Self {
            store,
            ops: Vec::new(),
            write_cache: HashMap::new(),
        }
    }

    /// Queue any operation.
    pub fn push(&mut self, op: TxOp) -> &mut Self {
        match &op {
            TxOp::PutRecord { id, record } => {
                let visible = if record.deleted {
                    None
                } else {
                    Some(record.clone())
                };
                self.write_cache.insert(*id, visible);
            }
            TxOp::DeleteRecord { id } => {
                self.write_cache.insert(*id, None);
            }
            _ => {}
        }
        self.ops.push(op);
        self
    }

    /// Read a record, seeing uncommitted writes from this batch.
    pub fn read_record(&self, id: ObjectId) -> Result<Option<ObjectRecord>, Error> {
        if let Some(cached) = self.write_cache.get(&id) {
            return Ok(cached.clone());
        }
        self.store.read_record(id)
    }

    /// Number of pending operations.
    pub fn operation_count(&self) -> usize {
        self.ops.len()
    }

    /// Discard all pending operations.
    pub fn rollback(self) {
        drop(self.ops);
    }

    /// Commit the batch atomically: every write succeeds or none do.
    pub fn commit(self) -> Result<(), Error> {
        if self.ops.is_empty() {
            return Ok(());
        }

        // Serialize outside the sled closure; it may run more than once.
        let plan = self.plan()?;

        let objects = self.store.objects_tree();
        let overflow = self.store.overflow_tree();
        let class_index = self.store.class_index_tree();
        let ref_index = self.store.ref_index_tree();

        let result: Result<(), sled::transaction::TransactionError<Error>> =
            (objects, overflow, class_index, ref_index).transaction(
                |(obj_tx, ovf_tx, cls_tx, ref_tx)| {
                    for write in &plan {
                        let tree = match write.tree {
                            TreeSlot::Objects => obj_tx,
                            TreeSlot::Overflow => ovf_tx,
                            TreeSlot::ClassIndex => cls_tx,
                            TreeSlot::RefIndex => ref_tx,
                        };
                        match &write.value {
                            Some(bytes) => {
                                tree.insert(write.key.as_slice(), bytes.as_slice())?;
                            }
                            None => {
                                tree.remove(write.key.as_slice())?;
                            }
                        }
                    }
                    Ok(())
                },
            );

        match result {
            Ok(()) => Ok(()),
            Err(sled::transaction::TransactionError::Abort(e)) => Err(e),
            Err(sled::transaction::TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }

    /// Serialize all pending operations into planned writes.
    fn plan(&self) -> Result<Vec<PlannedWrite>, Error> {
        let mut plan = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            plan.push(match op {
                TxOp::PutRecord { id, record } => PlannedWrite {
                    tree: TreeSlot::Objects,
                    key: id.encode().to_vec(),
                    value: Some(record.to_bytes()?),
                },
                TxOp::DeleteRecord { id } => PlannedWrite {
                    tree: TreeSlot::Objects,
                    key: id.encode().to_vec(),
                    value: None,
                },
                TxOp::PutOverflow {
                    id,
                    property,
                    occurrence,
                    value,
                } => PlannedWrite {
                    tree: TreeSlot::Overflow,
                    key: overflow_key(*id, *property, *occurrence).to_vec(),
                    value: Some(encode_value(value)?),
                },
                TxOp::DeleteOverflow {
                    id,
                    property,
                    occurrence,
                } => PlannedWrite {
                    tree: TreeSlot::Overflow,
                    key: overflow_key(*id, *property, *occurrence).to_vec(),
                    value: None,
                },
                TxOp::PutClassIndex { class, id } => PlannedWrite {
                    tree: TreeSlot::ClassIndex,
                    key: class_index_key(*class, *id).to_vec(),
                    value: Some(Vec::new()),
                },
                TxOp::DeleteClassIndex { class, id } => PlannedWrite {
                    tree: TreeSlot::ClassIndex,
                    key: class_index_key(*class, *id).to_vec(),
                    value: None,
                },
                TxOp::PutRefIndex {
                    target,
                    source,
                    property,
                } => PlannedWrite {
                    tree: TreeSlot::RefIndex,
                    key: ref_index_key(*target, *source, *property).to_vec(),
                    value: Some(Vec::new()),
                },
                TxOp::DeleteRefIndex {
                    target,
                    source,
                    property,
                } => PlannedWrite {
                    tree: TreeSlot::RefIndex,
                    key: ref_index_key(*target, *source, *property).to_vec(),
                    value: None,
                },
            });
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;

    fn test_store() -> ObjectStore {
        ObjectStore::open(StoreConfig::temporary()).unwrap()
    }

    #[test]
    fn test_commit_records() {
        let store = test_store();
        let id1 = store.next_object_id().unwrap();
        let id2 = store.next_object_id().unwrap();

        let mut tx = store.transaction();
        tx.push(TxOp::PutRecord {
            id: id1,
            record: ObjectRecord::new(1, 1, false),
        });
        tx.push(TxOp::PutRecord {
            id: id2,
            record: ObjectRecord::new(1, 1, false),
        });
        tx.commit().unwrap();

        assert!(store.read_record(id1).unwrap().is_some());
        assert!(store.read_record(id2).unwrap().is_some());
    }

    #[test]
    fn test_rollback_discards() {
        let store = test_store();
        let id = store.next_object_id().unwrap();

        let mut tx = store.transaction();
        tx.push(TxOp::PutRecord {
            id,
            record: ObjectRecord::new(1, 1, false),
        });
        tx.rollback();

        assert!(store.read_record(id).unwrap().is_none());
    }

    #[test]
    fn test_read_uncommitted_write() {
        let store = test_store();
        let id = store.next_object_id().unwrap();

        let mut tx = store.transaction();
        tx.push(TxOp::PutRecord {
            id,
            record: ObjectRecord::new(7, 1, false),
        });

        let record = tx.read_record(id).unwrap().unwrap();
        assert_eq!(record.class, 7);
    }

    #[test]
    fn test_tombstone_hides_record() {
        let store = test_store();
        let id = store.next_object_id().unwrap();

        let mut tx = store.transaction();
        tx.push(TxOp::PutRecord {
            id,
            record: ObjectRecord::new(1, 1, false),
        });
        tx.commit().unwrap();

        let mut tx = store.transaction();
        tx.push(TxOp::PutRecord {
            id,
            record: ObjectRecord::tombstone(1, 1),
        });
        assert!(tx.read_record(id).unwrap().is_none());
        tx.commit().unwrap();

        assert!(store.read_record(id).unwrap().is_none());
    }

    #[test]
    fn test_empty_commit() {
        let store = test_store();
        store.transaction().commit().unwrap();
    }

    #[test]
    fn test_overflow_and_index_writes() {
        let store = test_store();
        let id = store.next_object_id().unwrap();

        let mut tx = store.transaction();
        tx.push(TxOp::PutRecord {
            id,
            record: ObjectRecord::new(1, 1, false),
        });
        tx.push(TxOp::PutOverflow {
            id,
            property: PropertyId(5),
            occurrence: 0,
            value: Value::Text("hello".into()),
        });
        tx.push(TxOp::PutClassIndex {
            class: ClassId(1),
            id,
        });
        tx.commit().unwrap();

        let members = store.class_members(ClassId(1)).unwrap();
        assert_eq!(members, vec![id]);
    }
}
