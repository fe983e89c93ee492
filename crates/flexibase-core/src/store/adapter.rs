//! The object store: sled-backed persistence for object rows.
//!
//! Tree layout:
//! - `objects`:     object id -> ObjectRecord (slots + metadata)
//! - `overflow`:    (object, property, occurrence) -> Value
//! - `index:class`: (class, object) -> () membership index
//! - `index:refs`:  (target, source, property) -> () reverse references
//! - `store:meta`:  id counters

use std::sync::atomic::{AtomicU64, Ordering};

use sled::{Db, Tree};
use tracing::debug;

use super::config::StoreConfig;
use super::key::{
    class_index_prefix, decode_class_index_key, decode_overflow_key, decode_ref_index_key,
    overflow_prefix, ref_index_prefix, ObjectId,
};
use super::record::{decode_value, ObjectData, ObjectRecord};
use super::transaction::{Transaction, TxOp};
use crate::error::Error;
use crate::schema::{ClassDef, ClassId, PropertyId};

/// Key for the next object id in the meta tree.
const NEXT_OBJECT_ID_KEY: &[u8] = b"next_object_id";

/// Sled-backed object store.
pub struct ObjectStore {
    db: Db,
    objects: Tree,
    overflow: Tree,
    class_index: Tree,
    ref_index: Tree,
    meta: Tree,
    /// Next object id to allocate (cached).
    next_object_id: AtomicU64,
}

impl ObjectStore {
    /// Open or create an object store.
    pub fn open(config: StoreConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        let objects = db.open_tree("objects")?;
        let overflow = db.open_tree("overflow")?;
        let class_index = db.open_tree("index:class")?;
        let ref_index = db.open_tree("index:refs")?;
        let meta = db.open_tree("store:meta")?;

        let next_object_id = match meta.get(NEXT_OBJECT_ID_KEY)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_ref().try_into().map_err(|_| Error::InvalidKey)?;
                u64::from_be_bytes(arr)
            }
            None => 1,
        };

        debug!(next_object_id, "opened object store");

        Ok(Self {
            db,
            objects,
            overflow,
            class_index,
            ref_index,
            meta,
            next_object_id: AtomicU64::new(next_object_id),
        })
    }

    /// The underlying sled database, shared with the schema registry.
    pub fn db(&self) -> &Db {
        &self.db
    }

    pub(crate) fn objects_tree(&self) -> &Tree {
        &self.objects
    }

    pub(crate) fn overflow_tree(&self) -> &Tree {
        &self.overflow
    }

    pub(crate) fn class_index_tree(&self) -> &Tree {
        &self.class_index
    }

    pub(crate) fn ref_index_tree(&self) -> &Tree {
        &self.ref_index
    }

    /// Allocate a fresh object id.
    pub fn next_object_id(&self) -> Result<ObjectId, Error> {
        let id = self.next_object_id.fetch_add(1, Ordering::SeqCst);
        self.meta
            .insert(NEXT_OBJECT_ID_KEY, &(id + 1).to_be_bytes())?;
        Ok(ObjectId(id))
    }

    /// Begin a new write batch.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Read a raw object record. Tombstones read as absent.
    pub fn read_record(&self, id: ObjectId) -> Result<Option<ObjectRecord>, Error> {
        match self.objects.get(id.encode())? {
            Some(bytes) => {
                let record = ObjectRecord::from_bytes(&bytes)?;
                if record.deleted {
                    Ok(None)
                } else {
                    Ok(Some(record))
                }
            }
            None => Ok(None),
        }
    }

    /// Read the logical property view of an object through a class
    /// definition.
    ///
    /// Fails with `SchemaConflict` when the row was written under a
    /// different schema version than the definition carries; overflow
    /// attributes whose property no longer exists in the class are
    /// dropped from the view.
    pub fn read_object(&self, class: &ClassDef, id: ObjectId) -> Result<Option<ObjectData>, Error> {
        let Some(record) = self.read_record(id)? else {
            return Ok(None);
        };
        self.assemble_object(class, id, &record).map(Some)
    }

    /// Scan all regular (non-embedded) objects of a class.
    pub fn scan_class(&self, class: &ClassDef) -> Result<Vec<(ObjectId, ObjectData)>, Error> {
        let mut out = Vec::new();
        for member in self.class_members(class.id)? {
            let Some(record) = self.read_record(member)? else {
                continue;
            };
            if record.embedded {
                continue;
            }
            out.push((member, self.assemble_object(class, member, &record)?));
        }
        Ok(out)
    }

    /// Scan every row of a class, embedded rows included. Used by
    /// schema migrations, which must rewrite hidden rows too.
    pub fn scan_class_all(
        &self,
        class: &ClassDef,
    ) -> Result<Vec<(ObjectId, ObjectData, bool)>, Error> {
        let mut out = Vec::new();
        for member in self.class_members(class.id)? {
            let Some(record) = self.read_record(member)? else {
                continue;
            };
            let embedded = record.embedded;
            out.push((member, self.assemble_object(class, member, &record)?, embedded));
        }
        Ok(out)
    }

    /// Object ids listed under a class, including embedded rows.
    pub fn class_members(&self, class: ClassId) -> Result<Vec<ObjectId>, Error> {
        let mut out = Vec::new();
        for result in self.class_index.scan_prefix(class_index_prefix(class)) {
            let (key, _) = result?;
            let (_, object) = decode_class_index_key(&key).ok_or(Error::InvalidKey)?;
            out.push(object);
        }
        Ok(out)
    }

    /// Number of non-embedded objects in a class.
    pub fn count_class(&self, class: &ClassDef) -> Result<usize, Error> {
        let mut count = 0;
        for member in self.class_members(class.id)? {
            if let Some(record) = self.read_record(member)? {
                if !record.embedded {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// All (source, property) pairs referencing a target object.
    pub fn references_to(&self, target: ObjectId) -> Result<Vec<(ObjectId, PropertyId)>, Error> {
        let mut out = Vec::new();
        for result in self.ref_index.scan_prefix(ref_index_prefix(target)) {
            let (key, _) = result?;
            let (_, source, property) = decode_ref_index_key(&key).ok_or(Error::InvalidKey)?;
            out.push((source, property));
        }
        Ok(out)
    }

    /// Number of references pointing at a target object.
    pub fn reference_count(&self, target: ObjectId) -> Result<usize, Error> {
        Ok(self.references_to(target)?.len())
    }

    /// Validate object data against a class definition.
    ///
    /// Checks that every property exists in the class, values match
    /// their types and constraints, and occurrence counts stay within
    /// `min_occurs..=max_occurs`.
    pub fn validate_object(
        &self,
        class: &ClassDef,
        id: ObjectId,
        data: &ObjectData,
    ) -> Result<(), Error> {
        for (property, values) in data.iter() {
            let def = class.require_property(property)?;
            if values.len() > def.max_occurs as usize {
                return Err(Error::ValidationFailure {
                    property,
                    reason: format!(
                        "{} values exceed max_occurs {}",
                        values.len(),
                        def.max_occurs
                    ),
                });
            }
            for value in values {
                def.validate_value(value)?;
            }
        }
        for def in class.required_properties() {
            let count = data
                .get_all(def.id)
                .iter()
                .filter(|v| !v.is_null())
                .count();
            if count < def.min_occurs as usize {
                return Err(Error::CardinalityViolation {
                    property: def.id,
                    object: id,
                    min: def.min_occurs,
                });
            }
        }
        Ok(())
    }

    /// Stage a full object insert into a batch.
    ///
    /// Defaults of required properties are applied before validation.
    /// Embedded rows skip the class membership index and stay invisible
    /// to scans.
    pub fn stage_insert(
        &self,
        tx: &mut Transaction<'_>,
        class: &ClassDef,
        id: ObjectId,
        data: &ObjectData,
        embedded: bool,
    ) -> Result<(), Error> {
        let data = self.apply_defaults(class, data);
        self.validate_object(class, id, &data)?;

        let mut record = ObjectRecord::new(class.id.0, class.version, embedded);
        for assignment in &class.mapping.slots {
            if let Some(value) = data.get(assignment.property) {
                record.slots[assignment.slot as usize] = value.clone();
            }
        }
        tx.push(TxOp::PutRecord { id, record });
        tx.push(TxOp::PutClassIndex {
            class: class.id,
            id,
        });

        for (property, values) in data.iter() {
            let mapped = class.mapping.slot_for(property).is_some();
            for (occurrence, value) in values.iter().enumerate() {
                if !mapped {
                    tx.push(TxOp::PutOverflow {
                        id,
                        property,
                        occurrence: occurrence as u32,
                        value: value.clone(),
                    });
                }
                if let Some(target) = value.as_ref_id() {
                    tx.push(TxOp::PutRefIndex {
                        target: ObjectId(target),
                        source: id,
                        property,
                    });
                }
            }
        }
        Ok(())
    }

    /// Stage a full object rewrite into a batch.
    ///
    /// The object's physical footprint (overflow rows, reference
    /// entries) is replaced wholesale; the class definition supplies the
    /// new slot layout and schema version.
    pub fn stage_update(
        &self,
        tx: &mut Transaction<'_>,
        class: &ClassDef,
        id: ObjectId,
        data: &ObjectData,
    ) -> Result<(), Error> {
        let existing = tx.read_record(id)?.ok_or(Error::ObjectNotFound(id))?;
        self.stage_physical_cleanup(tx, id)?;
        if existing.class != class.id.0 {
            tx.push(TxOp::DeleteClassIndex {
                class: ClassId(existing.class),
                id,
            });
        }

        let data = self.apply_defaults(class, data);
        self.validate_object(class, id, &data)?;

        let mut record = ObjectRecord::new(class.id.0, class.version, existing.embedded);
        record.created_at = existing.created_at;
        for assignment in &class.mapping.slots {
            if let Some(value) = data.get(assignment.property) {
                record.slots[assignment.slot as usize] = value.clone();
            }
        }
        tx.push(TxOp::PutRecord { id, record });
        tx.push(TxOp::PutClassIndex {
            class: class.id,
            id,
        });

        for (property, values) in data.iter() {
            let mapped = class.mapping.slot_for(property).is_some();
            for (occurrence, value) in values.iter().enumerate() {
                if !mapped {
                    tx.push(TxOp::PutOverflow {
                        id,
                        property,
                        occurrence: occurrence as u32,
                        value: value.clone(),
                    });
                }
                if let Some(target) = value.as_ref_id() {
                    tx.push(TxOp::PutRefIndex {
                        target: ObjectId(target),
                        source: id,
                        property,
                    });
                }
            }
        }
        Ok(())
    }

    /// Stage an object delete (tombstone) into a batch.
    ///
    /// Removes the class membership, overflow rows and outgoing
    /// reference entries. Incoming references are the caller's concern.
    pub fn stage_delete(
        &self,
        tx: &mut Transaction<'_>,
        class: &ClassDef,
        id: ObjectId,
    ) -> Result<(), Error> {
        let existing = tx.read_record(id)?.ok_or(Error::ObjectNotFound(id))?;
        self.stage_physical_cleanup(tx, id)?;
        tx.push(TxOp::PutRecord {
            id,
            record: ObjectRecord::tombstone(existing.class, existing.schema_version),
        });
        tx.push(TxOp::DeleteClassIndex {
            class: class.id,
            id,
        });
        if existing.class != class.id.0 {
            tx.push(TxOp::DeleteClassIndex {
                class: ClassId(existing.class),
                id,
            });
        }
        Ok(())
    }

    /// Stage a hard removal of an object row. Used when reversing a
    /// create.
    pub fn stage_purge(
        &self,
        tx: &mut Transaction<'_>,
        class: ClassId,
        id: ObjectId,
    ) -> Result<(), Error> {
        self.stage_physical_cleanup(tx, id)?;
        tx.push(TxOp::DeleteRecord { id });
        tx.push(TxOp::DeleteClassIndex { class, id });
        Ok(())
    }

    /// Insert one object in its own batch, returning its id.
    pub fn insert_object(&self, class: &ClassDef, data: &ObjectData) -> Result<ObjectId, Error> {
        let id = self.next_object_id()?;
        let mut tx = self.transaction();
        self.stage_insert(&mut tx, class, id, data, false)?;
        tx.commit()?;
        Ok(id)
    }

    /// Rewrite one object in its own batch.
    pub fn update_object(
        &self,
        class: &ClassDef,
        id: ObjectId,
        data: &ObjectData,
    ) -> Result<(), Error> {
        let mut tx = self.transaction();
        self.stage_update(&mut tx, class, id, data)?;
        tx.commit()
    }

    /// Delete one object in its own batch.
    pub fn delete_object(&self, class: &ClassDef, id: ObjectId) -> Result<(), Error> {
        let mut tx = self.transaction();
        self.stage_delete(&mut tx, class, id)?;
        tx.commit()
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }

    /// Build the logical view of a record through a class definition.
    fn assemble_object(
        &self,
        class: &ClassDef,
        id: ObjectId,
        record: &ObjectRecord,
    ) -> Result<ObjectData, Error> {
        if record.class != class.id.0 {
            return Err(Error::SchemaConflict(format!(
                "object {} belongs to class {}, not {}",
                id, record.class, class.id
            )));
        }
        if record.schema_version != class.version {
            return Err(Error::SchemaConflict(format!(
                "object {} was written under schema version {} of class '{}', current is {}",
                id, record.schema_version, class.name, class.version
            )));
        }

        let mut data = ObjectData::new();
        for assignment in &class.mapping.slots {
            let value = &record.slots[assignment.slot as usize];
            if !value.is_null() {
                data.push(assignment.property, value.clone());
            }
        }
        for result in self.overflow.scan_prefix(overflow_prefix(id)) {
            let (key, bytes) = result?;
            let (_, property, _) = decode_overflow_key(&key).ok_or(Error::InvalidKey)?;
            // Attributes of properties removed from the class stay on
            // disk but vanish from the logical view.
            if class.get_property(property).is_none() {
                continue;
            }
            data.push(property, decode_value(&bytes)?);
        }
        Ok(data)
    }

    /// Stage removal of all overflow rows and outgoing reference
    /// entries of an object, based on committed state.
    fn stage_physical_cleanup(&self, tx: &mut Transaction<'_>, id: ObjectId) -> Result<(), Error> {
        for result in self.overflow.scan_prefix(overflow_prefix(id)) {
            let (key, bytes) = result?;
            let (_, property, occurrence) = decode_overflow_key(&key).ok_or(Error::InvalidKey)?;
            let value = decode_value(&bytes)?;
            if let Some(target) = value.as_ref_id() {
                tx.push(TxOp::DeleteRefIndex {
                    target: ObjectId(target),
                    source: id,
                    property,
                });
            }
            tx.push(TxOp::DeleteOverflow {
                id,
                property,
                occurrence,
            });
        }
        Ok(())
    }

    /// Clone data with defaults of absent required properties filled in.
    fn apply_defaults(&self, class: &ClassDef, data: &ObjectData) -> ObjectData {
        let mut data = data.clone();
        for def in class.required_properties() {
            if !data.contains(def.id) {
                if let Some(default) = &def.default_value {
                    data.set(def.id, default.clone());
                }
            }
        }
        data
    }
}
