//! The refactoring engine: orchestrates schema+data transformations.
//!
//! Every operation follows the same shape: acquire class locks, validate
//! against the current schema, compute the full transformation, stage
//! all row writes into one atomic batch, commit data, then swap the
//! schema definitions, and retain an [`ActionReport`] carrying the
//! pre-images needed for reversal.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::expr::{eval_concat, SplitRule, SurvivorCandidate, SurvivorPolicy};
use super::filter::{named_row, ObjectFilter};
use super::lock::ClassLockManager;
use super::report::{ActionReport, RowDelta};
use super::PropertyMap;
use crate::error::Error;
use crate::schema::{ClassDef, ClassId, ColumnMapping, DataType, PropertyDef, PropertyId, SchemaRegistry};
use crate::store::{ObjectData, ObjectId, ObjectStore, StoreConfig};
use flexibase_proto::Value;

/// Where an operation that needs a second class should put its data.
#[derive(Debug, Clone)]
pub enum TargetClass {
    /// Use an existing class.
    Existing(ClassId),
    /// Create a class with this name, derived from the moved properties.
    New(String),
}

/// The schema & refactoring engine.
pub struct RefactoringEngine {
    store: ObjectStore,
    registry: SchemaRegistry,
    locks: ClassLockManager,
    last_report: Mutex<Option<ActionReport>>,
}

impl RefactoringEngine {
    /// Open an engine over a store configuration.
    pub fn open(config: StoreConfig) -> Result<Self, Error> {
        let store = ObjectStore::open(config)?;
        let registry = SchemaRegistry::open(store.db())?;
        Ok(Self {
            store,
            registry,
            locks: ClassLockManager::new(),
            last_report: Mutex::new(None),
        })
    }

    /// The object store, for ordinary object CRUD.
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// The schema registry, for schema reads.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// The report of the most recently completed operation, if any.
    pub fn last_action_report(&self) -> Option<ActionReport> {
        self.last_report.lock().clone()
    }

    // ---- schema operations -------------------------------------------------

    /// Create a class.
    pub fn create_class(
        &self,
        name: &str,
        properties: Vec<PropertyDef>,
        mapping: Option<ColumnMapping>,
    ) -> Result<ClassDef, Error> {
        let mut report = ActionReport::begin("create_class");
        let class = self.registry.create_class(name, properties, mapping)?;
        report.schema_delta(class.id, None, Some(class.clone()));
        self.finalize(report);
        Ok(class)
    }

    /// Alter a class and migrate every row to the new layout.
    ///
    /// See [`SchemaRegistry::preview_alter`] for how the property list
    /// is interpreted. Values of removed properties are dropped; a
    /// required property left without a value fails the whole operation
    /// with `CardinalityViolation` before anything is written.
    pub fn alter_class(
        &self,
        class_id: ClassId,
        new_properties: Option<Vec<PropertyDef>>,
        new_mapping: Option<ColumnMapping>,
        new_name: Option<&str>,
    ) -> Result<ClassDef, Error> {
        let _guard = self.locks.acquire(&[class_id])?;
        let mut report = ActionReport::begin("alter_class");

        let (pre, post) =
            self.registry
                .preview_alter(class_id, new_properties, new_mapping, new_name)?;

        // Validate the migration of every row before staging anything.
        let rows = self.store.scan_class_all(&pre)?;
        let mut migrated = Vec::with_capacity(rows.len());
        for (id, data, embedded) in rows {
            let new_data = remap_data(&post, id, &data)?;
            self.store.validate_object(&post, id, &new_data)?;
            migrated.push((id, data, new_data, embedded));
        }

        let mut tx = self.store.transaction();
        for (id, before, after, embedded) in &migrated {
            self.store.stage_update(&mut tx, &post, *id, after)?;
            // Even rows with unchanged data were rewritten to the new
            // schema version, so every rewrite is recorded for undo.
            let mut delta = RowDelta::updated(*id, class_id, before.to_pairs(), after.to_pairs());
            if *embedded {
                delta = delta.embedded();
            }
            report.row_delta(delta);
        }
        tx.commit()?;
        self.registry.commit_alter(&pre, post.clone())?;

        report.schema_delta(class_id, Some(pre), Some(post.clone()));
        self.finalize(report);
        Ok(post)
    }

    /// Drop a class together with all of its objects.
    ///
    /// Fails with `ReferentialConflict` while link properties of other
    /// classes still target it. Fully reversible through the retained
    /// row pre-images.
    pub fn drop_class(&self, class_id: ClassId) -> Result<(), Error> {
        let _guard = self.locks.acquire(&[class_id])?;
        let mut report = ActionReport::begin("drop_class");

        let class = self.registry.require_class(class_id)?;
        for other in self.registry.list_classes() {
            if other.id == class_id {
                continue;
            }
            if let Some(prop) = other
                .reference_properties()
                .find(|p| p.referenced_class == Some(class_id))
            {
                return Err(Error::ReferentialConflict(class_id, prop.id, other.id));
            }
        }

        let rows = self.store.scan_class_all(&class)?;
        let mut tx = self.store.transaction();
        for (id, data, embedded) in &rows {
            self.store.stage_delete(&mut tx, &class, *id)?;
            let mut delta = RowDelta::deleted(*id, class_id, data.to_pairs());
            if *embedded {
                delta = delta.embedded();
            }
            report.row_delta(delta);
        }
        tx.commit()?;

        let removed = self.registry.drop_class(class_id)?;
        report.schema_delta(class_id, Some(removed), None);
        self.finalize(report);
        Ok(())
    }

    // ---- extraction operations ---------------------------------------------

    /// Lift plain properties of matched objects into an embedded
    /// sub-object stored under a new reference property.
    ///
    /// The source properties are removed from the owning class; the
    /// sub-objects are hidden rows of the target class, reachable only
    /// through the owner.
    pub fn plain_properties_to_nested_object(
        &self,
        class_id: ClassId,
        prop_ids: &[PropertyId],
        new_ref_prop: PropertyDef,
        filter: &ObjectFilter,
        target: TargetClass,
    ) -> Result<ActionReport, Error> {
        let mut guard = self.locks.acquire(&[class_id])?;
        let mut report = ActionReport::begin("plain_properties_to_nested_object");

        let class = self.registry.require_class(class_id)?;
        let moved = plain_props(&class, prop_ids)?;
        let (target_class, name_map, _created) =
            self.resolve_extraction_target(&target, &moved, &[], &mut report)?;
        guard.extend(&[target_class.id])?;

        let mut ref_prop = new_ref_prop;
        ref_prop.data_type = DataType::Nested;
        ref_prop.referenced_class = Some(target_class.id);

        let (pre, post, ref_prop_id) = self.preview_reshape(&class, prop_ids, Some(ref_prop))?;

        let rows = self.store.scan_class_all(&pre)?;
        let mut planned: Vec<(ObjectId, ObjectData, ObjectData, bool)> = Vec::new();
        let mut nested_rows: Vec<(ObjectId, ObjectData)> = Vec::new();
        for (id, data, embedded) in rows {
            let mut new_data = remap_data(&post, id, &data)?;
            if filter.matches(&pre, id, &data)? {
                report.matched += 1;
                let sub = extract_mapped(&data, prop_ids, &name_map);
                if !sub.is_empty() {
                    let nested_id = self.store.next_object_id()?;
                    self.store
                        .validate_object(&target_class, nested_id, &sub)?;
                    new_data.set(ref_prop_id, Value::NestedRef(nested_id.0));
                    nested_rows.push((nested_id, sub));
                }
            }
            self.store.validate_object(&post, id, &new_data)?;
            planned.push((id, data, new_data, embedded));
        }

        let mut tx = self.store.transaction();
        for (nested_id, sub) in &nested_rows {
            self.store
                .stage_insert(&mut tx, &target_class, *nested_id, sub, true)?;
            report.row_delta(RowDelta::created(*nested_id, target_class.id, sub.to_pairs()).embedded());
        }
        for (id, before, after, embedded) in &planned {
            self.store.stage_update(&mut tx, &post, *id, after)?;
            // Even rows with unchanged data were rewritten to the new
            // schema version, so every rewrite is recorded for undo.
            let mut delta = RowDelta::updated(*id, class_id, before.to_pairs(), after.to_pairs());
            if *embedded {
                delta = delta.embedded();
            }
            report.row_delta(delta);
        }
        tx.commit()?;
        self.registry.commit_alter(&pre, post.clone())?;

        report.schema_delta(class_id, Some(pre), Some(post));
        Ok(self.finalize(report))
    }

    /// Extract plain properties of matched objects into separate,
    /// independently addressable objects of a target class, replaced on
    /// the owner by a link property.
    ///
    /// When `source_key`/`target_key` are given, an existing target
    /// object with an equal key value is reused instead of creating a
    /// duplicate; `update_data` controls whether reused targets are
    /// overwritten with the extracted values.
    #[allow(clippy::too_many_arguments)]
    pub fn plain_properties_to_linked_object(
        &self,
        class_id: ClassId,
        prop_ids: &[PropertyId],
        new_ref_prop: PropertyDef,
        filter: &ObjectFilter,
        target: TargetClass,
        update_data: bool,
        source_key: Option<PropertyId>,
        target_key: Option<PropertyId>,
    ) -> Result<ActionReport, Error> {
        let mut guard = self.locks.acquire(&[class_id])?;
        let mut report = ActionReport::begin("plain_properties_to_linked_object");

        let class = self.registry.require_class(class_id)?;
        let moved = plain_props(&class, prop_ids)?;
        let overrides: Vec<(PropertyId, PropertyId)> = match (source_key, target_key) {
            (Some(s), Some(t)) => vec![(s, t)],
            _ => Vec::new(),
        };
        let (target_class, name_map, _created) =
            self.resolve_extraction_target(&target, &moved, &overrides, &mut report)?;
        guard.extend(&[target_class.id])?;

        let mut ref_prop = new_ref_prop;
        ref_prop.data_type = DataType::Link;
        ref_prop.referenced_class = Some(target_class.id);

        let (pre, post, ref_prop_id) = self.preview_reshape(&class, prop_ids, Some(ref_prop))?;

        // Dedupe probe: existing target objects keyed by their key value.
        // When the target class was just created the caller cannot know
        // its property ids, so the key is resolved through the pairing.
        let target_key = match (source_key, target_key) {
            (Some(source), None) => name_map.get(source),
            (_, explicit) => explicit,
        };
        let dedupe = source_key.zip(target_key);
        let mut key_index: HashMap<String, ObjectId> = HashMap::new();
        if let Some((_, tkey)) = dedupe {
            target_class.require_property(tkey)?;
            for (tid, tdata) in self.store.scan_class(&target_class)? {
                if let Some(value) = tdata.get(tkey) {
                    key_index.entry(value.to_display_string()).or_insert(tid);
                }
            }
        }

        let rows = self.store.scan_class_all(&pre)?;
        let mut planned: Vec<(ObjectId, ObjectData, ObjectData, bool)> = Vec::new();
        let mut new_targets: Vec<(ObjectId, ObjectData)> = Vec::new();
        let mut target_updates: HashMap<ObjectId, ObjectData> = HashMap::new();
        for (id, data, embedded) in rows {
            let mut new_data = remap_data(&post, id, &data)?;
            if filter.matches(&pre, id, &data)? {
                report.matched += 1;
                let sub = extract_mapped(&data, prop_ids, &name_map);
                let linked = match dedupe {
                    Some((skey, _)) => {
                        let key = data
                            .get(skey)
                            .map(Value::to_display_string)
                            .unwrap_or_default();
                        match key_index.get(&key) {
                            Some(existing) => {
                                let existing = *existing;
                                if update_data && !sub.is_empty() {
                                    let entry = match target_updates.get(&existing) {
                                        Some(pending) => pending.clone(),
                                        None => self
                                            .store
                                            .read_object(&target_class, existing)?
                                            .ok_or(Error::ObjectNotFound(existing))?,
                                    };
                                    let mut merged = entry;
                                    for (p, vs) in sub.iter() {
                                        merged.remove(p);
                                        for v in vs {
                                            merged.push(p, v.clone());
                                        }
                                    }
                                    target_updates.insert(existing, merged);
                                }
                                existing
                            }
                            None => {
                                let created = self.store.next_object_id()?;
                                self.store.validate_object(&target_class, created, &sub)?;
                                key_index.insert(key, created);
                                new_targets.push((created, sub));
                                created
                            }
                        }
                    }
                    None => {
                        let created = self.store.next_object_id()?;
                        self.store.validate_object(&target_class, created, &sub)?;
                        new_targets.push((created, sub));
                        created
                    }
                };
                new_data.set(ref_prop_id, Value::ObjectRef(linked.0));
            }
            self.store.validate_object(&post, id, &new_data)?;
            planned.push((id, data, new_data, embedded));
        }

        let mut tx = self.store.transaction();
        for (tid, sub) in &new_targets {
            self.store
                .stage_insert(&mut tx, &target_class, *tid, sub, false)?;
            report.row_delta(RowDelta::created(*tid, target_class.id, sub.to_pairs()));
        }
        for (tid, merged) in &target_updates {
            let before = self
                .store
                .read_object(&target_class, *tid)?
                .ok_or(Error::ObjectNotFound(*tid))?;
            self.store.stage_update(&mut tx, &target_class, *tid, merged)?;
            report.row_delta(RowDelta::updated(
                *tid,
                target_class.id,
                before.to_pairs(),
                merged.to_pairs(),
            ));
        }
        for (id, before, after, embedded) in &planned {
            self.store.stage_update(&mut tx, &post, *id, after)?;
            // Even rows with unchanged data were rewritten to the new
            // schema version, so every rewrite is recorded for undo.
            let mut delta = RowDelta::updated(*id, class_id, before.to_pairs(), after.to_pairs());
            if *embedded {
                delta = delta.embedded();
            }
            report.row_delta(delta);
        }
        tx.commit()?;
        self.registry.commit_alter(&pre, post.clone())?;

        report.schema_delta(class_id, Some(pre), Some(post));
        Ok(self.finalize(report))
    }

    /// Disassemble an embedded sub-object back into plain properties on
    /// the owner, per the property map. The sub-object rows are removed.
    pub fn nested_object_to_plain_properties(
        &self,
        class_id: ClassId,
        ref_prop_id: PropertyId,
        filter: &ObjectFilter,
        prop_map: &PropertyMap,
    ) -> Result<ActionReport, Error> {
        self.dissolve_reference(
            "nested_object_to_plain_properties",
            class_id,
            ref_prop_id,
            filter,
            prop_map,
            true,
        )
    }

    /// Copy a linked object's values back onto the owner as plain
    /// properties, then remove the link property. Linked objects are
    /// left in place, possibly unreferenced.
    pub fn linked_object_to_plain_props(
        &self,
        class_id: ClassId,
        ref_prop_id: PropertyId,
        filter: &ObjectFilter,
        prop_map: &PropertyMap,
    ) -> Result<ActionReport, Error> {
        self.dissolve_reference(
            "linked_object_to_plain_props",
            class_id,
            ref_prop_id,
            filter,
            prop_map,
            false,
        )
    }

    // ---- cross-class operations --------------------------------------------

    /// Merge source objects into target objects matched by equal key
    /// values, copying properties per the map and deleting consumed
    /// sources. Sources without a match are skipped and reported, not
    /// fatal.
    pub fn structural_merge(
        &self,
        source_class_id: ClassId,
        source_filter: &ObjectFilter,
        source_key: PropertyId,
        target_class_id: ClassId,
        target_key: PropertyId,
        prop_map: &PropertyMap,
    ) -> Result<ActionReport, Error> {
        let _guard = self.locks.acquire(&[source_class_id, target_class_id])?;
        let mut report = ActionReport::begin("structural_merge");

        let source_class = self.registry.require_class(source_class_id)?;
        let target_class = self.registry.require_class(target_class_id)?;
        source_class.require_property(source_key)?;
        target_class.require_property(target_key)?;
        for entry in &prop_map.entries {
            source_class.require_property(entry.source)?;
            target_class.require_property(entry.target)?;
        }

        let mut key_index: HashMap<String, ObjectId> = HashMap::new();
        let mut target_states: HashMap<ObjectId, ObjectData> = HashMap::new();
        for (tid, tdata) in self.store.scan_class(&target_class)? {
            if let Some(value) = tdata.get(target_key) {
                key_index.entry(value.to_display_string()).or_insert(tid);
            }
            target_states.insert(tid, tdata);
        }

        let mut consumed: Vec<(ObjectId, ObjectData)> = Vec::new();
        let mut touched: HashMap<ObjectId, ObjectData> = HashMap::new();
        for (sid, sdata) in self.collect_matches(&source_class, source_filter)? {
            report.matched += 1;
            let key = sdata
                .get(source_key)
                .map(Value::to_display_string)
                .unwrap_or_default();
            let Some(&tid) = key_index.get(&key) else {
                debug!(object = %sid, key = %key, "no merge target for source");
                report.skip(sid, Error::NoMatch(sid).to_string());
                continue;
            };
            let state = touched
                .get(&tid)
                .cloned()
                .or_else(|| target_states.get(&tid).cloned())
                .ok_or(Error::ObjectNotFound(tid))?;
            let mut merged = state;
            for entry in &prop_map.entries {
                let values = sdata.get_all(entry.source);
                if !values.is_empty() {
                    merged.remove(entry.target);
                    for v in values {
                        merged.push(entry.target, v.clone());
                    }
                }
            }
            self.store.validate_object(&target_class, tid, &merged)?;
            touched.insert(tid, merged);
            consumed.push((sid, sdata));
        }

        let mut tx = self.store.transaction();
        for (tid, merged) in &touched {
            let before = target_states
                .get(tid)
                .cloned()
                .ok_or(Error::ObjectNotFound(*tid))?;
            self.store.stage_update(&mut tx, &target_class, *tid, merged)?;
            report.row_delta(RowDelta::updated(
                *tid,
                target_class_id,
                before.to_pairs(),
                merged.to_pairs(),
            ));
        }
        for (sid, sdata) in &consumed {
            self.store.stage_delete(&mut tx, &source_class, *sid)?;
            report.row_delta(RowDelta::deleted(*sid, source_class_id, sdata.to_pairs()));
        }
        tx.commit()?;
        Ok(self.finalize(report))
    }

    /// Vertically split matched objects: mapped properties move to
    /// newly created objects of the target class, with no relation
    /// retained between the halves. The moved properties leave the
    /// source class schema.
    pub fn structural_split(
        &self,
        source_class_id: ClassId,
        filter: &ObjectFilter,
        target: TargetClass,
        prop_map: &PropertyMap,
    ) -> Result<ActionReport, Error> {
        let mut guard = self.locks.acquire(&[source_class_id])?;
        let mut report = ActionReport::begin("structural_split");

        let source_class = self.registry.require_class(source_class_id)?;
        let moved_ids: Vec<PropertyId> = prop_map.sources().collect();
        let moved = plain_props(&source_class, &moved_ids)?;
        let overrides: Vec<(PropertyId, PropertyId)> = prop_map
            .entries
            .iter()
            .filter(|e| !e.target.is_unassigned())
            .map(|e| (e.source, e.target))
            .collect();
        let (target_class, name_map, _created) =
            self.resolve_extraction_target(&target, &moved, &overrides, &mut report)?;
        guard.extend(&[target_class.id])?;

        let (pre, post, _) = self.preview_reshape(&source_class, &moved_ids, None)?;

        let rows = self.store.scan_class_all(&pre)?;
        let mut planned: Vec<(ObjectId, ObjectData, ObjectData, bool)> = Vec::new();
        let mut halves: Vec<(ObjectId, ObjectData)> = Vec::new();
        for (id, data, embedded) in rows {
            let new_data = remap_data(&post, id, &data)?;
            if filter.matches(&pre, id, &data)? {
                report.matched += 1;
                let half = extract_mapped(&data, &moved_ids, &name_map);
                if !half.is_empty() {
                    let hid = self.store.next_object_id()?;
                    self.store.validate_object(&target_class, hid, &half)?;
                    halves.push((hid, half));
                }
            }
            self.store.validate_object(&post, id, &new_data)?;
            planned.push((id, data, new_data, embedded));
        }

        let mut tx = self.store.transaction();
        for (hid, half) in &halves {
            self.store
                .stage_insert(&mut tx, &target_class, *hid, half, false)?;
            report.row_delta(RowDelta::created(*hid, target_class.id, half.to_pairs()));
        }
        for (id, before, after, embedded) in &planned {
            self.store.stage_update(&mut tx, &post, *id, after)?;
            let mut delta =
                RowDelta::updated(*id, source_class_id, before.to_pairs(), after.to_pairs());
            if *embedded {
                delta = delta.embedded();
            }
            report.row_delta(delta);
        }
        tx.commit()?;
        self.registry.commit_alter(&pre, post.clone())?;

        report.schema_delta(source_class_id, Some(pre), Some(post));
        Ok(self.finalize(report))
    }

    /// Reassign matched objects to another class, remapping each
    /// object's layout through the property map. Unmapped properties
    /// are dropped; a required target property left empty fails the
    /// whole operation before anything is written.
    pub fn move_to_another_class(
        &self,
        source_class_id: ClassId,
        filter: &ObjectFilter,
        target_class_id: ClassId,
        prop_map: &PropertyMap,
    ) -> Result<ActionReport, Error> {
        let _guard = self.locks.acquire(&[source_class_id, target_class_id])?;
        let mut report = ActionReport::begin("move_to_another_class");

        let source_class = self.registry.require_class(source_class_id)?;
        let target_class = self.registry.require_class(target_class_id)?;
        for entry in &prop_map.entries {
            source_class.require_property(entry.source)?;
            target_class.require_property(entry.target)?;
        }

        let matches = self.collect_matches(&source_class, filter)?;
        let mut planned = Vec::with_capacity(matches.len());
        for (id, data) in matches {
            report.matched += 1;
            let mut moved = ObjectData::new();
            for entry in &prop_map.entries {
                for v in data.get_all(entry.source) {
                    moved.push(entry.target, v.clone());
                }
            }
            let moved = apply_class_defaults(&target_class, moved, id)?;
            self.store.validate_object(&target_class, id, &moved)?;
            planned.push((id, data, moved));
        }

        let mut tx = self.store.transaction();
        for (id, before, after) in &planned {
            self.store.stage_update(&mut tx, &target_class, *id, after)?;
            report.row_delta(
                RowDelta::updated(*id, source_class_id, before.to_pairs(), after.to_pairs())
                    .moved_to(target_class_id),
            );
        }
        tx.commit()?;
        Ok(self.finalize(report))
    }

    /// Collapse duplicate objects onto a single survivor per group.
    ///
    /// Matched objects are grouped by equal values of `key_props`; the
    /// survivor is chosen by `policy`, incoming references to deleted
    /// duplicates are re-pointed at it, and with `replace_target_nulls`
    /// its empty properties are backfilled from the duplicates first.
    /// Running the operation twice deletes nothing the second time.
    pub fn remove_duplicated_objects(
        &self,
        class_id: ClassId,
        filter: &ObjectFilter,
        policy: SurvivorPolicy,
        key_props: &[PropertyId],
        replace_target_nulls: bool,
    ) -> Result<ActionReport, Error> {
        let _guard = self.locks.acquire(&[class_id])?;
        let mut report = ActionReport::begin("remove_duplicated_objects");

        let class = self.registry.require_class(class_id)?;
        for key in key_props {
            class.require_property(*key)?;
        }

        let matches = self.collect_matches(&class, filter)?;
        report.matched = matches.len() as u64;

        let mut groups: HashMap<Vec<String>, Vec<(ObjectId, ObjectData)>> = HashMap::new();
        for (id, data) in matches {
            let key: Vec<String> = key_props
                .iter()
                .map(|p| {
                    data.get(*p)
                        .map(Value::to_display_string)
                        .unwrap_or_default()
                })
                .collect();
            groups.entry(key).or_default().push((id, data));
        }

        // Planned rewrites across all groups, keyed by object id so an
        // object repointed for several duplicates is staged once.
        let mut rewrites: HashMap<ObjectId, (ClassDef, ObjectData, ObjectData)> = HashMap::new();
        let mut deletions: Vec<(ObjectId, ObjectData)> = Vec::new();

        for group in groups.into_values() {
            if group.len() < 2 {
                continue;
            }
            let mut candidates = Vec::with_capacity(group.len());
            for (id, _) in &group {
                let record = self
                    .store
                    .read_record(*id)?
                    .ok_or(Error::ObjectNotFound(*id))?;
                candidates.push(SurvivorCandidate {
                    object: *id,
                    incoming_references: self.store.reference_count(*id)?,
                    created_at: record.created_at,
                    updated_at: record.updated_at,
                });
            }
            let Some(survivor) = policy.pick(&candidates) else {
                continue;
            };
            let survivor_data = group
                .iter()
                .find(|(id, _)| *id == survivor)
                .map(|(_, d)| d.clone())
                .ok_or(Error::ObjectNotFound(survivor))?;
            let duplicates: Vec<&(ObjectId, ObjectData)> =
                group.iter().filter(|(id, _)| *id != survivor).collect();
            let duplicate_ids: Vec<ObjectId> = duplicates.iter().map(|(id, _)| *id).collect();

            if replace_target_nulls {
                let mut filled = rewrites
                    .get(&survivor)
                    .map(|(_, _, after)| after.clone())
                    .unwrap_or_else(|| survivor_data.clone());
                for def in &class.properties {
                    if filled.contains(def.id) {
                        continue;
                    }
                    if let Some((_, donor)) =
                        duplicates.iter().find(|(_, d)| d.contains(def.id))
                    {
                        for v in donor.get_all(def.id) {
                            filled.push(def.id, v.clone());
                        }
                    }
                }
                if filled != survivor_data {
                    rewrites.insert(survivor, (class.clone(), survivor_data.clone(), filled));
                }
            }

            for (dup, ddata) in &duplicates {
                for (src, _) in self.store.references_to(*dup)? {
                    if duplicate_ids.contains(&src) {
                        // The referencing row dies in this batch too.
                        continue;
                    }
                    let (src_class, src_before, mut src_after) = match rewrites.remove(&src) {
                        Some(entry) => entry,
                        None => {
                            let record = self
                                .store
                                .read_record(src)?
                                .ok_or(Error::ObjectNotFound(src))?;
                            let src_class = self.registry.require_class(ClassId(record.class))?;
                            let data = self
                                .store
                                .read_object(&src_class, src)?
                                .ok_or(Error::ObjectNotFound(src))?;
                            (src_class, data.clone(), data)
                        }
                    };
                    src_after = repoint(src_after, *dup, survivor);
                    rewrites.insert(src, (src_class, src_before, src_after));
                }
                deletions.push((*dup, ddata.clone()));
            }
        }

        let mut tx = self.store.transaction();
        for (id, (src_class, before, after)) in &rewrites {
            self.store.stage_update(&mut tx, src_class, *id, after)?;
            report.row_delta(RowDelta::updated(
                *id,
                src_class.id,
                before.to_pairs(),
                after.to_pairs(),
            ));
        }
        for (dup, ddata) in &deletions {
            self.store.stage_delete(&mut tx, &class, *dup)?;
            report.row_delta(RowDelta::deleted(*dup, class_id, ddata.to_pairs()));
        }
        tx.commit()?;
        Ok(self.finalize(report))
    }

    // ---- property derivation operations ------------------------------------

    /// Derive new properties from one source property via per-rule
    /// extraction patterns, then remove the source property.
    ///
    /// A rule that matches nothing yields its property's default value,
    /// or no value at all when there is no default.
    pub fn split_property(
        &self,
        class_id: ClassId,
        source_prop: PropertyId,
        rules: &[SplitRule],
    ) -> Result<ActionReport, Error> {
        let _guard = self.locks.acquire(&[class_id])?;
        let mut report = ActionReport::begin("split_property");

        let class = self.registry.require_class(class_id)?;
        class.require_property(source_prop)?;

        let mut new_props: Vec<PropertyDef> = class
            .properties
            .iter()
            .filter(|p| p.id != source_prop)
            .cloned()
            .collect();
        for rule in rules {
            new_props.push(rule.new_property.clone());
        }
        let (pre, post) = self.registry.preview_alter(class_id, Some(new_props), None, None)?;
        let rule_ids: Vec<PropertyId> = rules
            .iter()
            .map(|rule| {
                post.get_property_by_name(&rule.new_property.name)
                    .map(|p| p.id)
                    .ok_or_else(|| {
                        Error::SchemaConflict(format!(
                            "split rule property '{}' missing after reshape",
                            rule.new_property.name
                        ))
                    })
            })
            .collect::<Result<_, _>>()?;

        let rows = self.store.scan_class_all(&pre)?;
        let mut planned = Vec::with_capacity(rows.len());
        for (id, data, embedded) in rows {
            let mut new_data = remap_data(&post, id, &data)?;
            report.matched += 1;
            if let Some(source) = data.get(source_prop) {
                for (rule, rule_id) in rules.iter().zip(&rule_ids) {
                    let derived = match rule.apply(source)? {
                        Some(value) => Some(value),
                        None => rule.new_property.default_value.clone(),
                    };
                    if let Some(value) = derived {
                        new_data.set(*rule_id, value);
                    }
                }
            }
            self.store.validate_object(&post, id, &new_data)?;
            planned.push((id, data, new_data, embedded));
        }

        let mut tx = self.store.transaction();
        for (id, before, after, embedded) in &planned {
            self.store.stage_update(&mut tx, &post, *id, after)?;
            // Even rows with unchanged data were rewritten to the new
            // schema version, so every rewrite is recorded for undo.
            let mut delta = RowDelta::updated(*id, class_id, before.to_pairs(), after.to_pairs());
            if *embedded {
                delta = delta.embedded();
            }
            report.row_delta(delta);
        }
        tx.commit()?;
        self.registry.commit_alter(&pre, post.clone())?;

        report.schema_delta(class_id, Some(pre), Some(post));
        Ok(self.finalize(report))
    }

    /// Combine several properties into one via a concatenation
    /// expression evaluated per object, then remove the sources.
    pub fn merge_properties(
        &self,
        class_id: ClassId,
        source_props: &[PropertyId],
        target_prop: PropertyDef,
        expression: &str,
    ) -> Result<ActionReport, Error> {
        let _guard = self.locks.acquire(&[class_id])?;
        let mut report = ActionReport::begin("merge_properties");

        let class = self.registry.require_class(class_id)?;
        for prop in source_props {
            class.require_property(*prop)?;
        }

        let mut new_props: Vec<PropertyDef> = class
            .properties
            .iter()
            .filter(|p| !source_props.contains(&p.id))
            .cloned()
            .collect();
        let target_name = target_prop.name.clone();
        new_props.push(target_prop);
        let (pre, post) = self.registry.preview_alter(class_id, Some(new_props), None, None)?;
        let target_id = post
            .get_property_by_name(&target_name)
            .map(|p| p.id)
            .ok_or_else(|| {
                Error::SchemaConflict(format!("merge target '{}' missing after reshape", target_name))
            })?;

        let rows = self.store.scan_class_all(&pre)?;
        let mut planned = Vec::with_capacity(rows.len());
        for (id, data, embedded) in rows {
            let mut new_data = remap_data(&post, id, &data)?;
            report.matched += 1;
            let merged = eval_concat(expression, &named_row(&pre, &data))?;
            new_data.set(target_id, merged);
            self.store.validate_object(&post, id, &new_data)?;
            planned.push((id, data, new_data, embedded));
        }

        let mut tx = self.store.transaction();
        for (id, before, after, embedded) in &planned {
            self.store.stage_update(&mut tx, &post, *id, after)?;
            let mut delta = RowDelta::updated(*id, class_id, before.to_pairs(), after.to_pairs());
            if *embedded {
                delta = delta.embedded();
            }
            report.row_delta(delta);
        }
        tx.commit()?;
        self.registry.commit_alter(&pre, post.clone())?;

        report.schema_delta(class_id, Some(pre), Some(post));
        Ok(self.finalize(report))
    }

    // ---- reversal ----------------------------------------------------------

    /// Reverse the most recently completed operation by replaying its
    /// retained deltas backwards: restored schemas first, then row
    /// pre-images in one atomic batch.
    ///
    /// Fails with `SchemaConflict` when no operation has run or the
    /// last one was marked irreversible.
    pub fn undo_last_action(&self) -> Result<ActionReport, Error> {
        let last = self
            .last_report
            .lock()
            .clone()
            .ok_or_else(|| Error::SchemaConflict("no action to undo".into()))?;
        if !last.reversible {
            return Err(Error::SchemaConflict(format!(
                "operation '{}' is not reversible",
                last.operation
            )));
        }

        let mut classes: Vec<ClassId> = last.schema_deltas.iter().map(|d| d.class).collect();
        for delta in &last.row_deltas {
            classes.push(delta.class);
            if let Some(after) = delta.class_after {
                classes.push(after);
            }
        }
        let _guard = self.locks.acquire(&classes)?;

        let mut report = ActionReport::begin(format!("undo:{}", last.operation));
        report.irreversible();

        for delta in last.schema_deltas.iter().rev() {
            match (&delta.before, &delta.after) {
                (Some(before), after) => {
                    self.registry.restore_class(before.clone())?;
                    report.schema_delta(delta.class, after.clone(), Some(before.clone()));
                }
                (None, Some(after)) => {
                    self.registry.force_drop_class(delta.class)?;
                    report.schema_delta(delta.class, Some(after.clone()), None);
                }
                (None, None) => {}
            }
        }

        let mut tx = self.store.transaction();
        for delta in last.row_deltas.iter().rev() {
            match (&delta.before, &delta.after) {
                (Some(before), after) => {
                    let class = self.registry.require_class(delta.class)?;
                    let data = ObjectData::from_pairs(before.clone());
                    if tx.read_record(delta.object)?.is_some() {
                        self.store.stage_update(&mut tx, &class, delta.object, &data)?;
                    } else {
                        self.store
                            .stage_insert(&mut tx, &class, delta.object, &data, delta.embedded)?;
                    }
                    report.row_delta(RowDelta {
                        object: delta.object,
                        class: delta.class_after.unwrap_or(delta.class),
                        before: after.clone(),
                        after: Some(before.clone()),
                        class_after: None,
                        embedded: delta.embedded,
                    });
                }
                (None, Some(after)) => {
                    self.store.stage_purge(&mut tx, delta.class, delta.object)?;
                    report.row_delta(RowDelta::deleted(delta.object, delta.class, after.clone()));
                }
                (None, None) => {}
            }
        }
        tx.commit()?;
        Ok(self.finalize(report))
    }

    // ---- internals ---------------------------------------------------------

    /// Scan a class and keep rows passing the filter.
    fn collect_matches(
        &self,
        class: &ClassDef,
        filter: &ObjectFilter,
    ) -> Result<Vec<(ObjectId, ObjectData)>, Error> {
        let mut out = Vec::new();
        for (id, data) in self.store.scan_class(class)? {
            if filter.matches(class, id, &data)? {
                out.push((id, data));
            }
        }
        Ok(out)
    }

    /// Preview a class reshape: current properties minus `removed`,
    /// plus an optional new reference property. Returns the pre/post
    /// defs and the id of the added property (unset id when none was
    /// added).
    fn preview_reshape(
        &self,
        class: &ClassDef,
        removed: &[PropertyId],
        added: Option<PropertyDef>,
    ) -> Result<(ClassDef, ClassDef, PropertyId), Error> {
        let mut props: Vec<PropertyDef> = class
            .properties
            .iter()
            .filter(|p| !removed.contains(&p.id))
            .cloned()
            .collect();
        let added_name = added.as_ref().map(|p| p.name.clone());
        if let Some(prop) = added {
            props.push(prop);
        }
        let (pre, post) = self.registry.preview_alter(class.id, Some(props), None, None)?;
        let added_id = match added_name {
            Some(name) => post
                .get_property_by_name(&name)
                .map(|p| p.id)
                .ok_or_else(|| {
                    Error::SchemaConflict(format!("property '{}' missing after reshape", name))
                })?,
            None => PropertyId::UNASSIGNED,
        };
        Ok((pre, post, added_id))
    }

    /// Resolve (or create) the class receiving extracted properties and
    /// the source-to-target property pairing.
    fn resolve_extraction_target(
        &self,
        target: &TargetClass,
        source_props: &[&PropertyDef],
        overrides: &[(PropertyId, PropertyId)],
        report: &mut ActionReport,
    ) -> Result<(ClassDef, PropertyMap, bool), Error> {
        match target {
            TargetClass::Existing(id) => {
                let class = self.registry.require_class(*id)?;
                let mut map = PropertyMap::new();
                for prop in source_props {
                    let target_id = match overrides.iter().find(|(s, _)| *s == prop.id) {
                        Some((_, t)) => class.require_property(*t)?.id,
                        None => class
                            .get_property_by_name(&prop.name)
                            .map(|p| p.id)
                            .ok_or_else(|| {
                                Error::SchemaConflict(format!(
                                    "class '{}' has no property named '{}'",
                                    class.name, prop.name
                                ))
                            })?,
                    };
                    map = map.map(prop.id, target_id);
                }
                Ok((class, map, false))
            }
            TargetClass::New(name) => {
                let defs: Vec<PropertyDef> = source_props
                    .iter()
                    .map(|p| {
                        let mut def = (**p).clone();
                        def.id = PropertyId::UNASSIGNED;
                        def.rename_to = None;
                        def
                    })
                    .collect();
                let class = self.registry.create_class(name, defs, None)?;
                report.schema_delta(class.id, None, Some(class.clone()));
                let mut map = PropertyMap::new();
                for prop in source_props {
                    let target_id = class
                        .get_property_by_name(&prop.name)
                        .map(|p| p.id)
                        .ok_or_else(|| {
                            Error::SchemaConflict(format!(
                                "property '{}' missing from created class",
                                prop.name
                            ))
                        })?;
                    map = map.map(prop.id, target_id);
                }
                Ok((class, map, true))
            }
        }
    }

    /// Shared body of the two reference-dissolving operations.
    fn dissolve_reference(
        &self,
        operation: &str,
        class_id: ClassId,
        ref_prop_id: PropertyId,
        filter: &ObjectFilter,
        prop_map: &PropertyMap,
        purge_referenced: bool,
    ) -> Result<ActionReport, Error> {
        let mut guard = self.locks.acquire(&[class_id])?;
        let mut report = ActionReport::begin(operation);

        let class = self.registry.require_class(class_id)?;
        let ref_def = class.require_property(ref_prop_id)?.clone();
        let expected_type = if purge_referenced {
            DataType::Nested
        } else {
            DataType::Link
        };
        if ref_def.data_type != expected_type {
            return Err(Error::SchemaConflict(format!(
                "property '{}' is not a {:?} reference",
                ref_def.name, expected_type
            )));
        }
        let referenced_class = self.registry.require_class(
            ref_def
                .referenced_class
                .ok_or_else(|| Error::SchemaConflict("reference without target class".into()))?,
        )?;
        // A self-referencing link resolves to the class already locked
        // above; extend skips it instead of conflicting with ourselves.
        guard.extend(&[referenced_class.id])?;

        // Resolve the map: new owner properties are cloned from the
        // referenced class's definitions.
        let mut new_props: Vec<PropertyDef> = class
            .properties
            .iter()
            .filter(|p| p.id != ref_prop_id)
            .cloned()
            .collect();
        let mut pending_names: Vec<(PropertyId, String)> = Vec::new();
        let mut resolved: Vec<(PropertyId, Option<PropertyId>)> = Vec::new();
        for entry in &prop_map.entries {
            let source_def = referenced_class.require_property(entry.source)?;
            if entry.target.is_unassigned() {
                if class
                    .properties
                    .iter()
                    .any(|p| p.id != ref_prop_id && p.name == source_def.name)
                {
                    return Err(Error::SchemaConflict(format!(
                        "property '{}' already exists on class '{}'",
                        source_def.name, class.name
                    )));
                }
                let mut def = source_def.clone();
                def.id = PropertyId::UNASSIGNED;
                pending_names.push((entry.source, def.name.clone()));
                new_props.push(def);
                resolved.push((entry.source, None));
            } else {
                class.require_property(entry.target)?;
                resolved.push((entry.source, Some(entry.target)));
            }
        }

        let (pre, post) = self.registry.preview_alter(class_id, Some(new_props), None, None)?;
        let resolved: Vec<(PropertyId, PropertyId)> = resolved
            .into_iter()
            .map(|(source, target)| match target {
                Some(t) => Ok((source, t)),
                None => {
                    let name = pending_names
                        .iter()
                        .find(|(s, _)| *s == source)
                        .map(|(_, n)| n.as_str())
                        .ok_or_else(|| Error::SchemaConflict("unresolved map entry".into()))?;
                    post.get_property_by_name(name)
                        .map(|p| (source, p.id))
                        .ok_or_else(|| {
                            Error::SchemaConflict(format!("property '{}' missing after reshape", name))
                        })
                }
            })
            .collect::<Result<_, _>>()?;

        let rows = self.store.scan_class_all(&pre)?;
        let mut planned: Vec<(ObjectId, ObjectData, ObjectData, bool)> = Vec::new();
        let mut purged: Vec<(ObjectId, ObjectData)> = Vec::new();
        for (id, data, embedded) in rows {
            let mut new_data = remap_data(&post, id, &data)?;
            let matched = filter.matches(&pre, id, &data)?;
            if matched {
                report.matched += 1;
            }
            if let Some(referenced) = data.get(ref_prop_id).and_then(Value::as_ref_id) {
                let referenced = ObjectId(referenced);
                if matched {
                    if let Some(sub) = self.store.read_object(&referenced_class, referenced)? {
                        for (source, target) in &resolved {
                            for v in sub.get_all(*source) {
                                new_data.push(*target, v.clone());
                            }
                        }
                        if purge_referenced {
                            purged.push((referenced, sub));
                        }
                    }
                } else if purge_referenced {
                    // The reference property leaves the class, so even
                    // unmatched owners lose their sub-object handle.
                    if let Some(sub) = self.store.read_object(&referenced_class, referenced)? {
                        purged.push((referenced, sub));
                    }
                }
            }
            self.store.validate_object(&post, id, &new_data)?;
            planned.push((id, data, new_data, embedded));
        }

        let mut tx = self.store.transaction();
        for (id, before, after, embedded) in &planned {
            self.store.stage_update(&mut tx, &post, *id, after)?;
            // Even rows with unchanged data were rewritten to the new
            // schema version, so every rewrite is recorded for undo.
            let mut delta = RowDelta::updated(*id, class_id, before.to_pairs(), after.to_pairs());
            if *embedded {
                delta = delta.embedded();
            }
            report.row_delta(delta);
        }
        for (sub_id, sub_data) in &purged {
            self.store.stage_purge(&mut tx, referenced_class.id, *sub_id)?;
            report.row_delta(
                RowDelta::deleted(*sub_id, referenced_class.id, sub_data.to_pairs()).embedded(),
            );
        }
        tx.commit()?;
        self.registry.commit_alter(&pre, post.clone())?;

        report.schema_delta(class_id, Some(pre), Some(post));
        Ok(self.finalize(report))
    }

    /// Finalize a report, retain it and return it.
    fn finalize(&self, report: ActionReport) -> ActionReport {
        let report = report.finish();
        info!(
            operation = %report.operation,
            matched = report.matched,
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            skipped = report.skipped.len(),
            "operation committed"
        );
        *self.last_report.lock() = Some(report.clone());
        report
    }
}

/// Carry data forward into a new class definition: values of removed
/// properties are dropped and defaults of newly required ones applied.
fn remap_data(post: &ClassDef, id: ObjectId, data: &ObjectData) -> Result<ObjectData, Error> {
    let mut out = ObjectData::new();
    for (property, values) in data.iter() {
        if post.get_property(property).is_some() {
            for v in values {
                out.push(property, v.clone());
            }
        }
    }
    apply_class_defaults(post, out, id)
}

/// Fill defaults for required properties; fail when a required property
/// has neither a value nor a default.
fn apply_class_defaults(
    class: &ClassDef,
    mut data: ObjectData,
    id: ObjectId,
) -> Result<ObjectData, Error> {
    for def in class.required_properties() {
        if !data.contains(def.id) {
            match &def.default_value {
                Some(default) => {
                    data.set(def.id, default.clone());
                }
                None => {
                    return Err(Error::CardinalityViolation {
                        property: def.id,
                        object: id,
                        min: def.min_occurs,
                    })
                }
            }
        }
    }
    Ok(data)
}

/// Check the listed properties exist and are plain, returning their
/// definitions.
fn plain_props<'a>(class: &'a ClassDef, prop_ids: &[PropertyId]) -> Result<Vec<&'a PropertyDef>, Error> {
    let mut out = Vec::with_capacity(prop_ids.len());
    for id in prop_ids {
        let def = class.require_property(*id)?;
        if def.is_reference() {
            return Err(Error::SchemaConflict(format!(
                "property '{}' is a reference and cannot be extracted",
                def.name
            )));
        }
        out.push(def);
    }
    Ok(out)
}

/// Pull the listed properties out of object data, renumbered through
/// the source-to-target pairing.
fn extract_mapped(data: &ObjectData, prop_ids: &[PropertyId], map: &PropertyMap) -> ObjectData {
    let mut out = ObjectData::new();
    for source in prop_ids {
        if let Some(target) = map.get(*source) {
            for v in data.get_all(*source) {
                out.push(target, v.clone());
            }
        }
    }
    out
}

/// Replace every reference to `from` with a reference to `to`.
fn repoint(data: ObjectData, from: ObjectId, to: ObjectId) -> ObjectData {
    let pairs = data
        .to_pairs()
        .into_iter()
        .map(|(p, values)| {
            let values = values
                .into_iter()
                .map(|v| match v {
                    Value::ObjectRef(id) if id == from.0 => Value::ObjectRef(to.0),
                    other => other,
                })
                .collect();
            (p, values)
        })
        .collect();
    ObjectData::from_pairs(pairs)
}
