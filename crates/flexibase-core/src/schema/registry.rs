//! Persisted catalog of class definitions.

use super::{allocate_columns, ClassDef, ClassId, ColumnMapping, PropertyDef, PropertyId};
use crate::error::Error;
use parking_lot::RwLock;
use sled::{Db, Tree};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Tree name for class definitions.
const CLASS_TREE: &str = "schema:classes";

/// Tree name for the class name index.
const NAME_TREE: &str = "schema:names";

/// Tree name for catalog metadata.
const META_TREE: &str = "schema:meta";

/// Key for the next class id in the meta tree.
const NEXT_CLASS_ID_KEY: &[u8] = b"next_class_id";

/// Key for the next property id in the meta tree.
const NEXT_PROPERTY_ID_KEY: &[u8] = b"next_property_id";

/// The schema registry: source of truth for the logical schema.
///
/// Class definitions are persisted per class and cached in memory; every
/// mutation bumps the class's schema version so stale cached mappings
/// can be detected by the object store.
pub struct SchemaRegistry {
    /// Class definitions tree (class id -> ClassDef bytes).
    class_tree: Tree,
    /// Name index tree (name -> class id).
    name_tree: Tree,
    /// Metadata tree (id counters).
    meta_tree: Tree,
    /// Next class id to allocate (cached).
    next_class_id: AtomicU64,
    /// Next property id to allocate (cached).
    next_property_id: AtomicU64,
    /// In-memory cache of all class definitions.
    cache: RwLock<HashMap<ClassId, ClassDef>>,
}

impl SchemaRegistry {
    /// Open or create a registry using the given sled database.
    pub fn open(db: &Db) -> Result<Self, Error> {
        let class_tree = db.open_tree(CLASS_TREE)?;
        let name_tree = db.open_tree(NAME_TREE)?;
        let meta_tree = db.open_tree(META_TREE)?;

        let next_class_id = read_counter(&meta_tree, NEXT_CLASS_ID_KEY)?.unwrap_or(1);
        let next_property_id = read_counter(&meta_tree, NEXT_PROPERTY_ID_KEY)?.unwrap_or(1);

        // Preload the class cache
        let mut cache = HashMap::new();
        for result in class_tree.iter() {
            let (_, bytes) = result?;
            let class = ClassDef::from_bytes(&bytes)?;
            cache.insert(class.id, class);
        }

        Ok(Self {
            class_tree,
            name_tree,
            meta_tree,
            next_class_id: AtomicU64::new(next_class_id),
            next_property_id: AtomicU64::new(next_property_id),
            cache: RwLock::new(cache),
        })
    }

    /// Get a class definition by id.
    pub fn get_class(&self, id: ClassId) -> Option<ClassDef> {
        self.cache.read().get(&id).cloned()
    }

    /// Get a class definition by id, or fail with `ClassNotFound`.
    pub fn require_class(&self, id: ClassId) -> Result<ClassDef, Error> {
        self.get_class(id).ok_or(Error::ClassNotFound(id))
    }

    /// Get a class definition by name.
    pub fn get_class_by_name(&self, name: &str) -> Option<ClassDef> {
        self.require_class_by_name(name).ok()
    }

    /// Get a class definition by name, or fail with `ClassNameNotFound`.
    ///
    /// Resolution goes through the persisted name index rather than a
    /// cache scan; renames and drops keep the index current.
    pub fn require_class_by_name(&self, name: &str) -> Result<ClassDef, Error> {
        let Some(bytes) = self.name_tree.get(name.as_bytes())? else {
            return Err(Error::ClassNameNotFound(name.to_string()));
        };
        let arr: [u8; 8] = bytes.as_ref().try_into().map_err(|_| Error::InvalidKey)?;
        self.require_class(ClassId(u64::from_be_bytes(arr)))
    }

    /// The current schema version of a class.
    pub fn class_version(&self, id: ClassId) -> Option<u64> {
        self.cache.read().get(&id).map(|c| c.version)
    }

    /// List all class definitions.
    pub fn list_classes(&self) -> Vec<ClassDef> {
        let mut classes: Vec<ClassDef> = self.cache.read().values().cloned().collect();
        classes.sort_by_key(|c| c.id);
        classes
    }

    /// Allocate a fresh property id.
    pub fn next_property_id(&self) -> Result<PropertyId, Error> {
        let id = self.next_property_id.fetch_add(1, Ordering::SeqCst);
        self.meta_tree
            .insert(NEXT_PROPERTY_ID_KEY, &(id + 1).to_be_bytes())?;
        Ok(PropertyId(id))
    }

    /// Create a new class.
    ///
    /// Fails with `DuplicateName` if the name is taken. Property defs
    /// without an id get one allocated. The default column mapping is
    /// generated unless an explicit one is supplied.
    pub fn create_class(
        &self,
        name: &str,
        properties: Vec<PropertyDef>,
        mapping: Option<ColumnMapping>,
    ) -> Result<ClassDef, Error> {
        let mut cache = self.cache.write();
        if cache.values().any(|c| c.name == name) {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let class_id = self.next_class_id.fetch_add(1, Ordering::SeqCst);
        self.meta_tree
            .insert(NEXT_CLASS_ID_KEY, &(class_id + 1).to_be_bytes())?;

        let mut props = properties;
        for prop in &mut props {
            if prop.id.is_unassigned() {
                prop.id = self.allocate_property_id()?;
            }
        }

        let mapping = mapping.unwrap_or_else(|| allocate_columns(&props));
        let class = ClassDef {
            id: ClassId(class_id),
            name: name.to_string(),
            version: 1,
            properties: props,
            mapping,
        };
        class.validate()?;

        self.persist(&class)?;
        debug!(class = %class.id, name = %class.name, "created class");
        cache.insert(class.id, class.clone());
        Ok(class)
    }

    /// Compute the outcome of an alter without persisting it.
    ///
    /// `new_properties`, when given, is the complete new property set:
    /// defs carrying existing ids modify in place (a `rename_to` marker
    /// renames preserving id and data), defs without an id get one
    /// allocated, and current properties absent from the list are
    /// removed. The column mapping is regenerated unless one is
    /// supplied. Returns the pre- and post-images; the caller commits
    /// the post-image with [`commit_alter`](Self::commit_alter) once any
    /// dependent data migration has landed.
    pub fn preview_alter(
        &self,
        class_id: ClassId,
        new_properties: Option<Vec<PropertyDef>>,
        new_mapping: Option<ColumnMapping>,
        new_name: Option<&str>,
    ) -> Result<(ClassDef, ClassDef), Error> {
        let cache = self.cache.read();
        let current = cache
            .get(&class_id)
            .cloned()
            .ok_or(Error::ClassNotFound(class_id))?;

        let mut updated = current.clone();

        if let Some(name) = new_name {
            if name != current.name && cache.values().any(|c| c.name == name) {
                return Err(Error::DuplicateName(name.to_string()));
            }
            updated.name = name.to_string();
        }

        if let Some(props) = new_properties {
            let mut resolved = Vec::with_capacity(props.len());
            for mut prop in props {
                if prop.id.is_unassigned() {
                    prop.id = self.allocate_property_id()?;
                } else if current.get_property(prop.id).is_none() {
                    return Err(Error::PropertyNotFound(prop.id, class_id));
                }
                if let Some(renamed) = prop.rename_to.take() {
                    prop.name = renamed;
                }
                resolved.push(prop);
            }
            updated.properties = resolved;
        }

        updated.mapping = match new_mapping {
            Some(mapping) => mapping,
            None => allocate_columns(&updated.properties),
        };
        updated.version = current.version + 1;
        updated.validate()?;
        Ok((current, updated))
    }

    /// Persist a previewed alter: one atomic definition swap.
    pub fn commit_alter(&self, pre: &ClassDef, post: ClassDef) -> Result<(), Error> {
        let mut cache = self.cache.write();
        self.persist(&post)?;
        if post.name != pre.name {
            self.name_tree.remove(pre.name.as_bytes())?;
        }
        debug!(class = %post.id, version = post.version, "altered class");
        cache.insert(post.id, post);
        Ok(())
    }

    /// Alter an existing class: preview plus immediate commit.
    pub fn alter_class(
        &self,
        class_id: ClassId,
        new_properties: Option<Vec<PropertyDef>>,
        new_mapping: Option<ColumnMapping>,
        new_name: Option<&str>,
    ) -> Result<(ClassDef, ClassDef), Error> {
        let (current, updated) = self.preview_alter(class_id, new_properties, new_mapping, new_name)?;
        self.commit_alter(&current, updated.clone())?;
        Ok((current, updated))
    }

    /// Drop a class, failing with `ReferentialConflict` while other
    /// classes still hold reference properties targeting it. Returns the
    /// removed definition.
    pub fn drop_class(&self, class_id: ClassId) -> Result<ClassDef, Error> {
        let mut cache = self.cache.write();
        let class = cache
            .get(&class_id)
            .cloned()
            .ok_or(Error::ClassNotFound(class_id))?;

        for other in cache.values() {
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

        self.class_tree.remove(class_id.0.to_be_bytes())?;
        self.name_tree.remove(class.name.as_bytes())?;
        debug!(class = %class_id, name = %class.name, "dropped class");
        cache.remove(&class_id);
        Ok(class)
    }

    /// Put a full class definition back, bypassing referential checks.
    /// Used when reversing a previous operation.
    pub fn restore_class(&self, class: ClassDef) -> Result<(), Error> {
        class.validate()?;
        let mut cache = self.cache.write();
        self.persist(&class)?;
        cache.insert(class.id, class);
        Ok(())
    }

    /// Remove a class definition without referential checks. Used when
    /// reversing a create.
    pub fn force_drop_class(&self, class_id: ClassId) -> Result<Option<ClassDef>, Error> {
        let mut cache = self.cache.write();
        let Some(class) = cache.remove(&class_id) else {
            return Ok(None);
        };
        self.class_tree.remove(class_id.0.to_be_bytes())?;
        self.name_tree.remove(class.name.as_bytes())?;
        Ok(Some(class))
    }

    /// Flush pending catalog writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.class_tree.flush()?;
        self.name_tree.flush()?;
        self.meta_tree.flush()?;
        Ok(())
    }

    /// Allocate a property id without touching the public counter API
    /// (callers already hold the cache lock).
    fn allocate_property_id(&self) -> Result<PropertyId, Error> {
        let id = self.next_property_id.fetch_add(1, Ordering::SeqCst);
        self.meta_tree
            .insert(NEXT_PROPERTY_ID_KEY, &(id + 1).to_be_bytes())?;
        Ok(PropertyId(id))
    }

    /// Write a class definition and its name index entry.
    fn persist(&self, class: &ClassDef) -> Result<(), Error> {
        let bytes = class.to_bytes()?;
        self.class_tree.insert(class.id.0.to_be_bytes(), bytes)?;
        self.name_tree
            .insert(class.name.as_bytes(), &class.id.0.to_be_bytes())?;
        Ok(())
    }
}

/// Read a big-endian u64 counter from a tree.
fn read_counter(tree: &Tree, key: &[u8]) -> Result<Option<u64>, Error> {
    match tree.get(key)? {
        Some(bytes) => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes);
            Ok(Some(u64::from_be_bytes(buf)))
        }
        None => Ok(None),
    }
}
