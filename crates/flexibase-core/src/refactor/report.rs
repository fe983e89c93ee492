//! Action reports: the audit record of a refactoring operation.
//!
//! A report carries pre- and post-images of every schema and row change,
//! which makes reversal a generic replay of the deltas in reverse order
//! instead of per-operation inverse logic.

use crate::error::Error;
use crate::schema::{ClassDef, ClassId, PropertyId};
use crate::store::{current_timestamp, ObjectId};
use flexibase_proto::Value;
use serde::{Deserialize, Serialize};

/// An object skipped during a batch operation, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedObject {
    /// The skipped object.
    pub object: ObjectId,
    /// Why it was skipped.
    pub reason: String,
}

/// Pre/post-image of one class definition change.
///
/// `before: None` records a create, `after: None` a drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDelta {
    /// Affected class.
    pub class: ClassId,
    /// Definition before the operation.
    pub before: Option<ClassDef>,
    /// Definition after the operation.
    pub after: Option<ClassDef>,
}

/// Pre/post-image of one object's property values.
///
/// `before: None` records a create, `after: None` a delete. Images are
/// property snapshots independent of physical layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDelta {
    /// Affected object.
    pub object: ObjectId,
    /// Class the object belonged to before (or was created in).
    pub class: ClassId,
    /// Property values before the operation.
    pub before: Option<Vec<(PropertyId, Vec<Value>)>>,
    /// Property values after the operation.
    pub after: Option<Vec<(PropertyId, Vec<Value>)>>,
    /// Class the object belongs to after, when the operation moved it.
    pub class_after: Option<ClassId>,
    /// Whether the row is an embedded sub-object.
    pub embedded: bool,
}

impl RowDelta {
    /// Delta for a created row.
    pub fn created(
        object: ObjectId,
        class: ClassId,
        after: Vec<(PropertyId, Vec<Value>)>,
    ) -> Self {
        Self {
            object,
            class,
            before: None,
            after: Some(after),
            class_after: None,
            embedded: false,
        }
    }

    /// Delta for a deleted row.
    pub fn deleted(
        object: ObjectId,
        class: ClassId,
        before: Vec<(PropertyId, Vec<Value>)>,
    ) -> Self {
        Self {
            object,
            class,
            before: Some(before),
            after: None,
            class_after: None,
            embedded: false,
        }
    }

    /// Delta for an updated row.
    pub fn updated(
        object: ObjectId,
        class: ClassId,
        before: Vec<(PropertyId, Vec<Value>)>,
        after: Vec<(PropertyId, Vec<Value>)>,
    ) -> Self {
        Self {
            object,
            class,
            before: Some(before),
            after: Some(after),
            class_after: None,
            embedded: false,
        }
    }

    /// Mark the row as having changed class.
    pub fn moved_to(mut self, class: ClassId) -> Self {
        self.class_after = Some(class);
        self
    }

    /// Mark the row as an embedded sub-object.
    pub fn embedded(mut self) -> Self {
        self.embedded = true;
        self
    }
}

/// The audit record of one refactoring operation.
///
/// Created when the operation starts, finalized at commit, retained
/// until the next operation begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    /// Operation name.
    pub operation: String,
    /// Start timestamp, microseconds since Unix epoch.
    pub started_at: u64,
    /// Finish timestamp, zero while in flight.
    pub finished_at: u64,
    /// Objects matched by the filter.
    pub matched: u64,
    /// Objects rewritten in place.
    pub updated: u64,
    /// Objects created.
    pub created: u64,
    /// Objects deleted.
    pub deleted: u64,
    /// Per-item skips (policy: recorded, not aborted).
    pub skipped: Vec<SkippedObject>,
    /// Schema changes with pre/post-images.
    pub schema_deltas: Vec<SchemaDelta>,
    /// Row changes with pre/post-images.
    pub row_deltas: Vec<RowDelta>,
    /// Whether the retained deltas suffice to reverse the operation.
    pub reversible: bool,
}

impl ActionReport {
    /// Start a report for a named operation.
    pub fn begin(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            started_at: current_timestamp(),
            finished_at: 0,
            matched: 0,
            updated: 0,
            created: 0,
            deleted: 0,
            skipped: Vec::new(),
            schema_deltas: Vec::new(),
            row_deltas: Vec::new(),
            reversible: true,
        }
    }

    /// Finalize the report at commit time.
    pub fn finish(mut self) -> Self {
        self.finished_at = current_timestamp();
        self
    }

    /// Record a per-item skip.
    pub fn skip(&mut self, object: ObjectId, reason: impl Into<String>) {
        self.skipped.push(SkippedObject {
            object,
            reason: reason.into(),
        });
    }

    /// Record a schema change.
    pub fn schema_delta(&mut self, class: ClassId, before: Option<ClassDef>, after: Option<ClassDef>) {
        self.schema_deltas.push(SchemaDelta { class, before, after });
    }

    /// Record a row change.
    pub fn row_delta(&mut self, delta: RowDelta) {
        match (&delta.before, &delta.after) {
            (None, Some(_)) => self.created += 1,
            (Some(_), None) => self.deleted += 1,
            (Some(_), Some(_)) => self.updated += 1,
            (None, None) => {}
        }
        self.row_deltas.push(delta);
    }

    /// Mark the operation as intrinsically lossy; `undo` will refuse it.
    pub fn irreversible(&mut self) {
        self.reversible = false;
    }

    /// Serialize the report to pretty JSON for logs and tooling.
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}
