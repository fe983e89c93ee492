//! Class-level mutual exclusion for structural operations.
//!
//! Locks are acquired for the full class set of an operation in
//! ascending class id order, so operations touching overlapping sets
//! cannot deadlock. Acquisition is fail-fast: contention surfaces as
//! `ConcurrencyConflict` instead of blocking.

use crate::error::Error;
use crate::schema::ClassId;
use dashmap::DashSet;
use tracing::trace;

/// Tracks which classes currently have a structural operation in
/// flight.
#[derive(Debug, Default)]
pub struct ClassLockManager {
    held: DashSet<ClassId>,
}

impl ClassLockManager {
    /// Create a new lock manager with no locks held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire exclusive intent on a set of classes.
    ///
    /// Duplicates are collapsed and the set is locked in ascending
    /// order. On contention every lock taken so far is released and the
    /// call fails with `ConcurrencyConflict` naming the contended
    /// class.
    pub fn acquire(&self, classes: &[ClassId]) -> Result<ClassLockGuard<'_>, Error> {
        let mut sorted = classes.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut acquired = Vec::with_capacity(sorted.len());
        for class in sorted {
            if !self.held.insert(class) {
                for taken in &acquired {
                    self.held.remove(taken);
                }
                return Err(Error::ConcurrencyConflict(class));
            }
            acquired.push(class);
        }

        trace!(?acquired, "acquired class locks");
        Ok(ClassLockGuard {
            manager: self,
            classes: acquired,
        })
    }

    /// Whether a class is currently locked.
    pub fn is_locked(&self, class: ClassId) -> bool {
        self.held.contains(&class)
    }
}

/// Scoped lock over a set of classes; released on drop, including
/// error paths.
pub struct ClassLockGuard<'a> {
    manager: &'a ClassLockManager,
    classes: Vec<ClassId>,
}

impl ClassLockGuard<'_> {
    /// The classes held by this guard, ascending.
    pub fn classes(&self) -> &[ClassId] {
        &self.classes
    }

    /// Grow the guard by additional classes, skipping any it already
    /// holds.
    ///
    /// A self-referencing operation resolves its target to a class the
    /// guard locked up front; re-locking it must not count as
    /// contention. On a genuine conflict every newly taken lock is
    /// released and the guard is left unchanged.
    pub fn extend(&mut self, classes: &[ClassId]) -> Result<(), Error> {
        let mut wanted = classes.to_vec();
        wanted.sort();
        wanted.dedup();
        wanted.retain(|class| !self.classes.contains(class));

        let mut acquired = Vec::with_capacity(wanted.len());
        for class in wanted {
            if !self.manager.held.insert(class) {
                for taken in &acquired {
                    self.manager.held.remove(taken);
                }
                return Err(Error::ConcurrencyConflict(class));
            }
            acquired.push(class);
        }

        trace!(?acquired, "extended class locks");
        self.classes.extend(acquired);
        self.classes.sort();
        Ok(())
    }
}

impl Drop for ClassLockGuard<'_> {
    fn drop(&mut self) {
        for class in &self.classes {
            self.manager.held.remove(class);
        }
        trace!(classes = ?self.classes, "released class locks");
    }
}
