//! Immutable snapshot handoff between workers.

use parking_lot::RwLock;
use std::sync::Arc;

/// A shared slot holding the latest `Arc<T>`.
///
/// Producers replace the whole value; consumers clone the `Arc` and work
/// on their own copy for the rest of the cycle. The lock is only held for
/// the pointer clone/swap, never across a remote read.
pub struct SnapshotCell<T> {
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for SnapshotCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SnapshotCell<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    /// Returns the latest snapshot.
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.inner.read())
    }

    /// Replaces the snapshot.
    pub fn store(&self, value: T) {
        self.store_arc(Arc::new(value));
    }

    /// Replaces the snapshot with an existing `Arc`.
    pub fn store_arc(&self, value: Arc<T>) {
        *self.inner.write() = value;
    }
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loaded_snapshot_is_unaffected_by_store() {
        let cell = SnapshotCell::new(vec![1, 2]);
        let held = cell.load();
        cell.store(vec![3]);

        assert_eq!(*held, vec![1, 2]);
        assert_eq!(*cell.load(), vec![3]);
    }

    #[test]
    fn test_clones_share_slot() {
        let a = SnapshotCell::new(0u32);
        let b = a.clone();
        a.store(9);
        assert_eq!(*b.load(), 9);
    }
}
