//! Atomic snapshot publication for read-mostly state.
//!
//! Catalogs and keyrings are replaced, never mutated. Readers take an `Arc`
//! snapshot and hold it for the duration of a single request; reloads install
//! a new snapshot without tearing.

// Lock poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::sync::{Arc, RwLock};

/// A cell holding the current snapshot of a read-mostly value.
#[derive(Debug)]
pub struct SnapshotCell<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> SnapshotCell<T> {
    /// Creates a cell holding the initial snapshot.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<T> {
        Arc::clone(&self.inner.read().expect("snapshot lock poisoned"))
    }

    /// Installs a new snapshot. In-flight readers keep their old snapshot.
    pub fn install(&self, value: T) {
        *self.inner.write().expect("snapshot lock poisoned") = Arc::new(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_keep_old_snapshot_across_install() {
        let cell = SnapshotCell::new(1);
        let before = cell.snapshot();
        cell.install(2);
        assert_eq!(*before, 1);
        assert_eq!(*cell.snapshot(), 2);
    }
}
