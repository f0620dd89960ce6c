//! In-memory generations.
//!
//! A [`MemStore`] is one generation of buffered writes: a mapping from row
//! key to per-field sequences. Exactly one generation is *active* (the sole
//! target of new inserts); older generations are *frozen* and stay readable
//! until their flush commits.
//!
//! Generations are single-writer / multi-reader. The ingest loop mutates the
//! active generation under the store's write lock; the flush worker and the
//! read path consume shallow snapshots. Sequences are immutable once stored,
//! so a snapshot shares their buffers safely.

use std::collections::HashMap;

use crate::codec::Sequence;
use crate::key::RowKey;

/// One in-memory generation: row key to per-field sequence columns.
#[derive(Debug, Default)]
pub(crate) struct MemStore {
    rows: HashMap<RowKey, Vec<Sequence>>,
}

impl MemStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            rows: HashMap::with_capacity(capacity),
        }
    }

    /// Number of buffered rows.
    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn contains_key(&self, key: &RowKey) -> bool {
        self.rows.contains_key(key)
    }

    /// Mutable access to a row's columns, creating the row when absent.
    pub(crate) fn columns_mut(&mut self, key: &RowKey) -> &mut Vec<Sequence> {
        self.rows.entry(key.clone()).or_default()
    }

    /// Destructive take. The merge path consumes each key at most once, so a
    /// removed row never merges twice; snapshots are therefore single-use.
    pub(crate) fn remove(&mut self, key: &RowKey) -> Option<Vec<Sequence>> {
        self.rows.remove(key)
    }

    /// Shallow snapshot: a new mapping over the same sequence buffers.
    pub(crate) fn snapshot(&self) -> MemStore {
        MemStore {
            rows: self.rows.clone(),
        }
    }

    /// Moves every row out, leaving the generation empty.
    pub(crate) fn take_rows(&mut self) -> HashMap<RowKey, Vec<Sequence>> {
        std::mem::take(&mut self.rows)
    }

    #[cfg(test)]
    pub(crate) fn get(&self, key: &RowKey) -> Option<&Vec<Sequence>> {
        self.rows.get(key)
    }
}
