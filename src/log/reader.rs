use std::sync::Arc;

use crate::snapshot::SnapshotMeta;
use crate::storage::LogStore;
use crate::storage::StoreError;
use crate::types::GroupId;
use crate::Entry;

/// Read-side view of the durable log of one replica.
///
/// The store itself is shared by every replica in the process; this view
/// caches the `(marker, length)` range the raft layer is allowed to see,
/// advanced as writes complete. `marker` is the compacted-through index,
/// so the visible range is `[marker + 1, marker + length]`.
pub(crate) struct LogReader {
    group: GroupId,
    store: Arc<dyn LogStore>,

    marker: u64,
    marker_term: u64,
    length: u64,
}

impl LogReader {
    pub(crate) fn new(group: GroupId, store: Arc<dyn LogStore>) -> Self {
        LogReader {
            group,
            store,
            marker: 0,
            marker_term: 0,
            length: 0,
        }
    }

    /// Adopt the range recovered from the store at startup.
    pub(crate) fn initialize(&mut self, marker: u64, marker_term: u64, length: u64) {
        self.marker = marker;
        self.marker_term = marker_term;
        self.length = length;
    }

    pub(crate) fn first_index(&self) -> u64 {
        self.marker + 1
    }

    pub(crate) fn last_index(&self) -> u64 {
        self.marker + self.length
    }

    pub(crate) fn term(&self, index: u64) -> Result<u64, StoreError> {
        if index == self.marker {
            return Ok(self.marker_term);
        }
        if index < self.marker {
            return Err(StoreError::Compacted);
        }
        if index > self.last_index() {
            return Err(StoreError::Unavailable);
        }
        self.store.term(self.group, index)
    }

    pub(crate) fn entries(&self, lo: u64, hi: u64, max_bytes: u64) -> Result<Vec<Entry>, StoreError> {
        if lo <= self.marker {
            return Err(StoreError::Compacted);
        }
        if hi > self.last_index() + 1 {
            return Err(StoreError::Unavailable);
        }
        self.store.entries(self.group, lo, hi, max_bytes)
    }

    /// Extend the visible range after a durable append completed.
    pub(crate) fn extend_to(&mut self, index: u64) {
        if index > self.last_index() {
            self.length = index - self.marker;
        }
    }

    /// Reset the view onto a freshly installed snapshot.
    pub(crate) fn apply_snapshot(&mut self, meta: &SnapshotMeta) {
        self.marker = meta.index;
        self.marker_term = meta.term;
        self.length = 0;
    }

    /// Advance the compacted boundary after the store compacted `[.., index]`.
    pub(crate) fn compacted_to(&mut self, index: u64, term: u64) {
        if index <= self.marker {
            return;
        }
        debug_assert!(index <= self.last_index());
        self.length -= index - self.marker;
        self.marker = index;
        self.marker_term = term;
    }
}
