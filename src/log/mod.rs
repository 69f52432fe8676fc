//! The unified replica log.
//!
//! [`ReplicaLog`] presents raft with one contiguous sequence stitched from
//! two ranges that share a single seam: the durable view `[first_index,
//! unstable_offset)` behind [`LogReader`] and the in-memory tail
//! `[unstable_offset, last_index]` in [`InMemLog`]. Callers never observe
//! the seam.
//!
//! Invariant violations in this module are unrecoverable: the in-memory
//! view can no longer be trusted, so these paths panic and crash recovery
//! rebuilds the view from the durable store.

mod in_mem;
mod reader;

#[cfg(test)]
mod in_mem_test;

use std::error::Error;
use std::fmt;
use std::sync::Arc;

pub(crate) use in_mem::InMemLog;
pub(crate) use reader::LogReader;
use validit::Validate;

use crate::entry::entries_size;
use crate::error::Fatal;
use crate::snapshot::SnapshotMeta;
use crate::storage::LogStore;
use crate::storage::StoreError;
use crate::types::GroupId;
use crate::Entry;

pub(crate) struct ReplicaLog {
    group: GroupId,
    pub(crate) reader: LogReader,
    pub(crate) in_mem: InMemLog,

    /// Highest index known committed by the quorum. Never decreases.
    pub(crate) committed: u64,

    /// Highest index handed off to the apply host. The host's own
    /// `last_applied` trails this and is fed back separately.
    pub(crate) processed: u64,

    max_apply_batch_bytes: u64,
}

impl ReplicaLog {
    /// Recover the log view of `group` from the durable store.
    pub(crate) fn new(
        group: GroupId,
        store: Arc<dyn LogStore>,
        max_apply_batch_bytes: u64,
    ) -> Result<Self, StoreError> {
        let mut reader = LogReader::new(group, store.clone());
        let mut committed = 0;

        if let Some(st) = store.raft_state(group)? {
            let marker = st.first_index - 1;
            let marker_term = match store.term(group, marker) {
                Ok(t) => t,
                Err(StoreError::Compacted) | Err(StoreError::Unavailable) => 0,
                Err(e) => return Err(e),
            };
            reader.initialize(marker, marker_term, st.entry_count);
            committed = st.hard_state.commit;
        }

        let last = reader.last_index();
        let processed = reader.first_index() - 1;
        Ok(ReplicaLog {
            group,
            reader,
            in_mem: InMemLog::new(last),
            committed: committed.max(processed),
            processed,
            max_apply_batch_bytes,
        })
    }

    pub(crate) fn first_index(&self) -> u64 {
        match &self.in_mem.snapshot {
            Some(s) => s.index + 1,
            None => self.reader.first_index(),
        }
    }

    pub(crate) fn last_index(&self) -> u64 {
        self.in_mem.last_index().unwrap_or_else(|| self.reader.last_index())
    }

    pub(crate) fn term(&self, index: u64) -> Result<u64, StoreError> {
        let boundary = self.first_index() - 1;
        if index < boundary {
            return Err(StoreError::Compacted);
        }
        if index > self.last_index() {
            return Err(StoreError::Unavailable);
        }
        if let Some(t) = self.in_mem.term(index) {
            return Ok(t);
        }
        self.reader.term(index)
    }

    pub(crate) fn last_term(&self) -> u64 {
        self.term(self.last_index()).unwrap_or(0)
    }

    pub(crate) fn match_term(&self, index: u64, term: u64) -> bool {
        self.term(index).map(|t| t == term).unwrap_or(false)
    }

    /// First index in `ents` that disagrees with the local log: a term
    /// mismatch, or the first entry past `last_index` (i.e. genuinely
    /// new). `0` when everything matches and nothing is new.
    pub(crate) fn get_conflict_index(&self, ents: &[Entry]) -> u64 {
        for e in ents {
            if e.index > self.last_index() || !self.match_term(e.index, e.term) {
                return e.index;
            }
        }
        0
    }

    /// The raft receiver path: match the previous entry, truncate from
    /// the first conflict, append the new suffix and advance the commit
    /// index to `min(committed_hint, last_new)`.
    ///
    /// Returns `(last_new, true)` on acceptance, `(0, false)` when
    /// `(prev_index, prev_term)` does not match.
    pub(crate) fn try_append(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        committed_hint: u64,
        ents: &[Entry],
    ) -> (u64, bool) {
        if !self.match_term(prev_index, prev_term) {
            return (0, false);
        }

        let last_new = prev_index + ents.len() as u64;
        let conflict = self.get_conflict_index(ents);
        if conflict != 0 {
            if conflict <= self.committed {
                panic!(
                    "{}: {}",
                    self.group,
                    Fatal::CommittedConflict {
                        index: conflict,
                        committed: self.committed,
                    }
                );
            }
            let start = (conflict - (prev_index + 1)) as usize;
            self.append(&ents[start..]);
        }

        self.commit_to(committed_hint.min(last_new));
        (last_new, true)
    }

    /// The leader path: entries extend the log, or rewind the unstable
    /// seam when they overwrite a durable suffix. A gap or an index behind
    /// the snapshot boundary means the view is corrupt.
    pub(crate) fn append(&mut self, ents: &[Entry]) {
        let Some(first) = ents.first().map(|e| e.index) else {
            return;
        };

        if first < self.first_index() {
            panic!(
                "{}: appending at {} behind snapshot boundary {}",
                self.group,
                first,
                self.first_index()
            );
        }
        if first > self.last_index() + 1 {
            panic!(
                "{}: {}",
                self.group,
                Fatal::LogGap {
                    at: first,
                    last_index: self.last_index(),
                }
            );
        }
        if first <= self.committed {
            panic!(
                "{}: appending at {} would overwrite committed prefix (committed {})",
                self.group, first, self.committed
            );
        }

        self.in_mem.merge(ents);
    }

    /// Never decreases; never moves past `last_index`.
    pub(crate) fn commit_to(&mut self, index: u64) {
        if index <= self.committed {
            return;
        }
        assert!(
            index <= self.last_index(),
            "{}: committing {} past last index {}",
            self.group,
            index,
            self.last_index()
        );
        self.committed = index;
    }

    /// Entries in `[lo, hi)` bounded by `max_bytes`, stitched across the
    /// seam without the caller noticing. At least one entry is returned
    /// for a valid non-empty range even when the first alone exceeds the
    /// budget. An empty range yields an empty result even past the end of
    /// the log; an inverted range is a corrupt caller.
    pub(crate) fn get_entries(&self, lo: u64, hi: u64, max_bytes: u64) -> Result<Vec<Entry>, StoreError> {
        if lo > hi {
            panic!("{}: inverted entry range [{}, {})", self.group, lo, hi);
        }
        if lo == hi {
            return Ok(Vec::new());
        }
        if lo < self.first_index() {
            return Err(StoreError::Compacted);
        }
        if hi > self.last_index() + 1 {
            return Err(StoreError::Unavailable);
        }

        let seam = self.in_mem.first_unstable_index();
        let mut out = Vec::new();
        let mut size: u64 = 0;

        if lo < seam {
            let durable_hi = hi.min(seam);
            out = self.reader.entries(lo, durable_hi, max_bytes)?;
            size = entries_size(&out);

            let got_all = out.last().map(|e| e.index + 1) == Some(durable_hi);
            if !got_all || size >= max_bytes {
                return Ok(out);
            }
        }

        if hi > seam {
            let tail_lo = lo.max(seam);
            for e in self.in_mem.entries_in(tail_lo, hi) {
                size = size.saturating_add(e.size_in_bytes());
                if !out.is_empty() && size > max_bytes {
                    break;
                }
                out.push(e.clone());
            }
        }

        Ok(out)
    }

    /// Install a pending snapshot. The commit index only ever advances: a
    /// snapshot older than `committed` replaces the log view without
    /// rewinding commit or apply progress.
    pub(crate) fn apply_snapshot(&mut self, meta: SnapshotMeta) {
        let index = meta.index;
        self.in_mem.restore(meta);
        self.committed = self.committed.max(index);
        self.processed = self.processed.max(index);
    }

    pub(crate) fn pending_snapshot(&self) -> Option<&SnapshotMeta> {
        self.in_mem.snapshot.as_ref()
    }

    /// The unstable suffix that the next update must persist.
    pub(crate) fn unstable_entries(&self) -> &[Entry] {
        &self.in_mem.entries
    }

    /// Durable-write completion: move the seam past `index` iff the
    /// unstable entry there still carries `term`; otherwise the tail was
    /// replaced while the write was in flight and the notification is
    /// stale.
    pub(crate) fn stable_to(&mut self, index: u64, term: u64) {
        if index < self.in_mem.first_unstable_index() {
            return;
        }
        if self.in_mem.term(index) != Some(term) {
            return;
        }
        self.reader.extend_to(index);
        self.in_mem.saved_to(index, term);
    }

    /// Durable-snapshot completion: the reader adopts the snapshot as its
    /// new marker and the pending snapshot is forgotten.
    pub(crate) fn stable_snapshot_to(&mut self, index: u64) {
        let Some(s) = self.in_mem.snapshot.clone() else {
            return;
        };
        if s.index == index {
            self.reader.apply_snapshot(&s);
            self.in_mem.saved_snapshot_to(index);
        }
    }

    fn apply_upper(&self) -> u64 {
        self.committed.min(self.last_index())
    }

    /// Whether an apply batch or a pending snapshot is waiting for the
    /// host.
    pub(crate) fn has_entries_to_apply(&self) -> bool {
        if let Some(s) = &self.in_mem.snapshot {
            if s.index > self.processed {
                return true;
            }
        }
        self.apply_upper() > self.processed
    }

    /// The next batch `(processed, min(committed, last_index)]`, bounded
    /// by the apply byte budget.
    pub(crate) fn entries_to_apply(&self) -> Result<Vec<Entry>, StoreError> {
        let lo = self.processed + 1;
        let hi = self.apply_upper() + 1;
        if lo >= hi {
            return Ok(Vec::new());
        }
        self.get_entries(lo, hi, self.max_apply_batch_bytes)
    }

    /// Mark entries up to `index` as handed off to the apply host.
    pub(crate) fn set_processed(&mut self, index: u64) {
        debug_assert!(index >= self.processed);
        debug_assert!(index <= self.committed);
        self.processed = index;
    }

    /// The voter's up-to-date rule: a candidate wins with a higher last
    /// term, or the same last term and at least as long a log.
    pub(crate) fn up_to_date(&self, candidate_last: u64, candidate_term: u64) -> bool {
        let local_term = self.last_term();
        candidate_term > local_term || (candidate_term == local_term && candidate_last >= self.last_index())
    }

    /// Bytes held by the unstable tail, for admission back-pressure.
    pub(crate) fn in_mem_size(&self) -> u64 {
        self.in_mem.size_in_bytes()
    }

    /// The durable store compacted through `index`; advance the cached
    /// read window to match.
    pub(crate) fn compacted_to(&mut self, index: u64, term: u64) {
        if index >= self.in_mem.first_unstable_index() {
            return;
        }
        self.reader.compacted_to(index, term);
    }
}

impl Validate for ReplicaLog {
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        validit::less_equal!(self.first_index(), self.last_index() + 1);
        validit::less_equal!(self.processed, self.committed);
        validit::less_equal!(self.committed, self.last_index());
        Ok(())
    }
}

impl fmt::Debug for ReplicaLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaLog")
            .field("group", &self.group)
            .field("first", &self.first_index())
            .field("last", &self.last_index())
            .field("seam", &self.in_mem.first_unstable_index())
            .field("committed", &self.committed)
            .field("processed", &self.processed)
            .finish()
    }
}
