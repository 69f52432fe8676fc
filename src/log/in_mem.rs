use crate::entry::entries_size;
use crate::snapshot::SnapshotMeta;
use crate::Entry;

/// The unstable tail of a replica's log: entries appended by the leader or
/// just received from it that are not yet durable, plus a snapshot that is
/// being installed.
///
/// `marker` is the index of the first unstable entry, i.e. the
/// `unstableOffset` seam between the durable view and this tail.
pub(crate) struct InMemLog {
    pub(crate) marker: u64,
    pub(crate) entries: Vec<Entry>,
    pub(crate) snapshot: Option<SnapshotMeta>,

    log_size: u64,
}

impl InMemLog {
    /// An in-memory log that starts right after `last_durable`.
    pub(crate) fn new(last_durable: u64) -> Self {
        InMemLog {
            marker: last_durable + 1,
            entries: Vec::new(),
            snapshot: None,
            log_size: 0,
        }
    }

    pub(crate) fn first_unstable_index(&self) -> u64 {
        self.marker
    }

    /// Last index visible through the tail: the last unstable entry, or
    /// the pending snapshot when the tail is empty.
    pub(crate) fn last_index(&self) -> Option<u64> {
        if !self.entries.is_empty() {
            return Some(self.marker + self.entries.len() as u64 - 1);
        }
        self.snapshot.as_ref().map(|s| s.index)
    }

    pub(crate) fn term(&self, index: u64) -> Option<u64> {
        if index >= self.marker {
            let off = (index - self.marker) as usize;
            return self.entries.get(off).map(|e| e.term);
        }
        match &self.snapshot {
            Some(s) if s.index == index => Some(s.term),
            _ => None,
        }
    }

    pub(crate) fn entries_in(&self, lo: u64, hi: u64) -> &[Entry] {
        debug_assert!(lo >= self.marker);
        let lo = (lo - self.marker) as usize;
        let hi = (hi - self.marker) as usize;
        &self.entries[lo..hi]
    }

    /// Bytes held by unstable entries, used for admission back-pressure.
    pub(crate) fn size_in_bytes(&self) -> u64 {
        self.log_size
    }

    /// Merge a batch of entries into the tail.
    ///
    /// The first index decides the shape: extending append, full
    /// replacement reaching at or below the seam (which rewinds `marker`),
    /// or truncation of a suffix followed by append.
    pub(crate) fn merge(&mut self, ents: &[Entry]) {
        let Some(first) = ents.first().map(|e| e.index) else {
            return;
        };

        let next = self.marker + self.entries.len() as u64;
        if first == next {
            // contiguous extension
        } else if first <= self.marker {
            self.marker = first;
            self.entries.clear();
            self.log_size = 0;
        } else {
            // keep [marker, first), drop the conflicting suffix
            let keep = (first - self.marker) as usize;
            for e in &self.entries[keep..] {
                self.log_size -= e.size_in_bytes();
            }
            self.entries.truncate(keep);
        }

        self.log_size += entries_size(ents);
        self.entries.extend_from_slice(ents);
    }

    /// Install a snapshot: the tail is dropped wholesale and the log
    /// restarts after the snapshot index.
    pub(crate) fn restore(&mut self, meta: SnapshotMeta) {
        self.marker = meta.index + 1;
        self.entries.clear();
        self.log_size = 0;
        self.snapshot = Some(meta);
    }

    /// Durable-write completion. Drops entries up to `index` iff the entry
    /// at `index` still carries `term`; a mismatch means the tail was
    /// rewound since the write was issued and the notification is stale.
    pub(crate) fn saved_to(&mut self, index: u64, term: u64) {
        if index < self.marker {
            return;
        }
        match self.term(index) {
            Some(t) if t == term => {}
            _ => return,
        }

        let drop = (index + 1 - self.marker) as usize;
        for e in &self.entries[..drop] {
            self.log_size -= e.size_in_bytes();
        }
        self.entries.drain(..drop);
        self.marker = index + 1;
    }

    /// Durable-snapshot completion: forget the pending snapshot once its
    /// record has reached the store.
    pub(crate) fn saved_snapshot_to(&mut self, index: u64) {
        if let Some(s) = &self.snapshot {
            if s.index == index {
                self.snapshot = None;
            }
        }
    }
}
