use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::entry::Entry;
use crate::snapshot::SnapshotMeta;
use crate::storage::LogStore;
use crate::storage::RecoveredState;
use crate::storage::StoreError;
use crate::types::GroupId;
use crate::types::HardState;
use crate::types::Update;

/// Durable state of one `(shard, replica)` group.
///
/// `marker` is the compacted-through index: the first meaningful entry is
/// `marker + 1`. The term at `marker` is kept so the snapshot boundary
/// index stays answerable after compaction.
#[derive(Debug, Default)]
struct GroupRecord {
    marker: u64,
    marker_term: u64,
    entries: VecDeque<Entry>,
    hard_state: HardState,
    has_state: bool,
    snapshot: Option<SnapshotMeta>,
}

impl GroupRecord {
    fn first_index(&self) -> u64 {
        self.marker + 1
    }

    fn last_index(&self) -> u64 {
        self.marker + self.entries.len() as u64
    }

    fn save_entries(&mut self, entries: &[Entry]) {
        let Some(first_new) = entries.first().map(|e| e.index) else {
            return;
        };

        // Truncate-then-write: a later entry at an existing index
        // supersedes the old tail from that point on.
        if first_new <= self.last_index() {
            let keep = first_new.saturating_sub(self.first_index()) as usize;
            self.entries.truncate(keep);
        }

        for e in entries {
            if e.index <= self.marker {
                continue;
            }
            debug_assert_eq!(e.index, self.last_index() + 1, "log store must stay gapless");
            self.entries.push_back(e.clone());
        }
    }

    fn save_snapshot(&mut self, meta: &SnapshotMeta) {
        let newer = self.snapshot.as_ref().map(|s| meta.index > s.index).unwrap_or(true);
        if newer {
            self.snapshot = Some(meta.clone());
        }
    }
}

/// In-process [`LogStore`] with sharded writers.
///
/// Groups are spread across `shards` independently locked maps, so writes
/// for different groups proceed in parallel while writes for one group are
/// serialized by its shard lock.
#[derive(Debug)]
pub struct ShardedLogDb {
    shards: Vec<Mutex<HashMap<GroupId, GroupRecord>>>,
    closed: AtomicBool,
}

impl ShardedLogDb {
    pub fn new(shards: usize) -> Self {
        assert!(shards > 0, "at least one logdb shard is required");
        ShardedLogDb {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            closed: AtomicBool::new(false),
        }
    }

    fn shard(&self, group: GroupId) -> &Mutex<HashMap<GroupId, GroupRecord>> {
        let h = group.shard_id.wrapping_mul(31).wrapping_add(group.replica_id);
        &self.shards[(h % self.shards.len() as u64) as usize]
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn with_group<T>(
        &self,
        group: GroupId,
        f: impl FnOnce(&mut GroupRecord) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check_open()?;
        let mut map = self.shard(group).lock().unwrap();
        f(map.entry(group).or_default())
    }
}

impl LogStore for ShardedLogDb {
    fn append(&self, updates: &[Update]) -> Result<(), StoreError> {
        self.check_open()?;
        for ud in updates {
            if !ud.has_save() {
                continue;
            }
            self.with_group(ud.group, |rec| {
                if let Some(hs) = ud.hard_state {
                    rec.hard_state = hs;
                    rec.has_state = true;
                }
                rec.save_entries(&ud.entries_to_save);
                if let Some(ss) = &ud.snapshot {
                    rec.save_snapshot(ss);
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    fn save_snapshots(&self, updates: &[Update]) -> Result<(), StoreError> {
        self.check_open()?;
        for ud in updates {
            let Some(ss) = &ud.snapshot else {
                continue;
            };
            self.with_group(ud.group, |rec| {
                rec.save_snapshot(ss);
                Ok(())
            })?;
        }
        Ok(())
    }

    fn import_snapshot(&self, group: GroupId, snapshot: &SnapshotMeta) -> Result<(), StoreError> {
        self.with_group(group, |rec| {
            rec.save_snapshot(snapshot);
            rec.marker = snapshot.index;
            rec.marker_term = snapshot.term;
            rec.entries.clear();
            rec.hard_state.term = rec.hard_state.term.max(snapshot.term);
            rec.hard_state.commit = rec.hard_state.commit.max(snapshot.index);
            rec.has_state = true;
            Ok(())
        })
    }

    fn raft_state(&self, group: GroupId) -> Result<Option<RecoveredState>, StoreError> {
        self.with_group(group, |rec| {
            if !rec.has_state {
                return Ok(None);
            }
            Ok(Some(RecoveredState {
                hard_state: rec.hard_state,
                first_index: rec.first_index(),
                entry_count: rec.entries.len() as u64,
            }))
        })
    }

    fn snapshot_record(&self, group: GroupId) -> Result<Option<SnapshotMeta>, StoreError> {
        self.with_group(group, |rec| Ok(rec.snapshot.clone()))
    }

    fn range(&self, group: GroupId) -> Result<(u64, u64), StoreError> {
        self.with_group(group, |rec| Ok((rec.first_index(), rec.last_index())))
    }

    fn entries(&self, group: GroupId, lo: u64, hi: u64, max_bytes: u64) -> Result<Vec<Entry>, StoreError> {
        self.with_group(group, |rec| {
            if lo < rec.first_index() {
                return Err(StoreError::Compacted);
            }
            if hi > rec.last_index() + 1 {
                return Err(StoreError::Unavailable);
            }

            let mut out = Vec::new();
            let mut size: u64 = 0;
            for idx in lo..hi {
                let e = &rec.entries[(idx - rec.first_index()) as usize];
                size += e.size_in_bytes();
                if !out.is_empty() && size > max_bytes {
                    break;
                }
                out.push(e.clone());
            }
            Ok(out)
        })
    }

    fn term(&self, group: GroupId, index: u64) -> Result<u64, StoreError> {
        self.with_group(group, |rec| {
            if index == rec.marker {
                return Ok(rec.marker_term);
            }
            if index < rec.marker {
                return Err(StoreError::Compacted);
            }
            if index > rec.last_index() {
                return Err(StoreError::Unavailable);
            }
            Ok(rec.entries[(index - rec.first_index()) as usize].term)
        })
    }

    fn compact(&self, group: GroupId, up_to: u64) -> Result<(), StoreError> {
        self.with_group(group, |rec| {
            if up_to <= rec.marker {
                return Err(StoreError::Compacted);
            }
            if up_to > rec.last_index() {
                return Err(StoreError::Unavailable);
            }

            let term = rec.entries[(up_to - rec.first_index()) as usize].term;
            let drop = (up_to + 1 - rec.first_index()) as usize;
            rec.entries.drain(..drop);
            rec.marker = up_to;
            rec.marker_term = term;
            Ok(())
        })
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
