//! The durable log store boundary.
//!
//! [`LogStore`] is the only contract between the consensus core and
//! whatever persistence engine hosts it. The provided
//! [`ShardedLogDb`](crate::storage::ShardedLogDb) keeps everything in
//! memory behind sharded writer locks; a production deployment substitutes
//! an on-disk implementation with the same semantics.

mod logdb;


use std::time::Duration;

use anyerror::AnyError;
pub use logdb::ShardedLogDb;

use crate::snapshot::SnapshotMeta;
use crate::types::GroupId;
use crate::types::HardState;
use crate::types::Update;
use crate::Entry;

/// Errors produced by a [`LogStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The requested range reaches below the compacted boundary.
    #[error("log compacted")]
    Compacted,

    /// The requested range reaches past the last stored index.
    #[error("log unavailable")]
    Unavailable,

    /// A temporary failure; the caller retries with backoff.
    #[error("transient store failure: {0}")]
    Transient(AnyError),

    /// The store detected unrecoverable damage. Fatal to the owning node.
    #[error("corrupt store: {0}")]
    Corrupt(AnyError),

    #[error("store closed")]
    Closed,
}

/// Raft state read back from the store at node startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredState {
    pub hard_state: HardState,
    pub first_index: u64,
    pub entry_count: u64,
}

/// Durable, compactable sequence of entries per `(shard, replica)`.
///
/// ### To ensure correctness:
///
/// - Writes for the same group must be applied in call order; writes for
///   different groups are independent.
/// - `append` must persist, per update: hard state, then entries (with
///   truncate-then-write semantics at the first index of the batch), then
///   the snapshot record. A snapshot record must never become visible
///   while entries it covers are still unwritten, which is why the node
///   runtime calls [`LogStore::save_snapshots`] before the raft-state
///   batch of the same round.
/// - All methods may be called from any thread.
pub trait LogStore: Send + Sync + 'static {
    /// Atomically persist hard state, new entries and the snapshot record
    /// of each update. Batching across shards is allowed.
    fn append(&self, updates: &[Update]) -> Result<(), StoreError>;

    /// Persist only the snapshot records of the given updates.
    fn save_snapshots(&self, updates: &[Update]) -> Result<(), StoreError>;

    /// Install a snapshot as the new head of a recovering replica's log,
    /// discarding every entry it covers.
    fn import_snapshot(&self, group: GroupId, snapshot: &SnapshotMeta) -> Result<(), StoreError>;

    /// State recorded for `group`, or `None` for a pristine replica.
    fn raft_state(&self, group: GroupId) -> Result<Option<RecoveredState>, StoreError>;

    /// The most recent snapshot record of `group`, if any.
    fn snapshot_record(&self, group: GroupId) -> Result<Option<SnapshotMeta>, StoreError>;

    /// `(first_index, last_index)` of the durable log. An empty log
    /// reports `(m + 1, m)` where `m` is the compacted-through index.
    fn range(&self, group: GroupId) -> Result<(u64, u64), StoreError>;

    /// Entries in `[lo, hi)` bounded by `max_bytes`, never empty if the
    /// range is non-empty and valid: the first entry is returned even
    /// when it alone exceeds the budget.
    fn entries(&self, group: GroupId, lo: u64, hi: u64, max_bytes: u64) -> Result<Vec<Entry>, StoreError>;

    /// Term of the entry at `index`. The compacted boundary index itself
    /// is still answerable.
    fn term(&self, group: GroupId, index: u64) -> Result<u64, StoreError>;

    /// Drop all entries with `index <= up_to`.
    fn compact(&self, group: GroupId, up_to: u64) -> Result<(), StoreError>;

    fn close(&self) -> Result<(), StoreError>;
}

/// Run a store write, retrying transient failures with bounded
/// exponential backoff. Anything still failing after the budget, and any
/// non-transient failure, is unrecoverable for the owning node.
pub(crate) fn with_retry<T>(what: &str, mut f: impl FnMut() -> Result<T, StoreError>) -> T {
    let mut backoff_ms = 1;
    for attempt in 0..4 {
        match f() {
            Ok(v) => return v,
            Err(StoreError::Transient(e)) if attempt < 3 => {
                tracing::warn!(err = display(&e), attempt, "transient failure in {}, retrying", what);
                std::thread::sleep(Duration::from_millis(backoff_ms));
                backoff_ms *= 2;
            }
            Err(StoreError::Corrupt(e)) => panic!("{} failed: {}", what, crate::error::Fatal::CorruptStore(e)),
            Err(e) => panic!("log store failure in {}: {}", what, e),
        }
    }
    unreachable!()
}
