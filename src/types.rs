use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::message::Message;
use crate::message::ReadState;
use crate::snapshot::SnapshotMeta;
use crate::Entry;

/// Identifies one replica: a node within a raft group (shard).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
pub struct GroupId {
    pub shard_id: u64,
    pub replica_id: u64,
}

impl GroupId {
    pub fn new(shard_id: u64, replica_id: u64) -> Self {
        GroupId { shard_id, replica_id }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}:{}", self.shard_id, self.replica_id)
    }
}

/// The durable raft state triple.
///
/// Persisted before any message that reveals it may be sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

impl HardState {
    pub fn is_empty(&self) -> bool {
        *self == HardState::default()
    }
}

impl fmt::Display for HardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{} v{} c{}", self.term, self.vote, self.commit)
    }
}

/// Leadership observation pushed out of the peer when it changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaderUpdate {
    /// 0 when there is no known leader.
    pub leader_id: u64,
    pub term: u64,
}

/// One round's output from the raft peer.
///
/// The node runtime executes an update in a fixed order: persist
/// `hard_state` and `entries_to_save` (entries before the `snapshot`
/// record), route `messages`, then hand `committed_entries` to the apply
/// host. `last_applied` carries the host's confirmed apply watermark back
/// through the peer for log retention decisions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub group: GroupId,

    pub hard_state: Option<HardState>,
    pub entries_to_save: Vec<Entry>,
    pub snapshot: Option<SnapshotMeta>,

    pub committed_entries: Vec<Entry>,
    pub messages: Vec<Message>,
    pub ready_to_reads: Vec<ReadState>,
    pub leader_update: Option<LeaderUpdate>,

    pub last_applied: u64,
}

impl Update {
    /// An empty update produces no work; a node whose peer keeps emitting
    /// empty updates is a candidate for quiesce.
    pub fn has_update(&self) -> bool {
        self.hard_state.is_some()
            || !self.entries_to_save.is_empty()
            || self.snapshot.is_some()
            || !self.committed_entries.is_empty()
            || !self.messages.is_empty()
            || !self.ready_to_reads.is_empty()
            || self.leader_update.is_some()
    }

    /// Whether anything in this update must reach the durable store.
    pub fn has_save(&self) -> bool {
        self.hard_state.is_some() || !self.entries_to_save.is_empty() || self.snapshot.is_some()
    }

    /// `(index, term)` of the last entry to persist, used for the
    /// stable-to notification after the durable write completes.
    pub fn last_to_save(&self) -> Option<(u64, u64)> {
        self.entries_to_save.last().map(|e| (e.index, e.term))
    }
}
