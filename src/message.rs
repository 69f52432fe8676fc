use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::snapshot::SnapshotMeta;
use crate::Entry;

/// The kind of a raft message.
///
/// Local kinds are generated and consumed inside one process and never
/// cross the wire; they are exempt from quiesce activity tracking and from
/// drop-on-overflow accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub enum MessageKind {
    /// Local clock tick, carrying a monotonic hint for dedup.
    LocalTick,

    /// Local election trigger, used at startup of a single-replica shard.
    Election,

    /// A proposal forwarded from a non-leader replica to the leader.
    Propose,

    RequestVote,
    RequestVoteResp,

    /// AppendEntries.
    Replicate,
    ReplicateResp,

    Heartbeat,
    HeartbeatResp,

    InstallSnapshot,

    ReadIndex,
    ReadIndexResp,

    /// Ask the target to campaign immediately; used by leader transfer.
    TimeoutNow,

    /// Broadcast once when a shard enters quiesce so peers align.
    EnterQuiesce,
}

impl MessageKind {
    pub fn is_local(&self) -> bool {
        matches!(self, MessageKind::LocalTick | MessageKind::Election)
    }
}

/// A raft message between two replicas of one shard, or a local event.
///
/// A single flat struct is used for all kinds; unused fields stay at their
/// defaults. This mirrors the wire representation and keeps the step path
/// free of per-kind allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub shard_id: u64,
    pub from: u64,
    pub to: u64,
    pub term: u64,

    /// Replicate: index of the entry preceding `entries`.
    /// ReplicateResp: highest matching index, or the rejection hint.
    pub log_index: u64,
    /// Replicate: term of the entry at `log_index`.
    pub log_term: u64,

    pub commit: u64,
    pub entries: Vec<Entry>,

    /// ReplicateResp / RequestVoteResp: request was rejected.
    pub reject: bool,

    /// ReadIndex round trip context: `(replica_id, read_tick)`.
    pub hint: (u64, u64),

    pub snapshot: Option<SnapshotMeta>,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::LocalTick
    }
}

impl Message {
    pub fn is_local(&self) -> bool {
        self.kind.is_local()
    }

    /// Messages that prove a live leader and therefore reset election and
    /// quiesce clocks on the receiver.
    pub fn is_leader_message(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::Replicate | MessageKind::Heartbeat | MessageKind::InstallSnapshot | MessageKind::TimeoutNow
        )
    }

    pub fn local_tick(hint: u64) -> Self {
        Message {
            kind: MessageKind::LocalTick,
            hint: (hint, 0),
            ..Default::default()
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}->{} t{} li{} lt{} c{} n{}",
            self.kind,
            self.from,
            self.to,
            self.term,
            self.log_index,
            self.log_term,
            self.commit,
            self.entries.len()
        )
    }
}

/// A read request context paired with the commit index it may be served at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct ReadState {
    pub index: u64,
    pub ctx: (u64, u64),
}
