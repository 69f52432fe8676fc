use std::collections::BTreeSet;
use std::collections::VecDeque;

use crate::message::ReadState;

/// One in-flight read-index round on the leader.
#[derive(Debug)]
struct PendingRead {
    ctx: (u64, u64),
    /// Commit index captured when the read entered the queue.
    index: u64,
    acks: BTreeSet<u64>,
}

/// Tracks read-index rounds awaiting quorum confirmation.
///
/// Requests confirm in arrival order: an ack that satisfies the quorum for
/// a later request also releases every earlier one, since the heartbeat
/// round that confirmed leadership covers them all.
#[derive(Debug, Default)]
pub(crate) struct ReadIndexQueue {
    pending: VecDeque<PendingRead>,
}

impl ReadIndexQueue {
    pub(crate) fn add(&mut self, ctx: (u64, u64), index: u64) {
        self.pending.push_back(PendingRead {
            ctx,
            index,
            acks: BTreeSet::new(),
        });
    }

    /// Record an ack from `from` for the round identified by `ctx`.
    /// Returns the read states released by reaching `quorum` (the leader
    /// itself is counted implicitly).
    pub(crate) fn ack(&mut self, ctx: (u64, u64), from: u64, quorum: usize) -> Vec<ReadState> {
        let Some(pos) = self.pending.iter().position(|p| p.ctx == ctx) else {
            return Vec::new();
        };

        self.pending[pos].acks.insert(from);
        if self.pending[pos].acks.len() + 1 < quorum {
            return Vec::new();
        }

        self.pending
            .drain(..=pos)
            .map(|p| ReadState {
                index: p.index,
                ctx: p.ctx,
            })
            .collect()
    }

    /// Leadership was lost; every pending read is void.
    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
