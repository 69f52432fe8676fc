use std::fmt;

/// Replication mode toward one remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProgressState {
    /// Probing for the match point, one message at a time.
    Probe,

    /// Streaming entries optimistically.
    Replicate,

    /// The remote is behind the compacted boundary; a snapshot is in
    /// flight and replication is paused until it reports back.
    Snapshot,
}

/// The leader's view of one remote replica.
#[derive(Debug, Clone)]
pub(crate) struct Progress {
    pub(crate) match_index: u64,
    pub(crate) next_index: u64,
    pub(crate) state: ProgressState,

    /// Saw any response since the last check-quorum sweep.
    pub(crate) recent_active: bool,

    /// In probe mode, one unanswered message at a time.
    pub(crate) paused: bool,
}

impl Progress {
    pub(crate) fn new(last_index: u64) -> Self {
        Progress {
            match_index: 0,
            next_index: last_index + 1,
            state: ProgressState::Probe,
            recent_active: true,
            paused: false,
        }
    }

    /// An accepted replication response: advance to `index`.
    /// Returns true when the match point moved.
    pub(crate) fn on_accept(&mut self, index: u64) -> bool {
        self.paused = false;
        if self.state == ProgressState::Probe {
            self.state = ProgressState::Replicate;
        }
        if index > self.match_index {
            self.match_index = index;
            self.next_index = self.next_index.max(index + 1);
            return true;
        }
        self.next_index = self.next_index.max(index + 1);
        false
    }

    /// A rejected replication response carrying the remote's last index
    /// as a hint. Returns false when the rejection is stale and must be
    /// ignored.
    pub(crate) fn on_reject(&mut self, rejected: u64, hint: u64) -> bool {
        if self.state == ProgressState::Replicate {
            // stale rejection of an index the remote has since confirmed
            if rejected <= self.match_index {
                return false;
            }
            self.state = ProgressState::Probe;
        }

        if self.next_index != rejected + 1 {
            // response to an older probe
            return false;
        }

        self.next_index = (hint + 1).min(rejected).max(1);
        self.paused = false;
        true
    }

    pub(crate) fn become_snapshot(&mut self) {
        self.state = ProgressState::Snapshot;
        self.paused = true;
    }

    /// The snapshot at `index` has been accepted; resume probing after it.
    pub(crate) fn snapshot_done(&mut self, index: u64) {
        self.state = ProgressState::Probe;
        self.match_index = self.match_index.max(index);
        self.next_index = self.match_index + 1;
        self.paused = false;
    }

    /// Whether the leader should send entries to this remote now.
    pub(crate) fn should_send(&self) -> bool {
        match self.state {
            ProgressState::Snapshot => false,
            ProgressState::Probe => !self.paused,
            ProgressState::Replicate => true,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} m{} n{}{}",
            self.state,
            self.match_index,
            self.next_index,
            if self.paused { " paused" } else { "" }
        )
    }
}
