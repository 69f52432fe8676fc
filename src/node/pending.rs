use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::RequestError;
use crate::message::ReadState;
use crate::sm::SmResult;

/// Final outcome of a pending request, written to its channel exactly
/// once.
#[derive(Debug)]
pub(crate) enum RequestOutcome {
    Completed(SmResult),
    Rejected,
    Timeout,
    Terminated,
    Dropped,
}

/// Caller side of one pending request.
pub(crate) struct RequestHandle {
    rx: oneshot::Receiver<RequestOutcome>,
}

impl RequestHandle {
    pub(crate) async fn wait(self) -> Result<SmResult, RequestError> {
        match self.rx.await {
            Ok(RequestOutcome::Completed(r)) => Ok(r),
            Ok(RequestOutcome::Rejected) => Err(RequestError::Rejected),
            Ok(RequestOutcome::Timeout) => Err(RequestError::Timeout),
            Ok(RequestOutcome::Terminated) => Err(RequestError::Terminated),
            Ok(RequestOutcome::Dropped) => Err(RequestError::Dropped),
            Err(_) => Err(RequestError::Terminated),
        }
    }
}

struct RequestState {
    deadline: u64,
    tx: oneshot::Sender<RequestOutcome>,
}

impl RequestState {
    fn complete(self, outcome: RequestOutcome) {
        // the caller may have given up waiting; that is not an error
        let _ = self.tx.send(outcome);
    }
}

/// Tracks every request awaiting its raft outcome: proposals,
/// read-indexes, config changes, snapshot requests, leader transfers.
///
/// Deadlines are tick-denominated. Completion happens on the step task;
/// creation happens on caller tasks under the node's registry lock.
pub(crate) struct PendingRequests {
    replica_id: u64,
    current_tick: u64,
    next_key: u64,
    read_tick: u64,

    proposals: HashMap<u64, RequestState>,
    config_changes: HashMap<u64, RequestState>,
    reads: HashMap<u64, RequestState>,
    /// Quorum-confirmed reads waiting for apply to catch up.
    ready_reads: Vec<(u64, u64)>,

    snapshot: Option<(u64, RequestState)>,
    transfer: Option<(u64, RequestState)>,
}

impl PendingRequests {
    pub(crate) fn new(replica_id: u64) -> Self {
        PendingRequests {
            replica_id,
            current_tick: 0,
            // key 0 means "nobody waiting"
            next_key: 1,
            read_tick: 0,
            proposals: HashMap::new(),
            config_changes: HashMap::new(),
            reads: HashMap::new(),
            ready_reads: Vec::new(),
            snapshot: None,
            transfer: None,
        }
    }

    fn request(&mut self, timeout_ticks: u64) -> (RequestState, RequestHandle) {
        let (tx, rx) = oneshot::channel();
        (
            RequestState {
                deadline: self.current_tick + timeout_ticks.max(1),
                tx,
            },
            RequestHandle { rx },
        )
    }

    pub(crate) fn new_proposal(&mut self, timeout_ticks: u64) -> (u64, RequestHandle) {
        let key = self.next_key;
        self.next_key += 1;
        let (state, handle) = self.request(timeout_ticks);
        self.proposals.insert(key, state);
        (key, handle)
    }

    pub(crate) fn new_config_change(&mut self, timeout_ticks: u64) -> (u64, RequestHandle) {
        let key = self.next_key;
        self.next_key += 1;
        let (state, handle) = self.request(timeout_ticks);
        self.config_changes.insert(key, state);
        (key, handle)
    }

    /// Read-index requests are keyed by a per-node monotonic read tick,
    /// packed with the replica id into the round context.
    pub(crate) fn new_read(&mut self, timeout_ticks: u64) -> ((u64, u64), RequestHandle) {
        self.read_tick += 1;
        let ctx = (self.replica_id, self.read_tick);
        let (state, handle) = self.request(timeout_ticks);
        self.reads.insert(self.read_tick, state);
        (ctx, handle)
    }

    pub(crate) fn new_snapshot(&mut self, timeout_ticks: u64) -> Result<(u64, RequestHandle), RequestError> {
        if self.snapshot.is_some() {
            return Err(RequestError::SystemBusy);
        }
        let key = self.next_key;
        self.next_key += 1;
        let (state, handle) = self.request(timeout_ticks);
        self.snapshot = Some((key, state));
        Ok((key, handle))
    }

    pub(crate) fn new_transfer(&mut self, target: u64, timeout_ticks: u64) -> Result<RequestHandle, RequestError> {
        if self.transfer.is_some() {
            return Err(RequestError::SystemBusy);
        }
        let (state, handle) = self.request(timeout_ticks);
        self.transfer = Some((target, state));
        Ok(handle)
    }

    /// Advance the registry clock and time out everything past its
    /// deadline.
    pub(crate) fn tick(&mut self) {
        self.current_tick += 1;
        let now = self.current_tick;

        for map in [&mut self.proposals, &mut self.config_changes, &mut self.reads] {
            let expired: Vec<u64> = map.iter().filter(|(_, s)| s.deadline < now).map(|(k, _)| *k).collect();
            for k in expired {
                if let Some(state) = map.remove(&k) {
                    state.complete(RequestOutcome::Timeout);
                }
            }
        }

        if self.snapshot.as_ref().map(|(_, s)| s.deadline < now).unwrap_or(false) {
            let (_, state) = self.snapshot.take().unwrap();
            state.complete(RequestOutcome::Timeout);
        }
        if self.transfer.as_ref().map(|(_, s)| s.deadline < now).unwrap_or(false) {
            let (_, state) = self.transfer.take().unwrap();
            state.complete(RequestOutcome::Timeout);
        }
    }

    /// An entry with this key was applied; deliver its outcome.
    pub(crate) fn apply_result(&mut self, key: u64, result: SmResult, rejected: bool) {
        let state = self.proposals.remove(&key).or_else(|| self.config_changes.remove(&key));
        if let Some(state) = state {
            if rejected {
                state.complete(RequestOutcome::Rejected);
            } else {
                state.complete(RequestOutcome::Completed(result));
            }
        }
    }

    /// A read-index round confirmed. Completes immediately if apply has
    /// caught up, otherwise parks until [`PendingRequests::applied_to`].
    pub(crate) fn read_ready(&mut self, rs: ReadState, last_applied: u64) {
        if rs.ctx.0 != self.replica_id {
            return;
        }
        if last_applied >= rs.index {
            if let Some(state) = self.reads.remove(&rs.ctx.1) {
                state.complete(RequestOutcome::Completed(SmResult::of(rs.index)));
            }
            return;
        }
        self.ready_reads.push((rs.ctx.1, rs.index));
    }

    pub(crate) fn applied_to(&mut self, last_applied: u64) {
        if self.ready_reads.is_empty() {
            return;
        }
        let mut parked = Vec::new();
        for (tick, index) in self.ready_reads.drain(..) {
            if index <= last_applied {
                if let Some(state) = self.reads.remove(&tick) {
                    state.complete(RequestOutcome::Completed(SmResult::of(index)));
                }
            } else {
                parked.push((tick, index));
            }
        }
        self.ready_reads = parked;
    }

    pub(crate) fn snapshot_done(&mut self, key: u64, index: u64) {
        if self.snapshot.as_ref().map(|(k, _)| *k == key).unwrap_or(false) {
            let (_, state) = self.snapshot.take().unwrap();
            state.complete(RequestOutcome::Completed(SmResult::of(index)));
        }
    }

    pub(crate) fn snapshot_skipped(&mut self, key: u64) {
        if self.snapshot.as_ref().map(|(k, _)| *k == key).unwrap_or(false) {
            let (_, state) = self.snapshot.take().unwrap();
            state.complete(RequestOutcome::Rejected);
        }
    }

    /// Leadership moved; a transfer pointed at the new leader completed.
    pub(crate) fn leader_changed(&mut self, leader_id: u64) {
        if self.transfer.as_ref().map(|(t, _)| *t == leader_id).unwrap_or(false) {
            let (_, state) = self.transfer.take().unwrap();
            state.complete(RequestOutcome::Completed(SmResult::of(leader_id)));
        }
    }

    /// Hard shutdown: every pending request becomes `Terminated`.
    pub(crate) fn terminate_all(&mut self) {
        for (_, state) in self.proposals.drain() {
            state.complete(RequestOutcome::Terminated);
        }
        for (_, state) in self.config_changes.drain() {
            state.complete(RequestOutcome::Terminated);
        }
        for (_, state) in self.reads.drain() {
            state.complete(RequestOutcome::Terminated);
        }
        self.ready_reads.clear();
        if let Some((_, state)) = self.snapshot.take() {
            state.complete(RequestOutcome::Terminated);
        }
        if let Some((_, state)) = self.transfer.take() {
            state.complete(RequestOutcome::Terminated);
        }
    }
}
