//! The raft peer: election, replication and commit tracking for one
//! replica.
//!
//! The peer is strictly sans-io: [`Peer::step`] and
//! [`Peer::tick`] mutate only in-memory state and accumulate effects
//! (messages, unstable entries, committed batches, read states) that the
//! node runtime collects with [`Peer::get_update`] and executes in a fixed
//! order. Nothing here touches a socket or waits on a write.

mod progress;
mod read_index;

#[cfg(test)]
mod peer_test;

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use progress::Progress;
use progress::ProgressState;
use read_index::ReadIndexQueue;
use validit::Valid;

use crate::config::Config;
use crate::entry::EntryType;
use crate::log::ReplicaLog;
use crate::message::Message;
use crate::message::MessageKind;
use crate::message::ReadState;
use crate::snapshot::SnapshotMeta;
use crate::storage::StoreError;
use crate::types::GroupId;
use crate::types::HardState;
use crate::types::LeaderUpdate;
use crate::types::Update;
use crate::Entry;
use crate::Membership;

/// Byte budget of one replication message.
const MAX_REPLICATE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Follower,
    Candidate,
    Leader,
}

pub(crate) struct Peer {
    group: GroupId,
    config: Arc<Config>,

    pub(crate) log: Valid<ReplicaLog>,

    role: Role,
    term: u64,
    vote: u64,
    leader_id: u64,

    membership: Membership,
    remotes: BTreeMap<u64, Progress>,

    votes: BTreeMap<u64, bool>,

    election_tick: u64,
    randomized_election_tick: u64,
    heartbeat_tick: u64,

    leader_transfer_target: Option<u64>,

    read_index: ReadIndexQueue,
    pending_read_states: Vec<ReadState>,

    latest_snapshot: Option<SnapshotMeta>,

    msgs: Vec<Message>,
    prev_hard_state: HardState,
    prev_leader_update: LeaderUpdate,
}

impl Peer {
    pub(crate) fn new(
        group: GroupId,
        config: Arc<Config>,
        log: ReplicaLog,
        hard_state: HardState,
        membership: Membership,
        latest_snapshot: Option<SnapshotMeta>,
    ) -> Self {
        let last = log.last_index();
        let mut peer = Peer {
            group,
            randomized_election_tick: config.new_rand_election_tick(),
            config,
            log: Valid::new(log),
            role: Role::Follower,
            term: hard_state.term,
            vote: hard_state.vote,
            leader_id: 0,
            membership: Membership::new(),
            remotes: BTreeMap::new(),
            votes: BTreeMap::new(),
            election_tick: 0,
            heartbeat_tick: 0,
            leader_transfer_target: None,
            read_index: ReadIndexQueue::default(),
            pending_read_states: Vec::new(),
            latest_snapshot,
            msgs: Vec::new(),
            prev_hard_state: hard_state,
            prev_leader_update: LeaderUpdate::default(),
        };
        peer.set_membership(&membership, last);
        peer
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub(crate) fn leader_id(&self) -> u64 {
        self.leader_id
    }

    pub(crate) fn term(&self) -> u64 {
        self.term
    }

    /// Remote replicas this peer talks to, for quiesce broadcasts.
    pub(crate) fn remote_ids(&self) -> Vec<u64> {
        self.remotes.keys().copied().filter(|id| *id != self.replica_id()).collect()
    }

    fn replica_id(&self) -> u64 {
        self.group.replica_id
    }

    fn quorum(&self) -> usize {
        self.membership.quorum()
    }

    fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.log.committed,
        }
    }

    /// Install a new membership after a config change or snapshot
    /// recovery has been applied by the host.
    pub(crate) fn set_membership(&mut self, m: &Membership, last_index: u64) {
        self.membership = m.clone();

        let mut remotes = BTreeMap::new();
        for id in m.all_ids() {
            let pr = self.remotes.remove(&id).unwrap_or_else(|| Progress::new(last_index));
            remotes.insert(id, pr);
        }
        self.remotes = remotes;
    }

    /// Remember the latest durable snapshot so lagging remotes can be
    /// caught up with it.
    pub(crate) fn set_snapshot_record(&mut self, meta: SnapshotMeta) {
        let newer = self.latest_snapshot.as_ref().map(|s| meta.index > s.index).unwrap_or(true);
        if newer {
            self.latest_snapshot = Some(meta);
        }
    }

    // ---- local time ----

    pub(crate) fn tick(&mut self) -> Result<(), StoreError> {
        if self.role == Role::Leader {
            self.tick_leader()
        } else {
            self.tick_election();
            Ok(())
        }
    }

    fn tick_election(&mut self) {
        self.election_tick += 1;
        if !self.can_campaign() {
            return;
        }
        if self.election_tick >= self.randomized_election_tick {
            self.election_tick = 0;
            self.campaign();
        }
    }

    fn tick_leader(&mut self) -> Result<(), StoreError> {
        self.heartbeat_tick += 1;
        self.election_tick += 1;

        if self.election_tick >= self.config.election_rtt {
            self.election_tick = 0;
            if self.config.check_quorum {
                self.check_quorum_active();
            }
            if self.role == Role::Leader && self.leader_transfer_target.take().is_some() {
                tracing::info!(group = display(self.group), "leader transfer timed out");
            }
        }

        if self.role == Role::Leader && self.heartbeat_tick >= self.config.heartbeat_rtt {
            self.heartbeat_tick = 0;
            self.broadcast_heartbeat(None);
        }
        Ok(())
    }

    fn can_campaign(&self) -> bool {
        !self.config.is_observer
            && !self.config.is_witness
            && self.membership.addresses.contains_key(&self.replica_id())
    }

    /// Step down when a quorum of voters went silent for a full election
    /// interval.
    fn check_quorum_active(&mut self) {
        let mut active = 0;
        for (id, pr) in self.remotes.iter_mut() {
            if !self.membership.is_voter(*id) {
                continue;
            }
            if *id == self.group.replica_id || pr.recent_active {
                active += 1;
            }
            pr.recent_active = false;
        }

        if active < self.quorum() {
            tracing::warn!(group = display(self.group), "leader lost quorum, stepping down");
            let term = self.term;
            self.become_follower(term, 0);
        }
    }

    // ---- role transitions ----

    fn become_follower(&mut self, term: u64, leader_id: u64) {
        if term > self.term {
            self.term = term;
            self.vote = 0;
        }
        self.role = Role::Follower;
        self.leader_id = leader_id;
        self.votes.clear();
        self.election_tick = 0;
        self.randomized_election_tick = self.config.new_rand_election_tick();
        self.leader_transfer_target = None;
        self.read_index.clear();
    }

    fn campaign(&mut self) {
        self.role = Role::Candidate;
        self.term += 1;
        self.vote = self.replica_id();
        self.leader_id = 0;
        self.votes.clear();
        self.votes.insert(self.replica_id(), true);
        self.randomized_election_tick = self.config.new_rand_election_tick();

        tracing::debug!(group = display(self.group), term = self.term, "campaigning");

        if self.vote_granted_count() >= self.quorum() {
            self.become_leader();
            return;
        }

        let (last_index, last_term) = (self.log.last_index(), self.log.last_term());
        for id in self.membership.voting_ids().collect::<Vec<_>>() {
            if id == self.replica_id() {
                continue;
            }
            self.send(Message {
                kind: MessageKind::RequestVote,
                to: id,
                log_index: last_index,
                log_term: last_term,
                ..self.base_msg()
            });
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader_id = self.replica_id();
        self.heartbeat_tick = 0;
        self.election_tick = 0;
        self.leader_transfer_target = None;
        self.read_index.clear();

        let last = self.log.last_index();
        for pr in self.remotes.values_mut() {
            *pr = Progress::new(last);
        }

        tracing::info!(group = display(self.group), term = self.term, "became leader");

        // establish commit authority in this term with an empty entry
        let noop = Entry::new(last + 1, self.term);
        self.log.append(&[noop]);
        self.maybe_commit().expect("own log term lookup cannot fail for the last entry");
        self.broadcast_replicate();
    }

    fn vote_granted_count(&self) -> usize {
        self.votes.values().filter(|granted| **granted).count()
    }

    // ---- inbound ----

    #[tracing::instrument(level = "trace", skip_all, fields(group = display(self.group), msg = display(&msg)))]
    pub(crate) fn step(&mut self, msg: Message) -> Result<(), StoreError> {
        match msg.kind {
            MessageKind::LocalTick => return self.tick(),
            MessageKind::Election => {
                if self.role != Role::Leader && self.can_campaign() {
                    self.campaign();
                }
                return Ok(());
            }
            MessageKind::EnterQuiesce => return Ok(()),
            _ => {}
        }

        if msg.term > self.term {
            let leader = if msg.is_leader_message() { msg.from } else { 0 };
            self.become_follower(msg.term, leader);
        } else if msg.term > 0 && msg.term < self.term {
            if msg.kind == MessageKind::RequestVote {
                // let a stale candidate catch up with the current term
                self.send(Message {
                    kind: MessageKind::RequestVoteResp,
                    to: msg.from,
                    reject: true,
                    ..self.base_msg()
                });
            }
            return Ok(());
        }

        match msg.kind {
            MessageKind::Propose => {
                if self.role == Role::Leader {
                    self.propose(msg.entries)?;
                }
            }
            MessageKind::RequestVote => self.handle_request_vote(msg),
            MessageKind::RequestVoteResp => self.handle_request_vote_resp(msg),
            MessageKind::Replicate => self.handle_replicate(msg),
            MessageKind::ReplicateResp => self.handle_replicate_resp(msg)?,
            MessageKind::Heartbeat => self.handle_heartbeat(msg),
            MessageKind::HeartbeatResp => self.handle_heartbeat_resp(msg)?,
            MessageKind::InstallSnapshot => self.handle_install_snapshot(msg),
            MessageKind::ReadIndex => self.handle_read_index(msg)?,
            MessageKind::ReadIndexResp => {
                self.pending_read_states.push(ReadState {
                    index: msg.log_index,
                    ctx: msg.hint,
                });
            }
            MessageKind::TimeoutNow => {
                if self.can_campaign() {
                    tracing::info!(group = display(self.group), "received timeout-now, campaigning");
                    self.campaign();
                }
            }
            MessageKind::LocalTick | MessageKind::Election | MessageKind::EnterQuiesce => unreachable!(),
        }
        Ok(())
    }

    fn handle_request_vote(&mut self, msg: Message) {
        let can_vote = self.vote == 0 || self.vote == msg.from;
        let grant = can_vote
            && !self.config.is_observer
            && self.log.up_to_date(msg.log_index, msg.log_term);

        if grant {
            self.vote = msg.from;
            self.election_tick = 0;
        }

        self.send(Message {
            kind: MessageKind::RequestVoteResp,
            to: msg.from,
            reject: !grant,
            ..self.base_msg()
        });
    }

    fn handle_request_vote_resp(&mut self, msg: Message) {
        if self.role != Role::Candidate {
            return;
        }

        self.votes.insert(msg.from, !msg.reject);

        let granted = self.vote_granted_count();
        let rejected = self.votes.len() - granted;
        if granted >= self.quorum() {
            self.become_leader();
        } else if rejected >= self.quorum() {
            let term = self.term;
            self.become_follower(term, 0);
        }
    }

    fn handle_replicate(&mut self, msg: Message) {
        self.observe_leader(msg.from);

        let (last_new, accepted) = self.log.try_append(msg.log_index, msg.log_term, msg.commit, &msg.entries);

        let mut resp = Message {
            kind: MessageKind::ReplicateResp,
            to: msg.from,
            ..self.base_msg()
        };
        if accepted {
            resp.log_index = last_new;
        } else {
            resp.reject = true;
            resp.log_index = msg.log_index;
            resp.hint = (self.log.last_index(), 0);
        }
        self.send(resp);
    }

    fn handle_replicate_resp(&mut self, msg: Message) -> Result<(), StoreError> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let transfer_target = self.leader_transfer_target;
        let last_index = self.log.last_index();

        let Some(pr) = self.remotes.get_mut(&msg.from) else {
            return Ok(());
        };
        pr.recent_active = true;

        if msg.reject {
            if pr.state == ProgressState::Snapshot {
                return Ok(());
            }
            if pr.on_reject(msg.log_index, msg.hint.0) {
                self.send_replicate(msg.from)?;
            }
            return Ok(());
        }

        if pr.state == ProgressState::Snapshot {
            pr.snapshot_done(msg.log_index);
        }
        let advanced = pr.on_accept(msg.log_index);
        let caught_up = pr.match_index == last_index;

        if advanced && self.maybe_commit()? {
            self.broadcast_heartbeat(None);
        }
        if !caught_up {
            self.send_replicate(msg.from)?;
        } else if transfer_target == Some(msg.from) {
            self.send(Message {
                kind: MessageKind::TimeoutNow,
                to: msg.from,
                ..self.base_msg()
            });
        }
        Ok(())
    }

    fn handle_heartbeat(&mut self, msg: Message) {
        self.observe_leader(msg.from);

        let commit = msg.commit.min(self.log.last_index());
        self.log.commit_to(commit);

        self.send(Message {
            kind: MessageKind::HeartbeatResp,
            to: msg.from,
            hint: msg.hint,
            ..self.base_msg()
        });
    }

    fn handle_heartbeat_resp(&mut self, msg: Message) -> Result<(), StoreError> {
        if self.role != Role::Leader {
            return Ok(());
        }

        let last_index = self.log.last_index();
        let behind = {
            let Some(pr) = self.remotes.get_mut(&msg.from) else {
                return Ok(());
            };
            pr.recent_active = true;
            // a live heartbeat round releases a stalled probe
            pr.paused = false;
            pr.match_index < last_index
        };

        if msg.hint != (0, 0) {
            let quorum = self.quorum();
            let released = self.read_index.ack(msg.hint, msg.from, quorum);
            for rs in released {
                self.push_read_state(rs);
            }
        }

        if behind {
            self.send_replicate(msg.from)?;
        }
        Ok(())
    }

    fn handle_install_snapshot(&mut self, msg: Message) {
        self.observe_leader(msg.from);

        let Some(meta) = msg.snapshot else {
            return;
        };

        // a snapshot that does not advance the commit point is useless
        // here; report progress so the leader resumes log replication
        let resp_index = if meta.index <= self.log.committed {
            tracing::debug!(
                group = display(self.group),
                snapshot = meta.index,
                committed = self.log.committed,
                "ignoring stale snapshot"
            );
            self.log.committed
        } else {
            let index = meta.index;
            self.log.apply_snapshot(meta);
            index
        };

        self.send(Message {
            kind: MessageKind::ReplicateResp,
            to: msg.from,
            log_index: resp_index,
            ..self.base_msg()
        });
    }

    fn handle_read_index(&mut self, msg: Message) -> Result<(), StoreError> {
        if self.role != Role::Leader {
            if self.leader_id != 0 {
                let mut fwd = msg;
                fwd.to = self.leader_id;
                fwd.from = self.replica_id();
                fwd.term = self.term;
                fwd.shard_id = self.group.shard_id;
                self.msgs.push(fwd);
            }
            return Ok(());
        }

        // reads are only safe once this term has committed an entry
        if self.log.term(self.log.committed)? != self.term {
            tracing::debug!(group = display(self.group), "read dropped, no commit in current term");
            return Ok(());
        }

        let committed = self.log.committed;
        if self.quorum() == 1 {
            self.push_read_state(ReadState {
                index: committed,
                ctx: msg.hint,
            });
        } else {
            self.read_index.add(msg.hint, committed);
            self.broadcast_heartbeat(Some(msg.hint));
        }
        Ok(())
    }

    fn push_read_state(&mut self, rs: ReadState) {
        if rs.ctx.0 == self.replica_id() {
            self.pending_read_states.push(rs);
        } else {
            self.send(Message {
                kind: MessageKind::ReadIndexResp,
                to: rs.ctx.0,
                log_index: rs.index,
                hint: rs.ctx,
                ..self.base_msg()
            });
        }
    }

    fn observe_leader(&mut self, from: u64) {
        self.leader_id = from;
        self.election_tick = 0;
        if self.role != Role::Follower {
            self.role = Role::Follower;
            self.votes.clear();
        }
    }

    // ---- proposals ----

    /// Leader path: assign indices and replicate. A non-leader forwards
    /// to the known leader; with no leader the proposal is dropped and
    /// the caller's deadline handles it.
    pub(crate) fn propose(&mut self, entries: Vec<Entry>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        if self.role != Role::Leader {
            if self.leader_id != 0 {
                self.send(Message {
                    kind: MessageKind::Propose,
                    to: self.leader_id,
                    entries,
                    ..self.base_msg()
                });
            } else {
                tracing::debug!(group = display(self.group), "proposal dropped, no leader");
            }
            return Ok(());
        }

        if self.leader_transfer_target.is_some() {
            tracing::debug!(group = display(self.group), "proposal dropped during leader transfer");
            return Ok(());
        }

        let mut entries = entries;
        let mut index = self.log.last_index();
        for e in &mut entries {
            index += 1;
            e.index = index;
            e.term = self.term;
        }
        self.log.append(&entries);

        if self.maybe_commit()? {
            self.broadcast_heartbeat(None);
        }
        self.broadcast_replicate();
        Ok(())
    }

    /// Ask `target` to take over leadership once it is caught up.
    pub(crate) fn request_leader_transfer(&mut self, target: u64) {
        if self.role != Role::Leader || !self.membership.addresses.contains_key(&target) {
            return;
        }
        self.leader_transfer_target = Some(target);
        self.election_tick = 0;

        let caught_up = self.remotes.get(&target).map(|pr| pr.match_index == self.log.last_index());
        if caught_up == Some(true) {
            self.send(Message {
                kind: MessageKind::TimeoutNow,
                to: target,
                ..self.base_msg()
            });
        } else {
            let _ = self.send_replicate(target);
        }
    }

    /// Start a read-index round for `ctx`.
    pub(crate) fn request_read_index(&mut self, ctx: (u64, u64)) -> Result<(), StoreError> {
        let msg = Message {
            kind: MessageKind::ReadIndex,
            from: self.replica_id(),
            to: self.replica_id(),
            hint: ctx,
            term: self.term,
            shard_id: self.group.shard_id,
            ..Default::default()
        };
        self.handle_read_index(msg)
    }

    // ---- replication ----

    fn broadcast_replicate(&mut self) {
        for id in self.remotes.keys().copied().collect::<Vec<_>>() {
            if id == self.replica_id() {
                continue;
            }
            if let Err(e) = self.send_replicate(id) {
                tracing::warn!(group = display(self.group), to = id, err = display(&e), "replicate failed");
            }
        }
    }

    fn send_replicate(&mut self, to: u64) -> Result<(), StoreError> {
        let last_index = self.log.last_index();
        let (next, should) = {
            let Some(pr) = self.remotes.get(&to) else {
                return Ok(());
            };
            (pr.next_index, pr.should_send())
        };
        if !should {
            return Ok(());
        }

        let prev = next - 1;
        let prev_term = match self.log.term(prev) {
            Ok(t) => t,
            Err(StoreError::Compacted) => return Ok(self.send_snapshot(to)),
            Err(e) => return Err(e),
        };

        let entries = match self.log.get_entries(next, last_index + 1, MAX_REPLICATE_BYTES) {
            Ok(v) => v,
            Err(StoreError::Compacted) => return Ok(self.send_snapshot(to)),
            Err(e) => return Err(e),
        };
        let entries = if self.membership.is_witness(to) {
            strip_for_witness(&entries)
        } else {
            entries
        };

        let sent_last = entries.last().map(|e| e.index);
        {
            let pr = self.remotes.get_mut(&to).unwrap();
            match pr.state {
                ProgressState::Probe => pr.paused = true,
                ProgressState::Replicate => {
                    if let Some(last) = sent_last {
                        pr.next_index = last + 1;
                    }
                }
                ProgressState::Snapshot => return Ok(()),
            }
        }

        self.send(Message {
            kind: MessageKind::Replicate,
            to,
            log_index: prev,
            log_term: prev_term,
            commit: self.log.committed,
            entries,
            ..self.base_msg()
        });
        Ok(())
    }

    fn send_snapshot(&mut self, to: u64) {
        let Some(meta) = self.latest_snapshot.clone() else {
            tracing::warn!(group = display(self.group), to = to, "remote behind log but no snapshot exists yet");
            return;
        };

        if let Some(pr) = self.remotes.get_mut(&to) {
            pr.become_snapshot();
        }
        tracing::info!(group = display(self.group), to = to, index = meta.index, "sending snapshot");
        self.send(Message {
            kind: MessageKind::InstallSnapshot,
            to,
            snapshot: Some(meta),
            ..self.base_msg()
        });
    }

    fn broadcast_heartbeat(&mut self, ctx: Option<(u64, u64)>) {
        let committed = self.log.committed;
        let me = self.replica_id();
        // a follower may only commit entries it provably matches
        let targets: Vec<(u64, u64)> = self
            .remotes
            .iter()
            .filter(|(id, _)| **id != me)
            .map(|(id, pr)| (*id, committed.min(pr.match_index)))
            .collect();

        for (to, commit) in targets {
            self.send(Message {
                kind: MessageKind::Heartbeat,
                to,
                commit,
                hint: ctx.unwrap_or_default(),
                ..self.base_msg()
            });
        }
    }

    /// Advance the commit index to the quorum median of voter match
    /// points, restricted to entries of the current term.
    fn maybe_commit(&mut self) -> Result<bool, StoreError> {
        let mut matches: Vec<u64> = Vec::new();
        for id in self.membership.voting_ids() {
            if id == self.replica_id() {
                matches.push(self.log.last_index());
            } else if let Some(pr) = self.remotes.get(&id) {
                matches.push(pr.match_index);
            } else {
                matches.push(0);
            }
        }
        if matches.is_empty() {
            return Ok(false);
        }

        matches.sort_unstable_by(|a, b| b.cmp(a));
        let median = matches[self.quorum() - 1];
        if median <= self.log.committed {
            return Ok(false);
        }
        if self.log.term(median)? != self.term {
            return Ok(false);
        }

        self.log.commit_to(median);
        Ok(true)
    }

    // ---- update round ----

    /// Whether the next [`Peer::get_update`] would carry anything. An
    /// idle peer keeps returning `false`, which is what lets the node
    /// quiesce.
    pub(crate) fn has_update(&self) -> bool {
        !self.msgs.is_empty()
            || !self.log.unstable_entries().is_empty()
            || self.log.pending_snapshot().is_some()
            || self.log.has_entries_to_apply()
            || !self.pending_read_states.is_empty()
            || self.hard_state() != self.prev_hard_state
            || self.current_leader_update() != self.prev_leader_update
    }

    fn current_leader_update(&self) -> LeaderUpdate {
        LeaderUpdate {
            leader_id: self.leader_id,
            term: self.term,
        }
    }

    /// Collect one round of effects. `last_applied` is the host's
    /// confirmed apply watermark, echoed through the update for the
    /// engine's retention decisions.
    pub(crate) fn get_update(&mut self, last_applied: u64) -> Result<Update, StoreError> {
        let mut ud = Update {
            group: self.group,
            last_applied,
            ..Default::default()
        };

        let hs = self.hard_state();
        if hs != self.prev_hard_state {
            ud.hard_state = Some(hs);
        }

        ud.entries_to_save = self.log.unstable_entries().to_vec();
        ud.snapshot = self.log.pending_snapshot().cloned();

        ud.committed_entries = self.log.entries_to_apply()?;
        if let Some(last) = ud.committed_entries.last() {
            let index = last.index;
            self.log.set_processed(index);
        }

        ud.messages = mem::take(&mut self.msgs);
        ud.ready_to_reads = mem::take(&mut self.pending_read_states);

        let lu = self.current_leader_update();
        if lu != self.prev_leader_update {
            ud.leader_update = Some(lu);
            self.prev_leader_update = lu;
        }

        Ok(ud)
    }

    /// Acknowledge that the update's save-set is durable. The snapshot is
    /// acknowledged before the entries: entries saved in the same round
    /// sit on top of it, and the read window must adopt the snapshot as
    /// its base before it can extend over them.
    pub(crate) fn commit_update(&mut self, ud: &Update) {
        if let Some(hs) = ud.hard_state {
            self.prev_hard_state = hs;
        }
        if let Some(s) = &ud.snapshot {
            self.set_snapshot_record(s.clone());
            self.log.stable_snapshot_to(s.index);
        }
        if let Some((index, term)) = ud.last_to_save() {
            self.log.stable_to(index, term);
        }
    }

    fn base_msg(&self) -> Message {
        Message {
            shard_id: self.group.shard_id,
            from: self.replica_id(),
            term: self.term,
            ..Default::default()
        }
    }

    fn send(&mut self, msg: Message) {
        self.msgs.push(msg);
    }
}

/// Witness replicas receive user entries as payload-free metadata; config
/// changes are delivered whole so the witness tracks membership.
fn strip_for_witness(entries: &[Entry]) -> Vec<Entry> {
    entries
        .iter()
        .map(|e| {
            if e.entry_type == EntryType::ConfigChange {
                e.clone()
            } else {
                Entry {
                    index: e.index,
                    term: e.term,
                    entry_type: EntryType::Metadata,
                    ..Default::default()
                }
            }
        })
        .collect()
}
