//! The per-replica node runtime.
//!
//! A [`Node`] owns all mutable raft state of one replica behind a
//! single-writer discipline: only the step task (an engine worker) ever
//! locks [`Node::raft`]. Caller-facing APIs validate, enqueue a request
//! plus a result channel, and suspend on the channel with a
//! tick-denominated deadline.
//!
//! One step executes in a fixed order: drain state machine notifications,
//! drain the inbound queue into the peer, feed queued proposals and local
//! ops, pull an [`Update`], persist its save-set (entries before the
//! snapshot record), route messages, acknowledge stable-to, hand the
//! committed batch to the apply worker and resolve pending requests whose
//! outcomes are now known.

mod pending;
mod queue;
mod quiesce;

#[cfg(test)]
mod node_test;

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
pub(crate) use pending::PendingRequests;
pub(crate) use queue::MessageQueue;
pub(crate) use quiesce::QuiesceState;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Notify;

use crate::client::ClientSession;
use crate::config::Config;
use crate::config::EngineConfig;
use crate::entry::EntryType;
use crate::error::RequestError;
use crate::log::ReplicaLog;
use crate::membership::ConfigChange;
use crate::membership::ConfigChangeType;
use crate::message::Message;
use crate::message::MessageKind;
use crate::peer::Peer;
use crate::sm::worker::SmCommand;
use crate::sm::worker::SmHandle;
use crate::sm::worker::SmNotification;
use crate::sm::worker::Worker;
use crate::sm::SmResult;
use crate::sm::StateMachine;
use crate::sm::StateMachineHost;
use crate::snapshot::SnapshotMeta;
use crate::snapshot::SnapshotOptions;
use crate::snapshot::Snapshotter;
use crate::storage::with_retry;
use crate::storage::LogStore;
use crate::types::GroupId;
use crate::types::Update;
use crate::Entry;
use crate::Membership;

/// Outbound message callback. Owns connection management and may drop
/// non-heartbeat traffic under pressure; raft tolerates both.
pub type Router = Arc<dyn Fn(Message) + Send + Sync>;

/// Local operations that must run on the step task.
enum LocalOp {
    Transfer(u64),
    Snapshot { key: u64, options: SnapshotOptions },
}

/// State touched only by the step task.
struct RaftCoreState {
    peer: Peer,
    qs: QuiesceState,
    sm_notif: mpsc::UnboundedReceiver<SmNotification>,
    initial_snapshot: Option<SnapshotMeta>,
    recover_requested: bool,
    last_snapshot_index: u64,
    auto_save_inflight: bool,
    snapshot_options: HashMap<u64, SnapshotOptions>,
}

pub struct Node {
    group: GroupId,
    config: Arc<Config>,
    store: Arc<dyn LogStore>,
    router: Router,
    snapshotter: Snapshotter,

    mq: MessageQueue,
    proposals: Mutex<Vec<Entry>>,
    read_requests: Mutex<Vec<(u64, u64)>>,
    local_ops: Mutex<Vec<LocalOp>>,
    pending: Mutex<PendingRequests>,

    raft: Mutex<RaftCoreState>,

    sm_cmd: mpsc::UnboundedSender<SmCommand>,
    sm_handle: Mutex<Option<SmHandle>>,

    last_applied: AtomicU64,
    in_mem_bytes: AtomicU64,
    leader_id: AtomicU64,
    leader_term: AtomicU64,
    initialized: AtomicBool,
    stopped: AtomicBool,
    quiesced: AtomicBool,

    worker_notify: Arc<Notify>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        group: GroupId,
        config: Config,
        engine_config: &EngineConfig,
        store: Arc<dyn LogStore>,
        sm: Box<dyn StateMachine>,
        router: Router,
        initial_members: std::collections::BTreeMap<u64, String>,
        worker_notify: Arc<Notify>,
    ) -> Result<Arc<Node>, crate::storage::StoreError> {
        let config = Arc::new(config);

        let log = ReplicaLog::new(group, store.clone(), config.max_apply_batch_bytes)?;
        let recovered = store.raft_state(group)?;
        let snapshot_rec = store.snapshot_record(group)?;

        let membership = match &snapshot_rec {
            Some(s) => s.membership.clone(),
            None => {
                let mut m = Membership::new();
                for (id, addr) in &initial_members {
                    if *id == group.replica_id && config.is_witness {
                        m.witnesses.insert(*id, addr.clone());
                    } else if *id == group.replica_id && config.is_observer {
                        m.observers.insert(*id, addr.clone());
                    } else {
                        m.addresses.insert(*id, addr.clone());
                    }
                }
                m
            }
        };

        let hard_state = recovered.map(|r| r.hard_state).unwrap_or_default();
        let peer = Peer::new(
            group,
            config.clone(),
            log,
            hard_state,
            membership.clone(),
            snapshot_rec.clone(),
        );

        let snapshotter = Snapshotter::new(engine_config.snapshot_root.clone(), group);
        let host = StateMachineHost::new(group, config.clone(), sm, membership, snapshotter.clone());
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();
        let sm_handle = Worker::spawn(host, notif_tx);
        let sm_cmd = sm_handle.cmd_tx.clone();

        let node = Arc::new(Node {
            group,
            config: config.clone(),
            store,
            router,
            snapshotter,
            mq: MessageQueue::new(engine_config.in_queue_len, engine_config.in_queue_bytes),
            proposals: Mutex::new(Vec::new()),
            read_requests: Mutex::new(Vec::new()),
            local_ops: Mutex::new(Vec::new()),
            pending: Mutex::new(PendingRequests::new(group.replica_id)),
            raft: Mutex::new(RaftCoreState {
                qs: QuiesceState::new(config.quiesce, config.quiesce_threshold()),
                peer,
                sm_notif: notif_rx,
                initial_snapshot: snapshot_rec,
                recover_requested: false,
                last_snapshot_index: 0,
                auto_save_inflight: false,
                snapshot_options: HashMap::new(),
            }),
            sm_cmd,
            sm_handle: Mutex::new(Some(sm_handle)),
            last_applied: AtomicU64::new(0),
            in_mem_bytes: AtomicU64::new(0),
            leader_id: AtomicU64::new(0),
            leader_term: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            quiesced: AtomicBool::new(false),
            worker_notify,
        });
        Ok(node)
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// `(leader_id, term)` as last observed; leader 0 means unknown.
    pub fn leader_info(&self) -> (u64, u64) {
        (self.leader_id.load(Ordering::Acquire), self.leader_term.load(Ordering::Acquire))
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    /// Whether the replica is currently quiesced.
    pub fn is_quiesced(&self) -> bool {
        self.quiesced.load(Ordering::Acquire)
    }

    // ---- caller-facing API ----

    /// Propose a user command under `session`. Resolves when the entry is
    /// applied, rejected, or the deadline passes. A timed-out proposal
    /// may still commit; session dedup covers the retry.
    pub async fn propose(
        &self,
        session: &ClientSession,
        payload: Bytes,
        timeout_ticks: u64,
    ) -> Result<SmResult, RequestError> {
        self.check_user_op()?;
        self.validate_session(session, false)?;
        self.check_payload(payload.len() as u64)?;

        let (key, handle) = self.pending.lock().unwrap().new_proposal(timeout_ticks);
        self.enqueue_entry(Entry {
            entry_type: EntryType::Normal,
            client_id: session.client_id,
            series_id: session.series_id,
            responded_to: session.responded_to,
            key,
            payload,
            ..Default::default()
        });
        handle.wait().await
    }

    /// Register or unregister the session, per its prepared state.
    pub async fn propose_session(&self, session: &ClientSession, timeout_ticks: u64) -> Result<SmResult, RequestError> {
        self.check_user_op()?;
        self.validate_session(session, true)?;

        let (key, handle) = self.pending.lock().unwrap().new_proposal(timeout_ticks);
        self.enqueue_entry(Entry {
            entry_type: EntryType::Normal,
            client_id: session.client_id,
            series_id: session.series_id,
            key,
            ..Default::default()
        });
        handle.wait().await
    }

    /// Linearizable read: runs the read-index protocol, waits for apply
    /// to reach the returned index, then queries the state machine.
    pub async fn read(&self, query: Bytes, timeout_ticks: u64) -> Result<Bytes, RequestError> {
        self.check_user_op()?;

        let (ctx, handle) = self.pending.lock().unwrap().new_read(timeout_ticks);
        self.read_requests.lock().unwrap().push(ctx);
        self.worker_notify.notify_one();

        handle.wait().await?;

        let (tx, rx) = oneshot::channel();
        self.sm_cmd
            .send(SmCommand::Lookup { query, tx })
            .map_err(|_| RequestError::SystemStopped)?;
        match rx.await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => {
                tracing::warn!(group = display(self.group), err = display(&e), "lookup failed");
                Err(RequestError::Rejected)
            }
            Err(_) => Err(RequestError::SystemStopped),
        }
    }

    /// Ask the shard to take a snapshot now. Resolves to the snapshot
    /// index.
    pub async fn request_snapshot(&self, options: SnapshotOptions, timeout_ticks: u64) -> Result<u64, RequestError> {
        self.check_user_op()?;

        let (key, handle) = self.pending.lock().unwrap().new_snapshot(timeout_ticks)?;
        self.local_ops.lock().unwrap().push(LocalOp::Snapshot { key, options });
        self.worker_notify.notify_one();
        handle.wait().await.map(|r| r.value)
    }

    pub async fn request_add_node(&self, replica_id: u64, address: String, config_change_id: u64, timeout_ticks: u64) -> Result<(), RequestError> {
        self.config_change(ConfigChangeType::AddNode, replica_id, address, config_change_id, timeout_ticks).await
    }

    pub async fn request_add_observer(&self, replica_id: u64, address: String, config_change_id: u64, timeout_ticks: u64) -> Result<(), RequestError> {
        self.config_change(ConfigChangeType::AddObserver, replica_id, address, config_change_id, timeout_ticks).await
    }

    pub async fn request_add_witness(&self, replica_id: u64, address: String, config_change_id: u64, timeout_ticks: u64) -> Result<(), RequestError> {
        self.config_change(ConfigChangeType::AddWitness, replica_id, address, config_change_id, timeout_ticks).await
    }

    pub async fn request_remove_node(&self, replica_id: u64, config_change_id: u64, timeout_ticks: u64) -> Result<(), RequestError> {
        self.config_change(ConfigChangeType::RemoveNode, replica_id, String::new(), config_change_id, timeout_ticks).await
    }

    async fn config_change(
        &self,
        change_type: ConfigChangeType,
        replica_id: u64,
        address: String,
        config_change_id: u64,
        timeout_ticks: u64,
    ) -> Result<(), RequestError> {
        self.check_user_op()?;

        let cc = ConfigChange {
            config_change_id,
            change_type,
            replica_id,
            address,
        };
        let payload = serde_json::to_vec(&cc).map_err(|_| RequestError::Rejected)?;

        let (key, handle) = self.pending.lock().unwrap().new_config_change(timeout_ticks);
        self.enqueue_entry(Entry {
            entry_type: EntryType::ConfigChange,
            key,
            payload: Bytes::from(payload),
            ..Default::default()
        });
        handle.wait().await.map(|_| ())
    }

    /// Hand leadership to `target` once it is caught up.
    pub async fn request_leader_transfer(&self, target: u64, timeout_ticks: u64) -> Result<(), RequestError> {
        self.check_running()?;
        if !self.is_initialized() {
            return Err(RequestError::ShardNotReady);
        }

        let handle = self.pending.lock().unwrap().new_transfer(target, timeout_ticks)?;
        self.local_ops.lock().unwrap().push(LocalOp::Transfer(target));
        self.worker_notify.notify_one();
        handle.wait().await.map(|_| ())
    }

    /// Inbound delivery from the router or the tick source. Returns false
    /// when the message was dropped by back-pressure.
    pub fn deliver(&self, msg: Message) -> bool {
        if self.is_stopped() {
            return false;
        }
        let accepted = self.mq.add(msg);
        self.worker_notify.notify_one();
        accepted
    }

    /// Stop the node: pending requests terminate, the state machine
    /// worker drains and closes.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(group = display(self.group), "stopping node");
        self.pending.lock().unwrap().terminate_all();
        let _ = self.sm_cmd.send(SmCommand::Stop);
        if let Some(handle) = self.sm_handle.lock().unwrap().take() {
            handle.join_handle.abort();
        }
        self.worker_notify.notify_one();
    }

    // ---- validation ----

    fn check_running(&self) -> Result<(), RequestError> {
        if self.is_stopped() {
            return Err(RequestError::SystemStopped);
        }
        Ok(())
    }

    fn check_user_op(&self) -> Result<(), RequestError> {
        self.check_running()?;
        if self.config.is_witness {
            return Err(RequestError::InvalidOperation);
        }
        if !self.is_initialized() {
            return Err(RequestError::ShardNotReady);
        }
        Ok(())
    }

    fn check_payload(&self, len: u64) -> Result<(), RequestError> {
        if let Some(max) = self.config.max_proposal_payload() {
            if len > max {
                return Err(RequestError::PayloadTooBig);
            }
            if self.in_mem_bytes.load(Ordering::Relaxed) > self.config.max_in_mem_log_size {
                return Err(RequestError::SystemBusy);
            }
        }
        Ok(())
    }

    fn validate_session(&self, s: &ClientSession, session_op: bool) -> Result<(), RequestError> {
        if s.shard_id != self.group.shard_id {
            return Err(RequestError::InvalidSession);
        }

        if session_op {
            if !s.is_session_op() || s.client_id == 0 {
                return Err(RequestError::InvalidSession);
            }
            return Ok(());
        }

        if s.is_noop() {
            return Ok(());
        }
        if s.is_session_op() || s.client_id == 0 || s.series_id == 0 {
            return Err(RequestError::InvalidSession);
        }
        if s.responded_to > s.series_id {
            panic!(
                "{}: {}",
                self.group,
                crate::error::Fatal::SessionCorrupt {
                    responded_to: s.responded_to,
                    series_id: s.series_id,
                }
            );
        }
        Ok(())
    }

    fn enqueue_entry(&self, entry: Entry) {
        self.proposals.lock().unwrap().push(entry);
        self.worker_notify.notify_one();
    }

    // ---- the step path, called only by the owning engine worker ----

    /// Phase one of a step round: drain inputs through the peer and pull
    /// an update. Returns `None` when there is nothing to do, which is
    /// what lets an idle (or quiesced) node cost nothing.
    pub(crate) fn handle_events(&self) -> Option<Update> {
        let mut raft = self.raft.lock().unwrap();
        let raft = &mut *raft;

        self.process_sm_notifications(raft);

        if !self.is_initialized() {
            if !raft.recover_requested {
                match raft.initial_snapshot.take() {
                    Some(meta) => {
                        raft.recover_requested = true;
                        raft.last_snapshot_index = meta.index;
                        let _ = self.sm_cmd.send(SmCommand::Recover { meta, initial: true });
                    }
                    None => {
                        self.initialized.store(true, Ordering::Release);
                        tracing::info!(group = display(self.group), "initialized with empty state");
                    }
                }
            }
            if !self.is_initialized() {
                return None;
            }
        }

        let msgs = self.mq.get();
        for msg in &msgs {
            match msg.kind {
                MessageKind::LocalTick => {
                    raft.qs.tick();
                    self.pending.lock().unwrap().tick();
                    if !raft.qs.quiesced() {
                        self.step_peer(raft, Message::local_tick(msg.hint.0));
                    }
                }
                MessageKind::EnterQuiesce => {
                    raft.qs.join_quiesce();
                }
                _ => {
                    // heartbeat rounds are background noise; counting them
                    // as activity would keep a leadered shard awake forever
                    if !msg.is_local()
                        && !matches!(msg.kind, MessageKind::Heartbeat | MessageKind::HeartbeatResp)
                    {
                        raft.qs.record_activity();
                    }
                    self.step_peer(raft, msg.clone());
                }
            }
        }
        self.mq.recycle(msgs);

        let props = mem::take(&mut *self.proposals.lock().unwrap());
        if !props.is_empty() {
            raft.qs.record_activity();
            raft.peer
                .propose(props)
                .unwrap_or_else(|e| panic!("{}: propose failed: {}", self.group, e));
        }

        let reads = mem::take(&mut *self.read_requests.lock().unwrap());
        for ctx in reads {
            raft.qs.record_activity();
            raft.peer
                .request_read_index(ctx)
                .unwrap_or_else(|e| panic!("{}: read index failed: {}", self.group, e));
        }

        let ops = mem::take(&mut *self.local_ops.lock().unwrap());
        for op in ops {
            match op {
                LocalOp::Transfer(target) => {
                    raft.qs.record_activity();
                    raft.peer.request_leader_transfer(target);
                }
                LocalOp::Snapshot { key, options } => {
                    raft.snapshot_options.insert(key, options);
                    let _ = self.sm_cmd.send(SmCommand::Save { options, key });
                }
            }
        }

        let has_update = raft.peer.has_update();
        let entering_quiesce = raft.qs.new_quiesce_state();
        self.quiesced.store(raft.qs.quiesced(), Ordering::Release);
        if !has_update && !entering_quiesce {
            return None;
        }

        let mut ud = raft
            .peer
            .get_update(self.last_applied())
            .unwrap_or_else(|e| panic!("{}: update assembly failed: {}", self.group, e));

        if entering_quiesce {
            for to in raft.peer.remote_ids() {
                ud.messages.push(Message {
                    kind: MessageKind::EnterQuiesce,
                    shard_id: self.group.shard_id,
                    from: self.group.replica_id,
                    to,
                    ..Default::default()
                });
            }
        }

        self.in_mem_bytes.store(raft.peer.log.in_mem_size(), Ordering::Relaxed);
        Some(ud)
    }

    fn step_peer(&self, raft: &mut RaftCoreState, msg: Message) {
        raft.peer
            .step(msg)
            .unwrap_or_else(|e| panic!("{}: raft step failed: {}", self.group, e));
    }

    /// Between the snapshot-record batch and the raft-state batch: import
    /// a received snapshot and kick off state machine recovery.
    pub(crate) fn process_snapshot(&self, ud: &Update) {
        let Some(meta) = &ud.snapshot else {
            return;
        };
        with_retry("import_snapshot", || self.store.import_snapshot(self.group, meta));
        let _ = self.sm_cmd.send(SmCommand::Recover {
            meta: meta.clone(),
            initial: false,
        });
    }

    /// Phase two, after the update's save-set is durable: route messages,
    /// acknowledge stable-to, hand off the apply batch, resolve pending
    /// requests.
    pub(crate) fn process_update(&self, ud: Update) {
        for msg in &ud.messages {
            (self.router)(msg.clone());
        }

        let mut raft = self.raft.lock().unwrap();
        raft.peer.commit_update(&ud);
        drop(raft);

        if !ud.committed_entries.is_empty() {
            let _ = self.sm_cmd.send(SmCommand::Apply {
                entries: ud.committed_entries,
            });
        }

        if !ud.ready_to_reads.is_empty() {
            let last_applied = self.last_applied();
            let mut pending = self.pending.lock().unwrap();
            for rs in ud.ready_to_reads {
                pending.read_ready(rs, last_applied);
            }
        }

        if let Some(lu) = ud.leader_update {
            self.leader_id.store(lu.leader_id, Ordering::Release);
            self.leader_term.store(lu.term, Ordering::Release);
            self.pending.lock().unwrap().leader_changed(lu.leader_id);
            tracing::debug!(
                group = display(self.group),
                leader = lu.leader_id,
                term = lu.term,
                "leader update"
            );
        }
    }

    fn process_sm_notifications(&self, raft: &mut RaftCoreState) {
        while let Ok(n) = raft.sm_notif.try_recv() {
            match n {
                SmNotification::Applied(outcome) => {
                    self.last_applied.store(outcome.last_applied, Ordering::Release);

                    {
                        let mut pending = self.pending.lock().unwrap();
                        for r in &outcome.results {
                            pending.apply_result(r.key, r.result.clone(), r.rejected);
                        }
                        pending.applied_to(outcome.last_applied);
                    }

                    if let Some(m) = &outcome.membership {
                        let last = raft.peer.log.last_index();
                        raft.peer.set_membership(m, last);
                    }

                    self.maybe_auto_snapshot(raft, outcome.last_applied);
                }

                SmNotification::SnapshotSaved { meta, key } => self.on_snapshot_saved(raft, meta, key),

                SmNotification::SnapshotSkipped { key } => {
                    raft.snapshot_options.remove(&key);
                    if key == 0 {
                        raft.auto_save_inflight = false;
                    } else {
                        self.pending.lock().unwrap().snapshot_skipped(key);
                    }
                }

                SmNotification::Recovered {
                    index,
                    membership,
                    initial,
                } => {
                    self.last_applied.store(index, Ordering::Release);
                    let last = raft.peer.log.last_index();
                    raft.peer.set_membership(&membership, last);
                    raft.last_snapshot_index = raft.last_snapshot_index.max(index);

                    if index > raft.peer.log.processed {
                        raft.peer.log.set_processed(index);
                    }
                    if initial {
                        self.initialized.store(true, Ordering::Release);
                        tracing::info!(group = display(self.group), index, "initialized from snapshot");
                    }
                    self.pending.lock().unwrap().applied_to(index);
                }
            }
        }
    }

    fn maybe_auto_snapshot(&self, raft: &mut RaftCoreState, last_applied: u64) {
        if self.config.snapshot_entries == 0 || raft.auto_save_inflight {
            return;
        }
        if last_applied.saturating_sub(raft.last_snapshot_index) < self.config.snapshot_entries {
            return;
        }
        raft.auto_save_inflight = true;
        let _ = self.sm_cmd.send(SmCommand::Save {
            options: SnapshotOptions::default(),
            key: 0,
        });
    }

    fn on_snapshot_saved(&self, raft: &mut RaftCoreState, meta: SnapshotMeta, key: u64) {
        let options = raft.snapshot_options.remove(&key).unwrap_or_default();

        // the record must be durable before any compaction below it
        with_retry("save_snapshots", || {
            self.store.save_snapshots(&[Update {
                group: self.group,
                snapshot: Some(meta.clone()),
                ..Default::default()
            }])
        });

        raft.peer.set_snapshot_record(meta.clone());
        raft.last_snapshot_index = meta.index;
        if key == 0 {
            raft.auto_save_inflight = false;
        } else {
            self.pending.lock().unwrap().snapshot_done(key, meta.index);
        }

        if !options.exported {
            let overhead = if options.override_compaction_overhead > 0 {
                options.override_compaction_overhead
            } else {
                self.config.compaction_overhead
            };
            self.compact_log(raft, meta.index.saturating_sub(overhead));
            if let Err(e) = self.snapshotter.remove_older_than(meta.index) {
                tracing::warn!(group = display(self.group), err = display(&e), "snapshot gc failed");
            }
        }

        tracing::info!(group = display(self.group), index = meta.index, "snapshot saved");
    }

    fn compact_log(&self, raft: &mut RaftCoreState, compact_to: u64) {
        if compact_to == 0 {
            return;
        }
        let term = match self.store.term(self.group, compact_to) {
            Ok(t) => t,
            // nothing to drop, or the tail is shorter than the overhead
            Err(_) => return,
        };
        match self.store.compact(self.group, compact_to) {
            Ok(()) => raft.peer.log.compacted_to(compact_to, term),
            Err(e) => {
                tracing::debug!(group = display(self.group), err = display(&e), "compaction skipped");
            }
        }
    }
}
