use std::sync::Arc;

use anyerror::AnyError;

use crate::config::Config;
use crate::entry::EntryType;
use crate::error::Fatal;
use crate::membership::ConfigChange;
use crate::sm::SessionManager;
use crate::sm::SeriesOutcome;
use crate::sm::SmError;
use crate::sm::SmResult;
use crate::sm::SnapshotSource;
use crate::sm::StateMachine;
use crate::snapshot::SnapshotMeta;
use crate::snapshot::SnapshotOptions;
use crate::snapshot::SnapshotWriter;
use crate::snapshot::Snapshotter;
use crate::types::GroupId;
use crate::Entry;
use crate::Membership;

/// Result of applying one entry someone may be waiting on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct EntryResult {
    pub(crate) index: u64,
    pub(crate) key: u64,
    pub(crate) client_id: u64,
    pub(crate) series_id: u64,
    pub(crate) result: SmResult,
    pub(crate) rejected: bool,
}

/// Result of one apply batch.
#[derive(Debug, Default)]
pub(crate) struct ApplyOutcome {
    pub(crate) last_applied: u64,
    pub(crate) applied_term: u64,
    pub(crate) results: Vec<EntryResult>,

    /// Set when a config change altered membership in this batch.
    pub(crate) membership: Option<Membership>,
}

/// A snapshot save prepared by the host.
pub(crate) enum SnapshotJob {
    /// Saved inline on the apply task (non-concurrent state machine, or a
    /// payload-free dummy snapshot).
    Done(SnapshotMeta),

    /// To be completed off the apply task by the worker.
    Concurrent {
        source: Box<dyn SnapshotSource>,
        writer: SnapshotWriter,
        meta: SnapshotMeta,
        sessions: Vec<u8>,
    },

    /// Nothing to do: a save is already running or there is no new state.
    Skipped,
}

/// Owns the user state machine of one replica and everything layered on
/// top of it: the apply pipeline, the session table, membership, and
/// snapshot save/recover.
pub(crate) struct StateMachineHost {
    group: GroupId,
    config: Arc<Config>,
    sm: Box<dyn StateMachine>,
    pub(crate) sessions: SessionManager,
    pub(crate) membership: Membership,
    pub(crate) last_applied: u64,
    applied_term: u64,
    snapshotter: Snapshotter,

    /// Latch preventing overlapping snapshot saves.
    saving: bool,
    last_snapshot_index: u64,
}

impl StateMachineHost {
    pub(crate) fn new(
        group: GroupId,
        config: Arc<Config>,
        sm: Box<dyn StateMachine>,
        membership: Membership,
        snapshotter: Snapshotter,
    ) -> Self {
        let session_capacity = config.session_capacity;
        StateMachineHost {
            group,
            config,
            sm,
            sessions: SessionManager::new(session_capacity),
            membership,
            last_applied: 0,
            applied_term: 0,
            snapshotter,
            saving: false,
            last_snapshot_index: 0,
        }
    }

    /// Apply one ordered batch. The batch must start at
    /// `last_applied + 1`; anything else means the pipeline above lost
    /// ordering and the state can no longer be trusted.
    pub(crate) async fn apply(&mut self, entries: &[Entry]) -> Result<ApplyOutcome, SmError> {
        let mut out = ApplyOutcome::default();

        for e in entries {
            if e.index != self.last_applied + 1 {
                panic!(
                    "{}: {}",
                    self.group,
                    Fatal::ApplyRegression {
                        current: self.last_applied,
                        next: e.index,
                    }
                );
            }

            let (result, rejected, membership_changed) = self.apply_one(e).await?;
            if membership_changed {
                out.membership = Some(self.membership.clone());
            }
            if e.key != 0 {
                out.results.push(EntryResult {
                    index: e.index,
                    key: e.key,
                    client_id: e.client_id,
                    series_id: e.series_id,
                    result,
                    rejected,
                });
            }

            self.last_applied = e.index;
            self.applied_term = e.term;
        }

        out.last_applied = self.last_applied;
        out.applied_term = self.applied_term;
        Ok(out)
    }

    async fn apply_one(&mut self, e: &Entry) -> Result<(SmResult, bool, bool), SmError> {
        match e.entry_type {
            EntryType::Metadata => Ok((SmResult::default(), false, false)),
            EntryType::ConfigChange => {
                let (result, rejected) = self.apply_config_change(e);
                Ok((result, rejected, !rejected))
            }
            EntryType::Normal => self.apply_normal(e).await,
        }
    }

    fn apply_config_change(&mut self, e: &Entry) -> (SmResult, bool) {
        let cc: ConfigChange = match serde_json::from_slice(&e.payload) {
            Ok(cc) => cc,
            Err(err) => {
                tracing::error!(group = display(self.group), err = display(&err), "corrupt config change payload");
                return (SmResult::default(), true);
            }
        };

        if self.config.ordered_config_change && cc.config_change_id != self.membership.config_change_id {
            tracing::warn!(
                group = display(self.group),
                proposed = cc.config_change_id,
                current = self.membership.config_change_id,
                "out of order config change rejected"
            );
            return (SmResult::default(), true);
        }

        if !self.membership.is_change_valid(&cc) {
            return (SmResult::default(), true);
        }

        self.membership.apply(&cc, e.index);
        tracing::info!(
            group = display(self.group),
            membership = display(&self.membership),
            "membership updated"
        );
        (SmResult::of(self.membership.config_change_id), false)
    }

    async fn apply_normal(&mut self, e: &Entry) -> Result<(SmResult, bool, bool), SmError> {
        if e.is_new_session_request() {
            let registered = self.sessions.register(e.client_id);
            return Ok((SmResult::of(e.client_id), !registered, false));
        }
        if e.is_end_session_request() {
            let removed = self.sessions.unregister(e.client_id);
            return Ok((SmResult::of(e.client_id), !removed, false));
        }

        if self.config.is_witness {
            // user entries reach a witness only as stripped metadata;
            // a full payload here means a routing bug upstream
            debug_assert!(e.payload.is_empty());
            return Ok((SmResult::default(), true, false));
        }

        if e.is_noop_session() {
            // no session bookkeeping: at-least-once by contract
            if e.payload.is_empty() && e.client_id == 0 {
                return Ok((SmResult::default(), false, false));
            }
            let r = self.sm.update(e).await?;
            return Ok((r, false, false));
        }

        if e.responded_to > e.series_id {
            panic!(
                "{}: {}",
                self.group,
                Fatal::SessionCorrupt {
                    responded_to: e.responded_to,
                    series_id: e.series_id,
                }
            );
        }

        let outcome = match self.sessions.get_mut(e.client_id) {
            None => {
                // evicted or never registered: refuse rather than apply
                // outside the exactly-once envelope
                tracing::warn!(group = display(self.group), client_id = e.client_id, "proposal without session");
                return Ok((SmResult::default(), true, false));
            }
            Some(session) => {
                session.respond_to(e.responded_to);
                session.admit(e.series_id)
            }
        };

        match outcome {
            SeriesOutcome::AlreadyResponded => Ok((SmResult::default(), true, false)),
            SeriesOutcome::Cached(result) => Ok((result, false, false)),
            SeriesOutcome::Apply => {
                let result = self.sm.update(e).await?;
                self.sessions
                    .get_mut(e.client_id)
                    .expect("session cannot vanish during apply")
                    .record(e.series_id, result.clone());
                Ok((result, false, false))
            }
        }
    }

    /// Lookup against applied state.
    pub(crate) async fn lookup(&self, query: bytes::Bytes) -> Result<bytes::Bytes, SmError> {
        self.sm.lookup(query).await
    }

    /// Begin a snapshot at `last_applied`.
    pub(crate) fn start_snapshot(&mut self, options: SnapshotOptions) -> Result<SnapshotJob, SmError> {
        if self.saving {
            tracing::debug!(group = display(self.group), "snapshot already in progress");
            return Ok(SnapshotJob::Skipped);
        }
        if self.last_applied == 0 || (self.last_applied <= self.last_snapshot_index && !options.exported) {
            return Ok(SnapshotJob::Skipped);
        }

        let meta = SnapshotMeta {
            shard_id: self.group.shard_id,
            replica_id: self.group.replica_id,
            index: self.last_applied,
            term: self.applied_term,
            membership: self.membership.clone(),
            witness: self.config.is_witness,
            dummy: self.config.is_witness,
            ..Default::default()
        };
        let sessions = self.sessions.serialize();
        let mut writer = self.snapshotter.new_writer(meta.index)?;

        if meta.dummy {
            let done = writer.finalize(meta, sessions)?;
            self.last_snapshot_index = done.index;
            return Ok(SnapshotJob::Done(done));
        }

        let mut source = self.sm.prepare_snapshot()?;

        if self.sm.is_concurrent() {
            self.saving = true;
            return Ok(SnapshotJob::Concurrent {
                source,
                writer,
                meta,
                sessions,
            });
        }

        // non-concurrent: the apply task blocks for the duration
        source.save_snapshot(&mut writer)?;
        let done = writer.finalize(meta, sessions)?;
        self.last_snapshot_index = done.index;
        Ok(SnapshotJob::Done(done))
    }

    /// Completion callback for a concurrent save.
    pub(crate) fn snapshot_finished(&mut self, meta: Option<&SnapshotMeta>) {
        self.saving = false;
        if let Some(m) = meta {
            self.last_snapshot_index = self.last_snapshot_index.max(m.index);
        }
    }

    /// Install a snapshot: payload into the state machine, then sessions
    /// and membership from the snapshot record.
    pub(crate) async fn recover(&mut self, meta: &SnapshotMeta) -> Result<(), SmError> {
        assert!(
            meta.index >= self.last_applied,
            "{}: recovering to {} would regress applied index {}",
            self.group,
            meta.index,
            self.last_applied
        );

        if !meta.dummy {
            let mut reader = self.snapshotter.open_reader(meta)?;
            self.sm.recover_from_snapshot(&mut reader).await?;
        }

        let raw = self.snapshotter.load_sessions(meta)?;
        self.sessions = SessionManager::deserialize(&raw).map_err(|e| SmError::Other(AnyError::new(&e)))?;
        self.membership = meta.membership.clone();
        self.last_applied = meta.index;
        self.applied_term = meta.term;
        self.last_snapshot_index = self.last_snapshot_index.max(meta.index);

        tracing::info!(
            group = display(self.group),
            index = meta.index,
            "recovered from snapshot"
        );
        Ok(())
    }

    pub(crate) async fn close(&mut self) -> Result<(), SmError> {
        self.sm.close().await
    }
}
