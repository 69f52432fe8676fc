use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::sm::host::ApplyOutcome;
use crate::sm::host::SnapshotJob;
use crate::sm::host::StateMachineHost;
use crate::sm::SmError;
use crate::snapshot::SnapshotMeta;
use crate::snapshot::SnapshotOptions;
use crate::Entry;
use crate::Membership;

/// Commands from the node runtime to its state machine worker.
pub(crate) enum SmCommand {
    Apply {
        entries: Vec<Entry>,
    },

    /// Take a snapshot at the current applied index. `key` correlates a
    /// user request; zero for automatic snapshots.
    Save {
        options: SnapshotOptions,
        key: u64,
    },

    Recover {
        meta: SnapshotMeta,
        initial: bool,
    },

    Lookup {
        query: Bytes,
        tx: oneshot::Sender<Result<Bytes, SmError>>,
    },

    /// Internal: completion of an off-task concurrent save.
    SnapshotDone {
        meta: Option<SnapshotMeta>,
        key: u64,
    },

    Stop,
}

/// Notifications from the worker back to the node runtime.
#[derive(Debug)]
pub(crate) enum SmNotification {
    Applied(ApplyOutcome),

    SnapshotSaved { meta: SnapshotMeta, key: u64 },

    /// The save attempt produced nothing: latch held, no new state, or a
    /// discardable abort.
    SnapshotSkipped { key: u64 },

    Recovered { index: u64, membership: Membership, initial: bool },
}

pub(crate) struct SmHandle {
    pub(crate) cmd_tx: mpsc::UnboundedSender<SmCommand>,
    pub(crate) join_handle: JoinHandle<()>,
}

/// Drives one replica's [`StateMachineHost`] on its own task, in command
/// order, so apply remains strictly sequential while the node loop stays
/// free to run raft rounds.
pub(crate) struct Worker {
    host: StateMachineHost,
    cmd_rx: mpsc::UnboundedReceiver<SmCommand>,
    notif_tx: mpsc::UnboundedSender<SmNotification>,
    cmd_tx: mpsc::UnboundedSender<SmCommand>,
}

impl Worker {
    pub(crate) fn spawn(host: StateMachineHost, notif_tx: mpsc::UnboundedSender<SmNotification>) -> SmHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            host,
            cmd_rx,
            notif_tx,
            cmd_tx: cmd_tx.clone(),
        };

        let join_handle = tokio::spawn(async move { worker.worker_loop().await });

        SmHandle { cmd_tx, join_handle }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn worker_loop(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                SmCommand::Apply { entries } => {
                    let outcome = match self.host.apply(&entries).await {
                        Ok(o) => o,
                        Err(e) => {
                            // a state machine that cannot apply a
                            // committed entry leaves no consistent way
                            // forward
                            panic!("state machine update failed: {}", e);
                        }
                    };
                    let _ = self.notif_tx.send(SmNotification::Applied(outcome));
                }

                SmCommand::Save { options, key } => self.handle_save(options, key),

                SmCommand::SnapshotDone { meta, key } => {
                    self.host.snapshot_finished(meta.as_ref());
                    let msg = match meta {
                        Some(meta) => SmNotification::SnapshotSaved { meta, key },
                        None => SmNotification::SnapshotSkipped { key },
                    };
                    let _ = self.notif_tx.send(msg);
                }

                SmCommand::Recover { meta, initial } => {
                    if let Err(e) = self.host.recover(&meta).await {
                        panic!("snapshot recovery failed at index {}: {}", meta.index, e);
                    }
                    let _ = self.notif_tx.send(SmNotification::Recovered {
                        index: meta.index,
                        membership: self.host.membership.clone(),
                        initial,
                    });
                }

                SmCommand::Lookup { query, tx } => {
                    let _ = tx.send(self.host.lookup(query).await);
                }

                SmCommand::Stop => break,
            }
        }

        if let Err(e) = self.host.close().await {
            tracing::warn!(err = display(&e), "state machine close failed");
        }
    }

    fn handle_save(&mut self, options: SnapshotOptions, key: u64) {
        let job = match self.host.start_snapshot(options) {
            Ok(job) => job,
            Err(e) if e.is_snapshot_discard() => SnapshotJob::Skipped,
            Err(e) => {
                tracing::error!(err = display(&e), "snapshot save failed");
                SnapshotJob::Skipped
            }
        };

        match job {
            SnapshotJob::Done(meta) => {
                let _ = self.notif_tx.send(SmNotification::SnapshotSaved { meta, key });
            }
            SnapshotJob::Skipped => {
                let _ = self.notif_tx.send(SmNotification::SnapshotSkipped { key });
            }
            SnapshotJob::Concurrent {
                mut source,
                mut writer,
                meta,
                sessions,
            } => {
                let done_tx = self.cmd_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let saved = source
                        .save_snapshot(&mut writer)
                        .and_then(|_| writer.finalize(meta, sessions).map_err(SmError::from));
                    let meta = match saved {
                        Ok(meta) => Some(meta),
                        Err(e) => {
                            if !e.is_snapshot_discard() {
                                tracing::error!(err = display(&e), "concurrent snapshot save failed");
                            }
                            None
                        }
                    };
                    let _ = done_tx.send(SmCommand::SnapshotDone { meta, key });
                });
            }
        }
    }
}
