//! The applied state machine host.
//!
//! [`StateMachine`] is the boundary trait user state machines implement.
//! [`host::StateMachineHost`] owns one instance, enforces exactly-once
//! session semantics over at-least-once delivery, and manages snapshot
//! save and recovery. [`worker::Worker`] runs the host on its own task,
//! fed by a command channel from the node runtime.

mod host;
mod session;
pub(crate) mod worker;

#[cfg(test)]
mod session_test;

use anyerror::AnyError;
use async_trait::async_trait;
use bytes::Bytes;
pub(crate) use host::StateMachineHost;
use serde::Deserialize;
use serde::Serialize;
pub(crate) use session::SeriesOutcome;
pub use session::Session;
pub use session::SessionManager;

use crate::snapshot::SnapshotReader;
use crate::snapshot::SnapshotWriter;
use crate::Entry;

/// The value returned by a state machine update or lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct SmResult {
    pub value: u64,
    pub data: Bytes,
}

impl SmResult {
    pub fn of(value: u64) -> Self {
        SmResult {
            value,
            data: Bytes::new(),
        }
    }
}

/// Errors crossing the state machine boundary.
#[derive(Debug, thiserror::Error)]
pub enum SmError {
    /// The snapshot attempt was aborted by the host; discarded silently.
    #[error("snapshot aborted")]
    SnapshotAborted,

    /// The node is shutting down mid-snapshot; discarded silently.
    #[error("snapshot stopped")]
    SnapshotStopped,

    #[error(transparent)]
    Other(AnyError),
}

impl From<std::io::Error> for SmError {
    fn from(e: std::io::Error) -> Self {
        SmError::Other(AnyError::new(&e))
    }
}

impl SmError {
    /// Whether a failed snapshot attempt is silently discarded rather
    /// than surfaced.
    pub fn is_snapshot_discard(&self) -> bool {
        matches!(self, SmError::SnapshotAborted | SmError::SnapshotStopped)
    }
}

/// A frozen, self-contained view of state machine data that can be
/// streamed into a snapshot off the apply task.
pub trait SnapshotSource: Send {
    /// Write the payload; returns the number of bytes produced.
    fn save_snapshot(&mut self, writer: &mut SnapshotWriter) -> Result<u64, SmError>;
}

/// The user state machine boundary.
///
/// One instance is owned by one replica's host; `update` is invoked
/// exactly once per applied user command (session replays are answered
/// from the cache and never reach it).
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply one committed entry; the returned result is cached for the
    /// client session and delivered to the proposer.
    async fn update(&mut self, entry: &Entry) -> Result<SmResult, SmError>;

    /// Read-only query against applied state.
    async fn lookup(&self, query: Bytes) -> Result<Bytes, SmError>;

    /// Whether snapshotting may run concurrently with apply. When true,
    /// [`StateMachine::prepare_snapshot`] must capture a consistent view
    /// cheaply; the expensive write happens off the apply task.
    fn is_concurrent(&self) -> bool {
        false
    }

    /// Capture a view for snapshotting, called on the apply task.
    fn prepare_snapshot(&mut self) -> Result<Box<dyn SnapshotSource>, SmError>;

    /// Rebuild state from a snapshot payload.
    async fn recover_from_snapshot(&mut self, reader: &mut SnapshotReader) -> Result<(), SmError>;

    async fn close(&mut self) -> Result<(), SmError> {
        Ok(())
    }
}
