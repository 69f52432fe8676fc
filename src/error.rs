//! Error types exposed by this crate.

use anyerror::AnyError;

/// Errors surfaced to callers of the request APIs.
///
/// These are all recoverable from the caller's point of view: the shard
/// keeps running, and the caller may retry, back off, or give up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The replica has not finished recovering its initial state.
    #[error("shard not ready")]
    ShardNotReady,

    /// The operation is not allowed on this replica, e.g. a user proposal
    /// on a witness.
    #[error("invalid operation")]
    InvalidOperation,

    /// The proposal carries a malformed client session.
    #[error("invalid client session")]
    InvalidSession,

    /// The proposal payload exceeds the admission limit derived from
    /// `max_in_mem_log_size`.
    #[error("payload too big")]
    PayloadTooBig,

    /// The inbound queue or the in-memory log is saturated; retry later.
    #[error("system busy")]
    SystemBusy,

    /// The node has been closed.
    #[error("system stopped")]
    SystemStopped,

    /// The request did not reach its raft outcome within its deadline.
    /// The underlying proposal may still commit; session dedup covers the
    /// retry.
    #[error("request timeout")]
    Timeout,

    /// The caller gave up before an outcome was known.
    #[error("request canceled")]
    Canceled,

    /// The node shut down with the request still pending.
    #[error("request terminated")]
    Terminated,

    /// The raft outcome was a rejection: a stale config change, a
    /// session violation observed at apply time, or a refused snapshot.
    #[error("request rejected")]
    Rejected,

    /// The request was dropped before reaching the pipeline.
    #[error("request dropped")]
    Dropped,

    /// A log read hit a compacted range.
    #[error("log compacted")]
    Compacted,

    /// A log read went past the last available index.
    #[error("log unavailable")]
    Unavailable,
}

/// Fatal conditions that terminate the owning node.
///
/// A fatal error means in-memory state can no longer be trusted, so these
/// are raised as panics at the point of detection; an external supervisor
/// may restart the process, at which point crash recovery rebuilds a
/// consistent view from the durable store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Fatal {
    #[error("applied index regression: current {current}, next {next}")]
    ApplyRegression { current: u64, next: u64 },

    #[error("conflict at index {index} inside committed prefix (committed {committed})")]
    CommittedConflict { index: u64, committed: u64 },

    #[error("log gap: appending at {at} with last index {last_index}")]
    LogGap { at: u64, last_index: u64 },

    #[error("corrupt session: responded_to {responded_to} > series_id {series_id}")]
    SessionCorrupt { responded_to: u64, series_id: u64 },

    #[error("corrupt log store: {0}")]
    CorruptStore(AnyError),
}
