use anyerror::AnyError;

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error)]
#[derive(PartialEq, Eq)]
pub enum ConfigError {
    /// Failed to parse configuration from command-line arguments.
    #[error("ParseError: {source} while parsing ({args:?})")]
    ParseError { source: AnyError, args: Vec<String> },

    #[error("{reason} when parsing {invalid:?}")]
    InvalidNumber { invalid: String, reason: String },

    #[error("heartbeat_rtt must be > 0")]
    HeartbeatRttIs0,

    /// Election timeout must leave room for several heartbeat rounds.
    #[error("election_rtt({election_rtt}) must be >= 2 * heartbeat_rtt({heartbeat_rtt})")]
    ElectionRttTooSmall { election_rtt: u64, heartbeat_rtt: u64 },

    #[error("snapshot_entries({snapshot_entries}) requires compaction_overhead > 0")]
    CompactionOverheadIs0 { snapshot_entries: u64 },

    #[error("a replica cannot be both witness and observer")]
    WitnessAndObserver,

    #[error("a witness replica cannot disable snapshotting")]
    WitnessWithoutSnapshot,

    #[error("max_apply_batch_bytes must be > 0")]
    MaxApplyBatchIs0,

    #[error("worker_count must be > 0")]
    WorkerCountIs0,

    #[error("logdb_shards must be > 0")]
    LogDbShardsIs0,
}
