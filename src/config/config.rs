//! Replica and engine runtime configuration.

use std::str::FromStr;

use anyerror::AnyError;
use clap::Parser;
use rand::Rng;

use crate::config::error::ConfigError;

/// Parse number with unit such as 5.3 KB
fn parse_bytes_with_unit(src: &str) -> Result<u64, ConfigError> {
    let res = byte_unit::Byte::from_str(src).map_err(|e| ConfigError::InvalidNumber {
        invalid: src.to_string(),
        reason: e.to_string(),
    })?;

    Ok(res.get_bytes() as u64)
}

/// Per-replica runtime configuration.
///
/// All timing knobs are denominated in RTT ticks: the hosting engine
/// delivers one `LocalTick` per RTT interval, and every timeout in the
/// system counts those ticks rather than wall-clock time.
#[derive(Clone, Debug, Parser)]
pub struct Config {
    /// Ticks without a leader message before a follower starts an election.
    #[clap(long, default_value = "20")]
    pub election_rtt: u64,

    /// Ticks between leader heartbeats.
    #[clap(long, default_value = "2")]
    pub heartbeat_rtt: u64,

    /// Entries applied between automatic snapshots. 0 disables automatic
    /// snapshotting.
    #[clap(long, default_value = "10000")]
    pub snapshot_entries: u64,

    /// Entries kept below a new snapshot when the log is compacted, so
    /// slightly-lagging followers can still catch up from the log.
    #[clap(long, default_value = "500")]
    pub compaction_overhead: u64,

    /// Byte budget of the in-memory unstable log; also bounds proposal
    /// payload admission. 0 disables both checks.
    #[clap(long, default_value = "0", value_parser = parse_bytes_with_unit)]
    pub max_in_mem_log_size: u64,

    /// Reject a config change whose `config_change_id` does not match the
    /// current membership version.
    // clap 4 requires `num_args = 0..=1`, or it complains about missing arg error
    // https://github.com/clap-rs/clap/discussions/4374
    #[clap(long,
           default_value_t = false,
           action = clap::ArgAction::Set,
           num_args = 0..=1,
           default_missing_value = "true"
    )]
    pub ordered_config_change: bool,

    /// This replica counts toward quorum but refuses user operations.
    #[clap(long,
           default_value_t = false,
           action = clap::ArgAction::Set,
           num_args = 0..=1,
           default_missing_value = "true"
    )]
    pub is_witness: bool,

    /// This replica replicates without voting.
    #[clap(long,
           default_value_t = false,
           action = clap::ArgAction::Set,
           num_args = 0..=1,
           default_missing_value = "true"
    )]
    pub is_observer: bool,

    /// A leader that cannot reach a quorum within an election timeout
    /// steps down.
    #[clap(long,
           default_value_t = false,
           action = clap::ArgAction::Set,
           num_args = 0..=1,
           default_missing_value = "true"
    )]
    pub check_quorum: bool,

    /// Suppress ticks on idle shards to save CPU and heartbeat traffic.
    #[clap(long,
           default_value_t = false,
           action = clap::ArgAction::Set,
           num_args = 0..=1,
           default_missing_value = "true"
    )]
    pub quiesce: bool,

    /// Byte budget for one batch of committed entries handed to the apply
    /// host, so a large backlog cannot starve the save path.
    #[clap(long, default_value = "64 MiB", value_parser = parse_bytes_with_unit)]
    pub max_apply_batch_bytes: u64,

    /// Client sessions retained per shard before LRU eviction.
    #[clap(long, default_value = "4096")]
    pub session_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        <Self as Parser>::parse_from(Vec::<&'static str>::new())
    }
}

impl Config {
    /// Build a `Config` instance from a series of command line arguments.
    ///
    /// The first element in `args` must be the application name.
    pub fn build(args: &[&str]) -> Result<Config, ConfigError> {
        let config = <Self as Parser>::try_parse_from(args).map_err(|e| ConfigError::ParseError {
            source: AnyError::from(&e),
            args: args.iter().map(|x| x.to_string()).collect(),
        })?;
        config.validate()
    }

    /// Validate the state of the config.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.heartbeat_rtt == 0 {
            return Err(ConfigError::HeartbeatRttIs0);
        }

        if self.election_rtt < 2 * self.heartbeat_rtt {
            return Err(ConfigError::ElectionRttTooSmall {
                election_rtt: self.election_rtt,
                heartbeat_rtt: self.heartbeat_rtt,
            });
        }

        if self.snapshot_entries > 0 && self.compaction_overhead == 0 {
            return Err(ConfigError::CompactionOverheadIs0 {
                snapshot_entries: self.snapshot_entries,
            });
        }

        if self.is_witness && self.is_observer {
            return Err(ConfigError::WitnessAndObserver);
        }

        if self.is_witness && self.snapshot_entries == 0 {
            return Err(ConfigError::WitnessWithoutSnapshot);
        }

        if self.max_apply_batch_bytes == 0 {
            return Err(ConfigError::MaxApplyBatchIs0);
        }

        Ok(self)
    }

    /// Generate a randomized election timeout in
    /// `[election_rtt, 2 * election_rtt)` ticks.
    pub fn new_rand_election_tick(&self) -> u64 {
        rand::thread_rng().gen_range(self.election_rtt..2 * self.election_rtt)
    }

    /// Idle ticks before an idle shard enters quiesce.
    pub fn quiesce_threshold(&self) -> u64 {
        self.election_rtt * 10
    }

    /// Largest admissible proposal payload. `None` means unlimited.
    pub fn max_proposal_payload(&self) -> Option<u64> {
        if self.max_in_mem_log_size == 0 {
            None
        } else {
            Some(
                self.max_in_mem_log_size
                    .saturating_sub(crate::entry::ENTRY_NON_CMD_FIELDS_SIZE),
            )
        }
    }
}

/// Process-wide configuration of the hosting engine.
#[derive(Clone, Debug, Parser)]
pub struct EngineConfig {
    /// Fixed number of worker tasks driving node step loops.
    #[clap(long, default_value = "8")]
    pub worker_count: usize,

    /// Internal write shards of the log store.
    #[clap(long, default_value = "4")]
    pub logdb_shards: usize,

    /// Per-node inbound message queue length; messages beyond it are
    /// dropped.
    #[clap(long, default_value = "1024")]
    pub in_queue_len: usize,

    /// Per-node inbound queue byte budget; non-local messages beyond it
    /// are dropped.
    #[clap(long, default_value = "256 MiB", value_parser = parse_bytes_with_unit)]
    pub in_queue_bytes: u64,

    /// Milliseconds per RTT tick delivered to every node.
    #[clap(long, default_value = "50")]
    pub rtt_millisecond: u64,

    /// Root directory for snapshot files.
    #[clap(long, default_value = "snapshots")]
    pub snapshot_root: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        <Self as Parser>::parse_from(Vec::<&'static str>::new())
    }
}

impl EngineConfig {
    pub fn validate(self) -> Result<EngineConfig, ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::WorkerCountIs0);
        }
        if self.logdb_shards == 0 {
            return Err(ConfigError::LogDbShardsIs0);
        }
        Ok(self)
    }
}
