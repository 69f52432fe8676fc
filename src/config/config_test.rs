use crate::config::Config;
use crate::config::ConfigError;
use crate::config::EngineConfig;
use crate::entry::ENTRY_NON_CMD_FIELDS_SIZE;

#[test]
fn test_config_defaults_are_valid() -> anyhow::Result<()> {
    let c = Config::default().validate()?;
    assert_eq!(20, c.election_rtt);
    assert_eq!(2, c.heartbeat_rtt);
    assert_eq!(200, c.quiesce_threshold());
    assert_eq!(None, c.max_proposal_payload());

    EngineConfig::default().validate()?;
    Ok(())
}

#[test]
fn test_config_build_from_args() -> anyhow::Result<()> {
    let c = Config::build(&[
        "flotilla",
        "--election-rtt=30",
        "--heartbeat-rtt=3",
        "--max-in-mem-log-size=1MiB",
        "--is-witness",
        "--quiesce=true",
    ])?;

    assert_eq!(30, c.election_rtt);
    assert_eq!(3, c.heartbeat_rtt);
    assert_eq!(1024 * 1024, c.max_in_mem_log_size);
    assert!(c.is_witness);
    assert!(c.quiesce);
    assert!(!c.check_quorum);
    assert_eq!(
        Some(1024 * 1024 - ENTRY_NON_CMD_FIELDS_SIZE),
        c.max_proposal_payload()
    );

    Ok(())
}

#[test]
fn test_config_rejects_bad_timing() -> anyhow::Result<()> {
    let mut c = Config::default();
    c.heartbeat_rtt = 0;
    assert_eq!(ConfigError::HeartbeatRttIs0, c.validate().unwrap_err());

    let mut c = Config::default();
    c.election_rtt = 3;
    c.heartbeat_rtt = 2;
    assert_eq!(
        ConfigError::ElectionRttTooSmall {
            election_rtt: 3,
            heartbeat_rtt: 2
        },
        c.validate().unwrap_err()
    );

    Ok(())
}

#[test]
fn test_config_rejects_inconsistent_roles() -> anyhow::Result<()> {
    let mut c = Config::default();
    c.is_witness = true;
    c.is_observer = true;
    assert_eq!(ConfigError::WitnessAndObserver, c.validate().unwrap_err());

    let mut c = Config::default();
    c.is_witness = true;
    c.snapshot_entries = 0;
    assert_eq!(ConfigError::WitnessWithoutSnapshot, c.validate().unwrap_err());

    Ok(())
}

#[test]
fn test_config_rejects_zero_compaction_overhead() -> anyhow::Result<()> {
    let mut c = Config::default();
    c.snapshot_entries = 100;
    c.compaction_overhead = 0;
    assert_eq!(
        ConfigError::CompactionOverheadIs0 { snapshot_entries: 100 },
        c.validate().unwrap_err()
    );

    Ok(())
}
