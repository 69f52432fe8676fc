use crate::sm::session::SeriesOutcome;
use crate::sm::SessionManager;
use crate::sm::SmResult;

#[test]
fn test_exactly_once_series() -> anyhow::Result<()> {
    let mut mgr = SessionManager::new(16);
    assert!(mgr.register(100));

    let s = mgr.get_mut(100).unwrap();
    assert_eq!(SeriesOutcome::Apply, s.admit(1));
    s.record(1, SmResult::of(11));

    // replay answers from the cache
    assert_eq!(SeriesOutcome::Cached(SmResult::of(11)), s.admit(1));

    assert_eq!(SeriesOutcome::Apply, s.admit(2));
    s.record(2, SmResult::of(22));

    // acknowledging series 1 discards it; a later replay is refused
    s.respond_to(1);
    assert_eq!(SeriesOutcome::AlreadyResponded, s.admit(1));
    assert_eq!(SeriesOutcome::Cached(SmResult::of(22)), s.admit(2));
    assert_eq!(1, s.cached_len());

    Ok(())
}

#[test]
#[should_panic(expected = "leaves a hole")]
fn test_series_gap_is_fatal() {
    let mut mgr = SessionManager::new(16);
    mgr.register(100);
    let s = mgr.get_mut(100).unwrap();
    let _ = s.admit(5);
}

#[test]
fn test_register_unregister() -> anyhow::Result<()> {
    let mut mgr = SessionManager::new(16);

    assert!(mgr.register(7));
    assert!(!mgr.register(7));
    assert_eq!(1, mgr.len());

    assert!(mgr.unregister(7));
    assert!(!mgr.unregister(7));
    assert!(mgr.get_mut(7).is_none());

    Ok(())
}

#[test]
fn test_lru_eviction() -> anyhow::Result<()> {
    let mut mgr = SessionManager::new(2);
    mgr.register(1);
    mgr.register(2);

    // touch 1 so 2 is the eviction victim
    mgr.get_mut(1).unwrap();
    mgr.register(3);

    assert_eq!(2, mgr.len());
    assert!(mgr.get_mut(1).is_some());
    assert!(mgr.get_mut(2).is_none());
    assert!(mgr.get_mut(3).is_some());

    Ok(())
}

#[test]
fn test_session_table_roundtrips_through_snapshot() -> anyhow::Result<()> {
    let mut mgr = SessionManager::new(16);
    mgr.register(100);
    let s = mgr.get_mut(100).unwrap();
    s.record(1, SmResult::of(11));
    s.respond_to(0);

    let raw = mgr.serialize();
    let mut restored = SessionManager::deserialize(&raw)?;

    let s = restored.get_mut(100).unwrap();
    assert_eq!(SeriesOutcome::Cached(SmResult::of(11)), s.admit(1));
    assert_eq!(SeriesOutcome::Apply, s.admit(2));

    Ok(())
}
