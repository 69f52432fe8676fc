use std::io::Read;
use std::io::Write;

use crate::membership::Membership;
use crate::snapshot::SnapshotMeta;
use crate::snapshot::Snapshotter;
use crate::types::GroupId;

fn snapshotter(root: &std::path::Path) -> Snapshotter {
    Snapshotter::new(root, GroupId::new(100, 1))
}

fn meta(index: u64, term: u64) -> SnapshotMeta {
    SnapshotMeta {
        shard_id: 100,
        replica_id: 1,
        index,
        term,
        membership: Membership::new(),
        ..Default::default()
    }
}

#[test]
fn test_finalize_makes_snapshot_visible() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let s = snapshotter(tmp.path());

    assert!(s.load_latest()?.is_none());

    let mut w = s.new_writer(10)?;
    w.write_all(b"payload-10")?;
    let done = w.finalize(meta(10, 3), vec![1, 2, 3])?;

    assert_eq!(10, done.file_size);
    assert_ne!(0, done.checksum);

    let (loaded, sessions) = s.load_latest()?.expect("snapshot visible after finalize");
    assert_eq!(done, loaded);
    assert_eq!(vec![1, 2, 3], sessions);

    let mut r = s.open_reader(&loaded)?;
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    assert_eq!(b"payload-10".to_vec(), buf);

    Ok(())
}

#[test]
fn test_unfinalized_snapshot_is_invisible() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let s = snapshotter(tmp.path());

    let mut w = s.new_writer(5)?;
    w.write_all(b"partial")?;
    // dropped without finalize
    drop(w);

    assert!(s.load_latest()?.is_none());

    // a discarded writer cleans up its directory, allowing a retry
    let w = s.new_writer(5)?;
    w.discard()?;
    assert!(s.load_latest()?.is_none());

    Ok(())
}

#[test]
fn test_latest_wins_and_gc() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let s = snapshotter(tmp.path());

    for idx in [10u64, 30, 20] {
        let mut w = s.new_writer(idx)?;
        w.write_all(format!("p{}", idx).as_bytes())?;
        w.finalize(meta(idx, idx), vec![])?;
    }

    let (latest, _) = s.load_latest()?.expect("has snapshots");
    assert_eq!(30, latest.index);

    s.remove_older_than(30)?;
    let (still, _) = s.load_latest()?.expect("latest survives gc");
    assert_eq!(30, still.index);

    Ok(())
}
