use crate::entry::entries_size;
use crate::entry::Entry;
use crate::log::InMemLog;
use crate::snapshot::SnapshotMeta;

fn ent(index: u64, term: u64) -> Entry {
    Entry::new(index, term)
}

fn ents(pairs: &[(u64, u64)]) -> Vec<Entry> {
    pairs.iter().map(|(i, t)| ent(*i, *t)).collect()
}

#[test]
fn test_merge_extends() -> anyhow::Result<()> {
    let mut im = InMemLog::new(3);
    assert_eq!(4, im.first_unstable_index());
    assert_eq!(None, im.last_index());

    im.merge(&ents(&[(4, 1), (5, 1)]));
    assert_eq!(Some(5), im.last_index());
    assert_eq!(Some(1), im.term(5));
    assert_eq!(None, im.term(6));
    assert_eq!(None, im.term(3));

    im.merge(&ents(&[(6, 2)]));
    assert_eq!(Some(6), im.last_index());
    assert_eq!(4, im.first_unstable_index());

    Ok(())
}

#[test]
fn test_merge_rewinds_below_marker() -> anyhow::Result<()> {
    let mut im = InMemLog::new(10);
    im.merge(&ents(&[(11, 2), (12, 2)]));

    // replacement reaching below the seam resets the whole tail
    im.merge(&ents(&[(8, 3), (9, 3)]));
    assert_eq!(8, im.first_unstable_index());
    assert_eq!(Some(9), im.last_index());
    assert_eq!(Some(3), im.term(8));
    assert_eq!(None, im.term(11));

    Ok(())
}

#[test]
fn test_merge_truncates_suffix() -> anyhow::Result<()> {
    let mut im = InMemLog::new(0);
    im.merge(&ents(&[(1, 1), (2, 1), (3, 1)]));

    im.merge(&ents(&[(2, 2)]));
    assert_eq!(1, im.first_unstable_index());
    assert_eq!(Some(2), im.last_index());
    assert_eq!(Some(1), im.term(1));
    assert_eq!(Some(2), im.term(2));

    Ok(())
}

#[test]
fn test_size_accounting() -> anyhow::Result<()> {
    let mut im = InMemLog::new(0);
    let mut e1 = ent(1, 1);
    e1.payload = bytes::Bytes::from_static(b"abc");
    let mut e2 = ent(2, 1);
    e2.payload = bytes::Bytes::from_static(b"defgh");

    im.merge(&[e1.clone(), e2.clone()]);
    assert_eq!(entries_size(&[e1.clone(), e2.clone()]), im.size_in_bytes());

    // truncation releases the dropped suffix
    let e2b = ent(2, 2);
    im.merge(&[e2b.clone()]);
    assert_eq!(entries_size(&[e1.clone(), e2b.clone()]), im.size_in_bytes());

    // stable entries leave memory
    im.saved_to(1, 1);
    assert_eq!(entries_size(&[e2b]), im.size_in_bytes());
    assert_eq!(2, im.first_unstable_index());

    im.saved_to(2, 2);
    assert_eq!(0, im.size_in_bytes());

    Ok(())
}

#[test]
fn test_saved_to_stale_notification_ignored() -> anyhow::Result<()> {
    let mut im = InMemLog::new(0);
    im.merge(&ents(&[(1, 1), (2, 1)]));

    // the tail is rewound before the durable write completes
    im.merge(&ents(&[(2, 2)]));

    // stale completion for the replaced entry must not move the seam
    im.saved_to(2, 1);
    assert_eq!(1, im.first_unstable_index());

    im.saved_to(2, 2);
    assert_eq!(3, im.first_unstable_index());
    assert_eq!(None, im.last_index());

    Ok(())
}

#[test]
fn test_restore_drops_tail() -> anyhow::Result<()> {
    let mut im = InMemLog::new(0);
    im.merge(&ents(&[(1, 1), (2, 1)]));

    let ss = SnapshotMeta {
        index: 100,
        term: 9,
        ..Default::default()
    };
    im.restore(ss);

    assert_eq!(101, im.first_unstable_index());
    assert_eq!(Some(100), im.last_index());
    assert_eq!(Some(9), im.term(100));
    assert_eq!(0, im.size_in_bytes());

    im.saved_snapshot_to(100);
    assert_eq!(None, im.last_index());

    Ok(())
}
