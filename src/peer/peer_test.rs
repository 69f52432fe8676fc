use std::sync::Arc;

use maplit::btreemap;

use crate::config::Config;
use crate::entry::Entry;
use crate::entry::EntryType;
use crate::log::ReplicaLog;
use crate::message::Message;
use crate::message::MessageKind;
use crate::peer::Peer;
use crate::peer::Role;
use crate::snapshot::SnapshotMeta;
use crate::storage::LogStore;
use crate::storage::ShardedLogDb;
use crate::types::GroupId;
use crate::types::HardState;
use crate::types::Update;
use crate::Membership;

fn g() -> GroupId {
    GroupId::new(1, 1)
}

fn ents(pairs: &[(u64, u64)]) -> Vec<Entry> {
    pairs.iter().map(|(i, t)| Entry::new(*i, *t)).collect()
}

fn membership(voters: &[u64], witnesses: &[u64]) -> Membership {
    Membership {
        config_change_id: 0,
        addresses: voters.iter().map(|id| (*id, format!("a{}", id))).collect(),
        witnesses: witnesses.iter().map(|id| (*id, format!("w{}", id))).collect(),
        ..Default::default()
    }
}

fn peer_with(voters: &[u64], witnesses: &[u64], durable: &[(u64, u64)], tweak: impl FnOnce(&mut Config)) -> Peer {
    let db = Arc::new(ShardedLogDb::new(1));
    if !durable.is_empty() {
        db.append(&[Update {
            group: g(),
            hard_state: Some(HardState {
                term: durable.last().unwrap().1,
                vote: 0,
                commit: 0,
            }),
            entries_to_save: ents(durable),
            ..Default::default()
        }])
        .unwrap();
    }

    let mut cfg = Config::default();
    tweak(&mut cfg);
    let log = ReplicaLog::new(g(), db, cfg.max_apply_batch_bytes).unwrap();
    let hs = HardState {
        term: durable.last().map(|p| p.1).unwrap_or(0),
        vote: 0,
        commit: 0,
    };
    Peer::new(g(), Arc::new(cfg), log, hs, membership(voters, witnesses), None)
}

fn elect(peer: &mut Peer, granting: &[u64]) {
    peer.step(Message {
        kind: MessageKind::Election,
        ..Default::default()
    })
    .unwrap();
    let term = peer.term();
    for from in granting {
        peer.step(Message {
            kind: MessageKind::RequestVoteResp,
            from: *from,
            term,
            ..Default::default()
        })
        .unwrap();
    }
    assert!(peer.is_leader());
    // drop the election-round messages
    let _ = peer.get_update(0).unwrap();
}

fn msgs_of_kind(ud: &Update, kind: MessageKind) -> Vec<&Message> {
    ud.messages.iter().filter(|m| m.kind == kind).collect()
}

#[test]
fn test_single_voter_elects_itself() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1], &[], &[], |_| {});

    peer.step(Message {
        kind: MessageKind::Election,
        ..Default::default()
    })?;

    assert!(peer.is_leader());
    assert_eq!(1, peer.term());
    assert_eq!(1, peer.leader_id());

    let ud = peer.get_update(0)?;
    // the term-opening entry is both saved and immediately committed
    assert_eq!(1, ud.entries_to_save.len());
    assert_eq!(1, ud.committed_entries.len());
    assert_eq!(
        Some(HardState {
            term: 1,
            vote: 1,
            commit: 1
        }),
        ud.hard_state
    );
    assert_eq!(
        Some(crate::types::LeaderUpdate { leader_id: 1, term: 1 }),
        ud.leader_update
    );

    Ok(())
}

#[test]
fn test_campaign_requests_votes_from_voters_and_witnesses() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1, 2], &[3], &[], |_| {});

    peer.step(Message {
        kind: MessageKind::Election,
        ..Default::default()
    })?;

    assert!(!peer.is_leader());
    let ud = peer.get_update(0)?;
    let votes = msgs_of_kind(&ud, MessageKind::RequestVote);
    assert_eq!(
        btreemap! {2 => true, 3 => true},
        votes.iter().map(|m| (m.to, true)).collect::<std::collections::BTreeMap<u64, bool>>()
    );

    Ok(())
}

#[test]
fn test_quorum_grant_becomes_leader() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1, 2, 3], &[], &[], |_| {});
    elect(&mut peer, &[2]);

    assert!(peer.is_leader());
    assert_eq!(1, peer.term());

    Ok(())
}

#[test]
fn test_vote_rules() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1, 2, 3], &[], &[(1, 1), (2, 2)], |_| {});

    // candidate with a stale log is rejected
    peer.step(Message {
        kind: MessageKind::RequestVote,
        from: 2,
        term: 3,
        log_index: 1,
        log_term: 1,
        ..Default::default()
    })?;
    let ud = peer.get_update(0)?;
    assert!(msgs_of_kind(&ud, MessageKind::RequestVoteResp)[0].reject);

    // up-to-date candidate is granted
    peer.step(Message {
        kind: MessageKind::RequestVote,
        from: 2,
        term: 3,
        log_index: 2,
        log_term: 2,
        ..Default::default()
    })?;
    let ud = peer.get_update(0)?;
    assert!(!msgs_of_kind(&ud, MessageKind::RequestVoteResp)[0].reject);

    // a second candidate in the same term is rejected
    peer.step(Message {
        kind: MessageKind::RequestVote,
        from: 3,
        term: 3,
        log_index: 9,
        log_term: 9,
        ..Default::default()
    })?;
    let ud = peer.get_update(0)?;
    assert!(msgs_of_kind(&ud, MessageKind::RequestVoteResp)[0].reject);

    Ok(())
}

#[test]
fn test_follower_accepts_replicate() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1, 2, 3], &[], &[], |_| {});

    peer.step(Message {
        kind: MessageKind::Replicate,
        from: 2,
        term: 1,
        log_index: 0,
        log_term: 0,
        commit: 1,
        entries: ents(&[(1, 1), (2, 1)]),
        ..Default::default()
    })?;

    assert_eq!(2, peer.leader_id());
    assert_eq!(1, peer.log.committed);
    assert_eq!(2, peer.log.last_index());

    let ud = peer.get_update(0)?;
    let resp = msgs_of_kind(&ud, MessageKind::ReplicateResp)[0].clone();
    assert!(!resp.reject);
    assert_eq!(2, resp.log_index);
    // accepted entries are queued for the durable store
    assert_eq!(2, ud.entries_to_save.len());
    // commit=1 releases the first entry for apply
    assert_eq!(1, ud.committed_entries.len());

    Ok(())
}

#[test]
fn test_follower_rejects_mismatched_replicate() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1, 2, 3], &[], &[(1, 1)], |_| {});

    peer.step(Message {
        kind: MessageKind::Replicate,
        from: 2,
        term: 2,
        log_index: 5,
        log_term: 2,
        commit: 5,
        entries: ents(&[(6, 2)]),
        ..Default::default()
    })?;

    let ud = peer.get_update(0)?;
    let resp = msgs_of_kind(&ud, MessageKind::ReplicateResp)[0].clone();
    assert!(resp.reject);
    assert_eq!(5, resp.log_index);
    // the hint carries our last index so the leader rewinds in one step
    assert_eq!(1, resp.hint.0);

    Ok(())
}

#[test]
fn test_leader_commits_at_quorum_median() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1, 2, 3], &[], &[], |_| {});
    elect(&mut peer, &[2]);

    peer.propose(vec![Entry {
        payload: bytes::Bytes::from_static(b"x"),
        ..Default::default()
    }])?;
    assert_eq!(2, peer.log.last_index());
    assert_eq!(0, peer.log.committed);

    // replica 2 confirms through the proposal: median of (2, 2, 0) is 2
    peer.step(Message {
        kind: MessageKind::ReplicateResp,
        from: 2,
        term: 1,
        log_index: 2,
        ..Default::default()
    })?;

    assert_eq!(2, peer.log.committed);
    let ud = peer.get_update(0)?;
    assert_eq!(2, ud.committed_entries.len());

    // commit propagation heartbeat is clamped to each follower's match
    let hbs = msgs_of_kind(&ud, MessageKind::Heartbeat);
    let to_2 = hbs.iter().find(|m| m.to == 2).unwrap();
    let to_3 = hbs.iter().find(|m| m.to == 3).unwrap();
    assert_eq!(2, to_2.commit);
    assert_eq!(0, to_3.commit);

    Ok(())
}

#[test]
fn test_stale_term_messages_ignored() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1, 2, 3], &[], &[(1, 3)], |_| {});

    peer.step(Message {
        kind: MessageKind::Replicate,
        from: 2,
        term: 1,
        entries: ents(&[(2, 1)]),
        ..Default::default()
    })?;

    assert_eq!(1, peer.log.last_index());
    assert_eq!(0, peer.leader_id());

    Ok(())
}

#[test]
fn test_read_index_quorum_roundtrip() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1, 2, 3], &[], &[], |_| {});
    elect(&mut peer, &[2]);

    // commit the term-opening entry so reads are safe
    peer.step(Message {
        kind: MessageKind::ReplicateResp,
        from: 2,
        term: 1,
        log_index: 1,
        ..Default::default()
    })?;
    assert_eq!(1, peer.log.committed);
    let _ = peer.get_update(0)?;

    peer.request_read_index((1, 42))?;
    let ud = peer.get_update(0)?;
    let hbs = msgs_of_kind(&ud, MessageKind::Heartbeat);
    assert!(hbs.iter().all(|m| m.hint == (1, 42)));

    peer.step(Message {
        kind: MessageKind::HeartbeatResp,
        from: 2,
        term: 1,
        hint: (1, 42),
        ..Default::default()
    })?;

    let ud = peer.get_update(0)?;
    assert_eq!(1, ud.ready_to_reads.len());
    assert_eq!(1, ud.ready_to_reads[0].index);
    assert_eq!((1, 42), ud.ready_to_reads[0].ctx);

    Ok(())
}

#[test]
fn test_witness_receives_metadata_entries() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1, 2], &[3], &[], |_| {});
    elect(&mut peer, &[2]);

    // both remotes confirm the term-opening entry and leave probe mode
    for from in [2, 3] {
        peer.step(Message {
            kind: MessageKind::ReplicateResp,
            from,
            term: 1,
            log_index: 1,
            ..Default::default()
        })?;
    }
    let _ = peer.get_update(0)?;

    peer.propose(vec![Entry {
        payload: bytes::Bytes::from_static(b"user-data"),
        ..Default::default()
    }])?;

    let ud = peer.get_update(0)?;
    let reps = msgs_of_kind(&ud, MessageKind::Replicate);
    let to_witness = reps.iter().find(|m| m.to == 3).unwrap();
    let to_voter = reps.iter().find(|m| m.to == 2).unwrap();

    assert!(to_witness.entries.iter().all(|e| e.entry_type == EntryType::Metadata));
    assert!(to_witness.entries.iter().all(|e| e.payload.is_empty()));
    assert!(to_voter.entries.iter().any(|e| !e.payload.is_empty()));
    // index/term bookkeeping is identical on both streams
    assert_eq!(
        to_voter.entries.iter().map(|e| (e.index, e.term)).collect::<Vec<_>>(),
        to_witness.entries.iter().map(|e| (e.index, e.term)).collect::<Vec<_>>()
    );

    Ok(())
}

#[test]
fn test_leader_transfer_sends_timeout_now() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1, 2, 3], &[], &[], |_| {});
    elect(&mut peer, &[2]);

    peer.step(Message {
        kind: MessageKind::ReplicateResp,
        from: 2,
        term: 1,
        log_index: 1,
        ..Default::default()
    })?;
    let _ = peer.get_update(0)?;

    peer.request_leader_transfer(2);
    let ud = peer.get_update(0)?;
    assert_eq!(1, msgs_of_kind(&ud, MessageKind::TimeoutNow).len());

    // proposals are refused while the transfer is in flight
    let last = peer.log.last_index();
    peer.propose(vec![Entry::default()])?;
    assert_eq!(last, peer.log.last_index());

    Ok(())
}

#[test]
fn test_timeout_now_triggers_campaign() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1, 2, 3], &[], &[(1, 1)], |_| {});

    peer.step(Message {
        kind: MessageKind::TimeoutNow,
        from: 2,
        term: 1,
        ..Default::default()
    })?;

    assert_eq!(Role::Candidate, peer.role);
    assert_eq!(2, peer.term());

    Ok(())
}

#[test]
fn test_install_snapshot() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1, 2, 3], &[], &[(1, 1), (2, 1)], |_| {});
    peer.step(Message {
        kind: MessageKind::Replicate,
        from: 2,
        term: 1,
        log_index: 2,
        log_term: 1,
        commit: 2,
        ..Default::default()
    })?;
    assert_eq!(2, peer.log.committed);
    let _ = peer.get_update(0)?;

    // a snapshot that does not advance the commit point is ignored
    peer.step(Message {
        kind: MessageKind::InstallSnapshot,
        from: 2,
        term: 1,
        snapshot: Some(SnapshotMeta {
            index: 1,
            term: 1,
            ..Default::default()
        }),
        ..Default::default()
    })?;
    let ud = peer.get_update(0)?;
    assert_eq!(2, msgs_of_kind(&ud, MessageKind::ReplicateResp)[0].log_index);
    assert_eq!(2, peer.log.last_index());

    // a snapshot ahead of the log replaces it
    peer.step(Message {
        kind: MessageKind::InstallSnapshot,
        from: 2,
        term: 1,
        snapshot: Some(SnapshotMeta {
            index: 20,
            term: 1,
            ..Default::default()
        }),
        ..Default::default()
    })?;

    assert_eq!(21, peer.log.first_index());
    assert_eq!(20, peer.log.last_index());
    assert_eq!(20, peer.log.committed);

    let ud = peer.get_update(0)?;
    assert_eq!(20, msgs_of_kind(&ud, MessageKind::ReplicateResp)[0].log_index);
    assert_eq!(20, ud.snapshot.as_ref().unwrap().index);

    Ok(())
}

#[test]
fn test_check_quorum_steps_down() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1, 2, 3], &[], &[], |c| c.check_quorum = true);
    elect(&mut peer, &[2]);

    // first sweep consumes the initial activity credit, second sees none
    for _ in 0..2 * peer.config.election_rtt {
        peer.tick()?;
        let _ = peer.get_update(0)?;
    }

    assert!(!peer.is_leader());

    Ok(())
}

#[test]
fn test_higher_term_steps_leader_down() -> anyhow::Result<()> {
    let mut peer = peer_with(&[1, 2, 3], &[], &[], |_| {});
    elect(&mut peer, &[2]);

    peer.step(Message {
        kind: MessageKind::Heartbeat,
        from: 3,
        term: 5,
        ..Default::default()
    })?;

    assert!(!peer.is_leader());
    assert_eq!(5, peer.term());
    assert_eq!(3, peer.leader_id());

    Ok(())
}
