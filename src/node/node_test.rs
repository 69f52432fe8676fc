use std::collections::BTreeMap;
use std::io::Read;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::client::ClientSession;
use crate::config::Config;
use crate::config::EngineConfig;
use crate::error::RequestError;
use crate::message::Message;
use crate::message::MessageKind;
use crate::node::Node;
use crate::sm::SmError;
use crate::sm::SmResult;
use crate::sm::SnapshotSource;
use crate::sm::StateMachine;
use crate::snapshot::SnapshotOptions;
use crate::snapshot::SnapshotReader;
use crate::snapshot::SnapshotWriter;
use crate::storage::LogStore;
use crate::storage::ShardedLogDb;
use crate::types::GroupId;

const SHARD: u64 = 1100;

struct EchoSm {
    count: u64,
}

struct EchoSource {
    raw: Vec<u8>,
}

impl SnapshotSource for EchoSource {
    fn save_snapshot(&mut self, writer: &mut SnapshotWriter) -> Result<u64, SmError> {
        writer.write_all(&self.raw)?;
        Ok(self.raw.len() as u64)
    }
}

#[async_trait]
impl StateMachine for EchoSm {
    async fn update(&mut self, entry: &crate::Entry) -> Result<SmResult, SmError> {
        self.count += 1;
        Ok(SmResult {
            value: self.count,
            data: entry.payload.clone(),
        })
    }

    async fn lookup(&self, _query: Bytes) -> Result<Bytes, SmError> {
        Ok(Bytes::from(self.count.to_string()))
    }

    fn prepare_snapshot(&mut self) -> Result<Box<dyn SnapshotSource>, SmError> {
        Ok(Box::new(EchoSource {
            raw: self.count.to_string().into_bytes(),
        }))
    }

    async fn recover_from_snapshot(&mut self, reader: &mut SnapshotReader) -> Result<(), SmError> {
        let mut raw = String::new();
        reader.read_to_string(&mut raw)?;
        self.count = raw.parse().unwrap();
        Ok(())
    }
}

struct Fixture {
    node: Arc<Node>,
    store: Arc<ShardedLogDb>,
    _tmp: tempfile::TempDir,
}

fn fixture(members: &[u64], tweak: impl FnOnce(&mut Config)) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let mut engine_cfg = EngineConfig::default();
    engine_cfg.snapshot_root = tmp.path().to_string_lossy().into_owned();

    let mut cfg = Config::default();
    tweak(&mut cfg);

    let store = Arc::new(ShardedLogDb::new(2));
    let initial: BTreeMap<u64, String> = members.iter().map(|id| (*id, format!("a{}", id))).collect();

    let node = Node::new(
        GroupId::new(SHARD, 1),
        cfg,
        &engine_cfg,
        store.clone(),
        Box::new(EchoSm { count: 0 }),
        Arc::new(|_m: Message| {}),
        initial,
        Arc::new(Notify::new()),
    )
    .unwrap();

    Fixture {
        node,
        store,
        _tmp: tmp,
    }
}

/// One engine round for a single node.
fn step_node(node: &Arc<Node>, store: &Arc<ShardedLogDb>) -> bool {
    let Some(ud) = node.handle_events() else {
        return false;
    };
    store.save_snapshots(std::slice::from_ref(&ud)).unwrap();
    node.process_snapshot(&ud);
    store.append(std::slice::from_ref(&ud)).unwrap();
    node.process_update(ud);
    true
}

/// Background driver standing in for the engine worker plus tick source.
fn spawn_driver(node: Arc<Node>, store: Arc<ShardedLogDb>) -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = stop.clone();
    tokio::spawn(async move {
        let mut hint = 0u64;
        while !stop2.load(Ordering::Relaxed) {
            hint += 1;
            node.deliver(Message::local_tick(hint));
            step_node(&node, &store);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });
    stop
}

fn elect_self(node: &Arc<Node>, store: &Arc<ShardedLogDb>) {
    step_node(node, store); // initialization round
    node.deliver(Message {
        kind: MessageKind::Election,
        ..Default::default()
    });
    step_node(node, store);
    assert_eq!(1, node.leader_info().0);
}

#[tokio::test]
async fn test_witness_rejects_user_operations() -> anyhow::Result<()> {
    let f = fixture(&[1, 2, 3], |c| c.is_witness = true);
    let session = ClientSession::noop(SHARD);

    assert_eq!(
        Err(RequestError::InvalidOperation),
        f.node.propose(&session, Bytes::new(), 10).await
    );
    assert_eq!(
        Err(RequestError::InvalidOperation),
        f.node.read(Bytes::new(), 10).await.map(|_| ())
    );
    assert_eq!(
        Err(RequestError::InvalidOperation),
        f.node.request_snapshot(SnapshotOptions::default(), 10).await.map(|_| ())
    );
    assert_eq!(
        Err(RequestError::InvalidOperation),
        f.node.request_add_node(9, "a9".to_string(), 0, 10).await
    );
    assert_eq!(
        Err(RequestError::InvalidOperation),
        f.node
            .propose_session(&ClientSession::new(SHARD, 100), 10)
            .await
            .map(|_| ())
    );

    Ok(())
}

#[tokio::test]
async fn test_uninitialized_shard_not_ready() -> anyhow::Result<()> {
    let f = fixture(&[1], |_| {});

    assert_eq!(
        Err(RequestError::ShardNotReady),
        f.node.propose(&ClientSession::noop(SHARD), Bytes::new(), 10).await
    );

    Ok(())
}

#[tokio::test]
async fn test_session_validation() -> anyhow::Result<()> {
    let f = fixture(&[1], |_| {});
    step_node(&f.node, &f.store); // initialize

    // register-state session on a user proposal
    let s = ClientSession::new(SHARD, 100);
    assert_eq!(
        Err(RequestError::InvalidSession),
        f.node.propose(&s, Bytes::new(), 10).await
    );

    // zero client id with a real series
    let s = ClientSession {
        client_id: 0,
        shard_id: SHARD,
        series_id: 5,
        responded_to: 1,
    };
    assert_eq!(
        Err(RequestError::InvalidSession),
        f.node.propose(&s, Bytes::new(), 10).await
    );

    // shard mismatch
    let s = ClientSession::noop(SHARD + 1);
    assert_eq!(
        Err(RequestError::InvalidSession),
        f.node.propose(&s, Bytes::new(), 10).await
    );

    // register via propose_session with a noop session
    assert_eq!(
        Err(RequestError::InvalidSession),
        f.node
            .propose_session(&ClientSession::noop(SHARD), 10)
            .await
            .map(|_| ())
    );

    Ok(())
}

#[tokio::test]
async fn test_payload_admission() -> anyhow::Result<()> {
    let f = fixture(&[1], |c| c.max_in_mem_log_size = 1024);
    step_node(&f.node, &f.store);

    let big = Bytes::from(vec![0u8; 2048]);
    assert_eq!(
        Err(RequestError::PayloadTooBig),
        f.node.propose(&ClientSession::noop(SHARD), big, 10).await
    );

    Ok(())
}

#[tokio::test]
async fn test_proposal_times_out_without_leader() -> anyhow::Result<()> {
    let f = fixture(&[1, 2, 3], |_| {});
    step_node(&f.node, &f.store); // initialize; no election can win alone

    // drive ticks past the deadline while the proposal is parked
    let driver = async {
        for hint in 1..=6u64 {
            tokio::time::sleep(Duration::from_millis(1)).await;
            f.node.deliver(Message::local_tick(hint));
            step_node(&f.node, &f.store);
        }
    };

    let session = ClientSession::noop(SHARD);
    let (res, _) = tokio::join!(f.node.propose(&session, Bytes::new(), 3), driver);
    assert_eq!(Err(RequestError::Timeout), res);

    Ok(())
}

#[tokio::test]
async fn test_single_replica_propose_applies() -> anyhow::Result<()> {
    let f = fixture(&[1], |_| {});
    elect_self(&f.node, &f.store);

    let stop = spawn_driver(f.node.clone(), f.store.clone());

    let r = f
        .node
        .propose(&ClientSession::noop(SHARD), Bytes::from_static(b"hello"), 2000)
        .await?;
    assert_eq!(Bytes::from_static(b"hello"), r.data);
    assert!(f.node.last_applied() >= 2);

    stop.store(true, Ordering::Relaxed);
    Ok(())
}

#[tokio::test]
async fn test_single_replica_session_dedup() -> anyhow::Result<()> {
    let f = fixture(&[1], |_| {});
    elect_self(&f.node, &f.store);
    let stop = spawn_driver(f.node.clone(), f.store.clone());

    let mut session = ClientSession::new(SHARD, 100);
    let r = f.node.propose_session(&session, 2000).await?;
    assert_eq!(100, r.value);

    session.prepare_for_propose();
    let first = f.node.propose(&session, Bytes::from_static(b"A"), 2000).await?;

    // client retry with the same series: cached result, no reapply
    let replay = f.node.propose(&session, Bytes::from_static(b"A"), 2000).await?;
    assert_eq!(first, replay);

    session.proposal_completed();
    let second = f.node.propose(&session, Bytes::from_static(b"B"), 2000).await?;
    assert_eq!(first.value + 1, second.value);

    stop.store(true, Ordering::Relaxed);
    Ok(())
}

#[tokio::test]
async fn test_single_replica_read() -> anyhow::Result<()> {
    let f = fixture(&[1], |_| {});
    elect_self(&f.node, &f.store);
    let stop = spawn_driver(f.node.clone(), f.store.clone());

    f.node
        .propose(&ClientSession::noop(SHARD), Bytes::from_static(b"x"), 2000)
        .await?;

    let data = f.node.read(Bytes::new(), 2000).await?;
    assert_eq!(Bytes::from_static(b"1"), data);

    stop.store(true, Ordering::Relaxed);
    Ok(())
}

#[tokio::test]
async fn test_request_snapshot_and_compaction() -> anyhow::Result<()> {
    let f = fixture(&[1], |c| {
        c.snapshot_entries = 0;
        c.compaction_overhead = 0;
    });
    elect_self(&f.node, &f.store);
    let stop = spawn_driver(f.node.clone(), f.store.clone());

    for i in 0..5u8 {
        f.node
            .propose(&ClientSession::noop(SHARD), Bytes::from(vec![i]), 2000)
            .await?;
    }

    let applied = f.node.last_applied();
    let index = f.node.request_snapshot(SnapshotOptions::default(), 2000).await?;
    assert!(index >= applied);

    // compaction (overhead 0) trails the snapshot; poll briefly
    let group = f.node.group();
    for _ in 0..100 {
        let (first, _) = f.store.range(group)?;
        if first == index + 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let (first, last) = f.store.range(group)?;
    assert_eq!(index + 1, first);
    assert!(last >= index);

    stop.store(true, Ordering::Relaxed);
    Ok(())
}
