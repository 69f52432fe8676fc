//! The execution engine: a fixed pool of worker tasks cooperatively
//! driving many nodes.
//!
//! Each node is pinned to one worker, so all of its state-touching work is
//! serialized without per-node tasks. A worker round collects updates from
//! its nodes, writes the snapshot records and then the raft state for the
//! whole batch in two store calls, and runs per-node post-processing in
//! the fixed order the node runtime requires.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::config::ConfigError;
use crate::config::EngineConfig;
use crate::message::Message;
use crate::node::Node;
use crate::node::Router;
use crate::sm::StateMachine;
use crate::storage::with_retry;
use crate::storage::LogStore;
use crate::storage::ShardedLogDb;
use crate::storage::StoreError;
use crate::types::GroupId;
use crate::types::Update;

/// Errors starting a replica.
#[derive(Debug, thiserror::Error)]
pub enum StartReplicaError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("replica already started")]
    AlreadyStarted,
}

struct EngineWorker {
    nodes: Arc<Mutex<Vec<Arc<Node>>>>,
    notify: Arc<Notify>,
    join_handle: JoinHandle<()>,
}

/// Hosts every replica of the process over one shared log store.
pub struct ExecEngine {
    config: EngineConfig,
    store: Arc<dyn LogStore>,
    workers: Vec<EngineWorker>,
    registry: Mutex<BTreeMap<GroupId, Arc<Node>>>,
    tick_handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

impl ExecEngine {
    /// Start the engine: the log store, the worker pool, and the tick
    /// source. Must outlive every node it hosts.
    pub fn new(config: EngineConfig) -> Arc<ExecEngine> {
        let config = config.validate().expect("engine config");
        let store: Arc<dyn LogStore> = Arc::new(ShardedLogDb::new(config.logdb_shards));
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let nodes: Arc<Mutex<Vec<Arc<Node>>>> = Arc::new(Mutex::new(Vec::new()));
            let notify = Arc::new(Notify::new());
            let join_handle = tokio::spawn(worker_loop(
                worker_id,
                store.clone(),
                nodes.clone(),
                notify.clone(),
                stop_rx.clone(),
            ));
            workers.push(EngineWorker {
                nodes,
                notify,
                join_handle,
            });
        }

        let tick_targets: Vec<Arc<Mutex<Vec<Arc<Node>>>>> = workers.iter().map(|w| w.nodes.clone()).collect();
        let tick_notifies: Vec<Arc<Notify>> = workers.iter().map(|w| w.notify.clone()).collect();
        let tick_handle = tokio::spawn(tick_loop(
            config.rtt_millisecond,
            tick_targets,
            tick_notifies,
            stop_rx,
        ));

        Arc::new(ExecEngine {
            config,
            store,
            workers,
            registry: Mutex::new(BTreeMap::new()),
            tick_handle,
            stop_tx,
        })
    }

    pub fn store(&self) -> Arc<dyn LogStore> {
        self.store.clone()
    }

    /// Start the replica `group` of a shard. `initial_members` seeds
    /// membership for a pristine shard and is ignored once a snapshot
    /// exists.
    pub fn start_replica(
        &self,
        group: GroupId,
        config: Config,
        initial_members: BTreeMap<u64, String>,
        sm: Box<dyn StateMachine>,
        router: Router,
    ) -> Result<Arc<Node>, StartReplicaError> {
        let config = config.validate()?;

        let mut registry = self.registry.lock().unwrap();
        if registry.contains_key(&group) {
            return Err(StartReplicaError::AlreadyStarted);
        }

        let worker = &self.workers[self.worker_of(group)];
        let node = Node::new(
            group,
            config,
            &self.config,
            self.store.clone(),
            sm,
            router,
            initial_members,
            worker.notify.clone(),
        )?;

        worker.nodes.lock().unwrap().push(node.clone());
        registry.insert(group, node.clone());
        worker.notify.notify_one();

        tracing::info!(group = display(group), "replica started");
        Ok(node)
    }

    pub fn get_node(&self, group: GroupId) -> Option<Arc<Node>> {
        self.registry.lock().unwrap().get(&group).cloned()
    }

    /// Stop one replica and drop it from its worker.
    pub fn stop_replica(&self, group: GroupId) {
        let Some(node) = self.registry.lock().unwrap().remove(&group) else {
            return;
        };
        node.stop();
        let worker = &self.workers[self.worker_of(group)];
        worker.nodes.lock().unwrap().retain(|n| n.group() != group);
    }

    /// Stop everything: replicas first, then workers, then the store.
    ///
    /// Workers observe the stop signal at their next round; the store is
    /// closed after a short drain window so an in-flight batch can land.
    pub async fn stop(&self) {
        let groups: Vec<GroupId> = self.registry.lock().unwrap().keys().copied().collect();
        for g in groups {
            self.stop_replica(g);
        }

        let _ = self.stop_tx.send(true);
        for w in &self.workers {
            w.notify.notify_one();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        self.tick_handle.abort();
        for w in &self.workers {
            w.join_handle.abort();
        }
        let _ = self.store.close();
    }

    fn worker_of(&self, group: GroupId) -> usize {
        let h = group.shard_id.wrapping_mul(31).wrapping_add(group.replica_id);
        (h % self.workers.len() as u64) as usize
    }
}

async fn worker_loop(
    worker_id: usize,
    store: Arc<dyn LogStore>,
    nodes: Arc<Mutex<Vec<Arc<Node>>>>,
    notify: Arc<Notify>,
    mut stop_rx: watch::Receiver<bool>,
) {
    tracing::debug!(worker_id, "engine worker running");
    loop {
        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            _ = stop_rx.changed() => {
                tracing::debug!(worker_id, "engine worker stopping");
                return;
            }
        }

        let snapshot: Vec<Arc<Node>> = nodes.lock().unwrap().clone();

        let mut round_nodes: Vec<Arc<Node>> = Vec::new();
        let mut updates: Vec<Update> = Vec::new();
        for node in &snapshot {
            if node.is_stopped() {
                continue;
            }
            if let Some(ud) = node.handle_events() {
                round_nodes.push(node.clone());
                updates.push(ud);
            }
        }
        if updates.is_empty() {
            continue;
        }

        // snapshot records first: after a crash we must never observe
        // entries beyond a snapshot without the snapshot itself
        with_retry("save_snapshots", || store.save_snapshots(&updates));
        for (node, ud) in round_nodes.iter().zip(updates.iter()) {
            node.process_snapshot(ud);
        }

        with_retry("append", || store.append(&updates));
        for (node, ud) in round_nodes.iter().zip(updates.into_iter()) {
            node.process_update(ud);
        }
    }
}

async fn tick_loop(
    rtt_ms: u64,
    targets: Vec<Arc<Mutex<Vec<Arc<Node>>>>>,
    notifies: Vec<Arc<Notify>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(rtt_ms.max(1)));
    let mut hint: u64 = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop_rx.changed() => return,
        }
        hint += 1;
        for (nodes, notify) in targets.iter().zip(notifies.iter()) {
            let nodes = nodes.lock().unwrap().clone();
            for node in nodes {
                node.deliver(Message::local_tick(hint));
            }
            notify.notify_one();
        }
    }
}
