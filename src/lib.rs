//! flotilla is a multi-group raft consensus core: many replicated state
//! machines hosted in one process, each driven by a per-replica node
//! runtime over a shared, sharded log store.
//!
//! The building blocks, leaves first:
//!
//! - [`storage::LogStore`] — durable, compactable entry sequences per
//!   `(shard, replica)`, with [`storage::ShardedLogDb`] as the provided
//!   in-process implementation.
//! - the unified log — an in-memory unstable tail merged with the durable
//!   view behind a single seam, consumed by the raft peer.
//! - the raft peer — election, replication and commit tracking, sans-io:
//!   it accumulates effects into an [`Update`] that the node runtime
//!   executes in a fixed order.
//! - [`sm::StateMachine`] — the user state machine boundary, hosted with
//!   exactly-once client session semantics and snapshot save/recover.
//! - [`Node`] — the per-replica driver: request admission, the inbound
//!   queue, the pending request registry, quiesce.
//! - [`ExecEngine`] — the worker pool driving many nodes cooperatively
//!   over one log store.
//!
//! ```ignore
//! let engine = ExecEngine::new(EngineConfig::default());
//! let node = engine.start_replica(
//!     GroupId::new(shard_id, replica_id),
//!     Config::default(),
//!     initial_members,
//!     Box::new(MyStateMachine::new()),
//!     router,
//! )?;
//!
//! let mut session = ClientSession::new(shard_id, client_id);
//! node.propose_session(&session, 20).await?;
//! session.prepare_for_propose();
//! let result = node.propose(&session, payload, 20).await?;
//! ```

pub mod client;
pub mod config;
mod engine;
pub mod entry;
mod error;
mod log;
mod membership;
mod message;
mod node;
mod peer;
pub mod sm;
pub mod snapshot;
pub mod storage;
mod types;

pub use client::ClientSession;
pub use config::Config;
pub use config::EngineConfig;
pub use engine::ExecEngine;
pub use engine::StartReplicaError;
pub use entry::Entry;
pub use entry::EntryType;
pub use error::Fatal;
pub use error::RequestError;
pub use membership::ConfigChange;
pub use membership::ConfigChangeType;
pub use membership::Membership;
pub use message::Message;
pub use message::MessageKind;
pub use message::ReadState;
pub use node::Node;
pub use node::Router;
pub use sm::SmError;
pub use sm::SmResult;
pub use sm::StateMachine;
pub use snapshot::SnapshotMeta;
pub use snapshot::SnapshotOptions;
pub use types::GroupId;
pub use types::HardState;
pub use types::LeaderUpdate;
pub use types::Update;
