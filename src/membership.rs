use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The kind of change a [`ConfigChange`] proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub enum ConfigChangeType {
    AddNode,
    RemoveNode,
    AddObserver,
    AddWitness,
}

/// A proposed membership change, carried as the payload of an entry with
/// [`crate::EntryType::ConfigChange`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct ConfigChange {
    /// The membership version this change was computed against. With
    /// ordered config changes enabled, a mismatch rejects the change.
    pub config_change_id: u64,
    pub change_type: ConfigChangeType,
    pub replica_id: u64,
    pub address: String,
}

/// Membership of one shard.
///
/// Witnesses are counted in the quorum but refuse user operations;
/// observers replicate without voting. Removed replicas are remembered so
/// a re-add of a dead replica id can be refused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct Membership {
    /// Monotonic version, set to the index of the entry that applied the
    /// most recent change.
    pub config_change_id: u64,

    pub addresses: BTreeMap<u64, String>,
    pub observers: BTreeMap<u64, String>,
    pub witnesses: BTreeMap<u64, String>,
    pub removed: BTreeSet<u64>,
}

impl Membership {
    pub fn new() -> Self {
        Default::default()
    }

    /// Replicas that count toward the quorum: voters and witnesses.
    pub fn voting_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.addresses.keys().copied().chain(self.witnesses.keys().copied())
    }

    /// Every replica that receives replication traffic.
    pub fn all_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.voting_ids().chain(self.observers.keys().copied())
    }

    pub fn is_voter(&self, replica_id: u64) -> bool {
        self.addresses.contains_key(&replica_id) || self.witnesses.contains_key(&replica_id)
    }

    pub fn is_observer(&self, replica_id: u64) -> bool {
        self.observers.contains_key(&replica_id)
    }

    pub fn is_witness(&self, replica_id: u64) -> bool {
        self.witnesses.contains_key(&replica_id)
    }

    pub fn is_member(&self, replica_id: u64) -> bool {
        self.is_voter(replica_id) || self.is_observer(replica_id)
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.observers.is_empty() && self.witnesses.is_empty()
    }

    /// Number of granting voters required to reach quorum.
    pub fn quorum(&self) -> usize {
        self.voting_ids().count() / 2 + 1
    }

    /// Apply an already-committed change. The caller has validated
    /// `config_change_id` ordering if it enforces ordering at all.
    pub fn apply(&mut self, cc: &ConfigChange, applied_index: u64) {
        match cc.change_type {
            ConfigChangeType::AddNode => {
                self.observers.remove(&cc.replica_id);
                self.addresses.insert(cc.replica_id, cc.address.clone());
            }
            ConfigChangeType::AddObserver => {
                self.observers.insert(cc.replica_id, cc.address.clone());
            }
            ConfigChangeType::AddWitness => {
                self.witnesses.insert(cc.replica_id, cc.address.clone());
            }
            ConfigChangeType::RemoveNode => {
                self.addresses.remove(&cc.replica_id);
                self.observers.remove(&cc.replica_id);
                self.witnesses.remove(&cc.replica_id);
                self.removed.insert(cc.replica_id);
            }
        }
        self.config_change_id = applied_index;
    }

    /// Whether a change is acceptable against the current membership,
    /// independent of ordering enforcement.
    pub fn is_change_valid(&self, cc: &ConfigChange) -> bool {
        match cc.change_type {
            ConfigChangeType::AddNode => !self.removed.contains(&cc.replica_id) && !self.is_witness(cc.replica_id),
            ConfigChangeType::AddObserver => {
                !self.removed.contains(&cc.replica_id) && !self.is_voter(cc.replica_id)
            }
            ConfigChangeType::AddWitness => !self.removed.contains(&cc.replica_id) && !self.is_member(cc.replica_id),
            ConfigChangeType::RemoveNode => true,
        }
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{}:[voters:{:?} observers:{:?} witnesses:{:?}]",
            self.config_change_id,
            self.addresses.keys().collect::<Vec<_>>(),
            self.observers.keys().collect::<Vec<_>>(),
            self.witnesses.keys().collect::<Vec<_>>()
        )
    }
}
