use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::sm::SmResult;

/// Server-side state of one client session.
///
/// `responded_to` is the client's acknowledgement watermark: results at or
/// below it have been observed by the client and can be discarded.
/// `last_series` is the highest series applied; results in
/// `(responded_to, last_series]` stay cached for replays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct Session {
    pub client_id: u64,
    pub responded_to: u64,
    pub last_series: u64,
    cached: BTreeMap<u64, SmResult>,
}

/// Outcome of admitting one session-managed proposal for apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SeriesOutcome {
    /// A fresh series: apply it and cache the result.
    Apply,

    /// A replay of a cached series: answer without touching the state
    /// machine.
    Cached(SmResult),

    /// The client already acknowledged this series; the replay is
    /// rejected.
    AlreadyResponded,
}

impl Session {
    pub(crate) fn new(client_id: u64) -> Self {
        Session {
            client_id,
            ..Default::default()
        }
    }

    /// Advance the acknowledgement watermark and discard covered results.
    pub(crate) fn respond_to(&mut self, responded_to: u64) {
        if responded_to <= self.responded_to {
            return;
        }
        self.responded_to = responded_to;
        self.cached = self.cached.split_off(&(responded_to + 1));
    }

    /// Classify `series_id` against this session. A series beyond
    /// `last_series + 1` means a hole in the client's request sequence,
    /// which can only come from corruption.
    pub(crate) fn admit(&self, series_id: u64) -> SeriesOutcome {
        if series_id <= self.responded_to {
            return SeriesOutcome::AlreadyResponded;
        }
        if let Some(cached) = self.cached.get(&series_id) {
            return SeriesOutcome::Cached(cached.clone());
        }
        if series_id == self.last_series + 1 {
            return SeriesOutcome::Apply;
        }
        panic!(
            "client {}: series {} leaves a hole after {}",
            self.client_id, series_id, self.last_series
        );
    }

    pub(crate) fn record(&mut self, series_id: u64, result: SmResult) {
        debug_assert_eq!(series_id, self.last_series + 1);
        self.last_series = series_id;
        self.cached.insert(series_id, result);
    }

    #[cfg(test)]
    pub(crate) fn cached_len(&self) -> usize {
        self.cached.len()
    }
}

/// All sessions of one shard, LRU-evicted at capacity.
///
/// The table serializes into every snapshot so exactly-once semantics
/// survive recovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionManager {
    capacity: usize,
    tick: u64,
    sessions: HashMap<u64, (Session, u64)>,
}

impl SessionManager {
    pub(crate) fn new(capacity: usize) -> Self {
        SessionManager {
            capacity: capacity.max(1),
            tick: 0,
            sessions: HashMap::new(),
        }
    }

    /// Returns false when the client is already registered.
    pub(crate) fn register(&mut self, client_id: u64) -> bool {
        if self.sessions.contains_key(&client_id) {
            return false;
        }
        if self.sessions.len() >= self.capacity {
            self.evict_oldest();
        }
        self.tick += 1;
        self.sessions.insert(client_id, (Session::new(client_id), self.tick));
        true
    }

    /// Returns false when the client was not registered.
    pub(crate) fn unregister(&mut self, client_id: u64) -> bool {
        self.sessions.remove(&client_id).is_some()
    }

    pub(crate) fn get_mut(&mut self, client_id: u64) -> Option<&mut Session> {
        self.tick += 1;
        let tick = self.tick;
        self.sessions.get_mut(&client_id).map(|(s, used)| {
            *used = tick;
            s
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    fn evict_oldest(&mut self) {
        let Some(victim) = self.sessions.iter().min_by_key(|(_, (_, used))| *used).map(|(id, _)| *id) else {
            return;
        };
        tracing::debug!(client_id = victim, "evicting least recently used session");
        self.sessions.remove(&victim);
    }

    pub(crate) fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("session table serializes")
    }

    pub(crate) fn deserialize(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}
