//! Client-side session bookkeeping.
//!
//! A [`ClientSession`] gives a client exactly-once application of its
//! proposals despite retries: the client increments `series_id` per
//! request and advances `responded_to` once it has seen a result, allowing
//! the shard to discard the cached result.

use serde::Deserialize;
use serde::Serialize;

use crate::entry::SERIES_ID_FIRST_PROPOSAL;
use crate::entry::SERIES_ID_NOOP;
use crate::entry::SERIES_ID_REGISTER;
use crate::entry::SERIES_ID_UNREGISTER;

/// A client's view of its session with one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct ClientSession {
    pub client_id: u64,
    pub shard_id: u64,
    pub series_id: u64,
    pub responded_to: u64,
}

impl ClientSession {
    /// A session-less handle: proposals through it are applied
    /// at-least-once with no result caching.
    pub fn noop(shard_id: u64) -> Self {
        ClientSession {
            client_id: 0,
            shard_id,
            series_id: SERIES_ID_NOOP,
            responded_to: 0,
        }
    }

    /// A fresh session about to be registered on the shard. `client_id`
    /// must be unique among live clients of the shard.
    pub fn new(shard_id: u64, client_id: u64) -> Self {
        ClientSession {
            client_id,
            shard_id,
            series_id: SERIES_ID_REGISTER,
            responded_to: 0,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.series_id == SERIES_ID_NOOP && self.client_id == 0
    }

    /// Put the session into the register state for `propose_session`.
    pub fn prepare_for_register(&mut self) {
        self.series_id = SERIES_ID_REGISTER;
    }

    /// Put the session into the unregister state for `propose_session`.
    pub fn prepare_for_unregister(&mut self) {
        self.series_id = SERIES_ID_UNREGISTER;
    }

    /// Switch a just-registered session to its first user proposal.
    pub fn prepare_for_propose(&mut self) {
        self.series_id = SERIES_ID_FIRST_PROPOSAL;
        self.responded_to = 0;
    }

    /// Acknowledge the current series and move to the next. Call after a
    /// proposal completed (successfully or not, once the outcome is
    /// known).
    pub fn proposal_completed(&mut self) {
        self.responded_to = self.series_id;
        self.series_id += 1;
    }

    pub(crate) fn is_session_op(&self) -> bool {
        self.series_id == SERIES_ID_REGISTER || self.series_id == SERIES_ID_UNREGISTER
    }
}
