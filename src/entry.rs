use std::fmt;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

/// Series id of a proposal that carries no client session.
///
/// Entries proposed with the no-op series id bypass session bookkeeping
/// entirely: they are applied at most once per delivery and never cached.
pub const SERIES_ID_NOOP: u64 = 0;

/// First series id a registered client uses for user proposals.
pub const SERIES_ID_FIRST_PROPOSAL: u64 = 1;

/// Reserved series id marking a session-register proposal.
pub const SERIES_ID_REGISTER: u64 = u64::MAX;

/// Reserved series id marking a session-unregister proposal.
pub const SERIES_ID_UNREGISTER: u64 = u64::MAX - 1;

/// Serialized per-entry overhead excluding the user payload.
///
/// Payload admission subtracts this from `max_in_mem_log_size` so that an
/// admitted proposal is guaranteed to fit the in-memory log even after the
/// bookkeeping fields are accounted for.
pub const ENTRY_NON_CMD_FIELDS_SIZE: u64 = 8 * 7;

/// The kind of a replicated log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub enum EntryType {
    /// A user proposal, carried to the state machine.
    Normal,

    /// A membership change. Applied by the host, not the user state machine.
    ConfigChange,

    /// Internal bookkeeping entry. Witness replicas receive only these.
    Metadata,
}

impl Default for EntryType {
    fn default() -> Self {
        EntryType::Normal
    }
}

/// A replicated log entry.
///
/// `index` is assigned by the leader and is contiguous within a replica's
/// log; `term` is non-decreasing along indices. The `client_id`,
/// `series_id` and `responded_to` triple carries the client session used
/// for exactly-once application, see [`crate::sm::Session`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub entry_type: EntryType,

    pub client_id: u64,
    pub series_id: u64,
    pub responded_to: u64,

    /// Correlates an applied entry back to the pending request that
    /// proposed it. Unique per origin replica, zero on entries nobody is
    /// waiting for.
    pub key: u64,

    pub payload: Bytes,
}

impl Entry {
    pub fn new(index: u64, term: u64) -> Self {
        Entry {
            index,
            term,
            ..Default::default()
        }
    }

    /// Whether this entry carries a client session.
    pub fn is_session_managed(&self) -> bool {
        self.client_id != 0 && self.series_id != SERIES_ID_NOOP
    }

    pub fn is_new_session_request(&self) -> bool {
        self.series_id == SERIES_ID_REGISTER
    }

    pub fn is_end_session_request(&self) -> bool {
        self.series_id == SERIES_ID_UNREGISTER
    }

    /// A proposal that updates the user state machine, i.e. not a session
    /// lifecycle request.
    pub fn is_update_entry(&self) -> bool {
        self.entry_type == EntryType::Normal && !self.is_new_session_request() && !self.is_end_session_request()
    }

    pub fn is_config_change(&self) -> bool {
        self.entry_type == EntryType::ConfigChange
    }

    pub fn is_noop_session(&self) -> bool {
        self.series_id == SERIES_ID_NOOP
    }

    /// In-memory footprint used for byte budgets on reads and applies.
    pub fn size_in_bytes(&self) -> u64 {
        self.payload.len() as u64 + ENTRY_NON_CMD_FIELDS_SIZE
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{:?}", self.term, self.index, self.entry_type)
    }
}

/// Total in-memory footprint of a slice of entries.
pub fn entries_size(entries: &[Entry]) -> u64 {
    entries.iter().map(|e| e.size_in_bytes()).sum()
}

#[cfg(test)]
mod entry_test {
    use super::*;

    #[test]
    fn test_session_classification() -> anyhow::Result<()> {
        let mut e = Entry::new(1, 1);
        e.client_id = 100;
        e.series_id = SERIES_ID_REGISTER;
        assert!(e.is_new_session_request());
        assert!(!e.is_update_entry());

        e.series_id = SERIES_ID_UNREGISTER;
        assert!(e.is_end_session_request());
        assert!(!e.is_update_entry());

        e.series_id = SERIES_ID_FIRST_PROPOSAL;
        assert!(e.is_update_entry());
        assert!(e.is_session_managed());

        e.series_id = SERIES_ID_NOOP;
        assert!(!e.is_session_managed());

        Ok(())
    }

    #[test]
    fn test_size_in_bytes() -> anyhow::Result<()> {
        let mut e = Entry::new(1, 1);
        assert_eq!(ENTRY_NON_CMD_FIELDS_SIZE, e.size_in_bytes());

        e.payload = bytes::Bytes::from_static(b"0123456789");
        assert_eq!(ENTRY_NON_CMD_FIELDS_SIZE + 10, e.size_in_bytes());
        assert_eq!(2 * (ENTRY_NON_CMD_FIELDS_SIZE + 10), entries_size(&[e.clone(), e]));

        Ok(())
    }
}
