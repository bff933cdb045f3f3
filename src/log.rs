use serde::{Deserialize, Serialize};

/// A command applied to the cache state machine. A closed sum type, encoded
/// once at the transport boundary (prost <-> this enum in `cluster::rpc`),
/// replacing the original prototype's untyped `{'operation': ..., 'key':
/// ...}` dict commands (spec section 9).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Set {
        key: String,
        value: Vec<u8>,
        ttl_millis: Option<u64>,
    },
    Delete {
        key: String,
    },
    Clear,
}

/// One entry in the replicated log. Index 0 is never stored; `Log::entry_at`
/// synthesizes the term-0 sentinel spec section 3 describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
}

/// Append-only replicated log, spec section 4.2. Entries are 1-indexed;
/// `entries[0]` in storage corresponds to log index 1.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Log {
    entries: Vec<LogEntry>,
}

const SENTINEL: LogEntry = LogEntry {
    term: 0,
    index: 0,
    command: Command::Clear,
};

impl Log {
    pub fn new() -> Self {
        Log {
            entries: Vec::new(),
        }
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Appends a new entry at `last_index() + 1` with the given term.
    /// Leader-only per spec section 4.2.
    pub fn append(&mut self, term: u64, command: Command) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            term,
            index,
            command,
        });
        index
    }

    /// Appends an already-built entry as-is (used by followers replicating
    /// a leader's entries, where index/term come from the leader).
    pub fn append_entry(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Entry at `index`, with index 0 returning the virtual sentinel.
    /// Returns `None` for `index > last_index()`.
    pub fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return Some(&SENTINEL);
        }
        self.entries.get((index - 1) as usize)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.entry_at(index).map(|e| e.term)
    }

    /// Discards entries with index >= `from`. A no-op if `from` is already
    /// past the end of the log.
    pub fn truncate_from(&mut self, from: u64) {
        if from == 0 {
            self.entries.clear();
            return;
        }
        self.entries.truncate((from - 1) as usize);
    }

    /// Log-completeness check used when granting votes (spec section 4.2):
    /// true iff the candidate's log is at least as up to date as ours.
    pub fn up_to_date(&self, candidate_last_index: u64, candidate_last_term: u64) -> bool {
        let our_last_term = self.last_term();
        candidate_last_term > our_last_term
            || (candidate_last_term == our_last_term && candidate_last_index >= self.last_index())
    }

    /// Entries in `[from, last_index()]`, bounded to at most `limit` entries,
    /// for a replication batch (spec section 4.3).
    pub fn slice_from(&self, from: u64, limit: usize) -> Vec<LogEntry> {
        if from > self.last_index() {
            return Vec::new();
        }
        let start = (from.max(1) - 1) as usize;
        self.entries
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str) -> Command {
        Command::Set {
            key: key.to_string(),
            value: vec![1],
            ttl_millis: None,
        }
    }

    #[test]
    fn sentinel_at_zero() {
        let log = Log::new();
        let e = log.entry_at(0).unwrap();
        assert_eq!(e.term, 0);
        assert_eq!(e.index, 0);
    }

    #[test]
    fn append_assigns_sequential_indices() {
        let mut log = Log::new();
        assert_eq!(log.append(1, set("a")), 1);
        assert_eq!(log.append(1, set("b")), 2);
        assert_eq!(log.append(2, set("c")), 3);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn truncate_from_discards_suffix() {
        let mut log = Log::new();
        log.append(1, set("a"));
        log.append(1, set("b"));
        log.append(1, set("c"));
        log.truncate_from(2);
        assert_eq!(log.last_index(), 1);
        assert!(log.entry_at(2).is_none());
    }

    #[test]
    fn up_to_date_prefers_higher_term() {
        let mut log = Log::new();
        log.append(1, set("a"));
        log.append(1, set("b"));
        // candidate with a lower index but a higher term is still up to date.
        assert!(log.up_to_date(0, 2));
        // candidate with same term needs to be caught up on index.
        assert!(!log.up_to_date(1, 1));
        assert!(log.up_to_date(2, 1));
    }

    #[test]
    fn slice_from_respects_batch_limit() {
        let mut log = Log::new();
        for k in ["a", "b", "c", "d"] {
            log.append(1, set(k));
        }
        let batch = log.slice_from(2, 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].index, 2);
        assert_eq!(batch[1].index, 3);
    }
}
