use std::collections::HashMap;

use serde::Serialize;

use crate::log::{Log, LogEntry};
use crate::persistence::HardState;

/// A node's current role in the consensus protocol (spec section 4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Pure Raft state and transition logic, held behind a single lock in
/// [`crate::cluster::Node`]. Deliberately free of any I/O (no gRPC, no
/// tokio::time) so the election/commit rules can be read and checked in one
/// place; the surrounding `cluster` module drives timers and RPCs.
pub struct Consensus {
    pub node_id: String,
    pub role: Role,
    pub leader_id: Option<String>,

    // Durable (spec section 4.2, persisted by the caller after every
    // mutating call returns true/Some via `dirty`).
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: Log,

    // Volatile, reconstructed on restart.
    pub commit_index: u64,
    pub votes_received: usize,
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,
}

impl Consensus {
    pub fn new(node_id: String, hard_state: HardState) -> Self {
        Consensus {
            node_id,
            role: Role::Follower,
            leader_id: None,
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            log: hard_state.log,
            commit_index: 0,
            votes_received: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            log: self.log.clone(),
        }
    }

    /// Reverts to follower for `term`, as required whenever an RPC or
    /// response carries a higher term than ours (spec section 4.2).
    pub fn step_down(&mut self, term: u64) {
        self.current_term = term;
        self.voted_for = None;
        self.role = Role::Follower;
        self.votes_received = 0;
    }

    /// Begins a new election: increments the term, votes for self, and
    /// returns the `(term, last_log_index, last_log_term)` a RequestVote
    /// broadcast needs (spec section 4.1).
    pub fn start_election(&mut self) -> (u64, u64, u64) {
        self.current_term += 1;
        self.voted_for = Some(self.node_id.clone());
        self.role = Role::Candidate;
        self.leader_id = None;
        self.votes_received = 1;
        (self.current_term, self.log.last_index(), self.log.last_term())
    }

    /// Registers a granted vote for `self.current_term`; returns true once
    /// that tips the election into a majority for `cluster_size`.
    pub fn record_vote(&mut self, term: u64, cluster_size: usize) -> bool {
        if term != self.current_term || self.role != Role::Candidate {
            return false;
        }
        self.votes_received += 1;
        self.votes_received >= cluster_size / 2 + 1
    }

    /// Transitions to leader and seeds `next_index`/`match_index` for every
    /// peer (spec section 4.1).
    pub fn become_leader(&mut self, peers: &[String]) {
        self.role = Role::Leader;
        self.leader_id = Some(self.node_id.clone());
        let next = self.log.last_index() + 1;
        self.next_index = peers.iter().map(|p| (p.clone(), next)).collect();
        self.match_index = peers.iter().map(|p| (p.clone(), 0)).collect();
    }

    /// RequestVote handler (spec section 4.2 / section 6). Returns
    /// `(term, vote_granted)`; the caller persists hard state before
    /// replying whenever this returns `true` or bumps the term.
    pub fn handle_request_vote(
        &mut self,
        candidate_term: u64,
        candidate_id: &str,
        candidate_last_index: u64,
        candidate_last_term: u64,
    ) -> (u64, bool) {
        if candidate_term < self.current_term {
            return (self.current_term, false);
        }
        if candidate_term > self.current_term {
            self.step_down(candidate_term);
        }

        let can_vote = self.voted_for.is_none() || self.voted_for.as_deref() == Some(candidate_id);
        let log_ok = self.log.up_to_date(candidate_last_index, candidate_last_term);

        if can_vote && log_ok {
            self.voted_for = Some(candidate_id.to_string());
            (self.current_term, true)
        } else {
            (self.current_term, false)
        }
    }

    /// AppendEntries handler (spec section 4.2 / section 6). Returns
    /// `(term, success, conflict_index, conflict_term)`; on success the
    /// caller is responsible for advancing `commit_index` and waking the
    /// apply loop, and for persisting hard state before replying.
    pub fn handle_append_entries(
        &mut self,
        leader_term: u64,
        leader_id: &str,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> (u64, bool, u64, u64) {
        if leader_term < self.current_term {
            return (self.current_term, false, 0, 0);
        }
        if leader_term > self.current_term || self.role != Role::Follower {
            self.step_down(leader_term);
        }
        self.leader_id = Some(leader_id.to_string());

        match self.log.term_at(prev_log_index) {
            None => {
                // We don't have prev_log_index at all; point the leader at
                // the end of our log so it can back up efficiently.
                return (self.current_term, false, self.log.last_index() + 1, 0);
            }
            Some(term) if term != prev_log_term => {
                let conflict_term = term;
                let mut conflict_index = prev_log_index;
                while conflict_index > 1
                    && self.log.term_at(conflict_index - 1) == Some(conflict_term)
                {
                    conflict_index -= 1;
                }
                return (self.current_term, false, conflict_index, conflict_term);
            }
            Some(_) => {}
        }

        for entry in entries {
            match self.log.term_at(entry.index) {
                Some(existing_term) if existing_term == entry.term => continue,
                Some(_) => {
                    self.log.truncate_from(entry.index);
                    self.log.append_entry(entry);
                }
                None => self.log.append_entry(entry),
            }
        }

        if leader_commit > self.commit_index {
            self.commit_index = leader_commit.min(self.log.last_index());
        }

        (self.current_term, true, 0, 0)
    }

    /// Recomputes `commit_index` from `match_index`, honoring the rule that
    /// a leader may only commit by counting replicas for entries from its
    /// own current term (spec section 4.3) — committing a majority-stored
    /// prior-term entry directly is unsafe and must not happen here.
    pub fn advance_commit_index(&mut self, cluster_size: usize) -> bool {
        if self.role != Role::Leader {
            return false;
        }
        let majority = cluster_size / 2 + 1;
        let mut candidate = self.commit_index;
        let mut n = self.log.last_index();
        while n > self.commit_index {
            if self.log.term_at(n) == Some(self.current_term) {
                let replicated = 1 + self
                    .match_index
                    .values()
                    .filter(|&&m| m >= n)
                    .count();
                if replicated >= majority {
                    candidate = n;
                    break;
                }
            }
            n -= 1;
        }
        if candidate > self.commit_index {
            self.commit_index = candidate;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Command;

    fn set(key: &str) -> Command {
        Command::Set {
            key: key.to_string(),
            value: vec![1],
            ttl_millis: None,
        }
    }

    fn consensus(id: &str) -> Consensus {
        Consensus::new(id.to_string(), HardState::default())
    }

    #[test]
    fn start_election_increments_term_and_votes_self() {
        let mut c = consensus("n1");
        let (term, _, _) = c.start_election();
        assert_eq!(term, 1);
        assert_eq!(c.role, Role::Candidate);
        assert_eq!(c.voted_for.as_deref(), Some("n1"));
    }

    #[test]
    fn record_vote_reaches_majority_of_three() {
        let mut c = consensus("n1");
        c.start_election();
        assert!(!c.record_vote(1, 3));
        assert!(c.record_vote(1, 3));
    }

    #[test]
    fn stale_term_vote_request_is_rejected() {
        let mut c = consensus("n1");
        c.current_term = 5;
        let (term, granted) = c.handle_request_vote(3, "n2", 0, 0);
        assert_eq!(term, 5);
        assert!(!granted);
    }

    #[test]
    fn higher_term_append_entries_steps_down_candidate() {
        let mut c = consensus("n1");
        c.start_election();
        assert_eq!(c.role, Role::Candidate);
        let (term, success, _, _) = c.handle_append_entries(2, "n2", 0, 0, vec![], 0);
        assert_eq!(term, 2);
        assert!(success);
        assert_eq!(c.role, Role::Follower);
    }

    #[test]
    fn append_entries_rejects_mismatched_prev_log_term() {
        let mut c = consensus("n1");
        c.log.append(1, set("a"));
        let (_, success, conflict_index, conflict_term) =
            c.handle_append_entries(1, "leader", 1, 2, vec![], 0);
        assert!(!success);
        assert_eq!(conflict_index, 1);
        assert_eq!(conflict_term, 1);
    }

    #[test]
    fn commit_index_only_advances_on_current_term_entries() {
        let mut c = consensus("n1");
        c.log.append(1, set("a"));
        c.log.append(2, set("b"));
        c.current_term = 2;
        c.role = Role::Leader;
        c.match_index.insert("n2".to_string(), 1);
        c.match_index.insert("n3".to_string(), 1);

        // Entry at index 1 is term 1 (stale) and has a majority, but must
        // not be committed directly.
        assert!(!c.advance_commit_index(3));
        assert_eq!(c.commit_index, 0);

        c.match_index.insert("n2".to_string(), 2);
        assert!(c.advance_commit_index(3));
        assert_eq!(c.commit_index, 2);
    }
}
