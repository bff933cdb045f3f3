use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{info, warn};

use crate::cache::Cache;
use crate::config::Config;
use crate::error::{ClientError, PersistenceError};
use crate::log::{Command, LogEntry};
use crate::persistence::Store;

pub mod consensus;
pub mod replication;
pub mod rpc;

pub use consensus::Role;
use consensus::Consensus;

/// A client proposal that has been appended but not yet observed committed;
/// woken by the apply loop once its index is applied (spec section 4.4).
/// Keyed by log index, but each waiter also records the term it was
/// proposed under: a new leader can truncate-and-overwrite the same index
/// with a different entry (`Consensus::handle_append_entries`'s conflict
/// branch), and the apply loop must only report success to a waiter whose
/// recorded term still matches what actually landed at that index — never
/// "any entry applied at this index", which would falsely ack a write a
/// step-down silently discarded (spec section 4.3/7).
type Waiters = HashMap<u64, Vec<(u64, oneshot::Sender<bool>)>>;

/// The shared state every background task (election timer, per-peer
/// replication driver, apply loop) and the client-facing API operate on.
/// `consensus` and `cache` are separate locks so a read against the cache
/// never blocks on Raft bookkeeping (spec section 5).
pub struct Node {
    pub id: String,
    pub config: Config,
    pub consensus: Mutex<Consensus>,
    pub cache: Mutex<Cache>,
    store: Store,
    commit_notify: Notify,
    waiters: Mutex<Waiters>,
    /// Mirrors the apply loop's `last_applied`, for the `status` operation
    /// (spec section 6: status reports both commit and applied indices).
    /// Written only by `run_apply_loop`; read by `Node::status`.
    last_applied: AtomicU64,
    /// Woken by a valid AppendEntries or a granted vote, so the election
    /// timer restarts its countdown instead of firing on a schedule that
    /// ignores a perfectly healthy leader (spec section 4.1, section 5).
    election_reset: Notify,
    /// Woken the instant this node becomes leader, so every per-peer
    /// replication task sends its first heartbeat immediately instead of
    /// waiting out whatever is left of its pre-existing tick schedule
    /// (spec section 4.1: heartbeat "immediately ... before first client
    /// op"). Multi-consumer (one replication task per peer), so this uses
    /// `notify_waiters`, unlike the single-consumer `Notify`s above.
    pub(crate) leader_elected: Notify,
}

impl Node {
    pub fn new(id: String, config: Config) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = Store::new(&config.data_dir, &id);
        let hard_state = store.load()?;
        let cache = Cache::new(&config.cache);
        let consensus = Consensus::new(id.clone(), hard_state);

        Ok(Arc::new(Node {
            id,
            cache: Mutex::new(cache),
            consensus: Mutex::new(consensus),
            store,
            commit_notify: Notify::new(),
            waiters: Mutex::new(HashMap::new()),
            last_applied: AtomicU64::new(0),
            election_reset: Notify::new(),
            leader_elected: Notify::new(),
            config,
        }))
    }

    fn persist(&self, consensus: &Consensus) -> Result<(), PersistenceError> {
        self.store.save(&consensus.hard_state())
    }

    pub async fn commit_index(&self) -> u64 {
        self.consensus.lock().await.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    /// Explicit final flush of hard state on graceful shutdown (spec
    /// section 6: "persist state" is named as its own step). Every
    /// mutation is already durable before the RPC reply that caused it
    /// (section 4.2), so this is a no-op in the common case — it only
    /// matters if the process exits between a mutation and its next RPC
    /// reply, which should never happen but costs nothing to cover.
    pub async fn persist_current(&self) -> Result<(), PersistenceError> {
        let consensus = self.consensus.lock().await;
        self.persist(&consensus)
    }

    /// Wakes the (single) apply loop task. Uses `notify_one`, not
    /// `notify_waiters`: the latter only wakes tasks already parked in
    /// `.notified()` and loses the signal entirely if the apply loop is
    /// between iterations rather than actually waiting — `notify_one`
    /// stores a permit for that case instead.
    pub fn notify_committed(&self) {
        self.commit_notify.notify_one();
    }

    /// RequestVote handler invoked from the gRPC service (spec section 4.2).
    pub async fn on_request_vote(
        &self,
        term: u64,
        candidate_id: &str,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<(u64, bool), PersistenceError> {
        let mut consensus = self.consensus.lock().await;
        let term_before = consensus.current_term;
        let (resp_term, granted) =
            consensus.handle_request_vote(term, candidate_id, last_log_index, last_log_term);
        if granted || resp_term != term_before {
            self.persist(&consensus)?;
        }
        drop(consensus);
        if granted {
            self.election_reset.notify_one();
        }
        Ok((resp_term, granted))
    }

    /// AppendEntries handler invoked from the gRPC service (spec section
    /// 4.2). Persists before replying whenever the log or hard state
    /// changed, and wakes the apply loop when the commit index advances.
    pub async fn on_append_entries(
        &self,
        term: u64,
        leader_id: &str,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Result<(u64, bool, u64, u64), PersistenceError> {
        let mut consensus = self.consensus.lock().await;
        let term_before = consensus.current_term;
        let voted_for_before = consensus.voted_for.clone();
        let commit_before = consensus.commit_index;
        let stale = term < term_before;
        let result = consensus.handle_append_entries(
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        );
        if result.1 || result.0 != term_before || consensus.voted_for != voted_for_before {
            self.persist(&consensus)?;
        }
        let commit_advanced = consensus.commit_index > commit_before;
        drop(consensus);
        if commit_advanced {
            self.notify_committed();
        }
        if !stale {
            // A contact from a current-or-newer-term leader resets the
            // timer even when `success=false` (log mismatch) — the leader
            // is still alive and will retry with an earlier prevLogIndex.
            self.election_reset.notify_one();
        }
        Ok(result)
    }

    pub async fn observe_higher_term(&self, term: u64) {
        let mut consensus = self.consensus.lock().await;
        if term > consensus.current_term {
            consensus.step_down(term);
            let _ = self.persist(&consensus);
        }
    }

    /// Client-facing entry point for a write (spec section 4.3, section 6).
    /// Appends to the leader's own log, then waits for the entry to be
    /// committed (i.e. replicated to a majority) before returning success —
    /// unlike a naive implementation that reports success right after
    /// sending a single AppendEntries, which would let a client observe a
    /// write that a subsequent leader change could still discard.
    pub async fn propose(&self, command: Command) -> Result<u64, ClientError> {
        let (index, rx) = {
            let mut consensus = self.consensus.lock().await;
            if consensus.role != Role::Leader {
                return Err(ClientError::NotLeader {
                    leader_hint: consensus.leader_id.clone(),
                });
            }
            let term = consensus.current_term;
            let index = consensus.log.append(term, command);
            self.persist(&consensus).map_err(|_| ClientError::Unavailable)?;

            // The waiter must be registered before we let the apply loop
            // see this index as committed — both below and while still
            // holding the consensus lock, so nothing else can advance
            // commit_index past `index` in between and have the apply
            // loop race past it before anyone is listening. It is tagged
            // with `term` so the apply loop can tell a genuine commit of
            // this proposal apart from a different leader's entry later
            // overwriting the same index.
            let (tx, rx) = oneshot::channel();
            self.waiters.lock().await.entry(index).or_default().push((term, tx));

            // A leader always counts itself toward quorum, so a cluster of
            // one (or an entry that is already majority-replicated on
            // peers by the time this append lands) can commit right away
            // instead of waiting on the next per-peer replication tick.
            if consensus.advance_commit_index(self.config.cluster.nodes.len()) {
                self.notify_committed();
            }
            (index, rx)
        };

        let timeout = self.config.raft.rpc_timeout() * 4;
        match tokio::time::timeout(timeout, rx).await {
            // The entry actually committed at `index` is the one this call
            // proposed: accepted.
            Ok(Ok(true)) => Ok(index),
            // A different leader's entry landed at `index` instead — this
            // proposal was discarded by a step-down, never committed. Spec
            // section 7: surfaced as not-leader, not as a false accept.
            Ok(Ok(false)) => {
                let leader_hint = self.consensus.lock().await.leader_id.clone();
                Err(ClientError::NotLeader { leader_hint })
            }
            _ => Err(ClientError::Unknown { index }),
        }
    }
}

/// Drains newly committed log entries into the cache state machine, one
/// index at a time, and wakes any `propose` call waiting on that index.
/// Decoupled from `on_append_entries`/`advance_commit_index` via
/// `commit_notify` so a burst of AppendEntries RPCs never blocks on cache
/// application (spec section 9).
pub async fn run_apply_loop(node: Arc<Node>) {
    let mut last_applied: u64 = 0;
    loop {
        let commit_index = node.commit_index().await;
        while last_applied < commit_index {
            let next = last_applied + 1;
            let entry = {
                let consensus = node.consensus.lock().await;
                consensus.log.entry_at(next).cloned()
            };
            let applied_term = entry.as_ref().map(|e| e.term);
            if let Some(entry) = &entry {
                let mut cache = node.cache.lock().await;
                cache.apply(&entry.command, std::time::SystemTime::now());
            }
            last_applied = next;
            node.last_applied.store(last_applied, Ordering::Release);

            if let Some(waiters) = node.waiters.lock().await.remove(&next) {
                for (expected_term, tx) in waiters {
                    // `true` only if the entry actually applied at this
                    // index is the one that waiter's proposal appended —
                    // otherwise a step-down overwrote it and the waiter
                    // must see that as a rejection, not a false accept.
                    let _ = tx.send(applied_term == Some(expected_term));
                }
            }
        }
        node.commit_notify.notified().await;
    }
}

/// Drives the election timer: resets on any valid AppendEntries/RequestVote
/// grant, and starts a new election once it fires with nobody heard from
/// (spec section 4.1). Randomized within `[election_timeout_min,
/// election_timeout_max)` so split votes are rare (spec section 9).
pub async fn run_election_timer(node: Arc<Node>) {
    loop {
        let role = node.consensus.lock().await.role;
        if role == Role::Leader {
            // Leaders don't run for election against themselves; just poll
            // at heartbeat cadence for a step-down.
            tokio::time::sleep(node.config.raft.heartbeat_interval()).await;
            continue;
        }

        let timeout = {
            let min = node.config.raft.election_timeout_min_ms;
            let max = node.config.raft.election_timeout_max_ms;
            Duration::from_millis(rand::thread_rng().gen_range(min..=max))
        };

        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                let still_eligible = node.consensus.lock().await.role != Role::Leader;
                if still_eligible {
                    run_election(node.clone()).await;
                }
            }
            _ = node.election_reset.notified() => {
                // Heard from a current leader or just granted a vote;
                // restart the countdown with a fresh random timeout.
            }
        }
    }
}

async fn run_election(node: Arc<Node>) {
    let peers: Vec<(String, std::net::SocketAddr)> = node
        .config
        .cluster
        .peers(&node.id)
        .map(|(id, addr)| (id.to_string(), addr))
        .collect();
    let cluster_size = node.config.cluster.nodes.len();

    let (term, last_log_index, last_log_term) = {
        let mut consensus = node.consensus.lock().await;
        let result = consensus.start_election();
        if let Err(e) = node.persist(&consensus) {
            warn!("failed to persist election state: {e}");
        }
        result
    };
    info!("node {} starting election for term {term}", node.id);

    if cluster_size == 1 {
        let mut consensus = node.consensus.lock().await;
        consensus.become_leader(&[]);
        drop(consensus);
        node.leader_elected.notify_waiters();
        info!("node {} elected leader unopposed for term {term}", node.id);
        return;
    }

    let timeout = node.config.raft.rpc_timeout();
    // Votes are collected in completion order via a channel, not spawn
    // order via sequential `JoinHandle::await`: with the latter, a single
    // slow or unreachable peer sorted early in `peers` would stall
    // recognition of an already-won majority for up to the full RPC
    // timeout, even though faster peers already granted their votes (spec
    // section 8, S3's 2*T_max re-election bound).
    let (tx, mut rx) = tokio::sync::mpsc::channel(peers.len().max(1));
    for (peer_id, addr) in peers {
        let node = node.clone();
        let candidate_id = node.id.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let client = rpc::client(addr, timeout);
            let response =
                rpc::send_request_vote(client, term, candidate_id, last_log_index, last_log_term)
                    .await;
            let _ = tx.send((peer_id, response)).await;
        });
    }
    drop(tx);

    while let Some((_peer_id, response)) = rx.recv().await {
        let Some(response) = response else {
            continue;
        };
        if response.term > term {
            node.observe_higher_term(response.term).await;
            return;
        }
        if response.vote_granted {
            let won = node.consensus.lock().await.record_vote(term, cluster_size);
            if won {
                let peer_ids: Vec<String> = node
                    .config
                    .cluster
                    .peers(&node.id)
                    .map(|(id, _)| id.to_string())
                    .collect();
                let mut consensus = node.consensus.lock().await;
                let became_leader =
                    consensus.role == Role::Candidate && consensus.current_term == term;
                if became_leader {
                    consensus.become_leader(&peer_ids);
                }
                drop(consensus);
                if became_leader {
                    node.leader_elected.notify_waiters();
                    info!("node {} elected leader for term {term}", node.id);
                }
                return;
            }
        }
    }
}

pub fn spawn_background_tasks(node: Arc<Node>) {
    tokio::spawn(run_election_timer(node.clone()));
    tokio::spawn(run_apply_loop(node.clone()));
    replication::spawn_all(node);
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeStatus {
    pub id: String,
    pub role: Role,
    pub current_term: u64,
    pub leader_id: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub cache_len: usize,
    pub cache_stats: crate::cache::Stats,
}

impl Node {
    pub async fn status(&self) -> NodeStatus {
        let consensus = self.consensus.lock().await;
        let cache = self.cache.lock().await;
        NodeStatus {
            id: self.id.clone(),
            role: consensus.role,
            current_term: consensus.current_term,
            leader_id: consensus.leader_id.clone(),
            commit_index: consensus.commit_index,
            last_applied: self.last_applied.load(Ordering::Acquire),
            last_log_index: consensus.log.last_index(),
            cache_len: cache.len(),
            cache_stats: cache.stats(),
        }
    }

    /// Returns the client-facing HTTP address of the last-known leader, if
    /// any, so the API layer can answer `NotLeader` with a useful hint.
    pub async fn leader_http_addr(&self) -> Option<std::net::SocketAddr> {
        let leader_id = self.consensus.lock().await.leader_id.clone()?;
        self.config.cluster.http_addrs.get(&leader_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, ClusterConfig, RaftTiming};
    use std::net::SocketAddr;

    fn single_node_config(dir: &std::path::Path) -> Config {
        let mut nodes = HashMap::new();
        nodes.insert("n1".to_string(), "127.0.0.1:0".parse::<SocketAddr>().unwrap());
        let mut http_addrs = HashMap::new();
        http_addrs.insert("n1".to_string(), "127.0.0.1:0".parse::<SocketAddr>().unwrap());
        Config {
            cluster: ClusterConfig { nodes, http_addrs },
            raft: RaftTiming::default(),
            cache: CacheConfig { max_size: 10 },
            data_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn follower_rejects_proposals_with_leader_hint() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new("n1".to_string(), single_node_config(dir.path())).unwrap();
        node.consensus.lock().await.leader_id = Some("n2".to_string());

        let err = node.propose(Command::Clear).await.unwrap_err();
        match err {
            ClientError::NotLeader { leader_hint } => assert_eq!(leader_hint.as_deref(), Some("n2")),
            other => panic!("expected NotLeader, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_node_election_becomes_leader_unopposed() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new("n1".to_string(), single_node_config(dir.path())).unwrap();
        run_election(node.clone()).await;
        assert_eq!(node.consensus.lock().await.role, Role::Leader);
    }

    #[tokio::test]
    async fn propose_on_single_node_leader_commits_and_applies() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new("n1".to_string(), single_node_config(dir.path())).unwrap();
        run_election(node.clone()).await;
        assert_eq!(node.consensus.lock().await.role, Role::Leader);

        tokio::spawn(run_apply_loop(node.clone()));

        let index = node
            .propose(Command::Set {
                key: "k".to_string(),
                value: vec![1, 2, 3],
                ttl_millis: None,
            })
            .await
            .unwrap();
        assert_eq!(index, 1);

        let value = node.cache.lock().await.get("k", std::time::SystemTime::now());
        assert_eq!(value, Some(vec![1, 2, 3]));
    }
}
