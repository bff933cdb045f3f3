use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::rpc;
use crate::cluster::{Node, Role};

/// One long-lived task per peer, the leader's half of log replication
/// (spec section 4.3). Sends a heartbeat on every tick; when the peer is
/// behind, the heartbeat carries a batch of entries instead of being empty.
/// Runs for the lifetime of the process — it is a no-op whenever this node
/// is not leader, cheaply polling `Role` rather than being spawned/killed on
/// every role transition, which keeps the leader-election path free of task
/// bookkeeping.
pub fn spawn(node: Arc<Node>, peer_id: String) {
    tokio::spawn(async move {
        let peer_addr = node.config.cluster.nodes[&peer_id];
        let timeout = node.config.raft.rpc_timeout();
        let client = rpc::client(peer_addr, timeout);
        let mut ticker = tokio::time::interval(node.config.raft.heartbeat_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = node.leader_elected.notified() => {
                    // Just (re-)elected: send the heartbeat/catch-up
                    // AppendEntries right now instead of waiting out
                    // whatever's left of this peer's existing schedule,
                    // and restart the schedule from this moment (spec
                    // section 4.1).
                    ticker.reset();
                }
            }

            let (is_leader, term, next_index) = {
                let consensus = node.consensus.lock().await;
                if consensus.role != Role::Leader {
                    (false, consensus.current_term, 0)
                } else {
                    let next = *consensus.next_index.get(&peer_id).unwrap_or(&1);
                    (true, consensus.current_term, next)
                }
            };
            if !is_leader {
                continue;
            }

            let (prev_log_index, prev_log_term, entries) = {
                let consensus = node.consensus.lock().await;
                let prev_log_index = next_index.saturating_sub(1);
                let prev_log_term = consensus.log.term_at(prev_log_index).unwrap_or(0);
                let entries = consensus
                    .log
                    .slice_from(next_index, node.config.raft.replication_batch_size);
                (prev_log_index, prev_log_term, entries)
            };
            let sent_up_to = entries.last().map(|e| e.index);

            let response = rpc::send_append_entries(
                client.clone(),
                term,
                node.id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                node.commit_index().await,
            )
            .await;

            let Some(response) = response else {
                debug!("peer {peer_id} unreachable, will retry");
                continue;
            };

            if response.term > term {
                node.observe_higher_term(response.term).await;
                continue;
            }

            let mut consensus = node.consensus.lock().await;
            if consensus.role != Role::Leader || consensus.current_term != term {
                continue;
            }

            if response.success {
                if let Some(up_to) = sent_up_to {
                    consensus.match_index.insert(peer_id.clone(), up_to);
                    consensus.next_index.insert(peer_id.clone(), up_to + 1);
                }
                let cluster_size = node.config.cluster.nodes.len();
                if consensus.advance_commit_index(cluster_size) {
                    drop(consensus);
                    node.notify_committed();
                }
            } else {
                // Back up next_index using the conflict hint, or by one
                // entry if the follower gave none (spec section 4.3).
                let retry_from = if response.conflict_index > 0 {
                    response.conflict_index
                } else {
                    next_index.saturating_sub(1).max(1)
                };
                consensus.next_index.insert(peer_id.clone(), retry_from);
            }
        }
    });
}

pub fn spawn_all(node: Arc<Node>) {
    let peers: Vec<String> = node
        .config
        .cluster
        .peers(&node.id)
        .map(|(id, _)| id.to_string())
        .collect();
    let count = peers.len();
    for peer_id in peers {
        spawn(node.clone(), peer_id);
    }
    info!("spawned replication drivers for {count} peers");
}
