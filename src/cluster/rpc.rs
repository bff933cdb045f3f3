use std::sync::Arc;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::cluster::Node;
use crate::log::{Command, LogEntry};

pub mod raft_proto {
    tonic::include_proto!("raft");
}

use raft_proto::raft_rpc_client::RaftRpcClient;
use raft_proto::raft_rpc_server::RaftRpc;
use raft_proto::{
    command::Kind, AppendEntriesRequest, AppendEntriesResponse, ClearCommand, Command as CommandProto,
    DeleteCommand, LogEntryProto, SetCommand, VoteRequest, VoteResponse,
};

impl From<&Command> for CommandProto {
    fn from(command: &Command) -> Self {
        let kind = match command {
            Command::Set {
                key,
                value,
                ttl_millis,
            } => Kind::Set(SetCommand {
                key: key.clone(),
                value: value.clone(),
                ttl_millis: *ttl_millis,
            }),
            Command::Delete { key } => Kind::Delete(DeleteCommand { key: key.clone() }),
            Command::Clear => Kind::Clear(ClearCommand {}),
        };
        CommandProto { kind: Some(kind) }
    }
}

impl TryFrom<CommandProto> for Command {
    type Error = Status;

    fn try_from(proto: CommandProto) -> Result<Self, Self::Error> {
        match proto.kind {
            Some(Kind::Set(s)) => Ok(Command::Set {
                key: s.key,
                value: s.value,
                ttl_millis: s.ttl_millis,
            }),
            Some(Kind::Delete(d)) => Ok(Command::Delete { key: d.key }),
            Some(Kind::Clear(_)) => Ok(Command::Clear),
            None => Err(Status::invalid_argument("command missing kind")),
        }
    }
}

impl From<&LogEntry> for LogEntryProto {
    fn from(entry: &LogEntry) -> Self {
        LogEntryProto {
            term: entry.term,
            index: entry.index,
            command: Some(CommandProto::from(&entry.command)),
        }
    }
}

impl TryFrom<LogEntryProto> for LogEntry {
    type Error = Status;

    fn try_from(proto: LogEntryProto) -> Result<Self, Self::Error> {
        let command = proto
            .command
            .ok_or_else(|| Status::invalid_argument("log entry missing command"))?
            .try_into()?;
        Ok(LogEntry {
            term: proto.term,
            index: proto.index,
            command,
        })
    }
}

/// Server-side adapter: the tonic service that exposes `Node`'s consensus
/// engine to peers (spec section 6).
pub struct RaftService {
    node: Arc<Node>,
}

impl RaftService {
    pub fn new(node: Arc<Node>) -> Self {
        RaftService { node }
    }
}

#[tonic::async_trait]
impl RaftRpc for RaftService {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        let (term, vote_granted) = self
            .node
            .on_request_vote(req.term, &req.candidate_id, req.last_log_index, req.last_log_term)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(VoteResponse { term, vote_granted }))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        let entries = req
            .entries
            .into_iter()
            .map(LogEntry::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let (term, success, conflict_index, conflict_term) = self
            .node
            .on_append_entries(
                req.term,
                &req.leader_id,
                req.prev_log_index,
                req.prev_log_term,
                entries,
                req.leader_commit,
            )
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(AppendEntriesResponse {
            term,
            success,
            conflict_index,
            conflict_term,
        }))
    }
}

/// Lazily-connecting client to a peer's `RaftRpc` service. Connection
/// establishment is deferred to the first call (`connect_lazy`), so a peer
/// that is briefly unreachable at startup does not block node boot — the
/// replication driver simply treats the next failed RPC as "peer down" and
/// retries on its own schedule (spec section 5).
pub fn client(addr: std::net::SocketAddr, timeout: Duration) -> RaftRpcClient<Channel> {
    let endpoint = Endpoint::from_shared(format!("http://{addr}"))
        .expect("valid peer address")
        .timeout(timeout)
        .connect_timeout(timeout);
    RaftRpcClient::new(endpoint.connect_lazy())
}

pub async fn send_request_vote(
    mut client: RaftRpcClient<Channel>,
    term: u64,
    candidate_id: String,
    last_log_index: u64,
    last_log_term: u64,
) -> Option<VoteResponse> {
    let req = VoteRequest {
        term,
        candidate_id,
        last_log_index,
        last_log_term,
    };
    match client.request_vote(req).await {
        Ok(resp) => Some(resp.into_inner()),
        Err(e) => {
            debug!("request_vote rpc failed: {e}");
            None
        }
    }
}

pub async fn send_append_entries(
    mut client: RaftRpcClient<Channel>,
    term: u64,
    leader_id: String,
    prev_log_index: u64,
    prev_log_term: u64,
    entries: Vec<LogEntry>,
    leader_commit: u64,
) -> Option<AppendEntriesResponse> {
    let req = AppendEntriesRequest {
        term,
        leader_id,
        prev_log_index,
        prev_log_term,
        entries: entries.iter().map(LogEntryProto::from).collect(),
        leader_commit,
    };
    match client.append_entries(req).await {
        Ok(resp) => Some(resp.into_inner()),
        Err(e) => {
            warn!("append_entries rpc failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_command_round_trips_through_the_wire_type() {
        let command = Command::Set {
            key: "k".to_string(),
            value: vec![1, 2, 3],
            ttl_millis: Some(60_000),
        };
        let proto = CommandProto::from(&command);
        let back = Command::try_from(proto).unwrap();
        assert_eq!(command, back);
    }

    #[test]
    fn clear_command_round_trips() {
        let proto = CommandProto::from(&Command::Clear);
        assert_eq!(Command::try_from(proto).unwrap(), Command::Clear);
    }

    #[test]
    fn command_proto_with_no_kind_is_rejected() {
        let proto = CommandProto { kind: None };
        assert!(Command::try_from(proto).is_err());
    }

    #[test]
    fn log_entry_round_trips_through_the_wire_type() {
        let entry = LogEntry {
            term: 3,
            index: 7,
            command: Command::Delete {
                key: "k".to_string(),
            },
        };
        let proto = LogEntryProto::from(&entry);
        let back = LogEntry::try_from(proto).unwrap();
        assert_eq!(entry, back);
    }
}
