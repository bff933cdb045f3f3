use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::cluster::Node;
use crate::error::ClientError;
use crate::log::Command;

/// The thin client-facing JSON surface (spec section 6): read / write /
/// delete / clear / status / keys. No CORS layer, no dashboard, no static
/// file serving — those are the out-of-scope external collaborators spec
/// section 1 names.
pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/v1/keys/:key", get(get_key).put(set_key).delete(delete_key))
        .route("/v1/keys", get(list_keys))
        .route("/v1/clear", post(clear))
        .route("/v1/status", get(status))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(node)
}

#[derive(Deserialize)]
struct SetBody {
    value: serde_json::Value,
    ttl_millis: Option<u64>,
}

#[derive(Serialize)]
struct GetResponse {
    value: serde_json::Value,
}

#[derive(Serialize)]
struct WriteResponse {
    index: u64,
}

async fn get_key(
    State(node): State<Arc<Node>>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>, ClientError> {
    let raw = {
        let mut cache = node.cache.lock().await;
        cache.get(&key, SystemTime::now())
    };
    let raw = raw.ok_or(ClientError::NotFound)?;
    let value: serde_json::Value =
        serde_json::from_slice(&raw).unwrap_or(serde_json::Value::Null);
    Ok(Json(GetResponse { value }))
}

async fn set_key(
    State(node): State<Arc<Node>>,
    Path(key): Path<String>,
    Json(body): Json<SetBody>,
) -> Result<Json<WriteResponse>, ClientError> {
    let value = serde_json::to_vec(&body.value).map_err(|_| ClientError::Unavailable)?;
    let command = Command::Set {
        key,
        value,
        ttl_millis: body.ttl_millis,
    };
    let index = node.propose(command).await?;
    Ok(Json(WriteResponse { index }))
}

async fn delete_key(
    State(node): State<Arc<Node>>,
    Path(key): Path<String>,
) -> Result<Json<WriteResponse>, ClientError> {
    let index = node.propose(Command::Delete { key }).await?;
    Ok(Json(WriteResponse { index }))
}

async fn list_keys(State(node): State<Arc<Node>>) -> Json<Vec<String>> {
    let mut cache = node.cache.lock().await;
    Json(cache.keys(SystemTime::now()))
}

async fn clear(State(node): State<Arc<Node>>) -> Result<Json<WriteResponse>, ClientError> {
    let index = node.propose(Command::Clear).await?;
    Ok(Json(WriteResponse { index }))
}

async fn status(State(node): State<Arc<Node>>) -> Json<crate::cluster::NodeStatus> {
    Json(node.status().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, ClusterConfig, Config, RaftTiming};
    use std::collections::HashMap;
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
    async fn get_on_empty_cache_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new("n1".to_string(), single_node_config(dir.path())).unwrap();
        let result = get_key(State(node), Path("missing".to_string())).await;
        assert!(matches!(result, Err(ClientError::NotFound)));
    }

    #[tokio::test]
    async fn write_on_follower_reports_not_leader() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new("n1".to_string(), single_node_config(dir.path())).unwrap();
        let body = SetBody {
            value: serde_json::json!("v"),
            ttl_millis: None,
        };
        let result = set_key(State(node), Path("k".to_string()), Json(body)).await;
        assert!(matches!(result, Err(ClientError::NotLeader { .. })));
    }

    #[tokio::test]
    async fn set_then_get_then_delete_round_trips_through_the_leader() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new("n1".to_string(), single_node_config(dir.path())).unwrap();
        {
            let mut consensus = node.consensus.lock().await;
            consensus.role = crate::cluster::Role::Leader;
            consensus.current_term = 1;
        }
        tokio::spawn(crate::cluster::run_apply_loop(node.clone()));

        let body = SetBody {
            value: serde_json::json!({"hello": "world"}),
            ttl_millis: None,
        };
        let write = set_key(State(node.clone()), Path("k".to_string()), Json(body))
            .await
            .unwrap();
        assert_eq!(write.0.index, 1);

        // propose() only resolves once the apply loop has caught up, so the
        // value is already visible by the time the write returns.
        let read = get_key(State(node.clone()), Path("k".to_string()))
            .await
            .unwrap();
        assert_eq!(read.0.value, serde_json::json!({"hello": "world"}));

        let keys = list_keys(State(node.clone())).await;
        assert_eq!(keys.0, vec!["k".to_string()]);

        delete_key(State(node.clone()), Path("k".to_string()))
            .await
            .unwrap();
        let after_delete = get_key(State(node.clone()), Path("k".to_string())).await;
        assert!(matches!(after_delete, Err(ClientError::NotFound)));

        let status = status(State(node)).await;
        assert_eq!(status.0.commit_index, 2);
    }
}
