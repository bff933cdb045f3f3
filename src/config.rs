use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level config file (`config/cluster.toml` by default), loaded once at
/// startup. Mirrors the teacher's `Config::load` pattern: plain TOML, no
/// remote config source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub raft: RaftTiming,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Static, fixed-membership cluster description. No join/leave protocol —
/// every node knows every peer's address at startup (spec section 6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// node id -> RPC address, including this node's own entry.
    pub nodes: HashMap<String, SocketAddr>,
    /// node id -> client-facing HTTP address.
    pub http_addrs: HashMap<String, SocketAddr>,
}

impl ClusterConfig {
    pub fn majority(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn peers<'a>(&'a self, self_id: &str) -> impl Iterator<Item = (&'a str, SocketAddr)> + 'a {
        self.nodes
            .iter()
            .filter(move |(id, _)| id.as_str() != self_id)
            .map(|(id, addr)| (id.as_str(), *addr))
    }
}

/// Election/heartbeat/RPC timing, expressed in milliseconds in the TOML
/// file for readability, converted to `Duration` on access.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RaftTiming {
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_replication_batch_size")]
    pub replication_batch_size: usize,
}

fn default_election_timeout_min_ms() -> u64 {
    150
}
fn default_election_timeout_max_ms() -> u64 {
    300
}
fn default_heartbeat_interval_ms() -> u64 {
    50
}
fn default_rpc_timeout_ms() -> u64 {
    // Spec section 5: "bounded (suggested >= H, < T_min)" — with the
    // shipped H=50ms/T_min=150ms defaults that's [50, 150)ms, not the
    // original prototype's much looser multi-second HTTP client timeout.
    100
}
fn default_replication_batch_size() -> usize {
    64
}

impl RaftTiming {
    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl Default for RaftTiming {
    fn default() -> Self {
        RaftTiming {
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            replication_batch_size: default_replication_batch_size(),
        }
    }
}

/// Bounded LRU + TTL cache sizing (spec section 4.6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

fn default_max_size() -> usize {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_size: default_max_size(),
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config: Config =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        Ok(config)
    }
}
