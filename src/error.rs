use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors loading the static cluster config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0:?}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config file {0:?}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
}

/// Errors from the durable term/vote/log store (spec section 4.2:
/// "state must be durable before replying to the RPC that caused it").
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read hard state from {0:?}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to decode hard state from {0:?}: {1}")]
    Decode(PathBuf, #[source] bincode::Error),
    #[error("failed to write hard state to {0:?}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
    #[error("failed to encode hard state: {0}")]
    Encode(#[source] bincode::Error),
}

/// Client-visible outcome of a write proposal (spec section 7).
///
/// This is not a Rust `Error` in the usual sense — a redirect or an
/// unavailable response are expected, frequent outcomes of a healthy
/// cluster, not failures of the process. It is surfaced at the client
/// boundary as a typed enum rather than collapsed into "ok or anyhow::Error"
/// so callers can distinguish "try another node" from "something broke".
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClientError {
    /// This node is not the leader; `leader_hint` names the last-known
    /// leader, if any.
    NotLeader { leader_hint: Option<String> },
    /// This node is not the leader and has no idea who is.
    Unavailable,
    /// The proposal was appended but the client timeout elapsed before it
    /// committed. It may still commit later, or be overwritten by a new
    /// leader's log — idempotency of retries is the caller's
    /// responsibility (spec section 7).
    Unknown { index: u64 },
    /// The requested key does not exist (or has expired).
    NotFound,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotLeader { leader_hint } => {
                write!(f, "not leader, hint={:?}", leader_hint)
            }
            ClientError::Unavailable => write!(f, "unavailable"),
            ClientError::Unknown { index } => write!(f, "unknown outcome for index {index}"),
            ClientError::NotFound => write!(f, "not found"),
        }
    }
}

impl std::error::Error for ClientError {}

impl IntoResponse for ClientError {
    fn into_response(self) -> Response {
        let status = match &self {
            ClientError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            ClientError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ClientError::Unknown { .. } => StatusCode::ACCEPTED,
            ClientError::NotFound => StatusCode::NOT_FOUND,
        };
        (status, Json(ErrorBody { error: self })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    #[serde(flatten)]
    error: ClientError,
}
