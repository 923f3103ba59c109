//! Status client for a single cluster node.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use thiserror::Error;

const STATUS_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("status request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to decode status payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("node unreachable: {0}")]
    Unreachable(String),
}

/// Sync progress of a node as reported by its RPC `/status` endpoint. The
/// node encodes the height as a decimal string and the block time as an
/// ISO 8601 timestamp.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct SyncInfo {
    #[serde_as(as = "DisplayFromStr")]
    pub latest_block_height: u64,

    pub latest_block_time: DateTime<Utc>,
}

/// A point-in-time snapshot of a node's state. Snapshots are immutable and
/// may be stale the moment they arrive.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeStatus {
    pub sync_info: SyncInfo,
}

#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    result: NodeStatus,
}

/// Anything that can report a node's current status. Pollers are generic
/// over this so tests can script a source instead of running a node.
pub trait StatusSource {
    fn status(&self) -> Result<NodeStatus, ClientError>;
}

/// Blocking HTTP client for one node's RPC endpoint.
pub struct NodeClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl NodeClient {
    pub fn new(host: &str, rpc_port: u16) -> Self {
        Self {
            base_url: format!("http://{host}:{rpc_port}"),
            http: reqwest::blocking::Client::new(),
        }
    }

    pub fn loopback(rpc_port: u16) -> Self {
        Self::new("127.0.0.1", rpc_port)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl StatusSource for NodeClient {
    fn status(&self) -> Result<NodeStatus, ClientError> {
        let body = self
            .http
            .get(format!("{}/status", self.base_url))
            .timeout(STATUS_REQUEST_TIMEOUT)
            .send()?
            .error_for_status()?
            .text()?;

        let envelope: StatusEnvelope = serde_json::from_str(&body)?;

        Ok(envelope.result)
    }
}
