//! Management calls to the local database over Jolokia.
//!
//! The agent loaded into the database JVM exposes the `StorageService` MBean
//! over HTTP on `localhost:8778`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::resources::statefulset::JOLOKIA_PORT;

const STORAGE_SERVICE_MBEAN: &str = "org.apache.cassandra.db:type=StorageService";
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum JolokiaError {
    #[error("Jolokia request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Jolokia returned status {status}: {error}")]
    Remote { status: i64, error: String },

    #[error("unexpected Jolokia response: {0}")]
    UnexpectedResponse(String),
}

/// Gossip status of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    Up,
    Down,
}

/// Ring state of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Normal,
    Leaving,
    Joining,
    Moving,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub status: NodeStatus,
    pub state: NodeState,
}

impl NodeInfo {
    pub fn is_up_and_normal(&self) -> bool {
        self.status == NodeStatus::Up && self.state == NodeState::Normal
    }
}

/// Nodes of the ring keyed by address.
pub type NodeMap = BTreeMap<String, NodeInfo>;

/// Operation mode reported by `StorageService`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationMode {
    Starting,
    Normal,
    Joining,
    Leaving,
    Decommissioned,
    Moving,
    Draining,
    Drained,
}

impl FromStr for OperationMode {
    type Err = JolokiaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mode = match s.to_ascii_uppercase().as_str() {
            "STARTING" => OperationMode::Starting,
            "NORMAL" => OperationMode::Normal,
            "JOINING" => OperationMode::Joining,
            "LEAVING" => OperationMode::Leaving,
            "DECOMMISSIONED" => OperationMode::Decommissioned,
            "MOVING" => OperationMode::Moving,
            "DRAINING" => OperationMode::Draining,
            "DRAINED" => OperationMode::Drained,
            other => {
                return Err(JolokiaError::UnexpectedResponse(format!(
                    "unknown operation mode {}",
                    other
                )));
            }
        };
        Ok(mode)
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// HTTP client for the local Jolokia agent.
#[derive(Clone, Debug)]
pub struct JolokiaClient {
    http: reqwest::Client,
    url: String,
}

impl Default for JolokiaClient {
    fn default() -> Self {
        Self::new(format!("http://127.0.0.1:{}/jolokia/", JOLOKIA_PORT))
    }
}

impl JolokiaClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }

    async fn request(&self, body: Value, timeout: Option<Duration>) -> Result<Value, JolokiaError> {
        let mut request = self.http.post(&self.url).json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response: Value = request.send().await?.error_for_status()?.json().await?;
        unwrap_value(response)
    }

    /// Current view of the ring.
    #[instrument(skip(self))]
    pub async fn status(&self) -> Result<NodeMap, JolokiaError> {
        let value = self
            .request(
                json!({
                    "type": "read",
                    "mbean": STORAGE_SERVICE_MBEAN,
                    "attribute": [
                        "LiveNodes",
                        "UnreachableNodes",
                        "LeavingNodes",
                        "JoiningNodes",
                        "MovingNodes"
                    ]
                }),
                Some(READ_TIMEOUT),
            )
            .await?;
        node_map(&value)
    }

    #[instrument(skip(self))]
    pub async fn operation_mode(&self) -> Result<OperationMode, JolokiaError> {
        let value = self
            .request(
                json!({
                    "type": "read",
                    "mbean": STORAGE_SERVICE_MBEAN,
                    "attribute": "OperationMode"
                }),
                Some(READ_TIMEOUT),
            )
            .await?;
        value
            .as_str()
            .ok_or_else(|| JolokiaError::UnexpectedResponse(value.to_string()))?
            .parse()
    }

    /// Stream this node's data to its peers and leave the ring. Blocks until
    /// the database finishes.
    #[instrument(skip(self))]
    pub async fn decommission(&self) -> Result<(), JolokiaError> {
        debug!("Invoking decommission");
        self.request(
            json!({
                "type": "exec",
                "mbean": STORAGE_SERVICE_MBEAN,
                "operation": "decommission"
            }),
            None,
        )
        .await?;
        Ok(())
    }
}

/// Extract `value` from a Jolokia response envelope.
pub fn unwrap_value(response: Value) -> Result<Value, JolokiaError> {
    let status = response.get("status").and_then(Value::as_i64).unwrap_or(0);
    if status != 200 {
        let error = response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(JolokiaError::Remote { status, error });
    }
    match response {
        Value::Object(mut fields) => Ok(fields.remove("value").unwrap_or(Value::Null)),
        other => Err(JolokiaError::UnexpectedResponse(other.to_string())),
    }
}

fn addresses(value: &Value, attribute: &str) -> Result<Vec<String>, JolokiaError> {
    match value.get(attribute) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    JolokiaError::UnexpectedResponse(format!("{} entry {}", attribute, item))
                })
            })
            .collect(),
        Some(other) => Err(JolokiaError::UnexpectedResponse(format!(
            "{} is {}",
            attribute, other
        ))),
    }
}

/// Build the node map from a multi-attribute `StorageService` read.
pub fn node_map(value: &Value) -> Result<NodeMap, JolokiaError> {
    let live = addresses(value, "LiveNodes")?;
    let unreachable = addresses(value, "UnreachableNodes")?;
    let leaving = addresses(value, "LeavingNodes")?;
    let joining = addresses(value, "JoiningNodes")?;
    let moving = addresses(value, "MovingNodes")?;

    let state_of = |address: &String| {
        if leaving.contains(address) {
            NodeState::Leaving
        } else if joining.contains(address) {
            NodeState::Joining
        } else if moving.contains(address) {
            NodeState::Moving
        } else {
            NodeState::Normal
        }
    };

    let mut nodes = NodeMap::new();
    for (addresses, status) in [(&live, NodeStatus::Up), (&unreachable, NodeStatus::Down)] {
        for address in addresses {
            nodes.insert(
                address.clone(),
                NodeInfo {
                    status,
                    state: state_of(address),
                },
            );
        }
    }
    Ok(nodes)
}
