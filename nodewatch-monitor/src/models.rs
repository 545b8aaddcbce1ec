//! Wire and domain types shared by the probe, reconciler and reporter.
//!
//! Node records travel between the remote authority (Source A) and the local management
//! service (Source B/C) mostly untouched: fields this crate does not interpret are kept in
//! `extra` and written back verbatim.

use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Source-assigned node identity.
pub type NodeId = i64;

/// Version string used when an agent does not tell us its version.
pub const UNKNOWN_VERSION: &str = "unknown";

/// Transport of a node connection descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Tcp,
    Udp,
    Ws,
    Wss,
    Wg,
}

const CONNECTION_TYPES: &[&str] = &["tcp", "udp", "ws", "wss", "wg"];

/// Accepts any letter case (`tcp`, `TCP`, `Tcp`).
impl<'de> Deserialize<'de> for ConnectionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ConnectionType::Tcp),
            "udp" => Ok(ConnectionType::Udp),
            "ws" => Ok(ConnectionType::Ws),
            "wss" => Ok(ConnectionType::Wss),
            "wg" => Ok(ConnectionType::Wg),
            _ => Err(D::Error::unknown_variant(&raw, CONNECTION_TYPES)),
        }
    }
}

impl ConnectionType {
    pub fn scheme(&self) -> &'static str {
        match self {
            ConnectionType::Tcp => "tcp",
            ConnectionType::Udp => "udp",
            ConnectionType::Ws => "ws",
            ConnectionType::Wss => "wss",
            ConnectionType::Wg => "wg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(rename = "type")]
    pub kind: ConnectionType,
    pub ip: String,
    #[serde(deserialize_with = "port_from_wire")]
    pub port: u16,
}

impl Connection {
    /// Peer address in the form the agent's `--peers` flag expects, e.g. `tcp://1.2.3.4:11010`.
    pub fn peer_url(&self) -> String {
        format!("{}://{}:{}", self.kind.scheme(), self.ip, self.port)
    }
}

/// A node as known to either registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    #[serde(rename = "node_name", alias = "name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_secret: Option<String>,
    #[serde(default, deserialize_with = "connections_from_wire")]
    pub connections: Vec<Connection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_token: Option<String>,
    #[serde(
        default,
        rename = "user_email",
        alias = "owner_email",
        skip_serializing_if = "Option::is_none"
    )]
    pub owner_email: Option<String>,
    #[serde(default)]
    pub tier_bandwidth: f64,
    /// Everything else the registries carry (status, latency, quotas...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeRecord {
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            network_name: None,
            network_secret: None,
            connections: Vec::new(),
            report_token: None,
            owner_email: None,
            tier_bandwidth: 0.0,
            extra: Map::new(),
        }
    }

    /// Compares the fields the reconciler mirrors. Registry-local bookkeeping in `extra`
    /// and the report credential are ignored.
    pub fn same_content(&self, other: &NodeRecord) -> bool {
        self.name == other.name
            && self.network_name == other.network_name
            && self.network_secret == other.network_secret
            && self.connections == other.connections
            && self.owner_email == other.owner_email
            && self.tier_bandwidth == other.tier_bandwidth
    }

    /// Copy suitable for the local registry: the report credential stays in the token store.
    pub fn without_credentials(&self) -> NodeRecord {
        NodeRecord {
            report_token: None,
            ..self.clone()
        }
    }

    /// Numeric telemetry field from the registry payload, 0 when absent or not a number.
    pub fn metric(&self, key: &str) -> f64 {
        self.extra.get(key).and_then(Value::as_f64).unwrap_or(0.0)
    }

    pub fn first_peer(&self) -> Option<String> {
        self.connections.first().map(Connection::peer_url)
    }
}

/// Ports arrive as numbers from the API and as strings from hand-edited records.
fn port_from_wire<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Number(u16),
        Text(String),
    }

    match Wire::deserialize(deserializer)? {
        Wire::Number(port) => Ok(port),
        Wire::Text(text) => text.trim().parse().map_err(D::Error::custom),
    }
}

/// `connections` is an array on the API but a JSON-encoded string in some database dumps.
/// Entries that cannot be used (unknown transport, bad port) are dropped, the node is kept.
fn connections_from_wire<'de, D>(deserializer: D) -> Result<Vec<Connection>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        List(Vec<Value>),
        Encoded(String),
    }

    let entries = match Option::<Wire>::deserialize(deserializer)? {
        None => return Ok(Vec::new()),
        Some(Wire::List(list)) => list,
        Some(Wire::Encoded(text)) if text.trim().is_empty() => return Ok(Vec::new()),
        Some(Wire::Encoded(text)) => serde_json::from_str(&text).map_err(D::Error::custom)?,
    };
    Ok(entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<Connection>(entry.clone()) {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!(connection = %entry, error = %e, "skipping unusable connection entry");
                None
            }
        })
        .collect())
}

/// Body of the node list endpoints. The local service has shipped both shapes.
/// Records are decoded one by one so a single malformed node does not sink the list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum NodeListBody {
    Wrapped { nodes: Vec<Value> },
    Bare(Vec<Value>),
}

impl NodeListBody {
    /// Decoded records, in payload order. Records that do not decode are logged and skipped.
    pub fn into_nodes(self) -> Vec<NodeRecord> {
        let raw = match self {
            NodeListBody::Wrapped { nodes } => nodes,
            NodeListBody::Bare(nodes) => nodes,
        };
        raw.into_iter()
            .enumerate()
            .filter_map(|(index, value)| {
                let id = value.get("id").cloned();
                match serde_json::from_value::<NodeRecord>(value) {
                    Ok(node) => Some(node),
                    Err(e) => {
                        warn!(index, id = ?id, error = %e, "skipping malformed node record");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Body of `GET /api/nodes/{id}`
#[derive(Debug, Deserialize)]
pub struct NodeDetailBody {
    pub node: NodeRecord,
}

/// Outcome of one probe of one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub node_id: NodeId,
    pub is_online: bool,
    pub connection_count: u32,
    pub version: String,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl HealthCheckResult {
    pub fn online(node_id: NodeId, connection_count: u32, version: String, response_time_ms: u64) -> Self {
        Self {
            node_id,
            is_online: true,
            connection_count,
            version,
            response_time_ms,
            error_message: None,
        }
    }

    pub fn offline(node_id: NodeId, response_time_ms: u64, error: impl Into<String>) -> Self {
        Self {
            node_id,
            is_online: false,
            connection_count: 0,
            version: UNKNOWN_VERSION.to_string(),
            response_time_ms,
            error_message: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Online,
    Offline,
}

/// Payload of `POST /api/report`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEnvelope {
    pub node_name: String,
    pub email: String,
    pub token: String,
    pub current_bandwidth: f64,
    pub reported_traffic: f64,
    pub connection_count: u32,
    pub tier_bandwidth: f64,
    pub status: ReportStatus,
}

/// Success body of `POST /api/report`
#[derive(Debug, Default, Deserialize)]
pub struct ReportAck {
    #[serde(default)]
    pub used_traffic: Option<f64>,
    #[serde(default)]
    pub max_traffic: Option<f64>,
}
