/*!
JSON fixtures shaped like the remote and local management APIs
*/

use serde_json::{json, Map, Value};

/// Builds a node record the way the APIs serialize it.
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    fields: Map<String, Value>,
}

impl NodeBuilder {
    pub fn new(id: i64, name: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("id".into(), json!(id));
        fields.insert("node_name".into(), json!(name));
        Self { fields }
    }

    pub fn network(self, name: &str, secret: &str) -> Self {
        self.field("network_name", json!(name)).field("network_secret", json!(secret))
    }

    /// Connection types are upper-cased like the remote API does.
    pub fn connection(mut self, kind: &str, ip: &str, port: u16) -> Self {
        let entry = json!({"type": kind.to_uppercase(), "ip": ip, "port": port});
        match self.fields.get_mut("connections") {
            Some(Value::Array(list)) => list.push(entry),
            _ => {
                self.fields.insert("connections".into(), json!([entry]));
            }
        }
        self
    }

    pub fn email(self, email: &str) -> Self {
        self.field("user_email", json!(email))
    }

    pub fn token(self, token: &str) -> Self {
        self.field("report_token", json!(token))
    }

    pub fn tier_bandwidth(self, mbps: f64) -> Self {
        self.field("tier_bandwidth", json!(mbps))
    }

    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }
}

/// `{"nodes": [...]}`
pub fn nodes_body(nodes: Vec<Value>) -> Value {
    json!({ "nodes": nodes })
}

/// `{"node": {...}}`
pub fn node_body(node: Value) -> Value {
    json!({ "node": node })
}

/// A `get_info` result as a healthy agent returns it.
pub fn get_info_result(version: &str, peers: usize) -> Value {
    let peers: Vec<Value> = (0..peers).map(|i| json!({"peer_id": i})).collect();
    json!({ "version": version, "connected_peers": peers })
}

pub fn rpc_result(id: &str, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

pub fn rpc_error(id: &str, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
