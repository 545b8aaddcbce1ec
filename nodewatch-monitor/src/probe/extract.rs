//! Version and peer-count extraction from control-RPC results.

use crate::models::UNKNOWN_VERSION;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telemetry {
    pub version: String,
    pub connection_count: u32,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            version: UNKNOWN_VERSION.to_string(),
            connection_count: 0,
        }
    }
}

/// `"2.1.0-rc1"` -> `"2.1.0"`
pub fn normalize_version(raw: &str) -> String {
    raw.split('-').next().unwrap_or(raw).to_string()
}

/// Builds telemetry from the sweep results, falling back to the basic `get_info` reply
/// when the sweep did not get one.
pub fn extract(basic: Option<&Value>, sweep: &HashMap<String, Value>) -> Telemetry {
    let mut telemetry = Telemetry::default();

    if let Some(info) = sweep.get("get_info").or(basic).and_then(Value::as_object) {
        if let Some(version) = info.get("version") {
            let raw = match version {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            telemetry.version = normalize_version(&raw);
        }
        telemetry.connection_count = count_from_info(info);
    }

    // the peer list can only raise the count
    if let Some(peers) = sweep.get("get_peer_info").and_then(Value::as_array) {
        telemetry.connection_count = telemetry.connection_count.max(saturating_len(peers.len()));
    }

    telemetry
}

fn count_from_info(info: &serde_json::Map<String, Value>) -> u32 {
    if let Some(peers) = info.get("connected_peers") {
        return peers.as_array().map(|p| saturating_len(p.len())).unwrap_or(0);
    }
    if let Some(pairs) = info.get("peer_route_pairs").and_then(Value::as_array) {
        let connected = pairs
            .iter()
            .filter(|pair| {
                pair.get("peer")
                    .and_then(|peer| peer.get("conns"))
                    .is_some_and(has_entries)
            })
            .count();
        return saturating_len(connected);
    }
    0
}

fn has_entries(conns: &Value) -> bool {
    match conns {
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
        _ => true,
    }
}

fn saturating_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
