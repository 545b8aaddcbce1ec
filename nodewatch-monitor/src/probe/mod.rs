/**
 * PROBE - Control-RPC health checks against overlay agents
 *
 * ROLE:
 * Opens a TCP connection to an agent's control port, sends one newline-terminated
 * JSON-RPC 2.0 request, accumulates the reply until it is a complete object and turns
 * the outcome into a `HealthCheckResult`.
 *
 * FLOW (one node):
 * 1. basic `get_info` call (id "health_check"): any transport or protocol failure
 *    marks the node offline; an RPC `error` reply still counts as reachable
 * 2. sweep `get_info`, `get_peer_info`, `get_route_table`, `get_network_summary`, one
 *    connection each, keeping whatever succeeds
 * 3. version / peer count extraction (see `extract`)
 *
 * A batch runs through a bounded ordered stream, one task per probe: results come
 * back in input order and a panicking probe becomes an offline result.
 */

pub mod extract;
pub mod framing;

use crate::models::{HealthCheckResult, NodeId};
use framing::{FramingMode, Progress, ResponseAccumulator, MAX_RESPONSE_BYTES};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const SWEEP_METHODS: [&str; 4] = [
    "get_info",
    "get_peer_info",
    "get_route_table",
    "get_network_summary",
];

const BASIC_METHOD: &str = "get_info";
const BASIC_CALL_ID: &str = "health_check";
const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{stage} timeout on {addr}")]
    Timeout { addr: String, stage: &'static str },
    #[error("socket error on {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no response from {addr}")]
    NoResponse { addr: String },
    #[error("malformed JSON reply: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ProbeError {
    /// Transport failures are worth retrying next cycle; protocol failures point at the agent.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProbeError::Connect { .. }
                | ProbeError::Timeout { .. }
                | ProbeError::Io { .. }
                | ProbeError::NoResponse { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcReply {
    Result(Value),
    Error(Value),
}

/// Validates a reply envelope: `jsonrpc` must be `"2.0"`, `error` wins over `result`.
pub fn parse_reply(text: &str) -> Result<RpcReply, ProbeError> {
    let value: Value = serde_json::from_str(text.trim())?;
    let obj = value
        .as_object()
        .ok_or_else(|| ProbeError::Protocol("reply is not a JSON object".into()))?;

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(ProbeError::Protocol("invalid JSON-RPC version".into()));
    }
    if let Some(error) = obj.get("error") {
        return Ok(RpcReply::Error(error.clone()));
    }
    obj.get("result")
        .cloned()
        .map(RpcReply::Result)
        .ok_or_else(|| ProbeError::Protocol("missing 'result' in reply".into()))
}

fn request_line(method: &str, id: &str) -> String {
    let mut line = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": {},
        "id": id,
    })
    .to_string();
    line.push('\n');
    line
}

/// One agent to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct HealthChecker {
    timeout: Duration,
    framing: FramingMode,
    concurrency: usize,
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            framing: FramingMode::default(),
            concurrency: 32,
        }
    }

    pub fn with_framing(mut self, framing: FramingMode) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// One request on a fresh connection. Every stage is bounded by the checker timeout.
    pub async fn call(&self, host: &str, port: u16, method: &str, id: &str) -> Result<RpcReply, ProbeError> {
        let addr = format!("{host}:{port}");

        let mut stream = timeout(self.timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| ProbeError::Timeout { addr: addr.clone(), stage: "connect" })?
            .map_err(|source| ProbeError::Connect { addr: addr.clone(), source })?;

        timeout(self.timeout, stream.write_all(request_line(method, id).as_bytes()))
            .await
            .map_err(|_| ProbeError::Timeout { addr: addr.clone(), stage: "write" })?
            .map_err(|source| ProbeError::Io { addr: addr.clone(), source })?;

        let mut acc = ResponseAccumulator::new(self.framing);
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = timeout(self.timeout, stream.read(&mut chunk))
                .await
                .map_err(|_| ProbeError::Timeout { addr: addr.clone(), stage: "read" })?
                .map_err(|source| ProbeError::Io { addr: addr.clone(), source })?;
            if n == 0 {
                break;
            }
            match acc.push(&chunk[..n]) {
                Progress::Pending => continue,
                Progress::Complete => break,
                Progress::Overflow => {
                    return Err(ProbeError::Protocol(format!(
                        "reply from {addr} exceeds {MAX_RESPONSE_BYTES} bytes"
                    )))
                }
            }
        }

        if acc.is_empty() {
            return Err(ProbeError::NoResponse { addr });
        }
        let text = acc.text();
        debug!(%addr, method, bytes = acc.len(), "rpc reply received");
        parse_reply(&text)
    }

    /// Probes one agent. Never fails: errors become an offline result.
    pub async fn check_node_health(&self, node_id: NodeId, host: &str, port: u16) -> HealthCheckResult {
        let started = Instant::now();
        let outcome = self.probe(host, port).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(telemetry) => HealthCheckResult::online(
                node_id,
                telemetry.connection_count,
                telemetry.version,
                elapsed_ms,
            ),
            Err(e) => {
                warn!(node_id, host, port, transport = e.is_transport(), error = %e, "probe failed");
                HealthCheckResult::offline(node_id, elapsed_ms, e.to_string())
            }
        }
    }

    async fn probe(&self, host: &str, port: u16) -> Result<extract::Telemetry, ProbeError> {
        let basic = match self.call(host, port, BASIC_METHOD, BASIC_CALL_ID).await? {
            RpcReply::Result(result) => Some(result),
            RpcReply::Error(error) => {
                let message = error.get("message").and_then(Value::as_str).unwrap_or("Unknown error");
                warn!(host, port, rpc_message = message, "agent answered with an RPC error");
                None
            }
        };

        let sweep = self.sweep(host, port).await;
        info!(host, port, methods = ?sweep.keys().collect::<Vec<_>>(), "agent reachable");
        Ok(extract::extract(basic.as_ref(), &sweep))
    }

    async fn sweep(&self, host: &str, port: u16) -> HashMap<String, Value> {
        let mut results = HashMap::new();
        for method in SWEEP_METHODS {
            match self.call(host, port, method, method).await {
                Ok(RpcReply::Result(result)) => {
                    results.insert(method.to_string(), result);
                }
                Ok(RpcReply::Error(error)) => debug!(method, ?error, "sweep method rejected"),
                Err(e) => debug!(method, error = %e, "sweep method failed"),
            }
        }
        results
    }

    /// Probes every target concurrently (at most `concurrency` in flight) and returns the
    /// results in input order.
    pub async fn check_many(&self, targets: Vec<ProbeTarget>) -> Vec<HealthCheckResult> {
        let concurrency = self.concurrency;
        stream::iter(targets)
            .map(|target| {
                let checker = self.clone();
                async move {
                    let node_id = target.node_id;
                    let task = tokio::spawn(async move {
                        checker.check_node_health(target.node_id, &target.host, target.port).await
                    });
                    match task.await {
                        Ok(result) => result,
                        Err(e) => HealthCheckResult::offline(node_id, 0, format!("probe task failed: {e}")),
                    }
                }
            })
            .buffered(concurrency)
            .collect()
            .await
    }
}
