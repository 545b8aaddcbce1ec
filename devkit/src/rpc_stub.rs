/*!
Stub overlay agent for probe tests

Listens on 127.0.0.1 with an ephemeral port and answers the control-RPC with scripted
replies, one connection per request like the real agent. Every method received is
recorded so tests can assert what the probe asked for.
*/

use anyhow::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// What the stub does when it receives a given method.
#[derive(Debug, Clone)]
pub enum StubReply {
    /// `{"jsonrpc":"2.0","id":<request id>,"result":<value>}`, written in two halves
    Result(Value),
    /// `{"jsonrpc":"2.0","id":<request id>,"error":<value>}`
    Error(Value),
    /// Raw chunks written as-is with a short pause between them
    Raw(Vec<Vec<u8>>),
    /// Close the connection without answering
    Close,
    /// Keep the connection open and never answer
    Silent,
}

pub struct StubAgent {
    addr: SocketAddr,
    calls: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl StubAgent {
    /// Starts the stub. Methods without a scripted reply get [`StubReply::Close`].
    pub async fn start<I, S>(replies: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, StubReply)>,
        S: Into<String>,
    {
        let replies: Arc<HashMap<String, StubReply>> =
            Arc::new(replies.into_iter().map(|(m, r)| (m.into(), r)).collect());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let calls = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let calls = calls.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else { break };
                    let replies = replies.clone();
                    let calls = calls.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(socket, &replies, &calls).await {
                            log::debug!("[stub-agent] connection error: {e}");
                        }
                    });
                }
            })
        };

        log::info!("[stub-agent] listening on {addr}");
        Ok(Self { addr, calls, task })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Methods received so far, in arrival order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Drop for StubAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    socket: TcpStream,
    replies: &HashMap<String, StubReply>,
    calls: &Mutex<Vec<String>>,
) -> Result<()> {
    let mut reader = BufReader::new(socket);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let request: Value = serde_json::from_str(line.trim())?;
    let method = request["method"].as_str().unwrap_or_default().to_string();
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    calls.lock().unwrap_or_else(PoisonError::into_inner).push(method.clone());

    let chunks = match replies.get(&method).cloned().unwrap_or(StubReply::Close) {
        StubReply::Result(result) => halves(json!({"jsonrpc": "2.0", "id": id, "result": result})),
        StubReply::Error(error) => halves(json!({"jsonrpc": "2.0", "id": id, "error": error})),
        StubReply::Raw(chunks) => chunks,
        StubReply::Close => return Ok(()),
        StubReply::Silent => Vec::new(),
    };

    for (i, chunk) in chunks.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        reader.get_mut().write_all(chunk).await?;
        reader.get_mut().flush().await?;
    }

    // hold the connection until the client hangs up, so completion must come from framing
    let mut sink = [0u8; 256];
    while reader.read(&mut sink).await? > 0 {}
    Ok(())
}

fn halves(envelope: Value) -> Vec<Vec<u8>> {
    let bytes = envelope.to_string().into_bytes();
    let mid = bytes.len() / 2;
    vec![bytes[..mid].to_vec(), bytes[mid..].to_vec()]
}
