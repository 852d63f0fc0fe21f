//! Per-process JSON-RPC multiplexer: pending-request table, reader loop,
//! and the MCP `initialize` handshake. The heart of the router.
//!
//! Wire format is newline-delimited UTF-8 JSON-RPC 2.0. The bridge is
//! generic over its transport only at construction time (`Box<dyn
//! AsyncRead>` / `Box<dyn AsyncWrite>`) so tests can stand in a
//! `tokio::io::duplex` pair for a real child's stdin/stdout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::RouterError;

const PROTOCOL_VERSION: &str = "2024-11-05";
const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

type Waiter = oneshot::Sender<Result<Value, RouterError>>;

#[derive(Debug, serde::Deserialize)]
struct InboundFrame {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<InboundError>,
}

#[derive(Debug, serde::Deserialize)]
struct InboundError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

struct PendingTable {
    next_id: i64,
    waiters: HashMap<i64, Waiter>,
}

struct Shared {
    name: String,
    pending: Mutex<PendingTable>,
    closed: AtomicBool,
    notifications: broadcast::Sender<Value>,
}

/// One bridge per running child. Any number of callers may `send`
/// concurrently; writes are totally ordered by `writer`'s mutex. Response
/// order is not guaranteed and is irrelevant — correlation is strictly by
/// request id.
pub struct StdioBridge {
    writer: Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
    shared: Arc<Shared>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl StdioBridge {
    /// Spawn the reader loop and perform the MCP handshake. Fails (and
    /// leaves nothing running) if the handshake doesn't complete within
    /// `init_timeout`.
    pub async fn start(
        name: impl Into<String>,
        stdin: Box<dyn AsyncWrite + Unpin + Send>,
        stdout: Box<dyn AsyncRead + Unpin + Send>,
        init_timeout: Duration,
    ) -> Result<Arc<Self>, RouterError> {
        let name = name.into();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            name: name.clone(),
            pending: Mutex::new(PendingTable {
                next_id: 1,
                waiters: HashMap::new(),
            }),
            closed: AtomicBool::new(false),
            notifications,
        });

        let reader_task = tokio::spawn(run_reader(stdout, Arc::clone(&shared)));

        let bridge = Arc::new(Self {
            writer: Mutex::new(stdin),
            shared,
            reader_task: Mutex::new(Some(reader_task)),
        });

        let init_params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "toolhub", "version": env!("CARGO_PKG_VERSION") },
        });

        match bridge.send("initialize", init_params, init_timeout).await {
            Ok(_) => {
                bridge.send_notification("initialized", json!({})).await?;
                Ok(bridge)
            }
            Err(err) => {
                bridge.close().await;
                Err(err)
            }
        }
    }

    /// Send a request and wait (up to `request_timeout`) for its response.
    pub async fn send(
        &self,
        method: &str,
        params: Value,
        request_timeout: Duration,
    ) -> Result<Value, RouterError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RouterError::BridgeClosed(self.shared.name.clone()));
        }

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.shared.pending.lock().await;
            let id = pending.next_id;
            pending.next_id += 1;
            pending.waiters.insert(id, tx);
            id
        };

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        if self.write_line(&frame).await.is_err() {
            let mut pending = self.shared.pending.lock().await;
            pending.waiters.remove(&id);
            return Err(RouterError::BridgeClosed(self.shared.name.clone()));
        }

        match timeout(request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RouterError::BridgeClosed(self.shared.name.clone())),
            Err(_) => {
                let mut pending = self.shared.pending.lock().await;
                pending.waiters.remove(&id);
                Err(RouterError::Timeout {
                    name: self.shared.name.clone(),
                    elapsed: request_timeout,
                })
            }
        }
    }

    /// Fire-and-forget: no id, no waiter. Returns once the write completes.
    pub async fn send_notification(&self, method: &str, params: Value) -> Result<(), RouterError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RouterError::BridgeClosed(self.shared.name.clone()));
        }
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.write_line(&frame)
            .await
            .map_err(|_| RouterError::BridgeClosed(self.shared.name.clone()))
    }

    pub async fn list_tools(&self, request_timeout: Duration) -> Result<Value, RouterError> {
        self.send("tools/list", json!({}), request_timeout).await
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        request_timeout: Duration,
    ) -> Result<Value, RouterError> {
        self.send(
            "tools/call",
            json!({ "name": tool_name, "arguments": arguments }),
            request_timeout,
        )
        .await
    }

    /// Subscribe to server-initiated notifications (requests with a
    /// `method` but no `id`). Dropped silently if nobody is subscribed.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Value> {
        self.shared.notifications.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Idempotent: cancels every pending waiter with `BridgeClosed`, stops
    /// the reader loop, and returns.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut pending = self.shared.pending.lock().await;
        for (_, waiter) in pending.waiters.drain() {
            let _ = waiter.send(Err(RouterError::BridgeClosed(self.shared.name.clone())));
        }
        drop(pending);

        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
    }

    async fn write_line(&self, frame: &Value) -> Result<(), ()> {
        let mut bytes = serde_json::to_vec(frame).map_err(|_| ())?;
        bytes.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await.map_err(|_| ())?;
        writer.flush().await.map_err(|_| ())
    }
}

async fn run_reader(stdout: Box<dyn AsyncRead + Unpin + Send>, shared: Arc<Shared>) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                handle_line(trimmed, &shared).await;
            }
            Err(err) => {
                warn!(name = %shared.name, error = %err, "read error on stdio bridge, closing");
                break;
            }
        }
    }

    close_with_bridge_closed(&shared).await;
}

async fn handle_line(line: &str, shared: &Arc<Shared>) {
    let frame: InboundFrame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(name = %shared.name, error = %err, line = %line, "unparseable line from child, skipping");
            return;
        }
    };

    match (&frame.id, &frame.method) {
        (Some(id_value), None) => {
            let Some(id) = id_value.as_i64() else {
                warn!(name = %shared.name, "response with non-integer id, skipping");
                return;
            };
            let waiter = {
                let mut pending = shared.pending.lock().await;
                pending.waiters.remove(&id)
            };
            let Some(waiter) = waiter else {
                debug!(name = %shared.name, id, "response for unknown/cancelled id, dropping");
                return;
            };
            let outcome = match (frame.result, frame.error) {
                (Some(result), None) => Ok(result),
                (None, Some(error)) => Err(RouterError::UpstreamError {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                }),
                _ => Err(RouterError::Internal(
                    "malformed response: expected exactly one of result/error".to_string(),
                )),
            };
            let _ = waiter.send(outcome);
        }
        (None, Some(_method)) => {
            if let Ok(notification) = serde_json::from_str::<Value>(line) {
                let _ = shared.notifications.send(notification);
            }
        }
        _ => {
            debug!(name = %shared.name, line = %line, "frame with neither a matched id nor a method, skipping");
        }
    }
}

async fn close_with_bridge_closed(shared: &Arc<Shared>) {
    if shared.closed.swap(true, Ordering::SeqCst) {
        return;
    }
    let mut pending = shared.pending.lock().await;
    for (_, waiter) in pending.waiters.drain() {
        let _ = waiter.send(Err(RouterError::BridgeClosed(shared.name.clone())));
    }
}
