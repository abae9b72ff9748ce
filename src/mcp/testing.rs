//! In-process MCP server speaking newline-delimited JSON-RPC over
//! `tokio::io::duplex`, for exercising connections without subprocesses.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::ConnectionError;
use crate::mcp::connection::{ConnectionEvent, StateObserver};
use crate::mcp::protocol::{
    IncomingMessage, JsonRpcError, JsonRpcResponse, METHOD_NOT_FOUND, MCP_PROTOCOL_VERSION,
};
use crate::mcp::transport::{Connector, Transport, TransportGuard};

#[derive(Debug, Clone)]
pub enum ToolBehavior {
    /// Replies with a single text content item.
    Text(String),
    /// Replies with the call arguments as text.
    Echo,
    /// Never replies.
    Hang,
    /// Replies after a delay.
    Slow(Duration, String),
    /// JSON-RPC error response.
    RemoteError(i64, String),
    /// A result flagged `isError`.
    ToolError(String),
}

#[derive(Debug, Clone)]
pub struct FakeServer {
    tools: Vec<(String, ToolBehavior)>,
    protocol_version: String,
    malformed_handshake: bool,
    stray_responses: bool,
    page_size: Option<usize>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            malformed_handshake: false,
            stray_responses: false,
            page_size: None,
        }
    }
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool(mut self, name: &str, behavior: ToolBehavior) -> Self {
        self.tools.push((name.to_string(), behavior));
        self
    }

    pub fn protocol_version(mut self, version: &str) -> Self {
        self.protocol_version = version.to_string();
        self
    }

    pub fn malformed_handshake(mut self) -> Self {
        self.malformed_handshake = true;
        self
    }

    pub fn stray_responses(mut self) -> Self {
        self.stray_responses = true;
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn connector(self) -> (FakeConnector, FakeControl) {
        let control = FakeControl::default();
        let connector = FakeConnector {
            server: self,
            control: control.clone(),
        };
        (connector, control)
    }

    fn describe(name: &str) -> Value {
        json!({
            "name": name,
            "description": format!("{} tool", name),
            "inputSchema": { "type": "object", "properties": {} }
        })
    }
}

#[derive(Default)]
struct ControlState {
    calls: AtomicUsize,
    opens: AtomicUsize,
    refuse: AtomicBool,
    live: Mutex<Vec<AbortHandle>>,
    pushers: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    extra_tools: Mutex<Vec<(String, ToolBehavior)>>,
    client_responses: Mutex<Vec<Value>>,
}

/// Test-side handle onto a fake server's counters and kill switch.
#[derive(Clone, Default)]
pub struct FakeControl {
    state: Arc<ControlState>,
}

impl FakeControl {
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Drops every live server side, so clients see end-of-stream.
    pub fn kill(&self) {
        for handle in self.state.live.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    pub fn add_tool(&self, name: &str, behavior: ToolBehavior) {
        self.state
            .extra_tools
            .lock()
            .unwrap()
            .push((name.to_string(), behavior));
    }

    /// Sends a frame from the server to every connected client.
    pub fn push(&self, frame: Value) {
        self.push_raw(&frame.to_string());
    }

    /// Sends a line verbatim, whether or not it is JSON.
    pub fn push_raw(&self, line: &str) {
        for pusher in self.state.pushers.lock().unwrap().iter() {
            let _ = pusher.send(line.to_string());
        }
    }

    pub fn client_responses(&self) -> Vec<Value> {
        self.state.client_responses.lock().unwrap().clone()
    }
}

pub struct FakeConnector {
    server: FakeServer,
    control: FakeControl,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, server: &str) -> Result<Transport, ConnectionError> {
        self.control.state.opens.fetch_add(1, Ordering::SeqCst);
        if self.control.state.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::transport(server, "connection refused"));
        }

        let (client, remote) = tokio::io::duplex(64 * 1024);
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        self.control.state.pushers.lock().unwrap().push(push_tx);

        let task = tokio::spawn(serve(
            self.server.clone(),
            self.control.clone(),
            remote,
            push_rx,
        ));
        self.control
            .state
            .live
            .lock()
            .unwrap()
            .push(task.abort_handle());

        let (read, write) = tokio::io::split(client);
        Ok(Transport::from_io(server, read, write, TransportGuard::default()))
    }

    fn kind(&self) -> &'static str {
        "fake"
    }
}

async fn serve(
    script: FakeServer,
    control: FakeControl,
    io: DuplexStream,
    mut push_rx: mpsc::UnboundedReceiver<String>,
) {
    let (read, write) = tokio::io::split(io);
    let write = Arc::new(tokio::sync::Mutex::new(write));
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => return,
            },
            Some(frame) = push_rx.recv() => {
                send(&write, frame).await;
                continue;
            }
        };

        let (id, method, params) = match IncomingMessage::parse(&line) {
            Ok(IncomingMessage::Request { id, method, params }) => (id, method, params),
            Ok(IncomingMessage::Response { .. }) => {
                let value: Value = serde_json::from_str(&line).unwrap();
                control.state.client_responses.lock().unwrap().push(value);
                continue;
            }
            _ => continue,
        };

        let mut tools = script.tools.clone();
        tools.extend(control.state.extra_tools.lock().unwrap().iter().cloned());

        let response = match method.as_str() {
            "initialize" if script.malformed_handshake => {
                JsonRpcResponse::success(id, json!({ "unexpected": true }))
            }
            "initialize" => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": script.protocol_version,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "fake", "version": "0.0.1" }
                }),
            ),
            "tools/list" => {
                let offset = params
                    .as_ref()
                    .and_then(|p| p.get("cursor"))
                    .and_then(Value::as_str)
                    .and_then(|c| c.parse::<usize>().ok())
                    .unwrap_or(0);
                let size = script.page_size.unwrap_or(usize::MAX);
                let page: Vec<Value> = tools
                    .iter()
                    .skip(offset)
                    .take(size)
                    .map(|(name, _)| FakeServer::describe(name))
                    .collect();
                let mut result = json!({ "tools": page });
                if offset.saturating_add(size) < tools.len() {
                    result["nextCursor"] = json!((offset + size).to_string());
                }
                JsonRpcResponse::success(id, result)
            }
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/call" => {
                control.state.calls.fetch_add(1, Ordering::SeqCst);
                if script.stray_responses {
                    send(&write, json!({"jsonrpc": "2.0", "id": 987654, "result": {}}).to_string())
                        .await;
                }

                let params = params.unwrap_or(Value::Null);
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let behavior = tools
                    .iter()
                    .find(|(tool, _)| *tool == name)
                    .map(|(_, behavior)| behavior.clone());

                match behavior {
                    None => JsonRpcResponse::failure(
                        Some(id),
                        JsonRpcError::new(-32602, format!("Unknown tool: {}", name)),
                    ),
                    Some(ToolBehavior::Hang) => continue,
                    Some(ToolBehavior::Slow(delay, text)) => {
                        let write = Arc::clone(&write);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let response = JsonRpcResponse::success(id, text_result(&text));
                            send(&write, serde_json::to_string(&response).unwrap()).await;
                        });
                        continue;
                    }
                    Some(ToolBehavior::Text(text)) => JsonRpcResponse::success(id, text_result(&text)),
                    Some(ToolBehavior::Echo) => {
                        JsonRpcResponse::success(id, text_result(&params["arguments"].to_string()))
                    }
                    Some(ToolBehavior::RemoteError(code, message)) => {
                        let mut error = JsonRpcError::new(code, message);
                        error.data = Some(json!({ "tool": name }));
                        JsonRpcResponse::failure(Some(id), error)
                    }
                    Some(ToolBehavior::ToolError(text)) => JsonRpcResponse::success(
                        id,
                        json!({ "content": [{ "type": "text", "text": text }], "isError": true }),
                    ),
                }
            }
            other => JsonRpcResponse::failure(
                Some(id),
                JsonRpcError::new(METHOD_NOT_FOUND, format!("Method not found: {}", other)),
            ),
        };

        send(&write, serde_json::to_string(&response).unwrap()).await;
    }
}

fn text_result(text: &str) -> Value {
    json!({ "content": [{ "type": "text", "text": text }] })
}

async fn send(write: &tokio::sync::Mutex<tokio::io::WriteHalf<DuplexStream>>, frame: String) {
    let mut write = write.lock().await;
    let _ = write.write_all(frame.as_bytes()).await;
    let _ = write.write_all(b"\n").await;
    let _ = write.flush().await;
}

/// Records every connection event it is told about.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<(String, ConnectionEvent)>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<(String, ConnectionEvent)> {
        self.events.lock().unwrap().clone()
    }
}

impl StateObserver for RecordingObserver {
    fn on_event(&self, server: &str, event: ConnectionEvent) {
        self.events
            .lock()
            .unwrap()
            .push((server.to_string(), event));
    }
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
