use chrono::Utc;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::ConnectionError;
use crate::mcp::backoff::BackoffPolicy;
use crate::mcp::protocol::{
    create_init_params, is_supported_version, FrameError, IncomingMessage, InitializeResult,
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    RequestId, METHOD_NOT_FOUND,
};
use crate::mcp::transport::{Connector, FrameStream, FrameWriter, TransportGuard};
use crate::mcp::types::{ConnectionState, InvocationState, PendingInvocation, Tool};

const HANDSHAKE_ORIGIN: &str = "handshake";
const MAX_TOOL_PAGES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    ToolsChanged,
}

/// Receives every state transition and tool rediscovery of a connection.
pub trait StateObserver: Send + Sync {
    fn on_event(&self, server: &str, event: ConnectionEvent);
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

struct Pending {
    info: PendingInvocation,
    started: Instant,
    responder: oneshot::Sender<Result<Value, ConnectionError>>,
}

struct Outbound {
    frame: String,
    id: Option<i64>,
}

struct Link {
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    guard: TransportGuard,
}

struct Inner {
    name: String,
    connector: Box<dyn Connector>,
    options: ConnectionOptions,
    observer: Arc<dyn StateObserver>,
    state: watch::Sender<ConnectionState>,
    tools: RwLock<Arc<Vec<Tool>>>,
    pending: Mutex<HashMap<i64, Pending>>,
    next_id: AtomicI64,
    /// Incremented for every transport opened; lets a stale reader recognise
    /// that it no longer owns the connection.
    generation: AtomicU64,
    /// Highest generation whose inbound stream has ended.
    ended: AtomicU64,
    /// Highest generation that delivered a frame which is not JSON-RPC.
    violated: AtomicU64,
    closing: AtomicBool,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    link: Mutex<Option<Link>>,
}

/// One session with a downstream MCP server.
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(
        name: impl Into<String>,
        connector: Box<dyn Connector>,
        options: ConnectionOptions,
        observer: Arc<dyn StateObserver>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                connector,
                options,
                observer,
                state,
                tools: RwLock::new(Arc::new(Vec::new())),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                generation: AtomicU64::new(0),
                ended: AtomicU64::new(0),
                violated: AtomicU64::new(0),
                closing: AtomicBool::new(false),
                outbound: Mutex::new(None),
                link: Mutex::new(None),
            }),
        }
    }

    pub fn transport_kind(&self) -> &'static str {
        self.inner.connector.kind()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Opens the transport and runs the initialize / tools discovery
    /// handshake. Only a `Closed` connection is connected; any other state is
    /// returned as is. On failure the transport is torn down and the
    /// connection is left `Closed`.
    pub async fn connect(&self) -> Result<ConnectionState, ConnectionError> {
        if !self
            .inner
            .transition_from(ConnectionState::Closed, ConnectionState::Connecting)
        {
            let state = self.state();
            debug!("[{}] Already {}, not connecting", self.inner.name, state);
            return Ok(state);
        }
        self.inner.closing.store(false, Ordering::SeqCst);

        match self.inner.establish().await {
            Ok(generation) => {
                self.inner.promote(ConnectionState::Connecting, generation);
                Ok(self.state())
            }
            Err(e) => {
                error!("[{}] Connection failed: {}", self.inner.name, e);
                self.inner.transition(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    /// Last discovered tool set; no round trip.
    pub async fn list_tools(&self) -> Arc<Vec<Tool>> {
        Arc::clone(&*self.inner.tools.read().await)
    }

    #[cfg(test)]
    pub async fn invoke(&self, tool_id: &str, arguments: Value) -> Result<Value, ConnectionError> {
        self.invoke_from("direct", tool_id, arguments).await
    }

    /// Calls a tool, recording `origin` against the pending invocation.
    pub async fn invoke_from(
        &self,
        origin: &str,
        tool_id: &str,
        arguments: Value,
    ) -> Result<Value, ConnectionError> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(ConnectionError::transport(
                &self.inner.name,
                format!("server is {}", state),
            ));
        }

        if !self.inner.tools.read().await.iter().any(|t| t.name() == tool_id) {
            return Err(ConnectionError::ToolNotFound {
                server: self.inner.name.clone(),
                tool: tool_id.to_string(),
            });
        }

        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };

        self.inner
            .request(
                "tools/call",
                Some(json!({ "name": tool_id, "arguments": arguments })),
                self.inner.options.request_timeout,
                origin,
                Some(tool_id),
            )
            .await
    }

    pub async fn in_flight(&self) -> Vec<PendingInvocation> {
        let mut pending: Vec<PendingInvocation> = self
            .inner
            .pending
            .lock()
            .await
            .values()
            .map(|p| p.info.clone())
            .collect();
        pending.sort_by_key(|p| p.id);
        pending
    }

    /// Orderly shutdown: stdin closed (or stream dropped), grace period,
    /// then kill. All pending invocations resolve as failed.
    pub async fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.transition(ConnectionState::Closed);
        self.inner.teardown().await;
        info!("[{}] Connection closed", self.inner.name);
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn transition(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            self.announce(from, to);
        }
    }

    /// Moves to `to` only if the current state is `expected`.
    fn transition_from(&self, expected: ConnectionState, to: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == expected {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            self.announce(expected, to);
        }
        changed
    }

    fn announce(&self, from: ConnectionState, to: ConnectionState) {
        info!(server = %self.name, %from, %to, "Connection state changed");
        self.observer
            .on_event(&self.name, ConnectionEvent::StateChanged { from, to });
    }

    /// Marks a freshly established transport ready. If its stream already
    /// ended in the meantime the reader could not see `Ready`, so the
    /// reconnect is started here instead.
    fn promote(self: &Arc<Self>, from: ConnectionState, generation: u64) -> bool {
        if !self.transition_from(from, ConnectionState::Ready) {
            return false;
        }

        if self.ended.load(Ordering::SeqCst) < generation {
            return true;
        }

        if self.violated.load(Ordering::SeqCst) >= generation {
            if self.transition_from(ConnectionState::Ready, ConnectionState::Closed) {
                error!("[{}] Malformed frame right after handshake", self.name);
                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.teardown().await });
            }
        } else if self.transition_from(ConnectionState::Ready, ConnectionState::Degraded) {
            warn!("[{}] Transport lost right after handshake", self.name);
            tokio::spawn(Arc::clone(self).reconnect());
        }
        true
    }

    async fn establish(self: &Arc<Self>) -> Result<u64, ConnectionError> {
        let transport = self.connector.open(&self.name).await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (tx, rx) = mpsc::channel::<Outbound>(64);
        let writer = tokio::spawn(Arc::clone(self).write_loop(transport.writer, rx));
        let reader = tokio::spawn(Arc::clone(self).read_loop(generation, transport.frames));

        *self.outbound.lock().await = Some(tx);
        *self.link.lock().await = Some(Link {
            writer,
            reader,
            guard: transport.guard,
        });

        match self.handshake().await {
            Ok(tools) => {
                *self.tools.write().await = Arc::new(tools);
                Ok(generation)
            }
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<Vec<Tool>, ConnectionError> {
        let result = self
            .request(
                "initialize",
                Some(create_init_params()),
                self.options.handshake_timeout,
                HANDSHAKE_ORIGIN,
                None,
            )
            .await
            .map_err(|e| match e {
                ConnectionError::Remote { error, .. } => ConnectionError::protocol(
                    &self.name,
                    format!("initialize rejected: {}", error.message),
                ),
                ConnectionError::Timeout { timeout_ms, .. } => ConnectionError::transport(
                    &self.name,
                    format!("no initialize response within {}ms", timeout_ms),
                ),
                other => other,
            })?;

        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            ConnectionError::protocol(&self.name, format!("malformed initialize result: {}", e))
        })?;

        if !is_supported_version(&init.protocol_version) {
            return Err(ConnectionError::protocol(
                &self.name,
                format!("unsupported protocol version {}", init.protocol_version),
            ));
        }

        let (server_name, server_version) = init
            .server_info
            .map(|info| (info.name, info.version.unwrap_or_default()))
            .unwrap_or_default();
        debug!("[{}] Capabilities: {}", self.name, init.capabilities);
        info!(
            "[{}] Initialized {} {} (protocol {})",
            self.name, server_name, server_version, init.protocol_version
        );

        self.notify("notifications/initialized", None).await?;
        self.discover_tools().await
    }

    async fn discover_tools(&self) -> Result<Vec<Tool>, ConnectionError> {
        let mut tools: Vec<Tool> = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = match self
                .request(
                    "tools/list",
                    params,
                    self.options.handshake_timeout,
                    HANDSHAKE_ORIGIN,
                    None,
                )
                .await
            {
                Ok(result) => result,
                Err(ConnectionError::Remote { error, .. }) if error.code == METHOD_NOT_FOUND => {
                    debug!("[{}] Server does not list tools", self.name);
                    break;
                }
                Err(ConnectionError::Remote { error, .. }) => {
                    return Err(ConnectionError::protocol(
                        &self.name,
                        format!("tools/list rejected: {}", error.message),
                    ))
                }
                Err(e) => return Err(e),
            };

            let page: ListToolsResult = serde_json::from_value(result).map_err(|e| {
                ConnectionError::protocol(&self.name, format!("malformed tools/list result: {}", e))
            })?;

            for descriptor in page.tools {
                if seen.insert(descriptor.name.clone()) {
                    tools.push(Tool::new(&self.name, descriptor));
                } else {
                    warn!("[{}] Duplicate tool '{}' ignored", self.name, descriptor.name);
                }
            }

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        info!(
            "[{}] Discovered {} tools: {:?}",
            self.name,
            tools.len(),
            tools.iter().map(|t| t.name()).collect::<Vec<_>>()
        );
        Ok(tools)
    }

    async fn refresh_tools(self: Arc<Self>) {
        match self.discover_tools().await {
            Ok(tools) => {
                *self.tools.write().await = Arc::new(tools);
                self.observer.on_event(&self.name, ConnectionEvent::ToolsChanged);
            }
            Err(e) => warn!("[{}] Tool rediscovery failed: {}", self.name, e),
        }
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
        origin: &str,
        tool: Option<&str>,
    ) -> Result<Value, ConnectionError> {
        let outbound = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or_else(|| ConnectionError::transport(&self.name, "not connected"))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| ConnectionError::protocol(&self.name, e.to_string()))?;

        let (responder, response) = oneshot::channel();
        self.pending.lock().await.insert(
            id,
            Pending {
                info: PendingInvocation {
                    id,
                    origin: origin.to_string(),
                    method: method.to_string(),
                    tool: tool.map(str::to_string),
                    submitted_at: Utc::now(),
                    state: InvocationState::Pending,
                },
                started: Instant::now(),
                responder,
            },
        );

        let sent = outbound.send(Outbound { frame, id: Some(id) }).await;
        drop(outbound);
        if sent.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ConnectionError::transport(&self.name, "connection is shutting down"));
        }

        match tokio::time::timeout(deadline, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ConnectionError::transport(&self.name, "request abandoned")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                warn!(
                    server = %self.name,
                    id,
                    origin,
                    method,
                    outcome = ?InvocationState::TimedOut,
                    "Request timed out; a late response will be dropped"
                );
                Err(ConnectionError::Timeout {
                    server: self.name.clone(),
                    method: tool.unwrap_or(method).to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ConnectionError> {
        let frame = serde_json::to_string(&JsonRpcNotification::new(method, params))
            .map_err(|e| ConnectionError::protocol(&self.name, e.to_string()))?;
        self.send_frame(frame).await
    }

    async fn send_frame(&self, frame: String) -> Result<(), ConnectionError> {
        let outbound = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or_else(|| ConnectionError::transport(&self.name, "not connected"))?;
        outbound
            .send(Outbound { frame, id: None })
            .await
            .map_err(|_| ConnectionError::transport(&self.name, "connection is shutting down"))
    }

    /// Completes a pending request. Returns false if nothing waits for `id`.
    async fn resolve(&self, id: i64, outcome: Result<Value, ConnectionError>) -> bool {
        let Some(pending) = self.pending.lock().await.remove(&id) else {
            return false;
        };

        let state = if outcome.is_ok() {
            InvocationState::Completed
        } else {
            InvocationState::Failed
        };
        debug!(
            server = %self.name,
            id,
            origin = %pending.info.origin,
            method = %pending.info.method,
            tool = pending.info.tool.as_deref().unwrap_or("-"),
            elapsed_ms = pending.started.elapsed().as_millis() as u64,
            outcome = ?state,
            "Request resolved"
        );
        let _ = pending.responder.send(outcome);
        true
    }

    async fn fail_pending(&self, error: ConnectionError) {
        let drained: Vec<Pending> = self.pending.lock().await.drain().map(|(_, p)| p).collect();
        for pending in drained {
            debug!(
                server = %self.name,
                id = pending.info.id,
                outcome = ?InvocationState::Failed,
                "{}", error
            );
            let _ = pending.responder.send(Err(error.clone()));
        }
    }

    async fn write_loop(self: Arc<Self>, mut writer: FrameWriter, mut rx: mpsc::Receiver<Outbound>) {
        let fatal_on_error = matches!(writer, FrameWriter::Lines(_));

        while let Some(outbound) = rx.recv().await {
            trace!("[{}] -> {}", self.name, outbound.frame);
            if let Err(e) = writer.send(&self.name, &outbound.frame).await {
                warn!("[{}] Write failed: {}", self.name, e);
                if let Some(id) = outbound.id {
                    self.resolve(id, Err(e)).await;
                }
                if fatal_on_error {
                    break;
                }
            }
        }
    }

    async fn read_loop(self: Arc<Self>, generation: u64, mut frames: FrameStream) {
        let mut violation = None;
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(frame) => {
                    if let Err(e) = self.dispatch(&frame).await {
                        error!("[{}] Malformed frame ({}): {}", self.name, e, frame.trim());
                        self.violated.fetch_max(generation, Ordering::SeqCst);
                        violation = Some(e);
                        break;
                    }
                }
                Err(e) => {
                    warn!("[{}] Read failed: {}", self.name, e);
                    break;
                }
            }
        }

        self.ended.fetch_max(generation, Ordering::SeqCst);
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        match violation {
            Some(e) => self.on_protocol_violation(e).await,
            None => {
                debug!("[{}] Inbound stream ended", self.name);
                self.on_transport_lost().await;
            }
        }
    }

    /// Handles one inbound frame. Only a frame that is not JSON-RPC at all is
    /// an error; unknown ids and methods are dealt with here.
    async fn dispatch(self: &Arc<Self>, frame: &str) -> Result<(), FrameError> {
        let frame = frame.trim();
        if frame.is_empty() {
            return Ok(());
        }
        trace!("[{}] <- {}", self.name, frame);

        match IncomingMessage::parse(frame)? {
            IncomingMessage::Response { id, outcome } => {
                let RequestId::Number(number) = id else {
                    warn!("[{}] Dropping response with foreign id {}", self.name, id);
                    return Ok(());
                };
                let outcome = outcome.map_err(|error| ConnectionError::Remote {
                    server: self.name.clone(),
                    error,
                });
                if !self.resolve(number, outcome).await {
                    warn!(
                        "[{}] Dropping response for unknown request id {}",
                        self.name, number
                    );
                }
            }
            IncomingMessage::Request { id, method, .. } => {
                let response = if method == "ping" {
                    JsonRpcResponse::success(id, json!({}))
                } else {
                    JsonRpcResponse::failure(
                        Some(id),
                        JsonRpcError::new(METHOD_NOT_FOUND, format!("Method not found: {}", method)),
                    )
                };
                match serde_json::to_string(&response) {
                    Ok(frame) => {
                        if let Err(e) = self.send_frame(frame).await {
                            debug!("[{}] Could not answer '{}': {}", self.name, method, e);
                        }
                    }
                    Err(e) => warn!("[{}] Failed to encode response: {}", self.name, e),
                }
            }
            IncomingMessage::Notification { method, .. } => match method.as_str() {
                "notifications/tools/list_changed" => {
                    info!("[{}] Tool list changed, rediscovering", self.name);
                    tokio::spawn(Arc::clone(self).refresh_tools());
                }
                other => debug!("[{}] Notification '{}'", self.name, other),
            },
        }
        Ok(())
    }

    /// Fails pending calls with a protocol error and closes without retrying.
    /// During a handshake the failed request carries the error back to
    /// `establish`, which tears down on its own.
    async fn on_protocol_violation(self: Arc<Self>, cause: FrameError) {
        self.fail_pending(ConnectionError::protocol(
            &self.name,
            format!("malformed frame: {}", cause),
        ))
        .await;
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        if self.transition_from(ConnectionState::Ready, ConnectionState::Closed) {
            error!("[{}] Closing after protocol violation", self.name);
            // Teardown aborts this reader, so it runs on its own task.
            tokio::spawn(async move { self.teardown().await });
        }
    }

    async fn on_transport_lost(self: Arc<Self>) {
        self.fail_pending(ConnectionError::transport(&self.name, "transport closed"))
            .await;
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        if self.transition_from(ConnectionState::Ready, ConnectionState::Degraded) {
            warn!("[{}] Transport lost, reconnecting", self.name);
            tokio::spawn(self.reconnect());
        }
    }

    fn reconnect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.teardown().await;
            let policy = self.options.backoff;

            for (attempt, delay) in policy.delays() {
                info!(
                    "[{}] Reconnect attempt {}/{} in {:?}",
                    self.name, attempt, policy.max_retries, delay
                );
                tokio::time::sleep(delay).await;
                if self.closing.load(Ordering::SeqCst) {
                    return;
                }

                match self.establish().await {
                    Ok(generation) => {
                        if self.promote(ConnectionState::Degraded, generation) {
                            info!("[{}] Reconnected", self.name);
                        } else {
                            self.teardown().await;
                        }
                        return;
                    }
                    Err(e @ ConnectionError::Protocol { .. }) => {
                        error!("[{}] Reconnect aborted: {}", self.name, e);
                        break;
                    }
                    Err(e) => warn!("[{}] Reconnect attempt {} failed: {}", self.name, attempt, e),
                }
            }

            if !self.closing.load(Ordering::SeqCst) {
                error!("[{}] Giving up reconnecting", self.name);
                self.transition(ConnectionState::Closed);
            }
        })
    }

    async fn teardown(&self) {
        self.outbound.lock().await.take();
        let link = self.link.lock().await.take();
        self.fail_pending(ConnectionError::transport(&self.name, "connection closed"))
            .await;

        let Some(mut link) = link else {
            return;
        };

        let grace = self.options.shutdown_grace;
        if tokio::time::timeout(grace, &mut link.writer).await.is_err() {
            link.writer.abort();
        }
        link.reader.abort();
        link.guard.shutdown(&self.name, grace).await;
    }
}
