use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ComposerError;
use crate::kit::{Kit, Selector};
use crate::mcp::protocol::{
    is_supported_version, IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcResponse,
    RequestId, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND,
    MCP_PROTOCOL_VERSION, PARSE_ERROR,
};
use crate::mcp::Tool;
use crate::registry::{CatalogEvent, Registry};

const SESSION_BUFFER: usize = 64;

/// One client attached to a gateway over an event stream.
pub struct Session {
    pub id: Uuid,
    outbound: mpsc::Sender<Value>,
    protocol_version: RwLock<Option<String>>,
    initialized: RwLock<bool>,
    in_flight: Mutex<HashSet<RequestId>>,
}

impl Session {
    async fn push(&self, message: Value) {
        if self.outbound.send(message).await.is_err() {
            debug!("Session {} is gone, dropping message", self.id);
        }
    }

    pub async fn protocol_version(&self) -> Option<String> {
        self.protocol_version.read().await.clone()
    }
}

/// Serves one kit as an MCP server.
pub struct Gateway {
    kit: Kit,
    registry: Arc<Registry>,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl Gateway {
    /// Validates the kit against the registry: every named server must be
    /// registered and no tool id may be exposed by two enabled servers.
    pub async fn bind(kit: Kit, registry: Arc<Registry>) -> Result<Arc<Self>, ComposerError> {
        for server in kit.referenced_servers() {
            if !registry.contains(server).await {
                return Err(ComposerError::UnknownServer {
                    kit: kit.name.clone(),
                    server: server.to_string(),
                });
            }
        }

        if let Some((tool, servers)) = registry.collisions(&kit).await.into_iter().next() {
            return Err(ComposerError::ToolCollision {
                kit: kit.name.clone(),
                tool,
                servers,
            });
        }

        info!(
            "Bound kit '{}' ({})",
            kit.name,
            kit.selectors
                .iter()
                .map(Selector::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Arc::new(Self {
            kit,
            registry,
            sessions: RwLock::new(HashMap::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.kit.name
    }

    pub fn kit(&self) -> &Kit {
        &self.kit
    }

    pub fn sse_path(&self) -> String {
        format!("/mcp/{}/sse", self.kit.name)
    }

    pub fn messages_path(&self, session_id: Uuid) -> String {
        format!("/mcp/{}/messages?session_id={}", self.kit.name, session_id)
    }

    /// The kit's view of the catalog. A tool id that more than one server
    /// currently exposes is left out.
    pub async fn list_tools(&self) -> Vec<Tool> {
        let mut by_name: BTreeMap<String, Vec<Tool>> = BTreeMap::new();
        for tool in self.registry.catalog(Some(&self.kit)).await {
            by_name.entry(tool.name().to_string()).or_default().push(tool);
        }

        by_name
            .into_iter()
            .filter_map(|(name, mut tools)| {
                if tools.len() > 1 {
                    warn!(
                        "Kit '{}': tool '{}' exposed by {:?}, omitting",
                        self.kit.name,
                        name,
                        tools.iter().map(|t| t.server.as_str()).collect::<Vec<_>>()
                    );
                    return None;
                }
                tools.pop()
            })
            .collect()
    }

    pub async fn call_tool(
        &self,
        origin: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value, ComposerError> {
        let owners = self.registry.owners(&self.kit, name).await;
        let exposed: Vec<&str> = owners
            .iter()
            .filter(|o| o.exposed)
            .map(|o| o.server.as_str())
            .collect();

        let server = match (exposed.as_slice(), owners.first()) {
            ([server], _) => *server,
            ([], Some(owner)) => owner.server.as_str(),
            ([], None) => {
                return Err(ComposerError::ToolNotFound {
                    scope: format!("kit '{}'", self.kit.name),
                    tool: name.to_string(),
                })
            }
            (servers, _) => {
                return Err(ComposerError::ToolCollision {
                    kit: self.kit.name.clone(),
                    tool: name.to_string(),
                    servers: servers.iter().map(|s| s.to_string()).collect(),
                })
            }
        };

        // With no exposed owner this still goes through the registry so the
        // caller learns why the tool is unavailable.
        self.registry.invoke_from(origin, server, name, arguments).await
    }

    pub async fn open_session(&self) -> (Arc<Session>, mpsc::Receiver<Value>) {
        let (outbound, rx) = mpsc::channel(SESSION_BUFFER);
        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            outbound,
            protocol_version: RwLock::new(None),
            initialized: RwLock::new(false),
            in_flight: Mutex::new(HashSet::new()),
        });

        self.sessions
            .write()
            .await
            .insert(session.id, Arc::clone(&session));
        info!("Kit '{}': session {} opened", self.kit.name, session.id);
        (session, rx)
    }

    pub async fn session(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn close_session(&self, id: Uuid) {
        if self.sessions.write().await.remove(&id).is_some() {
            info!("Kit '{}': session {} closed", self.kit.name, id);
        }
    }

    /// Forgets every session; their event streams end once in-flight
    /// answers are delivered.
    pub async fn close_all_sessions(&self) {
        let closed = self.sessions.write().await.drain().count();
        if closed > 0 {
            info!("Kit '{}': closed {} sessions", self.kit.name, closed);
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Accepts one raw frame from a session. Requests are answered on the
    /// session's stream from their own task, so a slow call never holds up
    /// the next request.
    pub async fn handle_frame(self: &Arc<Self>, session: &Arc<Session>, frame: &str) {
        let value: Value = match serde_json::from_str(frame) {
            Ok(value) => value,
            Err(e) => {
                let error = JsonRpcError::new(PARSE_ERROR, format!("Parse error: {}", e));
                session.push(to_value(JsonRpcResponse::failure(None, error))).await;
                return;
            }
        };

        let message = match IncomingMessage::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                let error = JsonRpcError::new(INVALID_REQUEST, format!("Invalid request: {}", e));
                session.push(to_value(JsonRpcResponse::failure(None, error))).await;
                return;
            }
        };

        match message {
            IncomingMessage::Request { id, method, params } => {
                if !session.in_flight.lock().await.insert(id.clone()) {
                    let error = JsonRpcError::new(
                        INVALID_REQUEST,
                        format!("Request id {} is already in flight", id),
                    );
                    session
                        .push(to_value(JsonRpcResponse::failure(Some(id), error)))
                        .await;
                    return;
                }

                let gateway = Arc::clone(self);
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    let response = gateway.respond(&session, id.clone(), &method, params).await;
                    session.in_flight.lock().await.remove(&id);
                    session.push(to_value(response)).await;
                });
            }
            IncomingMessage::Notification { method, .. } => match method.as_str() {
                "notifications/initialized" => {
                    *session.initialized.write().await = true;
                    debug!(
                        "Session {} initialized (protocol {:?})",
                        session.id,
                        session.protocol_version().await
                    );
                }
                other => debug!("Session {}: notification '{}'", session.id, other),
            },
            IncomingMessage::Response { id, .. } => {
                debug!("Session {}: ignoring response {}", session.id, id);
            }
        }
    }

    async fn respond(
        &self,
        session: &Session,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        match method {
            "initialize" => {
                let requested = params
                    .as_ref()
                    .and_then(|p| p.get("protocolVersion"))
                    .and_then(Value::as_str)
                    .unwrap_or(MCP_PROTOCOL_VERSION);
                let negotiated = if is_supported_version(requested) {
                    requested
                } else {
                    MCP_PROTOCOL_VERSION
                };
                *session.protocol_version.write().await = Some(negotiated.to_string());

                JsonRpcResponse::success(
                    id,
                    json!({
                        "protocolVersion": negotiated,
                        "capabilities": { "tools": { "listChanged": true } },
                        "serverInfo": {
                            "name": format!("{}-{}", env!("CARGO_PKG_NAME"), self.kit.name),
                            "version": env!("CARGO_PKG_VERSION")
                        }
                    }),
                )
            }
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                let tools: Vec<Value> = self
                    .list_tools()
                    .await
                    .iter()
                    .map(|t| serde_json::to_value(&t.descriptor).unwrap_or(Value::Null))
                    .collect();
                JsonRpcResponse::success(id, json!({ "tools": tools }))
            }
            "tools/call" => {
                let params = params.unwrap_or(Value::Null);
                let Some(name) = params.get("name").and_then(Value::as_str) else {
                    return JsonRpcResponse::failure(
                        Some(id),
                        JsonRpcError::new(INVALID_PARAMS, "Missing tool name"),
                    );
                };
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                let origin = format!("{}:{}", self.kit.name, session.id);

                match self.call_tool(&origin, name, arguments).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(err) => call_failure(id, err),
                }
            }
            other => JsonRpcResponse::failure(
                Some(id),
                JsonRpcError::new(METHOD_NOT_FOUND, format!("Method not found: {}", other)),
            ),
        }
    }

    async fn notify_tools_changed(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let notification = to_value(JsonRpcNotification::new(
            "notifications/tools/list_changed",
            None,
        ));

        for session in sessions {
            if !*session.initialized.read().await {
                continue;
            }
            if session.outbound.try_send(notification.clone()).is_err() {
                debug!("Session {}: list_changed not delivered", session.id);
            }
        }
    }

    fn affected_by(&self, event: &CatalogEvent) -> bool {
        let server = match event {
            CatalogEvent::ServerState { server, .. }
            | CatalogEvent::ToolsChanged { server }
            | CatalogEvent::FlagsChanged { server } => server,
        };
        self.kit.selectors.iter().any(|s| match s.server() {
            None => true,
            Some(name) => name == server,
        })
    }

    /// Forwards registry changes relevant to this kit to open sessions.
    pub fn watch_catalog(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<CatalogEvent>,
    ) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if gateway.affected_by(&event) {
                            gateway.notify_tools_changed().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Kit '{}': skipped {} catalog events", gateway.kit.name, skipped);
                        gateway.notify_tools_changed().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Maps a failed call onto the wire. Unknown tools and downstream JSON-RPC
/// errors are protocol errors; everything else is a tool result flagged
/// `isError` so the client model can read it.
fn call_failure(id: RequestId, err: ComposerError) -> JsonRpcResponse {
    match err {
        ComposerError::ToolNotFound { .. } => {
            JsonRpcResponse::failure(Some(id), JsonRpcError::new(INVALID_PARAMS, err.to_string()))
        }
        ComposerError::Remote { error, .. } => JsonRpcResponse::failure(Some(id), error),
        other => JsonRpcResponse::success(
            id,
            json!({
                "content": [{ "type": "text", "text": other.to_string() }],
                "isError": true
            }),
        ),
    }
}

fn to_value(message: impl serde::Serialize) -> Value {
    serde_json::to_value(message).unwrap_or_else(|e| {
        json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": { "code": INTERNAL_ERROR, "message": e.to_string() }
        })
    })
}
