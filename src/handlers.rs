use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;
use uuid::Uuid;

use crate::bridge::{ChatBridge, ToolCallOutcome};
use crate::composer::Composer;
use crate::config::Config;
use crate::error::ApiError;
use crate::gateway::Gateway;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub composer: Arc<Composer>,
    pub bridge: ChatBridge,
}

impl AppState {
    pub fn new(config: Config, composer: Arc<Composer>) -> Arc<Self> {
        Arc::new(Self {
            bridge: ChatBridge::new(Arc::clone(composer.registry())),
            config,
            composer,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Gateways
        .route("/mcp/:kit/sse", get(gateway_sse))
        .route("/mcp/:kit/messages", post(gateway_message))
        // Admin
        .route("/servers", get(list_servers))
        .route("/servers/:name/enable", post(enable_server))
        .route("/servers/:name/disable", post(disable_server))
        .route("/servers/:name/reconnect", post(reconnect_server))
        .route("/servers/:name/tools/:tool/enable", post(enable_tool))
        .route("/servers/:name/tools/:tool/disable", post(disable_tool))
        .route("/kits", get(list_kits))
        .route("/kits/:kit/tools", get(kit_tools))
        // Chat bridge
        .route("/v1/tools", get(bridge_tools))
        .route("/v1/tools/call", post(bridge_call))
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "kits": state.composer.gateways().map(|g| g.name()).collect::<Vec<_>>()
    }))
}

/// Removes the gateway session once its event stream is dropped.
struct SessionGuard {
    gateway: Arc<Gateway>,
    id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let gateway = Arc::clone(&self.gateway);
        let id = self.id;
        tokio::spawn(async move { gateway.close_session(id).await });
    }
}

/// Opens a gateway session. The first event names the endpoint the client
/// POSTs its messages to.
pub async fn gateway_sse(
    State(state): State<Arc<AppState>>,
    Path(kit): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let gateway = state.composer.resolve(&kit)?;
    let (session, rx) = gateway.open_session().await;
    let endpoint = gateway.messages_path(session.id);
    info!("Kit '{}': client attached, endpoint {}", kit, endpoint);

    let guard = SessionGuard {
        gateway,
        id: session.id,
    };

    let first = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    let messages = ReceiverStream::new(rx).map(move |message| {
        let _guard = &guard;
        Ok::<_, Infallible>(Event::default().event("message").data(message.to_string()))
    });

    Ok(Sse::new(first.chain(messages))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: Uuid,
}

pub async fn gateway_message(
    State(state): State<Arc<AppState>>,
    Path(kit): Path<String>,
    Query(query): Query<SessionQuery>,
    body: String,
) -> Result<StatusCode, ApiError> {
    if body.trim().is_empty() {
        return Err(ApiError::InvalidRequest("empty message body".to_string()));
    }

    let gateway = state.composer.resolve(&kit)?;
    let session = gateway
        .session(query.session_id)
        .await
        .ok_or_else(|| ApiError::SessionNotFound(query.session_id.to_string()))?;

    gateway.handle_frame(&session, &body).await;
    Ok(StatusCode::ACCEPTED)
}

pub async fn list_servers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let servers = state.composer.registry().status().await;
    Json(json!({ "servers": servers }))
}

async fn set_server(state: &AppState, name: &str, enabled: bool) -> Result<Json<Value>, ApiError> {
    state
        .composer
        .registry()
        .set_server_enabled(name, enabled)
        .await?;
    Ok(Json(json!({ "name": name, "enabled": enabled })))
}

pub async fn enable_server(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    set_server(&state, &name, true).await
}

pub async fn disable_server(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    set_server(&state, &name, false).await
}

async fn set_tool(
    state: &AppState,
    name: &str,
    tool: &str,
    enabled: bool,
) -> Result<Json<Value>, ApiError> {
    state
        .composer
        .registry()
        .set_tool_enabled(name, tool, enabled)
        .await?;
    Ok(Json(json!({ "name": name, "tool": tool, "enabled": enabled })))
}

pub async fn enable_tool(
    State(state): State<Arc<AppState>>,
    Path((name, tool)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    set_tool(&state, &name, &tool, true).await
}

pub async fn disable_tool(
    State(state): State<Arc<AppState>>,
    Path((name, tool)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    set_tool(&state, &name, &tool, false).await
}

pub async fn reconnect_server(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let connection_state = state.composer.registry().reconnect(&name).await?;
    Ok(Json(json!({ "name": name, "state": connection_state })))
}

pub async fn list_kits(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut kits = Vec::new();
    for gateway in state.composer.gateways() {
        kits.push(json!({
            "name": gateway.name(),
            "selectors": gateway.kit().selectors,
            "endpoint": format!("{}{}", state.config.proxy_url, gateway.sse_path()),
            "sessions": gateway.session_count().await,
        }));
    }
    Json(json!({ "kits": kits }))
}

pub async fn kit_tools(
    State(state): State<Arc<AppState>>,
    Path(kit): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let gateway = state.composer.resolve(&kit)?;
    let tools = gateway.list_tools().await;
    Ok(Json(json!({ "kit": kit, "tools": tools })))
}

/// Function definitions for every enabled tool.
pub async fn bridge_tools(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tools = state.bridge.function_tools().await;
    Json(json!({ "tools": tools }))
}

#[derive(Debug, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    /// A JSON object, or the JSON-encoded string a model produced.
    #[serde(default)]
    pub arguments: Value,
}

pub async fn bridge_call(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ToolCallRequest>,
) -> Json<ToolCallOutcome> {
    let arguments = match &request.arguments {
        Value::Null => String::new(),
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    };
    Json(state.bridge.execute(&request.name, &arguments).await)
}
