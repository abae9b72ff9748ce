use futures::future::join_all;
use reqwest::Client as HttpClient;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::ComposerError;
use crate::kit::Kit;
use crate::mcp::transport::{connector_for, Connector};
use crate::mcp::types::ToolStatus;
use crate::mcp::{
    Connection, ConnectionEvent, ConnectionOptions, ConnectionState, McpServerInfo,
    StateObserver, Tool, TransportSpec,
};

/// Everything needed to start one downstream server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub transport: TransportSpec,
    pub enabled: bool,
    pub disabled_tools: HashSet<String>,
    /// Overrides the default invocation deadline for this server.
    pub timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, transport: TransportSpec) -> Self {
        Self {
            name: name.into(),
            transport,
            enabled: true,
            disabled_tools: HashSet::new(),
            timeout: None,
        }
    }
}

/// Published whenever what the registry exposes may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    ServerState {
        server: String,
        state: ConnectionState,
    },
    ToolsChanged {
        server: String,
    },
    FlagsChanged {
        server: String,
    },
}

struct EventForwarder {
    events: broadcast::Sender<CatalogEvent>,
}

impl StateObserver for EventForwarder {
    fn on_event(&self, server: &str, event: ConnectionEvent) {
        let event = match event {
            ConnectionEvent::StateChanged { to, .. } => CatalogEvent::ServerState {
                server: server.to_string(),
                state: to,
            },
            ConnectionEvent::ToolsChanged => CatalogEvent::ToolsChanged {
                server: server.to_string(),
            },
        };
        debug!("Catalog event: {:?}", event);
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

struct Entry {
    connection: Arc<Connection>,
    enabled: bool,
    tool_flags: HashMap<String, bool>,
}

impl Entry {
    fn tool_enabled(&self, tool: &str) -> bool {
        self.tool_flags.get(tool).copied().unwrap_or(true)
    }
}

/// A consistent copy of one entry's flags, taken under the read lock.
struct ServerView {
    name: String,
    enabled: bool,
    connection: Arc<Connection>,
    tool_flags: HashMap<String, bool>,
}

impl ServerView {
    fn tool_enabled(&self, tool: &str) -> bool {
        self.tool_flags.get(tool).copied().unwrap_or(true)
    }
}

/// A server that discovered a given tool id within some kit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOwner {
    pub server: String,
    /// Server and tool enabled and the connection ready.
    pub exposed: bool,
}

pub struct Registry {
    entries: RwLock<BTreeMap<String, Entry>>,
    events: broadcast::Sender<CatalogEvent>,
    options: ConnectionOptions,
    http_client: HttpClient,
}

impl Registry {
    pub fn new(options: ConnectionOptions, http_client: HttpClient) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            events,
            options,
            http_client,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    pub async fn register(&self, config: ServerConfig) -> Result<(), ComposerError> {
        let connector = connector_for(
            &config.transport,
            &self.http_client,
            self.options.handshake_timeout,
        );
        self.register_with_connector(config, connector).await
    }

    /// Adds the entry, then connects. A server whose first connection fails
    /// stays registered in the `Closed` state and can be reconnected later.
    pub async fn register_with_connector(
        &self,
        config: ServerConfig,
        connector: Box<dyn Connector>,
    ) -> Result<(), ComposerError> {
        let mut options = self.options.clone();
        if let Some(timeout) = config.timeout {
            options.request_timeout = timeout;
        }

        let observer = Arc::new(EventForwarder {
            events: self.events.clone(),
        });
        let connection = Arc::new(Connection::new(&config.name, connector, options, observer));

        {
            let mut entries = self.entries.write().await;
            if entries.contains_key(&config.name) {
                return Err(ComposerError::DuplicateServer(config.name));
            }
            entries.insert(
                config.name.clone(),
                Entry {
                    connection: Arc::clone(&connection),
                    enabled: config.enabled,
                    tool_flags: config
                        .disabled_tools
                        .iter()
                        .map(|tool| (tool.clone(), false))
                        .collect(),
                },
            );
        }

        info!(
            "Registered MCP server: {} ({}, {})",
            config.name,
            connection.transport_kind(),
            if config.enabled { "enabled" } else { "disabled" }
        );
        connection.connect().await?;
        Ok(())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    pub async fn set_server_enabled(&self, name: &str, enabled: bool) -> Result<(), ComposerError> {
        {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| ComposerError::ServerNotFound(name.to_string()))?;
            entry.enabled = enabled;
        }

        info!(
            "{} MCP server: {}",
            if enabled { "Enabled" } else { "Disabled" },
            name
        );
        let _ = self.events.send(CatalogEvent::FlagsChanged {
            server: name.to_string(),
        });
        Ok(())
    }

    /// Flags for tools not discovered yet are kept and apply once they are.
    pub async fn set_tool_enabled(
        &self,
        name: &str,
        tool: &str,
        enabled: bool,
    ) -> Result<(), ComposerError> {
        {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| ComposerError::ServerNotFound(name.to_string()))?;
            entry.tool_flags.insert(tool.to_string(), enabled);
        }

        info!(
            "{} tool {} on MCP server {}",
            if enabled { "Enabled" } else { "Disabled" },
            tool,
            name
        );
        let _ = self.events.send(CatalogEvent::FlagsChanged {
            server: name.to_string(),
        });
        Ok(())
    }

    async fn snapshot(&self) -> Vec<ServerView> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(name, entry)| ServerView {
                name: name.clone(),
                enabled: entry.enabled,
                connection: Arc::clone(&entry.connection),
                tool_flags: entry.tool_flags.clone(),
            })
            .collect()
    }

    /// Tools that can be invoked right now: server enabled and ready, tool
    /// enabled, optionally restricted to what `kit` selects.
    pub async fn catalog(&self, kit: Option<&Kit>) -> Vec<Tool> {
        let mut catalog = Vec::new();

        for view in self.snapshot().await {
            if !view.enabled || view.connection.state() != ConnectionState::Ready {
                continue;
            }
            for tool in view.connection.list_tools().await.iter() {
                if !view.tool_enabled(tool.name()) {
                    continue;
                }
                if kit.map_or(true, |k| k.matches(&view.name, tool.name())) {
                    catalog.push(tool.clone());
                }
            }
        }

        catalog
    }

    /// Servers selected by `kit` that discovered `tool`, whatever their
    /// flags and state.
    pub async fn owners(&self, kit: &Kit, tool: &str) -> Vec<ToolOwner> {
        let mut owners = Vec::new();

        for view in self.snapshot().await {
            if !kit.matches(&view.name, tool) {
                continue;
            }
            let tools = view.connection.list_tools().await;
            if !tools.iter().any(|t| t.name() == tool) {
                continue;
            }
            owners.push(ToolOwner {
                exposed: view.enabled
                    && view.tool_enabled(tool)
                    && view.connection.state() == ConnectionState::Ready,
                server: view.name,
            });
        }

        owners
    }

    /// Tool ids that more than one enabled server would expose through
    /// `kit`, with the servers involved. Connection state is ignored so a
    /// server that is only temporarily down still counts.
    pub async fn collisions(&self, kit: &Kit) -> Vec<(String, Vec<String>)> {
        let mut by_tool: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for view in self.snapshot().await {
            if !view.enabled {
                continue;
            }
            for tool in view.connection.list_tools().await.iter() {
                if view.tool_enabled(tool.name()) && kit.matches(&view.name, tool.name()) {
                    by_tool
                        .entry(tool.name().to_string())
                        .or_default()
                        .push(view.name.clone());
                }
            }
        }

        by_tool
            .into_iter()
            .filter(|(_, servers)| servers.len() > 1)
            .collect()
    }

    #[cfg(test)]
    pub async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, ComposerError> {
        self.invoke_from("registry", server, tool, arguments).await
    }

    /// Checks both flags under the read lock, then calls the connection
    /// outside it.
    pub async fn invoke_from(
        &self,
        origin: &str,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, ComposerError> {
        let connection = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(server)
                .ok_or_else(|| ComposerError::ServerNotFound(server.to_string()))?;
            if !entry.enabled {
                return Err(ComposerError::ServerDisabled(server.to_string()));
            }
            if !entry.tool_enabled(tool) {
                return Err(ComposerError::ToolDisabled {
                    server: server.to_string(),
                    tool: tool.to_string(),
                });
            }
            Arc::clone(&entry.connection)
        };

        debug!("[{}] Invoking {} for {}", server, tool, origin);
        connection
            .invoke_from(origin, tool, arguments)
            .await
            .map_err(ComposerError::from)
    }

    pub async fn status(&self) -> Vec<McpServerInfo> {
        let mut status = Vec::new();

        for view in self.snapshot().await {
            let tools: Vec<ToolStatus> = view
                .connection
                .list_tools()
                .await
                .iter()
                .map(|t| ToolStatus {
                    name: t.name().to_string(),
                    enabled: view.tool_enabled(t.name()),
                })
                .collect();

            status.push(McpServerInfo {
                enabled: view.enabled,
                state: view.connection.state(),
                transport_type: view.connection.transport_kind().to_string(),
                tools_count: tools.len(),
                tools,
                in_flight: view.connection.in_flight().await,
                name: view.name,
            });
        }

        status
    }

    /// Reconnects a server that gave up. Servers in any other state are left
    /// alone; the resulting state is returned.
    pub async fn reconnect(&self, name: &str) -> Result<ConnectionState, ComposerError> {
        let connection = self
            .entries
            .read()
            .await
            .get(name)
            .map(|entry| Arc::clone(&entry.connection))
            .ok_or_else(|| ComposerError::ServerNotFound(name.to_string()))?;

        info!("Reconnecting MCP server: {}", name);
        Ok(connection.connect().await?)
    }

    /// Closes every connection concurrently, bounded by `grace` overall.
    pub async fn shutdown(&self, grace: Duration) {
        let connections: Vec<Arc<Connection>> = self
            .entries
            .read()
            .await
            .values()
            .map(|entry| Arc::clone(&entry.connection))
            .collect();

        info!("Closing {} MCP connections", connections.len());
        let closes = join_all(connections.iter().map(|c| c.close()));
        if tokio::time::timeout(grace, closes).await.is_err() {
            warn!("MCP connections did not close within {:?}", grace);
        }
    }
}

/// Registers every server concurrently; one failing does not stop the rest.
pub async fn register_all(registry: &Registry, configs: Vec<ServerConfig>) {
    let results = join_all(configs.into_iter().map(|config| {
        let name = config.name.clone();
        async move { (name, registry.register(config).await) }
    }))
    .await;

    for (name, result) in results {
        match result {
            Ok(()) => info!("Connected to MCP server: {}", name),
            Err(e) => error!("Failed to connect to MCP server {}: {}", name, e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mcp::backoff::BackoffPolicy;
    use crate::mcp::testing::{FakeControl, FakeServer, ToolBehavior};
    use serde_json::json;

    pub(crate) fn test_options() -> ConnectionOptions {
        ConnectionOptions {
            request_timeout: Duration::from_millis(300),
            handshake_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(100),
            backoff: BackoffPolicy {
                max_retries: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
            },
        }
    }

    pub(crate) async fn add_fake(registry: &Registry, name: &str, server: FakeServer) -> FakeControl {
        let (connector, control) = server.connector();
        let config = ServerConfig::new(
            name,
            TransportSpec::Stdio {
                command: "fake".to_string(),
                args: vec![],
                env: HashMap::new(),
            },
        );
        registry
            .register_with_connector(config, Box::new(connector))
            .await
            .unwrap();
        control
    }

    fn text(value: &str) -> ToolBehavior {
        ToolBehavior::Text(value.to_string())
    }

    fn pairs(tools: &[Tool]) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = tools
            .iter()
            .map(|t| (t.server.clone(), t.name().to_string()))
            .collect();
        pairs.sort();
        pairs
    }

    #[tokio::test]
    async fn catalog_honours_every_flag_combination() {
        let registry = Registry::new(test_options(), HttpClient::new());
        add_fake(&registry, "a", FakeServer::new().tool("x", text("x")).tool("y", text("y"))).await;
        add_fake(&registry, "b", FakeServer::new().tool("z", text("z"))).await;

        let tools = [("a", "x"), ("a", "y"), ("b", "z")];
        for mask in 0u32..32 {
            let server_a = mask & 1 != 0;
            let server_b = mask & 2 != 0;
            registry.set_server_enabled("a", server_a).await.unwrap();
            registry.set_server_enabled("b", server_b).await.unwrap();
            for (i, (server, tool)) in tools.iter().enumerate() {
                registry
                    .set_tool_enabled(server, tool, mask & (4 << i) != 0)
                    .await
                    .unwrap();
            }

            let expected: Vec<(String, String)> = tools
                .iter()
                .enumerate()
                .filter(|(i, (server, _))| {
                    let server_on = if *server == "a" { server_a } else { server_b };
                    server_on && mask & (4u32 << *i) != 0
                })
                .map(|(_, (s, t))| (s.to_string(), t.to_string()))
                .collect();

            assert_eq!(pairs(&registry.catalog(None).await), expected, "mask {:05b}", mask);
        }
    }

    #[tokio::test]
    async fn disabling_a_server_keeps_its_connection() {
        let registry = Registry::new(test_options(), HttpClient::new());
        let time = add_fake(&registry, "time", FakeServer::new().tool("get_time", text("12:00"))).await;
        add_fake(&registry, "weather", FakeServer::new().tool("get_forecast", text("sun"))).await;

        let basic = Kit::parse("basic", &["time"]).unwrap();
        let all = Kit::everything("all");

        registry.set_server_enabled("time", false).await.unwrap();

        assert!(registry.catalog(Some(&basic)).await.is_empty());
        assert_eq!(
            pairs(&registry.catalog(Some(&all)).await),
            vec![("weather".to_string(), "get_forecast".to_string())]
        );

        let status = registry.status().await;
        let time_status = status.iter().find(|s| s.name == "time").unwrap();
        assert!(!time_status.enabled);
        assert_eq!(time_status.state, ConnectionState::Ready);
        assert_eq!(time.opens(), 1);

        registry.set_server_enabled("time", true).await.unwrap();
        assert_eq!(registry.catalog(Some(&basic)).await.len(), 1);
        assert_eq!(time.opens(), 1);
    }

    #[tokio::test]
    async fn disabled_tool_is_rejected_without_a_transport_call() {
        let registry = Registry::new(test_options(), HttpClient::new());
        let control = add_fake(&registry, "time", FakeServer::new().tool("get_time", text("12:00"))).await;

        registry.set_tool_enabled("time", "get_time", false).await.unwrap();
        let err = registry.invoke("time", "get_time", json!({})).await.unwrap_err();
        assert!(matches!(err, ComposerError::ToolDisabled { .. }));

        registry.set_server_enabled("time", false).await.unwrap();
        let err = registry.invoke("time", "get_time", json!({})).await.unwrap_err();
        assert!(matches!(err, ComposerError::ServerDisabled(_)));

        assert_eq!(control.calls(), 0);
    }

    #[tokio::test]
    async fn invoke_routes_to_the_named_server() {
        let registry = Registry::new(test_options(), HttpClient::new());
        add_fake(&registry, "time", FakeServer::new().tool("get_time", text("12:00"))).await;

        let result = registry.invoke("time", "get_time", json!({})).await.unwrap();
        assert_eq!(result["content"][0]["text"], "12:00");

        let err = registry.invoke("nope", "get_time", json!({})).await.unwrap_err();
        assert!(matches!(err, ComposerError::ServerNotFound(_)));

        let err = registry.invoke("time", "nope", json!({})).await.unwrap_err();
        assert!(matches!(err, ComposerError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn overlapping_kits_see_one_registry_state() {
        let registry = Registry::new(test_options(), HttpClient::new());
        add_fake(
            &registry,
            "time",
            FakeServer::new()
                .tool("get_time", text("12:00"))
                .tool("convert_time", text("13:00")),
        )
        .await;

        let whole = Kit::parse("whole", &["time"]).unwrap();
        let single = Kit::parse("single", &["time/get_time"]).unwrap();
        assert_eq!(registry.catalog(Some(&whole)).await.len(), 2);
        assert_eq!(registry.catalog(Some(&single)).await.len(), 1);

        registry.set_tool_enabled("time", "get_time", false).await.unwrap();
        assert_eq!(registry.catalog(Some(&whole)).await.len(), 1);
        assert!(registry.catalog(Some(&single)).await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = Registry::new(test_options(), HttpClient::new());
        add_fake(&registry, "time", FakeServer::new()).await;

        let (connector, _) = FakeServer::new().connector();
        let config = ServerConfig::new("time", TransportSpec::Sse { url: "http://x".to_string() });
        let err = registry
            .register_with_connector(config, Box::new(connector))
            .await
            .unwrap_err();
        assert!(matches!(err, ComposerError::DuplicateServer(_)));
    }

    #[tokio::test]
    async fn catalog_drops_servers_while_degraded_and_closed() {
        let registry = Registry::new(test_options(), HttpClient::new());
        let control = add_fake(&registry, "time", FakeServer::new().tool("get_time", text("12:00"))).await;
        let mut events = registry.subscribe();

        control.refuse_connections(true);
        control.kill();

        loop {
            match events.recv().await.unwrap() {
                CatalogEvent::ServerState { state: ConnectionState::Degraded, .. } => {
                    assert!(registry.catalog(None).await.is_empty());
                }
                CatalogEvent::ServerState { state: ConnectionState::Closed, .. } => break,
                _ => {}
            }
        }
        assert!(registry.catalog(None).await.is_empty());

        control.refuse_connections(false);
        let state = registry.reconnect("time").await.unwrap();
        assert_eq!(state, ConnectionState::Ready);
        assert_eq!(registry.catalog(None).await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reconnects_open_one_transport() {
        let registry = Arc::new(Registry::new(test_options(), HttpClient::new()));
        let (connector, control) = FakeServer::new().tool("get_time", text("12:00")).connector();
        control.refuse_connections(true);
        let config = ServerConfig::new("time", TransportSpec::Sse { url: "http://x".to_string() });
        assert!(registry
            .register_with_connector(config, Box::new(connector))
            .await
            .is_err());
        assert_eq!(control.opens(), 1);

        control.refuse_connections(false);
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.reconnect("time").await })
            })
            .collect();
        for attempt in join_all(attempts).await {
            assert!(attempt.unwrap().is_ok());
        }

        assert_eq!(control.opens(), 2);
        let status = registry.status().await;
        assert_eq!(status[0].state, ConnectionState::Ready);
    }

    #[tokio::test]
    async fn failed_first_connect_keeps_the_entry() {
        let registry = Registry::new(test_options(), HttpClient::new());
        let (connector, control) = FakeServer::new().tool("get_time", text("12:00")).connector();
        control.refuse_connections(true);

        let config = ServerConfig::new("time", TransportSpec::Sse { url: "http://x".to_string() });
        let err = registry
            .register_with_connector(config, Box::new(connector))
            .await
            .unwrap_err();
        assert!(matches!(err, ComposerError::Transport { .. }));

        let status = registry.status().await;
        assert_eq!(status[0].state, ConnectionState::Closed);
        assert_eq!(status[0].transport_type, "fake");
    }

    #[tokio::test]
    async fn disabled_tools_from_config_start_disabled() {
        let registry = Registry::new(test_options(), HttpClient::new());
        let (connector, _) = FakeServer::new()
            .tool("get_time", text("12:00"))
            .tool("set_time", text("ok"))
            .connector();
        let mut config = ServerConfig::new("time", TransportSpec::Sse { url: "http://x".to_string() });
        config.disabled_tools.insert("set_time".to_string());
        registry
            .register_with_connector(config, Box::new(connector))
            .await
            .unwrap();

        let names: Vec<String> = registry
            .catalog(None)
            .await
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["get_time"]);

        let status = registry.status().await;
        assert!(status[0].tools.iter().any(|t| t.name == "set_time" && !t.enabled));
    }

    #[tokio::test]
    async fn shutdown_closes_all_connections() {
        let registry = Registry::new(test_options(), HttpClient::new());
        add_fake(&registry, "a", FakeServer::new()).await;
        add_fake(&registry, "b", FakeServer::new()).await;

        registry.shutdown(Duration::from_secs(1)).await;

        for status in registry.status().await {
            assert_eq!(status.state, ConnectionState::Closed);
        }
    }
}
