use anyhow::{Context, Result};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ComposerError;
use crate::kit::Kit;
use crate::mcp::backoff::BackoffPolicy;
use crate::mcp::{ConnectionOptions, TransportSpec};
use crate::registry::ServerConfig;

/// Kit created when the servers file defines none.
pub const DEFAULT_KIT: &str = "composer";

#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub servers_config_path: String,
    /// Public base URL gateways are advertised under.
    pub proxy_url: String,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            server_host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: parse_var("PORT", 8000),
            servers_config_path: env::var("MCP_SERVERS_CONFIG_PATH")
                .unwrap_or_else(|_| "mcp_servers.json".to_string()),
            proxy_url: env::var("MCP_COMPOSER_PROXY_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string())
                .trim_end_matches('/')
                .to_string(),
            request_timeout: Duration::from_secs(parse_var("MCP_REQUEST_TIMEOUT_SECS", 60)),
            handshake_timeout: Duration::from_secs(parse_var("MCP_HANDSHAKE_TIMEOUT_SECS", 30)),
            backoff: BackoffPolicy {
                max_retries: parse_var("MCP_RECONNECT_MAX_RETRIES", 3),
                initial_delay: Duration::from_millis(parse_var("MCP_RECONNECT_INITIAL_MS", 500)),
                max_delay: Duration::from_millis(parse_var("MCP_RECONNECT_MAX_MS", 10_000)),
            },
            shutdown_grace: Duration::from_secs(parse_var("MCP_SHUTDOWN_GRACE_SECS", 5)),
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            request_timeout: self.request_timeout,
            handshake_timeout: self.handshake_timeout,
            shutdown_grace: self.shutdown_grace,
            backoff: self.backoff,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", name, value);
            default
        }),
        Err(_) => default,
    }
}

/// One entry under `mcpServers`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(rename = "type", default)]
    pub transport_type: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub disabled_tools: Vec<String>,
    /// Invocation deadline in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl ServerEntry {
    fn transport(&self) -> Option<TransportSpec> {
        let stdio = || {
            self.command.as_ref().map(|command| TransportSpec::Stdio {
                command: command.clone(),
                args: self.args.clone(),
                env: self.env.clone(),
            })
        };
        let sse = || self.url.as_ref().map(|url| TransportSpec::Sse { url: url.clone() });

        match self.transport_type.as_deref() {
            Some("stdio") => stdio(),
            Some("sse") => sse(),
            Some(_) => None,
            None => stdio().or_else(sse),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServersFile {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, ServerEntry>,
    #[serde(default)]
    pub kits: BTreeMap<String, Vec<String>>,
}

impl ServersFile {
    /// Reads the file, expanding `${VAR}` references first. A missing file
    /// means no downstream servers.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Servers file {} not found, starting without servers", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let content = expand_env_vars(&content)?;
        let file: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        info!(
            "Loaded {} MCP servers and {} kits from {}",
            file.mcp_servers.len(),
            file.kits.len(),
            path.display()
        );
        Ok(file)
    }

    /// Server configs; entries without a usable transport are skipped.
    pub fn servers(&self) -> Vec<ServerConfig> {
        self.mcp_servers
            .iter()
            .filter_map(|(name, entry)| {
                let Some(transport) = entry.transport() else {
                    warn!(
                        "Skipping MCP server {}: needs 'command' or 'url' matching type {:?}",
                        name, entry.transport_type
                    );
                    return None;
                };

                let mut config = ServerConfig::new(name.as_str(), transport);
                config.enabled = !entry.disabled;
                config.disabled_tools = entry.disabled_tools.iter().cloned().collect::<HashSet<_>>();
                config.timeout = entry.timeout.map(Duration::from_secs);
                Some(config)
            })
            .collect()
    }

    pub fn kits(&self) -> Result<Vec<Kit>, ComposerError> {
        if self.kits.is_empty() {
            return Ok(vec![Kit::everything(DEFAULT_KIT)]);
        }

        self.kits
            .iter()
            .map(|(name, selectors)| Kit::parse(name, selectors))
            .collect()
    }
}

fn expand_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{(\w+)\}").context("Invalid env var pattern")?;
    let expanded = re.replace_all(content, |caps: &Captures| {
        env::var(&caps[1]).unwrap_or_default()
    });
    Ok(expanded.into_owned())
}
