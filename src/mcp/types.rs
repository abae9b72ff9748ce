use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Tool as described on the wire by a downstream `tools/list` response.
/// Fields other than the three the composer needs are carried through
/// untouched so gateways can re-expose them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

/// A discovered tool together with the server that owns it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tool {
    pub server: String,
    #[serde(flatten)]
    pub descriptor: McpTool,
}

impl Tool {
    pub fn new(server: impl Into<String>, descriptor: McpTool) -> Self {
        Self {
            server: server.into(),
            descriptor,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn description(&self) -> Option<&str> {
        self.descriptor.description.as_deref()
    }

    pub fn input_schema(&self) -> &Value {
        &self.descriptor.input_schema
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Ready,
    Degraded,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Pending,
    Completed,
    Failed,
    TimedOut,
}

/// Snapshot of an in-flight request to a downstream server.
#[derive(Debug, Clone, Serialize)]
pub struct PendingInvocation {
    pub id: i64,
    pub origin: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub state: InvocationState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct McpServerInfo {
    pub name: String,
    pub enabled: bool,
    pub state: ConnectionState,
    pub transport_type: String,
    pub tools_count: usize,
    pub tools: Vec<ToolStatus>,
    pub in_flight: Vec<PendingInvocation>,
}
