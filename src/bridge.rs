use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ComposerError;
use crate::mcp::Tool;
use crate::registry::Registry;

/// Tool definition in the function-calling shape chat completion APIs take.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Result of a model-requested tool call, ready to be fed back as a tool
/// message.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallOutcome {
    pub name: String,
    pub result: String,
    pub success: bool,
}

pub fn qualified_name(server: &str, tool: &str) -> String {
    format!("mcp_{}_{}", server, tool)
}

/// Lets a chat loop see and call everything the registry exposes.
pub struct ChatBridge {
    registry: Arc<Registry>,
}

impl ChatBridge {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub async fn list_all_enabled_tools(&self) -> Vec<Tool> {
        self.registry.catalog(None).await
    }

    pub async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, ComposerError> {
        self.registry.invoke_from("chat", server, tool, arguments).await
    }

    pub async fn function_tools(&self) -> Vec<FunctionTool> {
        self.list_all_enabled_tools()
            .await
            .into_iter()
            .map(|tool| FunctionTool {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: qualified_name(&tool.server, tool.name()),
                    description: tool
                        .description()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("MCP tool from {}", tool.server)),
                    parameters: tool.input_schema().clone(),
                },
            })
            .collect()
    }

    /// Runs a call the model asked for. Names are matched against the current
    /// catalog, so servers and tools containing underscores resolve correctly.
    pub async fn execute(&self, name: &str, args_json: &str) -> ToolCallOutcome {
        match self.execute_inner(name, args_json).await {
            Ok((text, success)) => ToolCallOutcome {
                name: name.to_string(),
                result: text,
                success,
            },
            Err(e) => {
                warn!("Tool call {} failed: {}", name, e);
                ToolCallOutcome {
                    name: name.to_string(),
                    result: format!("Error: {}", e),
                    success: false,
                }
            }
        }
    }

    async fn execute_inner(&self, name: &str, args_json: &str) -> Result<(String, bool), ComposerError> {
        let (server, tool) = self.resolve(name).await?;

        let arguments: Value = if args_json.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(args_json).map_err(|e| ComposerError::InvalidArguments {
                tool: name.to_string(),
                reason: e.to_string(),
            })?
        };

        info!("Executing MCP tool {} on {}", tool, server);
        let result = self.invoke(&server, &tool, arguments).await?;
        let success = !result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok((extract_text(&result), success))
    }

    async fn resolve(&self, name: &str) -> Result<(String, String), ComposerError> {
        let matches: Vec<(String, String)> = self
            .list_all_enabled_tools()
            .await
            .into_iter()
            .filter(|t| qualified_name(&t.server, t.name()) == name)
            .map(|t| (t.server.clone(), t.name().to_string()))
            .collect();

        match matches.as_slice() {
            [single] => Ok(single.clone()),
            [] => Err(ComposerError::ToolNotFound {
                scope: "the chat catalog".to_string(),
                tool: name.to_string(),
            }),
            many => Err(ComposerError::ToolCollision {
                kit: "chat".to_string(),
                tool: name.to_string(),
                servers: many.iter().map(|(server, _)| server.clone()).collect(),
            }),
        }
    }
}

/// Folds a `tools/call` result into plain text. Binary content is replaced
/// by a short marker.
pub fn extract_text(result: &Value) -> String {
    let Some(content) = result.get("content") else {
        return result.to_string();
    };
    let Some(items) = content.as_array() else {
        return content.to_string();
    };

    items
        .iter()
        .map(|item| match item.get("type").and_then(Value::as_str) {
            Some("text") | None => item
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| item.to_string()),
            Some("image") | Some("audio") => format!(
                "[{} content: {}]",
                item["type"].as_str().unwrap_or_default(),
                item.get("mimeType").and_then(Value::as_str).unwrap_or("unknown")
            ),
            Some("resource") => item
                .pointer("/resource/text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| "[embedded resource]".to_string()),
            Some(other) => format!("[{} content]", other),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::{FakeServer, ToolBehavior};
    use crate::registry::tests::{add_fake, test_options};
    use reqwest::Client as HttpClient;

    async fn bridge() -> (ChatBridge, Arc<Registry>) {
        let registry = Arc::new(Registry::new(test_options(), HttpClient::new()));
        add_fake(
            &registry,
            "my_time",
            FakeServer::new()
                .tool("get_time", ToolBehavior::Text("12:00".to_string()))
                .tool("fail", ToolBehavior::ToolError("no clock".to_string())),
        )
        .await;
        add_fake(&registry, "echo", FakeServer::new().tool("echo", ToolBehavior::Echo)).await;
        (ChatBridge::new(Arc::clone(&registry)), registry)
    }

    #[tokio::test]
    async fn function_tools_use_qualified_names() {
        let (bridge, _) = bridge().await;
        let mut names: Vec<String> = bridge
            .function_tools()
            .await
            .into_iter()
            .map(|t| t.function.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["mcp_echo_echo", "mcp_my_time_fail", "mcp_my_time_get_time"]);
    }

    #[tokio::test]
    async fn execute_resolves_names_with_underscores() {
        let (bridge, _) = bridge().await;

        let outcome = bridge.execute("mcp_my_time_get_time", "{}").await;
        assert!(outcome.success);
        assert_eq!(outcome.result, "12:00");

        let outcome = bridge.execute("mcp_echo_echo", r#"{"say":"hi"}"#).await;
        assert_eq!(outcome.result, r#"{"say":"hi"}"#);
    }

    #[tokio::test]
    async fn execute_reports_failures() {
        let (bridge, registry) = bridge().await;

        let outcome = bridge.execute("mcp_my_time_fail", "").await;
        assert!(!outcome.success);
        assert_eq!(outcome.result, "no clock");

        let outcome = bridge.execute("mcp_echo_echo", "{broken").await;
        assert!(!outcome.success);

        registry.set_server_enabled("echo", false).await.unwrap();
        let outcome = bridge.execute("mcp_echo_echo", "{}").await;
        assert!(!outcome.success);
        assert!(outcome.result.contains("not found"));

        // Direct invocation names the real reason.
        let err = bridge.invoke("echo", "echo", json!({})).await.unwrap_err();
        assert!(matches!(err, ComposerError::ServerDisabled(_)));
    }

    #[test]
    fn extract_text_replaces_binary_content() {
        let result = json!({
            "content": [
                { "type": "text", "text": "chart below" },
                { "type": "image", "data": "aGVsbG8=", "mimeType": "image/png" },
                { "type": "resource", "resource": { "uri": "file:///a", "text": "body" } }
            ]
        });
        assert_eq!(
            extract_text(&result),
            "chart below\n[image content: image/png]\nbody"
        );
        assert_eq!(extract_text(&json!({"value": 1})), r#"{"value":1}"#);
    }
}
