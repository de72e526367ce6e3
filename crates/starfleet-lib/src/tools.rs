//! Tool dispatcher over one or more MCP servers.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use starfleet_core::types::ToolInfo;
use starfleet_core::{Error, Result};

use crate::config::McpServerConfig;
use crate::llm::ToolDefinition;
use crate::mcp::McpClient;

/// Function names accepted by the chat API are at most this long.
const MAX_TOOL_NAME: usize = 64;

/// What the agent loop needs from a tool backend.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Run a tool by its qualified name. A tool-reported failure comes back
    /// as `Ok("Error: ...")`; `Err` means the call could not be made at all.
    async fn call(&self, name: &str, arguments: Value) -> Result<String>;
}

struct RegisteredTool {
    info: ToolInfo,
    client: Arc<McpClient>,
}

#[derive(Default)]
pub struct ToolRegistry {
    clients: Vec<Arc<McpClient>>,
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    /// Start every enabled server. Servers that fail are logged and skipped.
    pub async fn connect_all(servers: &[McpServerConfig]) -> Self {
        let mut clients = Vec::new();
        for config in servers.iter().filter(|s| s.enabled) {
            match McpClient::spawn(config).await {
                Ok(client) => clients.push(client),
                Err(e) => warn!(server = %config.name, "mcp server unavailable: {e}"),
            }
        }
        Self::from_clients(clients).await
    }

    /// Build the registry from already-initialized clients.
    pub async fn from_clients(clients: Vec<McpClient>) -> Self {
        let mut registry = Self::default();
        let mut taken = HashSet::new();

        for client in clients {
            let client = Arc::new(client);
            let listed = match client.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!(server = %client.name(), "tools/list failed: {e}");
                    client.shutdown().await;
                    continue;
                }
            };
            info!(server = %client.name(), count = listed.len(), "registered mcp tools");

            for tool in listed {
                let name = qualify(client.name(), &tool.name, &taken);
                taken.insert(name.clone());
                registry.tools.push(RegisteredTool {
                    info: ToolInfo {
                        name,
                        server: client.name().to_string(),
                        tool: tool.name,
                        description: tool.description.unwrap_or_default(),
                        input_schema: tool.input_schema,
                    },
                    client: client.clone(),
                });
            }
            registry.clients.push(client);
        }
        registry
    }

    pub fn tools(&self) -> Vec<ToolInfo> {
        self.tools.iter().map(|t| t.info.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn servers(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.name().to_string()).collect()
    }

    /// Call a tool by server and original tool name, bypassing qualification.
    pub async fn call_direct(&self, server: &str, tool: &str, arguments: Value) -> Result<String> {
        let client = self
            .clients
            .iter()
            .find(|c| c.name() == server)
            .ok_or_else(|| Error::Tool(format!("unknown server: {server}")))?;
        let result = client.call_tool(tool, arguments).await?;
        Ok(render_result(result.text(), result.is_error))
    }

    pub async fn shutdown(&self) {
        for client in &self.clients {
            client.shutdown().await;
        }
    }
}

#[async_trait]
impl ToolDispatch for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| {
                ToolDefinition::function(
                    t.info.name.clone(),
                    t.info.description.clone(),
                    t.info.input_schema.clone(),
                )
            })
            .collect()
    }

    async fn call(&self, name: &str, arguments: Value) -> Result<String> {
        let entry = self
            .tools
            .iter()
            .find(|t| t.info.name == name)
            .ok_or_else(|| Error::Tool(format!("unknown tool: {name}")))?;
        let result = entry.client.call_tool(&entry.info.tool, arguments).await?;
        if result.is_error {
            warn!(tool = name, "tool reported an error");
        }
        Ok(render_result(result.text(), result.is_error))
    }
}

fn render_result(text: String, is_error: bool) -> String {
    if is_error {
        format!("Error: {text}")
    } else {
        text
    }
}

/// `{server}_{tool}`, restricted to `[A-Za-z0-9_-]`, at most 64 chars, and
/// unique within `taken`.
fn qualify(server: &str, tool: &str, taken: &HashSet<String>) -> String {
    let base: String = format!("{server}_{tool}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(MAX_TOOL_NAME)
        .collect();
    if !taken.contains(&base) {
        return base;
    }
    (2..)
        .map(|n| {
            let suffix = format!("_{n}");
            let keep = MAX_TOOL_NAME - suffix.len();
            format!("{}{suffix}", &base[..base.len().min(keep)])
        })
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::tests::connect_fake;
    use serde_json::json;

    #[test]
    fn qualified_names_are_sanitized() {
        let taken = HashSet::new();
        assert_eq!(
            qualify("osquery", "executeOsquery", &taken),
            "osquery_executeOsquery"
        );
        assert_eq!(qualify("my server", "read.file", &taken), "my_server_read_file");
    }

    #[test]
    fn qualified_names_are_capped_and_deduplicated() {
        let long = "t".repeat(100);
        let mut taken = HashSet::new();
        let first = qualify("srv", &long, &taken);
        assert_eq!(first.len(), MAX_TOOL_NAME);
        taken.insert(first.clone());

        let second = qualify("srv", &long, &taken);
        assert_eq!(second.len(), MAX_TOOL_NAME);
        assert!(second.ends_with("_2"));
        assert_ne!(first, second);
        taken.insert(second);

        assert!(qualify("srv", &long, &taken).ends_with("_3"));
    }

    fn osquery_like(method: &str, params: &Value) -> Option<std::result::Result<Value, (i64, String)>> {
        match method {
            "tools/list" => Some(Ok(json!({"tools": [
                {"name": "executeOsquery", "description": "Run SQL", "inputSchema": {"type": "object"}}
            ]}))),
            "tools/call" => {
                let sql = params["arguments"]["sql"].as_str().unwrap_or_default();
                Some(Ok(if sql.is_empty() {
                    json!({"content": [{"type": "text", "text": "sql is required"}], "isError": true})
                } else {
                    json!({"content": [{"type": "text", "text": format!("ran: {sql}")}]})
                }))
            }
            _ => None,
        }
    }

    #[tokio::test]
    async fn registry_routes_by_qualified_name() {
        let a = connect_fake("osquery", osquery_like).await;
        let b = connect_fake("osquery2", osquery_like).await;
        let registry = ToolRegistry::from_clients(vec![a, b]).await;

        let names: Vec<String> = registry.tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["osquery_executeOsquery", "osquery2_executeOsquery"]);
        assert_eq!(registry.definitions()[0].function.description, "Run SQL");

        let out = registry
            .call("osquery2_executeOsquery", json!({"sql": "SELECT 1"}))
            .await
            .unwrap();
        assert_eq!(out, "ran: SELECT 1");
    }

    #[tokio::test]
    async fn tool_errors_are_rendered_for_the_model() {
        let registry = ToolRegistry::from_clients(vec![connect_fake("osquery", osquery_like).await]).await;
        let out = registry.call("osquery_executeOsquery", json!({})).await.unwrap();
        assert_eq!(out, "Error: sql is required");

        let err = registry.call("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Tool(_)));
    }

    #[tokio::test]
    async fn direct_call_uses_server_tool_names() {
        let registry = ToolRegistry::from_clients(vec![connect_fake("osquery", osquery_like).await]).await;
        let out = registry
            .call_direct("osquery", "executeOsquery", json!({"sql": "SELECT days FROM uptime"}))
            .await
            .unwrap();
        assert_eq!(out, "ran: SELECT days FROM uptime");
        assert!(registry.call_direct("other", "x", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn server_failing_tools_list_is_skipped() {
        let broken = connect_fake("broken", |_, _| Some(Err((-32603, "boom".into())))).await;
        let good = connect_fake("osquery", osquery_like).await;
        let registry = ToolRegistry::from_clients(vec![broken, good]).await;
        assert_eq!(registry.servers(), vec!["osquery"]);
        assert_eq!(registry.tools().len(), 1);
    }

    #[tokio::test]
    async fn disabled_and_missing_servers_are_skipped() {
        let servers = vec![
            McpServerConfig {
                name: "gone".into(),
                command: "/nonexistent/starfleet-mcp-server".into(),
                args: vec![],
                env: Default::default(),
                cwd: None,
                request_timeout_secs: 1,
                enabled: true,
            },
            McpServerConfig {
                name: "off".into(),
                command: "true".into(),
                args: vec![],
                env: Default::default(),
                cwd: None,
                request_timeout_secs: 1,
                enabled: false,
            },
        ];
        let registry = ToolRegistry::connect_all(&servers).await;
        assert!(registry.is_empty());
        assert!(registry.servers().is_empty());
    }
}
