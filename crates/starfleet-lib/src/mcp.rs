//! MCP client: JSON-RPC 2.0 over a child process's stdio.
//!
//! Requests carry a numeric id and park a oneshot in `pending`; a reader task
//! parses newline-delimited messages and routes responses back by id.
//! Server-initiated `ping` requests are answered, notifications are logged.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use starfleet_core::{Error, Result};

use crate::config::McpServerConfig;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Upper bound on `tools/list` pages, in case a server keeps returning cursors.
const MAX_LIST_PAGES: usize = 32;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<McpTool>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        #[serde(default, rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Flatten content to text for the model.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| match item {
                ToolContent::Text { text } => Some(text.clone()),
                ToolContent::Image { mime_type } => Some(format!("[image: {mime_type}]")),
                ToolContent::Resource { resource } => Some(
                    resource
                        .get("text")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| resource.to_string()),
                ),
                ToolContent::Unsupported => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcMessage>>>>;
type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

pub struct McpClient {
    name: String,
    writer: SharedWriter,
    pending: Pending,
    next_id: AtomicU64,
    timeout: Duration,
    server_info: ServerInfo,
    reader: JoinHandle<()>,
    child: Mutex<Option<Child>>,
}

impl McpClient {
    /// Launch the configured server and complete the initialize handshake.
    pub async fn spawn(config: &McpServerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::mcp(format!("[{}] failed to start {}: {e}", config.name, config.command))
        })?;
        debug!(server = %config.name, pid = child.id(), "mcp server started");

        if let Some(stderr) = child.stderr.take() {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{name}] {line}");
                }
            });
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::mcp(format!("[{}] no stdin", config.name)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::mcp(format!("[{}] no stdout", config.name)))?;

        let timeout = Duration::from_secs(config.request_timeout_secs);
        let mut client = Self::open(config.name.clone(), stdout, stdin, timeout);
        client.child = Mutex::new(Some(child));
        client.initialize().await?;
        Ok(client)
    }

    /// Connect over an existing transport and complete the handshake.
    pub async fn connect<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        timeout: Duration,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut client = Self::open(name.into(), reader, writer, timeout);
        client.initialize().await?;
        Ok(client)
    }

    fn open<R, W>(name: String, reader: R, writer: W, timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Box::new(writer)));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(
            name.clone(),
            reader,
            pending.clone(),
            writer.clone(),
        ));
        Self {
            name,
            writer,
            pending,
            next_id: AtomicU64::new(1),
            timeout,
            server_info: ServerInfo::default(),
            reader,
            child: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    async fn initialize(&mut self) -> Result<()> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "starfleet",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;

        if let Some(version) = result.get("protocolVersion").and_then(Value::as_str) {
            if version != PROTOCOL_VERSION {
                debug!(server = %self.name, version, "server negotiated a different protocol version");
            }
        }
        self.server_info = result
            .get("serverInfo")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        self.notify("notifications/initialized", None).await?;
        info!(
            server = %self.name,
            remote = %self.server_info.name,
            version = %self.server_info.version,
            "mcp server initialized"
        );
        Ok(())
    }

    /// All tools the server offers, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map_or_else(|| json!({}), |c| json!({ "cursor": c }));
            let page: ListToolsResult = serde_json::from_value(self.request("tools/list", params).await?)
                .map_err(|e| Error::mcp(format!("[{}] bad tools/list result: {e}", self.name)))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
        warn!(server = %self.name, "tools/list pagination did not terminate");
        Ok(tools)
    }

    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<CallToolResult> {
        let result = self
            .request("tools/call", json!({ "name": tool, "arguments": arguments }))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| Error::mcp(format!("[{}] bad tools/call result: {e}", self.name)))
    }

    /// Send a request and wait for its response, up to the configured timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let line = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params: Some(params),
        })?;
        if let Err(e) = write_line(&self.writer, &line).await {
            self.forget(id);
            return Err(Error::mcp(format!("[{}] write failed: {e}", self.name)));
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(Error::mcp(format!("[{}] connection closed", self.name)));
            }
            Err(_) => {
                self.forget(id);
                return Err(Error::mcp(format!(
                    "[{}] {method} timed out after {}s",
                    self.name,
                    self.timeout.as_secs()
                )));
            }
        };

        if let Some(err) = response.error {
            return Err(Error::Mcp {
                code: err.code,
                message: format!("[{}] {}", self.name, err.message),
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let line = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params,
        })?;
        write_line(&self.writer, &line)
            .await
            .map_err(|e| Error::mcp(format!("[{}] write failed: {e}", self.name)))
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Stop the reader and kill the server process.
    pub async fn shutdown(&self) {
        self.reader.abort();
        let child = self.child.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                debug!(server = %self.name, "kill failed: {e}");
            }
        }
        debug!(server = %self.name, "mcp client shut down");
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_line(writer: &SharedWriter, line: &str) -> std::io::Result<()> {
    let mut w = writer.lock().await;
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await
}

async fn read_loop<R>(name: String, reader: R, pending: Pending, writer: SharedWriter)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("[{name}] read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let msg: RpcMessage = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("[{name}] ignoring non-JSON-RPC line ({e}): {line}");
                continue;
            }
        };

        let method = msg.method.clone();
        match (method.as_deref(), msg.id.clone()) {
            (Some("ping"), Some(id)) => {
                let pong = json!({"jsonrpc": "2.0", "id": id, "result": {}}).to_string();
                if let Err(e) = write_line(&writer, &pong).await {
                    warn!("[{name}] failed to answer ping: {e}");
                }
            }
            (Some(method), Some(id)) => {
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("method not found: {method}")},
                })
                .to_string();
                if let Err(e) = write_line(&writer, &reply).await {
                    warn!("[{name}] failed to reject {method}: {e}");
                }
            }
            (Some(method), None) => debug!("[{name}] notification: {method}"),
            (None, Some(id)) => {
                let Some(id) = id.as_u64() else {
                    debug!("[{name}] response with unexpected id {id}");
                    continue;
                };
                let sender = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(msg);
                    }
                    None => debug!("[{name}] response for unknown request {id}"),
                }
            }
            (None, None) => debug!("[{name}] ignoring message without id or method"),
        }
    }
    // Dropping the senders wakes every waiter with "connection closed".
    pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    debug!("[{name}] reader stopped");
}
