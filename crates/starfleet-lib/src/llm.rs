//! OpenAI-compatible chat completions with function calling.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use starfleet_core::{Error, Result};

use crate::config::OpenAiConfig;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role("tool", content)
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Message text, empty when the model sent none.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            r#type: "function".into(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default = "function_type")]
    pub r#type: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    /// JSON-encoded arguments. Some providers send an object instead of a
    /// string; both are normalized to a string.
    #[serde(default, deserialize_with = "deserialize_arguments")]
    pub arguments: String,
}

impl FunctionCall {
    /// Parsed arguments. Anything that is not a JSON object becomes `{}`.
    pub fn arguments_value(&self) -> Value {
        match serde_json::from_str::<Value>(&self.arguments) {
            Ok(v @ Value::Object(_)) => v,
            _ => {
                if !self.arguments.trim().is_empty() {
                    warn!(tool = %self.name, "ignoring malformed tool arguments: {}", self.arguments);
                }
                Value::Object(Default::default())
            }
        }
    }
}

fn deserialize_arguments<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(arguments_to_string(Value::deserialize(deserializer)?))
}

fn arguments_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

// ---------------------------------------------------------------------------
// Model client
// ---------------------------------------------------------------------------

/// A chat model that may answer with tool calls.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolDefinition])
    -> Result<ChatMessage>;
}

#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl ChatClient {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Model(format!("http client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn model(&self) -> &str {
        &self.config.chat_model
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatMessage> {
        let api_key = self.config.require_api_key()?;
        let request = ChatRequest {
            model: &self.config.chat_model,
            messages,
            tools: (!tools.is_empty()).then_some(tools),
            tool_choice: (!tools.is_empty()).then_some("auto"),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        debug!(
            model = %self.config.chat_model,
            messages = messages.len(),
            tools = tools.len(),
            "chat completion request"
        );

        let resp = self
            .http
            .post(self.config.endpoint("chat/completions"))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Model(format!("request failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Model(format!("response read error: {e}")))?;
        if !status.is_success() {
            return Err(Error::Model(format!("chat API error ({status}): {body}")));
        }

        let raw: Value = serde_json::from_str(body.trim())
            .map_err(|e| Error::Model(format!("invalid JSON response: {e}")))?;
        parse_chat_response(&raw)
    }
}

/// Pull the assistant message out of a completion body.
///
/// Parsed leniently from a `Value`: content may be a string or an array of
/// text parts, and tool-call arguments may be a string or an object.
pub fn parse_chat_response(raw: &Value) -> Result<ChatMessage> {
    if let Some(err) = raw.get("error").filter(|e| !e.is_null()) {
        let msg = err
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| err.to_string(), str::to_string);
        return Err(Error::Model(msg));
    }

    let message = raw
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| Error::Model("no message in response".into()))?;

    let content = match message.get("content") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(parts)) => {
            let text: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            (!text.is_empty()).then(|| text.join(""))
        }
        _ => None,
    };

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|tc| {
                    let func = tc.get("function")?;
                    Some(ToolCall {
                        id: tc.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
                        r#type: function_type(),
                        function: FunctionCall {
                            name: func.get("name").and_then(Value::as_str)?.to_string(),
                            arguments: arguments_to_string(
                                func.get("arguments").cloned().unwrap_or(Value::Null),
                            ),
                        },
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatMessage {
        role: "assistant".into(),
        content,
        tool_calls,
        tool_call_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_answer() {
        let raw = json!({
            "choices": [{"message": {"role": "assistant", "content": "Up 3 days."}}]
        });
        let msg = parse_chat_response(&raw).unwrap();
        assert_eq!(msg.text(), "Up 3 days.");
        assert!(!msg.has_tool_calls());
    }

    #[test]
    fn parses_tool_calls_with_string_and_object_arguments() {
        let raw = json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {
                        "name": "osquery_executeOsquery",
                        "arguments": "{\"sql\":\"SELECT days FROM uptime\"}"
                    }},
                    {"id": "call_2", "function": {
                        "name": "osquery_executeOsquery",
                        "arguments": {"sql": "SELECT * FROM os_version"}
                    }},
                    {"id": "call_3", "function": {"arguments": "{}"}}
                ]
            }}]
        });
        let msg = parse_chat_response(&raw).unwrap();
        assert_eq!(msg.content, None);
        assert_eq!(msg.tool_calls.len(), 2, "call without a name is dropped");
        assert_eq!(
            msg.tool_calls[0].function.arguments_value(),
            json!({"sql": "SELECT days FROM uptime"})
        );
        assert_eq!(
            msg.tool_calls[1].function.arguments_value(),
            json!({"sql": "SELECT * FROM os_version"})
        );
    }

    #[test]
    fn content_parts_are_joined() {
        let raw = json!({
            "choices": [{"message": {"content": [
                {"type": "text", "text": "Hello, "},
                {"type": "text", "text": "Captain."}
            ]}}]
        });
        assert_eq!(parse_chat_response(&raw).unwrap().text(), "Hello, Captain.");
    }

    #[test]
    fn error_body_and_missing_choices() {
        let err = parse_chat_response(&json!({"error": {"message": "quota exceeded"}})).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert!(parse_chat_response(&json!({"choices": []})).is_err());
    }

    #[test]
    fn null_error_field_is_not_a_failure() {
        let raw = json!({
            "error": null,
            "choices": [{"message": {"role": "assistant", "content": "All systems nominal."}}]
        });
        assert_eq!(parse_chat_response(&raw).unwrap().text(), "All systems nominal.");
    }

    #[test]
    fn malformed_arguments_become_empty_object() {
        let call = FunctionCall {
            name: "t".into(),
            arguments: "{not json".into(),
        };
        assert_eq!(call.arguments_value(), json!({}));
        let call = FunctionCall {
            name: "t".into(),
            arguments: "[1,2]".into(),
        };
        assert_eq!(call.arguments_value(), json!({}));
    }

    #[test]
    fn tool_result_serializes_call_id() {
        let msg = ChatMessage::tool_result("call_9", "ok");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_9");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn assistant_tool_call_message_round_trips_arguments_object() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "tool_calls": [{"id": "a", "function": {"name": "n", "arguments": {"x": 1}}}]
        }))
        .unwrap();
        assert_eq!(msg.tool_calls[0].function.arguments, r#"{"x":1}"#);
        assert_eq!(msg.tool_calls[0].r#type, "function");
    }

    #[tokio::test]
    async fn client_posts_tools_and_parses_reply() {
        use axum::routing::post;
        use axum::{Json, Router};

        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "gpt-4o-mini");
                assert_eq!(body["tool_choice"], "auto");
                assert_eq!(body["tools"][0]["function"]["name"], "osquery_executeOsquery");
                assert_eq!(body["messages"][0]["role"], "system");
                Json(json!({
                    "choices": [{"message": {"role": "assistant", "content": "All systems nominal."}}]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = ChatClient::new(OpenAiConfig {
            api_key: Some("sk-test".into()),
            base_url: format!("http://{addr}/v1"),
            ..OpenAiConfig::default()
        })
        .unwrap();
        let tools = [ToolDefinition::function(
            "osquery_executeOsquery",
            "Run an osquery SQL query",
            json!({"type": "object", "properties": {"sql": {"type": "string"}}}),
        )];
        let reply = client
            .complete(
                &[ChatMessage::system("be brief"), ChatMessage::user("status?")],
                &tools,
            )
            .await
            .unwrap();
        assert_eq!(reply.text(), "All systems nominal.");
    }
}
