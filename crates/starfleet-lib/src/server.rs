//! HTTP control API for the voice controller.
//!
//! Runs on port 2010 by default. CORS-permissive so a browser panel on
//! localhost can drive push-to-talk.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;

use starfleet_core::types::{ToolInfo, VoiceStatus};
use starfleet_core::{Error, Result};

use crate::config::ServerConfig;
use crate::controller::VoiceController;

#[derive(Clone)]
pub struct AppState {
    pub controller: VoiceController,
    pub tools: Arc<Vec<ToolInfo>>,
}

/// Build the axum router around a shared [`VoiceController`].
pub fn router(controller: VoiceController, tools: Vec<ToolInfo>) -> Router {
    Router::new()
        .route("/talk/start", post(talk_start))
        .route("/talk/stop", post(talk_stop))
        .route("/ask", post(ask))
        .route("/cancel", post(cancel))
        .route("/status", get(status))
        .route("/tools", get(tools_list))
        .layer(CorsLayer::permissive())
        .with_state(AppState {
            controller,
            tools: Arc::new(tools),
        })
}

/// Bind `config.host:config.port` and serve until the process exits.
pub async fn serve(config: &ServerConfig, app: Router) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("control API listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// `{ ok: false, error }` with a status code picked from the error kind.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self.0 {
            Error::Busy | Error::NoRecording | Error::Cancelled => StatusCode::CONFLICT,
            e if is_input_error(e) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Capture(_) | Error::Audio(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            ok: false,
            error: self.0.to_string(),
        };
        (code, Json(body)).into_response()
    }
}

fn is_input_error(e: &Error) -> bool {
    match e {
        Error::EmptyRecording => true,
        Error::Model(msg) => msg == "empty command",
        _ => false,
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    ok: bool,
    error: String,
}

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

#[derive(Serialize)]
struct TurnResponse {
    ok: bool,
    turn: u64,
}

#[derive(Deserialize)]
struct AskRequest {
    command: String,
}

#[derive(Serialize)]
struct AskResponse {
    ok: bool,
    #[serde(flatten)]
    status: VoiceStatus,
}

async fn talk_start(State(app): State<AppState>) -> std::result::Result<Json<OkResponse>, ApiError> {
    app.controller.press().await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn talk_stop(State(app): State<AppState>) -> std::result::Result<Json<TurnResponse>, ApiError> {
    let turn = app.controller.release().await?;
    Ok(Json(TurnResponse { ok: true, turn }))
}

/// Runs the command and answers once the turn is over.
async fn ask(
    State(app): State<AppState>,
    Json(req): Json<AskRequest>,
) -> std::result::Result<Json<AskResponse>, ApiError> {
    let turn = app.controller.submit_text(&req.command)?;
    let status = app.controller.wait_turn(turn).await;
    Ok(Json(AskResponse {
        ok: status.error.is_none(),
        status,
    }))
}

async fn cancel(State(app): State<AppState>) -> Json<OkResponse> {
    app.controller.cancel();
    Json(OkResponse { ok: true })
}

async fn status(State(app): State<AppState>) -> Json<VoiceStatus> {
    Json(app.controller.status())
}

async fn tools_list(State(app): State<AppState>) -> Json<Vec<ToolInfo>> {
    Json(app.tools.as_ref().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::config::{AgentConfig, OpenAiConfig};
    use crate::llm::{ChatMessage, ChatModel, ToolDefinition};
    use crate::player::AudioPlayer;
    use crate::recorder::{Recorder, SampleSource};
    use crate::stt::Transcriber;
    use crate::tools::ToolDispatch;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use starfleet_core::types::VoiceState;
    use tokio::sync::mpsc;

    struct Echo;

    #[async_trait]
    impl ChatModel for Echo {
        async fn complete(&self, messages: &[ChatMessage], _: &[ToolDefinition]) -> Result<ChatMessage> {
            let command = messages.last().map(|m| m.text().to_string()).unwrap_or_default();
            if command == "fail" {
                return Err(Error::Model("chat API error (503): overloaded".into()));
            }
            Ok(ChatMessage::assistant(format!("Acknowledged: {command}")))
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolDispatch for NoTools {
        fn definitions(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }
        async fn call(&self, name: &str, _: Value) -> Result<String> {
            Err(Error::Tool(format!("unknown tool: {name}")))
        }
    }

    async fn spawn_api() -> String {
        // the microphone stays silent
        let recorder = Recorder::with_source(30, || {
            let (tx, rx) = mpsc::unbounded_channel::<Vec<i16>>();
            std::mem::forget(tx);
            Ok(Box::new(rx) as Box<dyn SampleSource>)
        });
        let transcriber = Transcriber::new(OpenAiConfig {
            api_key: Some("sk-test".into()),
            base_url: "http://127.0.0.1:9".into(),
            ..OpenAiConfig::default()
        })
        .unwrap();
        let agent = Agent::new(Arc::new(Echo), Arc::new(NoTools), AgentConfig::default());
        let controller = VoiceController::new(recorder, transcriber, agent, AudioPlayer::new(None), None);
        let tools = vec![ToolInfo {
            name: "osquery_executeOsquery".into(),
            server: "osquery".into(),
            tool: "executeOsquery".into(),
            description: "Run an osquery SQL query".into(),
            input_schema: json!({"type": "object"}),
        }];

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(controller, tools);
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn ask_waits_for_the_answer() {
        let base = spawn_api().await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/ask"))
            .json(&json!({"command": "report status"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["transcript"], "report status");
        assert_eq!(body["response"], "Acknowledged: report status");
        assert_eq!(body["state"], json!(VoiceState::Ready));
    }

    #[tokio::test]
    async fn ask_reports_model_failure() {
        let base = spawn_api().await;
        let body: Value = reqwest::Client::new()
            .post(format!("{base}/ask"))
            .json(&json!({"command": "fail"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().contains("overloaded"));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let base = spawn_api().await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/ask"))
            .json(&json!({"command": "   "}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 422);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn talk_stop_without_start_conflicts() {
        let base = spawn_api().await;
        let client = reqwest::Client::new();
        let resp = client.post(format!("{base}/talk/stop")).send().await.unwrap();
        assert_eq!(resp.status(), 409);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "no recording in progress");

        let status: Value = client.get(format!("{base}/status")).send().await.unwrap().json().await.unwrap();
        assert_eq!(status["state"], json!(VoiceState::Error));
    }

    #[tokio::test]
    async fn talk_start_then_cancel() {
        let base = spawn_api().await;
        let client = reqwest::Client::new();
        let resp = client.post(format!("{base}/talk/start")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let again = client.post(format!("{base}/talk/start")).send().await.unwrap();
        assert_eq!(again.status(), 409);

        client.post(format!("{base}/cancel")).send().await.unwrap();
        let status: Value = client.get(format!("{base}/status")).send().await.unwrap().json().await.unwrap();
        assert_eq!(status["state"], json!(VoiceState::Ready));
    }

    #[tokio::test]
    async fn tools_lists_registry() {
        let base = spawn_api().await;
        let tools: Vec<ToolInfo> = reqwest::get(format!("{base}/tools")).await.unwrap().json().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].server, "osquery");
    }
}
