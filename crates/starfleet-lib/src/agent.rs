//! Command → model ⇄ tools → answer.
//!
//! One turn runs the chat model with the registered tools until it answers
//! without tool calls, guarded by an iteration cap, duplicate-call detection,
//! a wall-clock timeout and a cancellation token.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use starfleet_core::text_prep::truncate_tool_output;
use starfleet_core::types::{StopReason, TurnReport, VoiceEvent};
use starfleet_core::{Error, Result};

use crate::config::AgentConfig;
use crate::llm::{ChatMessage, ChatModel};
use crate::tools::ToolDispatch;

/// Rounds of nothing-but-repeated calls tolerated before giving up.
const MAX_CONSECUTIVE_DUPES: usize = 2;

const TIMEOUT_ANSWER: &str = "I ran out of time working on that request.";
const MAX_ITERATIONS_ANSWER: &str = "I could not complete that request in the steps available.";
const DUPLICATE_ANSWER: &str = "I kept repeating the same queries without making progress.";
const EMPTY_ANSWER: &str = "I have no answer for that.";

#[derive(Default)]
struct Progress {
    iterations: usize,
    tool_calls: usize,
    /// Latest non-empty assistant text, used when a guard ends the turn.
    last_text: Option<String>,
}

pub struct Agent {
    model: Arc<dyn ChatModel>,
    tools: Arc<dyn ToolDispatch>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(model: Arc<dyn ChatModel>, tools: Arc<dyn ToolDispatch>, config: AgentConfig) -> Self {
        Self {
            model,
            tools,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Process one command to a final answer.
    ///
    /// Cancellation drops the in-flight model or tool future and returns
    /// `Error::Cancelled`. Tool failures are handed back to the model;
    /// model failures end the turn with an error.
    pub async fn run_turn(
        &self,
        command: &str,
        cancel: CancellationToken,
        on_event: impl Fn(VoiceEvent) + Send + Sync,
    ) -> Result<TurnReport> {
        let command = command.trim();
        if command.is_empty() {
            return Err(Error::Model("empty command".into()));
        }
        info!("processing command: {command:?}");

        let deadline = Duration::from_secs(self.config.turn_timeout_secs);
        let mut progress = Progress::default();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = tokio::time::timeout(deadline, self.run_loop(command, &on_event, &mut progress)) => Some(res),
        };

        let (response, stop_reason) = match outcome {
            None => {
                info!("turn cancelled after {} iterations", progress.iterations);
                return Err(Error::Cancelled);
            }
            Some(Err(_elapsed)) => {
                warn!("turn timed out after {}s", deadline.as_secs());
                (TIMEOUT_ANSWER.to_string(), StopReason::Timeout)
            }
            Some(Ok(result)) => result?,
        };

        info!(
            iterations = progress.iterations,
            tool_calls = progress.tool_calls,
            stop = %stop_reason,
            "turn finished"
        );
        Ok(TurnReport {
            command: command.to_string(),
            response,
            iterations: progress.iterations,
            tool_calls: progress.tool_calls,
            stop_reason,
        })
    }

    async fn run_loop(
        &self,
        command: &str,
        on_event: &(impl Fn(VoiceEvent) + Send + Sync),
        progress: &mut Progress,
    ) -> Result<(String, StopReason)> {
        let definitions = self.tools.definitions();
        let mut messages = vec![
            ChatMessage::system(self.config.system_prompt.clone()),
            ChatMessage::user(command),
        ];
        let mut seen_calls: HashSet<String> = HashSet::new();
        let mut consecutive_dupes = 0usize;

        while progress.iterations < self.config.max_iterations {
            progress.iterations += 1;
            let reply = self.model.complete(&messages, &definitions).await?;

            let text = reply.text().trim().to_string();
            if !text.is_empty() {
                progress.last_text = Some(text.clone());
            }
            if !reply.has_tool_calls() {
                let answer = if text.is_empty() { EMPTY_ANSWER.to_string() } else { text };
                return Ok((answer, StopReason::Completed));
            }

            let keys: Vec<String> = reply
                .tool_calls
                .iter()
                .map(|tc| format!("{}:{}", tc.function.name, tc.function.arguments_value()))
                .collect();
            if keys.iter().all(|k| seen_calls.contains(k)) {
                consecutive_dupes += 1;
                debug!(consecutive_dupes, "model repeated earlier tool calls");
                if consecutive_dupes >= MAX_CONSECUTIVE_DUPES {
                    warn!("stopping turn: repeated tool calls");
                    return Ok((self.fallback(progress, DUPLICATE_ANSWER), StopReason::DuplicateCalls));
                }
            } else {
                consecutive_dupes = 0;
            }
            seen_calls.extend(keys);

            let calls = reply.tool_calls.clone();
            messages.push(reply);
            for call in calls {
                let name = call.function.name.clone();
                let arguments = call.function.arguments_value();
                debug!(tool = %name, %arguments, "calling tool");
                on_event(VoiceEvent::ToolStarted { name: name.clone() });
                progress.tool_calls += 1;

                let (output, ok) = match self.tools.call(&name, arguments).await {
                    Ok(text) => {
                        let ok = !text.starts_with("Error: ");
                        (text, ok)
                    }
                    Err(e) => {
                        warn!(tool = %name, "tool call failed: {e}");
                        (format!("Error: {e}"), false)
                    }
                };
                on_event(VoiceEvent::ToolFinished {
                    name: name.clone(),
                    ok,
                });
                let output = truncate_tool_output(&output, self.config.max_tool_output_chars);
                messages.push(ChatMessage::tool_result(call.id, output));
            }
        }

        warn!("stopping turn: {} iterations used", progress.iterations);
        Ok((self.fallback(progress, MAX_ITERATIONS_ANSWER), StopReason::MaxIterations))
    }

    fn fallback(&self, progress: &Progress, default: &str) -> String {
        progress
            .last_text
            .clone()
            .unwrap_or_else(|| default.to_string())
    }
}
