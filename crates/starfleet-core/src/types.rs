//! Shared types for the starfleet voice interface.
//!
//! Kept in starfleet-core so front ends can depend on them without pulling in
//! tokio, cpal or rodio.

use serde::{Deserialize, Serialize};

// ─── Controller types ──────────────────────────────────────────────────────

/// Observable state of the voice controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceState {
    Ready,
    Recording,
    Processing,
    Speaking,
    Error,
}

impl VoiceState {
    /// Status line text shown by front ends.
    pub fn label(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Recording => "RECORDING...",
            Self::Processing => "PROCESSING...",
            Self::Speaking => "SPEAKING...",
            Self::Error => "ERROR",
        }
    }

    /// A turn is in flight and would be interrupted by a new one.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Processing | Self::Speaking)
    }
}

/// Voice controller status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceStatus {
    pub state: VoiceState,
    pub transcript: Option<String>,
    pub response: Option<String>,
    pub error: Option<String>,
    /// Monotonic turn counter; results of superseded turns are dropped.
    pub turn: u64,
}

impl Default for VoiceStatus {
    fn default() -> Self {
        Self {
            state: VoiceState::Ready,
            transcript: None,
            response: None,
            error: None,
            turn: 0,
        }
    }
}

/// Events broadcast to front ends while a turn progresses.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceEvent {
    State { state: VoiceState },
    Transcript { text: String },
    ToolStarted { name: String },
    ToolFinished { name: String, ok: bool },
    Response { text: String },
    Error { message: String },
}

// ─── Transcription ─────────────────────────────────────────────────────────

/// A transcribed utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub text: String,
    /// Length of the captured audio.
    pub duration_ms: Option<u64>,
}

// ─── Tools & turns ─────────────────────────────────────────────────────────

/// A tool exposed to the model by an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    /// Name the model sees, unique across all servers.
    pub name: String,
    pub server: String,
    /// Name on the originating server.
    pub tool: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Why an agent turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced a final answer.
    Completed,
    MaxIterations,
    Timeout,
    /// The model kept repeating tool calls it had already made.
    DuplicateCalls,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::MaxIterations => "max iterations reached",
            Self::Timeout => "timeout",
            Self::DuplicateCalls => "duplicate calls",
        };
        f.write_str(s)
    }
}

/// Outcome of one command through the model ⇄ tool loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReport {
    pub command: String,
    pub response: String,
    pub iterations: usize,
    pub tool_calls: usize,
    pub stop_reason: StopReason,
}

// ─── Playback ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Idle,
    Playing,
}
