//! Error type shared by every starfleet crate.

use thiserror::Error;

/// Result alias for starfleet operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Playback device or decoder failure.
    #[error("audio error: {0}")]
    Audio(String),

    /// Microphone failure.
    #[error("capture error: {0}")]
    Capture(String),

    #[error("transcription error: {0}")]
    Transcription(String),

    /// Chat completion request failed or returned something unusable.
    #[error("model error: {0}")]
    Model(String),

    /// JSON-RPC level failure talking to an MCP server.
    #[error("mcp error ({code}): {message}")]
    Mcp { code: i64, message: String },

    #[error("tool error: {0}")]
    Tool(String),

    #[error("speech error: {0}")]
    Speech(String),

    /// A recording is already in progress.
    #[error("already recording")]
    Busy,

    #[error("no recording in progress")]
    NoRecording,

    #[error("no audio data recorded, please try again")]
    EmptyRecording,

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Transport-level MCP failure with no JSON-RPC error code.
    pub fn mcp(message: impl Into<String>) -> Self {
        Self::Mcp {
            code: -1,
            message: message.into(),
        }
    }

    /// True when the failure came from an interrupted turn rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
