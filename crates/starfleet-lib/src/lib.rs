//! starfleet-lib — Voice interface engine.
//!
//! Push-to-talk capture, transcription, the model ⇄ MCP tool loop, MP3
//! playback, the voice controller that ties them together, and the HTTP
//! control API. Depends on starfleet-core for pure types and text processing.

pub mod agent;
pub mod capture;
pub mod config;
pub mod controller;
pub mod llm;
pub mod mcp;
pub mod player;
pub mod recorder;
pub mod server;
pub mod streaming_source;
pub mod stt;
pub mod tools;
pub mod tts;

// Re-export starfleet-core for convenience
pub use starfleet_core;
pub use starfleet_core::{Error, Result};
