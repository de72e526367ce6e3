//! Settings — TOML file plus environment overrides.
//!
//! Lookup order for the file: explicit path, `STARFLEET_CONFIG`, then
//! `<config_dir>/starfleet/config.toml`. A missing default file means
//! defaults; a missing explicit file is an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use starfleet_core::{Error, Result};

pub const CONFIG_ENV: &str = "STARFLEET_CONFIG";

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a system diagnostic assistant for the local machine.
Use the osquery_executeOsquery tool to answer questions.

Common queries:
- System uptime: SELECT days, hours, minutes FROM uptime
- System info: SELECT hostname, cpu_brand, physical_memory FROM system_info
- Running processes: SELECT name, pid, resident_size FROM processes ORDER BY resident_size DESC LIMIT 10
- Network connections: SELECT DISTINCT process.name, listening.port FROM listening_ports listening JOIN processes process ON listening.pid = process.pid WHERE listening.port != 0

Format responses in a clear, conversational manner.";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub openai: OpenAiConfig,
    pub agent: AgentConfig,
    pub audio: AudioConfig,
    pub server: ServerConfig,
    pub mcp: McpConfig,
}

/// OpenAI-compatible endpoint settings, shared by chat, transcription and speech.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub chat_model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub transcription_model: String,
    pub language: String,
    pub speech_model: String,
    pub voice: String,
    pub speed: f32,
    pub request_timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".into(),
            chat_model: "gpt-4o-mini".into(),
            temperature: Some(0.7),
            max_tokens: None,
            transcription_model: "whisper-1".into(),
            language: "en".into(),
            speech_model: "tts-1".into(),
            voice: "alloy".into(),
            speed: 1.0,
            request_timeout_secs: 60,
        }
    }
}

impl OpenAiConfig {
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key.as_deref().filter(|k| !k.is_empty()).ok_or_else(|| {
            Error::Config("no OpenAI API key; set OPENAI_API_KEY or openai.api_key".into())
        })
    }

    /// `base_url` joined with an endpoint path.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub system_prompt: String,
    pub max_iterations: usize,
    pub turn_timeout_secs: u64,
    pub max_tool_output_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_iterations: 8,
            turn_timeout_secs: 120,
            max_tool_output_chars: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Cue played while a command is being processed.
    pub working_sound: Option<PathBuf>,
    pub speak_responses: bool,
    pub max_record_secs: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            working_sound: Some(PathBuf::from("sounds/tos_working.mp3")),
            speak_responses: false,
            max_record_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 2010,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub servers: Vec<McpServerConfig>,
}

/// The default prompt names `osquery_executeOsquery`, so an osquery server
/// is configured unless the file lists its own.
impl Default for McpConfig {
    fn default() -> Self {
        Self {
            servers: vec![McpServerConfig {
                name: "osquery".into(),
                command: "osquery-mcp".into(),
                args: Vec::new(),
                env: BTreeMap::new(),
                cwd: None,
                request_timeout_secs: default_request_timeout(),
                enabled: true,
            }],
        }
    }
}

/// One stdio MCP server to spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Platform default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "starfleet")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load settings from disk and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut settings = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => {
                    debug!("no config file found, using defaults");
                    Self::default()
                }
            },
        };

        settings.apply_env(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let settings = Self::from_toml(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        info!("loaded config from {}", path.display());
        Ok(settings)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Overlay environment variables. `lookup` is injectable for tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty()) {
            self.openai.api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL").filter(|u| !u.is_empty()) {
            self.openai.base_url = url;
        }
        if let Some(model) = lookup("STARFLEET_CHAT_MODEL").filter(|m| !m.is_empty()) {
            self.openai.chat_model = model;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.max_iterations == 0 {
            return Err(Error::Config("agent.max_iterations must be at least 1".into()));
        }
        if !(0.25..=4.0).contains(&self.openai.speed) {
            return Err(Error::Config(format!(
                "openai.speed must be between 0.25 and 4.0, got {}",
                self.openai.speed
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for server in &self.mcp.servers {
            if server.name.trim().is_empty() {
                return Err(Error::Config("mcp server name must not be empty".into()));
            }
            if server.command.trim().is_empty() {
                return Err(Error::Config(format!("mcp server '{}' has no command", server.name)));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(Error::Config(format!("duplicate mcp server name '{}'", server.name)));
            }
        }
        Ok(())
    }

    /// Copy safe to print: the API key is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.openai.api_key.is_some() {
            copy.openai.api_key = Some("********".into());
        }
        copy
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}
