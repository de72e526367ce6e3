//! starfleet CLI — push-to-talk voice interface to your machine.
//!
//! ```text
//! starfleet run                                   # Enter to talk, Enter again to send
//! starfleet serve [--host 127.0.0.1] [--port 2010]
//! starfleet ask "which process uses the most memory" [--speak]
//! starfleet tools
//! starfleet call osquery executeOsquery '{"sql":"select * from uptime"}'
//! starfleet transcribe take.wav
//! starfleet play sounds/tos_working.mp3
//! starfleet config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use starfleet_lib::config::Settings;
use starfleet_lib::controller::VoiceController;
use starfleet_lib::player::AudioPlayer;
use starfleet_lib::server;
use starfleet_lib::starfleet_core::types::{VoiceEvent, VoiceState};
use starfleet_lib::starfleet_core::wav::parse_wav_header;
use starfleet_lib::stt::Transcriber;
use starfleet_lib::tools::ToolRegistry;

const DEFAULT_FILTER: &str = "starfleet=info,starfleet_lib=info";

/// starfleet — talk to your computer, answered with live system queries
#[derive(Parser)]
#[command(name = "starfleet", version, about)]
struct Cli {
    /// Config file (default: <config dir>/starfleet/config.toml)
    #[arg(long, global = true, env = "STARFLEET_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive push-to-talk in the terminal
    Run,
    /// Start the HTTP control API
    Serve {
        /// Listen host
        #[arg(long)]
        host: Option<String>,
        /// Listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send one text command and print the answer
    Ask {
        command: String,
        /// Also read the answer aloud
        #[arg(long)]
        speak: bool,
    },
    /// List the tools each MCP server offers
    Tools,
    /// Call an MCP tool directly
    Call {
        server: String,
        tool: String,
        /// Arguments as a JSON object
        arguments: Option<String>,
    },
    /// Transcribe a WAV file
    Transcribe { file: PathBuf },
    /// Play an MP3 or WAV file
    Play { file: PathBuf },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stderr keeps the interactive prompt clean
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run => run(settings).await?,

        Command::Serve { host, port } => {
            if let Some(host) = host {
                settings.server.host = host;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            let registry = connect_tools(&settings).await;
            let controller = VoiceController::from_settings(&settings, registry.clone())?;
            let app = server::router(controller.clone(), registry.tools());

            tokio::select! {
                res = server::serve(&settings.server, app) => res?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
            controller.shutdown();
            registry.shutdown().await;
        }

        Command::Ask { command, speak } => {
            settings.audio.speak_responses |= speak;
            let registry = connect_tools(&settings).await;
            let controller = VoiceController::from_settings(&settings, registry.clone())?;

            let turn = controller.submit_text(&command)?;
            let status = controller.wait_turn(turn).await;
            registry.shutdown().await;

            if let Some(error) = status.error {
                bail!(error);
            }
            println!("{}", status.response.unwrap_or_default());
        }

        Command::Tools => {
            let registry = ToolRegistry::connect_all(&settings.mcp.servers).await;
            let servers = registry.servers();
            if servers.is_empty() {
                println!("no MCP servers connected");
            }
            let tools = registry.tools();
            for server in servers {
                println!("{server}");
                for tool in tools.iter().filter(|t| t.server == server) {
                    let summary = tool.description.lines().next().unwrap_or_default();
                    println!("  {:<32} {summary}", tool.name);
                }
            }
            registry.shutdown().await;
        }

        Command::Call {
            server,
            tool,
            arguments,
        } => {
            let arguments: serde_json::Value = match arguments {
                Some(raw) => serde_json::from_str(&raw).context("arguments must be JSON")?,
                None => serde_json::json!({}),
            };
            let config = settings
                .mcp
                .servers
                .iter()
                .find(|s| s.name == server)
                .with_context(|| format!("no MCP server named '{server}' in config"))?;

            let registry = ToolRegistry::connect_all(std::slice::from_ref(config)).await;
            let result = registry.call_direct(&server, &tool, arguments).await;
            registry.shutdown().await;
            println!("{}", result?);
        }

        Command::Transcribe { file } => {
            let wav = std::fs::read(&file).with_context(|| format!("cannot read {}", file.display()))?;
            let header = parse_wav_header(&wav)
                .map_err(|e| anyhow::anyhow!("{}: invalid WAV: {e}", file.display()))?;
            info!(
                channels = header.channels,
                sample_rate = header.sample_rate,
                duration_ms = header.duration_ms(),
                "transcribing {}",
                file.display()
            );
            let text = Transcriber::new(settings.openai.clone())?.transcribe_wav(&wav).await?;
            println!("{text}");
        }

        Command::Play { file } => {
            if !file.is_file() {
                bail!("no such file: {}", file.display());
            }
            let player = AudioPlayer::new(None);
            player.play_file(&file);
            tokio::select! {
                _ = player.wait_idle() => {}
                _ = tokio::signal::ctrl_c() => player.stop(),
            }
        }

        Command::Config => print!("{}", settings.redacted().to_toml()?),
    }

    Ok(())
}

async fn connect_tools(settings: &Settings) -> Arc<ToolRegistry> {
    let registry = ToolRegistry::connect_all(&settings.mcp.servers).await;
    if registry.is_empty() {
        warn!("no MCP tools available, answers will come from the model alone");
    }
    Arc::new(registry)
}

/// Terminal push-to-talk loop. Enter toggles recording, other input is sent
/// as a typed command.
async fn run(settings: Settings) -> anyhow::Result<()> {
    let registry = connect_tools(&settings).await;
    let controller = VoiceController::from_settings(&settings, registry.clone())?;
    let printer = tokio::spawn(print_events(controller.subscribe_events()));

    println!("Enter to talk, Enter again to send. Type a command to skip the mic, q to quit.");
    println!("[{}]", controller.status().state.label());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let result = match line.trim() {
            "q" | "quit" | "exit" => break,
            "" if controller.status().state == VoiceState::Recording => {
                controller.release().await.map(|_| ())
            }
            "" => controller.press().await,
            command => controller.submit_text(command).map(|_| ()),
        };
        // failures also arrive as error events
        if let Err(e) = result {
            debug!("command rejected: {e}");
        }
    }

    controller.shutdown();
    printer.abort();
    registry.shutdown().await;
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<VoiceEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => print_event(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("missed {n} events"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_event(event: &VoiceEvent) {
    match event {
        VoiceEvent::State { state } => match state {
            VoiceState::Recording => println!("[{}] press Enter to send", state.label()),
            // the error line already explains it
            VoiceState::Error => {}
            _ => println!("[{}]", state.label()),
        },
        VoiceEvent::Transcript { text } => println!("> {text}"),
        VoiceEvent::ToolStarted { name } => println!("  ~ {name}"),
        VoiceEvent::ToolFinished { name, ok: false } => println!("  ! {name} failed"),
        VoiceEvent::ToolFinished { .. } => {}
        VoiceEvent::Response { text } => println!("\n{text}\n"),
        VoiceEvent::Error { message } => println!("[ERROR] {message}"),
    }
}
