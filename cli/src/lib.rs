//! `dictactl`: command-line control for the dictaflow daemon.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use dictaflow_common::client;
use dictaflow_proto::{
    ConnectionStatus, Empty, Event, Provider, SelectProviderRequest, StatusReply, ToggleRequest,
    event,
};
use tokio_stream::StreamExt;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Name of the daemon binary, expected next to this executable.
const DAEMON_BIN: &str = "dictad";
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "dictactl")]
#[command(about = "dictaflow CLI - streaming cloud dictation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the dictation daemon
    Start,
    /// Stop the dictation daemon
    Stop,
    /// Show daemon and session status
    Status,
    /// Start dictating, or stop if already recording
    Toggle {
        /// Run the formatter on this session even if formatting is off
        #[arg(long)]
        format: bool,
    },
    /// Stop the current recording
    Finish,
    /// Discard the current transcript
    Clear,
    /// List transcription providers
    Providers,
    /// Switch to another provider
    Use {
        /// Provider id, e.g. `deepgram`
        id: String,
    },
    /// Print daemon events as they happen
    Watch {
        /// Include audio level frames
        #[arg(long)]
        levels: bool,
    },
}

pub async fn run() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let socket_path = dictaflow_common::dirs::socket_path()?;

    match cli.command {
        Commands::Start => start_daemon(&socket_path).await?,
        Commands::Stop => {
            if !client::is_daemon_running(&socket_path).await {
                println!("Daemon is not running");
                return Ok(());
            }
            client::connect(&socket_path).await?.shutdown(Empty {}).await?;
            println!("Daemon stopped");
        }
        Commands::Status => {
            if !client::is_daemon_running(&socket_path).await {
                println!("Daemon: not running");
                return Ok(());
            }
            let status = client::connect(&socket_path)
                .await?
                .get_status(Empty {})
                .await?
                .into_inner();
            print!("{}", describe_status(&status));
        }
        Commands::Toggle { format } => {
            client::connect(&socket_path)
                .await?
                .toggle(ToggleRequest {
                    with_formatting_override: format,
                })
                .await?;
        }
        Commands::Finish => {
            client::connect(&socket_path)
                .await?
                .stop_recording(Empty {})
                .await?;
        }
        Commands::Clear => {
            client::connect(&socket_path)
                .await?
                .clear_transcript(Empty {})
                .await?;
        }
        Commands::Providers => {
            let list = client::connect(&socket_path)
                .await?
                .list_providers(Empty {})
                .await?
                .into_inner();
            for provider in &list.providers {
                println!("{}", describe_provider(provider));
            }
        }
        Commands::Use { id } => {
            client::connect(&socket_path)
                .await?
                .select_provider(SelectProviderRequest { id: id.clone() })
                .await?;
            println!("Using {id}");
        }
        Commands::Watch { levels } => watch(&socket_path, levels).await?,
    }

    Ok(())
}

/// Spawn the daemon detached and wait for its socket.
async fn start_daemon(socket_path: &Path) -> Result<()> {
    if client::is_daemon_running(socket_path).await {
        println!("Daemon is already running");
        return Ok(());
    }

    let exe = std::env::current_exe().context("Failed to locate dictactl executable")?;
    let daemon = exe.with_file_name(DAEMON_BIN);
    tracing::info!(path = %daemon.display(), "Starting daemon");
    Command::new(&daemon)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to start {}", daemon.display()))?;

    let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if client::is_daemon_running(socket_path).await {
            println!("Daemon started");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bail!("Daemon did not come up within {}s", STARTUP_TIMEOUT.as_secs())
}

async fn watch(socket_path: &Path, levels: bool) -> Result<()> {
    let mut client = client::connect(socket_path).await?;
    let mut events = client::subscribe(&mut client).await?;
    while let Some(event) = events.next().await {
        if let Some(line) = describe_event(&event?, levels) {
            println!("{line}");
        }
    }
    Ok(())
}

fn connection_label(connection: i32) -> &'static str {
    match ConnectionStatus::try_from(connection) {
        Ok(ConnectionStatus::Connected) => "connected",
        Ok(ConnectionStatus::Connecting) => "connecting",
        Ok(ConnectionStatus::Disconnected) | Err(_) => "disconnected",
    }
}

fn describe_status(status: &StatusReply) -> String {
    let mut out = format!(
        "Provider:   {}\nConnection: {}\nRecording:  {}\n",
        status.provider,
        connection_label(status.connection),
        if status.recording { "yes" } else { "no" },
    );
    if !status.session_id.is_empty() {
        out.push_str(&format!("Session:    {}\n", status.session_id));
    }
    if !status.transcript.is_empty() {
        out.push_str(&format!("Transcript: {}\n", status.transcript));
    }
    if let Some(edited) = &status.edited_transcript {
        out.push_str(&format!("Edited:     {edited}\n"));
    }
    if let Some(error) = &status.error {
        out.push_str(&format!("Error:      {error}\n"));
    }
    out
}

fn describe_provider(provider: &Provider) -> String {
    let marker = if provider.active { "*" } else { " " };
    let mut features = Vec::new();
    if provider.supports_partials {
        features.push("partials");
    }
    if provider.supports_diarization {
        features.push("diarization");
    }
    if provider.supports_formatting {
        features.push("formatting");
    }
    let availability = if provider.available { "" } else { " (unavailable)" };
    format!(
        "{marker} {:<12} {} [{}] {}{availability}",
        provider.id,
        provider.name,
        provider.tier,
        features.join(", ")
    )
}

/// One line per event; `None` for events not worth printing.
fn describe_event(event: &Event, levels: bool) -> Option<String> {
    match event.event.as_ref()? {
        event::Event::RecordingState(s) => Some(
            if s.recording {
                "recording started"
            } else {
                "recording stopped"
            }
            .to_string(),
        ),
        event::Event::AudioLevel(l) if levels => Some(format!("level {:.2}", l.level)),
        event::Event::AudioLevel(_) => None,
        event::Event::Transcript(t) => {
            let kind = if t.is_final { "final" } else { "partial" };
            Some(format!("{kind}: {}", t.text))
        }
        event::Event::Command(c) => Some(format!("command {}: {}", c.command, c.transcript)),
        event::Event::SessionStopped(s) => Some(format!(
            "session {} stopped after {:.1}s: {}",
            s.session_id, s.duration_secs, s.transcript
        )),
        event::Event::Error(e) => Some(format!("error: {}", e.message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dictaflow_proto::{AudioLevel, TranscriptUpdate};

    fn wrap(event: event::Event) -> Event {
        Event { event: Some(event) }
    }

    #[test]
    fn test_cli_parses_toggle_format() {
        let cli = Cli::try_parse_from(["dictactl", "toggle", "--format"]).unwrap();
        assert!(matches!(cli.command, Commands::Toggle { format: true }));
    }

    #[test]
    fn test_cli_parses_use() {
        let cli = Cli::try_parse_from(["dictactl", "use", "deepgram"]).unwrap();
        assert!(matches!(cli.command, Commands::Use { id } if id == "deepgram"));
    }

    #[test]
    fn test_describe_status_skips_empty_fields() {
        let status = StatusReply {
            provider: "deepgram".into(),
            connection: ConnectionStatus::Connected.into(),
            recording: true,
            ..Default::default()
        };

        let text = describe_status(&status);

        assert!(text.contains("Connection: connected"));
        assert!(text.contains("Recording:  yes"));
        assert!(!text.contains("Session:"));
        assert!(!text.contains("Error:"));
    }

    #[test]
    fn test_describe_provider_marks_active() {
        let provider = Provider {
            id: "assemblyai".into(),
            name: "AssemblyAI".into(),
            tier: "premium".into(),
            supports_partials: true,
            available: true,
            active: true,
            ..Default::default()
        };

        let line = describe_provider(&provider);

        assert!(line.starts_with("* assemblyai"));
        assert!(line.contains("partials"));
        assert!(!line.contains("unavailable"));
    }

    #[test]
    fn test_describe_event_hides_levels_by_default() {
        let level = wrap(event::Event::AudioLevel(AudioLevel {
            level: 0.5,
            bars: vec![],
        }));

        assert_eq!(describe_event(&level, false), None);
        assert_eq!(describe_event(&level, true).as_deref(), Some("level 0.50"));
    }

    #[test]
    fn test_describe_transcript_event() {
        let update = wrap(event::Event::Transcript(TranscriptUpdate {
            text: "hello".into(),
            is_final: false,
        }));

        assert_eq!(describe_event(&update, false).as_deref(), Some("partial: hello"));
        assert_eq!(describe_event(&Event { event: None }, false), None);
    }
}
