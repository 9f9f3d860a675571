//! Daemon runner that orchestrates all components.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{broadcast, oneshot};
use tonic::transport::Server;
use tracing::{info, warn};

use crate::audio::Microphone;
use crate::config::{Config, SharedConfig};
use crate::controller::{Controller, DaemonHooks};
use crate::engine::{Engine, ToggleTrigger, spawn_toggle_listener};
use crate::history::TranscriptHistory;
use crate::inject::KeystrokeInjector;
use crate::provider::ProviderRegistry;
use crate::server::DictaflowService;
use crate::session::SessionContext;
use crate::socket::{cleanup_socket, create_listener};

/// Paths used by the daemon at runtime.
pub struct DaemonPaths {
    pub socket: PathBuf,
    pub pid: PathBuf,
    pub history: PathBuf,
    /// Where provider selections are persisted. `None` keeps them in memory.
    pub config: Option<PathBuf>,
}

impl DaemonPaths {
    /// Create paths using XDG defaults.
    pub fn from_xdg() -> Result<Self> {
        Ok(Self {
            socket: dictaflow_common::dirs::socket_path()?,
            pid: dictaflow_common::dirs::pid_path()?,
            history: dictaflow_common::dirs::history_path()?,
            config: Some(Config::config_path()?),
        })
    }
}

/// Run the daemon with default XDG paths and the user's config.
pub async fn run(config: Config) -> Result<()> {
    run_with(DaemonPaths::from_xdg()?, config).await
}

/// Pick the configured provider, falling back to the first available one.
fn initial_provider(registry: &ProviderRegistry, configured: &str) -> Result<String> {
    if registry.get(configured).is_some_and(|p| p.metadata().available) {
        return Ok(configured.to_string());
    }
    let fallback = registry
        .available()
        .next()
        .map(|m| m.id.to_string())
        .context("No available transcription providers")?;
    warn!(configured, fallback = %fallback, "Configured provider unusable, falling back");
    Ok(fallback)
}

/// Forward SIGUSR1 (plain) and SIGUSR2 (with formatting) to the toggle listener.
fn spawn_signal_toggles(trigger: ToggleTrigger) -> Result<()> {
    let mut plain = signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1")?;
    let mut formatted = signal(SignalKind::user_defined2()).context("Failed to install SIGUSR2")?;
    tokio::spawn(async move {
        loop {
            let with_formatting_override = tokio::select! {
                Some(()) = plain.recv() => false,
                Some(()) = formatted.recv() => true,
                else => break,
            };
            info!(with_formatting_override, "Toggle signal received");
            if !trigger.fire(with_formatting_override) {
                break;
            }
        }
    });
    Ok(())
}

/// Reload the config file on SIGHUP. Takes effect from the next session.
fn spawn_config_reload(path: PathBuf, shared: SharedConfig, engine: Arc<Engine>) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match Config::load_from(&path) {
                Ok(mut config) => {
                    // The provider only changes through SelectProvider
                    config.provider.active = shared.get().provider.active;
                    engine.reconfigure(config.session_options());
                    shared.update(|c| *c = config);
                    info!(path = %path.display(), "Config reloaded");
                }
                Err(e) => warn!(error = %e, "Config reload failed, keeping current settings"),
            }
        }
    });
    Ok(())
}

/// Run the daemon with custom paths.
pub async fn run_with(paths: DaemonPaths, config: Config) -> Result<()> {
    let sock_path = paths.socket;
    let pid_file = paths.pid;

    let pid = std::process::id();
    if let Some(parent) = pid_file.parent() {
        std::fs::create_dir_all(parent).context("Failed to create PID directory")?;
    }
    std::fs::write(&pid_file, pid.to_string()).context("Failed to write PID file")?;
    info!(pid = pid, path = %pid_file.display(), "Wrote PID file");

    let listener = match create_listener(&sock_path) {
        Ok(listener) => listener,
        Err(e) => {
            let _ = std::fs::remove_file(&pid_file);
            return Err(e);
        }
    };
    info!(path = %sock_path.display(), "Listening on Unix socket");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (event_tx, _) = broadcast::channel(256);

    let registry = Arc::new(ProviderRegistry::with_defaults());
    let provider_id = initial_provider(&registry, &config.provider.active)?;
    let options = config.session_options();
    let shared = SharedConfig::new(config.clone());
    shared.update(|c| c.provider.active = provider_id.clone());

    let hooks = Arc::new(DaemonHooks::new(
        event_tx.clone(),
        Arc::new(KeystrokeInjector::new(&config.injection)),
        TranscriptHistory::new(paths.history),
        shared.clone(),
    ));
    let context = SessionContext {
        credentials: Arc::new(shared.clone()),
        settings: Arc::new(shared.clone()),
        audio: Arc::new(Microphone),
        hooks: hooks.clone(),
        levels: hooks,
    };
    let engine = Arc::new(Engine::new(registry, context, options, &provider_id)?);

    let (trigger, triggers) = ToggleTrigger::channel();
    let toggles = spawn_toggle_listener(engine.clone(), triggers);
    spawn_signal_toggles(trigger)?;

    if let Some(path) = &paths.config {
        spawn_config_reload(path.clone(), shared.clone(), engine.clone())?;
    }
    let mut controller = Controller::new(engine, shared, event_tx, shutdown_tx);
    if let Some(path) = paths.config {
        controller = controller.with_config_path(path);
    }
    let controller = Arc::new(controller);
    let service = DictaflowService::new(controller.clone());

    let incoming = async_stream::stream! {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => yield Ok::<_, std::io::Error>(stream),
                Err(e) => {
                    tracing::error!(error = %e, "Accept error");
                }
            }
        }
    };

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM")?;
    info!(provider = %provider_id, "Daemon started");
    let server = Server::builder()
        .add_service(service.into_server())
        .serve_with_incoming_shutdown(incoming, async move {
            tokio::select! {
                _ = shutdown_rx => {
                    info!("Shutdown requested");
                    return;
                }
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                _ = terminate.recv() => info!("Terminated"),
            }
            // Signals skip the RPC path, so save leftovers and end subscriptions here
            controller.shutdown().await;
        });

    let result = server.await;

    toggles.abort();
    cleanup_socket(&sock_path);
    let _ = std::fs::remove_file(&pid_file);
    info!("Daemon stopped");

    result.context("Server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeProvider;

    #[test]
    fn test_initial_provider_keeps_known() {
        let registry = ProviderRegistry::with_defaults();

        assert_eq!(initial_provider(&registry, "deepgram").unwrap(), "deepgram");
    }

    #[test]
    fn test_initial_provider_falls_back() {
        let registry = ProviderRegistry::with_defaults();

        let id = initial_provider(&registry, "speechmatics").unwrap();

        assert!(registry.get(&id).is_some());
    }

    #[test]
    fn test_initial_provider_empty_registry() {
        assert!(initial_provider(&ProviderRegistry::new(), "deepgram").is_err());
    }

    #[test]
    fn test_initial_provider_skips_unavailable() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(FakeProvider::unavailable("offline")))
            .unwrap();
        registry.register(Arc::new(FakeProvider::new("online"))).unwrap();

        assert_eq!(initial_provider(&registry, "offline").unwrap(), "online");
        assert_eq!(initial_provider(&registry, "missing").unwrap(), "online");
    }

    #[test]
    fn test_initial_provider_none_available() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(FakeProvider::unavailable("offline")))
            .unwrap();

        assert!(initial_provider(&registry, "offline").is_err());
    }
}
