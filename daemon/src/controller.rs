//! Controller wires sessions to the rest of the daemon.
//!
//! [`DaemonHooks`] receives session callbacks and turns them into broadcast
//! events, command dispatch, formatting, injection and history. The
//! [`Controller`] is what the gRPC service talks to.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dictaflow_proto::{self as proto, Event, event};

use crate::commands::VoiceCommand;
use crate::config::SharedConfig;
use crate::dispatch::{CommandDispatcher, TextSink};
use crate::engine::Engine;
use crate::error::SessionError;
use crate::format::Formatter;
use crate::history::{HistoryEntry, TranscriptHistory};
use crate::level::{BAR_COUNT, LevelSink};
use crate::session::{
    ConnectionStatus, RecordingStatus, SessionHooks, StoppedSession, TranscriptSegment,
    TranscriptionSession, UnsavedTranscript,
};

/// Event sender type.
pub type EventSender = broadcast::Sender<Event>;

fn broadcast_event(events: &EventSender, event: event::Event) {
    // Ignore send errors (no subscribers)
    let _ = events.send(Event { event: Some(event) });
}

/// Session callbacks for the daemon.
pub struct DaemonHooks {
    events: EventSender,
    dispatcher: CommandDispatcher,
    sink: Arc<dyn TextSink>,
    history: TranscriptHistory,
    config: SharedConfig,
}

impl DaemonHooks {
    pub fn new(
        events: EventSender,
        sink: Arc<dyn TextSink>,
        history: TranscriptHistory,
        config: SharedConfig,
    ) -> Self {
        Self {
            events,
            dispatcher: CommandDispatcher::new(sink.clone()),
            sink,
            history,
            config,
        }
    }

    fn broadcast(&self, event: event::Event) {
        broadcast_event(&self.events, event);
    }

    async fn insert(&self, text: &str) {
        let sink = self.sink.clone();
        let text = text.to_string();
        match tokio::task::spawn_blocking(move || sink.insert(&text)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to insert transcript");
                self.error(&format!("Failed to insert transcript: {e:#}"));
            }
            Err(e) => warn!(error = %e, "Insert task failed"),
        }
    }
}

#[async_trait]
impl SessionHooks for DaemonHooks {
    fn recording_state(&self, recording: bool) {
        self.broadcast(event::Event::RecordingState(proto::RecordingState { recording }));
    }

    fn transcript_changed(&self, segment: &TranscriptSegment) {
        self.broadcast(event::Event::Transcript(proto::TranscriptUpdate {
            text: segment.text.clone(),
            is_final: segment.is_final,
        }));
    }

    fn error(&self, message: &str) {
        self.broadcast(event::Event::Error(proto::SessionError {
            message: message.to_string(),
        }));
    }

    fn on_command(
        &self,
        session: &TranscriptionSession,
        command: VoiceCommand,
        transcript: &str,
    ) -> anyhow::Result<()> {
        self.broadcast(event::Event::Command(proto::CommandDetected {
            command: command.to_string(),
            transcript: transcript.to_string(),
        }));
        self.dispatcher.dispatch(session, command, transcript);
        Ok(())
    }

    async fn on_stopped(&self, stopped: StoppedSession) -> anyhow::Result<Option<String>> {
        let outcome = self.dispatcher.take_outcome(&stopped.session_id);
        let config = self.config.get();
        let mut text = stopped.transcript.clone();

        if outcome.is_none() && (config.formatting.enabled || stopped.with_formatting_override) {
            match Formatter::new(&config.formatting).format(&text).await {
                Ok(formatted) => text = formatted,
                Err(e) => {
                    warn!(error = %e, "Formatting failed, keeping raw transcript");
                    self.error(&format!("Formatting failed: {e:#}"));
                }
            }
        }

        match outcome {
            Some(outcome) => debug!(?outcome, "Command handled the transcript; not inserting"),
            None if config.injection.auto_insert => self.insert(&text).await,
            None => debug!("Auto-insert disabled"),
        }

        self.broadcast(event::Event::SessionStopped(proto::SessionStopped {
            session_id: stopped.session_id,
            transcript: text.clone(),
            duration_secs: stopped.duration_secs,
        }));
        Ok(Some(text))
    }

    async fn save_transcript(&self, unsaved: &UnsavedTranscript) -> anyhow::Result<()> {
        self.history
            .append(&HistoryEntry::new(
                &unsaved.session_id,
                &unsaved.provider_id,
                &unsaved.text,
            ))
            .await?;
        debug!(session = %unsaved.session_id, path = %self.history.path().display(), "Saved transcript");
        Ok(())
    }
}

impl LevelSink for DaemonHooks {
    fn audio_level(&self, level: f32, bars: &[f32; BAR_COUNT]) {
        self.broadcast(event::Event::AudioLevel(proto::AudioLevel {
            level,
            bars: bars.to_vec(),
        }));
    }
}

/// Controller for daemon state management.
pub struct Controller {
    engine: Arc<Engine>,
    config: SharedConfig,
    config_path: Option<PathBuf>,
    event_tx: EventSender,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Cancelled on shutdown so open subscriptions end.
    closing: CancellationToken,
}

impl Controller {
    pub fn new(
        engine: Arc<Engine>,
        config: SharedConfig,
        event_tx: EventSender,
        shutdown_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            engine,
            config,
            config_path: None,
            event_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            closing: CancellationToken::new(),
        }
    }

    /// Persist provider selections to `path`.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub async fn toggle(&self, with_formatting_override: bool) -> Result<(), SessionError> {
        self.engine.toggle(with_formatting_override).await
    }

    pub async fn stop_recording(&self) {
        self.engine.active().stop_recording().await;
    }

    pub async fn clear_transcript(&self) -> Result<(), SessionError> {
        self.engine.clear_transcript().await
    }

    pub fn status(&self) -> proto::StatusReply {
        let snapshot = self.engine.active().snapshot();
        let connection = match snapshot.connection {
            ConnectionStatus::Disconnected => proto::ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting => proto::ConnectionStatus::Connecting,
            ConnectionStatus::Connected => proto::ConnectionStatus::Connected,
        };
        proto::StatusReply {
            provider: snapshot.provider_id,
            connection: connection.into(),
            recording: snapshot.recording == RecordingStatus::Recording,
            session_id: snapshot.session_id.unwrap_or_default(),
            transcript: snapshot.transcript,
            edited_transcript: snapshot.edited_transcript,
            error: snapshot.error,
        }
    }

    pub fn providers(&self) -> Vec<proto::Provider> {
        let active = self.engine.active().provider_id();
        self.engine
            .registry()
            .all()
            .map(|m| proto::Provider {
                id: m.id.to_string(),
                name: m.name.to_string(),
                tier: m.tier.as_str().to_string(),
                supports_partials: m.capabilities.supports_partials,
                supports_diarization: m.capabilities.supports_diarization,
                supports_formatting: m.capabilities.supports_formatting,
                available: m.available,
                active: m.id == active,
            })
            .collect()
    }

    /// Switch providers and remember the choice.
    pub async fn select_provider(&self, id: &str) -> Result<(), SessionError> {
        self.engine.select_provider(id).await?;
        self.config.update(|c| c.provider.active = id.to_string());

        if let Some(path) = &self.config_path {
            if let Err(e) = self.config.get().save_to(path) {
                warn!(error = %e, "Failed to persist provider selection");
            }
        }
        info!(provider = id, "Provider selected");
        Ok(())
    }

    /// Stop any session and signal the server to exit.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        self.closing.cancel();
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
    }

    /// Get the event sender for creating subscribers.
    pub fn event_sender(&self) -> EventSender {
        self.event_tx.clone()
    }

    /// Token cancelled once shutdown starts.
    pub fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod tests;
