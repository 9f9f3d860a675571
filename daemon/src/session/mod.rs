//! Transcription session state machine.
//!
//! One [`TranscriptionSession`] owns the lifecycle of a single provider:
//! connect, wait for the backend to confirm, stream microphone audio, collect
//! provisional and committed transcripts, react to spoken commands and stop.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`; hooks always run with the lock released. Each start bumps a
//! generation counter so events, timers and connects belonging to an earlier
//! session are ignored.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::AudioSource;
use crate::commands::{self, VoiceCommand, VoiceCommands};
use crate::config::ProviderSettings;
use crate::credentials::CredentialProvider;
use crate::error::SessionError;
use crate::level::LevelSink;
use crate::provider::{Connection, ConnectionHandle, Provider, TransportEvent};

mod capture;
mod segments;

use capture::CaptureTask;
pub(crate) use segments::now_millis;
pub use segments::{Transcript, TranscriptSegment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingStatus {
    Idle,
    /// The backend confirmed the session and audio is flowing.
    Recording,
}

/// Delays and limits applied by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Wait before stopping after a command in a committed transcript.
    pub final_command_delay: Duration,
    /// Wait before stopping after a command in a provisional transcript.
    pub partial_command_delay: Duration,
    /// Bound on credential lookup plus transport open. `None` waits forever.
    pub connect_timeout: Option<Duration>,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            final_command_delay: Duration::from_millis(100),
            partial_command_delay: Duration::from_millis(200),
            connect_timeout: Some(Duration::from_secs(15)),
        }
    }
}

/// Per-session options the host may change between sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Input device name; `None` uses the system default.
    pub device_id: Option<String>,
    pub commands_enabled: bool,
    pub timing: SessionTiming,
}

/// Settings read when a session starts.
pub trait SettingsReader: Send + Sync {
    fn voice_commands(&self) -> VoiceCommands;
    fn provider_settings(&self, provider_id: &str) -> ProviderSettings;
}

/// What the stopped hook receives.
#[derive(Debug, Clone, PartialEq)]
pub struct StoppedSession {
    pub session_id: String,
    pub provider_id: String,
    pub transcript: String,
    pub duration_secs: f64,
    pub with_formatting_override: bool,
}

/// Text left over from a finished session, with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsavedTranscript {
    pub session_id: String,
    pub provider_id: String,
    pub text: String,
}

/// Downstream reactions to session activity.
///
/// Failures are logged by the session and never block a state transition.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Recording started (`true`) or stopped (`false`). May repeat.
    fn recording_state(&self, recording: bool);

    fn transcript_changed(&self, _segment: &TranscriptSegment) {}

    fn error(&self, _message: &str) {}

    /// A spoken command was detected. Called at most once per session.
    fn on_command(
        &self,
        session: &TranscriptionSession,
        command: VoiceCommand,
        transcript: &str,
    ) -> anyhow::Result<()>;

    /// The session stopped with a non-empty transcript. A returned string
    /// that differs from the transcript becomes the edited transcript.
    async fn on_stopped(&self, stopped: StoppedSession) -> anyhow::Result<Option<String>>;

    /// Persist text left over from a previous session.
    async fn save_transcript(&self, unsaved: &UnsavedTranscript) -> anyhow::Result<()>;
}

/// Collaborators shared by every session the daemon creates.
#[derive(Clone)]
pub struct SessionContext {
    pub credentials: Arc<dyn CredentialProvider>,
    pub settings: Arc<dyn SettingsReader>,
    pub audio: Arc<dyn AudioSource>,
    pub hooks: Arc<dyn SessionHooks>,
    pub levels: Arc<dyn LevelSink>,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub provider_id: String,
    pub session_id: Option<String>,
    pub connection: ConnectionStatus,
    pub recording: RecordingStatus,
    pub transcript: String,
    pub edited_transcript: Option<String>,
    pub command_fired: bool,
    pub error: Option<String>,
}

struct SessionState {
    session_id: Option<String>,
    connection: ConnectionStatus,
    recording: RecordingStatus,
    transcript: Transcript,
    edited_transcript: Option<String>,
    command_fired: bool,
    error: Option<String>,
    commands: VoiceCommands,
    options: SessionOptions,
    with_formatting_override: bool,
    started_at: Option<Instant>,
    generation: u64,
    handle: Option<ConnectionHandle>,
    capture: Option<CaptureTask>,
}

impl SessionState {
    fn is_live(&self) -> bool {
        self.connection != ConnectionStatus::Disconnected
            || self.recording == RecordingStatus::Recording
    }
}

struct Inner {
    provider: Arc<dyn Provider>,
    context: SessionContext,
    state: Mutex<SessionState>,
}

/// Transcription session bound to one provider. Cheap to clone.
#[derive(Clone)]
pub struct TranscriptionSession {
    inner: Arc<Inner>,
}

/// A start that has moved the session to `Connecting` but not connected yet.
pub(crate) struct PendingStart {
    generation: u64,
    connect_timeout: Option<Duration>,
    settings: ProviderSettings,
}

/// Result of ingesting one transcript fragment.
enum Ingested {
    Stored(TranscriptSegment),
    Command {
        segment: TranscriptSegment,
        command: VoiceCommand,
        transcript: String,
        delay: Duration,
    },
}

impl TranscriptionSession {
    pub fn new(provider: Arc<dyn Provider>, context: SessionContext, options: SessionOptions) -> Self {
        let state = SessionState {
            session_id: None,
            connection: ConnectionStatus::Disconnected,
            recording: RecordingStatus::Idle,
            transcript: Transcript::default(),
            edited_transcript: None,
            command_fired: false,
            error: None,
            commands: VoiceCommands::default(),
            options,
            with_formatting_override: false,
            started_at: None,
            generation: 0,
            handle: None,
            capture: None,
        };
        Self {
            inner: Arc::new(Inner {
                provider,
                context,
                state: Mutex::new(state),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hooks(&self) -> &dyn SessionHooks {
        self.inner.context.hooks.as_ref()
    }

    pub fn provider_id(&self) -> &'static str {
        self.inner.provider.metadata().id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        SessionSnapshot {
            provider_id: self.provider_id().to_string(),
            session_id: state.session_id.clone(),
            connection: state.connection,
            recording: state.recording,
            transcript: state.transcript.full_text(),
            edited_transcript: state.edited_transcript.clone(),
            command_fired: state.command_fired,
            error: state.error.clone(),
        }
    }

    /// Connecting, connected or recording.
    pub fn is_live(&self) -> bool {
        self.lock().is_live()
    }

    pub fn is_recording(&self) -> bool {
        self.lock().recording == RecordingStatus::Recording
    }

    pub fn full_transcript(&self) -> String {
        self.lock().transcript.full_text()
    }

    /// Text a new session would discard: the edited transcript if any,
    /// otherwise the collected segments.
    pub fn unsaved_transcript(&self) -> Option<String> {
        self.unsaved().map(|u| u.text)
    }

    /// [`Self::unsaved_transcript`] labelled with its session and provider.
    pub fn unsaved(&self) -> Option<UnsavedTranscript> {
        let state = self.lock();
        let text = state
            .edited_transcript
            .clone()
            .unwrap_or_else(|| state.transcript.full_text());
        if text.trim().is_empty() {
            return None;
        }
        Some(UnsavedTranscript {
            session_id: state.session_id.clone().unwrap_or_default(),
            provider_id: self.provider_id().to_string(),
            text,
        })
    }

    /// Replace device, command and timing options. Applies to the next
    /// fragment or session; a running capture keeps its device.
    pub fn reconfigure(&self, options: SessionOptions) {
        self.lock().options = options;
    }

    /// Drop the collected transcript. The session id is kept while the
    /// session is live so downstream state stays attached to it.
    pub fn clear_transcript(&self) {
        let mut state = self.lock();
        state.transcript.clear();
        state.edited_transcript = None;
        if !state.is_live() {
            state.session_id = None;
        }
    }

    /// Connect to the provider. Recording begins once the backend confirms
    /// the session. Does nothing when already live.
    pub async fn start_recording(&self, with_formatting_override: bool) -> Result<(), SessionError> {
        match self.prepare_start(with_formatting_override) {
            Some(pending) => self.connect(pending).await,
            None => Ok(()),
        }
    }

    /// Move to `Connecting` without awaiting. `None` when already live.
    pub(crate) fn prepare_start(&self, with_formatting_override: bool) -> Option<PendingStart> {
        let commands = self.inner.context.settings.voice_commands();
        let settings = self.inner.context.settings.provider_settings(self.provider_id());

        let (generation, connect_timeout) = {
            let mut state = self.lock();
            if state.is_live() {
                debug!(provider = self.provider_id(), "Session already live");
                return None;
            }
            state.generation += 1;
            state.command_fired = false;
            state.commands = commands;
            if state.session_id.is_none() {
                state.session_id = Some(Uuid::new_v4().to_string());
            }
            state.transcript.clear();
            state.edited_transcript = None;
            state.error = None;
            state.with_formatting_override = with_formatting_override;
            state.connection = ConnectionStatus::Connecting;
            (state.generation, state.options.timing.connect_timeout)
        };
        info!(provider = self.provider_id(), "Connecting");
        Some(PendingStart {
            generation,
            connect_timeout,
            settings,
        })
    }

    /// Finish a start begun by [`Self::prepare_start`].
    pub(crate) async fn connect(&self, pending: PendingStart) -> Result<(), SessionError> {
        let PendingStart {
            generation,
            connect_timeout,
            settings,
        } = pending;
        let connect = self
            .inner
            .provider
            .connect(self.inner.context.credentials.as_ref(), &settings);
        let result = match connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .unwrap_or_else(|_| {
                    Err(SessionError::Timeout {
                        provider: self.provider_id().to_string(),
                        secs: limit.as_secs(),
                    })
                }),
            None => connect.await,
        };

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                self.fail_start(generation, &e);
                return Err(e);
            }
        };

        let Connection { handle, events } = connection;
        let late = {
            let mut state = self.lock();
            if state.generation != generation
                || state.connection != ConnectionStatus::Connecting
            {
                Some(handle)
            } else {
                state.handle = Some(handle);
                state.connection = ConnectionStatus::Connected;
                None
            }
        };

        if let Some(handle) = late {
            info!("Stopped while connecting; closing late connection");
            handle.close();
            return Ok(());
        }
        info!(provider = self.provider_id(), "Connected, waiting for session");
        self.spawn_pump(generation, events);
        Ok(())
    }

    fn fail_start(&self, generation: u64, error: &SessionError) {
        let message = error.to_string();
        warn!(provider = self.provider_id(), error = %message, "Failed to start session");
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.connection = ConnectionStatus::Disconnected;
            state.recording = RecordingStatus::Idle;
            state.error = Some(message.clone());
        }
        self.hooks().recording_state(false);
        self.hooks().error(&message);
    }

    fn spawn_pump(&self, generation: u64, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let session = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                session.handle_event(generation, event).await;
            }
            session
                .handle_event(
                    generation,
                    TransportEvent::Closed {
                        code: None,
                        reason: "event stream ended".to_string(),
                    },
                )
                .await;
        });
    }

    /// Apply one transport event from the connection opened in `generation`.
    pub(crate) async fn handle_event(&self, generation: u64, event: TransportEvent) {
        if self.lock().generation != generation {
            debug!(?event, "Ignoring event from previous session");
            return;
        }

        match event {
            TransportEvent::SessionBegins { id } => self.begin(generation, id).await,
            TransportEvent::Partial(text) => self.ingest(generation, text, false),
            TransportEvent::Final(text) => self.ingest(generation, text, true),
            TransportEvent::Closed { code, reason } => {
                if self.lock().handle.is_some() {
                    info!(?code, reason = %reason, "Connection closed unexpectedly");
                    self.stop_generation(Some(generation)).await;
                }
            }
            TransportEvent::AuthError(message) => self.fail_auth(generation, message).await,
            TransportEvent::Error(message) => {
                warn!(error = %message, "Provider reported an error");
                self.lock().error = Some(message.clone());
                self.hooks().error(&message);
            }
        }
    }

    async fn begin(&self, generation: u64, backend_id: Option<String>) {
        let (device, audio) = {
            let mut state = self.lock();
            let Some(handle) = state.handle.as_ref() else {
                return;
            };
            if state.recording == RecordingStatus::Recording {
                return;
            }
            let audio = handle.audio_sender();
            state.recording = RecordingStatus::Recording;
            state.started_at = Some(Instant::now());
            (state.options.device_id.clone(), audio)
        };
        info!(backend_session = backend_id.as_deref().unwrap_or("-"), "Recording");
        self.hooks().recording_state(true);

        let context = &self.inner.context;
        match CaptureTask::spawn(context.audio.clone(), device, audio, context.levels.clone()).await
        {
            Ok(task) => {
                let stale = {
                    let mut state = self.lock();
                    if state.generation == generation && state.handle.is_some() {
                        state.capture = Some(task);
                        None
                    } else {
                        Some(task)
                    }
                };
                if let Some(task) = stale {
                    task.stop().await;
                }
            }
            Err(e) => {
                let message = format!("Microphone unavailable: {e:#}");
                warn!(error = %message, "Continuing without audio capture");
                self.lock().error = Some(message.clone());
                self.hooks().error(&message);
            }
        }
    }

    fn ingest(&self, generation: u64, text: String, is_final: bool) {
        let ingested = {
            let mut state = self.lock();
            if state.handle.is_none() {
                return;
            }
            let detection = state
                .options
                .commands_enabled
                .then(|| commands::detect(&text, &state.commands));

            match detection.and_then(|d| d.command.map(|c| (c, d.cleaned_text))) {
                Some((command, cleaned)) => {
                    let segment = TranscriptSegment::new(cleaned, is_final);
                    state.transcript.ingest(segment.clone());
                    if state.command_fired {
                        Ingested::Stored(segment)
                    } else {
                        state.command_fired = true;
                        let timing = state.options.timing;
                        Ingested::Command {
                            segment,
                            command,
                            transcript: state.transcript.full_text(),
                            delay: if is_final {
                                timing.final_command_delay
                            } else {
                                timing.partial_command_delay
                            },
                        }
                    }
                }
                None => {
                    let segment = TranscriptSegment::new(text, is_final);
                    state.transcript.ingest(segment.clone());
                    Ingested::Stored(segment)
                }
            }
        };

        match ingested {
            Ingested::Stored(segment) => self.hooks().transcript_changed(&segment),
            Ingested::Command {
                segment,
                command,
                transcript,
                delay,
            } => {
                info!(%command, "Voice command detected");
                self.hooks().transcript_changed(&segment);
                if let Err(e) = self.hooks().on_command(self, command, &transcript) {
                    warn!(%command, error = %e, "Command hook failed");
                }

                let session = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    session.stop_generation(Some(generation)).await;
                });
            }
        }
    }

    async fn fail_auth(&self, generation: u64, message: String) {
        warn!(error = %message, "Provider rejected credentials");
        let (handle, capture) = {
            let mut state = self.lock();
            // already stopped: a trailing auth close changes nothing
            if state.generation != generation || state.handle.is_none() {
                return;
            }
            state.error = Some(message.clone());
            state.connection = ConnectionStatus::Disconnected;
            state.recording = RecordingStatus::Idle;
            state.started_at = None;
            (state.handle.take(), state.capture.take())
        };

        self.hooks().recording_state(false);
        self.hooks().error(&message);
        match capture {
            Some(capture) => capture.stop().await,
            None => self.inner.context.levels.reset(),
        }
        if let Some(handle) = handle {
            handle.close();
        }
    }

    /// Stop recording and close the connection. Safe to call at any time;
    /// the transcript is handed downstream once per session.
    pub async fn stop_recording(&self) {
        self.stop_generation(None).await;
    }

    async fn stop_generation(&self, generation: Option<u64>) {
        let (handle, capture, started_at, with_formatting_override) = {
            let mut state = self.lock();
            if generation.is_some_and(|g| g != state.generation) {
                return;
            }
            if state.connection == ConnectionStatus::Connecting {
                // invalidate the in-flight connect
                state.generation += 1;
            }
            state.connection = ConnectionStatus::Disconnected;
            state.recording = RecordingStatus::Idle;
            (
                state.handle.take(),
                state.capture.take(),
                state.started_at.take(),
                state.with_formatting_override,
            )
        };

        self.hooks().recording_state(false);
        match capture {
            Some(capture) => capture.stop().await,
            None => self.inner.context.levels.reset(),
        }

        let Some(handle) = handle else {
            return;
        };
        handle.close();

        let (transcript, session_id) = {
            let state = self.lock();
            (state.transcript.full_text(), state.session_id.clone())
        };
        let duration_secs = started_at.map_or(0.0, |t| t.elapsed().as_secs_f64());
        info!(
            provider = self.provider_id(),
            duration_secs,
            chars = transcript.len(),
            "Session stopped"
        );
        if transcript.is_empty() {
            return;
        }

        let stopped = StoppedSession {
            session_id: session_id.unwrap_or_default(),
            provider_id: self.provider_id().to_string(),
            transcript: transcript.clone(),
            duration_secs,
            with_formatting_override,
        };
        match self.hooks().on_stopped(stopped).await {
            Ok(Some(edited)) if edited != transcript => {
                self.lock().edited_transcript = Some(edited);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Stopped hook failed"),
        }
    }

    #[cfg(test)]
    fn generation(&self) -> u64 {
        self.lock().generation
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
