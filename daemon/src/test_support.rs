//! In-process fakes for the session collaborators.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioSource, CaptureStream};
use crate::commands::{VoiceCommand, VoiceCommands};
use crate::config::ProviderSettings;
use crate::credentials::CredentialProvider;
use crate::dispatch::TextSink;
use crate::error::SessionError;
use crate::level::{BAR_COUNT, LevelSink};
use crate::provider::{
    AudioChunk, Capabilities, Connection, ConnectionHandle, Provider, ProviderMetadata, Tier,
    TransportEvent,
};
use crate::session::{
    SessionContext, SessionHooks, SessionOptions, SessionTiming, SettingsReader, StoppedSession,
    TranscriptSegment, TranscriptionSession, UnsavedTranscript,
};

/// Poll `condition` until it holds, panicking after two seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

/// Fast timings so command auto-stops land quickly in tests.
pub(crate) fn test_options() -> SessionOptions {
    SessionOptions {
        device_id: None,
        commands_enabled: true,
        timing: SessionTiming {
            final_command_delay: Duration::from_millis(10),
            partial_command_delay: Duration::from_millis(20),
            connect_timeout: Some(Duration::from_secs(1)),
        },
    }
}

/// Connection opened by [`FakeProvider`], driven by the test.
pub(crate) struct OpenedConnection {
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub audio: mpsc::Receiver<AudioChunk>,
    pub close: CancellationToken,
}

pub(crate) struct FakeProvider {
    metadata: ProviderMetadata,
    failure: Mutex<Option<SessionError>>,
    gate: Option<Arc<Notify>>,
    pub opened: Mutex<Vec<OpenedConnection>>,
}

impl FakeProvider {
    pub fn new(id: &'static str) -> Self {
        Self {
            metadata: ProviderMetadata {
                id,
                name: "Fake",
                tier: Tier::Standard,
                capabilities: Capabilities {
                    supports_partials: true,
                    ..Default::default()
                },
                available: true,
            },
            failure: Mutex::new(None),
            gate: None,
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Registered but declared unusable.
    pub fn unavailable(id: &'static str) -> Self {
        let mut provider = Self::new(id);
        provider.metadata.available = false;
        provider
    }

    /// Connects block until the returned gate is notified.
    pub fn gated(id: &'static str) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let mut provider = Self::new(id);
        provider.gate = Some(gate.clone());
        (provider, gate)
    }

    pub fn fail_with(&self, error: SessionError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn connections(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    /// Deliver an event on the most recent connection.
    pub fn send(&self, event: TransportEvent) {
        let opened = self.opened.lock().unwrap();
        opened
            .last()
            .expect("no connection opened")
            .events
            .send(event)
            .expect("session dropped event stream");
    }

    pub fn last_closed(&self) -> bool {
        self.opened
            .lock()
            .unwrap()
            .last()
            .is_some_and(|c| c.close.is_cancelled())
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    async fn connect(
        &self,
        _credentials: &dyn CredentialProvider,
        _settings: &ProviderSettings,
    ) -> Result<Connection, SessionError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let failure = self.failure.lock().unwrap().clone();
        if let Some(error) = failure {
            return Err(error);
        }

        let (audio_tx, audio_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();
        self.opened.lock().unwrap().push(OpenedConnection {
            events: events_tx,
            audio: audio_rx,
            close: close.clone(),
        });
        Ok(Connection {
            handle: ConnectionHandle::new(audio_tx, close),
            events: events_rx,
        })
    }
}

/// Microphone stand-in that records opens and stops.
#[derive(Default)]
pub(crate) struct FakeAudio {
    pub fail: AtomicBool,
    pub opens: AtomicUsize,
    pub stops: Arc<AtomicUsize>,
    pub samples: Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>,
}

impl AudioSource for FakeAudio {
    fn open(&self, _device: Option<&str>) -> anyhow::Result<CaptureStream> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("no input device");
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.samples.lock().unwrap() = Some(tx);
        let stops = self.stops.clone();
        Ok(CaptureStream::new(rx, 16000, move || {
            stops.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

#[derive(Default)]
pub(crate) struct RecordingLevels {
    pub frames: Mutex<Vec<f32>>,
}

impl RecordingLevels {
    pub fn last(&self) -> Option<f32> {
        self.frames.lock().unwrap().last().copied()
    }
}

impl LevelSink for RecordingLevels {
    fn audio_level(&self, level: f32, _bars: &[f32; BAR_COUNT]) {
        self.frames.lock().unwrap().push(level);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HookCall {
    Recording(bool),
    Transcript(String, bool),
    Error(String),
    Command(VoiceCommand, String),
    Stopped(StoppedSession),
    Saved(String),
}

#[derive(Default)]
pub(crate) struct RecordingHooks {
    calls: Mutex<Vec<HookCall>>,
    /// Returned from `on_stopped` when set.
    pub edit: Mutex<Option<String>>,
    pub fail_save: AtomicBool,
}

impl RecordingHooks {
    pub fn calls(&self) -> Vec<HookCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<StoppedSession> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HookCall::Stopped(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn commands(&self) -> Vec<(VoiceCommand, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HookCall::Command(command, text) => Some((command, text)),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HookCall::Error(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub fn saved(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HookCall::Saved(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: HookCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl SessionHooks for RecordingHooks {
    fn recording_state(&self, recording: bool) {
        self.push(HookCall::Recording(recording));
    }

    fn transcript_changed(&self, segment: &TranscriptSegment) {
        self.push(HookCall::Transcript(segment.text.clone(), segment.is_final));
    }

    fn error(&self, message: &str) {
        self.push(HookCall::Error(message.to_string()));
    }

    fn on_command(
        &self,
        _session: &TranscriptionSession,
        command: VoiceCommand,
        transcript: &str,
    ) -> anyhow::Result<()> {
        self.push(HookCall::Command(command, transcript.to_string()));
        Ok(())
    }

    async fn on_stopped(&self, stopped: StoppedSession) -> anyhow::Result<Option<String>> {
        self.push(HookCall::Stopped(stopped));
        Ok(self.edit.lock().unwrap().clone())
    }

    async fn save_transcript(&self, unsaved: &UnsavedTranscript) -> anyhow::Result<()> {
        // a real save suspends on file I/O
        tokio::task::yield_now().await;
        if self.fail_save.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.push(HookCall::Saved(unsaved.text.clone()));
        Ok(())
    }
}

/// Text sink that records what it was given.
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub inserted: Mutex<Vec<String>>,
    pub submitted: Mutex<Vec<String>>,
}

impl TextSink for RecordingSink {
    fn insert(&self, text: &str) -> anyhow::Result<()> {
        self.inserted.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn submit(&self, text: &str) -> anyhow::Result<()> {
        self.submitted.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

pub(crate) struct StaticSettings(pub VoiceCommands);

impl SettingsReader for StaticSettings {
    fn voice_commands(&self) -> VoiceCommands {
        self.0.clone()
    }

    fn provider_settings(&self, _provider_id: &str) -> ProviderSettings {
        ProviderSettings::default()
    }
}

pub(crate) struct StaticKey;

#[async_trait]
impl CredentialProvider for StaticKey {
    async fn api_key(&self, _provider_id: &str) -> anyhow::Result<Option<String>> {
        Ok(Some("test-key".to_string()))
    }
}

/// Session context built from fakes, with handles to each fake.
pub(crate) struct Fakes {
    pub hooks: Arc<RecordingHooks>,
    pub audio: Arc<FakeAudio>,
    pub levels: Arc<RecordingLevels>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            hooks: Arc::new(RecordingHooks::default()),
            audio: Arc::new(FakeAudio::default()),
            levels: Arc::new(RecordingLevels::default()),
        }
    }

    pub fn context(&self) -> SessionContext {
        self.context_with_hooks(self.hooks.clone())
    }

    pub fn context_with_hooks(&self, hooks: Arc<dyn SessionHooks>) -> SessionContext {
        SessionContext {
            credentials: Arc::new(StaticKey),
            settings: Arc::new(StaticSettings(VoiceCommands::default())),
            audio: self.audio.clone(),
            hooks,
            levels: self.levels.clone(),
        }
    }
}
