//! Speech-recognition backends.
//!
//! A provider turns credentials and settings into a live [`Connection`]: an
//! audio sink plus an ordered stream of [`TransportEvent`]s. Everything the
//! session does with those events is backend-agnostic.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderSettings;
use crate::credentials::CredentialProvider;
use crate::error::SessionError;

pub mod assemblyai;
pub mod deepgram;
mod registry;
mod ws;

pub use registry::ProviderRegistry;

/// Pricing/quality tier advertised for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Standard,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Standard => "standard",
            Tier::Premium => "premium",
        }
    }
}

/// Static feature flags of a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Emits provisional transcripts before committing them.
    pub supports_partials: bool,
    pub supports_diarization: bool,
    /// Returns punctuated, cased text without a post-processing step.
    pub supports_formatting: bool,
}

/// Static description of a provider, fixed at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMetadata {
    pub id: &'static str,
    pub name: &'static str,
    pub tier: Tier,
    pub capabilities: Capabilities,
    /// Declared usability. Not a health check.
    pub available: bool,
}

/// Events every transport reports, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The backend accepted the session and is ready for audio.
    SessionBegins { id: Option<String> },
    /// Provisional text for the utterance in progress.
    Partial(String),
    /// Committed text that will not change.
    Final(String),
    /// The connection is gone.
    Closed { code: Option<u16>, reason: String },
    /// Credentials were rejected mid-session. Fatal.
    AuthError(String),
    /// Recoverable problem reported by the backend.
    Error(String),
}

/// Mono 16kHz PCM16 audio block.
pub type AudioChunk = Vec<i16>;

/// Owning handle to an open connection.
///
/// Closing (or dropping) the handle asks the transport to finish the stream
/// and disconnect; the final `Closed` event still arrives on the event stream.
#[derive(Debug)]
pub struct ConnectionHandle {
    audio: mpsc::Sender<AudioChunk>,
    close: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(audio: mpsc::Sender<AudioChunk>, close: CancellationToken) -> Self {
        Self { audio, close }
    }

    /// Sender for audio blocks bound for the backend.
    pub fn audio_sender(&self) -> mpsc::Sender<AudioChunk> {
        self.audio.clone()
    }

    pub fn close(self) {
        self.close.cancel();
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close.cancel();
    }
}

/// A freshly opened connection.
#[derive(Debug)]
pub struct Connection {
    pub handle: ConnectionHandle,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// A speech-recognition backend integration.
#[async_trait]
pub trait Provider: Send + Sync {
    fn metadata(&self) -> &ProviderMetadata;

    /// Obtain credentials and open a streaming connection.
    async fn connect(
        &self,
        credentials: &dyn CredentialProvider,
        settings: &ProviderSettings,
    ) -> Result<Connection, SessionError>;
}
