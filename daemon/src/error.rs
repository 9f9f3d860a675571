//! Errors surfaced by transcription sessions.

use thiserror::Error;

/// Why a session could not start or had to stop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("No API key configured for {provider} (set {env_var} or providers.{provider}.api_key)")]
    MissingCredential { provider: String, env_var: String },

    #[error("Failed to obtain credentials: {0}")]
    Credential(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out connecting to {provider} after {secs}s")]
    Timeout { provider: String, secs: u64 },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider is not available: {0}")]
    ProviderUnavailable(String),

    #[error("Cannot switch providers while a session is live")]
    ProviderBusy,

    #[error("Failed to save previous transcript: {0}")]
    Persistence(String),
}
