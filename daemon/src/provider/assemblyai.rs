//! AssemblyAI universal streaming (v3).
//!
//! The API key is exchanged for a short-lived token over HTTPS; the token is
//! then passed on the websocket URL.

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, info};

use super::ws::{self, WsProtocol};
use super::{Capabilities, Connection, Provider, ProviderMetadata, Tier, TransportEvent};
use crate::audio::TARGET_SAMPLE_RATE;
use crate::config::ProviderSettings;
use crate::credentials::{CredentialProvider, require_api_key};
use crate::error::SessionError;

pub const PROVIDER_ID: &str = "assemblyai";

const TOKEN_URL: &str = "https://streaming.assemblyai.com/v3/token";
const STREAM_URL: &str = "wss://streaming.assemblyai.com/v3/ws";
const TOKEN_TTL_SECS: u32 = 60;

/// Close codes AssemblyAI uses for rejected or expired credentials.
const AUTH_CLOSE_CODES: [u16; 4] = [1008, 4001, 4002, 4003];

pub struct AssemblyAi {
    metadata: ProviderMetadata,
    http: reqwest::Client,
}

impl Default for AssemblyAi {
    fn default() -> Self {
        Self::new()
    }
}

impl AssemblyAi {
    pub fn new() -> Self {
        Self {
            metadata: ProviderMetadata {
                id: PROVIDER_ID,
                name: "AssemblyAI",
                tier: Tier::Premium,
                capabilities: Capabilities {
                    supports_partials: true,
                    supports_diarization: false,
                    supports_formatting: true,
                },
                available: true,
            },
            http: reqwest::Client::new(),
        }
    }

    async fn fetch_token(&self, api_key: &str) -> Result<String, SessionError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }

        let url = format!("{TOKEN_URL}?expires_in_seconds={TOKEN_TTL_SECS}");
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, api_key)
            .send()
            .await
            .map_err(|e| SessionError::Transport(format!("token request failed: {e}")))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(SessionError::Auth(format!(
                    "AssemblyAI rejected the API key ({})",
                    response.status()
                )));
            }
            status if !status.is_success() => {
                return Err(SessionError::Transport(format!(
                    "token request returned {status}"
                )));
            }
            _ => {}
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Transport(format!("invalid token response: {e}")))?;
        Ok(body.token)
    }
}

/// Websocket URL for a session authorized by `token`.
fn stream_url(token: &str, settings: &ProviderSettings) -> String {
    let mut url = format!(
        "{STREAM_URL}?sample_rate={TARGET_SAMPLE_RATE}&encoding=pcm_s16le&format_turns=true&token={token}"
    );
    if let Some(model) = settings.model.as_deref().filter(|m| !m.is_empty()) {
        url.push_str("&speech_model=");
        url.push_str(model);
    }
    url
}

#[async_trait]
impl Provider for AssemblyAi {
    fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    async fn connect(
        &self,
        credentials: &dyn CredentialProvider,
        settings: &ProviderSettings,
    ) -> Result<Connection, SessionError> {
        let api_key = require_api_key(credentials, PROVIDER_ID).await?;
        let token = self.fetch_token(&api_key).await?;
        debug!("Obtained AssemblyAI streaming token");

        let request = stream_url(&token, settings)
            .into_client_request()
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let connection = ws::open(request, Protocol { formatted_turns: true }).await?;
        info!("Connected to AssemblyAI");
        Ok(connection)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Message {
    Begin {
        id: Option<String>,
    },
    Turn {
        #[serde(default)]
        transcript: String,
        #[serde(default)]
        end_of_turn: bool,
        #[serde(default)]
        turn_is_formatted: bool,
    },
    Termination {},
}

#[derive(Debug, Deserialize)]
struct ErrorMessage {
    error: String,
}

struct Protocol {
    /// Whether `format_turns` was requested; committed turns then arrive twice.
    formatted_turns: bool,
}

impl WsProtocol for Protocol {
    fn parse(&self, text: &str) -> Vec<TransportEvent> {
        if let Ok(message) = serde_json::from_str::<Message>(text) {
            return match message {
                Message::Begin { id } => vec![TransportEvent::SessionBegins { id }],
                Message::Turn {
                    transcript,
                    end_of_turn,
                    turn_is_formatted,
                } => {
                    if end_of_turn && (turn_is_formatted || !self.formatted_turns) {
                        vec![TransportEvent::Final(transcript)]
                    } else if end_of_turn || transcript.is_empty() {
                        // unformatted copy of a turn that will be resent formatted
                        Vec::new()
                    } else {
                        vec![TransportEvent::Partial(transcript)]
                    }
                }
                Message::Termination {} => Vec::new(),
            };
        }

        match serde_json::from_str::<ErrorMessage>(text) {
            Ok(e) => vec![TransportEvent::Error(e.error)],
            Err(_) => {
                debug!(message = text, "Ignoring unrecognized AssemblyAI message");
                Vec::new()
            }
        }
    }

    fn terminate_message(&self) -> Option<String> {
        Some(r#"{"type":"Terminate"}"#.to_string())
    }

    fn on_close(&self, code: u16, reason: &str) -> Vec<TransportEvent> {
        let closed = TransportEvent::Closed {
            code: Some(code),
            reason: reason.to_string(),
        };
        if AUTH_CLOSE_CODES.contains(&code) {
            let message = if reason.is_empty() {
                format!("AssemblyAI closed the session ({code})")
            } else {
                reason.to_string()
            };
            vec![TransportEvent::AuthError(message), closed]
        } else {
            vec![closed]
        }
    }
}
