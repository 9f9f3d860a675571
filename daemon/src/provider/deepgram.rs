//! Deepgram live streaming (v1 listen).

use async_trait::async_trait;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info};

use super::ws::{self, WsProtocol};
use super::{Capabilities, Connection, Provider, ProviderMetadata, Tier, TransportEvent};
use crate::audio::TARGET_SAMPLE_RATE;
use crate::config::ProviderSettings;
use crate::credentials::{CredentialProvider, require_api_key};
use crate::error::SessionError;

pub const PROVIDER_ID: &str = "deepgram";

const STREAM_URL: &str = "wss://api.deepgram.com/v1/listen";
const DEFAULT_MODEL: &str = "nova-3";
const DEFAULT_LANGUAGE: &str = "en";

pub struct Deepgram {
    metadata: ProviderMetadata,
}

impl Default for Deepgram {
    fn default() -> Self {
        Self::new()
    }
}

impl Deepgram {
    pub fn new() -> Self {
        Self {
            metadata: ProviderMetadata {
                id: PROVIDER_ID,
                name: "Deepgram",
                tier: Tier::Standard,
                capabilities: Capabilities {
                    supports_partials: true,
                    supports_diarization: true,
                    supports_formatting: true,
                },
                available: true,
            },
        }
    }
}

fn stream_url(settings: &ProviderSettings) -> String {
    let model = settings.model.as_deref().unwrap_or(DEFAULT_MODEL);
    let language = settings.language.as_deref().unwrap_or(DEFAULT_LANGUAGE);
    format!(
        "{STREAM_URL}?model={model}&language={language}&encoding=linear16\
         &sample_rate={TARGET_SAMPLE_RATE}&channels=1&interim_results=true\
         &punctuate=true&smart_format=true"
    )
}

#[async_trait]
impl Provider for Deepgram {
    fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    async fn connect(
        &self,
        credentials: &dyn CredentialProvider,
        settings: &ProviderSettings,
    ) -> Result<Connection, SessionError> {
        let api_key = require_api_key(credentials, PROVIDER_ID).await?;

        let mut request = stream_url(settings)
            .into_client_request()
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {api_key}"))
            .map_err(|_| SessionError::Credential("API key is not a valid header value".into()))?;
        request.headers_mut().insert("Authorization", auth);

        let connection = ws::open(request, Protocol).await?;
        info!("Connected to Deepgram");
        Ok(connection)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Message {
    Results {
        channel: Channel,
        #[serde(default)]
        is_final: bool,
    },
    Error {
        #[serde(default)]
        description: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

struct Protocol;

impl WsProtocol for Protocol {
    /// Deepgram has no begin message; an open socket is a live session.
    fn on_open(&self) -> Vec<TransportEvent> {
        vec![TransportEvent::SessionBegins { id: None }]
    }

    fn parse(&self, text: &str) -> Vec<TransportEvent> {
        let message = match serde_json::from_str::<Message>(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "Ignoring unparseable Deepgram message");
                return Vec::new();
            }
        };

        match message {
            Message::Results { channel, is_final } => {
                let transcript = channel
                    .alternatives
                    .into_iter()
                    .next()
                    .map(|a| a.transcript)
                    .unwrap_or_default();
                if is_final {
                    vec![TransportEvent::Final(transcript)]
                } else if transcript.is_empty() {
                    Vec::new()
                } else {
                    vec![TransportEvent::Partial(transcript)]
                }
            }
            Message::Error { description } => vec![TransportEvent::Error(description)],
            Message::Other => Vec::new(),
        }
    }

    fn terminate_message(&self) -> Option<String> {
        Some(r#"{"type":"CloseStream"}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(transcript: &str, is_final: bool) -> String {
        format!(
            r#"{{"type":"Results","is_final":{is_final},"channel":{{"alternatives":[{{"transcript":"{transcript}","confidence":0.9}}]}}}}"#
        )
    }

    #[test]
    fn test_open_begins_session() {
        assert_eq!(Protocol.on_open(), vec![TransportEvent::SessionBegins { id: None }]);
    }

    #[test]
    fn test_results_map_to_partial_and_final() {
        assert_eq!(
            Protocol.parse(&results("hello", false)),
            vec![TransportEvent::Partial("hello".to_string())]
        );
        assert_eq!(
            Protocol.parse(&results("Hello there.", true)),
            vec![TransportEvent::Final("Hello there.".to_string())]
        );
    }

    #[test]
    fn test_empty_interim_is_skipped_but_empty_final_is_kept() {
        assert!(Protocol.parse(&results("", false)).is_empty());
        assert_eq!(
            Protocol.parse(&results("", true)),
            vec![TransportEvent::Final(String::new())]
        );
    }

    #[test]
    fn test_metadata_and_garbage_are_ignored() {
        assert!(Protocol.parse(r#"{"type":"Metadata","request_id":"x"}"#).is_empty());
        assert!(Protocol.parse("{").is_empty());
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            Protocol.parse(r#"{"type":"Error","description":"bad request"}"#),
            vec![TransportEvent::Error("bad request".to_string())]
        );
    }

    #[test]
    fn test_stream_url_uses_settings() {
        let settings = ProviderSettings {
            model: Some("nova-2".to_string()),
            language: Some("de".to_string()),
            ..Default::default()
        };

        let url = stream_url(&settings);

        assert!(url.contains("model=nova-2"));
        assert!(url.contains("language=de"));
        assert!(url.contains("interim_results=true"));
        assert!(stream_url(&ProviderSettings::default()).contains("model=nova-3"));
    }
}
