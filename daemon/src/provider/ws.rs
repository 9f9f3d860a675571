//! Shared websocket transport.
//!
//! Backends differ only in their message schema, so the socket loop lives
//! here and each provider supplies a [`WsProtocol`].

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{AudioChunk, Connection, ConnectionHandle, TransportEvent};
use crate::error::SessionError;

/// Audio blocks buffered toward the socket before new ones are dropped.
const AUDIO_QUEUE: usize = 64;

/// How long to wait for the backend to flush and close after terminating.
const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// Backend-specific half of a websocket transport.
pub(crate) trait WsProtocol: Send + Sync + 'static {
    /// Events to report as soon as the socket is open.
    fn on_open(&self) -> Vec<TransportEvent> {
        Vec::new()
    }

    /// Translate one text frame into zero or more events.
    fn parse(&self, text: &str) -> Vec<TransportEvent>;

    /// Text frame asking the backend to flush and end the session.
    fn terminate_message(&self) -> Option<String>;

    /// Events for a close frame from the backend.
    fn on_close(&self, code: u16, reason: &str) -> Vec<TransportEvent> {
        vec![TransportEvent::Closed {
            code: Some(code),
            reason: reason.to_string(),
        }]
    }
}

/// Little-endian PCM16 bytes, the wire format both backends accept.
pub(crate) fn encode_pcm16(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Open a websocket and start pumping audio out and events in.
pub(crate) async fn open<P: WsProtocol>(
    request: Request,
    protocol: P,
) -> Result<Connection, SessionError> {
    let (stream, response) = connect_async(request).await.map_err(handshake_error)?;
    debug!(status = %response.status(), "WebSocket connected");

    let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let close = CancellationToken::new();

    for event in protocol.on_open() {
        let _ = event_tx.send(event);
    }

    tokio::spawn(run_socket(stream, protocol, audio_rx, event_tx, close.clone()));

    Ok(Connection {
        handle: ConnectionHandle::new(audio_tx, close),
        events: event_rx,
    })
}

fn handshake_error(err: tungstenite::Error) -> SessionError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            SessionError::Auth(format!("backend rejected credentials ({})", response.status()))
        }
        other => SessionError::Transport(other.to_string()),
    }
}

async fn run_socket<P: WsProtocol>(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    protocol: P,
    mut audio_rx: mpsc::Receiver<AudioChunk>,
    events: mpsc::UnboundedSender<TransportEvent>,
    close: CancellationToken,
) {
    let (mut writer, mut reader) = stream.split();
    let mut closing = false;
    let mut audio_open = true;
    let linger = tokio::time::sleep(CLOSE_LINGER);
    tokio::pin!(linger);

    let emit = |batch: Vec<TransportEvent>| {
        for event in batch {
            let _ = events.send(event);
        }
    };

    loop {
        tokio::select! {
            _ = close.cancelled(), if !closing => {
                closing = true;
                if let Some(message) = protocol.terminate_message() {
                    if let Err(e) = writer.send(Message::text(message)).await {
                        debug!(error = %e, "Failed to send terminate message");
                    }
                }
                linger.as_mut().reset(Instant::now() + CLOSE_LINGER);
            }
            _ = &mut linger, if closing => {
                debug!("Backend did not close in time; closing socket");
                let _ = writer.close().await;
                emit(vec![TransportEvent::Closed {
                    code: None,
                    reason: "closed by client".to_string(),
                }]);
                return;
            }
            chunk = audio_rx.recv(), if audio_open && !closing => match chunk {
                Some(pcm) => {
                    if let Err(e) = writer.send(Message::binary(encode_pcm16(&pcm))).await {
                        trace!(error = %e, "Dropping audio block");
                    }
                }
                None => audio_open = false,
            },
            message = reader.next() => match message {
                Some(Ok(Message::Text(text))) => emit(protocol.parse(text.as_str())),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                        .unwrap_or((1005, String::new()));
                    debug!(code, reason = %reason, "Backend closed connection");
                    emit(protocol.on_close(code, &reason));
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket read failed");
                    emit(vec![
                        TransportEvent::Error(e.to_string()),
                        TransportEvent::Closed { code: None, reason: e.to_string() },
                    ]);
                    return;
                }
                None => {
                    emit(vec![TransportEvent::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    }]);
                    return;
                }
            },
        }
    }
}
