//! Bridge from spoken commands to their effects.

use anyhow::Result;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::commands::VoiceCommand;
use crate::session::TranscriptionSession;

/// Destination for finished text, usually the focused application.
pub trait TextSink: Send + Sync {
    /// Type `text` without submitting it.
    fn insert(&self, text: &str) -> Result<()>;

    /// Type `text` and press Enter.
    fn submit(&self, text: &str) -> Result<()>;
}

/// What a command did to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Text was submitted downstream.
    Submitted,
    /// The transcript was discarded.
    Cleared,
    /// Recording was cancelled; the text is dropped and nothing is submitted.
    Abandoned,
}

pub struct CommandDispatcher {
    sink: Arc<dyn TextSink>,
    last: Mutex<Option<(String, DispatchOutcome)>>,
}

impl CommandDispatcher {
    pub fn new(sink: Arc<dyn TextSink>) -> Self {
        Self {
            sink,
            last: Mutex::new(None),
        }
    }

    /// Carry out `command` for `session`. `text` is the transcript with the
    /// spoken trigger removed.
    pub fn dispatch(&self, session: &TranscriptionSession, command: VoiceCommand, text: &str) {
        let session_id = session.snapshot().session_id.unwrap_or_default();
        let outcome = match command {
            VoiceCommand::Send => {
                if text.trim().is_empty() {
                    info!("Send command with nothing to send");
                } else {
                    let sink = self.sink.clone();
                    let text = text.to_string();
                    // keystrokes block, keep them off the event pump
                    tokio::task::spawn_blocking(move || {
                        if let Err(e) = sink.submit(&text) {
                            warn!(error = %e, "Failed to submit text");
                        }
                    });
                }
                DispatchOutcome::Submitted
            }
            VoiceCommand::Clear => {
                session.clear_transcript();
                DispatchOutcome::Cleared
            }
            VoiceCommand::Cancel => {
                // dropped, so the next flush does not save it to history
                session.clear_transcript();
                DispatchOutcome::Abandoned
            }
        };

        info!(%command, ?outcome, session = %session_id, "Dispatched voice command");
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some((session_id, outcome));
    }

    /// Outcome of the command dispatched for `session_id`, if any. Consumes it.
    pub fn take_outcome(&self, session_id: &str) -> Option<DispatchOutcome> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match last.as_ref() {
            Some((id, _)) if id == session_id => last.take().map(|(_, outcome)| outcome),
            _ => None,
        }
    }
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod tests;
