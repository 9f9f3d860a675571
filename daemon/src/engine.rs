//! Engine facade: the active provider's session plus provider selection.
//!
//! Only the selected provider has a session. Switching providers swaps it
//! out while idle; toggles always reach whichever session is current.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::provider::ProviderRegistry;
use crate::session::{SessionContext, SessionOptions, TranscriptionSession};

pub struct Engine {
    registry: Arc<ProviderRegistry>,
    context: SessionContext,
    options: Mutex<SessionOptions>,
    active: RwLock<TranscriptionSession>,
    /// Serializes toggle, select, clear and shutdown so a leftover
    /// transcript is saved once.
    ops: AsyncMutex<()>,
}

impl Engine {
    /// Create an engine with a session for `provider_id`.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        context: SessionContext,
        options: SessionOptions,
        provider_id: &str,
    ) -> Result<Self, SessionError> {
        let provider = registry
            .get(provider_id)
            .ok_or_else(|| SessionError::UnknownProvider(provider_id.to_string()))?;
        let session = TranscriptionSession::new(provider, context.clone(), options.clone());
        info!(provider = provider_id, "Engine ready");

        Ok(Self {
            registry,
            context,
            options: Mutex::new(options),
            active: RwLock::new(session),
            ops: AsyncMutex::new(()),
        })
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// The current session.
    pub fn active(&self) -> TranscriptionSession {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Switch to another provider. Refused while a session is live; text
    /// left in the current session is saved first.
    pub async fn select_provider(&self, provider_id: &str) -> Result<(), SessionError> {
        let _op = self.ops.lock().await;
        let current = self.active();
        if current.provider_id() == provider_id {
            return Ok(());
        }
        if current.is_live() {
            return Err(SessionError::ProviderBusy);
        }
        let provider = self
            .registry
            .get(provider_id)
            .ok_or_else(|| SessionError::UnknownProvider(provider_id.to_string()))?;
        if !provider.metadata().available {
            return Err(SessionError::ProviderUnavailable(provider_id.to_string()));
        }

        self.flush(&current).await?;

        let options = self.options.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let session = TranscriptionSession::new(provider, self.context.clone(), options);
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = session;
        info!(from = current.provider_id(), to = provider_id, "Switched provider");
        Ok(())
    }

    /// Apply new options to the current and future sessions.
    pub fn reconfigure(&self, options: SessionOptions) {
        *self.options.lock().unwrap_or_else(PoisonError::into_inner) = options.clone();
        self.active().reconfigure(options);
    }

    /// Stop a live session, or save leftovers and start a fresh one.
    pub async fn toggle(&self, with_formatting_override: bool) -> Result<(), SessionError> {
        let op = self.ops.lock().await;
        let session = self.active();
        if session.is_live() {
            debug!("Toggle: stopping");
            session.stop_recording().await;
            return Ok(());
        }

        debug!("Toggle: starting");
        self.flush(&session).await?;
        session.clear_transcript();
        let Some(pending) = session.prepare_start(with_formatting_override) else {
            return Ok(());
        };
        // Live from here on; a toggle during the connect must be able to stop it
        drop(op);
        session.connect(pending).await
    }

    /// Save and drop the current transcript.
    pub async fn clear_transcript(&self) -> Result<(), SessionError> {
        let _op = self.ops.lock().await;
        let session = self.active();
        self.flush(&session).await?;
        session.clear_transcript();
        Ok(())
    }

    /// Stop any live session and save what it collected.
    pub async fn shutdown(&self) {
        let _op = self.ops.lock().await;
        let session = self.active();
        session.stop_recording().await;
        if let Err(e) = self.flush(&session).await {
            warn!(error = %e, "Transcript lost on shutdown");
        }
        session.clear_transcript();
    }

    async fn flush(&self, session: &TranscriptionSession) -> Result<(), SessionError> {
        let Some(unsaved) = session.unsaved() else {
            return Ok(());
        };
        if let Err(e) = self.context.hooks.save_transcript(&unsaved).await {
            let error = SessionError::Persistence(format!("{e:#}"));
            self.context.hooks.error(&error.to_string());
            return Err(error);
        }
        Ok(())
    }
}

/// Fires toggles at whichever session is active when they arrive.
#[derive(Debug, Clone)]
pub struct ToggleTrigger {
    tx: mpsc::UnboundedSender<bool>,
}

impl ToggleTrigger {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<bool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Request a toggle. Returns `false` once the listener is gone.
    pub fn fire(&self, with_formatting_override: bool) -> bool {
        self.tx.send(with_formatting_override).is_ok()
    }
}

/// Route triggers to `engine` until every [`ToggleTrigger`] is dropped.
pub fn spawn_toggle_listener(
    engine: Arc<Engine>,
    mut triggers: mpsc::UnboundedReceiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(with_formatting_override) = triggers.recv().await {
            if let Err(e) = engine.toggle(with_formatting_override).await {
                warn!(error = %e, "Toggle failed");
            }
        }
        debug!("Toggle listener stopped");
    })
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
