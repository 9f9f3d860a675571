//! Configuration management for the dictaflow daemon.
//!
//! Handles loading, saving, and providing defaults for the daemon configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::commands::VoiceCommands;
use crate::session::{SessionOptions, SessionTiming, SettingsReader};

/// Main configuration struct for the daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderSelection,
    /// Per-provider settings keyed by provider id (e.g. `[providers.deepgram]`).
    pub providers: BTreeMap<String, ProviderSettings>,
    pub audio: AudioConfig,
    pub voice_commands: VoiceCommandConfig,
    pub session: SessionConfig,
    pub formatting: FormattingConfig,
    pub injection: InjectionConfig,
    pub logging: LoggingConfig,
}

/// Which registered provider drives new sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSelection {
    pub active: String,
}

impl Default for ProviderSelection {
    fn default() -> Self {
        Self {
            active: crate::provider::assemblyai::PROVIDER_ID.to_string(),
        }
    }
}

/// Backend-specific connection options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// API key. Prefer `api_key_env` to keep secrets out of the file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the API key. Defaults to `<ID>_API_KEY`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Backend model name; the provider's default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Language code; the provider's default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Microphone selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name. The system default device when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

/// Spoken command configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceCommandConfig {
    pub enabled: bool,
    #[serde(flatten)]
    pub phrases: VoiceCommands,
}

impl Default for VoiceCommandConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            phrases: VoiceCommands::default(),
        }
    }
}

/// Session timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay before auto-stop after a command found in a committed fragment.
    pub final_command_delay_ms: u64,
    /// Delay before auto-stop after a command found in a provisional fragment.
    pub partial_command_delay_ms: u64,
    /// Upper bound for credential fetch plus transport open. 0 disables it.
    pub connect_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            final_command_delay_ms: 100,
            partial_command_delay_ms: 200,
            connect_timeout_secs: 15,
        }
    }
}

impl SessionConfig {
    pub fn timing(&self) -> SessionTiming {
        SessionTiming {
            final_command_delay: Duration::from_millis(self.final_command_delay_ms),
            partial_command_delay: Duration::from_millis(self.partial_command_delay_ms),
            connect_timeout: (self.connect_timeout_secs > 0)
                .then(|| Duration::from_secs(self.connect_timeout_secs)),
        }
    }
}

/// AI reformatting of finished transcripts through an external CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormattingConfig {
    /// Format every session. A toggle can still request formatting per session.
    pub enabled: bool,
    /// Executable to run.
    pub command: String,
    /// Arguments placed before the prompt.
    pub args: Vec<String>,
    /// Instruction passed as the last argument; the transcript goes to stdin.
    pub prompt: String,
    pub timeout_secs: u64,
}

impl Default for FormattingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "claude".to_string(),
            args: vec!["-p".to_string()],
            prompt: "Clean up this dictated text: fix punctuation, capitalization and obvious \
                     transcription errors. Reply with the corrected text only."
                .to_string(),
            timeout_secs: 30,
        }
    }
}

/// Configuration for keystroke injection behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    /// Type the transcript into the focused application when a session stops.
    pub auto_insert: bool,
    /// List of application names to inject into. Empty means inject into all apps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowlist: Vec<String>,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            auto_insert: true,
            allowlist: Vec::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub level: LogLevel,
}

/// Log verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to a tracing filter directive string for the daemon crate.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "dictaflow_daemon=error",
            LogLevel::Warn => "dictaflow_daemon=warn",
            LogLevel::Info => "dictaflow_daemon=info",
            LogLevel::Debug => "dictaflow_daemon=debug",
            LogLevel::Trace => "dictaflow_daemon=trace",
        }
    }
}

impl Config {
    /// Returns the default config file path.
    /// `~/.config/dictaflow/config.toml`
    pub fn config_path() -> Result<PathBuf> {
        dictaflow_common::dirs::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load configuration from the default path.
    /// Returns defaults if the file doesn't exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file as TOML")
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Settings for a provider, falling back to defaults when not configured.
    pub fn provider_settings(&self, provider_id: &str) -> ProviderSettings {
        self.providers.get(provider_id).cloned().unwrap_or_default()
    }

    /// Session options derived from the audio, command and timing sections.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            device_id: self.audio.device.clone(),
            commands_enabled: self.voice_commands.enabled,
            timing: self.session.timing(),
        }
    }
}

/// Configuration shared between the controller and running sessions.
///
/// Sessions read voice commands and provider settings at start, so edits
/// take effect on the next session.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Clone of the current configuration.
    pub fn get(&self) -> Config {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `f` to the configuration in place.
    pub fn update(&self, f: impl FnOnce(&mut Config)) {
        let mut config = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut config);
    }
}

impl SettingsReader for SharedConfig {
    fn voice_commands(&self) -> VoiceCommands {
        self.get().voice_commands.phrases
    }

    fn provider_settings(&self, provider_id: &str) -> ProviderSettings {
        self.get().provider_settings(provider_id)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
