//! Keystroke injection for finished transcripts.
//!
//! Types text into the focused application, optionally restricted to an
//! application allowlist.

use crate::config::InjectionConfig;
use crate::dispatch::TextSink;
use anyhow::{Context, Result};
use enigo::{Direction, Enigo, Key, Keyboard, Settings};
use std::process::Command;
use tracing::{debug, info, warn};

/// Types text as keystrokes.
///
/// On macOS, this requires Accessibility permissions to be granted.
pub struct KeystrokeInjector {
    allowlist: Vec<String>,
}

impl KeystrokeInjector {
    pub fn new(config: &InjectionConfig) -> Self {
        Self {
            allowlist: config.allowlist.clone(),
        }
    }

    /// Whether the focused application may receive keystrokes.
    fn focused_app_allowed(&self) -> bool {
        if self.allowlist.is_empty() {
            return true;
        }

        let frontmost = get_frontmost_app().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to get frontmost app, skipping allowlist check");
            String::new()
        });
        if frontmost.is_empty() || self.is_allowed(&frontmost) {
            return true;
        }
        debug!(app = %frontmost, "Skipping injection: app not in allowlist");
        false
    }

    /// Check if an application is in the allowlist.
    fn is_allowed(&self, app_name: &str) -> bool {
        let app_lower = app_name.to_lowercase();
        self.allowlist
            .iter()
            .any(|allowed| app_lower.contains(&allowed.to_lowercase()))
    }

    fn type_text(&self, text: &str, press_enter: bool) -> Result<()> {
        if !self.focused_app_allowed() {
            return Ok(());
        }

        let mut enigo = Enigo::new(&Settings::default())
            .map_err(|e| anyhow::anyhow!("Failed to initialize enigo: {e}"))?;

        info!(chars = text.len(), press_enter, "Injecting text as keystrokes");
        enigo
            .text(text)
            .map_err(|e| anyhow::anyhow!("Failed to inject text: {e}"))?;
        if press_enter {
            enigo
                .key(Key::Return, Direction::Click)
                .map_err(|e| anyhow::anyhow!("Failed to press Enter: {e}"))?;
        }
        Ok(())
    }
}

impl TextSink for KeystrokeInjector {
    fn insert(&self, text: &str) -> Result<()> {
        self.type_text(text, false)
    }

    fn submit(&self, text: &str) -> Result<()> {
        self.type_text(text, true)
    }
}

/// Get the name of the frontmost (focused) application on macOS.
#[cfg(target_os = "macos")]
fn get_frontmost_app() -> Result<String> {
    let output = Command::new("osascript")
        .args([
            "-e",
            r#"tell application "System Events" to get name of first application process whose frontmost is true"#,
        ])
        .output()
        .context("Failed to execute osascript")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("osascript failed: {}", stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Name of the focused X11 window's class, when `xdotool` is installed.
#[cfg(not(target_os = "macos"))]
fn get_frontmost_app() -> Result<String> {
    let output = match Command::new("xdotool")
        .args(["getactivewindow", "getwindowclassname"])
        .output()
    {
        Ok(output) => output,
        // no xdotool: treat as unknown so the allowlist is skipped
        Err(_) => return Ok(String::new()),
    };
    if !output.status.success() {
        return Ok(String::new());
    }
    let name = String::from_utf8(output.stdout).context("Window class is not UTF-8")?;
    Ok(name.trim().to_string())
}

#[cfg(test)]
#[path = "inject_test.rs"]
mod tests;
