//! XDG directory utilities for dictaflow.

use std::path::PathBuf;

use anyhow::{Context, Result};
use xdg::BaseDirectories;

const APP_NAME: &str = "dictaflow";

fn base_dirs() -> BaseDirectories {
    BaseDirectories::with_prefix(APP_NAME)
}

/// Return the XDG state directory, creating it if needed.
/// `~/.local/state/dictaflow/`
pub fn state_dir() -> Result<PathBuf> {
    let dir = base_dirs()
        .get_state_home()
        .context("Failed to get XDG state directory (HOME not set?)")?;
    std::fs::create_dir_all(&dir).context("Failed to create state directory")?;
    Ok(dir)
}

/// Return the XDG config directory (no creation - config may not exist yet).
/// `~/.config/dictaflow/`
pub fn config_dir() -> Result<PathBuf> {
    base_dirs()
        .get_config_home()
        .context("Could not determine config directory (HOME not set?)")
}

/// Return the XDG data directory, creating it if needed.
/// `~/.local/share/dictaflow/`
pub fn data_dir() -> Result<PathBuf> {
    let dir = base_dirs()
        .get_data_home()
        .context("Could not determine data directory (HOME not set?)")?;
    std::fs::create_dir_all(&dir).context("Failed to create data directory")?;
    Ok(dir)
}

/// Daemon Unix socket path.
/// `~/.local/state/dictaflow/daemon.sock`
pub fn socket_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("daemon.sock"))
}

/// Daemon PID file path.
/// `~/.local/state/dictaflow/daemon.pid`
pub fn pid_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("daemon.pid"))
}

/// Daemon log file path.
/// `~/.local/state/dictaflow/daemon.log`
pub fn log_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("daemon.log"))
}

/// Transcript history file.
/// `~/.local/share/dictaflow/history.jsonl`
pub fn history_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("history.jsonl"))
}
