//! Unix socket setup for daemon communication.

use anyhow::{Context, Result, bail};
use std::os::unix::net::UnixStream;
use std::path::Path;
use tokio::net::UnixListener;
use tracing::info;

/// Bind the daemon socket, replacing a stale one left by a crashed daemon.
///
/// Fails if another daemon still accepts connections on `path`.
pub fn create_listener(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        if UnixStream::connect(path).is_ok() {
            bail!("Another daemon is already listening on {}", path.display());
        }
        info!(path = %path.display(), "Removing stale socket");
        std::fs::remove_file(path).context("Failed to remove existing socket")?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    UnixListener::bind(path).context("Failed to bind Unix socket")
}

/// Remove the socket file.
pub fn cleanup_socket(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
#[path = "socket_test.rs"]
mod tests;
