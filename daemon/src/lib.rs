pub mod audio;
pub mod commands;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod daemon;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod format;
pub mod history;
pub mod inject;
pub mod level;
pub mod provider;
pub mod server;
pub mod session;
pub mod socket;

#[cfg(test)]
mod test_support;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Application-specific environment variable for log filtering (overrides config).
const LOG_ENV_VAR: &str = "DICTAFLOW_LOG";

/// Entry point for the daemon process: configures logging and launches the daemon.
pub async fn run() -> anyhow::Result<()> {
    let loaded = config::Config::load();
    let config = loaded.as_ref().cloned().unwrap_or_default();

    let log_path = dictaflow_common::dirs::log_path().context("Failed to determine log path")?;
    let log_dir = log_path.parent().context("Log path has no parent")?;
    let log_filename = log_path.file_name().context("Log path has no file name")?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_filename);
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // DICTAFLOW_LOG env var overrides config file level
    let filter = EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .with_default_directive(config.logging.level.as_directive().parse()?)
        .from_env()?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(filter)
        .init();

    if let Err(e) = &loaded {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
    }

    daemon::run(config).await
}
