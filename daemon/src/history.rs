//! Append-only transcript history, one JSON object per line.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::session::now_millis;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp_ms: u64,
    pub session_id: String,
    pub provider: String,
    pub text: String,
}

impl HistoryEntry {
    pub fn new(session_id: &str, provider: &str, text: &str) -> Self {
        Self {
            timestamp_ms: now_millis(),
            session_id: session_id.to_string(),
            provider: provider.to_string(),
            text: text.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptHistory {
    path: PathBuf,
}

impl TranscriptHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &HistoryEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create history directory")?;
        }

        let mut line = serde_json::to_string(entry).context("Failed to serialize entry")?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open history file: {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to write history entry")?;
        file.flush().await.context("Failed to flush history file")?;
        Ok(())
    }

    /// All entries, oldest first. A missing file is an empty history.
    pub async fn entries(&self) -> Result<Vec<HistoryEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read history file"),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("Corrupt history entry"))
            .collect()
    }
}
