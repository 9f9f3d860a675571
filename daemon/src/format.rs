//! AI post-formatting of finished transcripts through an external CLI.

use anyhow::{Context, Result, bail};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::FormattingConfig;

/// Runs `command args... prompt` with the transcript on stdin and reads the
/// formatted text from stdout.
#[derive(Debug, Clone)]
pub struct Formatter {
    command: String,
    args: Vec<String>,
    prompt: String,
    timeout: Duration,
}

impl Formatter {
    pub fn new(config: &FormattingConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            prompt: config.prompt.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub async fn format(&self, transcript: &str) -> Result<String> {
        debug!(command = %self.command, "Formatting transcript");
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg(&self.prompt)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to run formatter `{}`", self.command))?;

        // Feed stdin while stdout is drained, or a chatty formatter fills its
        // output pipe and both sides block.
        let mut stdin = child.stdin.take().context("Formatter stdin unavailable")?;
        let input = transcript.to_string();
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(input.as_bytes()).await;
            drop(stdin);
            result
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| format!("Formatter timed out after {:?}", self.timeout))?
            .context("Formatter failed")?;

        // A formatter may exit without reading all of its input
        match writer.await {
            Ok(Err(e)) => debug!(error = %e, "Formatter did not read the whole transcript"),
            Err(e) => debug!(error = %e, "Formatter input task failed"),
            Ok(Ok(())) => {}
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Formatter exited with {}: {}", output.status, stderr.trim());
        }

        let formatted = String::from_utf8(output.stdout)
            .context("Formatter output is not UTF-8")?
            .trim()
            .to_string();
        if formatted.is_empty() {
            bail!("Formatter returned no text");
        }
        info!(before = transcript.len(), after = formatted.len(), "Formatted transcript");
        Ok(formatted)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn formatter(command: &str, args: &[&str], timeout_secs: u64) -> Formatter {
        Formatter::new(&FormattingConfig {
            enabled: true,
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            prompt: String::new(),
            timeout_secs,
        })
    }

    #[tokio::test]
    async fn test_formats_via_stdin_and_stdout() {
        // `sh -c script prompt` runs the script with the prompt as $0
        let upper = formatter("sh", &["-c", "tr a-z A-Z"], 5);

        let result = upper.format("hello world\n").await.unwrap();

        assert_eq!(result, "HELLO WORLD");
    }

    #[tokio::test]
    async fn test_large_transcript_streams_through() {
        let upper = formatter("sh", &["-c", "tr a-z A-Z"], 10);
        // well past a pipe buffer in both directions
        let transcript = "word ".repeat(200_000);

        let result = upper.format(&transcript).await.unwrap();

        assert_eq!(result.len(), transcript.trim().len());
        assert!(result.starts_with("WORD WORD"));
    }

    #[tokio::test]
    async fn test_prompt_is_last_argument() {
        let mut echo = formatter("sh", &["-c", "cat >/dev/null; echo \"$0\""], 5);
        echo.prompt = "Fix punctuation".to_string();

        assert_eq!(echo.format("x").await.unwrap(), "Fix punctuation");
    }

    #[tokio::test]
    async fn test_failure_status_is_error() {
        let failing = formatter("sh", &["-c", "echo nope >&2; exit 3"], 5);

        let err = failing.format("text").await.unwrap_err();

        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn test_empty_output_is_error() {
        let silent = formatter("sh", &["-c", "cat >/dev/null"], 5);

        assert!(silent.format("text").await.is_err());
    }

    #[tokio::test]
    async fn test_timeout() {
        let slow = formatter("sh", &["-c", "sleep 5"], 0);

        let err = slow.format("text").await.unwrap_err();

        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_command() {
        let missing = formatter("dictaflow-no-such-formatter", &[], 5);

        assert!(missing.format("text").await.is_err());
    }
}
