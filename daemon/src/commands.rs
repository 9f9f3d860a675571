//! Spoken voice-command detection.
//!
//! A voice command is a trigger phrase at the end of a transcript fragment.
//! Detection is a pure function over the fragment and the configured phrases;
//! the session decides what to do with the result.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The three command categories a trigger phrase can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceCommand {
    /// Submit the transcript downstream.
    Send,
    /// Discard the transcript buffer.
    Clear,
    /// Abandon the session without submitting anything.
    Cancel,
}

impl VoiceCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceCommand::Send => "send",
            VoiceCommand::Clear => "clear",
            VoiceCommand::Cancel => "cancel",
        }
    }
}

impl fmt::Display for VoiceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger phrases per command category.
///
/// Phrases are checked in list order, so longer phrases that share a suffix
/// with a shorter one must come first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceCommands {
    pub send: Vec<String>,
    pub clear: Vec<String>,
    pub cancel: Vec<String>,
}

impl Default for VoiceCommands {
    fn default() -> Self {
        Self {
            send: vec!["send it".to_string(), "send message".to_string()],
            clear: vec!["clear transcript".to_string(), "clear".to_string()],
            cancel: vec!["cancel recording".to_string(), "cancel".to_string()],
        }
    }
}

/// Result of running the matcher over one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub command: Option<VoiceCommand>,
    /// Fragment text with the trigger removed, or the original text when
    /// nothing matched.
    pub cleaned_text: String,
}

impl Detection {
    fn none(text: &str) -> Self {
        Self {
            command: None,
            cleaned_text: text.to_string(),
        }
    }
}

/// Check whether `text` ends with one of the configured trigger phrases.
///
/// `send` phrases win over `clear` and `cancel`. For `send`, the text before
/// the phrase is kept (original casing); the other two discard everything.
pub fn detect(text: &str, commands: &VoiceCommands) -> Detection {
    let base = strip_trailing_punctuation(text.trim());
    let normalized = base.to_lowercase();

    for phrase in normalized_phrases(&commands.send) {
        if normalized.ends_with(&phrase) {
            let prefix = original_prefix(base, &normalized, &phrase);
            return Detection {
                command: Some(VoiceCommand::Send),
                cleaned_text: strip_trailing_punctuation(prefix.trim()).to_string(),
            };
        }
    }

    for (command, phrases) in [
        (VoiceCommand::Clear, &commands.clear),
        (VoiceCommand::Cancel, &commands.cancel),
    ] {
        if normalized_phrases(phrases).any(|phrase| normalized.ends_with(&phrase)) {
            return Detection {
                command: Some(command),
                cleaned_text: String::new(),
            };
        }
    }

    Detection::none(text)
}

fn normalized_phrases(phrases: &[String]) -> impl Iterator<Item = String> + '_ {
    phrases
        .iter()
        .map(|p| strip_trailing_punctuation(p.trim()).to_lowercase())
        .filter(|p| !p.is_empty())
}

/// Strip trailing runs of `. , ! ?` (and whitespace between them).
fn strip_trailing_punctuation(text: &str) -> &str {
    text.trim_end_matches(|c: char| matches!(c, '.' | ',' | '!' | '?') || c.is_whitespace())
}

/// Slice `base` up to where `phrase` starts in its lowercased form.
///
/// Lowercasing can change byte lengths outside ASCII, so the offset is mapped
/// back by lowercasing `base` one character at a time.
fn original_prefix<'a>(base: &'a str, normalized: &str, phrase: &str) -> &'a str {
    let offset = normalized.len() - phrase.len();
    let mut lowered = 0;
    for (idx, ch) in base.char_indices() {
        if lowered >= offset {
            return &base[..idx];
        }
        lowered += ch.to_lowercase().map(char::len_utf8).sum::<usize>();
    }
    base
}

#[cfg(test)]
#[path = "commands_test.rs"]
mod tests;
