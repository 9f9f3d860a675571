//! Ordered transcript segments for one session.

use std::time::{SystemTime, UNIX_EPOCH};

/// One utterance fragment received from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptSegment {
    pub text: String,
    /// `false` while the backend may still revise the text.
    pub is_final: bool,
    /// Receipt time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl TranscriptSegment {
    pub fn new(text: impl Into<String>, is_final: bool) -> Self {
        Self {
            text: text.into(),
            is_final,
            timestamp: now_millis(),
        }
    }
}

/// Segment sequence where only the last element may be provisional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    segments: Vec<TranscriptSegment>,
}

impl Transcript {
    /// Replace the trailing provisional segment, or append after a committed one.
    ///
    /// An empty committed segment only retires a provisional one; it is not
    /// stored on its own.
    pub fn ingest(&mut self, segment: TranscriptSegment) {
        match self.segments.last_mut() {
            Some(last) if !last.is_final => *last = segment,
            _ if segment.is_final && segment.text.trim().is_empty() => {}
            _ => self.segments.push(segment),
        }
    }

    /// Non-empty segment texts joined with single spaces.
    pub fn full_text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn segments(&self) -> &[TranscriptSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.full_text().is_empty()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
