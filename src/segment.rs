use serde::{Deserialize, Serialize};

/// A single word-level timestamp within a segment.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WordSpan {
    /// Start time in seconds.
    pub start_seconds: f64,
    /// End time in seconds.
    pub end_seconds: f64,
    /// Word text, trimmed.
    pub text: String,
}

/// A backend-produced span of recognized speech, pre-normalization.
///
/// Segments are immutable once emitted: backends create them, the cue builder
/// consumes them exactly once. `words` is empty when the backend provides no
/// word-level timing; when present, the spans are ordered and fall within
/// `[start_seconds, end_seconds]`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TranscriptionSegment {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub text: String,
    pub words: Vec<WordSpan>,
}

impl TranscriptionSegment {
    pub fn new(
        start_seconds: f64,
        end_seconds: f64,
        text: impl Into<String>,
    ) -> Self {
        Self {
            start_seconds,
            end_seconds,
            text: text.into(),
            words: Vec::new(),
        }
    }

    pub fn with_words(mut self, words: Vec<WordSpan>) -> Self {
        self.words = words;
        self
    }

    pub fn duration_seconds(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }

    /// Whether this segment carries any speech worth keeping.
    pub fn is_speech(&self) -> bool {
        self.duration_seconds() > 0.0 && !self.text.trim().is_empty()
    }

    /// Whether the word spans account for every word in `text`.
    ///
    /// The cue builder only trusts word timing for splitting when the counts
    /// line up; a partial word list degrades to text-proportional timing.
    pub fn words_cover_text(&self) -> bool {
        !self.words.is_empty() && self.words.len() == self.text.split_whitespace().count()
    }
}
