//! The editable in-memory subtitle document.
//!
//! A document is an ordered cue sequence owned by the editing session.
//! Structural operations (insert, delete, merge, split) renumber indices to
//! 1..=N before returning; text edits leave numbering alone. Serialization
//! renders the current state verbatim — only timecode formatting is applied,
//! overlap introduced by edits is deliberately left for the user to resolve.

use std::ops::RangeInclusive;

use tracing::warn;

use crate::cue::Cue;
use crate::error::{Error, Result};
use crate::timecode::{format_timecode, parse_timecode};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubtitleDocument {
    cues: Vec<Cue>,
}

impl SubtitleDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt already-built cues, normalizing their indices.
    pub fn from_cues(cues: Vec<Cue>) -> Self {
        let mut doc = Self { cues };
        doc.reindex();
        doc
    }

    pub fn cues(&self) -> &[Cue] {
        &self.cues
    }

    pub fn len(&self) -> usize {
        self.cues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    /// Insert `cue` after the cue at `after_index`; `0` prepends.
    pub fn insert_cue(&mut self, after_index: usize, cue: Cue) -> Result<()> {
        if after_index > self.cues.len() {
            return Err(Error::CueOutOfRange {
                index: after_index,
                len: self.cues.len(),
            });
        }
        self.cues.insert(after_index, cue);
        self.reindex();
        Ok(())
    }

    /// Remove and return the cue at the 1-based `index`.
    pub fn delete_cue(&mut self, index: usize) -> Result<Cue> {
        let position = self.position_of(index)?;
        let removed = self.cues.remove(position);
        self.reindex();
        Ok(removed)
    }

    /// Merge two adjacent cues into one spanning both, text joined on a new line.
    pub fn merge_cues(&mut self, first: usize, second: usize) -> Result<()> {
        if second != first + 1 {
            return Err(Error::TimingConflict(format!(
                "cues {first} and {second} are not adjacent"
            )));
        }
        let first_pos = self.position_of(first)?;
        let second_pos = self.position_of(second)?;

        let absorbed = self.cues.remove(second_pos);
        let target = &mut self.cues[first_pos];
        target.end_seconds = absorbed.end_seconds;
        target.text = format!("{}\n{}", target.text, absorbed.text);
        self.reindex();
        Ok(())
    }

    /// Split the cue at `index` at an absolute time strictly inside it.
    ///
    /// Text divides at the word boundary nearest the split point's share of
    /// the cue's duration.
    pub fn split_cue(&mut self, index: usize, split_seconds: f64) -> Result<()> {
        let position = self.position_of(index)?;
        let cue = &self.cues[position];

        if split_seconds <= cue.start_seconds || split_seconds >= cue.end_seconds {
            return Err(Error::TimingConflict(format!(
                "split point {split_seconds} is outside cue {index}"
            )));
        }

        let fraction = (split_seconds - cue.start_seconds) / cue.duration_seconds();
        let (head_text, tail_text) = divide_text(&cue.text, fraction);

        let tail = Cue {
            index: 0,
            start_seconds: split_seconds,
            end_seconds: cue.end_seconds,
            text: tail_text,
        };
        let head = &mut self.cues[position];
        head.end_seconds = split_seconds;
        head.text = head_text;

        self.cues.insert(position + 1, tail);
        self.reindex();
        Ok(())
    }

    /// Shift every cue in the 1-based inclusive `range` by `delta` seconds.
    ///
    /// All-or-nothing: if any shifted cue would start before zero the document
    /// is left untouched and [`Error::TimingConflict`] is returned.
    pub fn shift_timing(&mut self, range: RangeInclusive<usize>, delta: f64) -> Result<()> {
        let first = self.position_of(*range.start())?;
        let last = self.position_of(*range.end())?;
        if first > last {
            return Err(Error::TimingConflict(format!(
                "empty shift range {}..={}",
                range.start(),
                range.end()
            )));
        }

        for cue in &self.cues[first..=last] {
            let new_start = cue.start_seconds + delta;
            let new_end = cue.end_seconds + delta;
            if new_start < 0.0 || new_end <= new_start {
                return Err(Error::TimingConflict(format!(
                    "shifting cue {} by {delta}s would move it before zero",
                    cue.index
                )));
            }
        }

        for cue in &mut self.cues[first..=last] {
            cue.start_seconds += delta;
            cue.end_seconds += delta;
        }
        Ok(())
    }

    /// Replace the text of one cue. Does not renumber.
    pub fn set_text(&mut self, index: usize, text: impl Into<String>) -> Result<()> {
        let position = self.position_of(index)?;
        self.cues[position].text = text.into();
        Ok(())
    }

    /// Serialize to SRT.
    ///
    /// The cue order and numbering are rendered as-is; only timecodes are
    /// formatted. An editing session that produced overlap gets it back
    /// faithfully rather than silently corrected.
    pub fn to_srt(&self) -> Result<String> {
        let mut out = String::new();
        for cue in &self.cues {
            out.push_str(&format!(
                "{}\n{} --> {}\n{}\n\n",
                cue.index,
                format_timecode(cue.start_seconds)?,
                format_timecode(cue.end_seconds)?,
                cue.text
            ));
        }
        Ok(out)
    }

    /// Parse SRT text into a document, for re-editing previously generated
    /// subtitles.
    ///
    /// Parsing is lenient: malformed blocks are skipped with a warning so one
    /// bad hand-edit does not make a whole file unloadable. Indices are
    /// renumbered after load.
    pub fn parse_srt(input: &str) -> Result<Self> {
        let normalized = input.replace("\r\n", "\n");
        let mut cues = Vec::new();

        for (block_number, block) in normalized.split("\n\n").enumerate() {
            let block = block.trim();
            if block.is_empty() {
                continue;
            }

            match parse_block(block) {
                Some(cue) => cues.push(cue),
                None => warn!(block = block_number + 1, "skipping malformed SRT block"),
            }
        }

        Ok(Self::from_cues(cues))
    }

    fn position_of(&self, index: usize) -> Result<usize> {
        if index == 0 || index > self.cues.len() {
            return Err(Error::CueOutOfRange {
                index,
                len: self.cues.len(),
            });
        }
        Ok(index - 1)
    }

    fn reindex(&mut self) {
        for (position, cue) in self.cues.iter_mut().enumerate() {
            cue.index = position + 1;
        }
    }
}

fn parse_block(block: &str) -> Option<Cue> {
    let mut lines = block.lines();

    let index: usize = lines.next()?.trim().parse().ok()?;
    let timing = lines.next()?;
    let (start_raw, end_raw) = timing.split_once("-->")?;

    let start_seconds = parse_timecode(start_raw).ok()?;
    let end_seconds = parse_timecode(end_raw).ok()?;

    let text = lines.collect::<Vec<_>>().join("\n");
    if text.trim().is_empty() {
        return None;
    }

    Some(Cue {
        index,
        start_seconds,
        end_seconds,
        text,
    })
}

/// Divide text at the word boundary nearest `fraction` of its characters.
///
/// A single-word cue keeps its word in the head; the tail comes back empty and
/// the caller decides what to do with it.
fn divide_text(text: &str, fraction: f64) -> (String, String) {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= 1 {
        return (text.trim().to_owned(), String::new());
    }

    let total_chars: usize = words.iter().map(|w| w.chars().count() + 1).sum();
    let target = fraction * total_chars as f64;

    let mut best_split = 1;
    let mut best_distance = f64::INFINITY;
    let mut consumed = 0usize;
    for (word_idx, word) in words.iter().enumerate().take(words.len() - 1) {
        consumed += word.chars().count() + 1;
        let distance = (consumed as f64 - target).abs();
        if distance < best_distance {
            best_distance = distance;
            best_split = word_idx + 1;
        }
    }

    (words[..best_split].join(" "), words[best_split..].join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cue(index: usize, start: f64, end: f64, text: &str) -> Cue {
        Cue {
            index,
            start_seconds: start,
            end_seconds: end,
            text: text.to_owned(),
        }
    }

    fn three_cue_doc() -> SubtitleDocument {
        SubtitleDocument::from_cues(vec![
            cue(0, 0.0, 1.0, "first"),
            cue(0, 1.0, 2.0, "second"),
            cue(0, 2.0, 3.0, "third"),
        ])
    }

    fn assert_contiguous_indices(doc: &SubtitleDocument) {
        for (position, cue) in doc.cues().iter().enumerate() {
            assert_eq!(cue.index, position + 1);
        }
    }

    #[test]
    fn delete_renumbers_and_shifts_content_down() {
        let mut doc = three_cue_doc();
        let removed = doc.delete_cue(2).unwrap();

        assert_eq!(removed.text, "second");
        assert_eq!(doc.len(), 2);
        assert_contiguous_indices(&doc);
        assert_eq!(doc.cues()[1].text, "third");
        assert_eq!(doc.cues()[1].index, 2);
    }

    #[test]
    fn insert_after_zero_prepends() {
        let mut doc = three_cue_doc();
        doc.insert_cue(0, cue(0, 0.0, 0.5, "intro")).unwrap();

        assert_eq!(doc.cues()[0].text, "intro");
        assert_contiguous_indices(&doc);

        let err = doc.insert_cue(99, cue(0, 0.0, 0.5, "x")).unwrap_err();
        assert!(matches!(err, Error::CueOutOfRange { index: 99, .. }));
    }

    #[test]
    fn merge_requires_adjacency() {
        let mut doc = three_cue_doc();
        assert!(matches!(
            doc.merge_cues(1, 3),
            Err(Error::TimingConflict(_))
        ));

        doc.merge_cues(1, 2).unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.cues()[0].text, "first\nsecond");
        assert_eq!(doc.cues()[0].end_seconds, 2.0);
        assert_contiguous_indices(&doc);
    }

    #[test]
    fn split_divides_time_and_text() {
        let mut doc = SubtitleDocument::from_cues(vec![cue(0, 0.0, 4.0, "one two three four")]);
        doc.split_cue(1, 2.0).unwrap();

        assert_eq!(doc.len(), 2);
        assert_eq!(doc.cues()[0].end_seconds, 2.0);
        assert_eq!(doc.cues()[1].start_seconds, 2.0);
        assert_eq!(doc.cues()[0].text, "one two");
        assert_eq!(doc.cues()[1].text, "three four");
        assert_contiguous_indices(&doc);
    }

    #[test]
    fn split_outside_the_cue_is_rejected() {
        let mut doc = three_cue_doc();
        assert!(matches!(
            doc.split_cue(1, 1.5),
            Err(Error::TimingConflict(_))
        ));
        assert!(matches!(
            doc.split_cue(1, 0.0),
            Err(Error::TimingConflict(_))
        ));
        assert_eq!(doc.len(), 3);
    }

    #[test]
    fn shift_timing_moves_a_range() {
        let mut doc = three_cue_doc();
        doc.shift_timing(2..=3, 0.5).unwrap();

        assert_eq!(doc.cues()[0].start_seconds, 0.0);
        assert_eq!(doc.cues()[1].start_seconds, 1.5);
        assert_eq!(doc.cues()[2].end_seconds, 3.5);
    }

    #[test]
    fn shift_before_zero_is_rejected_without_changes() {
        let mut doc = three_cue_doc();
        let before = doc.clone();

        let err = doc.shift_timing(1..=3, -0.5).unwrap_err();
        assert!(matches!(err, Error::TimingConflict(_)));
        assert_eq!(doc, before);
    }

    #[test]
    fn set_text_does_not_renumber() {
        let mut doc = three_cue_doc();
        doc.set_text(2, "rewritten").unwrap();
        assert_eq!(doc.cues()[1].text, "rewritten");
        assert_contiguous_indices(&doc);
    }

    #[test]
    fn serializes_srt_blocks() {
        let doc = SubtitleDocument::from_cues(vec![
            cue(0, 0.0, 1.234, "hello"),
            cue(0, 61.2, 62.0, "two\nlines"),
        ]);

        let srt = doc.to_srt().unwrap();
        assert_eq!(
            srt,
            "1\n00:00:00,000 --> 00:00:01,234\nhello\n\n2\n00:01:01,200 --> 00:01:02,000\ntwo\nlines\n\n"
        );
    }

    #[test]
    fn srt_round_trip_preserves_text_and_times() {
        let doc = SubtitleDocument::from_cues(vec![
            cue(0, 0.0, 1.5, "plain"),
            cue(0, 1.5, 3.25, "two\nlines here"),
            cue(0, 3_600.5, 3_601.75, "an hour in"),
        ]);

        let parsed = SubtitleDocument::parse_srt(&doc.to_srt().unwrap()).unwrap();
        assert_eq!(parsed.len(), doc.len());
        for (orig, round) in doc.cues().iter().zip(parsed.cues()) {
            assert_eq!(orig.text, round.text);
            assert!((orig.start_seconds - round.start_seconds).abs() < 0.001);
            assert!((orig.end_seconds - round.end_seconds).abs() < 0.001);
        }
    }

    #[test]
    fn parse_skips_malformed_blocks_and_renumbers() {
        let input = "1\n00:00:00,000 --> 00:00:01,000\nfine\n\nnot a number\nnonsense\n\n7\n00:00:02,000 --> 00:00:03,000\nalso fine\n\n";
        let doc = SubtitleDocument::parse_srt(input).unwrap();

        assert_eq!(doc.len(), 2);
        assert_contiguous_indices(&doc);
        assert_eq!(doc.cues()[1].text, "also fine");
    }

    #[test]
    fn parse_accepts_crlf() {
        let input = "1\r\n00:00:00,000 --> 00:00:01,000\r\nwindows line endings\r\n\r\n";
        let doc = SubtitleDocument::parse_srt(input).unwrap();
        assert_eq!(doc.len(), 1);
        assert_eq!(doc.cues()[0].text, "windows line endings");
    }

    #[test]
    fn serialization_does_not_correct_overlap() {
        let mut doc = three_cue_doc();
        doc.shift_timing(2..=2, -0.5).unwrap(); // cue 2 now overlaps cue 1

        let srt = doc.to_srt().unwrap();
        assert!(srt.contains("00:00:00,500 --> 00:00:01,500"));
    }
}
