//! Cue normalization: raw transcription segments to well-formed SRT cues.
//!
//! The builder runs a fixed policy pipeline:
//! 1. drop empty/zero-length segments, restore ordering invariants
//! 2. enforce a minimum cue duration (extend, merge, or borrow from the
//!    following segment, never overlapping)
//! 3. split over-long text across multiple cues, timed by word spans when
//!    available
//! 4. re-index from 1
//! 5. validate every timestamp

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::segment::TranscriptionSegment;
use crate::timecode;

const EPS: f64 = 1e-9;

/// One timed subtitle entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cue {
    /// 1-based position in the document.
    pub index: usize,
    pub start_seconds: f64,
    pub end_seconds: f64,
    /// Cue payload; may span multiple lines.
    pub text: String,
}

impl Cue {
    pub fn duration_seconds(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }
}

/// How to distribute a split segment's time span when no usable word timing exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitTiming {
    /// Each piece gets a share proportional to its character count.
    #[default]
    CharWeighted,
    /// Each piece gets an equal share.
    Even,
}

/// Tunables for cue normalization.
///
/// Defaults mirror the transcription settings users actually ship: one line of
/// up to eight words per cue, one second on screen at minimum.
#[derive(Debug, Clone)]
pub struct CuePolicy {
    pub min_duration_seconds: f64,
    pub max_words_per_line: usize,
    pub max_lines: usize,
    pub split_timing: SplitTiming,
}

impl Default for CuePolicy {
    fn default() -> Self {
        Self {
            min_duration_seconds: 1.0,
            max_words_per_line: 8,
            max_lines: 1,
            split_timing: SplitTiming::default(),
        }
    }
}

impl CuePolicy {
    fn max_words_per_cue(&self) -> usize {
        self.max_words_per_line.max(1) * self.max_lines.max(1)
    }
}

/// Converts backend segments into normalized cues.
#[derive(Debug, Clone, Default)]
pub struct CueBuilder {
    policy: CuePolicy,
}

impl CueBuilder {
    pub fn new(policy: CuePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CuePolicy {
        &self.policy
    }

    /// Build normalized cues from segments.
    ///
    /// `media_duration` clamps every cue to the probed media length so no cue
    /// can outlive the audio it subtitles.
    pub fn build(
        &self,
        segments: &[TranscriptionSegment],
        media_duration: Option<f64>,
    ) -> Result<Vec<Cue>> {
        let mut drafts = self.collect_speech(segments, media_duration)?;
        self.enforce_min_duration(&mut drafts, media_duration);

        let mut cues = Vec::with_capacity(drafts.len());
        for draft in drafts {
            self.split_and_wrap(draft, &mut cues);
        }

        for (position, cue) in cues.iter_mut().enumerate() {
            cue.index = position + 1;
        }

        for cue in &cues {
            timecode::validate_seconds(cue.start_seconds)?;
            timecode::validate_seconds(cue.end_seconds)?;
            if cue.end_seconds <= cue.start_seconds {
                return Err(Error::InvalidTimestamp(cue.end_seconds));
            }
        }

        Ok(cues)
    }

    /// Step 1: keep real speech, sort, clamp to media end, remove overlap.
    fn collect_speech(
        &self,
        segments: &[TranscriptionSegment],
        media_duration: Option<f64>,
    ) -> Result<Vec<TranscriptionSegment>> {
        for segment in segments {
            timecode::validate_seconds(segment.start_seconds)?;
            timecode::validate_seconds(segment.end_seconds)?;
        }

        let mut drafts: Vec<TranscriptionSegment> = segments
            .iter()
            .filter(|s| s.is_speech())
            .cloned()
            .collect();
        drafts.sort_by(|a, b| a.start_seconds.total_cmp(&b.start_seconds));

        let mut kept: Vec<TranscriptionSegment> = Vec::with_capacity(drafts.len());
        for mut draft in drafts {
            if let Some(limit) = media_duration {
                draft.end_seconds = draft.end_seconds.min(limit);
            }
            if let Some(previous) = kept.last() {
                draft.start_seconds = draft.start_seconds.max(previous.end_seconds);
            }
            if draft.end_seconds - draft.start_seconds > EPS {
                kept.push(draft);
            }
        }
        Ok(kept)
    }

    /// Step 2: every cue gets at least the minimum duration where the
    /// neighboring audio allows it.
    fn enforce_min_duration(&self, drafts: &mut Vec<TranscriptionSegment>, media_duration: Option<f64>) {
        let min = self.policy.min_duration_seconds;
        if min <= 0.0 {
            return;
        }

        let mut i = 0;
        while i < drafts.len() {
            if drafts[i].duration_seconds() + EPS >= min {
                i += 1;
                continue;
            }

            if i + 1 == drafts.len() {
                // Last cue: extend freely, but never past the end of the media.
                let mut target = drafts[i].start_seconds + min;
                if let Some(limit) = media_duration {
                    target = target.min(limit);
                }
                drafts[i].end_seconds = drafts[i].end_seconds.max(target);
                i += 1;
                continue;
            }

            // Extend into the following gap, at most to its midpoint.
            let next_start = drafts[i + 1].start_seconds;
            let gap_midpoint = (drafts[i].end_seconds + next_start) / 2.0;
            let extended = (drafts[i].start_seconds + min).min(gap_midpoint);
            drafts[i].end_seconds = drafts[i].end_seconds.max(extended);
            if drafts[i].duration_seconds() + EPS >= min {
                i += 1;
                continue;
            }

            if drafts[i + 1].duration_seconds() < min {
                // Two short neighbors read better as one cue.
                let next = drafts.remove(i + 1);
                let merged_text = format!("{} {}", drafts[i].text.trim(), next.text.trim());
                drafts[i].end_seconds = next.end_seconds;
                drafts[i].text = merged_text;
                drafts[i].words.extend(next.words);
                // Re-evaluate the merged cue from the same position.
                continue;
            }

            // The next cue is long enough to give up its head.
            let needed_end = drafts[i].start_seconds + min;
            if drafts[i + 1].end_seconds - needed_end + EPS >= min {
                drafts[i].end_seconds = needed_end;
                drafts[i + 1].start_seconds = needed_end;
            } else {
                // Constrained by the neighbor; close the gap and accept a
                // shorter cue.
                drafts[i].end_seconds = next_start;
            }
            i += 1;
        }
    }

    /// Step 3: split over-long segments and wrap cue text into lines.
    fn split_and_wrap(&self, draft: TranscriptionSegment, out: &mut Vec<Cue>) {
        let words: Vec<&str> = draft.text.split_whitespace().collect();
        let max_words = self.policy.max_words_per_cue();

        if words.len() <= max_words {
            out.push(Cue {
                index: 0,
                start_seconds: draft.start_seconds,
                end_seconds: draft.end_seconds,
                text: wrap_words(&words, self.policy.max_words_per_line.max(1)),
            });
            return;
        }

        let groups: Vec<&[&str]> = words.chunks(max_words).collect();
        let boundaries = self.split_boundaries(&draft, &groups, &words);

        for (group_idx, group) in groups.iter().enumerate() {
            out.push(Cue {
                index: 0,
                start_seconds: boundaries[group_idx],
                end_seconds: boundaries[group_idx + 1],
                text: wrap_words(group, self.policy.max_words_per_line.max(1)),
            });
        }
    }

    /// Boundary times for split groups: word timing when trustworthy, policy
    /// timing otherwise. Always `groups.len() + 1` strictly increasing values
    /// from segment start to segment end.
    fn split_boundaries(
        &self,
        draft: &TranscriptionSegment,
        groups: &[&[&str]],
        words: &[&str],
    ) -> Vec<f64> {
        if draft.words_cover_text() {
            if let Some(boundaries) = word_span_boundaries(draft, groups) {
                return boundaries;
            }
        }

        let span = draft.duration_seconds();
        let mut boundaries = Vec::with_capacity(groups.len() + 1);
        boundaries.push(draft.start_seconds);

        match self.policy.split_timing {
            SplitTiming::CharWeighted => {
                // Weight by character count, counting the joining spaces.
                let total_chars: usize = words.iter().map(|w| w.chars().count() + 1).sum();
                let mut consumed = 0usize;
                for group in &groups[..groups.len() - 1] {
                    consumed += group.iter().map(|w| w.chars().count() + 1).sum::<usize>();
                    let fraction = consumed as f64 / total_chars as f64;
                    boundaries.push(draft.start_seconds + span * fraction);
                }
            }
            SplitTiming::Even => {
                for group_idx in 1..groups.len() {
                    let fraction = group_idx as f64 / groups.len() as f64;
                    boundaries.push(draft.start_seconds + span * fraction);
                }
            }
        }

        boundaries.push(draft.end_seconds);
        boundaries
    }
}

/// Interior boundaries at the midpoint between the last word of one group and
/// the first word of the next. Returns `None` when the spans are degenerate
/// (non-increasing), which falls back to policy timing.
fn word_span_boundaries(draft: &TranscriptionSegment, groups: &[&[&str]]) -> Option<Vec<f64>> {
    let mut boundaries = Vec::with_capacity(groups.len() + 1);
    boundaries.push(draft.start_seconds);

    let mut word_idx = 0usize;
    for group in &groups[..groups.len() - 1] {
        let last_in_group = word_idx + group.len() - 1;
        let first_in_next = last_in_group + 1;
        let prev_end = draft.words.get(last_in_group)?.end_seconds;
        let next_start = draft.words.get(first_in_next)?.start_seconds;
        boundaries.push((prev_end + next_start) / 2.0);
        word_idx += group.len();
    }
    boundaries.push(draft.end_seconds);

    let increasing = boundaries.windows(2).all(|pair| pair[1] - pair[0] > EPS);
    increasing.then_some(boundaries)
}

fn wrap_words(words: &[&str], per_line: usize) -> String {
    words
        .chunks(per_line)
        .map(|line| line.join(" "))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::WordSpan;

    fn seg(start: f64, end: f64, text: &str) -> TranscriptionSegment {
        TranscriptionSegment::new(start, end, text)
    }

    fn assert_ordered_non_overlapping(cues: &[Cue]) {
        for pair in cues.windows(2) {
            assert!(
                pair[0].end_seconds <= pair[1].start_seconds + EPS,
                "cues overlap: {pair:?}"
            );
        }
    }

    #[test]
    fn drops_empty_and_zero_length_segments() {
        let builder = CueBuilder::default();
        let cues = builder
            .build(
                &[seg(0.0, 2.0, "keep"), seg(2.0, 2.0, "zero"), seg(2.0, 4.0, "   ")],
                None,
            )
            .unwrap();
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "keep");
    }

    #[test]
    fn short_neighbors_merge_then_borrow_from_long_successor() {
        // Back-to-back shorts cannot be fixed by gap extension alone.
        let builder = CueBuilder::default();
        let cues = builder
            .build(
                &[seg(0.0, 0.3, "hi"), seg(0.3, 0.8, "there"), seg(0.8, 5.0, "friend")],
                Some(5.0),
            )
            .unwrap();

        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].text, "hi there");
        assert!(cues[0].duration_seconds() >= 1.0 - EPS);
        assert!(cues[0].end_seconds <= cues[1].start_seconds + EPS);
        assert_eq!(cues[1].text, "friend");
        assert!(cues[1].duration_seconds() >= 1.0 - EPS);
    }

    #[test]
    fn short_cue_extends_into_gap() {
        let builder = CueBuilder::default();
        let cues = builder
            .build(&[seg(0.0, 0.5, "a"), seg(2.0, 3.5, "b")], None)
            .unwrap();
        assert!((cues[0].end_seconds - 1.0).abs() < EPS);
        assert_ordered_non_overlapping(&cues);
    }

    #[test]
    fn gap_extension_stops_at_midpoint_then_borrows() {
        let builder = CueBuilder::default();
        let cues = builder
            .build(&[seg(0.0, 0.5, "a"), seg(0.9, 3.0, "b")], None)
            .unwrap();
        // Midpoint (0.7) is not enough, so the long successor donates its head.
        assert!((cues[0].end_seconds - 1.0).abs() < EPS);
        assert!((cues[1].start_seconds - 1.0).abs() < EPS);
        assert!(cues[1].duration_seconds() >= 1.0 - EPS);
    }

    #[test]
    fn constrained_cue_may_stay_short() {
        // The successor is barely above minimum, so it cannot donate.
        let builder = CueBuilder::default();
        let cues = builder
            .build(&[seg(0.0, 0.5, "a"), seg(0.6, 1.7, "b")], None)
            .unwrap();
        assert_eq!(cues.len(), 2);
        assert!(cues[0].duration_seconds() < 1.0);
        assert!((cues[0].end_seconds - 0.6).abs() < EPS);
        assert_ordered_non_overlapping(&cues);
    }

    #[test]
    fn last_cue_extension_clamps_to_media_duration() {
        let builder = CueBuilder::default();
        let cues = builder.build(&[seg(0.0, 0.4, "tail")], Some(0.8)).unwrap();
        assert!((cues[0].end_seconds - 0.8).abs() < EPS);
    }

    #[test]
    fn cues_never_extend_past_media_end() {
        let builder = CueBuilder::default();
        let cues = builder
            .build(&[seg(0.0, 2.0, "a"), seg(2.0, 7.5, "b")], Some(6.0))
            .unwrap();
        assert!(cues.last().unwrap().end_seconds <= 6.0 + EPS);
    }

    #[test]
    fn long_text_splits_into_bounded_cues_with_char_weighted_times() {
        let builder = CueBuilder::default(); // 8 words per cue
        let text = (1..=20).map(|n| format!("word{n}")).collect::<Vec<_>>().join(" ");
        let cues = builder.build(&[seg(0.0, 10.0, &text)], Some(10.0)).unwrap();

        assert_eq!(cues.len(), 3);
        for cue in &cues {
            assert!(cue.text.split_whitespace().count() <= 8);
        }
        assert!((cues[0].start_seconds - 0.0).abs() < EPS);
        assert!((cues[2].end_seconds - 10.0).abs() < EPS);
        assert_ordered_non_overlapping(&cues);
        // First group holds 8 of 20 words of near-equal length: roughly 40% of the span.
        assert!(cues[0].duration_seconds() > 3.0 && cues[0].duration_seconds() < 5.0);
    }

    #[test]
    fn even_split_distributes_time_uniformly() {
        let builder = CueBuilder::new(CuePolicy {
            split_timing: SplitTiming::Even,
            ..CuePolicy::default()
        });
        let text = (1..=16).map(|n| format!("w{n}")).collect::<Vec<_>>().join(" ");
        let cues = builder.build(&[seg(0.0, 8.0, &text)], None).unwrap();

        assert_eq!(cues.len(), 2);
        assert!((cues[0].duration_seconds() - 4.0).abs() < EPS);
        assert!((cues[1].duration_seconds() - 4.0).abs() < EPS);
    }

    #[test]
    fn split_prefers_word_span_boundaries() {
        let words: Vec<WordSpan> = (0..10)
            .map(|n| WordSpan {
                // Words packed into the first half; char weighting would split near 5.0.
                start_seconds: n as f64 * 0.5,
                end_seconds: n as f64 * 0.5 + 0.4,
                text: format!("w{n}"),
            })
            .collect();
        let text = words.iter().map(|w| w.text.clone()).collect::<Vec<_>>().join(" ");

        let builder = CueBuilder::new(CuePolicy {
            max_words_per_line: 5,
            max_lines: 1,
            ..CuePolicy::default()
        });
        let segment = seg(0.0, 10.0, &text).with_words(words);
        let cues = builder.build(&[segment], None).unwrap();

        assert_eq!(cues.len(), 2);
        // Boundary at the midpoint between word 4's end (2.4) and word 5's start (2.5).
        assert!((cues[0].end_seconds - 2.45).abs() < 1e-6);
        assert!((cues[1].start_seconds - 2.45).abs() < 1e-6);
    }

    #[test]
    fn wrapping_respects_words_per_line() {
        let builder = CueBuilder::new(CuePolicy {
            max_words_per_line: 3,
            max_lines: 2,
            ..CuePolicy::default()
        });
        let cues = builder.build(&[seg(0.0, 4.0, "one two three four five")], None).unwrap();
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "one two three\nfour five");
    }

    #[test]
    fn indices_are_contiguous_from_one() {
        let builder = CueBuilder::default();
        let cues = builder
            .build(
                &[seg(0.0, 2.0, "a"), seg(2.0, 4.0, "b"), seg(4.0, 6.0, "c")],
                None,
            )
            .unwrap();
        let indices: Vec<usize> = cues.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn non_finite_times_are_rejected() {
        let builder = CueBuilder::default();
        let err = builder.build(&[seg(f64::NAN, 1.0, "x")], None).unwrap_err();
        assert!(matches!(err, Error::InvalidTimestamp(_)));

        let err = builder.build(&[seg(-1.0, 1.0, "x")], None).unwrap_err();
        assert!(matches!(err, Error::InvalidTimestamp(_)));
    }

    #[test]
    fn unsorted_input_is_reordered() {
        let builder = CueBuilder::default();
        let cues = builder
            .build(&[seg(4.0, 6.0, "late"), seg(0.0, 2.0, "early")], None)
            .unwrap();
        assert_eq!(cues[0].text, "early");
        assert_eq!(cues[1].text, "late");
        assert_ordered_non_overlapping(&cues);
    }
}
