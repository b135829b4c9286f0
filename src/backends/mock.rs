//! A scripted backend for tests and frontend development.
//!
//! Emits a fixed list of segments regardless of the input audio, optionally
//! failing partway through. Useful for exercising the job pipeline, cue
//! normalization, and cancellation without a model file or network access.

use crate::backend::{SegmentSink, TranscribeOpts, TranscriptionBackend};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::probe::MediaSource;
use crate::segment::TranscriptionSegment;

/// What a [`ScriptedBackend`] does after emitting its scripted segments.
pub enum ScriptEnding {
    Complete,
    Fail(fn() -> Error),
}

pub struct ScriptedBackend {
    segments: Vec<TranscriptionSegment>,
    ending: ScriptEnding,
    /// Errors to return on successive calls before the script runs; lets tests
    /// exercise the job's retry path.
    failures_before_start: Vec<fn() -> Error>,
    requires_device: bool,
    pub calls: u32,
}

impl ScriptedBackend {
    pub fn new(segments: Vec<TranscriptionSegment>) -> Self {
        Self {
            segments,
            ending: ScriptEnding::Complete,
            failures_before_start: Vec::new(),
            requires_device: false,
            calls: 0,
        }
    }

    /// Fail the next `transcribe` call(s) before emitting anything.
    pub fn failing_first(mut self, failures: Vec<fn() -> Error>) -> Self {
        self.failures_before_start = failures;
        self
    }

    /// Behave like a local engine: the job will select and lease a device.
    pub fn on_device(mut self) -> Self {
        self.requires_device = true;
        self
    }

    pub fn ending(mut self, ending: ScriptEnding) -> Self {
        self.ending = ending;
        self
    }
}

impl TranscriptionBackend for ScriptedBackend {
    fn requires_device(&self) -> bool {
        self.requires_device
    }

    fn transcribe(
        &mut self,
        _source: &MediaSource,
        _opts: &TranscribeOpts,
        cancel: &CancelToken,
        sink: &mut dyn SegmentSink,
    ) -> Result<()> {
        self.calls += 1;

        if !self.failures_before_start.is_empty() {
            let failure = self.failures_before_start.remove(0);
            return Err(failure());
        }

        let total = self.segments.len().max(1);
        for (idx, segment) in self.segments.iter().enumerate() {
            cancel.checkpoint()?;
            if !sink.on_segment(segment.clone())? {
                return Ok(());
            }
            sink.on_progress((idx + 1) as f64 / total as f64)?;
        }

        match &self.ending {
            ScriptEnding::Complete => Ok(()),
            ScriptEnding::Fail(make) => Err(make()),
        }
    }
}
