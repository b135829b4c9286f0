//! The pluggable transcription seam.
//!
//! A backend turns a probed media file into an ordered stream of
//! [`TranscriptionSegment`]s pushed through a [`SegmentSink`]. Segments arrive
//! incrementally so the caller can report progress and honor cancellation;
//! invoking [`TranscriptionBackend::transcribe`] again restarts the sequence
//! from the beginning, which is what the job's retry path relies on.

use crate::backends::local::LocalModelBackend;
use crate::backends::remote::RemoteApiBackend;
use crate::cancel::CancelToken;
use crate::device::Device;
use crate::error::Result;
use crate::probe::MediaSource;
use crate::segment::TranscriptionSegment;

/// Per-job transcription options.
///
/// This is library-level configuration; frontends map their own flags and
/// settings onto it so the library stays reusable outside any one shell.
#[derive(Debug, Clone, Default)]
pub struct TranscribeOpts {
    /// Pinned compute device for local inference. `None` lets the selector
    /// pick the best available device. Ignored by the hosted backend.
    pub device: Option<Device>,

    /// Optional language hint (e.g. `"en"`, `"de"`). `None` lets the model
    /// auto-detect the spoken language.
    pub language_hint: Option<String>,

    /// Optional priming text fed to the recognizer, useful for names and
    /// domain vocabulary.
    pub initial_prompt: Option<String>,
}

/// Receives segments and progress as a backend produces them.
pub trait SegmentSink {
    /// Handle one finished segment. Returning `Ok(false)` stops the backend early.
    fn on_segment(&mut self, segment: TranscriptionSegment) -> Result<bool>;

    /// Observe progress as the fraction of audio processed, in `[0, 1]`.
    fn on_progress(&mut self, fraction: f64) -> Result<()> {
        let _ = fraction;
        Ok(())
    }
}

/// A transcription engine: local model or hosted API.
///
/// Guarantees: segments are emitted in non-decreasing start order, the
/// sequence is finite, and the sink sees every segment exactly once per call.
/// Callers may not assume uniform segment duration.
pub trait TranscriptionBackend {
    /// Whether this engine runs on a locally selected compute device.
    ///
    /// Drives device selection and the exclusive device lease in the job;
    /// hosted engines return `false` and run unconstrained.
    fn requires_device(&self) -> bool {
        false
    }

    fn transcribe(
        &mut self,
        source: &MediaSource,
        opts: &TranscribeOpts,
        cancel: &CancelToken,
        sink: &mut dyn SegmentSink,
    ) -> Result<()>;
}

/// The two interchangeable engines, selected once at job construction.
pub enum BackendKind {
    /// A downloaded whisper.cpp model running on a selected device.
    Local(LocalModelBackend),
    /// A hosted transcription API reached over HTTP.
    Remote(RemoteApiBackend),
}

impl TranscriptionBackend for BackendKind {
    fn requires_device(&self) -> bool {
        match self {
            BackendKind::Local(backend) => backend.requires_device(),
            BackendKind::Remote(backend) => backend.requires_device(),
        }
    }

    fn transcribe(
        &mut self,
        source: &MediaSource,
        opts: &TranscribeOpts,
        cancel: &CancelToken,
        sink: &mut dyn SegmentSink,
    ) -> Result<()> {
        match self {
            BackendKind::Local(backend) => backend.transcribe(source, opts, cancel, sink),
            BackendKind::Remote(backend) => backend.transcribe(source, opts, cancel, sink),
        }
    }
}
