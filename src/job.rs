//! Job orchestration: one media file in, one subtitle document out.
//!
//! The flow is deliberately sequential — probe, select a device (local mode
//! only), transcribe, build cues, populate the document — because segment
//! ordering depends on a single linear pass over the media. The long-running
//! middle is the only suspension point: it reports progress and honors the
//! job's cancel token between chunks and segments.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::backend::{BackendKind, SegmentSink, TranscribeOpts, TranscriptionBackend};
use crate::cancel::CancelToken;
use crate::cue::{CueBuilder, CuePolicy};
use crate::device::{self, BuildProbe, Device, DeviceLease, DeviceProbe};
use crate::document::SubtitleDocument;
use crate::error::{Error, Result};
use crate::probe::{self, MediaSource};
use crate::segment::TranscriptionSegment;

/// Everything a job needs beyond its backend, fixed at construction.
///
/// Deliberately job-scoped rather than ambient: two concurrent jobs (say,
/// local and hosted on different files) share nothing through this type.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub opts: TranscribeOpts,
    pub policy: CuePolicy,
    /// Retry once on the CPU after an accelerator fault.
    pub cpu_fallback: bool,
}

impl JobConfig {
    pub fn new() -> Self {
        Self {
            opts: TranscribeOpts::default(),
            policy: CuePolicy::default(),
            cpu_fallback: true,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal state of a job that did not fail.
#[derive(Debug)]
pub enum JobOutcome {
    Completed(SubtitleDocument),
    /// The user stopped the job; partial cues were discarded.
    Cancelled,
}

/// Receives job events on the thread running the job.
pub trait JobObserver {
    /// Fraction of audio processed, in `[0, 1]`.
    fn on_progress(&mut self, fraction: f64) {
        let _ = fraction;
    }

    fn on_segment(&mut self, segment: &TranscriptionSegment) {
        let _ = segment;
    }

    /// The compute device a local attempt is about to run on.
    fn on_device_selected(&mut self, device: Device) {
        let _ = device;
    }
}

/// The no-op observer.
impl JobObserver for () {}

/// A single transcription run over one media file.
///
/// Construct, hand the [`CancelToken`] to whatever may need to stop the work,
/// then call [`TranscriptionJob::run`] from a worker thread. `run` consumes
/// the job; ownership of the finished document transfers to the caller.
pub struct TranscriptionJob<B: TranscriptionBackend = BackendKind> {
    input: PathBuf,
    backend: B,
    config: JobConfig,
    cancel: CancelToken,
    device_probe: Box<dyn DeviceProbe>,
}

impl TranscriptionJob<BackendKind> {
    pub fn new(input: impl Into<PathBuf>, backend: BackendKind, config: JobConfig) -> Self {
        Self::with_backend(input, backend, config)
    }
}

impl<B: TranscriptionBackend> TranscriptionJob<B> {
    /// Create a job over a custom backend implementation.
    pub fn with_backend(input: impl Into<PathBuf>, backend: B, config: JobConfig) -> Self {
        Self {
            input: input.into(),
            backend,
            config,
            cancel: CancelToken::new(),
            device_probe: Box::new(BuildProbe),
        }
    }

    /// Substitute the device capability probe (frontends with real driver
    /// detection inject theirs here).
    pub fn with_device_probe(mut self, probe: Box<dyn DeviceProbe>) -> Self {
        self.device_probe = probe;
        self
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    /// A handle for requesting cancellation while the job runs.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the job to completion, cancellation, or failure.
    pub fn run(mut self, observer: &mut dyn JobObserver) -> Result<JobOutcome> {
        match self.execute(observer) {
            Ok(document) => Ok(JobOutcome::Completed(document)),
            Err(Error::Cancelled) => {
                info!(input = %self.input.display(), "transcription job cancelled");
                Ok(JobOutcome::Cancelled)
            }
            Err(err) => Err(err),
        }
    }

    fn execute(&mut self, observer: &mut dyn JobObserver) -> Result<SubtitleDocument> {
        let source = probe::probe(&self.input)?;
        info!(
            input = %self.input.display(),
            container = %source.container,
            codec = %source.codec,
            duration_seconds = source.duration_seconds,
            "probed media"
        );
        self.cancel.checkpoint()?;

        let segments = if self.backend.requires_device() {
            self.transcribe_local(&source, observer)?
        } else {
            self.transcribe_once(&source, None, observer)?
        };
        self.cancel.checkpoint()?;

        let cues = CueBuilder::new(self.config.policy.clone())
            .build(&segments, Some(source.duration_seconds))?;
        Ok(SubtitleDocument::from_cues(cues))
    }

    /// Local mode: select and lease a device, with at most one CPU retry
    /// after an accelerator fault.
    fn transcribe_local(
        &mut self,
        source: &MediaSource,
        observer: &mut dyn JobObserver,
    ) -> Result<Vec<TranscriptionSegment>> {
        let device = device::select(self.device_probe.as_ref(), self.config.opts.device)?;
        let lease = DeviceLease::acquire(device)?;
        observer.on_device_selected(device);

        let first_attempt = self.transcribe_once(source, Some(device), observer);
        drop(lease);

        match first_attempt {
            Err(err) if err.is_transient() && device != Device::Cpu && self.config.cpu_fallback => {
                warn!(%device, error = %err, "accelerator fault, retrying once on cpu");
                let cpu_lease = DeviceLease::acquire(Device::Cpu)?;
                observer.on_device_selected(Device::Cpu);
                let retry = self.transcribe_once(source, Some(Device::Cpu), observer);
                drop(cpu_lease);
                retry
            }
            other => other,
        }
    }

    /// One transcription pass into a fresh collector.
    fn transcribe_once(
        &mut self,
        source: &MediaSource,
        device: Option<Device>,
        observer: &mut dyn JobObserver,
    ) -> Result<Vec<TranscriptionSegment>> {
        let mut opts = self.config.opts.clone();
        opts.device = device;

        let cancel = self.cancel.clone();
        let mut collector = Collector {
            cancel: &cancel,
            observer,
            segments: Vec::new(),
        };
        self.backend
            .transcribe(source, &opts, &cancel, &mut collector)?;
        Ok(collector.segments)
    }
}

/// Accumulates backend segments and forwards events to the observer, checking
/// the cancel token at every callback.
struct Collector<'a> {
    cancel: &'a CancelToken,
    observer: &'a mut dyn JobObserver,
    segments: Vec<TranscriptionSegment>,
}

impl SegmentSink for Collector<'_> {
    fn on_segment(&mut self, segment: TranscriptionSegment) -> Result<bool> {
        self.cancel.checkpoint()?;
        self.observer.on_segment(&segment);
        self.segments.push(segment);
        Ok(true)
    }

    fn on_progress(&mut self, fraction: f64) -> Result<()> {
        self.cancel.checkpoint()?;
        self.observer.on_progress(fraction);
        Ok(())
    }
}
