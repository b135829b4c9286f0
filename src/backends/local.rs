//! Local transcription on a downloaded whisper.cpp model.
//!
//! Decoding and inference run concurrently: a worker thread feeds normalized
//! audio over a bounded channel while inference consumes it through a sliding
//! window, so memory stays bounded no matter how long the media is. Whisper
//! runs once the window fills (or at end-of-stream), every completed segment
//! except the trailing one is emitted, and the window advances past the last
//! emitted segment.

use std::path::{Path, PathBuf};
use std::sync::mpsc;

use tracing::debug;
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperSegment,
    WhisperState,
};

use crate::audio::{self, SampleSink, TARGET_SAMPLE_RATE};
use crate::backend::{SegmentSink, TranscribeOpts, TranscriptionBackend};
use crate::cancel::CancelToken;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::probe::MediaSource;
use crate::segment::{TranscriptionSegment, WordSpan};

/// Decoded samples handed to inference per channel message (1 s of audio).
const CHUNK_FRAMES: usize = TARGET_SAMPLE_RATE as usize;

/// Inference window bounds, in samples.
const MIN_WINDOW_SAMPLES: usize = TARGET_SAMPLE_RATE as usize * 5;
const MAX_WINDOW_SAMPLES: usize = TARGET_SAMPLE_RATE as usize * 30;

/// Transcription engine backed by a whisper.cpp model file.
///
/// The model path is validated at construction; the context itself loads
/// lazily per requested device so a CPU retry after an accelerator fault
/// reloads exactly once.
pub struct LocalModelBackend {
    model_path: PathBuf,
    loaded: Option<(Device, WhisperContext)>,
}

impl LocalModelBackend {
    /// Point the backend at a model file (as provided by a model manager).
    ///
    /// Fails with [`Error::ModelNotLoaded`] when no file exists there.
    pub fn new(model_path: impl Into<PathBuf>) -> Result<Self> {
        let model_path = model_path.into();
        if !model_path.is_file() {
            return Err(Error::ModelNotLoaded(model_path));
        }
        Ok(Self {
            model_path,
            loaded: None,
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn context_for(&mut self, device: Device) -> Result<&WhisperContext> {
        let needs_load = match &self.loaded {
            Some((loaded_device, _)) => *loaded_device != device,
            None => true,
        };

        if needs_load {
            debug!(model = %self.model_path.display(), %device, "loading whisper model");
            let mut ctx_params = WhisperContextParameters::default();
            ctx_params.use_gpu(device != Device::Cpu);

            let model_path = self.model_path.to_string_lossy();
            let ctx = WhisperContext::new_with_params(&model_path, ctx_params)
                .map_err(|e| load_failure(device, e.to_string()))?;
            self.loaded = Some((device, ctx));
        }

        Ok(&self
            .loaded
            .as_ref()
            .ok_or_else(|| Error::msg("whisper context missing after load"))?
            .1)
    }
}

impl TranscriptionBackend for LocalModelBackend {
    fn requires_device(&self) -> bool {
        true
    }

    fn transcribe(
        &mut self,
        source: &MediaSource,
        opts: &TranscribeOpts,
        cancel: &CancelToken,
        sink: &mut dyn SegmentSink,
    ) -> Result<()> {
        let device = opts.device.unwrap_or(Device::Cpu);
        let duration = source.duration_seconds;
        let ctx = self.context_for(device)?;

        // Decode on a worker thread so demux/resample overlaps inference.
        let (tx, rx) = mpsc::sync_channel::<Vec<f32>>(64);
        let path = source.path.clone();
        let decode_handle = std::thread::spawn(move || -> Result<()> {
            let mut chunk_sink = ChannelChunkSink { tx };
            audio::decode_to_mono_chunks(&path, CHUNK_FRAMES, &mut chunk_sink)
        });

        let mut window = InferenceWindow::new(ctx, opts, device, duration, cancel, sink);

        let mut run = || -> Result<()> {
            while let Ok(chunk) = rx.recv() {
                if !window.on_chunk(&chunk)? {
                    // Sink asked to stop: skip the end-of-stream flush.
                    return Ok(());
                }
            }
            window.finish()
        };
        let infer_res = run();

        // Dropping `rx` unblocks the decoder; its sink then stops cleanly.
        drop(rx);
        let decode_res = match decode_handle.join() {
            Ok(res) => res,
            Err(_) => Err(Error::msg("decoder thread panicked")),
        };

        // Prefer the inference error when both sides failed.
        match (infer_res, decode_res) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(err)) => Err(err),
            (Err(err), _) => Err(err),
        }
    }
}

/// Feeds decoded chunks into the inference side of the channel.
struct ChannelChunkSink {
    tx: mpsc::SyncSender<Vec<f32>>,
}

impl SampleSink for ChannelChunkSink {
    fn on_chunk(&mut self, samples: &[f32]) -> Result<bool> {
        // A closed channel means the consumer stopped (error or cancellation);
        // treat it as an early stop rather than a decode failure.
        Ok(self.tx.send(samples.to_vec()).is_ok())
    }
}

/// Sliding-window inference state over incoming samples.
struct InferenceWindow<'a> {
    ctx: &'a WhisperContext,
    opts: &'a TranscribeOpts,
    device: Device,
    duration_seconds: f64,
    cancel: &'a CancelToken,
    sink: &'a mut dyn SegmentSink,

    samples: Vec<f32>,
    head: usize,
    advanced_samples: usize,
    received_samples: usize,

    // Window length at which the next mid-stream inference runs; grows with
    // the window so whisper is not re-run on every small chunk.
    next_infer_at: usize,
}

/// Whether an inference pass may hold back the trailing (still growing)
/// segment or must flush everything it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flush {
    Held,
    Forced,
}

impl<'a> InferenceWindow<'a> {
    fn new(
        ctx: &'a WhisperContext,
        opts: &'a TranscribeOpts,
        device: Device,
        duration_seconds: f64,
        cancel: &'a CancelToken,
        sink: &'a mut dyn SegmentSink,
    ) -> Self {
        Self {
            ctx,
            opts,
            device,
            duration_seconds,
            cancel,
            sink,
            samples: Vec::new(),
            head: 0,
            advanced_samples: 0,
            received_samples: 0,
            next_infer_at: MIN_WINDOW_SAMPLES,
        }
    }

    fn on_chunk(&mut self, chunk: &[f32]) -> Result<bool> {
        self.cancel.checkpoint()?;

        self.samples.extend_from_slice(chunk);
        self.received_samples += chunk.len();

        if self.duration_seconds > 0.0 {
            let processed = self.received_samples as f64 / TARGET_SAMPLE_RATE as f64;
            self.sink
                .on_progress((processed / self.duration_seconds).min(1.0))?;
        }

        let win_len = self.window_len();
        if win_len >= MAX_WINDOW_SAMPLES {
            return self.run_inference(Flush::Forced);
        }
        if win_len >= self.next_infer_at {
            return self.run_inference(Flush::Held);
        }
        Ok(true)
    }

    fn finish(&mut self) -> Result<()> {
        while self.window_len() > 0 {
            self.cancel.checkpoint()?;
            if !self.run_inference(Flush::Forced)? {
                break;
            }
        }
        self.sink.on_progress(1.0)?;
        Ok(())
    }

    fn window_len(&self) -> usize {
        self.samples.len().saturating_sub(self.head)
    }

    /// Run whisper over the current window and emit finalized segments.
    ///
    /// Returns `Ok(false)` when the sink asked to stop.
    fn run_inference(&mut self, flush: Flush) -> Result<bool> {
        let win_len = self.window_len();
        if win_len == 0 {
            return Ok(true);
        }

        let window = &self.samples[self.head..];
        let state = run_whisper(self.ctx, self.opts, self.device, window)?;

        let segment_count = state.full_n_segments().max(0) as usize;
        let emit_count = emission_count(segment_count, flush);
        debug!(segment_count, emit_count, ?flush, "whisper window done");

        if segment_count == 0 {
            if flush == Flush::Forced {
                // Silence or noise: drop the whole window so we keep moving.
                self.advance(win_len);
            } else {
                self.next_infer_at = win_len + MIN_WINDOW_SAMPLES;
            }
            return Ok(true);
        }

        if emit_count == 0 {
            // One segment that may still grow: wait for more audio.
            self.next_infer_at = win_len + MIN_WINDOW_SAMPLES;
            return Ok(true);
        }

        let offset_seconds = self.advanced_samples as f64 / TARGET_SAMPLE_RATE as f64;
        let mut last_end_cs = 0i64;

        for idx in 0..emit_count {
            let whisper_segment = state
                .get_segment(idx as i32)
                .ok_or_else(|| Error::msg(format!("whisper segment {idx} was missing")))?;
            last_end_cs = whisper_segment.end_timestamp();

            let segment = convert_segment(&whisper_segment, offset_seconds)?;
            self.cancel.checkpoint()?;
            if !self.sink.on_segment(segment)? {
                return Ok(false);
            }
        }

        self.advance(advance_for_end(last_end_cs, win_len));
        self.next_infer_at = self.window_len() + MIN_WINDOW_SAMPLES;
        Ok(true)
    }

    fn advance(&mut self, samples: usize) {
        self.head += samples;
        self.advanced_samples += samples;

        // Compact once the consumed prefix dominates the buffer.
        if self.head >= TARGET_SAMPLE_RATE as usize || self.head >= self.samples.len() / 2 {
            self.samples.drain(..self.head);
            self.head = 0;
        }
    }
}

/// How many completed segments to emit from one inference pass.
///
/// Under [`Flush::Held`] the trailing segment may still grow as more audio
/// arrives, so it is withheld; a forced flush (window cap or end-of-stream)
/// emits everything.
fn emission_count(segment_count: usize, flush: Flush) -> usize {
    match flush {
        Flush::Forced => segment_count,
        Flush::Held => segment_count.saturating_sub(1),
    }
}

/// Samples to advance past, from whisper's end timestamp (centiseconds).
fn advance_for_end(end_timestamp_cs: i64, window_len: usize) -> usize {
    let end_cs = end_timestamp_cs.max(0) as usize;
    let mut samples = end_cs.saturating_mul(TARGET_SAMPLE_RATE as usize) / 100;
    // Degenerate zero-length segments must still make progress.
    if samples == 0 {
        samples = 1;
    }
    samples.min(window_len)
}

fn run_whisper(
    ctx: &WhisperContext,
    opts: &TranscribeOpts,
    device: Device,
    samples: &[f32],
) -> Result<WhisperState> {
    let mut params = FullParams::new(SamplingStrategy::BeamSearch {
        beam_size: 5,
        patience: 1.0,
    });

    params.set_n_threads(num_cpus::get() as i32);
    params.set_translate(false);
    params.set_language(opts.language_hint.as_deref());
    if let Some(prompt) = opts.initial_prompt.as_deref() {
        params.set_initial_prompt(prompt);
    }
    params.set_no_context(true);
    params.set_single_segment(false);

    params.set_print_progress(false);
    params.set_print_special(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);

    params.set_token_timestamps(true);

    let mut state = ctx
        .create_state()
        .map_err(|e| inference_failure(device, format!("failed to create whisper state: {e}")))?;

    state
        .full(params, samples)
        .map_err(|e| inference_failure(device, e.to_string()))?;

    Ok(state)
}

fn convert_segment(segment: &WhisperSegment, offset_seconds: f64) -> Result<TranscriptionSegment> {
    let text = segment
        .to_str()
        .map_err(|e| Error::msg(format!("failed to read segment text: {e}")))?
        .trim()
        .to_owned();

    let tokens = raw_tokens(segment)?;
    let words = group_tokens_into_words(&tokens, offset_seconds);

    Ok(TranscriptionSegment {
        start_seconds: centiseconds_to_seconds(segment.start_timestamp()) + offset_seconds,
        end_seconds: centiseconds_to_seconds(segment.end_timestamp()) + offset_seconds,
        text,
        words,
    })
}

struct RawToken {
    text: String,
    start_seconds: f64,
    end_seconds: f64,
}

fn raw_tokens(segment: &WhisperSegment) -> Result<Vec<RawToken>> {
    let count = segment.n_tokens().max(0) as usize;
    let mut tokens = Vec::with_capacity(count);

    for idx in 0..count {
        let token = segment
            .get_token(idx as i32)
            .ok_or_else(|| Error::msg(format!("whisper token {idx} was missing")))?;
        let data = token.token_data();
        let text = token
            .to_str()
            .map_err(|e| Error::msg(format!("failed to read token text: {e}")))?
            .to_owned();

        tokens.push(RawToken {
            text,
            // whisper uses -1 for unknown; clamp so consumers never see -0.01s
            start_seconds: centiseconds_to_seconds(data.t0),
            end_seconds: centiseconds_to_seconds(data.t1),
        });
    }

    Ok(tokens)
}

/// Assemble whisper's sub-word tokens into word-level spans.
///
/// Special/control tokens (`[_BEG_]`, `[_TT_50]`, ...) are dropped; a token
/// starting with whitespace begins a new word.
fn group_tokens_into_words(tokens: &[RawToken], offset_seconds: f64) -> Vec<WordSpan> {
    let mut words: Vec<WordSpan> = Vec::new();
    let mut current: Option<WordSpan> = None;

    for token in tokens {
        if token.text.starts_with("[_") && token.text.ends_with("_]") {
            continue;
        }

        let starts_word = token.text.starts_with(char::is_whitespace);
        if starts_word {
            if let Some(word) = current.take() {
                if !word.text.is_empty() {
                    words.push(word);
                }
            }
        }

        let piece = token.text.trim();
        if piece.is_empty() {
            continue;
        }

        match current.as_mut() {
            Some(word) => {
                word.text.push_str(piece);
                word.end_seconds = word.end_seconds.max(token.end_seconds + offset_seconds);
            }
            None => {
                current = Some(WordSpan {
                    start_seconds: token.start_seconds + offset_seconds,
                    end_seconds: token.end_seconds + offset_seconds,
                    text: piece.to_owned(),
                });
            }
        }
    }

    if let Some(word) = current {
        if !word.text.is_empty() {
            words.push(word);
        }
    }

    words
}

fn centiseconds_to_seconds(value: i64) -> f64 {
    if value < 0 { 0.0 } else { value as f64 / 100.0 }
}

fn load_failure(device: Device, message: String) -> Error {
    // A failed load on an accelerator is worth one CPU retry; on the CPU the
    // model file itself is the problem.
    if device == Device::Cpu {
        Error::msg(format!("failed to load whisper model: {message}"))
    } else {
        Error::DeviceError { device, message }
    }
}

fn inference_failure(device: Device, message: String) -> Error {
    let lowered = message.to_lowercase();
    if lowered.contains("memory") || lowered.contains("alloc") {
        Error::OutOfMemory(device)
    } else {
        Error::DeviceError { device, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_file_is_model_not_loaded() {
        let err = LocalModelBackend::new("/no/such/model.bin").unwrap_err();
        assert!(matches!(err, Error::ModelNotLoaded(_)));
    }

    #[test]
    fn emission_holds_back_trailing_segment_mid_stream() {
        assert_eq!(emission_count(0, Flush::Held), 0);
        assert_eq!(emission_count(1, Flush::Held), 0);
        assert_eq!(emission_count(3, Flush::Held), 2);
        assert_eq!(emission_count(3, Flush::Forced), 3);
        assert_eq!(emission_count(1, Flush::Forced), 1);
    }

    #[test]
    fn advance_clamps_to_window_and_always_moves() {
        assert_eq!(advance_for_end(100, 160_000), 16_000); // 1s
        assert_eq!(advance_for_end(0, 16_000), 1);
        assert_eq!(advance_for_end(-5, 16_000), 1);
        assert_eq!(advance_for_end(10_000, 16_000), 16_000); // past window end
    }

    #[test]
    fn tokens_group_into_words_on_leading_whitespace() {
        let tokens = vec![
            RawToken { text: "[_BEG_]".into(), start_seconds: 0.0, end_seconds: 0.0 },
            RawToken { text: " hel".into(), start_seconds: 0.1, end_seconds: 0.3 },
            RawToken { text: "lo".into(), start_seconds: 0.3, end_seconds: 0.5 },
            RawToken { text: " there".into(), start_seconds: 0.6, end_seconds: 0.9 },
        ];

        let words = group_tokens_into_words(&tokens, 0.0);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "hello");
        assert_eq!(words[0].start_seconds, 0.1);
        assert_eq!(words[0].end_seconds, 0.5);
        assert_eq!(words[1].text, "there");
    }

    #[test]
    fn word_grouping_applies_stream_offset() {
        let tokens = vec![RawToken { text: " hi".into(), start_seconds: 0.5, end_seconds: 1.0 }];
        let words = group_tokens_into_words(&tokens, 30.0);
        assert_eq!(words[0].start_seconds, 30.5);
        assert_eq!(words[0].end_seconds, 31.0);
    }

    #[test]
    fn failure_classification_flags_allocation_errors() {
        assert!(matches!(
            inference_failure(Device::Cuda, "failed to allocate buffer".into()),
            Error::OutOfMemory(Device::Cuda)
        ));
        assert!(matches!(
            inference_failure(Device::Cuda, "kernel launch failed".into()),
            Error::DeviceError { device: Device::Cuda, .. }
        ));
    }
}
