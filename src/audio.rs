//! Audio normalization for transcription backends.
//!
//! Turns any decodable input into mono `f32` samples at [`TARGET_SAMPLE_RATE`],
//! delivered in bounded chunks so long media never occupies a single
//! unbounded buffer:
//!
//! - demux the container and pick the default audio track
//! - decode packets, skipping recoverable frame errors
//! - downmix to mono, resample when the source rate differs
//! - emit fixed-size chunks through a [`SampleSink`]

use std::fs::File;
use std::path::Path;

use rubato::{Resampler, SincFixedIn, WindowFunction};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Track};
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{Error, Result};

/// Sample rate every backend consumes (whisper.cpp's expected input).
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Receives normalized mono chunks as they are decoded.
///
/// Returning `Ok(false)` stops decoding early; the decoder treats it as a
/// clean end, not an error.
pub trait SampleSink {
    fn on_chunk(&mut self, samples: &[f32]) -> Result<bool>;
}

/// Decode `path` into mono chunks of at most `chunk_frames` samples at
/// [`TARGET_SAMPLE_RATE`], pushed into `sink` as they become available.
pub fn decode_to_mono_chunks(
    path: &Path,
    chunk_frames: usize,
    sink: &mut dyn SampleSink,
) -> Result<()> {
    let (mut format, track) = open_audio_stream(path)?;
    let track_id = track.id;

    let decoder_opts: DecoderOptions = Default::default();
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &decoder_opts)
        .map_err(|e| Error::CorruptMedia(format!("failed to create decoder: {e}")))?;

    let mut normalizer = MonoNormalizer::new();
    let mut stopped = false;

    while let Some(packet) = next_packet(&mut format)? {
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(buf) => buf,
            // Recoverable: corrupted frame, decoding can continue.
            Err(SymphoniaError::DecodeError(_)) => continue,
            // IO errors mid-stream are treated as end-of-stream.
            Err(SymphoniaError::IoError(_)) => break,
            Err(e) => return Err(Error::CorruptMedia(format!("decoder failure: {e}"))),
        };

        if !normalizer.push(&decoded, chunk_frames, sink)? {
            stopped = true;
            break;
        }
    }

    if !stopped {
        normalizer.finish(chunk_frames, sink)?;
    }
    Ok(())
}

/// Open the container at `path` and select its default audio track.
fn open_audio_stream(path: &Path) -> Result<(Box<dyn FormatReader>, Track)> {
    if !path.exists() {
        return Err(Error::FileNotFound(path.to_path_buf()));
    }
    let file = File::open(path)?;

    let mss = MediaSourceStream::new(
        Box::new(file),
        MediaSourceStreamOptions {
            buffer_len: 256 * 1024,
        },
    );

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let format_opts: FormatOptions = Default::default();
    let metadata_opts: MetadataOptions = Default::default();
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &format_opts, &metadata_opts)
        .map_err(|e| Error::CorruptMedia(e.to_string()))?;

    let format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
        .cloned()
        .ok_or_else(|| Error::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: "no audio track found".to_owned(),
        })?;

    Ok((format, track))
}

/// Read the next packet, treating IO errors as end-of-stream.
fn next_packet(
    format: &mut Box<dyn FormatReader>,
) -> Result<Option<symphonia::core::formats::Packet>> {
    match format.next_packet() {
        Ok(packet) => Ok(Some(packet)),
        Err(SymphoniaError::IoError(_)) => Ok(None),
        Err(e) => Err(Error::CorruptMedia(format!("failed reading packet: {e}"))),
    }
}

/// Source frames fed to rubato per `process()` call.
const RESAMPLE_BLOCK_FRAMES: usize = 2048;

/// Stateful converter from decoded PCM to mono samples at [`TARGET_SAMPLE_RATE`].
struct MonoNormalizer {
    // Scratch buffer for copying decoded PCM into interleaved f32.
    interleaved: Option<SampleBuffer<f32>>,

    // Lazily created; only needed when the source rate differs from the target.
    resampler: Option<SincFixedIn<f32>>,

    // Mono source samples waiting for a full resampler block.
    pending: Vec<f32>,
}

impl MonoNormalizer {
    fn new() -> Self {
        Self {
            interleaved: None,
            resampler: None,
            pending: Vec::new(),
        }
    }

    /// Push one decoded buffer through downmix/resample and emit full chunks.
    ///
    /// Returns `Ok(false)` when the sink requested an early stop.
    fn push(
        &mut self,
        decoded: &AudioBufferRef<'_>,
        chunk_frames: usize,
        sink: &mut dyn SampleSink,
    ) -> Result<bool> {
        let spec = *decoded.spec();
        let channels = spec.channels.count();
        if channels == 0 {
            return Err(Error::CorruptMedia("decoded audio had zero channels".into()));
        }

        if self.interleaved.is_none() {
            self.interleaved = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
        }
        let buf = self
            .interleaved
            .as_mut()
            .ok_or_else(|| Error::msg("sample buffer not initialized"))?;
        buf.copy_interleaved_ref(decoded.clone());

        let mono = downmix_to_mono(buf.samples(), channels);

        if spec.rate == TARGET_SAMPLE_RATE {
            return emit_chunks(&mono, chunk_frames, sink);
        }

        self.ensure_resampler(spec.rate)?;
        self.pending.extend_from_slice(&mono);
        self.drain_full_blocks(chunk_frames, sink)
    }

    /// Flush buffered samples at end-of-stream. No-op when no resampling was needed.
    fn finish(&mut self, chunk_frames: usize, sink: &mut dyn SampleSink) -> Result<()> {
        let Some(rs) = self.resampler.as_ref() else {
            return Ok(());
        };
        if self.pending.is_empty() {
            return Ok(());
        }

        // rubato wants exact block sizes; pad the tail with silence.
        let block = rs.input_frames_max();
        let rem = self.pending.len() % block;
        if rem != 0 {
            self.pending.resize(self.pending.len() + (block - rem), 0.0);
        }

        self.drain_full_blocks(chunk_frames, sink)?;
        Ok(())
    }

    fn ensure_resampler(&mut self, src_rate: u32) -> Result<()> {
        if self.resampler.is_some() {
            return Ok(());
        }

        let rs = SincFixedIn::<f32>::new(
            TARGET_SAMPLE_RATE as f64 / src_rate as f64,
            2.0,
            rubato::SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: rubato::SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            },
            RESAMPLE_BLOCK_FRAMES,
            1, // mono
        )
        .map_err(|e| Error::msg(format!("failed to init resampler: {e}")))?;

        self.resampler = Some(rs);
        Ok(())
    }

    fn drain_full_blocks(&mut self, chunk_frames: usize, sink: &mut dyn SampleSink) -> Result<bool> {
        loop {
            let rs = self
                .resampler
                .as_mut()
                .ok_or_else(|| Error::msg("resampler not initialized"))?;
            let block = rs.input_frames_max();
            if self.pending.len() < block {
                return Ok(true);
            }

            let input: Vec<f32> = self.pending.drain(..block).collect();
            let output = rs
                .process(&[input], None)
                .map_err(|e| Error::msg(format!("resampler process failed: {e}")))?;
            let mono_out = output
                .first()
                .ok_or_else(|| Error::msg("resampler produced no channels"))?;

            if !emit_chunks(mono_out, chunk_frames, sink)? {
                return Ok(false);
            }
        }
    }
}

/// Downmix interleaved samples by equal-weight channel averaging.
fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }

    let frames = interleaved.len() / channels;
    let mut mono = Vec::with_capacity(frames);
    for frame in 0..frames {
        let base = frame * channels;
        let sum: f32 = interleaved[base..base + channels].iter().sum();
        mono.push(sum / channels as f32);
    }
    mono
}

fn emit_chunks(samples: &[f32], chunk_frames: usize, sink: &mut dyn SampleSink) -> Result<bool> {
    for chunk in samples.chunks(chunk_frames) {
        if !sink.on_chunk(chunk)? {
            return Ok(false);
        }
    }
    Ok(true)
}
