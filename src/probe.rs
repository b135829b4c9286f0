//! Media inspection: container probing and audio track metadata.
//!
//! Probing is header-only — no audio payload is decoded — so it stays cheap
//! relative to the transcription itself. Anything without a decodable audio
//! track or a known positive duration is rejected here, before a backend is
//! ever dispatched.

use std::fs::File;
use std::path::{Path, PathBuf};

use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{Error, Result};

/// Metadata for a probed input file.
///
/// Created by [`probe`]; immutable; discarded when the job completes.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSource {
    pub path: PathBuf,
    /// Container format, as the lowercased file extension (e.g. `"mp4"`, `"wav"`).
    pub container: String,
    /// Codec short name reported by the decoder registry (e.g. `"pcm_s16le"`, `"aac"`).
    pub codec: String,
    pub sample_rate: u32,
    pub channels: usize,
    pub duration_seconds: f64,
}

/// Inspect `path` and return audio stream metadata.
///
/// Errors:
/// - [`Error::FileNotFound`] when the path does not exist
/// - [`Error::CorruptMedia`] when the container cannot be parsed
/// - [`Error::UnsupportedFormat`] when no decodable audio track with a known
///   sample rate, channel layout, and positive duration is present
pub fn probe(path: impl AsRef<Path>) -> Result<MediaSource> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::FileNotFound(path.to_path_buf()));
    }

    let file = File::open(path)?;

    let mss_opts = MediaSourceStreamOptions {
        // Symphonia expects a power-of-two buffer > 32KiB for good probing behavior.
        buffer_len: 256 * 1024,
    };
    let mss = MediaSourceStream::new(Box::new(file), mss_opts);

    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let mut hint = Hint::new();
    if !extension.is_empty() {
        hint.with_extension(&extension);
    }

    let format_opts: FormatOptions = Default::default();
    let metadata_opts: MetadataOptions = Default::default();

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &format_opts, &metadata_opts)
        .map_err(|e| Error::CorruptMedia(e.to_string()))?;

    let unsupported = |reason: &str| Error::UnsupportedFormat {
        path: path.to_path_buf(),
        reason: reason.to_owned(),
    };

    // Track selection policy: the first track that looks decodable (codec !=
    // NULL) and has a known sample rate, which downstream resampling requires.
    let track = probed
        .format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
        .cloned()
        .ok_or_else(|| unsupported("no audio track found"))?;

    let params = &track.codec_params;
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| unsupported("audio track has no sample rate"))?;
    let channels = params
        .channels
        .map(|c| c.count())
        .ok_or_else(|| unsupported("audio track has no channel layout"))?;
    if channels == 0 {
        return Err(unsupported("audio track reports zero channels"));
    }

    let duration_seconds = track_duration_seconds(params.n_frames, params.time_base, sample_rate)
        .ok_or_else(|| unsupported("audio track has no known duration"))?;
    if duration_seconds <= 0.0 {
        return Err(unsupported("audio track has zero duration"));
    }

    let codec = symphonia::default::get_codecs()
        .get_codec(params.codec)
        .map(|descriptor| descriptor.short_name.to_owned())
        .unwrap_or_else(|| "unknown".to_owned());

    Ok(MediaSource {
        path: path.to_path_buf(),
        container: extension,
        codec,
        sample_rate,
        channels,
        duration_seconds,
    })
}

fn track_duration_seconds(
    n_frames: Option<u64>,
    time_base: Option<symphonia::core::units::TimeBase>,
    sample_rate: u32,
) -> Option<f64> {
    let n_frames = n_frames?;

    if let Some(tb) = time_base {
        let time = tb.calc_time(n_frames);
        return Some(time.seconds as f64 + time.frac);
    }

    Some(n_frames as f64 / sample_rate as f64)
}
