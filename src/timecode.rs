//! SRT timecode formatting and parsing (`HH:MM:SS,mmm`).

use crate::error::{Error, Result};

/// Reject times a correct backend should never produce.
///
/// Negative and non-finite values would otherwise format into nonsense
/// timecodes, so they surface as [`Error::InvalidTimestamp`] instead.
pub fn validate_seconds(seconds: f64) -> Result<()> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(Error::InvalidTimestamp(seconds));
    }
    Ok(())
}

/// Format seconds into an SRT timecode (`HH:MM:SS,mmm`).
///
/// Rounding policy: nearest millisecond, so repeated parse/format round trips
/// stay stable within 1 ms.
pub fn format_timecode(seconds: f64) -> Result<String> {
    validate_seconds(seconds)?;

    let total_ms = (seconds * 1000.0).round() as u64;

    let ms = total_ms % 1000;
    let total_s = total_ms / 1000;

    let s = total_s % 60;
    let total_m = total_s / 60;

    let m = total_m % 60;
    let h = total_m / 60;

    Ok(format!("{h:02}:{m:02}:{s:02},{ms:03}"))
}

/// Parse an SRT timecode into seconds.
///
/// Accepts a `.` millisecond separator as well as the canonical `,` because
/// hand-edited files frequently mix the two.
pub fn parse_timecode(timecode: &str) -> Result<f64> {
    let parts: Vec<&str> = timecode.trim().split([':', ',', '.']).collect();
    if parts.len() != 4 {
        return Err(Error::MalformedTimecode(timecode.to_owned()));
    }

    let field = |idx: usize| -> Result<u64> {
        parts[idx]
            .parse::<u64>()
            .map_err(|_| Error::MalformedTimecode(timecode.to_owned()))
    };

    let hours = field(0)?;
    let minutes = field(1)?;
    let seconds = field(2)?;
    let millis = field(3)?;

    if minutes >= 60 || seconds >= 60 || millis >= 1000 || parts[3].len() != 3 {
        return Err(Error::MalformedTimecode(timecode.to_owned()));
    }

    let total_ms = hours * 3_600_000 + minutes * 60_000 + seconds * 1_000 + millis;
    Ok(total_ms as f64 / 1000.0)
}
