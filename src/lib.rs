//! `subcue` — turn audio and video into editable SRT subtitles.
//!
//! This crate provides:
//! - Media probing and audio normalization
//! - Two interchangeable transcription engines (local whisper.cpp model, hosted API)
//! - Cue normalization (minimum durations, splitting, SRT timecodes)
//! - An editable subtitle document with SRT import/export
//! - A job runner that wires it all together with progress and cancellation
//!
//! The library is designed to sit behind interactive frontends and batch
//! tools alike, with an emphasis on incremental output, predictable failure
//! classes, and minimal surprises.

// High-level API (most consumers should start here).
pub mod job;

// Media ingestion and normalization.
pub mod audio;
pub mod probe;

// Compute device selection for local inference.
pub mod device;

// Transcription engines and their shared seam.
pub mod backend;
pub mod backends;

// Segment and cue data structures, normalization, and the editable document.
pub mod cue;
pub mod document;
pub mod segment;
pub mod timecode;

// Job-scoped cancellation.
pub mod cancel;

// Crate-wide error taxonomy.
pub mod error;

// Logging configuration and control.
#[cfg(feature = "logging")]
pub mod logging;

pub use crate::error::{Error, ErrorKind, Result};
