//! Transcription engine implementations.

pub mod local;
pub mod mock;
pub mod remote;
