use std::path::PathBuf;

use thiserror::Error;

use crate::device::Device;

/// Subcue's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Subcue's crate-wide error type.
///
/// Variants are grouped by where they originate in the pipeline; [`Error::kind`]
/// collapses them into the coarse classes that drive retry and surfacing policy.
#[derive(Debug, Error)]
pub enum Error {
    // --- media ingestion ---
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("no decodable audio track in '{path}': {reason}")]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("could not parse media container: {0}")]
    CorruptMedia(String),

    // --- configuration ---
    #[error("no model installed at '{0}'")]
    ModelNotLoaded(PathBuf),

    #[error("an API credential is required for hosted transcription")]
    MissingCredential,

    // --- devices ---
    #[error("requested device {0} is unavailable on this machine")]
    DeviceUnavailable(Device),

    #[error("device {0} is already in use by another transcription job")]
    DeviceBusy(Device),

    #[error("device {device} rejected the workload: {message}")]
    DeviceError { device: Device, message: String },

    #[error("device {0} ran out of memory")]
    OutOfMemory(Device),

    // --- hosted backend ---
    #[error("the transcription API rejected the provided credentials")]
    InvalidCredentials,

    #[error("transcription API quota exceeded")]
    QuotaExceeded,

    #[error("transient backend failure after {attempts} attempt(s): {message}")]
    Transient { attempts: u32, message: String },

    // --- cue building and editing ---
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(f64),

    #[error("timing conflict: {0}")]
    TimingConflict(String),

    #[error("no cue at index {index} (document has {len})")]
    CueOutOfRange { index: usize, len: usize },

    #[error("malformed timecode '{0}'")]
    MalformedTimecode(String),

    // --- lifecycle ---
    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

/// Coarse error classification used by the job and surfaced to frontends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input file; the user must pick another file. Never retried.
    Input,
    /// Missing model or credential; the user must fix settings. Never retried.
    Config,
    /// Temporary backend or device fault; retried up to a bounded count.
    Transient,
    /// Unrecoverable failure; surfaced immediately, no retry.
    Fatal,
    /// User-initiated stop; not a failure.
    Cancelled,
}

impl Error {
    pub(crate) fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Classify this error for retry and reporting decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FileNotFound(_)
            | Self::UnsupportedFormat { .. }
            | Self::CorruptMedia(_)
            | Self::MalformedTimecode(_) => ErrorKind::Input,

            Self::ModelNotLoaded(_) | Self::MissingCredential => ErrorKind::Config,

            Self::DeviceError { .. } | Self::OutOfMemory(_) | Self::Transient { .. } => {
                ErrorKind::Transient
            }

            Self::DeviceUnavailable(_)
            | Self::DeviceBusy(_)
            | Self::InvalidCredentials
            | Self::QuotaExceeded
            | Self::InvalidTimestamp(_)
            | Self::TimingConflict(_)
            | Self::CueOutOfRange { .. }
            | Self::Io(_)
            | Self::Message(_) => ErrorKind::Fatal,

            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the job is allowed to retry after this error.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
