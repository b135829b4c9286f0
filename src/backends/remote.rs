//! Hosted transcription over an OpenAI-compatible `audio/transcriptions` API.
//!
//! Audio is normalized locally and shipped as WAV. Media longer than one
//! upload slice is sent as successive bounded slices with returned timestamps
//! offset accordingly, so neither memory nor request size grows with the
//! input. Transport faults and server errors retry with exponential backoff;
//! credential and quota failures surface immediately.

use std::io::Cursor;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::audio::{self, SampleSink, TARGET_SAMPLE_RATE};
use crate::backend::{SegmentSink, TranscribeOpts, TranscriptionBackend};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::probe::MediaSource;
use crate::segment::{TranscriptionSegment, WordSpan};

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/audio/transcriptions";
const DEFAULT_MODEL: &str = "whisper-1";

/// Total attempts per slice, including the first.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Seconds of audio per upload slice. At 16 kHz mono 16-bit this stays well
/// under common provider size limits.
const DEFAULT_SLICE_SECONDS: f64 = 600.0;

/// Transcription engine backed by a hosted speech-recognition API.
pub struct RemoteApiBackend {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_attempts: u32,
    backoff_base: Duration,
    slice_seconds: f64,
    retries: u32,
}

impl RemoteApiBackend {
    /// Create a backend for the default hosted endpoint.
    ///
    /// Fails with [`Error::MissingCredential`] when the key is empty: that is
    /// a settings problem the user has to fix, not something to retry.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(Error::MissingCredential);
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            api_key,
            model: DEFAULT_MODEL.to_owned(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_secs(1),
            slice_seconds: DEFAULT_SLICE_SECONDS,
            retries: 0,
        })
    }

    /// Point at a compatible self-hosted or proxy endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_slice_seconds(mut self, seconds: f64) -> Self {
        self.slice_seconds = seconds.max(1.0);
        self
    }

    /// Retries performed by the most recent [`TranscriptionBackend::transcribe`] call.
    pub fn retry_count(&self) -> u32 {
        self.retries
    }

    fn send_slice(&mut self, wav: &[u8], opts: &TranscribeOpts, cancel: &CancelToken) -> Result<ApiTranscription> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            cancel.checkpoint()?;

            let outcome = self.send_once(wav, opts);
            let message = match outcome {
                Ok(parsed) => return Ok(parsed),
                Err(SliceFailure::Fatal(err)) => return Err(err),
                Err(SliceFailure::Retryable(message)) => message,
            };

            if attempt >= self.max_attempts {
                return Err(Error::Transient {
                    attempts: attempt,
                    message,
                });
            }

            let delay = backoff_delay(self.backoff_base, attempt);
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "transient transcription API failure, retrying"
            );
            self.retries += 1;

            std::thread::sleep(delay);
        }
    }

    fn send_once(
        &self,
        wav: &[u8],
        opts: &TranscribeOpts,
    ) -> std::result::Result<ApiTranscription, SliceFailure> {
        let part = reqwest::blocking::multipart::Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| SliceFailure::Fatal(Error::msg(format!("invalid upload part: {e}"))))?;

        let mut form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "segment")
            .text("timestamp_granularities[]", "word");

        if let Some(language) = opts.language_hint.as_deref() {
            form = form.text("language", language.to_owned());
        }
        if let Some(prompt) = opts.initial_prompt.as_deref() {
            form = form.text("prompt", prompt.to_owned());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| SliceFailure::Retryable(format!("request failed: {e}")))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| SliceFailure::Retryable(format!("failed to read response body: {e}")))?;

        match classify_status(status) {
            StatusClass::Success => serde_json::from_str::<ApiTranscription>(&body)
                .map_err(|e| SliceFailure::Fatal(Error::msg(format!("unparseable API response: {e}")))),
            StatusClass::Retryable => {
                Err(SliceFailure::Retryable(format!("HTTP {status}: {}", truncate(&body))))
            }
            StatusClass::InvalidCredentials => Err(SliceFailure::Fatal(Error::InvalidCredentials)),
            StatusClass::QuotaExceeded => Err(SliceFailure::Fatal(Error::QuotaExceeded)),
            StatusClass::Fatal => Err(SliceFailure::Fatal(Error::msg(format!(
                "transcription API error (HTTP {status}): {}",
                truncate(&body)
            )))),
        }
    }
}

impl TranscriptionBackend for RemoteApiBackend {
    fn transcribe(
        &mut self,
        source: &MediaSource,
        opts: &TranscribeOpts,
        cancel: &CancelToken,
        sink: &mut dyn SegmentSink,
    ) -> Result<()> {
        self.retries = 0;

        let slice_frames = (self.slice_seconds * TARGET_SAMPLE_RATE as f64) as usize;
        let path = source.path.clone();

        let mut uploader = SliceUploader {
            backend: self,
            opts,
            cancel,
            sink,
            duration_seconds: source.duration_seconds,
            slice_frames,
            buf: Vec::new(),
            offset_seconds: 0.0,
            stopped: false,
        };

        audio::decode_to_mono_chunks(&path, TARGET_SAMPLE_RATE as usize, &mut uploader)?;
        uploader.flush()?;
        Ok(())
    }
}

/// Accumulates normalized audio and uploads one slice at a time.
struct SliceUploader<'a> {
    backend: &'a mut RemoteApiBackend,
    opts: &'a TranscribeOpts,
    cancel: &'a CancelToken,
    sink: &'a mut dyn SegmentSink,
    duration_seconds: f64,
    slice_frames: usize,
    buf: Vec<f32>,
    offset_seconds: f64,
    stopped: bool,
}

impl SliceUploader<'_> {
    fn upload(&mut self, samples: &[f32]) -> Result<bool> {
        self.cancel.checkpoint()?;

        let wav = encode_wav_slice(samples)?;
        let parsed = self.backend.send_slice(&wav, self.opts, self.cancel)?;

        for api_segment in &parsed.segments {
            let segment = api_segment.to_segment(&parsed.words, self.offset_seconds);
            self.cancel.checkpoint()?;
            if !self.sink.on_segment(segment)? {
                self.stopped = true;
                return Ok(false);
            }
        }

        self.offset_seconds += samples.len() as f64 / TARGET_SAMPLE_RATE as f64;
        if self.duration_seconds > 0.0 {
            self.sink
                .on_progress((self.offset_seconds / self.duration_seconds).min(1.0))?;
        }
        Ok(true)
    }

    fn flush(&mut self) -> Result<()> {
        if self.stopped || self.buf.is_empty() {
            return Ok(());
        }
        let remainder = std::mem::take(&mut self.buf);
        self.upload(&remainder)?;
        self.sink.on_progress(1.0)?;
        Ok(())
    }
}

impl SampleSink for SliceUploader<'_> {
    fn on_chunk(&mut self, samples: &[f32]) -> Result<bool> {
        self.cancel.checkpoint()?;
        self.buf.extend_from_slice(samples);

        while self.buf.len() >= self.slice_frames {
            let slice: Vec<f32> = self.buf.drain(..self.slice_frames).collect();
            if !self.upload(&slice)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

enum SliceFailure {
    /// Worth another attempt after backoff.
    Retryable(String),
    /// Surfaced immediately, no retry.
    Fatal(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Success,
    Retryable,
    InvalidCredentials,
    QuotaExceeded,
    Fatal,
}

/// Retry policy by HTTP status.
///
/// 429 maps to the quota failure class: providers bill quota through it, and
/// hammering a metered endpoint on a bounded timer helps nobody. 5xx and
/// transport-level failures are the retryable class.
fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        401 | 403 => StatusClass::InvalidCredentials,
        429 => StatusClass::QuotaExceeded,
        500..=599 => StatusClass::Retryable,
        _ => StatusClass::Fatal,
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << (attempt - 1).min(8);
    base.saturating_mul(factor)
}

/// Package mono samples as an in-memory 16-bit WAV.
fn encode_wav_slice(samples: &[f32]) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| Error::msg(format!("failed to start WAV slice: {e}")))?;
        for &sample in samples {
            let pcm = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(pcm)
                .map_err(|e| Error::msg(format!("failed to write WAV slice: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| Error::msg(format!("failed to finalize WAV slice: {e}")))?;
    }
    Ok(cursor.into_inner())
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 300;
    if body.chars().count() <= LIMIT {
        body.to_owned()
    } else {
        body.chars().take(LIMIT).collect()
    }
}

/// `verbose_json` response shape, reduced to the fields we consume.
#[derive(Debug, Deserialize)]
struct ApiTranscription {
    #[serde(default)]
    segments: Vec<ApiSegment>,
    #[serde(default)]
    words: Vec<ApiWord>,
}

#[derive(Debug, Deserialize)]
struct ApiSegment {
    start: f64,
    end: f64,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiWord {
    word: String,
    start: f64,
    end: f64,
}

impl ApiSegment {
    fn to_segment(&self, words: &[ApiWord], offset_seconds: f64) -> TranscriptionSegment {
        let spans = words
            .iter()
            .filter(|w| w.start >= self.start && w.end <= self.end)
            .map(|w| WordSpan {
                start_seconds: w.start + offset_seconds,
                end_seconds: w.end + offset_seconds,
                text: w.word.trim().to_owned(),
            })
            .collect();

        TranscriptionSegment {
            start_seconds: self.start + offset_seconds,
            end_seconds: self.end + offset_seconds,
            text: self.text.trim().to_owned(),
            words: spans,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    #[test]
    fn empty_credential_is_rejected_up_front() {
        assert!(matches!(
            RemoteApiBackend::new(""),
            Err(Error::MissingCredential)
        ));
        assert!(matches!(
            RemoteApiBackend::new("   "),
            Err(Error::MissingCredential)
        ));
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(classify_status(200), StatusClass::Success);
        assert_eq!(classify_status(503), StatusClass::Retryable);
        assert_eq!(classify_status(500), StatusClass::Retryable);
        assert_eq!(classify_status(401), StatusClass::InvalidCredentials);
        assert_eq!(classify_status(403), StatusClass::InvalidCredentials);
        assert_eq!(classify_status(429), StatusClass::QuotaExceeded);
        assert_eq!(classify_status(400), StatusClass::Fatal);
        assert_eq!(classify_status(404), StatusClass::Fatal);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(400));
    }

    #[test]
    fn wav_slice_round_trips_through_hound() {
        let samples = vec![0.0f32, 0.25, -0.25, 1.0, -1.0];
        let wav = encode_wav_slice(&samples).unwrap();

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, TARGET_SAMPLE_RATE);
        assert_eq!(reader.len() as usize, samples.len());
    }

    #[test]
    fn words_attach_to_their_containing_segment() {
        let words = vec![
            ApiWord { word: "hi".into(), start: 0.1, end: 0.4 },
            ApiWord { word: "there".into(), start: 0.5, end: 0.9 },
            ApiWord { word: "later".into(), start: 2.0, end: 2.5 },
        ];
        let segment = ApiSegment { start: 0.0, end: 1.0, text: " hi there".into() };

        let converted = segment.to_segment(&words, 10.0);
        assert_eq!(converted.text, "hi there");
        assert_eq!(converted.words.len(), 2);
        assert_eq!(converted.start_seconds, 10.0);
        assert_eq!(converted.words[1].start_seconds, 10.5);
    }

    // --- retry integration against a canned local HTTP responder ---

    struct Collected {
        segments: Vec<TranscriptionSegment>,
    }

    impl SegmentSink for Collected {
        fn on_segment(&mut self, segment: TranscriptionSegment) -> Result<bool> {
            self.segments.push(segment);
            Ok(true)
        }
    }

    /// Serve `responses` one per connection, reading each request fully first.
    fn serve_canned(listener: TcpListener, responses: Vec<(u16, String)>) {
        for (status, body) in responses {
            let (stream, _) = match listener.accept() {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let mut reader = BufReader::new(stream);

            let mut content_length: Option<usize> = None;
            let mut chunked = false;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                let lowered = line.to_lowercase();
                if let Some(value) = lowered.strip_prefix("content-length:") {
                    content_length = value.trim().parse().ok();
                }
                if lowered.starts_with("transfer-encoding:") && lowered.contains("chunked") {
                    chunked = true;
                }
                if line == "\r\n" {
                    break;
                }
            }

            if let Some(len) = content_length {
                let mut body_buf = vec![0u8; len];
                let _ = reader.read_exact(&mut body_buf);
            } else if chunked {
                // Drain chunks until the zero-length terminator.
                let mut tail: Vec<u8> = Vec::new();
                let mut byte = [0u8; 1];
                while reader.read_exact(&mut byte).is_ok() {
                    tail.push(byte[0]);
                    if tail.ends_with(b"\r\n0\r\n\r\n") {
                        break;
                    }
                }
            }

            let reason = if status == 200 { "OK" } else { "Service Unavailable" };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let mut stream = reader.into_inner();
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        }
    }

    fn write_short_wav(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("clip.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: TARGET_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..8_000 {
            writer.write_sample(((i % 64) * 256) as i16).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    fn media_source_for(path: std::path::PathBuf) -> MediaSource {
        MediaSource {
            path,
            container: "wav".into(),
            codec: "pcm_s16le".into(),
            sample_rate: TARGET_SAMPLE_RATE,
            channels: 1,
            duration_seconds: 0.5,
        }
    }

    const SUCCESS_BODY: &str = r#"{
        "task": "transcribe",
        "language": "en",
        "duration": 0.5,
        "text": "hi there",
        "segments": [{"id": 0, "start": 0.0, "end": 0.5, "text": " hi there"}],
        "words": [{"word": "hi", "start": 0.0, "end": 0.2}, {"word": "there", "start": 0.2, "end": 0.5}]
    }"#;

    #[test]
    fn two_503s_then_success_records_two_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}/v1/audio/transcriptions", listener.local_addr().unwrap());
        let server = std::thread::spawn(move || {
            serve_canned(
                listener,
                vec![
                    (503, "{\"error\": \"overloaded\"}".to_owned()),
                    (503, "{\"error\": \"overloaded\"}".to_owned()),
                    (200, SUCCESS_BODY.to_owned()),
                ],
            );
        });

        let dir = tempfile::tempdir().unwrap();
        let source = media_source_for(write_short_wav(&dir));

        let mut backend = RemoteApiBackend::new("test-key")
            .unwrap()
            .with_endpoint(endpoint)
            .with_backoff_base(Duration::from_millis(1));

        let mut sink = Collected { segments: Vec::new() };
        backend
            .transcribe(&source, &TranscribeOpts::default(), &CancelToken::new(), &mut sink)
            .unwrap();
        server.join().unwrap();

        assert_eq!(backend.retry_count(), 2);
        assert_eq!(sink.segments.len(), 1);
        assert_eq!(sink.segments[0].text, "hi there");
        assert_eq!(sink.segments[0].words.len(), 2);
    }

    #[test]
    fn persistent_503_exhausts_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}/v1/audio/transcriptions", listener.local_addr().unwrap());
        let server = std::thread::spawn(move || {
            serve_canned(
                listener,
                vec![
                    (503, "{}".to_owned()),
                    (503, "{}".to_owned()),
                    (503, "{}".to_owned()),
                ],
            );
        });

        let dir = tempfile::tempdir().unwrap();
        let source = media_source_for(write_short_wav(&dir));

        let mut backend = RemoteApiBackend::new("test-key")
            .unwrap()
            .with_endpoint(endpoint)
            .with_backoff_base(Duration::from_millis(1));

        let mut sink = Collected { segments: Vec::new() };
        let err = backend
            .transcribe(&source, &TranscribeOpts::default(), &CancelToken::new(), &mut sink)
            .unwrap_err();
        server.join().unwrap();

        assert!(matches!(err, Error::Transient { attempts: 3, .. }), "got {err:?}");
        assert!(sink.segments.is_empty());
    }

    #[test]
    fn auth_failure_fails_fast_without_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}/v1/audio/transcriptions", listener.local_addr().unwrap());
        let server = std::thread::spawn(move || {
            serve_canned(listener, vec![(401, "{\"error\": \"bad key\"}".to_owned())]);
        });

        let dir = tempfile::tempdir().unwrap();
        let source = media_source_for(write_short_wav(&dir));

        let mut backend = RemoteApiBackend::new("bad-key")
            .unwrap()
            .with_endpoint(endpoint)
            .with_backoff_base(Duration::from_millis(1));

        let mut sink = Collected { segments: Vec::new() };
        let err = backend
            .transcribe(&source, &TranscribeOpts::default(), &CancelToken::new(), &mut sink)
            .unwrap_err();
        server.join().unwrap();

        assert!(matches!(err, Error::InvalidCredentials));
        assert_eq!(backend.retry_count(), 0);
    }
}
