use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};

use subcue::backend::{BackendKind, TranscribeOpts};
use subcue::backends::local::LocalModelBackend;
use subcue::backends::remote::RemoteApiBackend;
use subcue::cue::CuePolicy;
use subcue::device::Device;
use subcue::job::{JobConfig, JobObserver, JobOutcome, TranscriptionJob};
use subcue::logging;
use subcue::segment::TranscriptionSegment;

fn main() -> Result<()> {
    logging::init();
    let params = Params::parse();

    let backend = build_backend(&params)?;
    let config = build_config(&params);

    let output = params
        .output
        .clone()
        .unwrap_or_else(|| default_output(&params.input));

    let job = TranscriptionJob::new(&params.input, backend, config);
    let mut observer = StderrProgress::default();
    let outcome = job
        .run(&mut observer)
        .with_context(|| format!("transcription of '{}' failed", params.input.display()))?;

    match outcome {
        JobOutcome::Completed(document) => {
            let srt = document.to_srt()?;
            std::fs::write(&output, srt)
                .with_context(|| format!("failed to write '{}'", output.display()))?;
            eprintln!("wrote {} cues to {}", document.len(), output.display());
            Ok(())
        }
        JobOutcome::Cancelled => {
            eprintln!("cancelled");
            Ok(())
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "subcue")]
#[command(about = "Transcribe audio/video into an SRT subtitle file")]
struct Params {
    /// Input media file (audio or video).
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Output SRT path. Defaults to the input path with `.srt` appended.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Transcription mode.
    #[arg(long = "mode", value_enum, default_value_t = Mode::Offline)]
    mode: Mode,

    /// Path to a whisper.cpp model file (offline mode).
    #[arg(short = 'm', long = "model")]
    model_path: Option<PathBuf>,

    /// API credential (online mode).
    #[arg(long = "api-key", env = "SUBCUE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Language hint, e.g. "en" or "de". Omit to auto-detect.
    #[arg(short = 'l', long = "language")]
    language: Option<String>,

    /// Priming text for names and domain vocabulary.
    #[arg(long = "initial-prompt")]
    initial_prompt: Option<String>,

    /// Pin local inference to a specific device instead of auto-selecting.
    #[arg(short = 'd', long = "device", value_enum)]
    device: Option<DeviceArg>,

    /// Minimum seconds a cue stays on screen.
    #[arg(long = "min-cue-seconds", default_value_t = 1.0)]
    min_cue_seconds: f64,

    /// Maximum words per subtitle line.
    #[arg(long = "max-words-per-line", default_value_t = 8)]
    max_words_per_line: usize,

    /// Maximum lines per cue; longer text splits into extra cues.
    #[arg(long = "max-lines", default_value_t = 1)]
    max_lines: usize,

    /// Fail immediately on an accelerator fault instead of retrying on CPU.
    #[arg(long = "no-cpu-fallback", default_value_t = false)]
    no_cpu_fallback: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Run a local whisper.cpp model.
    Offline,
    /// Use the hosted transcription API.
    Online,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceArg {
    Cpu,
    Cuda,
    Metal,
}

impl From<DeviceArg> for Device {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Cpu => Device::Cpu,
            DeviceArg::Cuda => Device::Cuda,
            DeviceArg::Metal => Device::Metal,
        }
    }
}

fn build_backend(params: &Params) -> Result<BackendKind> {
    match params.mode {
        Mode::Offline => {
            let Some(model_path) = &params.model_path else {
                bail!("offline mode requires --model");
            };
            Ok(BackendKind::Local(LocalModelBackend::new(model_path)?))
        }
        Mode::Online => {
            let Some(api_key) = &params.api_key else {
                bail!("online mode requires --api-key (or SUBCUE_API_KEY)");
            };
            Ok(BackendKind::Remote(RemoteApiBackend::new(api_key)?))
        }
    }
}

fn build_config(params: &Params) -> JobConfig {
    let mut config = JobConfig::new();
    config.opts = TranscribeOpts {
        device: params.device.map(Device::from),
        language_hint: normalize_language(params.language.as_deref()),
        initial_prompt: params.initial_prompt.clone(),
    };
    config.policy = CuePolicy {
        min_duration_seconds: params.min_cue_seconds,
        max_words_per_line: params.max_words_per_line,
        max_lines: params.max_lines,
        ..CuePolicy::default()
    };
    config.cpu_fallback = !params.no_cpu_fallback;
    config
}

fn normalize_language(language: Option<&str>) -> Option<String> {
    match language {
        None => None,
        Some(code) if code.eq_ignore_ascii_case("auto") => None,
        Some(code) => Some(code.to_owned()),
    }
}

fn default_output(input: &PathBuf) -> PathBuf {
    let mut name = input.as_os_str().to_owned();
    name.push(".srt");
    PathBuf::from(name)
}

/// Prints coarse progress to stderr without flooding it.
#[derive(Default)]
struct StderrProgress {
    last_percent: i32,
}

impl JobObserver for StderrProgress {
    fn on_progress(&mut self, fraction: f64) {
        let percent = (fraction * 100.0).round() as i32;
        if percent >= self.last_percent + 5 || percent == 100 && self.last_percent != 100 {
            self.last_percent = percent;
            eprint!("\rtranscribing... {percent:3}%");
            let _ = std::io::stderr().flush();
        }
    }

    fn on_segment(&mut self, _segment: &TranscriptionSegment) {}

    fn on_device_selected(&mut self, device: Device) {
        eprintln!("running local inference on {device}");
    }
}
