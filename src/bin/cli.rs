//! dropcrate CLI binary: a one-job in-process batch run without the HTTP
//! surface.
//!
//! Shares the same `clap::Parser` derive conventions as the server binary's
//! configuration loading, composed with this crate's own scheduler/registry
//! so the CLI drives the exact same pipeline the server does.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use dropcrate::config::Config;
use dropcrate::model::{
    AudioFormat as ModelAudioFormat, Event, LoudnessTarget, ProcessingMode as ModelProcessingMode,
    ProcessingPreset, TrackRequest,
};
use dropcrate::scheduler::BatchScheduler;
use dropcrate::AppState;

#[derive(Parser, Debug)]
#[command(name = "dropcrate")]
#[command(about = "Fetch, classify, and publish DJ-ready audio from source URLs")]
#[command(version)]
struct Args {
    /// Source media URLs (1 to 10).
    #[arg(required = true, num_args = 1..=10)]
    urls: Vec<String>,

    /// Processing mode.
    #[arg(long, value_enum, default_value_t = Mode::DjSafe)]
    mode: Mode,

    /// Output audio format.
    #[arg(long = "audio-format", value_enum, default_value_t = Format::Aiff)]
    audio_format: Format,

    /// Enable loudness normalization (default: on for dj-safe, forced off for fast).
    #[arg(long = "normalize", overrides_with = "no_normalize")]
    normalize: bool,

    /// Disable loudness normalization.
    #[arg(long = "no-normalize", overrides_with = "normalize")]
    no_normalize: bool,

    /// Target integrated loudness in LUFS, range [-23, -8].
    #[arg(long, default_value_t = -14.0)]
    lufs: f64,

    /// Target true peak in dBTP, range [-5, 0].
    #[arg(long = "true-peak", default_value_t = -1.0)]
    true_peak: f64,

    /// Target loudness range in LU, range [5, 20].
    #[arg(long, default_value_t = 11.0)]
    lra: f64,

    /// Output/watch directory (overrides `INBOX_DIR`).
    #[arg(long)]
    inbox: Option<PathBuf>,

    /// Number of items processed concurrently, range [1, 5].
    #[arg(long, default_value_t = 1)]
    concurrent: usize,

    /// Per-item retry attempts for retryable extractor errors.
    #[arg(long, default_value_t = 2)]
    max_retries: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    DjSafe,
    Fast,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Aiff,
    Wav,
    Flac,
    Mp3,
    M4a,
    Auto,
}

impl From<Mode> for ModelProcessingMode {
    fn from(m: Mode) -> Self {
        match m {
            Mode::DjSafe => ModelProcessingMode::DjSafe,
            Mode::Fast => ModelProcessingMode::Fast,
        }
    }
}

impl From<Format> for ModelAudioFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Aiff => ModelAudioFormat::Aiff,
            Format::Wav => ModelAudioFormat::Wav,
            Format::Flac => ModelAudioFormat::Flac,
            Format::Mp3 => ModelAudioFormat::Mp3,
            Format::M4a => ModelAudioFormat::M4a,
            Format::Auto => ModelAudioFormat::Auto,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dropcrate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("startup failed: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(inbox) = &args.inbox {
        config.inbox_dir = inbox.to_string_lossy().into_owned();
    }
    config.default_max_concurrent = args.concurrent.clamp(1, 5);

    let loudness = LoudnessTarget {
        i: args.lufs,
        tp: args.true_peak,
        lra: args.lra,
    };
    if let Err(e) = loudness.validate() {
        eprintln!("invalid argument: {}", e.message());
        return ExitCode::FAILURE;
    }

    let preset = ProcessingPreset {
        mode: args.mode.into(),
        audio_format: args.audio_format.into(),
        normalize_enabled: !args.no_normalize,
        loudness,
    }
    .normalized();
    if let Err(e) = preset.validate() {
        eprintln!("invalid argument: {}", e.message());
        return ExitCode::FAILURE;
    }

    let state = match AppState::initialize(config).await {
        Ok(state) => state,
        Err(e) => {
            eprintln!("failed to resolve required tools: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let items: Vec<TrackRequest> = args
        .urls
        .iter()
        .enumerate()
        .map(|(i, url)| TrackRequest {
            id: (i + 1).to_string(),
            url: url.clone(),
            preset_snapshot: None,
        })
        .collect();

    let inbox_dir = PathBuf::from(&state.config.inbox_dir);
    if let Err(e) = tokio::fs::create_dir_all(&inbox_dir).await {
        eprintln!("failed to create inbox directory {}: {e}", inbox_dir.display());
        return ExitCode::FAILURE;
    }

    let job_id = state.registry.create_job();
    let (_history, mut events) = state
        .registry
        .subscribe(job_id)
        .expect("job was just created");

    let max_concurrent = state.config.default_max_concurrent;
    let max_retries = args.max_retries;
    let scheduler_state = state.clone();
    let scheduler_items = items;
    let scheduler_preset = preset;
    let scheduler_inbox = inbox_dir;
    let run = tokio::spawn(async move {
        let scheduler = BatchScheduler::new(scheduler_state);
        scheduler
            .run_batch(job_id, scheduler_inbox, scheduler_preset, scheduler_items, max_concurrent, max_retries)
            .await;
    });

    let mut any_errors = false;
    while let Ok(event) = events.recv().await {
        any_errors |= print_event(&event);
        if matches!(event, Event::QueueDone { .. }) {
            break;
        }
    }
    let _ = run.await;

    if any_errors {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Prints one line per event to stderr and returns whether it was an
/// `item-error`.
fn print_event(event: &Event) -> bool {
    match event {
        Event::QueueStart { .. } => {
            eprintln!("batch starting");
            false
        }
        Event::ItemStart { id } => {
            eprintln!("[{id}] starting");
            false
        }
        Event::ItemProgress { id, stage } => {
            eprintln!("[{id}] {stage:?}");
            false
        }
        Event::ItemDone { id, outputs } => {
            let path = outputs.audio_path.as_deref().unwrap_or("?");
            eprintln!("[{id}] done -> {path}");
            false
        }
        Event::ItemError { id, message, hint, .. } => {
            eprintln!(
                "[{id}] error: {message}{}",
                hint.as_deref().map(|h| format!(" ({h})")).unwrap_or_default()
            );
            true
        }
        Event::QueueCancelled { .. } => {
            eprintln!("batch cancelled");
            false
        }
        Event::QueueDone { .. } => {
            eprintln!("batch finished");
            false
        }
    }
}
