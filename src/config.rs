//! Application configuration loaded from environment variables.

use std::env;

use anyhow::{Context, Result};

use crate::model::{AudioFormat, LoudnessTarget, ProcessingMode, ProcessingPreset};

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server listening port (`BRIDGE_PORT`).
    pub port: u16,

    /// Default output/watch directory (`INBOX_DIR`).
    pub inbox_dir: String,

    /// Explicit extractor binary override (`<EXTRACTOR>_PATH`, e.g. `YTDLP_PATH`).
    pub extractor_path: Option<String>,

    /// Explicit ffmpeg override (`FFMPEG_PATH`).
    pub ffmpeg_path: Option<String>,

    /// Explicit fingerprint-calculator override (`FPCALC_PATH`).
    pub fpcalc_path: Option<String>,

    /// Browser name for cookie extraction (`<EXTRACTOR>_COOKIES_FROM_BROWSER`).
    pub extractor_cookies_from_browser: Option<String>,

    /// Cookie file path (`<EXTRACTOR>_COOKIES_PATH`).
    pub extractor_cookies_path: Option<String>,

    /// AcoustID-style lookup API key (`ACOUSTID_KEY`). Fingerprint lookups
    /// are skipped entirely when absent.
    pub acoustid_key: Option<String>,

    /// Custom User-Agent for the metadata-resolution service (`MUSICBRAINZ_UA`).
    pub musicbrainz_ua: String,

    /// OpenAI-style API key (`OPENAI_API_KEY`). LLM classification falls
    /// back to the heuristic classifier when absent.
    pub openai_api_key: Option<String>,

    /// Chat-completions model name (`LLM_MODEL`).
    pub llm_model: Option<String>,

    /// Default max concurrent workers for the server (default 3).
    pub default_max_concurrent: usize,

    /// Default preset applied when a request doesn't supply one.
    pub default_preset: ProcessingPreset,
}

impl Config {
    /// Load configuration from environment variables, applying defaults
    /// and validating loudness ranges up front.
    pub fn from_env() -> Result<Self> {
        let port = env::var("BRIDGE_PORT")
            .unwrap_or_else(|_| "8787".to_string())
            .parse()
            .context("Invalid BRIDGE_PORT")?;

        let inbox_dir = env::var("INBOX_DIR").unwrap_or_else(|_| "./inbox".to_string());

        let default_max_concurrent = env::var("DEFAULT_MAX_CONCURRENT")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3)
            .clamp(1, 5);

        let loudness = LoudnessTarget {
            i: env_f64("DEFAULT_LUFS", -14.0)?,
            tp: env_f64("DEFAULT_TRUE_PEAK", -1.0)?,
            lra: env_f64("DEFAULT_LRA", 11.0)?,
        };
        loudness
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid default loudness target: {e}"))?;

        let default_preset = ProcessingPreset {
            mode: ProcessingMode::DjSafe,
            audio_format: AudioFormat::Aiff,
            normalize_enabled: true,
            loudness,
        };

        Ok(Self {
            port,
            inbox_dir,

            extractor_path: env::var("YTDLP_PATH").ok(),
            ffmpeg_path: env::var("FFMPEG_PATH").ok(),
            fpcalc_path: env::var("FPCALC_PATH").ok(),

            extractor_cookies_from_browser: env::var("YTDLP_COOKIES_FROM_BROWSER").ok(),
            extractor_cookies_path: env::var("YTDLP_COOKIES_PATH").ok(),

            acoustid_key: env::var("ACOUSTID_KEY").ok(),
            musicbrainz_ua: env::var("MUSICBRAINZ_UA")
                .unwrap_or_else(|_| format!("dropcrate/{} (+https://example.invalid)", env!("CARGO_PKG_VERSION"))),

            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            llm_model: env::var("LLM_MODEL").ok(),

            default_max_concurrent,
            default_preset,
        })
    }
}

fn env_f64(key: &str, default: f64) -> Result<f64> {
    match env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("Invalid {key}")),
        Err(_) => Ok(default),
    }
}
