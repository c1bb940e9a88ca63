//! Invokes the external URL extractor (a yt-dlp-like CLI tool) for metadata
//! fetches and media downloads, with timeouts and a stderr-based error
//! taxonomy.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{DropcrateError, ExtractorErrorKind};
use crate::model::{ExtractedInfo, Thumbnail};
use crate::services::process;

const TITLE_MAX: usize = 220;
const DESCRIPTION_MAX: usize = 800;

/// The pipeline only ever downloads audio — normalize/transcode/tag are all
/// audio-only operations — so this is the only format expression the
/// extractor is ever asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    BestAudio,
}

impl DownloadMode {
    fn format_expression(self) -> &'static str {
        match self {
            DownloadMode::BestAudio => "bestaudio/best",
        }
    }
}

pub struct ExtractorDriver {
    extractor_path: String,
    config: Arc<Config>,
}

impl ExtractorDriver {
    pub fn new(extractor_path: String, config: Arc<Config>) -> Self {
        ExtractorDriver {
            extractor_path,
            config,
        }
    }

    /// Single-JSON metadata fetch: no playlist expansion, short socket
    /// timeout, minimal retries.
    pub async fn fetch_info(
        &self,
        url: &str,
        timeout: Duration,
        is_cancelled: &(dyn Fn() -> bool + Sync),
    ) -> Result<ExtractedInfo, DropcrateError> {
        let mut cmd = Command::new(&self.extractor_path);
        cmd.args([
            "--dump-single-json",
            "--no-playlist",
            "--socket-timeout",
            "10",
            "--retries",
            "1",
            "--no-warnings",
        ]);
        self.apply_cookie_options(&mut cmd);
        cmd.arg(url);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = run_with_timeout(cmd, timeout, is_cancelled).await?;

        if !output.status.success() {
            return Err(self.classify_stderr(&output.stderr));
        }

        let raw: RawExtractorInfo = serde_json::from_slice(&output.stdout).map_err(|e| {
            DropcrateError::ExtractorError {
                kind: ExtractorErrorKind::Unknown,
                message: format!("failed to parse extractor JSON output: {e}"),
                hint: None,
            }
        })?;

        Ok(raw.into_extracted_info())
    }

    /// Downloads into the per-item working directory and returns the path
    /// to the resulting file.
    pub async fn download_media(
        &self,
        url: &str,
        mode: DownloadMode,
        dest_dir: &Path,
        timeout: Duration,
        is_cancelled: &(dyn Fn() -> bool + Sync),
    ) -> Result<PathBuf, DropcrateError> {
        let output_template = dest_dir.join("%(id)s.%(ext)s");

        let mut cmd = Command::new(&self.extractor_path);
        cmd.args(["-f", mode.format_expression()])
            .args(["--no-playlist", "--no-warnings"])
            .args(["-o", &output_template.to_string_lossy()])
            .args(["--print", "after_move:filepath"]);
        self.apply_cookie_options(&mut cmd);
        cmd.arg(url);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = run_with_timeout(cmd, timeout, is_cancelled).await?;

        if !output.status.success() {
            return Err(self.classify_stderr(&output.stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let path = stdout
            .lines()
            .last()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| DropcrateError::ExtractorError {
                kind: ExtractorErrorKind::Unknown,
                message: "extractor produced no output file path".to_string(),
                hint: None,
            })?;

        Ok(PathBuf::from(path))
    }

    fn apply_cookie_options(&self, cmd: &mut Command) {
        if let Some(path) = &self.config.extractor_cookies_path {
            cmd.args(["--cookies", path]);
        } else if let Some(browser) = &self.config.extractor_cookies_from_browser {
            cmd.args(["--cookies-from-browser", browser]);
        }
    }

    fn classify_stderr(&self, stderr: &[u8]) -> DropcrateError {
        let text = String::from_utf8_lossy(stderr);
        let kind = ExtractorErrorKind::classify(&text);
        debug!(kind = ?kind, "classified extractor stderr");
        DropcrateError::ExtractorError {
            kind,
            message: first_meaningful_line(&text),
            hint: kind.hint().map(str::to_string),
        }
    }
}

async fn run_with_timeout(
    cmd: Command,
    timeout: Duration,
    is_cancelled: &(dyn Fn() -> bool + Sync),
) -> Result<std::process::Output, DropcrateError> {
    match process::run(cmd, Some(timeout), is_cancelled).await {
        Ok(process::Outcome::Output(output)) => Ok(output),
        Ok(process::Outcome::TimedOut) => {
            warn!("extractor invocation timed out; killing child process");
            Err(DropcrateError::ExtractorError {
                kind: ExtractorErrorKind::NetworkError,
                message: "extractor timed out".to_string(),
                hint: ExtractorErrorKind::NetworkError.hint().map(str::to_string),
            })
        }
        Ok(process::Outcome::Cancelled) => {
            warn!("extractor invocation cancelled; killing child process");
            Err(DropcrateError::ExtractorError {
                kind: ExtractorErrorKind::Cancelled,
                message: "extractor invocation cancelled".to_string(),
                hint: None,
            })
        }
        Err(e) => Err(DropcrateError::ExtractorError {
            kind: ExtractorErrorKind::Unknown,
            message: format!("failed to spawn extractor: {e}"),
            hint: None,
        }),
    }
}

fn first_meaningful_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("extractor failed with no error output")
        .to_string()
}

fn truncate(s: Option<String>, max: usize) -> Option<String> {
    s.map(|mut v| {
        if v.len() > max {
            v.truncate(max);
        }
        v
    })
}

#[derive(Debug, Deserialize)]
struct RawExtractorInfo {
    id: String,
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    webpage_url: Option<String>,
    description: Option<String>,
    #[serde(default)]
    thumbnails: Vec<RawThumbnail>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawThumbnail {
    url: String,
    width: Option<u32>,
    height: Option<u32>,
    preference: Option<i64>,
}

impl RawExtractorInfo {
    fn into_extracted_info(self) -> ExtractedInfo {
        ExtractedInfo {
            source_id: self.id,
            title: truncate(self.title, TITLE_MAX),
            uploader: self.uploader,
            duration_s: self.duration,
            webpage_url: self.webpage_url,
            description: truncate(self.description, DESCRIPTION_MAX),
            thumbnails: self
                .thumbnails
                .into_iter()
                .map(|t| Thumbnail {
                    url: t.url,
                    width: t.width,
                    height: t.height,
                    preference: t.preference,
                })
                .collect(),
            categories: self.categories,
            tags: self.tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_fields() {
        let long = "x".repeat(1000);
        assert_eq!(truncate(Some(long.clone()), TITLE_MAX).unwrap().len(), TITLE_MAX);
        assert_eq!(
            truncate(Some(long), DESCRIPTION_MAX).unwrap().len(),
            DESCRIPTION_MAX
        );
    }

    #[test]
    fn first_meaningful_line_skips_blank_trailing_lines() {
        let stderr = "ERROR: Private video. Sign in if you've been invited.\n\n";
        assert_eq!(
            first_meaningful_line(stderr),
            "ERROR: Private video. Sign in if you've been invited."
        );
    }

    #[test]
    fn download_mode_expressions() {
        assert_eq!(DownloadMode::BestAudio.format_expression(), "bestaudio/best");
    }
}
