//! Media processor.
//!
//! Runs ffmpeg for two-pass loudness normalization, single-pass transcode,
//! and tag/artwork embedding, committing via temp-file-then-atomic-rename.
//! The measurement pass parses ffmpeg's `-print_format json` stderr output
//! the same way an ffprobe JSON parse would.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DropcrateError, ProcessingStep};
use crate::model::{AudioFormat, LoudnessTarget};
use crate::services::process;

pub struct MediaProcessor {
    ffmpeg_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LoudnormMeasurement {
    #[serde(rename = "input_i")]
    input_i: String,
    #[serde(rename = "input_tp")]
    input_tp: String,
    #[serde(rename = "input_lra")]
    input_lra: String,
    #[serde(rename = "input_thresh")]
    input_thresh: String,
    #[serde(rename = "target_offset")]
    target_offset: String,
}

impl MediaProcessor {
    pub fn new(ffmpeg_path: String) -> Self {
        MediaProcessor { ffmpeg_path }
    }

    /// `normalize(inputPath, outputPath, format, target)`: two-pass
    /// EBU R128 loudness normalization via ffmpeg's `loudnorm` filter.
    /// ffmpeg calls carry no hard timeout, but `is_cancelled` is polled
    /// against the running child so a cancelled job doesn't leave ffmpeg
    /// running after the pipeline has moved on.
    pub async fn normalize(
        &self,
        input_path: &Path,
        output_path: &Path,
        format: AudioFormat,
        target: LoudnessTarget,
        is_cancelled: &(dyn Fn() -> bool + Sync),
    ) -> Result<(), DropcrateError> {
        let measurement = self.measure_loudness(input_path, target, is_cancelled).await?;

        let codec = format
            .codec()
            .ok_or_else(|| processing_error(ProcessingStep::Normalize, "format=auto is not valid for normalize"))?;

        let filter = format!(
            "loudnorm=I={i}:TP={tp}:LRA={lra}:measured_I={mi}:measured_TP={mtp}:measured_LRA={mlra}:measured_thresh={mthresh}:offset={offset}:linear=true:print_format=summary",
            i = target.i,
            tp = target.tp,
            lra = target.lra,
            mi = measurement.input_i,
            mtp = measurement.input_tp,
            mlra = measurement.input_lra,
            mthresh = measurement.input_thresh,
            offset = measurement.target_offset,
        );

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-y", "-i"])
            .arg(input_path)
            .args(["-af", &filter])
            .args(["-ar", "44100", "-vn", "-acodec", codec])
            .arg(output_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        run_ffmpeg(cmd, ProcessingStep::Normalize, is_cancelled).await
    }

    async fn measure_loudness(
        &self,
        input_path: &Path,
        target: LoudnessTarget,
        is_cancelled: &(dyn Fn() -> bool + Sync),
    ) -> Result<LoudnormMeasurement, DropcrateError> {
        let filter = format!(
            "loudnorm=I={}:TP={}:LRA={}:print_format=json",
            target.i, target.tp, target.lra
        );

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-i"])
            .arg(input_path)
            .args(["-af", &filter])
            .args(["-f", "null", "-"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(path = %input_path.display(), "measuring loudness (pass 1)");
        let output = match process::run(cmd, None, is_cancelled)
            .await
            .map_err(|e| processing_error(ProcessingStep::Normalize, format!("failed to spawn ffmpeg: {e}")))?
        {
            process::Outcome::Output(output) => output,
            process::Outcome::Cancelled => {
                return Err(DropcrateError::Cancelled);
            }
            process::Outcome::TimedOut => unreachable!("measure_loudness runs with no timeout"),
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        parse_last_json_object(&stderr)
            .with_context(|| "failed to locate loudnorm JSON in ffmpeg stderr".to_string())
            .and_then(|json| serde_json::from_str(&json).context("failed to parse loudnorm measurement JSON"))
            .map_err(|e| processing_error(ProcessingStep::Normalize, e.to_string()))
    }

    /// `transcode(inputPath, outputPath, format)`: one-pass
    /// audio-only transcode with the same codec table as `normalize`.
    pub async fn transcode(
        &self,
        input_path: &Path,
        output_path: &Path,
        format: AudioFormat,
        is_cancelled: &(dyn Fn() -> bool + Sync),
    ) -> Result<(), DropcrateError> {
        let codec = format
            .codec()
            .ok_or_else(|| processing_error(ProcessingStep::Transcode, "format=auto is not valid for transcode"))?;

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-y", "-i"])
            .arg(input_path)
            .args(["-ar", "44100", "-vn", "-acodec", codec])
            .arg(output_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        run_ffmpeg(cmd, ProcessingStep::Transcode, is_cancelled).await
    }

    /// `applyTagsAndArtwork(mediaPath, ext, tags, artworkPath?)`:
    /// remuxes in place via temp+rename, writing container-global and
    /// stream-level metadata, and mapping artwork as an MJPEG
    /// `attached_pic` stream when present.
    pub async fn apply_tags_and_artwork(
        &self,
        media_path: &Path,
        tags: &HashMap<String, String>,
        artwork_path: Option<&Path>,
        is_cancelled: &(dyn Fn() -> bool + Sync),
    ) -> Result<(), DropcrateError> {
        let ext = media_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();

        let tmp_path = media_path.with_file_name(format!(
            ".dropcrate_tag_{}.{}",
            Uuid::new_v4(),
            ext
        ));

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-y", "-i"]).arg(media_path);

        if let Some(artwork) = artwork_path {
            cmd.args(["-i"]).arg(artwork);
            cmd.args(["-map", "0:a", "-map", "1:v"]);
            cmd.args(["-c:v", "mjpeg", "-disposition:v", "attached_pic"]);
            cmd.args(["-metadata:s:v", "title=Album cover"]);
            cmd.args(["-metadata:s:v", "comment=Cover (front)"]);
        } else {
            cmd.args(["-map", "0:a"]);
        }

        cmd.arg("-c:a").arg("copy");

        for (key, value) in tags {
            cmd.args(["-metadata", &format!("{key}={value}")]);
            cmd.args(["-metadata:s:a:0", &format!("{key}={value}")]);
        }

        match ext.as_str() {
            "mp3" => {
                cmd.args(["-id3v2_version", "3"]);
            }
            "aiff" | "wav" => {
                cmd.args(["-write_id3v2", "1"]);
            }
            _ => {}
        }

        cmd.arg(&tmp_path).stdout(Stdio::piped()).stderr(Stdio::piped());

        let result = run_ffmpeg(cmd, ProcessingStep::Tag, is_cancelled).await;
        match result {
            Ok(()) => {
                fs::rename(&tmp_path, media_path).await.map_err(|e| {
                    processing_error(
                        ProcessingStep::Tag,
                        format!("failed to rename tagged file into place: {e}"),
                    )
                })?;
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(e)
            }
        }
    }
}

async fn run_ffmpeg(
    cmd: Command,
    step: ProcessingStep,
    is_cancelled: &(dyn Fn() -> bool + Sync),
) -> Result<(), DropcrateError> {
    let output = match process::run(cmd, None, is_cancelled)
        .await
        .map_err(|e| processing_error(step, format!("failed to spawn ffmpeg: {e}")))?
    {
        process::Outcome::Output(output) => output,
        process::Outcome::Cancelled => return Err(DropcrateError::Cancelled),
        process::Outcome::TimedOut => unreachable!("run_ffmpeg runs with no timeout"),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(processing_error(
            step,
            format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.lines().last().unwrap_or("no error output").trim()
            ),
        ));
    }

    info!(?step, "ffmpeg stage complete");
    Ok(())
}

fn processing_error(step: ProcessingStep, message: impl Into<String>) -> DropcrateError {
    DropcrateError::ProcessingError {
        step,
        message: message.into(),
    }
}

/// ffmpeg's `loudnorm` filter, in JSON-print mode, can emit more than one
/// JSON object on stderr (progress lines interleave); correctness requires parsing
/// the *last* one.
fn parse_last_json_object(stderr: &str) -> Result<String> {
    let mut depth = 0i32;
    let mut start = None;
    let mut last_object: Option<String> = None;

    for (idx, ch) in stderr.char_indices() {
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        last_object = Some(stderr[s..=idx].to_string());
                    }
                }
            }
            _ => {}
        }
    }

    last_object.context("no JSON object found in ffmpeg stderr")
}

/// Pick the best thumbnail by `max(width*height + preference)`, falling
/// back to a plain `thumbnail` URL.
pub fn pick_best_thumbnail(thumbnails: &[crate::model::Thumbnail]) -> Option<String> {
    thumbnails
        .iter()
        .max_by_key(|t| {
            let area = t.width.unwrap_or(0) as i64 * t.height.unwrap_or(0) as i64;
            area + t.preference.unwrap_or(0)
        })
        .map(|t| t.url.clone())
}

/// Final filename sanitation, shared with the pipeline's finalize
/// stage.
pub fn sanitize_filename_component(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            other => other,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(|c: char| c == '.' || c == ' ')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Thumbnail;

    #[test]
    fn parses_last_json_object_when_multiple_present() {
        let stderr = "progress {\"fraction\": 0.5}\nfinal {\"input_i\": \"-20.0\", \"input_tp\": \"-3.0\", \"input_lra\": \"5.0\", \"input_thresh\": \"-30.0\", \"target_offset\": \"1.0\"}";
        let json = parse_last_json_object(stderr).unwrap();
        let parsed: LoudnormMeasurement = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.input_i, "-20.0");
    }

    #[test]
    fn sanitizes_reserved_characters() {
        assert_eq!(
            sanitize_filename_component("A/B: C*D?  "),
            "A B C D"
        );
    }

    #[test]
    fn picks_thumbnail_by_area_plus_preference() {
        let thumbs = vec![
            Thumbnail {
                url: "small".into(),
                width: Some(100),
                height: Some(100),
                preference: Some(0),
            },
            Thumbnail {
                url: "big".into(),
                width: Some(1000),
                height: Some(1000),
                preference: Some(0),
            },
        ];
        assert_eq!(pick_best_thumbnail(&thumbs).unwrap(), "big");
    }
}
