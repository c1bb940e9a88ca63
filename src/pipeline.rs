//! Per-item pipeline.
//!
//! A single item's 8 ordered stages, advancing through the `Stage` enum and
//! emitting a progress callback as a side effect of each transition — an
//! explicit per-item state machine rather than callback-driven progress
//! buried in one long async function. One call to `run_item` is one
//! attempt; the batch scheduler is responsible for retrying a whole attempt
//! on a retryable error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tracing::{info, warn};

use crate::error::DropcrateError;
use crate::model::{
    AudioFormat, Classification, DjTags, ExtractedInfo, ItemKind, LoudnessTarget,
    NormalizedMetadata, Outputs, ProcessingPreset, SidecarDocument, SidecarNormalize,
    SidecarProcessing, Stage, TrackRequest,
};
use crate::services::media_processor::{pick_best_thumbnail, sanitize_filename_component};
use crate::services::title_normalizer;
use crate::AppState;

const METADATA_TIMEOUT: Duration = Duration::from_secs(45);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// One attempt at running an item end to end. Returns the final `Outputs`
/// on success; on failure, returns the `DropcrateError` that becomes the
/// `item-error` payload (the scheduler decides whether to retry based on
/// its kind).
pub async fn run_item(
    state: &AppState,
    inbox_dir: &Path,
    req: &TrackRequest,
    preset: &ProcessingPreset,
    is_cancelled: &(dyn Fn() -> bool + Sync),
    mut on_stage: impl FnMut(Stage),
) -> Result<Outputs, DropcrateError> {
    check_cancelled(is_cancelled)?;
    on_stage(Stage::Metadata);
    let info = state
        .extractor
        .fetch_info(&req.url, METADATA_TIMEOUT, is_cancelled)
        .await?;

    let had_separator = title_normalizer::had_separator(info.title.as_deref().unwrap_or_default());
    let mut normalized = title_normalizer::normalize(info.title.as_deref(), info.uploader.as_deref());

    check_cancelled(is_cancelled)?;
    on_stage(Stage::Classify);
    let classification = classify(state, &req.id, &req.url, &info).await;
    let effective_tags = merge_dj_tags(&classification, &DjTags::default());

    check_cancelled(is_cancelled)?;
    on_stage(Stage::Download);
    let work_dir = inbox_dir.join(format!(".dropcrate_tmp_{}", info.source_id));
    fs::create_dir_all(&work_dir).await.map_err(|e| {
        DropcrateError::Internal {
            message: format!("failed to create working directory: {e}"),
        }
    })?;

    let result = run_remaining_stages(
        state,
        inbox_dir,
        &work_dir,
        req,
        preset,
        &info,
        &mut normalized,
        &effective_tags,
        had_separator,
        is_cancelled,
        &mut on_stage,
    )
    .await;

    let _ = fs::remove_dir_all(&work_dir).await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_remaining_stages(
    state: &AppState,
    inbox_dir: &Path,
    work_dir: &Path,
    req: &TrackRequest,
    preset: &ProcessingPreset,
    info: &ExtractedInfo,
    normalized: &mut NormalizedMetadata,
    effective_tags: &DjTags,
    had_separator: bool,
    is_cancelled: &(dyn Fn() -> bool + Sync),
    on_stage: &mut impl FnMut(Stage),
) -> Result<Outputs, DropcrateError> {
    use crate::services::extractor::DownloadMode;

    let downloaded_path = state
        .extractor
        .download_media(&req.url, DownloadMode::BestAudio, work_dir, DOWNLOAD_TIMEOUT, is_cancelled)
        .await?;

    check_cancelled(is_cancelled)?;
    on_stage(Stage::Fingerprint);
    let mut fingerprint_match = None;
    if state.fingerprint_matcher.is_available() {
        if let Some(matched) = state
            .fingerprint_matcher
            .match_audio(&downloaded_path, normalized, had_separator, is_cancelled)
            .await
        {
            normalized.artist = matched.artist.clone();
            normalized.title = matched.title.clone();
            normalized.album = matched.album.clone();
            normalized.year = matched.year;
            normalized.label = matched.label.clone();
            fingerprint_match = Some(matched);
        }
    }

    let sanitized_artist = sanitize_filename_component(&normalized.artist);
    let sanitized_title = sanitize_filename_component(&normalized.title);
    let base_name = format!("{sanitized_artist} - {sanitized_title}");

    let downloaded_ext = downloaded_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();

    let final_ext = if preset.normalize_enabled || preset.audio_format != AudioFormat::Auto {
        preset.audio_format.extension().to_string()
    } else {
        downloaded_ext.clone()
    };

    let tmp_output_path = inbox_dir.join(format!("{base_name}.tmp.{final_ext}"));

    if preset.normalize_enabled {
        check_cancelled(is_cancelled)?;
        on_stage(Stage::Normalize);
        state
            .media_processor
            .normalize(&downloaded_path, &tmp_output_path, preset.audio_format, preset.loudness, is_cancelled)
            .await?;
    } else if preset.audio_format != AudioFormat::Auto && downloaded_ext != final_ext {
        check_cancelled(is_cancelled)?;
        on_stage(Stage::Transcode);
        state
            .media_processor
            .transcode(&downloaded_path, &tmp_output_path, preset.audio_format, is_cancelled)
            .await?;
    } else {
        fs::rename(&downloaded_path, &tmp_output_path).await.map_err(|e| {
            DropcrateError::ProcessingError {
                step: crate::error::ProcessingStep::Finalize,
                message: format!("failed to move downloaded file into place: {e}"),
            }
        })?;
    }

    check_cancelled(is_cancelled)?;
    on_stage(Stage::Tag);
    let artwork_path = download_artwork(info, work_dir).await;
    let tags = build_tag_map(normalized, effective_tags, info, &req.url);
    state
        .media_processor
        .apply_tags_and_artwork(&tmp_output_path, &tags, artwork_path.as_deref(), is_cancelled)
        .await?;

    check_cancelled(is_cancelled)?;
    on_stage(Stage::Finalize);
    let final_path = inbox_dir.join(format!("{base_name}.{final_ext}"));
    fs::rename(&tmp_output_path, &final_path).await.map_err(|e| {
        DropcrateError::ProcessingError {
            step: crate::error::ProcessingStep::Finalize,
            message: format!("failed to rename finished file into place: {e}"),
        }
    })?;

    let sidecar = SidecarDocument {
        source_url: req.url.clone(),
        source_id: info.source_id.clone(),
        title: info.title.clone(),
        uploader: info.uploader.clone(),
        duration: info.duration_s,
        downloaded_at: chrono::Utc::now(),
        normalized: normalized.clone(),
        fingerprint_match,
        dj_defaults: effective_tags.clone(),
        processing: SidecarProcessing {
            audio_format: preset.audio_format,
            normalize: SidecarNormalize {
                enabled: preset.normalize_enabled,
                target_i: preset.loudness.i,
                target_tp: preset.loudness.tp,
                target_lra: preset.loudness.lra,
            },
        },
        outputs: Outputs {
            audio_path: Some(final_path.to_string_lossy().into_owned()),
            video_path: None,
        },
    };
    write_sidecar(inbox_dir, &base_name, &sidecar).await?;

    Ok(sidecar.outputs)
}

fn check_cancelled(is_cancelled: &(dyn Fn() -> bool + Sync)) -> Result<(), DropcrateError> {
    if is_cancelled() {
        Err(DropcrateError::Cancelled)
    } else {
        Ok(())
    }
}

/// Classify via the LLM when available, falling back to the deterministic
/// heuristic classifier on any LLM failure. Exposed crate-wide so the
/// synchronous classify-only endpoint can reuse exactly the same
/// LLM-with-heuristic-fallback decision this stage makes, rather than
/// reimplementing it.
pub(crate) async fn classify(state: &AppState, id: &str, url: &str, info: &ExtractedInfo) -> Classification {
    if state.llm_classifier.is_available() {
        let batch = [(id.to_string(), url.to_string(), info.clone())];
        if let Some(mut results) = state.llm_classifier.classify(&batch).await {
            if let Some((_, classification)) = results.drain(..).next() {
                return classification;
            }
        }
    }
    state.heuristic_classifier.classify(info)
}

/// Merge policy: `base` is the caller-supplied default DJ tags (empty
/// strings are the "unspecified" sentinel). Confidence below 0.6 never
/// overwrites; a non-track/non-set kind clears to the cleared defaults;
/// otherwise the classifier's non-empty fields win and empty fields keep
/// `base`'s value.
pub fn merge_dj_tags(classification: &Classification, base: &DjTags) -> DjTags {
    if classification.confidence < 0.6 {
        return base.clone();
    }
    if !matches!(classification.kind, ItemKind::Track | ItemKind::Set) {
        return DjTags::cleared();
    }
    let pick = |new: &str, old: &str| if new.is_empty() { old.to_string() } else { new.to_string() };
    DjTags {
        genre: pick(&classification.tags.genre, &base.genre),
        energy: pick(&classification.tags.energy, &base.energy),
        time: pick(&classification.tags.time, &base.time),
        vibe: pick(&classification.tags.vibe, &base.vibe),
    }
}

fn build_tag_map(
    normalized: &NormalizedMetadata,
    tags: &DjTags,
    info: &ExtractedInfo,
    source_url: &str,
) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("artist".to_string(), normalized.artist.clone());
    map.insert("title".to_string(), normalized.title.clone());
    if !tags.genre.is_empty() {
        map.insert("genre".to_string(), tags.genre.clone());
    }

    let comment = format!(
        "ENERGY: {energy}\nTIME: {time}\nVIBE: {vibe}\nSOURCE: YouTube\nURL: {url}\nYOUTUBE_ID: {id}",
        energy = tags.energy,
        time = tags.time,
        vibe = tags.vibe,
        url = info.webpage_url.as_deref().unwrap_or(source_url),
        id = info.source_id,
    );
    map.insert("comment".to_string(), comment);

    if let Some(album) = &normalized.album {
        map.insert("album".to_string(), album.clone());
    }
    if let Some(year) = normalized.year {
        map.insert("date".to_string(), year.to_string());
    }
    if let Some(label) = &normalized.label {
        map.insert("publisher".to_string(), label.clone());
    }

    map
}

/// Best-effort artwork download into the per-item working directory.
/// Artwork is never required for an item to succeed; failures are logged
/// and the item proceeds without embedded artwork.
async fn download_artwork(info: &ExtractedInfo, work_dir: &Path) -> Option<PathBuf> {
    let url = pick_best_thumbnail(&info.thumbnails)?;
    match reqwest::get(&url).await {
        Ok(response) if response.status().is_success() => match response.bytes().await {
            Ok(bytes) => {
                let path = work_dir.join("artwork.jpg");
                if let Err(e) = fs::write(&path, &bytes).await {
                    warn!(error = %e, "failed to write downloaded artwork");
                    return None;
                }
                Some(path)
            }
            Err(e) => {
                warn!(error = %e, "failed to read artwork response body");
                None
            }
        },
        Ok(response) => {
            warn!(status = %response.status(), "artwork download returned non-success status");
            None
        }
        Err(e) => {
            warn!(error = %e, "failed to download artwork");
            None
        }
    }
}

async fn write_sidecar(
    inbox_dir: &Path,
    base_name: &str,
    sidecar: &SidecarDocument,
) -> Result<(), DropcrateError> {
    let path = inbox_dir.join(format!("{base_name}.dropcrate.json"));
    let json = serde_json::to_vec_pretty(sidecar).map_err(|e| DropcrateError::Internal {
        message: format!("failed to serialize sidecar: {e}"),
    })?;
    fs::write(&path, json).await.map_err(|e| DropcrateError::Internal {
        message: format!("failed to write sidecar {}: {e}", path.display()),
    })?;
    info!(path = %path.display(), "wrote sidecar document");
    Ok(())
}

/// Loudness target used when a caller doesn't provide one for a CLI or
/// default-preset classify-only call. Exposed for the synchronous classify
/// endpoint, which never touches the filesystem.
pub fn default_loudness() -> LoudnessTarget {
    LoudnessTarget::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClassificationSource;

    fn classification(kind: ItemKind, confidence: f64, tags: DjTags) -> Classification {
        Classification {
            kind,
            tags,
            confidence,
            notes: String::new(),
            source: ClassificationSource::Heuristic,
        }
    }

    #[test]
    fn low_confidence_keeps_base_tags() {
        let base = DjTags {
            genre: "House".to_string(),
            energy: "3/5".to_string(),
            time: String::new(),
            vibe: String::new(),
        };
        let c = classification(
            ItemKind::Track,
            0.4,
            DjTags {
                genre: "Techno".to_string(),
                ..Default::default()
            },
        );
        let merged = merge_dj_tags(&c, &base);
        assert_eq!(merged, base);
    }

    #[test]
    fn non_track_kind_clears_tags() {
        let base = DjTags {
            genre: "House".to_string(),
            ..Default::default()
        };
        let c = classification(ItemKind::Video, 0.9, DjTags::default());
        let merged = merge_dj_tags(&c, &base);
        assert_eq!(merged, DjTags::cleared());
    }

    #[test]
    fn adopts_non_empty_fields_keeps_base_for_empty() {
        let base = DjTags {
            genre: "House".to_string(),
            energy: "3/5".to_string(),
            time: "Peak".to_string(),
            vibe: "Dark".to_string(),
        };
        let c = classification(
            ItemKind::Track,
            0.9,
            DjTags {
                genre: "Techno".to_string(),
                energy: String::new(),
                time: String::new(),
                vibe: String::new(),
            },
        );
        let merged = merge_dj_tags(&c, &base);
        assert_eq!(merged.genre, "Techno");
        assert_eq!(merged.energy, "3/5");
        assert_eq!(merged.time, "Peak");
        assert_eq!(merged.vibe, "Dark");
    }

    #[test]
    fn merge_is_idempotent() {
        let base = DjTags {
            genre: "House".to_string(),
            energy: String::new(),
            time: "Peak".to_string(),
            vibe: String::new(),
        };
        let c = classification(
            ItemKind::Track,
            0.9,
            DjTags {
                genre: "Techno".to_string(),
                energy: String::new(),
                time: String::new(),
                vibe: "Dark".to_string(),
            },
        );
        let once = merge_dj_tags(&c, &base);
        let twice = merge_dj_tags(&c, &once);
        assert_eq!(once, twice);
    }

    /// `write_sidecar` must produce a file readable back into the same
    /// `SidecarDocument` — the sidecar is the library's source of truth.
    /// Uses a throwaway directory so the test never touches a real inbox.
    #[tokio::test]
    async fn write_sidecar_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sidecar = SidecarDocument {
            source_url: "https://example.invalid/a".to_string(),
            source_id: "abc123".to_string(),
            title: Some("Losing It".to_string()),
            uploader: Some("FISHER".to_string()),
            duration: Some(180.0),
            downloaded_at: chrono::Utc::now(),
            normalized: NormalizedMetadata {
                artist: "Fisher".to_string(),
                title: "Losing It".to_string(),
                version: None,
                album: None,
                year: None,
                label: None,
            },
            fingerprint_match: None,
            dj_defaults: DjTags::default(),
            processing: SidecarProcessing {
                audio_format: AudioFormat::Aiff,
                normalize: SidecarNormalize {
                    enabled: true,
                    target_i: -14.0,
                    target_tp: -1.0,
                    target_lra: 11.0,
                },
            },
            outputs: Outputs {
                audio_path: Some("Fisher - Losing It.aiff".to_string()),
                video_path: None,
            },
        };

        write_sidecar(dir.path(), "Fisher - Losing It", &sidecar)
            .await
            .expect("write_sidecar");

        let bytes = std::fs::read(dir.path().join("Fisher - Losing It.dropcrate.json")).expect("read sidecar");
        let read_back: SidecarDocument = serde_json::from_slice(&bytes).expect("parse sidecar");
        assert_eq!(read_back.source_id, sidecar.source_id);
        assert_eq!(read_back.normalized.artist, "Fisher");
        assert_eq!(read_back.outputs.audio_path.as_deref(), Some("Fisher - Losing It.aiff"));
    }
}
