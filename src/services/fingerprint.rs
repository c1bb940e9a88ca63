//! Fingerprint matcher.
//!
//! Computes an acoustic fingerprint via the external `fpcalc`-like tool,
//! looks it up against an AcoustID-style identity service (cached on disk),
//! resolves the winning recording against a MusicBrainz-style metadata
//! service, and merges the result with the title normalizer's fallback
//! under the conservative override policy. Soft failure throughout: any
//! error returns `Ok(None)` rather than aborting the pipeline.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::model::{FingerprintMatch, NormalizedMetadata};
use crate::services::process;
use crate::services::rate_limiter::{ApiRateLimiter, RetryConfig, retry_async};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(25);
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(25);
const FPCALC_TIMEOUT: Duration = Duration::from_secs(25);
const CACHE_CAP: usize = 500;
const FPCALC_LENGTH_SECONDS: &str = "120";

/// `{version:1, entries: {key -> lookupResponse}}`. A soft-capped
/// LRU keyed by insertion order: oldest entries are evicted on write once
/// the cap is exceeded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FingerprintCache {
    version: u32,
    #[serde(default)]
    entries: HashMap<String, CachedLookup>,
    #[serde(default)]
    order: Vec<String>,
}

impl FingerprintCache {
    fn new() -> Self {
        FingerprintCache {
            version: 1,
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn insert(&mut self, key: String, value: CachedLookup) {
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entries.insert(key, value);
        while self.order.len() > CACHE_CAP {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedLookup {
    results: Vec<AcoustIdResult>,
}

pub struct FingerprintMatcher {
    fpcalc_path: Option<String>,
    config: Arc<Config>,
    http: reqwest::Client,
    acoustid_limiter: ApiRateLimiter,
    musicbrainz_limiter: ApiRateLimiter,
    retry_config: RetryConfig,
    cache_path: std::path::PathBuf,
    /// Single-writer discipline for the cache file: concurrent pipelines
    /// must serialize writes per-process.
    cache_lock: Mutex<()>,
}

impl FingerprintMatcher {
    pub fn new(fpcalc_path: Option<String>, config: Arc<Config>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.musicbrainz_ua.clone())
            .build()
            .context("failed to build fingerprint HTTP client")?;

        Ok(FingerprintMatcher {
            fpcalc_path,
            config,
            http,
            acoustid_limiter: ApiRateLimiter::for_acoustid(),
            musicbrainz_limiter: ApiRateLimiter::for_musicbrainz(),
            retry_config: RetryConfig::default(),
            cache_path: std::path::PathBuf::from(".dropcrate/cache/acoustid.json"),
            cache_lock: Mutex::new(()),
        })
    }

    pub fn is_available(&self) -> bool {
        self.fpcalc_path.is_some() && self.config.acoustid_key.is_some()
    }

    /// Test-only hook to point the on-disk cache at a throwaway directory
    /// instead of `.dropcrate/cache/acoustid.json`, so cache round-trip
    /// tests never touch a real working directory.
    #[cfg(test)]
    fn with_cache_path(mut self, path: std::path::PathBuf) -> Self {
        self.cache_path = path;
        self
    }

    /// `match(audioPath, fallback, titleHadSeparator) -> MatchedMeta?`.
    /// Never returns `Err`: every internal failure is logged and
    /// folded into `Ok(None)` so the pipeline continues without canonical
    /// metadata.
    pub async fn match_audio(
        &self,
        audio_path: &Path,
        fallback: &NormalizedMetadata,
        title_had_separator: bool,
        is_cancelled: &(dyn Fn() -> bool + Sync),
    ) -> Option<FingerprintMatch> {
        match self.try_match(audio_path, fallback, title_had_separator, is_cancelled).await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "fingerprint matching failed; continuing without canonical metadata");
                None
            }
        }
    }

    async fn try_match(
        &self,
        audio_path: &Path,
        fallback: &NormalizedMetadata,
        title_had_separator: bool,
        is_cancelled: &(dyn Fn() -> bool + Sync),
    ) -> Result<Option<FingerprintMatch>> {
        let Some(fpcalc_path) = &self.fpcalc_path else {
            return Ok(None);
        };
        let Some(api_key) = &self.config.acoustid_key else {
            return Ok(None);
        };

        let fingerprint = compute_fingerprint(fpcalc_path, audio_path, is_cancelled).await?;
        let cache_key = cache_key_for(&fingerprint);

        let results = match self.read_cached(&cache_key).await? {
            Some(cached) => cached,
            None => {
                let results = self.lookup_acoustid(api_key, &fingerprint).await?;
                self.write_cached(&cache_key, &results).await?;
                results
            }
        };

        let min_score = if title_had_separator { 0.95 } else { 0.85 };
        let best = results
            .into_iter()
            .filter(|r| r.recording_id.is_some())
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));

        let Some(best) = best.filter(|r| r.score >= min_score) else {
            return Ok(None);
        };

        let recording_id = best.recording_id.clone().expect("filtered above");
        let resolved = self.resolve_recording(&recording_id).await?;

        Ok(Some(merge_with_fallback(
            FingerprintMatch {
                provider: "acoustid".to_string(),
                score: best.score,
                recording_id,
                artist: resolved.artist,
                title: resolved.title,
                album: resolved.album,
                year: resolved.year,
                label: resolved.label,
                applied: false,
            },
            fallback,
        )))
    }

    async fn read_cached(&self, key: &str) -> Result<Option<Vec<AcoustIdResult>>> {
        let _guard = self.cache_lock.lock();
        let cache = self.load_cache().await?;
        Ok(cache.entries.get(key).map(|c| c.results.clone()))
    }

    async fn write_cached(&self, key: &str, results: &[AcoustIdResult]) -> Result<()> {
        let _guard = self.cache_lock.lock();
        let mut cache = self.load_cache().await?;
        cache.insert(
            key.to_string(),
            CachedLookup {
                results: results.to_vec(),
            },
        );
        self.save_cache(&cache).await
    }

    async fn load_cache(&self) -> Result<FingerprintCache> {
        match fs::read(&self.cache_path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_else(|_| FingerprintCache::new())),
            Err(_) => Ok(FingerprintCache::new()),
        }
    }

    /// Durable write via temp+rename.
    async fn save_cache(&self, cache: &FingerprintCache) -> Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent).await.context("failed to create cache directory")?;
        }
        let tmp_path = self.cache_path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(cache).context("failed to serialize fingerprint cache")?;
        fs::write(&tmp_path, &bytes).await.context("failed to write fingerprint cache temp file")?;
        fs::rename(&tmp_path, &self.cache_path)
            .await
            .context("failed to rename fingerprint cache into place")?;
        Ok(())
    }

    async fn lookup_acoustid(
        &self,
        api_key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<AcoustIdResult>> {
        let parsed: AcoustIdResponse = retry_async("acoustid-lookup", &self.retry_config, || async {
            self.acoustid_limiter.wait().await;
            let response = tokio::time::timeout(
                LOOKUP_TIMEOUT,
                self.http
                    .post("https://api.acoustid.org/v2/lookup")
                    .form(&[
                        ("client", api_key.as_str()),
                        ("fingerprint", fingerprint.fingerprint.as_str()),
                        ("duration", &fingerprint.duration.round().to_string()),
                        ("meta", "recordings releasegroups"),
                    ])
                    .send(),
            )
            .await
            .context("AcoustID lookup timed out")?
            .context("AcoustID lookup request failed")?;

            if !response.status().is_success() {
                anyhow::bail!("AcoustID API returned HTTP {}", response.status());
            }

            response.json::<AcoustIdResponse>().await.context("failed to parse AcoustID response")
        })
        .await?;

        if parsed.status != "ok" {
            anyhow::bail!("AcoustID API error status: {}", parsed.status);
        }

        Ok(parsed
            .results
            .unwrap_or_default()
            .into_iter()
            .map(|r| AcoustIdResult {
                score: r.score,
                recording_id: r
                    .recordings
                    .unwrap_or_default()
                    .into_iter()
                    .next()
                    .map(|rec| rec.id),
            })
            .collect())
    }

    async fn resolve_recording(&self, recording_id: &str) -> Result<ResolvedRecording> {
        let url = format!(
            "https://musicbrainz.org/ws/2/recording/{recording_id}?inc=artist-credits+releases+release-groups+labels&fmt=json"
        );

        let parsed: MbRecording = retry_async("musicbrainz-resolve", &self.retry_config, || async {
            self.musicbrainz_limiter.wait().await;
            let response = tokio::time::timeout(RESOLVE_TIMEOUT, self.http.get(&url).send())
                .await
                .context("metadata resolution timed out")?
                .context("metadata resolution request failed")?;

            if !response.status().is_success() {
                anyhow::bail!("metadata service returned HTTP {}", response.status());
            }

            response.json::<MbRecording>().await.context("failed to parse metadata service response")
        })
        .await?;

        let artist = parsed
            .artist_credit
            .unwrap_or_default()
            .iter()
            .map(|c| c.name.clone())
            .collect::<Vec<_>>()
            .join(" & ");

        let release = pick_release(&parsed.releases.unwrap_or_default());

        Ok(ResolvedRecording {
            artist,
            title: parsed.title,
            album: release.as_ref().map(|r| r.title.clone()),
            year: release
                .as_ref()
                .and_then(|r| r.date.as_deref())
                .and_then(|d| d.get(0..4))
                .and_then(|y| y.parse().ok()),
            label: release
                .and_then(|r| r.label_info)
                .and_then(|li| li.into_iter().next())
                .and_then(|li| li.label)
                .map(|l| l.name),
        })
    }
}

struct ResolvedRecording {
    artist: String,
    title: String,
    album: Option<String>,
    year: Option<i32>,
    label: Option<String>,
}

/// Pick the release to extract `{album, year, label}` from:
/// the first release with status "Official", else the first release.
fn pick_release(releases: &[MbRelease]) -> Option<MbRelease> {
    releases
        .iter()
        .find(|r| r.status.as_deref() == Some("Official"))
        .or_else(|| releases.first())
        .cloned()
}

/// Merge a resolved fingerprint match with the title normalizer's fallback:
/// re-append a version the canonical title lacks, and mark
/// `applied` iff artist or title actually changed.
fn merge_with_fallback(mut matched: FingerprintMatch, fallback: &NormalizedMetadata) -> FingerprintMatch {
    let has_version_suffix = matched.title.trim_end().ends_with(')');
    if !has_version_suffix {
        if let Some(version) = &fallback.version {
            matched.title = format!("{} ({})", matched.title, version);
        }
    }

    matched.applied = matched.artist != fallback.artist || matched.title != fallback.title;
    matched
}

fn cache_key_for(fingerprint: &Fingerprint) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{}:{}", fingerprint.duration, fingerprint.fingerprint));
    format!("{:x}", hasher.finalize())
}

struct Fingerprint {
    fingerprint: String,
    duration: f64,
}

async fn compute_fingerprint(
    fpcalc_path: &str,
    audio_path: &Path,
    is_cancelled: &(dyn Fn() -> bool + Sync),
) -> Result<Fingerprint> {
    let mut cmd = Command::new(fpcalc_path);
    cmd.args(["-json", "-length", FPCALC_LENGTH_SECONDS])
        .arg(audio_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = match process::run(cmd, Some(FPCALC_TIMEOUT), is_cancelled)
        .await
        .context("failed to spawn fingerprint calculator")?
    {
        process::Outcome::Output(output) => output,
        process::Outcome::TimedOut => anyhow::bail!("fingerprint calculator timed out"),
        process::Outcome::Cancelled => anyhow::bail!("fingerprint calculator cancelled"),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("fingerprint calculator failed: {stderr}");
    }

    let parsed: FpcalcOutput =
        serde_json::from_slice(&output.stdout).context("failed to parse fingerprint calculator JSON output")?;

    debug!(path = %audio_path.display(), duration = parsed.duration, "computed acoustic fingerprint");
    info!(path = %audio_path.display(), "fingerprint computed");

    Ok(Fingerprint {
        fingerprint: parsed.fingerprint,
        duration: parsed.duration,
    })
}

#[derive(Debug, Deserialize)]
struct FpcalcOutput {
    duration: f64,
    fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AcoustIdResult {
    score: f64,
    recording_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AcoustIdResponse {
    status: String,
    results: Option<Vec<AcoustIdRawResult>>,
}

#[derive(Debug, Deserialize)]
struct AcoustIdRawResult {
    score: f64,
    recordings: Option<Vec<AcoustIdRawRecording>>,
}

#[derive(Debug, Deserialize)]
struct AcoustIdRawRecording {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MbRecording {
    title: String,
    #[serde(rename = "artist-credit")]
    artist_credit: Option<Vec<MbArtistCredit>>,
    releases: Option<Vec<MbRelease>>,
}

#[derive(Debug, Deserialize)]
struct MbArtistCredit {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MbRelease {
    title: String,
    status: Option<String>,
    date: Option<String>,
    #[serde(rename = "label-info")]
    label_info: Option<Vec<MbLabelInfo>>,
}

#[derive(Debug, Clone, Deserialize)]
struct MbLabelInfo {
    label: Option<MbLabel>,
}

#[derive(Debug, Clone, Deserialize)]
struct MbLabel {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            port: 8787,
            inbox_dir: "./inbox".to_string(),
            extractor_path: None,
            ffmpeg_path: None,
            fpcalc_path: None,
            extractor_cookies_from_browser: None,
            extractor_cookies_path: None,
            acoustid_key: Some("test-key".to_string()),
            musicbrainz_ua: "dropcrate-test".to_string(),
            openai_api_key: None,
            llm_model: None,
            default_max_concurrent: 3,
            default_preset: crate::model::ProcessingPreset::default(),
        })
    }

    /// Round-trips a lookup response through the on-disk cache: the second
    /// `read_cached` call must see exactly what the first `write_cached`
    /// call persisted — the cache file is a single JSON document.
    /// `#[serial]` because the cache file is a single-writer resource, and
    /// two tests racing on the same temp path would otherwise be flaky.
    #[tokio::test]
    #[serial]
    async fn cache_write_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let matcher = FingerprintMatcher::new(Some("fpcalc".to_string()), test_config())
            .expect("client builds")
            .with_cache_path(dir.path().join("acoustid.json"));

        let results = vec![AcoustIdResult {
            score: 0.97,
            recording_id: Some("rec-1".to_string()),
        }];
        matcher.write_cached("key-1", &results).await.expect("write_cached");

        let cached = matcher.read_cached("key-1").await.expect("read_cached").expect("cache hit");
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].recording_id.as_deref(), Some("rec-1"));

        // A cache miss for an unrelated key returns None rather than an error.
        assert!(matcher.read_cached("key-missing").await.unwrap().is_none());
    }

    #[test]
    fn merge_marks_applied_on_change() {
        let fallback = NormalizedMetadata {
            artist: "Unknown Artist".to_string(),
            title: "Losing It".to_string(),
            version: None,
            album: None,
            year: None,
            label: None,
        };
        let matched = FingerprintMatch {
            provider: "acoustid".to_string(),
            score: 0.97,
            recording_id: "rec-1".to_string(),
            artist: "Fisher".to_string(),
            title: "Losing It".to_string(),
            album: None,
            year: None,
            label: None,
            applied: false,
        };
        let merged = merge_with_fallback(matched, &fallback);
        assert!(merged.applied);
    }

    #[test]
    fn merge_reappends_missing_version() {
        let fallback = NormalizedMetadata {
            artist: "Fisher".to_string(),
            title: "Losing It".to_string(),
            version: Some("Extended Mix".to_string()),
            album: None,
            year: None,
            label: None,
        };
        let matched = FingerprintMatch {
            provider: "acoustid".to_string(),
            score: 0.97,
            recording_id: "rec-1".to_string(),
            artist: "Fisher".to_string(),
            title: "Losing It".to_string(),
            album: None,
            year: None,
            label: None,
            applied: false,
        };
        let merged = merge_with_fallback(matched, &fallback);
        assert_eq!(merged.title, "Losing It (Extended Mix)");
    }

    fn release(title: &str, status: Option<&str>) -> MbRelease {
        MbRelease {
            title: title.to_string(),
            status: status.map(str::to_string),
            date: None,
            label_info: None,
        }
    }

    #[test]
    fn pick_release_prefers_official() {
        let releases = vec![release("Bootleg Comp", Some("Promotion")), release("Official Album", Some("Official"))];
        let picked = pick_release(&releases).expect("a release is picked");
        assert_eq!(picked.title, "Official Album");
    }

    #[test]
    fn pick_release_falls_back_to_first_when_none_official() {
        let releases = vec![release("First Pressing", Some("Promotion")), release("Reissue", Some("Bootleg"))];
        let picked = pick_release(&releases).expect("a release is picked");
        assert_eq!(picked.title, "First Pressing");
    }

    #[test]
    fn pick_release_none_when_no_releases() {
        assert!(pick_release(&[]).is_none());
    }

    #[test]
    fn cache_evicts_oldest_past_cap() {
        let mut cache = FingerprintCache::new();
        for i in 0..(CACHE_CAP + 5) {
            cache.insert(
                format!("key-{i}"),
                CachedLookup {
                    results: vec![],
                },
            );
        }
        assert_eq!(cache.order.len(), CACHE_CAP);
        assert!(!cache.entries.contains_key("key-0"));
        assert!(cache.entries.contains_key(&format!("key-{}", CACHE_CAP + 4)));
    }
}
