//! Data model: track requests, DJ tags, classification, the per-item
//! pipeline's intermediate types, and the event/job shapes the API and
//! registry operate on.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DropcrateError, ExtractorErrorKind, ProcessingStep};

/// A single caller-submitted URL. `id` is caller-chosen and must be unique
/// within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackRequest {
    pub id: String,
    pub url: String,
    /// Per-item preset override; `None` defers entirely to the job preset.
    #[serde(default)]
    pub preset_snapshot: Option<ProcessingPreset>,
}

/// The finite DJ taxonomy.
pub const GENRES: &[&str] = &[
    "Afro House",
    "Amapiano",
    "Hard Techno",
    "Melodic Techno",
    "Minimal Techno",
    "Acid Techno",
    "Peak Time Techno",
    "Techno",
    "Tech House",
    "Progressive House",
    "Deep House",
    "Funky House",
    "Soulful House",
    "Jackin House",
    "Melodic House & Techno",
    "House",
    "Drum & Bass",
    "Dubstep",
    "UK Garage",
    "Breaks",
    "Bass House",
    "Psytrance",
    "Uplifting Trance",
    "Trance",
    "Disco",
    "Nu-Disco",
    "Electro",
    "Downtempo",
    "Other",
];

pub const VIBES: &[&str] = &[
    "Organic", "Tribal", "Latin", "Minimal", "Dark", "Vocal", "Instrumental", "Driving",
    "Hypnotic",
];

/// `{genre, energy, time, vibe}` — the four-field DJ classification.
/// Empty strings denote "unspecified".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DjTags {
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub energy: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub vibe: String,
}

impl DjTags {
    pub fn cleared() -> Self {
        DjTags {
            genre: "Other".to_string(),
            energy: String::new(),
            time: String::new(),
            vibe: String::new(),
        }
    }

    /// Comma-join a set of fired vibe keywords, preserving taxonomy order.
    pub fn join_vibes(fired: &BTreeSet<&'static str>) -> String {
        VIBES
            .iter()
            .filter(|v| fired.contains(*v))
            .copied()
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Track,
    Set,
    Podcast,
    Video,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationSource {
    Heuristic,
    Llm,
}

/// Output of the heuristic or LLM classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ItemKind,
    pub tags: DjTags,
    pub confidence: f64,
    pub notes: String,
    pub source: ClassificationSource,
}

/// Subset of extractor output used downstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedInfo {
    pub source_id: String,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration_s: Option<f64>,
    pub webpage_url: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Thumbnail {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub preference: Option<i64>,
}

/// `{i (LUFS), tp (dBTP), lra (LU)}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoudnessTarget {
    pub i: f64,
    pub tp: f64,
    pub lra: f64,
}

impl Default for LoudnessTarget {
    fn default() -> Self {
        LoudnessTarget {
            i: -14.0,
            tp: -1.0,
            lra: 11.0,
        }
    }
}

impl LoudnessTarget {
    /// Validate the allowed ranges; returns `InputInvalid` if any field is
    /// out of bounds.
    pub fn validate(&self) -> Result<(), DropcrateError> {
        if !(-23.0..=-8.0).contains(&self.i) {
            return Err(DropcrateError::InputInvalid {
                message: format!("loudness.i {} out of range [-23,-8]", self.i),
            });
        }
        if !(-5.0..=0.0).contains(&self.tp) {
            return Err(DropcrateError::InputInvalid {
                message: format!("loudness.tp {} out of range [-5,0]", self.tp),
            });
        }
        if !(5.0..=20.0).contains(&self.lra) {
            return Err(DropcrateError::InputInvalid {
                message: format!("loudness.lra {} out of range [5,20]", self.lra),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingMode {
    DjSafe,
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Aiff,
    Wav,
    Flac,
    Mp3,
    M4a,
    Auto,
}

impl AudioFormat {
    /// ffmpeg codec for a concrete (non-`Auto`) output format.
    pub fn codec(self) -> Option<&'static str> {
        match self {
            AudioFormat::Aiff => Some("pcm_s16be"),
            AudioFormat::Wav => Some("pcm_s16le"),
            AudioFormat::Flac => Some("flac"),
            AudioFormat::Mp3 => Some("libmp3lame"),
            AudioFormat::M4a => Some("aac"),
            AudioFormat::Auto => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Aiff => "aiff",
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::Auto => "m4a",
        }
    }

    pub fn is_lossless_container(self) -> bool {
        matches!(self, AudioFormat::Aiff | AudioFormat::Wav | AudioFormat::Flac)
    }
}

/// `{mode, audio_format, normalize_enabled, loudness}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingPreset {
    pub mode: ProcessingMode,
    pub audio_format: AudioFormat,
    pub normalize_enabled: bool,
    pub loudness: LoudnessTarget,
}

impl Default for ProcessingPreset {
    fn default() -> Self {
        ProcessingPreset {
            mode: ProcessingMode::DjSafe,
            audio_format: AudioFormat::Aiff,
            normalize_enabled: true,
            loudness: LoudnessTarget::default(),
        }
    }
}

impl ProcessingPreset {
    /// Enforce the preset invariants: `fast` forces normalization off;
    /// `dj-safe` restricts the audio format to a lossless container.
    pub fn normalized(mut self) -> Self {
        if self.mode == ProcessingMode::Fast {
            self.normalize_enabled = false;
        }
        self
    }

    pub fn validate(&self) -> Result<(), DropcrateError> {
        self.loudness.validate()?;
        if self.mode == ProcessingMode::DjSafe && !self.audio_format.is_lossless_container() {
            return Err(DropcrateError::InputInvalid {
                message: format!(
                    "mode=dj-safe requires audio_format in {{aiff,wav,flac}}, got {:?}",
                    self.audio_format
                ),
            });
        }
        Ok(())
    }
}

/// `{artist, title, version?}` from the title normalizer; may be
/// replaced by a fingerprint match under the override policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedMetadata {
    pub artist: String,
    pub title: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub label: Option<String>,
}

/// `{provider, score, recordingId, artist, title, album?, year?, label?, applied}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintMatch {
    pub provider: String,
    pub score: f64,
    pub recording_id: String,
    pub artist: String,
    pub title: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub label: Option<String>,
    pub applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Queued,
    Running,
    Done,
    Error,
}

/// One ordered stage in the per-item pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Metadata,
    Classify,
    Download,
    Fingerprint,
    Normalize,
    Transcode,
    Tag,
    Finalize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_path: Option<String>,
}

/// `{id, status, stage?, errorKind?, outputs?, message?}`. Status
/// transitions are monotonic: `queued -> running -> (done | error)`; `error`
/// may only be reset to `queued` by an explicit retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub id: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ExtractorErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ItemOutcome {
    pub fn queued(id: impl Into<String>) -> Self {
        ItemOutcome {
            id: id.into(),
            status: ItemStatus::Queued,
            stage: None,
            error_kind: None,
            outputs: None,
            message: None,
        }
    }

    /// Fold one `Event` belonging to this item into its outcome, enforcing
    /// the monotonic `queued -> running -> (done | error)` transition.
    /// Events for other ids or job-level events are ignored.
    pub fn apply_event(&mut self, event: &Event) {
        match event {
            Event::ItemStart { id } if *id == self.id => {
                self.status = ItemStatus::Running;
            }
            Event::ItemProgress { id, stage } if *id == self.id => {
                self.status = ItemStatus::Running;
                self.stage = Some(*stage);
            }
            Event::ItemDone { id, outputs } if *id == self.id => {
                self.status = ItemStatus::Done;
                self.outputs = Some(outputs.clone());
                self.error_kind = None;
                self.message = None;
            }
            Event::ItemError { id, kind, message, .. } if *id == self.id => {
                self.status = ItemStatus::Error;
                self.error_kind = match kind {
                    ExtractorErrorKindOrProcessing::Extractor { kind } => Some(*kind),
                    _ => None,
                };
                self.message = Some(message.clone());
            }
            _ => {}
        }
    }
}

/// Persisted next to the final file; the library's source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarDocument {
    pub source_url: String,
    pub source_id: String,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
    pub downloaded_at: chrono::DateTime<chrono::Utc>,
    pub normalized: NormalizedMetadata,
    pub fingerprint_match: Option<FingerprintMatch>,
    pub dj_defaults: DjTags,
    pub processing: SidecarProcessing,
    pub outputs: Outputs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarProcessing {
    pub audio_format: AudioFormat,
    pub normalize: SidecarNormalize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarNormalize {
    pub enabled: bool,
    pub target_i: f64,
    pub target_tp: f64,
    pub target_lra: f64,
}

/// A row in the `/library` listing, derived purely from sidecar scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryRow {
    pub id: String,
    pub path: String,
    pub artist: String,
    pub title: String,
    pub genre: String,
    pub downloaded_at: chrono::DateTime<chrono::Utc>,
}

/// The tagged-union event stream — closed, versioned for wire
/// compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    QueueStart {
        job_id: Uuid,
    },
    ItemStart {
        id: String,
    },
    ItemProgress {
        id: String,
        stage: Stage,
    },
    ItemDone {
        id: String,
        outputs: Outputs,
    },
    ItemError {
        id: String,
        kind: ExtractorErrorKindOrProcessing,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
    QueueCancelled {
        job_id: Uuid,
    },
    QueueDone {
        job_id: Uuid,
    },
}

/// The error-kind payload carried by `item-error`: either the extractor
/// taxonomy or a processing-stage failure, plus the always-available
/// soft/terminal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ExtractorErrorKindOrProcessing {
    Extractor { kind: ExtractorErrorKind },
    Processing { step: ProcessingStep },
    ToolUnavailable,
    FingerprintUnavailable,
    InputInvalid,
    Cancelled,
    Internal,
}

impl From<&DropcrateError> for ExtractorErrorKindOrProcessing {
    fn from(err: &DropcrateError) -> Self {
        match err {
            DropcrateError::ExtractorError { kind, .. } => {
                ExtractorErrorKindOrProcessing::Extractor { kind: *kind }
            }
            DropcrateError::ProcessingError { step, .. } => {
                ExtractorErrorKindOrProcessing::Processing { step: *step }
            }
            DropcrateError::ToolUnavailable { .. } => ExtractorErrorKindOrProcessing::ToolUnavailable,
            DropcrateError::FingerprintUnavailable { .. } => {
                ExtractorErrorKindOrProcessing::FingerprintUnavailable
            }
            DropcrateError::InputInvalid { .. } => ExtractorErrorKindOrProcessing::InputInvalid,
            DropcrateError::Cancelled => ExtractorErrorKindOrProcessing::Cancelled,
            DropcrateError::Internal { .. } => ExtractorErrorKindOrProcessing::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_mode_forces_normalize_off() {
        let preset = ProcessingPreset {
            mode: ProcessingMode::Fast,
            audio_format: AudioFormat::Mp3,
            normalize_enabled: true,
            loudness: LoudnessTarget::default(),
        }
        .normalized();
        assert!(!preset.normalize_enabled);
    }

    #[test]
    fn dj_safe_rejects_lossy_format() {
        let preset = ProcessingPreset {
            mode: ProcessingMode::DjSafe,
            audio_format: AudioFormat::Mp3,
            normalize_enabled: true,
            loudness: LoudnessTarget::default(),
        };
        assert!(preset.validate().is_err());
    }

    #[test]
    fn loudness_out_of_range_is_invalid() {
        let t = LoudnessTarget {
            i: -30.0,
            tp: -1.0,
            lra: 11.0,
        };
        assert!(t.validate().is_err());
    }
}
