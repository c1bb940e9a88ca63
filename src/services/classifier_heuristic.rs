//! Deterministic, case-insensitive keyword match over title/uploader/
//! description plus extractor-provided categories/tags. A total function:
//! it cannot fail.

use std::collections::BTreeSet;

use crate::model::{Classification, ClassificationSource, DjTags, ExtractedInfo, ItemKind};

const TUTORIAL_CUES: &[&str] = &[
    "how to dj",
    "tutorial",
    "lesson",
    "masterclass",
    "rekordbox",
    "serato",
    "cdj",
    "beatmatch",
];

const SET_CUES: &[&str] = &[
    "dj set",
    "live set",
    "dj mix",
    "boiler room",
    "essential mix",
    "session",
    "radio show",
];

const PODCAST_CUES: &[&str] = &["podcast", "episode", "interview"];

const MUSIC_SIGNAL_CATEGORIES: &[&str] = &["music"];

/// Ordered most-specific-first.
const GENRE_TABLE: &[(&str, &[&str])] = &[
    ("Afro House", &["afro house"]),
    ("Amapiano", &["amapiano"]),
    ("Hard Techno", &["hard techno"]),
    ("Melodic Techno", &["melodic techno"]),
    ("Minimal Techno", &["minimal techno"]),
    ("Acid Techno", &["acid techno"]),
    ("Peak Time Techno", &["peak time techno", "peak-time techno"]),
    ("Techno", &["techno"]),
    ("Tech House", &["tech house"]),
    ("Progressive House", &["progressive house"]),
    ("Deep House", &["deep house"]),
    ("Funky House", &["funky house"]),
    ("Soulful House", &["soulful house"]),
    ("Jackin House", &["jackin house", "jackin' house"]),
    (
        "Melodic House & Techno",
        &["melodic house & techno", "melodic house and techno"],
    ),
    ("House", &["house"]),
    ("Drum & Bass", &["drum & bass", "drum and bass", "dnb", "d&b"]),
    ("Dubstep", &["dubstep"]),
    ("UK Garage", &["uk garage", "ukg"]),
    ("Breaks", &["breaks", "breakbeat"]),
    ("Bass House", &["bass house"]),
    ("Psytrance", &["psytrance", "psy trance"]),
    ("Uplifting Trance", &["uplifting trance"]),
    ("Trance", &["trance"]),
    ("Disco", &["disco"]),
    ("Nu-Disco", &["nu-disco", "nu disco"]),
    ("Electro", &["electro"]),
    ("Downtempo", &["downtempo", "down tempo"]),
];

const VIBE_KEYWORDS: &[(&str, &[&str])] = &[
    ("Organic", &["organic"]),
    ("Tribal", &["tribal"]),
    ("Latin", &["latin"]),
    ("Minimal", &["minimal"]),
    ("Dark", &["dark"]),
    ("Vocal", &["vocal"]),
    ("Instrumental", &["instrumental"]),
    ("Driving", &["driving"]),
    ("Hypnotic", &["hypnotic"]),
];

pub struct HeuristicClassifier;

impl HeuristicClassifier {
    pub fn new() -> Self {
        HeuristicClassifier
    }

    /// Classify a single item. Cannot fail.
    pub fn classify(&self, info: &ExtractedInfo) -> Classification {
        let haystack = format!(
            "{}\n{}\n{}",
            info.title.clone().unwrap_or_default(),
            info.uploader.clone().unwrap_or_default(),
            info.description.clone().unwrap_or_default()
        )
        .to_lowercase();

        let kind = classify_kind(&haystack, info);
        let mut confidence = 0.0_f64;

        if kind != ItemKind::Unknown {
            confidence += 0.25;
        }

        let music_signal = has_music_signal(&haystack, info);
        if music_signal {
            confidence += 0.15;
        }

        if matches!(kind, ItemKind::Video | ItemKind::Podcast) {
            let notes = match kind {
                ItemKind::Video => "Classified as video; DJ tags are not applicable.".to_string(),
                ItemKind::Podcast => "Classified as podcast; DJ tags are not applicable.".to_string(),
                _ => unreachable!(),
            };
            return Classification {
                kind,
                tags: DjTags::default(),
                confidence: confidence.clamp(0.0, 1.0),
                notes,
                source: ClassificationSource::Heuristic,
            };
        }

        let genre = match_genre(&haystack);
        if genre.is_some() {
            confidence += 0.4;
        }

        let (energy, time) = match_energy_time(&haystack);
        if !energy.is_empty() || !time.is_empty() {
            confidence += 0.15;
        }

        let vibe = match_vibes(&haystack);
        if !vibe.is_empty() {
            confidence += 0.1;
        }

        let genre_value = match kind {
            ItemKind::Track | ItemKind::Set => genre.unwrap_or("Other").to_string(),
            _ => genre.map(str::to_string).unwrap_or_default(),
        };

        Classification {
            kind,
            tags: DjTags {
                genre: genre_value,
                energy,
                time,
                vibe,
            },
            confidence: confidence.clamp(0.0, 1.0),
            notes: String::new(),
            source: ClassificationSource::Heuristic,
        }
    }
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_kind(haystack: &str, info: &ExtractedInfo) -> ItemKind {
    if TUTORIAL_CUES.iter().any(|c| haystack.contains(c)) {
        return ItemKind::Video;
    }

    let has_set_cue = SET_CUES.iter().any(|c| haystack.contains(c));
    let duration_at_least = |mins: f64| info.duration_s.map(|d| d >= mins * 60.0).unwrap_or(true);

    if has_set_cue && duration_at_least(20.0) {
        return ItemKind::Set;
    }

    let has_podcast_cue = PODCAST_CUES.iter().any(|c| haystack.contains(c));
    if has_podcast_cue && !has_set_cue && info.duration_s.map(|d| d >= 15.0 * 60.0).unwrap_or(false)
    {
        return ItemKind::Podcast;
    }

    if has_music_signal(haystack, info) {
        return ItemKind::Track;
    }

    if info.title.as_deref().map(|t| !t.trim().is_empty()).unwrap_or(false) {
        return ItemKind::Video;
    }

    ItemKind::Unknown
}

fn has_music_signal(haystack: &str, info: &ExtractedInfo) -> bool {
    info.categories
        .iter()
        .any(|c| MUSIC_SIGNAL_CATEGORIES.contains(&c.to_lowercase().as_str()))
        || info.tags.iter().any(|t| t.to_lowercase() == "music")
        || GENRE_TABLE.iter().any(|(_, kws)| kws.iter().any(|k| haystack.contains(k)))
}

fn match_genre(haystack: &str) -> Option<&'static str> {
    GENRE_TABLE
        .iter()
        .find(|(_, kws)| kws.iter().any(|k| haystack.contains(k)))
        .map(|(genre, _)| *genre)
}

fn match_energy_time(haystack: &str) -> (String, String) {
    if haystack.contains("warmup") || haystack.contains("opening") {
        return ("2/5".to_string(), "Warmup".to_string());
    }
    if haystack.contains("peak") || haystack.contains("festival") || haystack.contains("main stage") {
        return ("4/5".to_string(), "Peak".to_string());
    }
    if haystack.contains("closing") || haystack.contains("afterhours") {
        return ("3/5".to_string(), "Closing".to_string());
    }
    (String::new(), String::new())
}

fn match_vibes(haystack: &str) -> String {
    let mut fired: BTreeSet<&'static str> = BTreeSet::new();
    for (vibe, keywords) in VIBE_KEYWORDS {
        if keywords.iter().any(|k| haystack.contains(k)) {
            fired.insert(vibe);
        }
    }
    DjTags::join_vibes(&fired)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(title: &str, description: &str, duration_s: Option<f64>) -> ExtractedInfo {
        ExtractedInfo {
            source_id: "abc".to_string(),
            title: Some(title.to_string()),
            uploader: None,
            duration_s,
            webpage_url: None,
            description: Some(description.to_string()),
            thumbnails: vec![],
            categories: vec!["Music".to_string()],
            tags: vec![],
        }
    }

    #[test]
    fn tutorial_cue_wins_as_video() {
        let c = HeuristicClassifier::new().classify(&info("How to DJ: beatmatching basics", "", None));
        assert_eq!(c.kind, ItemKind::Video);
    }

    #[test]
    fn long_set_cue_classified_as_set() {
        let c = HeuristicClassifier::new().classify(&info("Boiler Room Tokyo", "", Some(1800.0)));
        assert_eq!(c.kind, ItemKind::Set);
    }

    #[test]
    fn short_set_cue_not_classified_as_set() {
        let c = HeuristicClassifier::new().classify(&info("DJ Mix preview", "", Some(60.0)));
        assert_ne!(c.kind, ItemKind::Set);
    }

    #[test]
    fn music_category_yields_track_with_genre() {
        let c = HeuristicClassifier::new().classify(&info("Afro House Anthem", "afro house vibes", Some(300.0)));
        assert_eq!(c.kind, ItemKind::Track);
        assert_eq!(c.tags.genre, "Afro House");
        assert!(c.confidence > 0.5);
    }

    #[test]
    fn video_and_podcast_force_empty_tags() {
        let c = HeuristicClassifier::new().classify(&info("How to DJ", "afro house techno", None));
        assert_eq!(c.tags, DjTags::default());
        assert!(!c.notes.is_empty());
    }

    #[test]
    fn no_signal_defaults_to_unknown_or_video() {
        let c = HeuristicClassifier::new().classify(&ExtractedInfo::default());
        assert_eq!(c.kind, ItemKind::Unknown);
    }
}
