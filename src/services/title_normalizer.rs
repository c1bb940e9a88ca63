//! Title normalizer.
//!
//! Pure function: `(rawTitle, uploader?) -> {artist, title, version?}`. No
//! I/O, so it is a total function and cannot fail — an ordered-rule,
//! pure-parsing idiom.

use crate::model::NormalizedMetadata;

const JUNK_TOKENS: &[&str] = &[
    "official video",
    "official audio",
    "lyrics",
    "lyric",
    "visualiser",
    "visualizer",
    "hd",
    "4k",
    "8k",
    "full album",
];

const SEPARATORS: &[&str] = &[" - ", " – ", " — ", " | "];

const VERSION_MARKERS: &[&str] = &[
    "original mix",
    "extended mix",
    "radio edit",
    "club mix",
    "dub",
    "edit",
    "remix",
    "rework",
    "bootleg",
    "vip mix",
    "vip",
    "mix",
];

const LOWERCASE_CONNECTORS: &[&str] = &[
    "the", "a", "feat.", "ft.", "x", "vs.", "and", "or", "of",
];

/// Fixed-form artist names that bypass generic title-casing.
const ARTIST_CORRECTIONS: &[(&str, &str)] = &[
    ("jay-z", "JAY-Z"),
    ("the weeknd", "The Weeknd"),
    ("j. cole", "J. Cole"),
    ("j cole", "J. Cole"),
    ("a$ap", "A$AP"),
    ("t-pain", "T-Pain"),
    ("6lack", "6LACK"),
    ("xxxtentacion", "XXXTentacion"),
];

/// Returns `{artist, title, version?}`. `album`, `year`, and `label` are
/// left unset here; they are only ever populated by the fingerprint
/// matcher.
pub fn normalize(raw_title: Option<&str>, uploader: Option<&str>) -> NormalizedMetadata {
    let cleaned = clean_junk(raw_title.unwrap_or_default());

    if cleaned.trim().is_empty() {
        return NormalizedMetadata {
            artist: "Unknown Artist".to_string(),
            title: "Unknown Title".to_string(),
            version: None,
            album: None,
            year: None,
            label: None,
        };
    }

    let (artist_raw, title_raw) = split_artist_title(&cleaned, uploader);
    let (title_no_version, version) = extract_version(&title_raw);

    let artist = title_case_artist(artist_raw.trim());
    let title = if title_no_version.trim().is_empty() {
        "Unknown Title".to_string()
    } else {
        title_no_version.trim().to_string()
    };

    NormalizedMetadata {
        artist: if artist.is_empty() {
            "Unknown Artist".to_string()
        } else {
            artist
        },
        title,
        version,
        album: None,
        year: None,
        label: None,
    }
}

/// Step 1: remove bracketed suffixes, strip junk tokens, collapse
/// whitespace, drop empty parentheses.
fn clean_junk(raw: &str) -> String {
    let without_brackets = strip_bracketed(raw);

    let mut lowered_positions: Vec<(usize, usize)> = Vec::new();
    let lower = without_brackets.to_lowercase();
    for token in JUNK_TOKENS {
        let mut search_from = 0;
        while let Some(pos) = lower[search_from..].find(token) {
            let start = search_from + pos;
            let end = start + token.len();
            lowered_positions.push((start, end));
            search_from = end;
        }
    }
    lowered_positions.sort_by_key(|&(s, _)| s);

    let mut result = String::with_capacity(without_brackets.len());
    let mut last_end = 0;
    for (start, end) in lowered_positions {
        if start < last_end {
            continue;
        }
        result.push_str(&without_brackets[last_end..start]);
        last_end = end;
    }
    result.push_str(&without_brackets[last_end..]);

    let drop_empty_parens = result.replace("()", "").replace("(  )", "").replace("( )", "");
    drop_empty_parens.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_bracketed(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut depth = 0i32;
    for ch in raw.chars() {
        match ch {
            '[' => depth += 1,
            ']' => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out
}

/// Whether a raw title contains one of the ordered artist/title separators.
/// Used by the fingerprint matcher to pick the conservative-vs-lenient score
/// threshold.
pub fn had_separator(raw_title: &str) -> bool {
    SEPARATORS.iter().any(|sep| raw_title.contains(sep))
}

/// Step 2: split on the first separator in the ordered list.
fn split_artist_title(cleaned: &str, uploader: Option<&str>) -> (String, String) {
    for sep in SEPARATORS {
        if let Some(idx) = cleaned.find(sep) {
            let artist = cleaned[..idx].to_string();
            let title = cleaned[idx + sep.len()..].to_string();
            return (artist, title);
        }
    }
    let artist = uploader
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .unwrap_or("Unknown Artist")
        .to_string();
    (artist, cleaned.to_string())
}

/// Step 3: detect and re-emit a trailing parenthetical version marker.
fn extract_version(title: &str) -> (String, Option<String>) {
    let trimmed = title.trim_end();
    if !trimmed.ends_with(')') {
        return (title.to_string(), None);
    }
    let Some(open) = trimmed.rfind('(') else {
        return (title.to_string(), None);
    };
    let inner = &trimmed[open + 1..trimmed.len() - 1];
    let inner_lower = inner.to_lowercase();

    if VERSION_MARKERS.iter().any(|m| inner_lower.contains(m)) {
        let base = trimmed[..open].trim_end().to_string();
        (base, Some(inner.trim().to_string()))
    } else {
        (title.to_string(), None)
    }
}

/// Step 4: title-case with a correction table; lowercase connectors unless
/// first word.
fn title_case_artist(artist: &str) -> String {
    let lower = artist.to_lowercase();
    for (key, fixed) in ARTIST_CORRECTIONS {
        if lower == *key {
            return fixed.to_string();
        }
    }

    artist
        .split(' ')
        .enumerate()
        .map(|(i, word)| {
            if word.is_empty() {
                return word.to_string();
            }
            if word.chars().all(|c| c.is_uppercase() || !c.is_alphabetic()) && word.len() <= 3 {
                // Preserve short all-caps tokens like "DJ", "MC".
                return word.to_string();
            }
            let lower_word = word.to_lowercase();
            if i != 0 && LOWERCASE_CONNECTORS.contains(&lower_word.as_str()) {
                return lower_word;
            }
            capitalize_first(&lower_word)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize_first(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_first_separator() {
        let m = normalize(Some("Fisher - Losing It"), None);
        assert_eq!(m.artist, "Fisher");
        assert_eq!(m.title, "Losing It");
    }

    #[test]
    fn strips_junk_tokens_and_brackets() {
        let m = normalize(Some("Fisher - Losing It (Official Video) [4K]"), None);
        assert_eq!(m.artist, "Fisher");
        assert_eq!(m.title, "Losing It");
    }

    #[test]
    fn detects_version_marker() {
        let m = normalize(Some("Fisher - Losing It (Extended Mix)"), None);
        assert_eq!(m.title, "Losing It");
        assert_eq!(m.version.as_deref(), Some("Extended Mix"));
    }

    #[test]
    fn falls_back_to_uploader_without_separator() {
        let m = normalize(Some("Losing It"), Some("Fisher"));
        assert_eq!(m.artist, "Fisher");
        assert_eq!(m.title, "Losing It");
    }

    #[test]
    fn empty_title_and_uploader_yields_unknowns() {
        let m = normalize(None, None);
        assert_eq!(m.artist, "Unknown Artist");
        assert_eq!(m.title, "Unknown Title");
    }

    #[test]
    fn fixed_form_artist_names_preserved() {
        let m = normalize(Some("JAY-Z - 99 Problems"), None);
        assert_eq!(m.artist, "JAY-Z");
    }

    #[test]
    fn round_trips_artist_title_version() {
        let m1 = normalize(Some("The Weeknd - Blinding Lights (Remix)"), None);
        let re_input = format!("{} - {} ({})", m1.artist, m1.title, m1.version.clone().unwrap());
        let m2 = normalize(Some(&re_input), None);
        assert_eq!(m1.artist, m2.artist);
        assert_eq!(m1.title, m2.title);
        assert_eq!(m1.version, m2.version);
    }
}
