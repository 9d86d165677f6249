//!
//! src/util.rs  Andrew Belles  Oct 18th, 2025
//!
//! Small helpers shared by the scraper, exporter, downloader and analyzer:
//! song id parsing, duration strings, filesystem-safe names
//!

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

static SONG_PATH_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/song/([a-fA-F0-9-]{36})").expect("static regex")
});

static BARE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"([a-fA-F0-9]{8}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{12})"
    ).expect("static regex")
});

static INVALID_FILENAME_CHARS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("static regex")
});

static REPEATED_UNDERSCORE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"_+").expect("static regex")
});

pub const MAX_FILENAME_LEN: usize = 100;

/// Pulls the 36 character song id out of a detail url or any string holding one
pub fn extract_song_id(s: &str) -> Option<String> {
    [&*SONG_PATH_ID, &*BARE_ID].iter()
        .filter_map(|re| re.captures(s))
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .find(|candidate| is_valid_song_id(candidate))
}

pub fn is_valid_song_id(s: &str) -> bool {
    s.len() == 36 && Uuid::parse_str(s).is_ok()
}

/// "M:SS" or "H:MM:SS" into seconds; anything else, including values that
/// overflow, is None
pub fn parse_duration(s: &str) -> Option<u64> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    let nums = parts.iter()
        .map(|p| p.trim().parse::<u64>().ok())
        .collect::<Option<Vec<u64>>>()?;
    let (h, m, s) = match nums.as_slice() {
        [m, s] => (0, *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return None
    };
    h.checked_mul(3600)?
        .checked_add(m.checked_mul(60)?)?
        .checked_add(s)
}

pub fn format_duration(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

/// Long form used in summaries, e.g. "1h 5m 30s"
pub fn format_duration_long(seconds: u64) -> String {
    format!("{}h {}m {}s", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
}

/// Makes a title safe to use as a file stem on every OS
pub fn safe_filename(name: &str) -> String {
    let replaced = INVALID_FILENAME_CHARS.replace_all(name, "_");
    let collapsed = REPEATED_UNDERSCORE.replace_all(&replaced, "_");
    let trimmed = collapsed.trim_matches(|c: char| c == ' ' || c == '.');

    let truncated: String = trimmed.chars().take(MAX_FILENAME_LEN).collect();
    let truncated = truncated.trim_end_matches(|c: char| c == ' ' || c == '.');

    if truncated.is_empty() {
        "untitled".to_string()
    } else {
        truncated.to_string()
    }
}

/// First `<stem>.<ext>`, then `<stem>_1.<ext>`, ... that does not exist yet
pub fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.{ext}"));
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| dir.join(format!("{stem}_{n}.{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Github style heading anchor, used by the markdown table of contents
pub fn anchor_slug(heading: &str) -> String {
    heading.trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            c if c.is_alphanumeric() || c == '_' => Some(c),
            c if c == '-' || c.is_whitespace() => Some('-'),
            _ => None
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "abc12345-1234-4234-9234-123456789abc";

    #[test]
    fn song_id_from_urls() {
        assert_eq!(
            extract_song_id(&format!("https://suno.com/song/{ID}")).as_deref(),
            Some(ID)
        );
        assert_eq!(extract_song_id(&format!("/song/{ID}?sh=x")).as_deref(), Some(ID));
        assert_eq!(extract_song_id(ID).as_deref(), Some(ID));
        assert_eq!(extract_song_id("https://suno.com/song/not-an-id"), None);
        assert_eq!(extract_song_id(""), None);
    }

    #[test]
    fn song_id_is_lowercased() {
        let upper = ID.to_uppercase();
        assert_eq!(extract_song_id(&upper).as_deref(), Some(ID));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("3:24"), Some(204));
        assert_eq!(parse_duration("  1:05:30 "), Some(3930));
        assert_eq!(parse_duration("\t1:00\n"), Some(60));
        assert_eq!(parse_duration("abc:def"), None);
        assert_eq!(parse_duration("1:2:3:4"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("18446744073709551615:00"), None);
        assert_eq!(parse_duration("5124095576030432:00:00"), None);
        assert_eq!(parse_duration("0:18446744073709551615"), Some(u64::MAX));
        assert_eq!(format_duration(204), "3:24");
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(3930), "1:05:30");
        assert_eq!(format_duration_long(3930), "1h 5m 30s");
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(safe_filename("My Song: \"The Best\""), "My Song_ _The Best_");
        assert_eq!(safe_filename("a/b\\c"), "a_b_c");
        assert_eq!(safe_filename("  ..  "), "untitled");
        assert_eq!(safe_filename(&"A".repeat(200)).len(), MAX_FILENAME_LEN);
    }

    #[test]
    fn unique_paths_get_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_path(dir.path(), "song", "mp3");
        assert_eq!(first, dir.path().join("song.mp3"));
        std::fs::write(&first, b"x").unwrap();
        assert_eq!(unique_path(dir.path(), "song", "mp3"), dir.path().join("song_1.mp3"));
    }

    #[test]
    fn anchors_match_github() {
        assert_eq!(anchor_slug("1. Neon Nights!"), "1-neon-nights");
        assert_eq!(anchor_slug("Hello -- World"), "hello----world");
    }
}
