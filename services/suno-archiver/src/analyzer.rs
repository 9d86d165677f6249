//!
//! src/analyzer.rs  Andrew Belles  Oct 18th, 2025
//!
//! Read-only statistics and queries over a loaded snapshot
//!

use std::{collections::{BTreeMap, HashMap}, fmt, path::Path};

use crate::errors::ArchiverError;
use crate::types::{Snapshot, SongRecord};
use crate::util::{format_duration, format_duration_long, parse_duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    Title,
    Artist,
    Lyrics,
    Tags,
    Description
}

impl SearchField {
    pub fn parse(s: &str) -> Option<SearchField> {
        match s.trim().to_ascii_lowercase().as_str() {
            "title" => Some(SearchField::Title),
            "artist" => Some(SearchField::Artist),
            "lyrics" => Some(SearchField::Lyrics),
            "tags" | "tag" => Some(SearchField::Tags),
            "description" | "prompt" => Some(SearchField::Description),
            _ => None
        }
    }

    fn matches(self, song: &SongRecord, needle: &str) -> bool {
        let hit = |s: &str| s.to_lowercase().contains(needle);
        match self {
            SearchField::Title => hit(&song.title),
            SearchField::Artist => hit(&song.artist),
            SearchField::Lyrics => hit(&song.lyrics),
            SearchField::Description => hit(&song.description),
            SearchField::Tags => song.tags.iter().any(|t| hit(t))
        }
    }
}

pub const DEFAULT_SEARCH_FIELDS: [SearchField; 3] =
    [SearchField::Title, SearchField::Lyrics, SearchField::Tags];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionStats {
    pub total_songs: usize,
    pub with_lyrics: usize,
    pub with_description: usize,
    pub liked: usize,
    pub total_seconds: u64,
    pub timed_songs: usize,
    pub unparsable_durations: usize,
    pub average_seconds: Option<f64>,
    /// lowercased tag and count, most frequent first, ties by name
    pub tag_frequency: Vec<(String, usize)>,
    pub source_tabs: BTreeMap<String, usize>
}

impl CollectionStats {
    pub fn unique_tags(&self) -> usize {
        self.tag_frequency.len()
    }
}

impl fmt::Display for CollectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "songs:            {}", self.total_songs)?;
        writeln!(f, "total duration:   {} ({} timed, {} unparsable)",
            format_duration_long(self.total_seconds), self.timed_songs, self.unparsable_durations)?;
        if let Some(avg) = self.average_seconds {
            writeln!(f, "average duration: {}", format_duration(avg.round() as u64))?;
        }
        writeln!(f, "with lyrics:      {}", self.with_lyrics)?;
        writeln!(f, "with description: {}", self.with_description)?;
        writeln!(f, "liked:            {}", self.liked)?;
        writeln!(f, "unique tags:      {}", self.unique_tags())?;
        for (tag, count) in self.tag_frequency.iter().take(10) {
            writeln!(f, "  {count:>4}  {tag}")?;
        }
        for (tab, count) in &self.source_tabs {
            let tab = if tab.is_empty() { "(none)" } else { tab.as_str() };
            writeln!(f, "tab {tab}: {count}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CollectionAnalyzer {
    snapshot: Snapshot
}

impl CollectionAnalyzer {
    pub fn load(path: &Path) -> Result<Self, ArchiverError> {
        Ok(Self::from_snapshot(Snapshot::load(path)?))
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn songs(&self) -> &[SongRecord] {
        &self.snapshot.songs
    }

    pub fn stats(&self) -> CollectionStats {
        let songs = self.songs();
        let mut stats = CollectionStats { total_songs: songs.len(), ..Default::default() };
        let mut tags: HashMap<String, usize> = HashMap::new();

        for song in songs {
            match parse_duration(&song.duration) {
                Some(secs) => {
                    stats.total_seconds = stats.total_seconds.saturating_add(secs);
                    stats.timed_songs += 1;
                },
                None => stats.unparsable_durations += 1
            }
            if !song.lyrics.trim().is_empty() {
                stats.with_lyrics += 1;
            }
            if !song.description.trim().is_empty() {
                stats.with_description += 1;
            }
            if song.liked {
                stats.liked += 1;
            }
            for tag in &song.tags {
                let tag = tag.trim().to_lowercase();
                if !tag.is_empty() {
                    *tags.entry(tag).or_default() += 1;
                }
            }
            *stats.source_tabs.entry(song.source_tab.clone()).or_default() += 1;
        }

        if stats.timed_songs > 0 {
            stats.average_seconds = Some(stats.total_seconds as f64 / stats.timed_songs as f64);
        }
        let mut frequency: Vec<(String, usize)> = tags.into_iter().collect();
        frequency.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        stats.tag_frequency = frequency;
        stats
    }

    /// Case-insensitive substring search over title, lyrics and tags
    pub fn search(&self, query: &str) -> Vec<&SongRecord> {
        self.search_fields(query, &DEFAULT_SEARCH_FIELDS)
    }

    pub fn search_fields(&self, query: &str, fields: &[SearchField]) -> Vec<&SongRecord> {
        let needle = query.trim().to_lowercase();
        self.songs().iter()
            .filter(|song| fields.iter().any(|f| f.matches(song, &needle)))
            .collect()
    }

    /// Exact tag names, case-insensitive; any one of them, or all with `match_all`
    pub fn filter_by_tags(&self, tags: &[String], match_all: bool) -> Vec<&SongRecord> {
        let wanted: Vec<String> = tags.iter().map(|t| t.trim().to_lowercase()).collect();
        self.songs().iter()
            .filter(|song| {
                let has = |w: &String| song.tags.iter().any(|t| t.trim().to_lowercase() == *w);
                if match_all { wanted.iter().all(has) } else { wanted.iter().any(has) }
            })
            .collect()
    }

    /// Inclusive bounds in seconds; songs without a parsable duration never match
    pub fn filter_by_duration(&self, min: Option<u64>, max: Option<u64>) -> Vec<&SongRecord> {
        self.songs().iter()
            .filter(|song| match parse_duration(&song.duration) {
                Some(secs) => min.is_none_or(|m| secs >= m) && max.is_none_or(|m| secs <= m),
                None => false
            })
            .collect()
    }
}
