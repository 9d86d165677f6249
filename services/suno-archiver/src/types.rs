//!
//! src/types.rs  Andrew Belles  Oct 18th, 2025
//!
//! Song records and the structured snapshot they are exchanged in
//!

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ArchiverError;
use crate::util::extract_song_id;

/// Format tag written into every snapshot
pub const SNAPSHOT_VERSION: &str = "2.0";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SongRecord {
    pub id: String,
    pub index: usize,
    pub title: String,
    pub artist: String,
    pub duration: String,
    pub plays: String,
    pub likes: String,
    pub created_at: String,
    pub tags: Vec<String>,
    pub description: String,
    pub lyrics: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    pub liked: bool,
    pub disliked: bool,
    pub source_tab: String
}

impl SongRecord {
    /// Key used in result maps: id, then url, then the scrape position
    pub fn key(&self) -> String {
        if !self.id.is_empty() {
            self.id.clone()
        } else if !self.url.is_empty() {
            self.url.clone()
        } else {
            format!("index-{}", self.index)
        }
    }

    /// Seen-set key for dedup; records with neither id nor url have none
    pub fn dedup_key(&self) -> Option<&str> {
        if !self.id.is_empty() {
            Some(&self.id)
        } else if !self.url.is_empty() {
            Some(&self.url)
        } else {
            None
        }
    }

    pub fn is_keepable(&self) -> bool {
        !self.title.trim().is_empty() || !self.id.is_empty()
    }

    /// Appends tags not already present, keeping first-seen order
    pub fn merge_tags<I: IntoIterator<Item = String>>(&mut self, tags: I) {
        for tag in tags {
            let tag = tag.trim().to_string();
            if !tag.is_empty() && !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
    }

    /// Fills the id from the url and turns empty optional strings into None.
    /// Snapshots written by other producers rely on this.
    pub fn normalize(&mut self) {
        if self.id.is_empty() {
            if let Some(id) = extract_song_id(&self.url) {
                self.id = id;
            }
        }
        for field in [&mut self.image_url, &mut self.audio_url] {
            if field.as_deref().is_some_and(|s| s.trim().is_empty()) {
                *field = None;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub extracted_at: String,
    pub total_songs: usize,
    pub extractor_version: String
}

impl SnapshotMetadata {
    /// Accepts RFC 3339 as well as the naive timestamps older exports carry
    pub fn extracted_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.extracted_at)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(&self.extracted_at, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    #[serde(default)]
    pub songs: Vec<SongRecord>
}

impl Snapshot {
    pub fn new(songs: Vec<SongRecord>) -> Self {
        Self::at(songs, Utc::now())
    }

    pub fn at(songs: Vec<SongRecord>, extracted_at: DateTime<Utc>) -> Self {
        Self {
            metadata: SnapshotMetadata {
                extracted_at: extracted_at.to_rfc3339(),
                total_songs: songs.len(),
                extractor_version: SNAPSHOT_VERSION.to_string()
            },
            songs
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ArchiverError> {
        let mut snapshot: Snapshot = serde_json::from_str(raw)?;
        snapshot.songs.iter_mut().for_each(SongRecord::normalize);
        Ok(snapshot)
    }

    pub fn load(path: &Path) -> Result<Self, ArchiverError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ArchiverError::NotFound(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.songs.iter().map(|s| s.id.as_str()).collect()
    }
}
