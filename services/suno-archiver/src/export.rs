//!
//! src/export.rs  Andrew Belles  Oct 18th, 2025
//!
//! Renders a collection as csv, json snapshot, markdown and m3u. Renderers
//! are pure, writers are atomic.
//!

use std::{fmt::Write as _, fs, io::Write, path::{Path, PathBuf}};

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::config::{ExportConfig, ExportFormat};
use crate::errors::ArchiverError;
use crate::types::{Snapshot, SongRecord};
use crate::util::{anchor_slug, parse_duration};

pub const CSV_HEADER: [&str; 11] = [
    "index", "title", "artist", "duration", "plays", "likes",
    "created_at", "tags", "description", "lyrics", "url",
];

pub const TAG_SEPARATOR: &str = ", ";

pub fn render_csv(songs: &[SongRecord]) -> Result<String, ArchiverError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for song in songs {
        let index = song.index.to_string();
        let tags = song.tags.join(TAG_SEPARATOR);
        writer.write_record([
            index.as_str(),
            song.title.as_str(),
            song.artist.as_str(),
            song.duration.as_str(),
            song.plays.as_str(),
            song.likes.as_str(),
            song.created_at.as_str(),
            tags.as_str(),
            song.description.as_str(),
            song.lyrics.as_str(),
            song.url.as_str(),
        ])?;
    }
    let bytes = writer.into_inner()
        .map_err(|e| ArchiverError::Parse(format!("csv flush: {e}")))?;
    String::from_utf8(bytes).map_err(|e| ArchiverError::Parse(format!("csv utf8: {e}")))
}

pub fn render_json(snapshot: &Snapshot) -> Result<String, ArchiverError> {
    Ok(serde_json::to_string_pretty(snapshot)?)
}

/// Table cells cannot hold pipes or line breaks
fn cell(s: &str) -> String {
    s.replace('|', "\\|").replace(['\r', '\n'], " ")
}

fn heading(song: &SongRecord) -> String {
    let title = if song.title.trim().is_empty() { "Untitled" } else { song.title.trim() };
    format!("{}. {}", song.index, title)
}

pub fn render_markdown(songs: &[SongRecord], extracted_at: DateTime<Utc>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Suno Liked Songs\n");
    let _ = writeln!(out, "**Extracted:** {}", extracted_at.format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(out, "**Total Songs:** {}\n", songs.len());
    out.push_str("---\n\n## Table of Contents\n\n");

    for song in songs {
        let h = heading(song);
        let _ = writeln!(out, "- [{}](#{})", h, anchor_slug(&h));
    }
    out.push_str("\n---\n\n");

    for song in songs {
        let _ = writeln!(out, "## {}\n", heading(song));
        out.push_str("| Attribute | Value |\n|-----------|-------|\n");
        let rows = [
            ("Artist", &song.artist),
            ("Duration", &song.duration),
            ("Plays", &song.plays),
            ("Likes", &song.likes),
            ("Created", &song.created_at),
        ];
        for (name, value) in rows {
            if !value.trim().is_empty() {
                let _ = writeln!(out, "| **{name}** | {} |", cell(value));
            }
        }
        if !song.url.is_empty() {
            let _ = writeln!(out, "| **URL** | [{0}]({0}) |", song.url);
        }
        out.push('\n');

        if !song.tags.is_empty() {
            let tags: Vec<String> = song.tags.iter().map(|t| format!("`{t}`")).collect();
            let _ = writeln!(out, "**Tags:** {}\n", tags.join(" • "));
        }
        if !song.description.trim().is_empty() {
            let _ = writeln!(out, "### Description\n\n{}\n", song.description.trim());
        }
        if !song.lyrics.trim().is_empty() {
            let _ = writeln!(out, "### Lyrics\n\n```\n{}\n```\n", song.lyrics.trim_end());
        }
        out.push_str("---\n\n");
    }
    out
}

/// One playlist line; `location` is written verbatim
#[derive(Debug, Clone)]
pub struct PlaylistEntry {
    pub location: String,
    pub title: String,
    pub artist: String,
    pub duration: String
}

impl PlaylistEntry {
    pub fn new(song: &SongRecord, location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            title: song.title.clone(),
            artist: song.artist.clone(),
            duration: song.duration.clone()
        }
    }
}

pub fn render_m3u(entries: &[PlaylistEntry]) -> String {
    let mut out = String::from("#EXTM3U\n");
    for entry in entries {
        // -1 marks an unknown length
        let seconds = parse_duration(&entry.duration).map_or(-1, |s| s as i64);
        let title = if entry.title.is_empty() { "Unknown" } else { entry.title.as_str() };
        let artist = if entry.artist.is_empty() { "Suno AI" } else { entry.artist.as_str() };
        let _ = writeln!(out, "#EXTINF:{seconds},{artist} - {title}");
        let _ = writeln!(out, "{}", entry.location);
    }
    out
}

/// Writes through a temp file in the target directory so readers never
/// see a partial file
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArchiverError> {
    let parent = path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path)?;
    Ok(())
}

pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), ArchiverError> {
    write_atomic(path, render_json(snapshot)?.as_bytes())
}

pub fn write_playlist(dir: &Path, name: &str, entries: &[PlaylistEntry]) -> Result<PathBuf, ArchiverError> {
    let path = dir.join(format!("{name}.m3u"));
    write_atomic(&path, render_m3u(entries).as_bytes())?;
    info!(path = %path.display(), entries = entries.len(), "export.playlist");
    Ok(path)
}

#[derive(Debug, Clone)]
pub struct Exporter {
    cfg: ExportConfig
}

impl Exporter {
    pub fn new(cfg: &ExportConfig) -> Self {
        Self { cfg: cfg.clone() }
    }

    pub fn default_name(format: ExportFormat, at: DateTime<Utc>) -> String {
        format!("suno_songs_{}.{}", at.format("%Y%m%d_%H%M%S"), format.extension())
    }

    /// Writes every configured format; a failing format does not stop the
    /// others and comes back in the error list
    pub fn export(
        &self,
        snapshot: &Snapshot
    ) -> (Vec<(ExportFormat, PathBuf)>, Vec<(ExportFormat, ArchiverError)>) {
        let at = snapshot.metadata.extracted_at_utc().unwrap_or_else(Utc::now);
        let mut written = Vec::new();
        let mut failed = Vec::new();

        for &format in &self.cfg.formats {
            let path = self.cfg.output_dir.join(Self::default_name(format, at));
            let result = match format {
                ExportFormat::Json => write_snapshot(&path, snapshot),
                ExportFormat::Csv => render_csv(&snapshot.songs)
                    .and_then(|csv| write_atomic(&path, csv.as_bytes())),
                ExportFormat::Markdown => write_atomic(
                    &path, render_markdown(&snapshot.songs, at).as_bytes()
                )
            };
            match result {
                Ok(()) => {
                    info!(format = format.extension(), path = %path.display(), "export.written");
                    written.push((format, path));
                },
                Err(e) => {
                    error!(format = format.extension(), error = %e, "export.failed");
                    failed.push((format, e));
                }
            }
        }
        (written, failed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::analyzer::CollectionAnalyzer;

    fn songs() -> Vec<SongRecord> {
        vec![
            SongRecord {
                index: 1, id: "a".into(), title: "Neon Nights".into(), artist: "synthkid".into(),
                duration: "3:24".into(), tags: vec!["synthwave".into(), "80s".into()],
                lyrics: "line one\nline, \"two\"".into(), url: "https://suno.com/song/a".into(),
                ..Default::default()
            },
            SongRecord {
                index: 2, id: "b".into(), title: "No Artist".into(),
                url: "https://suno.com/song/b".into(),
                ..Default::default()
            },
            SongRecord {
                index: 3, id: "c".into(), title: "Pipes | Commas, Too".into(), artist: "x".into(),
                description: "a, b".into(), url: "https://suno.com/song/c".into(),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn csv_keeps_eleven_columns_per_row() {
        let csv = render_csv(&songs()).unwrap();
        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        assert_eq!(reader.headers().unwrap().iter().collect::<Vec<_>>(), CSV_HEADER.to_vec());

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.len() == 11));
        assert_eq!(&rows[1][2], "");
        assert_eq!(&rows[1][1], "No Artist");
        assert_eq!(&rows[0][7], "synthwave, 80s");
        assert_eq!(&rows[0][9], "line one\nline, \"two\"");
    }

    #[test]
    fn markdown_has_toc_and_sections() {
        let at = Utc.with_ymd_and_hms(2025, 10, 31, 12, 0, 0).unwrap();
        let md = render_markdown(&songs(), at);
        assert!(md.starts_with("# Suno Liked Songs"));
        assert!(md.contains("**Total Songs:** 3"));
        assert!(md.contains("- [1. Neon Nights](#1-neon-nights)"));
        assert!(md.contains("## 1. Neon Nights"));
        assert!(md.contains("| **Artist** | synthkid |"));
        assert!(md.contains("**Tags:** `synthwave` • `80s`"));
        assert!(md.contains("```\nline one\nline, \"two\"\n```"));
        assert!(md.contains("## 3. Pipes | Commas, Too"));
        assert_eq!(md.matches("| **Artist** |").count(), 2);
    }

    #[test]
    fn m3u_lines() {
        let list = songs();
        let entries = vec![
            PlaylistEntry::new(&list[0], "Neon Nights.mp3"),
            PlaylistEntry::new(&list[1], "No Artist.mp3"),
        ];
        let m3u = render_m3u(&entries);
        assert_eq!(
            m3u,
            "#EXTM3U\n#EXTINF:204,synthkid - Neon Nights\nNeon Nights.mp3\n\
             #EXTINF:-1,Suno AI - No Artist\nNo Artist.mp3\n"
        );
    }

    #[test]
    fn exported_snapshot_loads_back_into_analyzer() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ExportConfig {
            output_dir: dir.path().to_path_buf(),
            formats: vec![ExportFormat::Json, ExportFormat::Csv, ExportFormat::Markdown]
        };
        let snapshot = Snapshot::new(songs());
        let (written, failed) = Exporter::new(&cfg).export(&snapshot);
        assert!(failed.is_empty());
        assert_eq!(written.len(), 3);

        let json = written.iter().find(|(f, _)| *f == ExportFormat::Json).unwrap();
        let analyzer = CollectionAnalyzer::load(&json.1).unwrap();
        assert_eq!(analyzer.songs().len(), 3);
        let ids: Vec<&str> = analyzer.songs().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, snapshot.ids());
    }
}
