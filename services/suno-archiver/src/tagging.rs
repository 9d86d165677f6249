//!
//! src/tagging.rs  Andrew Belles  Oct 18th, 2025
//!
//! Embeds song metadata and cover art into downloaded audio files
//!

use std::path::{Path, PathBuf};

use lofty::config::WriteOptions;
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::picture::{Picture, PictureType};
use lofty::probe::Probe;
use lofty::tag::{Accessor, ItemKey, Tag};
use tracing::debug;

use crate::errors::ArchiverError;
use crate::types::SongRecord;

pub const DEFAULT_ARTIST: &str = "Suno AI";

/// Everything written into the tag container of one file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagRequest {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub genre: Option<String>,
    pub comment: Option<String>,
    pub lyrics: Option<String>,
    pub cover: Option<Vec<u8>>
}

fn present(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() { None } else { Some(s.to_string()) }
}

impl TagRequest {
    pub fn from_record(song: &SongRecord, album: &str) -> Self {
        Self {
            title: present(&song.title).unwrap_or_else(|| "Untitled".to_string()),
            artist: present(&song.artist).unwrap_or_else(|| DEFAULT_ARTIST.to_string()),
            album: album.to_string(),
            genre: present(&song.tags.join(", ")),
            comment: present(&song.description),
            lyrics: present(&song.lyrics),
            cover: None
        }
    }

    pub fn with_cover(mut self, cover: Option<Vec<u8>>) -> Self {
        self.cover = cover.filter(|bytes| !bytes.is_empty());
        self
    }
}

/// Blocking write; unsupported or malformed audio is a Tag error and the
/// file is left untouched
pub fn write_tags_sync(path: &Path, request: &TagRequest) -> Result<(), ArchiverError> {
    let mut tagged = Probe::open(path)?.guess_file_type()?.read()?;

    if tagged.primary_tag_mut().is_none() {
        let tag_type = tagged.primary_tag_type();
        tagged.insert_tag(Tag::new(tag_type));
    }
    let tag = tagged.primary_tag_mut()
        .ok_or_else(|| ArchiverError::Tag(format!("no writable tag for {}", path.display())))?;

    tag.set_title(request.title.clone());
    tag.set_artist(request.artist.clone());
    tag.set_album(request.album.clone());
    if let Some(genre) = &request.genre {
        tag.set_genre(genre.clone());
    }
    if let Some(comment) = &request.comment {
        tag.set_comment(comment.clone());
    }
    if let Some(lyrics) = &request.lyrics {
        tag.insert_text(ItemKey::Lyrics, lyrics.clone());
    }
    if let Some(cover) = &request.cover {
        match Picture::from_reader(&mut cover.as_slice()) {
            Ok(mut picture) => {
                picture.set_pic_type(PictureType::CoverFront);
                tag.push_picture(picture);
            },
            Err(e) => debug!(error = %e, "tag.cover.unreadable")
        }
    }

    tagged.save_to_path(path, WriteOptions::default())?;
    Ok(())
}

/// Runs the write on the blocking pool
pub async fn write_tags(path: PathBuf, request: TagRequest) -> Result<(), ArchiverError> {
    tokio::task::spawn_blocking(move || write_tags_sync(&path, &request)).await?
}
