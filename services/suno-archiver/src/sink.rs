//!
//! src/sink.rs  Andrew Belles  Oct 18th, 2025
//!
//! Compressed on-disk archive of the raw page html a scrape saw, kept so
//! extraction misses can be diagnosed offline
//!

use std::{fs, io::Write, path::{Path, PathBuf}};

use crate::errors::ArchiverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawType {
    ListingPage,
    DetailPage
}

#[derive(Debug)]
pub struct DiskZstdSink {
    root: PathBuf,
    level: i32
}

impl DiskZstdSink {
    pub fn new(root: impl AsRef<Path>, level: i32) -> Self {
        Self { root: root.as_ref().to_path_buf(), level: level.clamp(0, 21) }
    }

    pub fn write_html(&self, kind: RawType, key: &str, html: &str) -> Result<PathBuf, ArchiverError> {
        let path = self.root.join(Self::rel_path(kind, Self::sanitize_key(key)));
        let parent = path.parent()
            .ok_or_else(|| ArchiverError::Config(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent)?;

        let temp = tempfile::NamedTempFile::new_in(parent)?;
        {
            let mut enc = zstd::stream::write::Encoder::new(temp.as_file(), self.level)?;
            enc.write_all(html.as_bytes())?;
            enc.finish()?;
        }
        temp.persist(&path)?;
        Ok(path)
    }

    /// Reads an archived page back, used by tests and offline re-parsing
    pub fn read_html(path: &Path) -> Result<String, ArchiverError> {
        let bytes = zstd::stream::decode_all(fs::File::open(path)?)?;
        String::from_utf8(bytes)
            .map_err(|e| ArchiverError::Parse(format!("{}: {e}", path.display())))
    }

    fn rel_path(kind: RawType, sanitized_key: String) -> PathBuf {
        let dir = match kind {
            RawType::ListingPage => "raw/listing",
            RawType::DetailPage  => "raw/detail"
        };
        PathBuf::from(dir).join(format!("{sanitized_key}.html.zst"))
    }

    fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}
