//!
//! src/persistent.rs  Andrew Belles  Oct 18th, 2025
//!
//! Sqlite ledger of every song seen across snapshots and every download
//! outcome, so re-runs skip files that already exist
//!

use std::{collections::HashMap, path::PathBuf};

use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use tracing::{debug, info};

use crate::errors::ArchiverError;
use crate::types::SongRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportCounts {
    pub new_songs: usize,
    pub known_songs: usize
}

/// One row of the downloads table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRow {
    pub song_key: String,
    pub path: Option<String>,
    pub provenance: Option<String>,
    pub tag_status: Option<String>,
    pub outcome: String,
    pub updated_at: i64
}

#[derive(Debug, Clone)]
pub struct Ledger {
    pool: Pool<Sqlite>
}

impl Ledger {
    pub async fn init(database_url: &str) -> Result<Self, ArchiverError> {
        // every connection to :memory: is its own database
        let max = if database_url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(max)
            .connect(database_url)
            .await
            .map_err(|e| ArchiverError::Db(format!("connecting to sqlite at {database_url}: {e}")))?;

        sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous=NORMAL;").execute(&pool).await?;

        let this = Self { pool };
        this.ensure_schema().await?;
        debug!(url = database_url, "ledger.open");
        Ok( this )
    }

    async fn ensure_schema(&self) -> Result<(), ArchiverError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS songs (
              url           TEXT PRIMARY KEY,
              id            TEXT,
              title         TEXT,
              artist        TEXT,
              first_seen    INTEGER NOT NULL,
              last_seen     INTEGER NOT NULL
            );
            "#
        ).execute(&self.pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
              song_key      TEXT PRIMARY KEY,
              path          TEXT,
              provenance    TEXT,
              tag_status    TEXT,
              outcome       TEXT NOT NULL,
              updated_at    INTEGER NOT NULL
            );
            "#
        ).execute(&self.pool).await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_songs_id ON songs(id);"
        ).execute(&self.pool).await?;

        Ok(())
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    /// Upserts every record with a url, counting which were new
    pub async fn import_snapshot(&self, songs: &[SongRecord]) -> Result<ImportCounts, ArchiverError> {
        let mut counts = ImportCounts::default();
        let now = Self::now();
        let mut tx = self.pool.begin().await?;

        for song in songs.iter().filter(|s| !s.url.is_empty()) {
            let existing = sqlx::query("SELECT 1 FROM songs WHERE url = ?1;")
                .bind(&song.url)
                .fetch_optional(&mut *tx)
                .await?;

            if existing.is_some() {
                sqlx::query(
                    r#"
                    UPDATE songs
                       SET id = COALESCE(NULLIF(?1, ''), id),
                           title = COALESCE(NULLIF(?2, ''), title),
                           artist = COALESCE(NULLIF(?3, ''), artist),
                           last_seen = ?4
                     WHERE url = ?5;
                    "#
                )
                .bind(&song.id)
                .bind(&song.title)
                .bind(&song.artist)
                .bind(now)
                .bind(&song.url)
                .execute(&mut *tx)
                .await?;
                counts.known_songs += 1;
            } else {
                sqlx::query(
                    r#"
                    INSERT INTO songs (url, id, title, artist, first_seen, last_seen)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?5);
                    "#
                )
                .bind(&song.url)
                .bind(&song.id)
                .bind(&song.title)
                .bind(&song.artist)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                counts.new_songs += 1;
            }
        }

        tx.commit().await?;
        info!(new = counts.new_songs, known = counts.known_songs, "ledger.import");
        Ok(counts)
    }

    pub async fn record_outcome(
        &self,
        song_key: &str,
        path: Option<&str>,
        provenance: Option<&str>,
        tag_status: Option<&str>,
        outcome: &str
    ) -> Result<(), ArchiverError> {
        sqlx::query(
            r#"
            INSERT INTO downloads (song_key, path, provenance, tag_status, outcome, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(song_key) DO UPDATE SET
                path = COALESCE(excluded.path, downloads.path),
                provenance = COALESCE(excluded.provenance, downloads.provenance),
                tag_status = COALESCE(excluded.tag_status, downloads.tag_status),
                outcome = excluded.outcome,
                updated_at = excluded.updated_at;
            "#
        )
        .bind(song_key)
        .bind(path)
        .bind(provenance)
        .bind(tag_status)
        .bind(outcome)
        .bind(Self::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn download(&self, song_key: &str) -> Result<Option<DownloadRow>, ArchiverError> {
        let row = sqlx::query(
            r#"
            SELECT song_key, path, provenance, tag_status, outcome, updated_at
              FROM downloads WHERE song_key = ?1;
            "#
        )
        .bind(song_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| DownloadRow {
            song_key: r.get("song_key"),
            path: r.get("path"),
            provenance: r.get("provenance"),
            tag_status: r.get("tag_status"),
            outcome: r.get("outcome"),
            updated_at: r.get("updated_at")
        }))
    }

    /// Paths of earlier successful downloads that are still on disk
    pub async fn downloaded_paths(&self) -> Result<HashMap<String, PathBuf>, ArchiverError> {
        let rows = sqlx::query(
            "SELECT song_key, path FROM downloads WHERE path IS NOT NULL AND outcome IN ('downloaded', 'skipped');"
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter()
            .map(|r| (r.get::<String, _>("song_key"), PathBuf::from(r.get::<String, _>("path"))))
            .filter(|(_, path)| path.exists())
            .collect())
    }

    pub async fn song_count(&self) -> Result<i64, ArchiverError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM songs;")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(url: &str, title: &str) -> SongRecord {
        SongRecord { url: url.into(), title: title.into(), ..Default::default() }
    }

    #[tokio::test]
    async fn import_counts_new_and_known() -> Result<(), ArchiverError> {
        let ledger = Ledger::init("sqlite::memory:").await?;
        let first = ledger.import_snapshot(&[song("u1", "A"), song("u2", "B"), song("", "no url")]).await?;
        assert_eq!(first, ImportCounts { new_songs: 2, known_songs: 0 });

        let second = ledger.import_snapshot(&[song("u2", ""), song("u3", "C")]).await?;
        assert_eq!(second, ImportCounts { new_songs: 1, known_songs: 1 });
        assert_eq!(ledger.song_count().await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn outcomes_upsert_and_feed_skips() -> Result<(), ArchiverError> {
        let dir = tempfile::tempdir()?;
        let kept = dir.path().join("kept.mp3");
        std::fs::write(&kept, b"x")?;
        let gone = dir.path().join("gone.mp3");

        let ledger = Ledger::init("sqlite::memory:").await?;
        ledger.record_outcome("a", None, Some("guessed"), None, "failed:http 404").await?;
        ledger.record_outcome("a", kept.to_str(), Some("guessed"), Some("written"), "downloaded").await?;
        ledger.record_outcome("b", gone.to_str(), Some("explicit"), Some("written"), "downloaded").await?;
        ledger.record_outcome("c", None, None, None, "failed:cancelled").await?;

        let row = ledger.download("a").await?.unwrap();
        assert_eq!(row.outcome, "downloaded");
        assert_eq!(row.tag_status.as_deref(), Some("written"));

        let paths = ledger.downloaded_paths().await?;
        assert_eq!(paths.len(), 1);
        assert_eq!(paths.get("a"), Some(&kept));
        Ok(())
    }

    #[tokio::test]
    async fn file_backed_ledger_persists() -> Result<(), ArchiverError> {
        let dir = tempfile::tempdir()?;
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("ledger.db").display());
        {
            let ledger = Ledger::init(&url).await?;
            ledger.import_snapshot(&[song("u1", "A")]).await?;
        }
        let ledger = Ledger::init(&url).await?;
        assert_eq!(ledger.song_count().await?, 1);
        Ok(())
    }
}
