//!
//! src/download.rs  Andrew Belles  Oct 18th, 2025
//!
//! Resolves, fetches and tags audio for every record of a snapshot over a
//! small pool of workers. Every input record ends with exactly one outcome.
//!

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
    sync::Arc
};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::DownloadConfig;
use crate::duplicates::{self, DuplicateGroup};
use crate::errors::ArchiverError;
use crate::export::{write_atomic, write_playlist, PlaylistEntry};
use crate::fetch::MediaClient;
use crate::persistent::Ledger;
use crate::tagging::{write_tags, TagRequest};
use crate::types::SongRecord;
use crate::util::{is_valid_song_id, safe_filename};

pub const AUDIO_EXTENSIONS: [&str; 3] = ["mp3", "m4a", "wav"];
pub const PLAYLIST_NAME: &str = "suno_library";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Explicit,
    Guessed
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Explicit => "explicit",
            Provenance::Guessed => "guessed"
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagStatus {
    Written,
    Disabled,
    Failed(String)
}

impl fmt::Display for TagStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagStatus::Written => f.write_str("written"),
            TagStatus::Disabled => f.write_str("disabled"),
            TagStatus::Failed(reason) => write!(f, "failed:{reason}")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { path: PathBuf, provenance: Provenance, tagging: TagStatus },
    Skipped { path: PathBuf },
    Failed { reason: String, provenance: Option<Provenance> }
}

impl DownloadOutcome {
    fn failed(reason: impl Into<String>, provenance: Option<Provenance>) -> Self {
        DownloadOutcome::Failed { reason: reason.into(), provenance }
    }

    pub fn cancelled() -> Self {
        Self::failed("cancelled", None)
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            DownloadOutcome::Downloaded { path, .. } | DownloadOutcome::Skipped { path } => Some(path),
            DownloadOutcome::Failed { .. } => None
        }
    }

    pub fn provenance(&self) -> Option<Provenance> {
        match self {
            DownloadOutcome::Downloaded { provenance, .. } => Some(*provenance),
            DownloadOutcome::Failed { provenance, .. } => *provenance,
            DownloadOutcome::Skipped { .. } => None
        }
    }

    pub fn tag_status(&self) -> Option<&TagStatus> {
        match self {
            DownloadOutcome::Downloaded { tagging, .. } => Some(tagging),
            _ => None
        }
    }
}

impl fmt::Display for DownloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadOutcome::Downloaded { .. } => f.write_str("downloaded"),
            DownloadOutcome::Skipped { .. } => f.write_str("skipped"),
            DownloadOutcome::Failed { reason, .. } => write!(f, "failed:{reason}")
        }
    }
}

/// One unit of work; the stem is reserved before dispatch
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub key: String,
    pub stem: String,
    pub song: SongRecord
}

#[derive(Debug, Default)]
pub struct DownloadPlan {
    pub jobs: Vec<DownloadJob>,
    pub skipped: Vec<(String, PathBuf)>,
    /// planned key of every input record, in input order
    pub order: Vec<String>
}

/// Assigns keys and file stems. Keys repeated within one snapshot get a
/// `#n` suffix so none of them is lost from the outcome map.
pub fn plan_downloads(
    songs: &[SongRecord],
    existing: &HashMap<String, PathBuf>,
    dir: &Path
) -> DownloadPlan {
    let mut plan = DownloadPlan::default();
    let mut keys: HashSet<String> = HashSet::new();
    let mut stems: HashSet<String> = HashSet::new();

    for song in songs {
        let base = song.key();
        let key = if keys.contains(&base) {
            (2..).map(|n| format!("{base}#{n}"))
                .find(|k| !keys.contains(k))
                .unwrap_or_else(|| base.clone())
        } else {
            base
        };
        keys.insert(key.clone());
        plan.order.push(key.clone());

        if let Some(path) = existing.get(&key) {
            plan.skipped.push((key, path.clone()));
            continue;
        }

        let stem = reserve_stem(&mut stems, dir, &safe_filename(&song.title));
        plan.jobs.push(DownloadJob { key, stem, song: song.clone() });
    }
    plan
}

/// `base`, `base_1`, ... not yet taken in this batch or on disk under any
/// audio extension
fn reserve_stem(taken: &mut HashSet<String>, dir: &Path, base: &str) -> String {
    let free = |stem: &str, taken: &HashSet<String>| {
        !taken.contains(&stem.to_lowercase())
            && AUDIO_EXTENSIONS.iter().all(|ext| !dir.join(format!("{stem}.{ext}")).exists())
    };
    let stem = if free(base, taken) {
        base.to_string()
    } else {
        (1..).map(|n| format!("{base}_{n}"))
            .find(|s| free(s, taken))
            .unwrap_or_else(|| base.to_string())
    };
    taken.insert(stem.to_lowercase());
    stem
}

/// Guessed locations for an id, preferred format first
pub fn candidate_urls(id: &str, hosts: &[Url], preferred: &str) -> Vec<(Url, &'static str)> {
    let names = [
        (format!("{id}.mp3"), "mp3"),
        (format!("audio_{id}.mp3"), "mp3"),
        (format!("{id}.m4a"), "m4a"),
        (format!("{id}.wav"), "wav"),
    ];
    let mut candidates: Vec<(Url, &'static str)> = hosts.iter()
        .flat_map(|host| names.iter().filter_map(move |(name, ext)| {
            host.join(name).ok().map(|url| (url, *ext))
        }))
        .collect();
    candidates.sort_by_key(|(_, ext)| *ext != preferred);
    candidates
}

/// Extension of an explicit link, then its content type, then the default
fn audio_extension(url: &Url, content_type: Option<&str>, fallback: &str) -> String {
    let from_path = Path::new(url.path())
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|e| AUDIO_EXTENSIONS.contains(&e.as_str()));
    if let Some(ext) = from_path {
        return ext;
    }
    let from_type = content_type.and_then(|ct| {
        let ct = ct.to_ascii_lowercase();
        if ct.contains("mpeg") || ct.contains("mp3") {
            Some("mp3")
        } else if ct.contains("mp4") || ct.contains("m4a") || ct.contains("aac") {
            Some("m4a")
        } else if ct.contains("wav") {
            Some("wav")
        } else {
            None
        }
    });
    from_type.unwrap_or(fallback).to_string()
}

#[derive(Debug, Clone)]
struct Resolved {
    url: Url,
    provenance: Provenance,
    extension: Option<&'static str>
}

/// Result of a whole download run
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub outcomes: BTreeMap<String, DownloadOutcome>,
    pub duplicates: Vec<DuplicateGroup>,
    pub playlist: Option<PathBuf>
}

impl DownloadReport {
    pub fn count(&self, label: &str) -> usize {
        self.outcomes.values()
            .filter(|o| match o {
                DownloadOutcome::Downloaded { .. } => label == "downloaded",
                DownloadOutcome::Skipped { .. } => label == "skipped",
                DownloadOutcome::Failed { .. } => label == "failed"
            })
            .count()
    }

    pub fn tag_failures(&self) -> usize {
        self.outcomes.values()
            .filter(|o| matches!(o.tag_status(), Some(TagStatus::Failed(_))))
            .count()
    }
}

impl fmt::Display for DownloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "records:     {}", self.outcomes.len())?;
        writeln!(f, "downloaded:  {}", self.count("downloaded"))?;
        writeln!(f, "skipped:     {}", self.count("skipped"))?;
        writeln!(f, "failed:      {}", self.count("failed"))?;
        writeln!(f, "tag errors:  {}", self.tag_failures())?;
        for (key, outcome) in &self.outcomes {
            if let DownloadOutcome::Failed { reason, .. } = outcome {
                writeln!(f, "  {key}: {reason}")?;
            }
        }
        if !self.duplicates.is_empty() {
            writeln!(f, "duplicate groups: {}", self.duplicates.len())?;
            for group in &self.duplicates {
                match group.similarity {
                    Some(sim) => writeln!(f, "  [{} {sim:.2}] {}", group.method, group.ids.join(", "))?,
                    None => writeln!(f, "  [{}] {}", group.method, group.ids.join(", "))?
                }
            }
        }
        if let Some(path) = &self.playlist {
            writeln!(f, "playlist:    {}", path.display())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Downloader {
    cfg: DownloadConfig,
    client: MediaClient,
    shutdown: CancellationToken
}

impl Downloader {
    pub fn new(cfg: &DownloadConfig, client: MediaClient, shutdown: CancellationToken) -> Self {
        Self { cfg: cfg.clone(), client, shutdown }
    }

    /// Downloads everything, records outcomes in the ledger when given one,
    /// then reports duplicates and writes the playlist
    pub async fn run(
        &self,
        songs: &[SongRecord],
        ledger: Option<&Ledger>
    ) -> Result<DownloadReport, ArchiverError> {
        std::fs::create_dir_all(&self.cfg.download_dir)?;

        let existing = match ledger {
            Some(ledger) => ledger.downloaded_paths().await.unwrap_or_else(|e| {
                warn!(error = %e, "download.ledger.read_failed");
                HashMap::new()
            }),
            None => HashMap::new()
        };
        let plan = plan_downloads(songs, &existing, &self.cfg.download_dir);
        info!(
            records = songs.len(), jobs = plan.jobs.len(), skipped = plan.skipped.len(),
            workers = self.cfg.workers, "download.start"
        );

        let mut outcomes = self.dispatch(plan.jobs).await;
        for (key, path) in plan.skipped {
            outcomes.insert(key, DownloadOutcome::Skipped { path });
        }
        // anything the pool never answered for
        for key in &plan.order {
            outcomes.entry(key.clone()).or_insert_with(DownloadOutcome::cancelled);
        }

        if let Some(ledger) = ledger {
            self.record(ledger, &outcomes).await;
        }

        let duplicates = if self.cfg.detect_duplicates {
            self.detect_duplicates(songs, &plan.order, &outcomes).await
        } else {
            Vec::new()
        };

        let playlist = self.playlist(songs, &plan.order, &outcomes);
        let report = DownloadReport { outcomes, duplicates, playlist };
        info!(
            downloaded = report.count("downloaded"), skipped = report.count("skipped"),
            failed = report.count("failed"), "download.done"
        );
        Ok(report)
    }

    async fn dispatch(&self, jobs: Vec<DownloadJob>) -> BTreeMap<String, DownloadOutcome> {
        let mut outcomes = BTreeMap::new();
        if jobs.is_empty() {
            return outcomes;
        }

        let (job_tx, job_rx) = mpsc::channel::<DownloadJob>(self.cfg.queue_capacity.max(1));
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(String, DownloadOutcome)>();

        let mut handles = Vec::with_capacity(self.cfg.workers);
        for worker in 0..self.cfg.workers.max(1) {
            let this = self.clone();
            let rx = job_rx.clone();
            let tx = result_tx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    // lock only while waiting for the next job
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    let outcome = this.process(&job).await;
                    debug!(worker, key = %job.key, outcome = %outcome, "download.job.done");
                    if tx.send((job.key, outcome)).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        for job in jobs {
            if self.shutdown.is_cancelled() {
                outcomes.insert(job.key, DownloadOutcome::cancelled());
                continue;
            }
            let key = job.key.clone();
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    warn!(key = %key, "download.cancelled");
                    outcomes.insert(key, DownloadOutcome::cancelled());
                }
                sent = job_tx.send(job) => {
                    if sent.is_err() {
                        outcomes.insert(key, DownloadOutcome::failed("worker pool closed", None));
                    }
                }
            }
        }
        drop(job_tx);

        while let Some((key, outcome)) = result_rx.recv().await {
            outcomes.insert(key, outcome);
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = ?e, "download.worker.panicked");
            }
        }
        outcomes
    }

    async fn process(&self, job: &DownloadJob) -> DownloadOutcome {
        let resolved = match self.resolve(&job.song).await {
            Ok(resolved) => resolved,
            Err(e) => return DownloadOutcome::failed(e.to_string(), None)
        };
        let provenance = Some(resolved.provenance);

        let (bytes, content_type) = match self.client.bytes(&resolved.url).await {
            Ok(body) => body,
            Err(e) => return DownloadOutcome::failed(e.to_string(), provenance)
        };
        if content_type.as_deref().is_some_and(|ct| ct.starts_with("text/")) {
            return DownloadOutcome::failed(
                format!("not audio ({})", content_type.unwrap_or_default()), provenance);
        }
        if bytes.is_empty() {
            return DownloadOutcome::failed("empty body", provenance);
        }

        let extension = match resolved.extension {
            Some(ext) => ext.to_string(),
            None => audio_extension(&resolved.url, content_type.as_deref(), &self.cfg.preferred_format)
        };
        let path = self.cfg.download_dir.join(format!("{}.{extension}", job.stem));
        if let Err(e) = write_atomic(&path, &bytes) {
            return DownloadOutcome::failed(e.to_string(), provenance);
        }
        info!(key = %job.key, path = %path.display(), bytes = bytes.len(), "download.saved");

        let tagging = if self.cfg.add_metadata {
            self.tag(&job.song, &path).await
        } else {
            TagStatus::Disabled
        };
        DownloadOutcome::Downloaded { path, provenance: resolved.provenance, tagging }
    }

    async fn resolve(&self, song: &SongRecord) -> Result<Resolved, ArchiverError> {
        if let Some(explicit) = song.audio_url.as_deref() {
            let url = Url::parse(explicit)?;
            return Ok(Resolved { url, provenance: Provenance::Explicit, extension: None });
        }
        if !is_valid_song_id(&song.id) {
            return Err(ArchiverError::NotFound("no audio url and no song id".to_string()));
        }

        for (url, ext) in candidate_urls(&song.id, &self.cfg.cdn_hosts, &self.cfg.preferred_format) {
            if self.shutdown.is_cancelled() {
                return Err(ArchiverError::Timeout("cancelled while probing".to_string()));
            }
            match self.client.probe(&url).await {
                Ok(Some(probe)) if probe.content_length.is_some_and(|n| n > self.cfg.min_audio_bytes) => {
                    debug!(url = %probe.url, length = ?probe.content_length, "download.resolve.hit");
                    return Ok(Resolved { url, provenance: Provenance::Guessed, extension: Some(ext) });
                },
                Ok(_) => continue,
                Err(e) => debug!(url = %url, error = %e, "download.resolve.probe_failed")
            }
        }
        Err(ArchiverError::NotFound(format!("no cdn location for {}", song.id)))
    }

    async fn tag(&self, song: &SongRecord, path: &Path) -> TagStatus {
        let cover = match song.image_url.as_deref().map(Url::parse) {
            Some(Ok(url)) => match self.client.bytes(&url).await {
                Ok((bytes, _)) => Some(bytes),
                Err(e) => {
                    debug!(url = %url, error = %e, "download.cover.failed");
                    None
                }
            },
            _ => None
        };
        let request = TagRequest::from_record(song, &self.cfg.album).with_cover(cover);
        match write_tags(path.to_path_buf(), request).await {
            Ok(()) => TagStatus::Written,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "download.tag.failed");
                TagStatus::Failed(e.to_string())
            }
        }
    }

    async fn record(&self, ledger: &Ledger, outcomes: &BTreeMap<String, DownloadOutcome>) {
        for (key, outcome) in outcomes {
            let path = outcome.path().map(|p| p.to_string_lossy().into_owned());
            let provenance = outcome.provenance().map(Provenance::as_str);
            let tag_status = outcome.tag_status().map(|t| t.to_string());
            let result = ledger.record_outcome(
                key, path.as_deref(), provenance, tag_status.as_deref(), &outcome.to_string()
            ).await;
            if let Err(e) = result {
                warn!(key = %key, error = %e, "download.ledger.write_failed");
            }
        }
    }

    async fn detect_duplicates(
        &self,
        songs: &[SongRecord],
        order: &[String],
        outcomes: &BTreeMap<String, DownloadOutcome>
    ) -> Vec<DuplicateGroup> {
        let mut groups = duplicates::by_title(songs, order);
        groups.extend(duplicates::by_lyrics(songs, order));

        let files: Vec<(String, PathBuf)> = order.iter()
            .filter_map(|key| outcomes.get(key)
                .and_then(|o| o.path())
                .map(|p| (key.clone(), p.to_path_buf())))
            .collect();
        let fingerprint = self.cfg.fingerprint_duplicates;
        let threshold = self.cfg.fingerprint_threshold;

        let by_content = tokio::task::spawn_blocking(move || {
            let mut groups = duplicates::by_hash(&files);
            if fingerprint {
                groups.extend(duplicates::by_fingerprint(&files, threshold));
            }
            groups
        }).await;
        match by_content {
            Ok(found) => groups.extend(found),
            Err(e) => error!(error = ?e, "download.duplicates.panicked")
        }
        info!(groups = groups.len(), "download.duplicates");
        groups
    }

    fn playlist(
        &self,
        songs: &[SongRecord],
        order: &[String],
        outcomes: &BTreeMap<String, DownloadOutcome>
    ) -> Option<PathBuf> {
        let entries: Vec<PlaylistEntry> = songs.iter().zip(order)
            .filter_map(|(song, key)| {
                let path = outcomes.get(key)?.path()?;
                let location = path.file_name()?.to_string_lossy().into_owned();
                Some(PlaylistEntry::new(song, location))
            })
            .collect();
        if entries.is_empty() {
            return None;
        }
        match write_playlist(&self.cfg.download_dir, PLAYLIST_NAME, &entries) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "download.playlist.failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::HttpConfig;

    const ID: &str = "0b6c1b2e-5a57-4c1e-9a7e-3f4d2c1b0a99";

    fn song(id: &str, title: &str) -> SongRecord {
        SongRecord { id: id.into(), title: title.into(), ..Default::default() }
    }

    /// Serves `body` for paths ending in .mp3 and 404 for the rest
    async fn responder(body: Vec<u8>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).to_string();
                    let line = request.lines().next().unwrap_or_default().to_string();
                    let mut parts = line.split_whitespace();
                    let method = parts.next().unwrap_or_default();
                    let path = parts.next().unwrap_or_default();

                    let response = if path.ends_with(".mp3") {
                        let mut head = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\n\
                             Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()
                        ).into_bytes();
                        if method != "HEAD" {
                            head.extend_from_slice(&body);
                        }
                        head
                    } else {
                        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
                    };
                    let _ = stream.write_all(&response).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    fn downloader(dir: &Path, hosts: Vec<Url>, shutdown: CancellationToken) -> Downloader {
        let cfg = DownloadConfig {
            download_dir: dir.to_path_buf(),
            workers: 2,
            cdn_hosts: hosts,
            min_audio_bytes: 100,
            ..DownloadConfig::default()
        };
        let client = MediaClient::new(&HttpConfig::default()).unwrap();
        Downloader::new(&cfg, client, shutdown)
    }

    #[test]
    fn planning_reserves_unique_stems() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Echo.m4a"), b"x").unwrap();

        let songs = vec![song("a", "Echo"), song("b", "Neon"), song("c", "neon"), song("d", "Gone")];
        let mut existing = HashMap::new();
        existing.insert("d".to_string(), dir.path().join("Gone.mp3"));

        let plan = plan_downloads(&songs, &existing, dir.path());
        let stems: Vec<&str> = plan.jobs.iter().map(|j| j.stem.as_str()).collect();
        assert_eq!(stems, vec!["Echo_1", "Neon", "neon_1"]);
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn repeated_keys_stay_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let songs = vec![song("a", "One"), song("a", "Two"), song("", "Three")];
        let plan = plan_downloads(&songs, &HashMap::new(), dir.path());
        assert_eq!(plan.order, vec!["a", "a#2", "index-0"]);
    }

    #[test]
    fn candidates_put_preferred_format_first() {
        let hosts = vec![
            Url::parse("https://cdn1.suno.ai/").unwrap(),
            Url::parse("https://cdn2.suno.ai/").unwrap(),
        ];
        let all = candidate_urls(ID, &hosts, "m4a");
        assert_eq!(all.len(), 8);
        assert_eq!(all[0].0.as_str(), format!("https://cdn1.suno.ai/{ID}.m4a"));
        assert_eq!(all[1].0.as_str(), format!("https://cdn2.suno.ai/{ID}.m4a"));
        assert_eq!(all[2].0.as_str(), format!("https://cdn1.suno.ai/{ID}.mp3"));
        assert_eq!(all[3].0.as_str(), format!("https://cdn1.suno.ai/audio_{ID}.mp3"));
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(DownloadOutcome::cancelled().to_string(), "failed:cancelled");
        assert_eq!(DownloadOutcome::Skipped { path: "x.mp3".into() }.to_string(), "skipped");
        assert_eq!(TagStatus::Failed("bad".into()).to_string(), "failed:bad");
        let url = Url::parse("https://x.test/a/b").unwrap();
        assert_eq!(audio_extension(&url, Some("audio/mpeg"), "wav"), "mp3");
        assert_eq!(audio_extension(&url, None, "wav"), "wav");
    }

    #[tokio::test]
    async fn outcomes_cover_every_record() {
        let base = responder(b"not audio at all ".repeat(64)).await;
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(dir.path(), vec![base.clone()], CancellationToken::new());

        let mut explicit = song("", "Explicit");
        explicit.index = 1;
        explicit.audio_url = Some(base.join("track.mp3").unwrap().to_string());
        let mut broken = song("", "Broken Link");
        broken.url = "https://suno.com/song/broken".into();
        broken.audio_url = Some(base.join("missing.wav").unwrap().to_string());
        let mut nothing = song("", "Nothing");
        nothing.index = 3;
        let songs = vec![explicit, song(ID, "Guessed"), nothing, broken];

        let ledger = Ledger::init("sqlite::memory:").await.unwrap();
        let report = dl.run(&songs, Some(&ledger)).await.unwrap();
        assert_eq!(report.outcomes.len(), songs.len());

        match &report.outcomes["index-1"] {
            DownloadOutcome::Downloaded { path, provenance, tagging } => {
                assert_eq!(*provenance, Provenance::Explicit);
                assert!(matches!(tagging, TagStatus::Failed(_)));
                assert_eq!(std::fs::read(path).unwrap(), b"not audio at all ".repeat(64));
            },
            other => panic!("unexpected {other:?}")
        }
        assert_eq!(report.outcomes[ID].provenance(), Some(Provenance::Guessed));
        assert!(report.outcomes[ID].path().unwrap().ends_with("Guessed.mp3"));
        assert!(report.outcomes["https://suno.com/song/broken"].to_string().starts_with("failed:"));
        assert!(report.outcomes["index-3"].to_string().starts_with("failed:"));
        assert!(report.playlist.is_some());

        let row = ledger.download(ID).await.unwrap().unwrap();
        assert_eq!(row.outcome, "downloaded");
        assert_eq!(row.provenance.as_deref(), Some("guessed"));

        // second pass finds both files through the ledger
        let again = dl.run(&songs, Some(&ledger)).await.unwrap();
        assert_eq!(again.count("skipped"), 2);
        assert_eq!(again.outcomes.len(), songs.len());
    }

    #[tokio::test]
    async fn cancelled_run_fails_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let dl = downloader(dir.path(), Vec::new(), token);

        let songs = vec![song("a", "One"), song("b", "Two"), song("c", "Three")];
        let report = dl.run(&songs, None).await.unwrap();
        assert_eq!(report.outcomes.len(), 3);
        assert!(report.outcomes.values().all(|o| o.to_string() == "failed:cancelled"));
        assert!(report.playlist.is_none());
    }

    #[tokio::test]
    async fn identical_downloads_are_reported() {
        let base = responder(b"same payload ".repeat(32)).await;
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(dir.path(), Vec::new(), CancellationToken::new());

        let mut a = song("", "Neon Nights");
        a.index = 1;
        a.lyrics = "[Verse]\nneon glow".into();
        a.audio_url = Some(base.join("a.mp3").unwrap().to_string());
        let mut b = song("", "Neon Nights");
        b.index = 2;
        b.lyrics = "[Verse] neon glow\n".into();
        b.audio_url = Some(base.join("b.mp3").unwrap().to_string());

        let report = dl.run(&[a, b], None).await.unwrap();
        assert_eq!(report.count("downloaded"), 2);
        let methods: Vec<String> = report.duplicates.iter().map(|g| g.method.to_string()).collect();
        assert_eq!(methods, vec!["title", "lyrics", "hash"]);
    }

    #[tokio::test]
    async fn repeated_ids_group_under_their_planned_keys() {
        let base = responder(b"same payload ".repeat(32)).await;
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(dir.path(), Vec::new(), CancellationToken::new());

        let songs: Vec<SongRecord> = ["a.mp3", "b.mp3"].iter()
            .map(|name| {
                let mut s = song("x", "Neon Nights");
                s.audio_url = Some(base.join(name).unwrap().to_string());
                s
            })
            .collect();

        let report = dl.run(&songs, None).await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        for group in &report.duplicates {
            assert_eq!(group.ids, vec!["x", "x#2"]);
            assert!(group.ids.iter().all(|id| report.outcomes.contains_key(id)));
        }
        assert_eq!(report.duplicates.len(), 2);
    }
}
