//!
//! src/main.rs  Andrew Belles  Oct 18th, 2025
//!
//! Entry point: scrape the library from the attached browser, download and
//! tag audio for a snapshot, or analyze an exported snapshot
//!
//!

use std::{path::PathBuf, sync::Arc};

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use suno_archiver::analyzer::{CollectionAnalyzer, SearchField, DEFAULT_SEARCH_FIELDS};
use suno_archiver::browser::CdpSession;
use suno_archiver::collector::diff_by_url;
use suno_archiver::config::{self, AppConfig};
use suno_archiver::crawler::{DetailFetcher, PageScraper, ScrapeOutcome};
use suno_archiver::download::Downloader;
use suno_archiver::export::Exporter;
use suno_archiver::fetch::{DevToolsClient, MediaClient};
use suno_archiver::logging;
use suno_archiver::persistent::Ledger;
use suno_archiver::sink::DiskZstdSink;
use suno_archiver::types::{Snapshot, SongRecord};
use suno_archiver::util::{format_duration, parse_duration};
use suno_archiver::ArchiverError;

#[derive(Parser, Debug)]
#[command(name = "suno-archiver")]
#[command(about = "Archive a Suno library: scrape, export, download, analyze")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scrape the library from the browser tab and export it
    Scrape(ScrapeArgs),
    /// Download and tag audio for every song in a snapshot
    Download(DownloadArgs),
    /// Print statistics and queries over a snapshot
    Analyze(AnalyzeArgs)
}

#[derive(Args, Debug)]
struct ScrapeArgs {
    /// Library tab to visit, repeatable; none scrapes the current page
    #[arg(long = "tab")]
    tabs: Vec<String>,

    /// Skip visiting every song page for lyrics and description
    #[arg(long)]
    no_details: bool,

    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Export formats: json, csv, md
    #[arg(long = "format", value_delimiter = ',')]
    formats: Vec<String>,

    /// Earlier snapshot to report new songs against
    #[arg(long)]
    previous: Option<PathBuf>,

    #[arg(long)]
    max_scrolls: Option<u32>,

    /// Keep compressed copies of every visited page
    #[arg(long)]
    raw: bool
}

#[derive(Args, Debug)]
struct DownloadArgs {
    /// Snapshot json written by `scrape`
    snapshot: PathBuf,

    #[arg(short, long)]
    dir: Option<PathBuf>,

    #[arg(short, long)]
    workers: Option<usize>,

    /// Preferred audio format: mp3, m4a or wav
    #[arg(long)]
    format: Option<String>,

    #[arg(long)]
    no_metadata: bool,

    /// Also compare decoded audio when looking for duplicates
    #[arg(long)]
    fingerprint: bool,

    /// Do not read or write the download ledger
    #[arg(long)]
    no_ledger: bool
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    snapshot: PathBuf,

    /// Case-insensitive substring search
    #[arg(short, long)]
    search: Option<String>,

    /// Fields to search: title, artist, lyrics, tags, description
    #[arg(long = "field", value_delimiter = ',')]
    fields: Vec<String>,

    /// Keep songs carrying this tag, repeatable
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Require every --tag instead of any
    #[arg(long)]
    all_tags: bool,

    /// Minimum duration, seconds or M:SS
    #[arg(long)]
    min: Option<String>,

    /// Maximum duration, seconds or M:SS
    #[arg(long)]
    max: Option<String>
}

/// Cancels the token on the first ctrl-c; the stages stop scheduling work
fn spawn_interrupt(shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(msg = "stopping after in-flight work", "archiver.signal");
            shutdown.cancel();
        }
    })
}

async fn open_ledger(cfg: &AppConfig) -> Option<Ledger> {
    if let Err(e) = std::fs::create_dir_all(&cfg.download.download_dir) {
        warn!(error = %e, "ledger.dir.failed");
        return None;
    }
    let url = cfg.persistence.ledger_url(&cfg.download.download_dir);
    match Ledger::init(&url).await {
        Ok(ledger) => Some(ledger),
        Err(e) => {
            warn!(error = %e, "ledger.open.failed");
            None
        }
    }
}

async fn scrape(mut cfg: AppConfig, args: ScrapeArgs, shutdown: CancellationToken) -> Result<(), ArchiverError> {
    if !args.tabs.is_empty() {
        cfg.scrape.tabs = args.tabs;
    }
    if args.no_details {
        cfg.scrape.extract_details = false;
    }
    if let Some(dir) = args.output_dir {
        cfg.export.output_dir = dir;
    }
    if !args.formats.is_empty() {
        cfg.export.formats = config::parse_formats(&args.formats)?;
    }
    if let Some(max) = args.max_scrolls {
        cfg.scrape.max_scrolls = max;
    }
    let sink = (args.raw || cfg.persistence.raw_dumps).then(|| Arc::new(DiskZstdSink::new(
        &cfg.persistence.raw_store_root, cfg.persistence.raw_zstd_level
    )));

    let devtools = DevToolsClient::new(&cfg.http, &cfg.browser)?;
    let mut session = CdpSession::attach(&devtools, &cfg.browser).await?;

    let scraper = PageScraper::new(
        &cfg.scrape, cfg.browser.library_url.clone(), sink.clone(), shutdown.clone()
    );
    let ScrapeOutcome { collector, tabs, fatal } = scraper.scrape(&mut session).await;
    let mut songs: Vec<SongRecord> = collector.into_records();

    let details = if fatal.is_none() && cfg.scrape.extract_details && !songs.is_empty() {
        let fetcher = DetailFetcher::new(&cfg.scrape, sink, shutdown.clone());
        Some(fetcher.enrich(&mut session, &mut songs).await)
    } else {
        None
    };

    let snapshot = Snapshot::new(songs);
    let (written, failed) = Exporter::new(&cfg.export).export(&snapshot);

    let new_songs = match &args.previous {
        Some(path) => match Snapshot::load(path) {
            Ok(previous) => Some(diff_by_url(&previous.songs, &snapshot.songs)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "scrape.previous.unreadable");
                None
            }
        },
        None => None
    };

    let imported = match open_ledger(&cfg).await {
        Some(ledger) => ledger.import_snapshot(&snapshot.songs).await
            .map_err(|e| warn!(error = %e, "ledger.import.failed"))
            .ok(),
        None => None
    };

    println!("songs:        {}", snapshot.songs.len());
    for tab in &tabs {
        let name = if tab.tab.is_empty() { "(current page)" } else { tab.tab.as_str() };
        match &tab.error {
            Some(e) => println!("tab {name}: failed ({e})"),
            None => {
                let converged = tab.scroll.as_ref().is_some_and(|s| s.converged);
                println!("tab {name}: {} found, {} kept, converged {converged}", tab.found, tab.kept);
            }
        }
    }
    if let Some(d) = details {
        println!("details:      {} attempted, {} enriched, {} failed, {} skipped",
            d.attempted, d.enriched, d.failed, d.skipped);
    }
    for (format, path) in &written {
        println!("wrote {}:   {}", format.extension(), path.display());
    }
    for (format, e) in &failed {
        println!("failed {}:  {e}", format.extension());
    }
    if let Some(fresh) = &new_songs {
        println!("new songs:    {}", fresh.len());
        for song in fresh.iter().take(20) {
            println!("  + {}", song.title);
        }
    }
    if let Some(counts) = imported {
        println!("ledger:       {} new, {} known", counts.new_songs, counts.known_songs);
    }

    info!(songs = snapshot.songs.len(), exports = written.len(), "archiver.scrape.done");
    match fatal {
        Some(e) => Err(e),
        None => Ok(())
    }
}

async fn download(mut cfg: AppConfig, args: DownloadArgs, shutdown: CancellationToken) -> Result<(), ArchiverError> {
    if let Some(dir) = args.dir {
        cfg.download.download_dir = dir;
    }
    if let Some(workers) = args.workers {
        cfg.download.workers = workers.max(1);
    }
    if let Some(format) = args.format {
        let format = format.to_ascii_lowercase();
        if !matches!(format.as_str(), "mp3" | "m4a" | "wav") {
            return Err(ArchiverError::Config(format!("unsupported audio format {format}")));
        }
        cfg.download.preferred_format = format;
    }
    if args.no_metadata {
        cfg.download.add_metadata = false;
    }
    if args.fingerprint {
        cfg.download.fingerprint_duplicates = true;
    }

    let snapshot = Snapshot::load(&args.snapshot)?;
    let ledger = if args.no_ledger { None } else { open_ledger(&cfg).await };
    if let Some(ledger) = &ledger {
        if let Err(e) = ledger.import_snapshot(&snapshot.songs).await {
            warn!(error = %e, "ledger.import.failed");
        }
    }

    let client = MediaClient::new(&cfg.http)?;
    let downloader = Downloader::new(&cfg.download, client, shutdown);
    let report = downloader.run(&snapshot.songs, ledger.as_ref()).await?;

    print!("{report}");
    if let Some(ledger) = &ledger {
        match ledger.song_count().await {
            Ok(count) => println!("ledger:      {count} songs"),
            Err(e) => warn!(error = %e, "ledger.count.failed")
        }
    }
    Ok(())
}

fn seconds_arg(raw: Option<&str>) -> Result<Option<u64>, ArchiverError> {
    raw.map(|s| s.trim().parse::<u64>().ok()
            .or_else(|| parse_duration(s))
            .ok_or_else(|| ArchiverError::Config(format!("cannot read duration {s}"))))
        .transpose()
}

fn print_songs(label: &str, songs: &[&SongRecord]) {
    println!("{label}: {}", songs.len());
    for song in songs {
        let length = parse_duration(&song.duration).map(format_duration).unwrap_or_default();
        println!("  {:>4}. {} [{}] {}", song.index, song.title, length, song.url);
    }
}

fn analyze(args: AnalyzeArgs) -> Result<(), ArchiverError> {
    let analyzer = CollectionAnalyzer::load(&args.snapshot)?;
    print!("{}", analyzer.stats());

    if let Some(query) = &args.search {
        let fields = if args.fields.is_empty() {
            DEFAULT_SEARCH_FIELDS.to_vec()
        } else {
            args.fields.iter()
                .map(|f| SearchField::parse(f)
                    .ok_or_else(|| ArchiverError::Config(format!("unknown search field {f}"))))
                .collect::<Result<Vec<_>, _>>()?
        };
        print_songs(&format!("search \"{query}\""), &analyzer.search_fields(query, &fields));
    }
    if !args.tags.is_empty() {
        print_songs("tag matches", &analyzer.filter_by_tags(&args.tags, args.all_tags));
    }
    let (min, max) = (seconds_arg(args.min.as_deref())?, seconds_arg(args.max.as_deref())?);
    if min.is_some() || max.is_some() {
        print_songs("duration matches", &analyzer.filter_by_duration(min, max));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), ArchiverError> {
    let cli = Cli::parse();
    let cfgs = config::load_config()?;
    let _logger = logging::init_logging(&cfgs.logging)?;

    info!(
        service = "suno-archiver",
        version = %env!("CARGO_PKG_VERSION"),
        "starting"
    );

    let shutdown = CancellationToken::new();
    let trigger = spawn_interrupt(shutdown.clone());

    let result = match cli.command {
        Command::Scrape(args) => scrape(cfgs, args, shutdown).await,
        Command::Download(args) => download(cfgs, args, shutdown).await,
        Command::Analyze(args) => analyze(args)
    };
    trigger.abort();

    if let Err(e) = &result {
        error!(error = %e, fatal = e.is_fatal(), "archiver.failed");
    }
    result
}

/// Unit Tests
/// Live browser testbench
#[cfg(test)]
mod tests {
    use super::*;

    fn live() -> bool {
        std::env::var("LIVE_BROWSER").ok().as_deref() == Some("1")
    }

    #[test]
    fn duration_args_accept_seconds_and_clock() {
        assert_eq!(seconds_arg(Some("90")).unwrap(), Some(90));
        assert_eq!(seconds_arg(Some("1:30")).unwrap(), Some(90));
        assert_eq!(seconds_arg(None).unwrap(), None);
        assert!(seconds_arg(Some("soon")).is_err());
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "suno-archiver", "scrape", "--tab", "liked", "--tab", "uploads",
            "--format", "json,csv", "--no-details",
        ]).unwrap();
        match cli.command {
            Command::Scrape(args) => {
                assert_eq!(args.tabs, vec!["liked", "uploads"]);
                assert_eq!(args.formats, vec!["json", "csv"]);
                assert!(args.no_details);
            },
            other => panic!("unexpected {other:?}")
        }
    }

    #[tokio::test]
    #[allow(dead_code)]
    async fn browser_attach_testbench() -> Result<(), ArchiverError> {
        dotenvy::dotenv().ok();

        if !live() {
            eprintln!("Set LIVE_BROWSER=1 to run");
            return Ok(())
        }

        let cfgs = config::load_config()?;
        let devtools = DevToolsClient::new(&cfgs.http, &cfgs.browser)?;
        let targets = devtools.list_targets().await?;
        println!("targets: {targets:#?}");

        let mut session = CdpSession::attach(&devtools, &cfgs.browser).await?;
        let scraper = PageScraper::new(
            &cfgs.scrape, cfgs.browser.library_url.clone(), None, CancellationToken::new()
        );
        let outcome = scraper.scrape(&mut session).await;
        println!("reports: {:#?}", outcome.tabs);
        if let Some(e) = outcome.fatal {
            return Err(e);
        }
        assert!(!outcome.collector.is_empty());
        Ok(())
    }
}
