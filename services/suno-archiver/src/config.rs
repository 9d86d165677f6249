//!
//! src/config.rs  Andrew Belles  Oct 18th, 2025
//!
//! Environment driven configuration for the browser session, scraping,
//! exports, downloads, persistence and logging
//!

use std::{path::PathBuf, time};
use url::Url;

use crate::ArchiverError;

/// Constants for HTTP Config
pub const HTTP_TIMEOUT: u64 = 60000;
pub const HTTP_CONNECT_TIMEOUT: u64 = 5000;
pub const HTTP_POOL_MAX_IDLE: usize = 16;
pub const HTTP_POOL_IDLE_TIMEOUT: u64 = 90000;
pub const HTTP_MAX_REDIRECTS: u8 = 4;
pub const HTTP_PROBE_TIMEOUT: u64 = 5000;
pub const HTTP_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

pub const RETRY_MAX_ATTEMPTS: u8 = 3;
pub const RETRY_BASE_BACKOFF: u64 = 2000;
pub const RETRY_JITTER: bool = true;
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Constants for scraping
pub const SCROLL_PAUSE: u64 = 1200;
pub const MAX_SCROLLS: u32 = 600;
pub const STABLE_ROUNDS: u32 = 1;
pub const DETAIL_DELAY: u64 = 1500;
pub const NAV_TIMEOUT: u64 = 20000;

pub const DEFAULT_CDN_HOSTS: [&str; 3] = [
    "https://cdn1.suno.ai/",
    "https://cdn2.suno.ai/",
    "https://audiopipe.suno.ai/",
];

/// Wrapper over env::var to return an invalid enviroment var error
fn env_check(s: &str) -> Result<String, ArchiverError> {
    match std::env::var(s) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ArchiverError::Config(format!("{s} was not set"))),
    }
}

fn env_or(s: &str, default: &str) -> String {
    env_check(s).unwrap_or_else(|_| default.to_string())
}

/// Unparsable values fall back to the default, same as unset ones
fn env_parse<T: std::str::FromStr>(s: &str, default: T) -> T {
    match std::env::var(s) {
        Ok(v) => v.trim().parse::<T>().unwrap_or(default),
        Err(_) => default
    }
}

fn env_bool(s: &str, default: bool) -> bool {
    match std::env::var(s) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default
        },
        Err(_) => default
    }
}

/// Comma separated list, empty entries dropped
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_list(s: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(s) {
        Ok(v) => split_list(&v),
        Err(_) => default.iter().map(|d| d.to_string()).collect()
    }
}

fn ensure_http(url: &Url) -> Result<(), String> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("URL must be http(s), got {other}: {url}"))
    }
}

/// Ensures a base url ends in '/' so that joins append rather than replace
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let mut path = url.path().to_string();
        path.push('/');
        url.set_path(&path);
    }
    url
}

///
/// Configuration for attaching to the already running browser
///
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub debug_host: String,
    pub debug_port: u16,
    pub library_url: Url,      // listing page navigated to per tab
    pub nav_timeout: time::Duration
}

impl BrowserConfig {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}/", self.debug_host, self.debug_port)
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            debug_host: "127.0.0.1".to_string(),
            debug_port: 9222,
            library_url: Url::parse("https://suno.com/me").expect("static url"),
            nav_timeout: time::Duration::from_millis(NAV_TIMEOUT)
        }
    }
}

fn build_browser() -> Result<BrowserConfig, ArchiverError> {
    let defaults = BrowserConfig::default();

    let library_url = env_or("LIBRARY_URL", defaults.library_url.as_str());
    let library_url = Url::parse(&library_url)
        .map_err(|e| ArchiverError::Config(format!("LIBRARY_URL invalid {e}")))?;
    ensure_http(&library_url).map_err(ArchiverError::Config)?;

    Ok( BrowserConfig {
        debug_host: env_or("BROWSER_DEBUG_HOST", &defaults.debug_host),
        debug_port: env_parse("BROWSER_DEBUG_PORT", defaults.debug_port),
        library_url,
        nav_timeout: time::Duration::from_millis(env_parse("NAV_TIMEOUT_MS", NAV_TIMEOUT))
    })
}

///
/// Configuration for the scroll loop and the detail pass
///
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub tabs: Vec<String>,            // empty means scrape the current page
    pub scroll_pause: time::Duration,
    pub max_scrolls: u32,
    pub stable_rounds: u32,           // identical samples in a row to converge
    pub extract_details: bool,
    pub detail_delay: time::Duration, // floor between detail navigations
    pub exclude_disliked: bool
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            tabs: Vec::new(),
            scroll_pause: time::Duration::from_millis(SCROLL_PAUSE),
            max_scrolls: MAX_SCROLLS,
            stable_rounds: STABLE_ROUNDS,
            extract_details: true,
            detail_delay: time::Duration::from_millis(DETAIL_DELAY),
            exclude_disliked: true
        }
    }
}

fn build_scrape() -> ScrapeConfig {
    ScrapeConfig {
        tabs: env_list("SCRAPE_TABS", &[]),
        scroll_pause: time::Duration::from_millis(env_parse("SCROLL_PAUSE_MS", SCROLL_PAUSE)),
        max_scrolls: env_parse("MAX_SCROLLS", MAX_SCROLLS),
        stable_rounds: env_parse("STABLE_ROUNDS", STABLE_ROUNDS).max(1),
        extract_details: env_bool("EXTRACT_DETAILS", true),
        detail_delay: time::Duration::from_millis(env_parse("DETAIL_DELAY_MS", DETAIL_DELAY)),
        exclude_disliked: env_bool("EXCLUDE_DISLIKED", true)
    }
}

///
/// Configuration for on-disk exports
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    Csv,
    Json,
    Markdown
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<ExportFormat> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Some(ExportFormat::Csv),
            "json" => Some(ExportFormat::Json),
            "md" | "markdown" => Some(ExportFormat::Markdown),
            _ => None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Markdown => "md"
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub output_dir: PathBuf,
    pub formats: Vec<ExportFormat>
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("suno_songs"),
            formats: vec![ExportFormat::Json, ExportFormat::Csv, ExportFormat::Markdown]
        }
    }
}

pub fn parse_formats(raw: &[String]) -> Result<Vec<ExportFormat>, ArchiverError> {
    let mut formats = Vec::new();
    for item in raw {
        let format = ExportFormat::parse(item)
            .ok_or_else(|| ArchiverError::Config(format!("unknown export format {item}")))?;
        if !formats.contains(&format) {
            formats.push(format);
        }
    }
    Ok(formats)
}

fn build_export() -> Result<ExportConfig, ArchiverError> {
    let output_dir = PathBuf::from(env_or("OUTPUT_DIR", "suno_songs"));
    let formats = parse_formats(&env_list("EXPORT_FORMATS", &["json", "csv", "md"]))?;
    Ok( ExportConfig { output_dir, formats } )
}

///
/// Configuration for Http timeouts, retries, etc.
///
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u8,
    pub base_backoff: time::Duration,
    pub jitter: bool,
    pub retryable_statuses: Vec<u16>
}

impl RetryConfig {
    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_backoff: time::Duration::from_millis(RETRY_BASE_BACKOFF),
            jitter: RETRY_JITTER,
            retryable_statuses: RETRYABLE_STATUSES.to_vec()
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: time::Duration,
    pub connect_timeout: time::Duration,
    pub probe_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub max_redirects: u8,
    pub user_agent: String,
    pub retry: RetryConfig
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_millis(HTTP_TIMEOUT),
            connect_timeout: time::Duration::from_millis(HTTP_CONNECT_TIMEOUT),
            probe_timeout: time::Duration::from_millis(HTTP_PROBE_TIMEOUT),
            pool_max_idle_per_host: HTTP_POOL_MAX_IDLE,
            pool_idle_timeout: time::Duration::from_millis(HTTP_POOL_IDLE_TIMEOUT),
            max_redirects: HTTP_MAX_REDIRECTS,
            user_agent: HTTP_USER_AGENT.to_string(),
            retry: RetryConfig::default()
        }
    }
}

fn build_http() -> HttpConfig {
    let defaults = HttpConfig::default();
    let retry = RetryConfig {
        max_attempts: env_parse("RETRY_ATTEMPTS", RETRY_MAX_ATTEMPTS),
        base_backoff: time::Duration::from_millis(
            env_parse("RETRY_BACKOFF_MS", RETRY_BASE_BACKOFF)),
        ..RetryConfig::default()
    };
    HttpConfig {
        timeout: time::Duration::from_millis(env_parse("HTTP_TIMEOUT_MS", HTTP_TIMEOUT)),
        user_agent: env_or("HTTP_USER_AGENT", HTTP_USER_AGENT),
        retry,
        ..defaults
    }
}

///
/// Configuration for the audio downloader
///
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub download_dir: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
    pub preferred_format: String,        // mp3, m4a or wav
    pub add_metadata: bool,
    pub cdn_hosts: Vec<Url>,
    pub min_audio_bytes: u64,            // HEAD probes below this are rejected
    pub album: String,
    pub detect_duplicates: bool,
    pub fingerprint_duplicates: bool,
    pub fingerprint_threshold: f32
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("suno_downloads"),
            workers: 3,
            queue_capacity: 64,
            preferred_format: "mp3".to_string(),
            add_metadata: true,
            cdn_hosts: DEFAULT_CDN_HOSTS.iter()
                .filter_map(|h| Url::parse(h).ok())
                .collect(),
            min_audio_bytes: 10_000,
            album: "Suno AI Creations".to_string(),
            detect_duplicates: true,
            fingerprint_duplicates: false,
            fingerprint_threshold: 0.9
        }
    }
}

fn build_download() -> Result<DownloadConfig, ArchiverError> {
    let defaults = DownloadConfig::default();

    let mut cdn_hosts = Vec::new();
    for host in env_list("CDN_HOSTS", &DEFAULT_CDN_HOSTS) {
        let url = Url::parse(&host)
            .map_err(|e| ArchiverError::Config(format!("CDN_HOSTS entry {host} invalid {e}")))?;
        ensure_http(&url).map_err(ArchiverError::Config)?;
        cdn_hosts.push(with_trailing_slash(url));
    }

    let preferred_format = env_or("AUDIO_FORMAT", &defaults.preferred_format)
        .to_ascii_lowercase();
    if !matches!(preferred_format.as_str(), "mp3" | "m4a" | "wav") {
        return Err(ArchiverError::Config(
            format!("AUDIO_FORMAT must be mp3, m4a or wav (got {preferred_format})")
        ));
    }

    Ok( DownloadConfig {
        download_dir: PathBuf::from(env_or("DOWNLOAD_DIR", "suno_downloads")),
        workers: env_parse("DOWNLOAD_WORKERS", defaults.workers).max(1),
        queue_capacity: env_parse("DOWNLOAD_QUEUE", defaults.queue_capacity).max(1),
        preferred_format,
        add_metadata: env_bool("ADD_METADATA", true),
        cdn_hosts,
        min_audio_bytes: env_parse("MIN_AUDIO_BYTES", defaults.min_audio_bytes),
        album: env_or("ALBUM_NAME", &defaults.album),
        detect_duplicates: env_bool("DETECT_DUPLICATES", true),
        fingerprint_duplicates: env_bool("FINGERPRINT_DUPLICATES", false),
        fingerprint_threshold: env_parse("FINGERPRINT_THRESHOLD", defaults.fingerprint_threshold)
            .clamp(0.0, 1.0)
    })
}

///
/// Configuration for persistent storage in sqlite db or in compressed raw pages
///
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub ledger_db_url: Option<String>,   // None: <download_dir>/ledger.db
    pub raw_dumps: bool,
    pub raw_store_root: PathBuf,
    pub raw_zstd_level: i32
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            ledger_db_url: None,
            raw_dumps: false,
            raw_store_root: PathBuf::from("./data"),
            raw_zstd_level: 3
        }
    }
}

impl PersistenceConfig {
    pub fn ledger_url(&self, download_dir: &std::path::Path) -> String {
        match &self.ledger_db_url {
            Some(url) => url.clone(),
            None => format!("sqlite://{}?mode=rwc", download_dir.join("ledger.db").display())
        }
    }
}

fn build_persistence() -> PersistenceConfig {
    PersistenceConfig {
        ledger_db_url: env_check("LEDGER_DB_URL").ok(),
        raw_dumps: env_bool("RAW_DUMPS", false),
        raw_store_root: PathBuf::from(env_or("RAW_STORE_ROOT", "./data")),
        raw_zstd_level: env_parse("RAW_ZSTD_LEVEL", 3)
    }
}

///
/// Configuration for Logger
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter_directives: String,
    pub format: LogFormat,
    pub with_ansi: bool,
    pub include_file_line: bool,
    pub include_target: bool,
    pub log_file: Option<PathBuf>
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter_directives: "info,suno_archiver=debug,reqwest=warn,sqlx=warn".to_string(),
            format: LogFormat::Pretty,
            with_ansi: true,
            include_file_line: false,
            include_target: true,
            log_file: Some(PathBuf::from("suno_archiver.log"))
        }
    }
}

fn build_logging() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    let format = match env_or("LOG_FORMAT", "pretty").to_ascii_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Pretty
    };
    let log_file = match std::env::var("LOG_FILE") {
        Ok(v) if v.trim().is_empty() || v.trim() == "-" => None,
        Ok(v) => Some(PathBuf::from(v.trim())),
        Err(_) => defaults.log_file.clone()
    };
    LoggingConfig {
        filter_directives: env_or("LOG_FILTER", &defaults.filter_directives),
        format,
        include_file_line: env_bool("LOG_FILE_LINE", defaults.include_file_line),
        log_file,
        ..defaults
    }
}

///
/// AppConfig which holds everything the pipeline stages need
///
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub browser: BrowserConfig,
    pub scrape: ScrapeConfig,
    pub export: ExportConfig,
    pub http: HttpConfig,
    pub download: DownloadConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig
}

///
/// Return all environment variables to caller at program start.
///
pub fn load_config() -> Result<AppConfig, ArchiverError> {
    dotenvy::dotenv().ok();

    let browser     = build_browser()?;
    let scrape      = build_scrape();
    let export      = build_export()?;
    let http        = build_http();
    let download    = build_download()?;
    let persistence = build_persistence();
    let logging     = build_logging();

    Ok( AppConfig {
        browser, scrape, export, http, download, persistence, logging
    } )
}
