//!
//! src/crawler.rs  Andrew Belles  Oct 18th, 2025
//!
//! Drives the single browser tab: scrolls listing pages until lazy loading
//! is exhausted, then visits detail pages to enrich each record
//!

use std::{sync::Arc, time::{Duration, Instant}};

use serde::Deserialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::browser::PageDriver;
use crate::collector::SongCollector;
use crate::config::ScrapeConfig;
use crate::errors::ArchiverError;
use crate::extract::{parse_detail, parse_listing};
use crate::sink::{DiskZstdSink, RawType};
use crate::types::SongRecord;

/// Scroll height (window or the tallest scrollable container) and the
/// number of distinct song links currently in the dom
pub const MEASURE_JS: &str = r#"(() => {
  const hrefs = new Set(Array.from(document.querySelectorAll("a[href*='/song/']"))
    .map(a => a.getAttribute('href')));
  let height = document.body ? document.body.scrollHeight : 0;
  for (const el of document.querySelectorAll('*')) {
    const cs = getComputedStyle(el);
    if ((cs.overflowY === 'auto' || cs.overflowY === 'scroll') && el.scrollHeight > el.clientHeight) {
      height = Math.max(height, el.scrollHeight);
    }
  }
  return { height: height, count: hrefs.size };
})()"#;

/// Clicks visible "show more" style buttons, then scrolls the window and
/// the largest scrollable container to the bottom
pub const SCROLL_JS: &str = r#"(() => {
  let clicked = 0;
  for (const b of document.querySelectorAll('button')) {
    const label = (b.innerText || '').trim();
    if (/^(show|load|see) more$/i.test(label) && b.offsetParent !== null && !b.disabled) {
      try { b.click(); clicked += 1; } catch (e) {}
    }
  }
  window.scrollTo({ top: document.body.scrollHeight, behavior: 'smooth' });
  const containers = Array.from(document.querySelectorAll('*')).filter(el => {
    const cs = getComputedStyle(el);
    return (cs.overflowY === 'auto' || cs.overflowY === 'scroll') && el.scrollHeight > el.clientHeight;
  });
  if (containers.length) {
    containers.sort((a, b) => (b.scrollHeight - b.clientHeight) - (a.scrollHeight - a.clientHeight));
    containers[0].scrollTo({ top: containers[0].scrollHeight, behavior: 'smooth' });
  }
  return clicked;
})()"#;

pub const SCROLL_TOP_JS: &str = "window.scrollTo({ top: 0 }); true";

/// Opens the lyrics panel or expands truncated text on a detail page
pub const REVEAL_LYRICS_JS: &str = r#"(() => {
  const candidates = Array.from(document.querySelectorAll("button, a, [role='tab'], div[class*='tab']"));
  const hit = candidates.find(el => /lyrics/i.test(el.innerText || ''))
    || candidates.find(el => /show more/i.test(el.innerText || ''));
  if (hit && hit.offsetParent !== null) { hit.click(); return true; }
  return false;
})()"#;

const REVEAL_PAUSE: Duration = Duration::from_millis(600);

#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    state: tokio::sync::Mutex<Instant>
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        let start = Instant::now().checked_sub(min_interval).unwrap_or_else(Instant::now);
        Self {
            min_interval,
            state: tokio::sync::Mutex::new(start)
        }
    }

    pub async fn wait(&self) {
        let mut last = self.state.lock().await;
        let elapsed = last.elapsed();
        if elapsed < self.min_interval {
            sleep(self.min_interval - elapsed).await;
        }
        *last = Instant::now();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ScrollSample {
    pub height: u64,
    pub count: u64
}

/// Converged once `required` consecutive comparisons saw an unchanged sample
#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    required: u32,
    stable: u32,
    last: Option<ScrollSample>
}

impl ConvergenceTracker {
    pub fn new(required: u32) -> Self {
        Self { required: required.max(1), stable: 0, last: None }
    }

    pub fn observe(&mut self, sample: ScrollSample) -> bool {
        if self.last == Some(sample) {
            self.stable += 1;
        } else {
            self.stable = 0;
        }
        self.last = Some(sample);
        self.is_converged()
    }

    pub fn is_converged(&self) -> bool {
        self.stable >= self.required
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollReport {
    pub iterations: u32,
    pub converged: bool,
    pub interrupted: bool,
    pub last: ScrollSample
}

#[derive(Debug, Clone)]
pub struct TabReport {
    pub tab: String,
    pub scroll: Option<ScrollReport>,
    pub found: usize,
    pub kept: usize,
    pub error: Option<String>
}

pub struct PageScraper {
    cfg: ScrapeConfig,
    library_url: Url,
    sink: Option<Arc<DiskZstdSink>>,
    shutdown: CancellationToken
}

impl PageScraper {
    pub fn new(
        cfg: &ScrapeConfig,
        library_url: Url,
        sink: Option<Arc<DiskZstdSink>>,
        shutdown: CancellationToken
    ) -> Self {
        Self { cfg: cfg.clone(), library_url, sink, shutdown }
    }

    /// `<library_url>?tab=<tab>`
    pub fn tab_url(&self, tab: &str) -> Url {
        let mut url = self.library_url.clone();
        url.set_query(None);
        url.query_pairs_mut().append_pair("tab", tab);
        url
    }

    async fn measure(&self, driver: &mut dyn PageDriver) -> Result<ScrollSample, ArchiverError> {
        Ok(serde_json::from_value(driver.evaluate(MEASURE_JS).await?)?)
    }

    /// Scrolls until two consecutive samples agree or the cap is hit. Hitting
    /// the cap or losing a script call mid-scroll is not an error, the page
    /// is parsed as far as it loaded. Only fatal errors escape.
    pub async fn scroll_to_end(&self, driver: &mut dyn PageDriver) -> Result<ScrollReport, ArchiverError> {
        let mut tracker = ConvergenceTracker::new(self.cfg.stable_rounds);
        let mut last = match self.measure(driver).await {
            Ok(sample) => sample,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "scrape.scroll.unmeasured");
                return Ok( ScrollReport {
                    iterations: 0, converged: false, interrupted: true, last: ScrollSample::default()
                } );
            }
        };
        tracker.observe(last);

        let mut iterations = 0;
        let mut interrupted = false;
        while iterations < self.cfg.max_scrolls {
            if self.shutdown.is_cancelled() {
                warn!(iterations, "scrape.scroll.cancelled");
                break;
            }
            let step = match driver.evaluate(SCROLL_JS).await {
                Ok(clicked) => {
                    sleep(self.cfg.scroll_pause).await;
                    self.measure(driver).await.map(|sample| (clicked, sample))
                },
                Err(e) => Err(e)
            };
            let clicked = match step {
                Ok((clicked, sample)) => {
                    last = sample;
                    clicked
                },
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(iterations, count = last.count, error = %e, "scrape.scroll.interrupted");
                    interrupted = true;
                    break;
                }
            };
            iterations += 1;

            debug!(iterations, height = last.height, count = last.count, clicked = %clicked, "scrape.scroll");
            if iterations % 10 == 0 {
                info!(iterations, count = last.count, "scrape.scroll.progress");
            }
            if tracker.observe(last) {
                break;
            }
        }

        let converged = tracker.is_converged();
        if !converged && !interrupted && iterations >= self.cfg.max_scrolls {
            warn!(iterations, max_scrolls = self.cfg.max_scrolls, count = last.count, "scrape.scroll.cap");
        }
        if let Err(e) = driver.evaluate(SCROLL_TOP_JS).await {
            debug!(error = %e, "scrape.scroll.top.failed");
        }
        info!(iterations, converged, interrupted, count = last.count, "scrape.scroll.done");
        Ok( ScrollReport { iterations, converged, interrupted, last } )
    }

    /// Scrolls and parses whatever page the driver is on
    pub async fn scrape_current(
        &self,
        driver: &mut dyn PageDriver,
        collector: &mut SongCollector,
        tab: &str
    ) -> Result<TabReport, ArchiverError> {
        let scroll = self.scroll_to_end(driver).await?;
        let html = driver.content().await?;
        let base = match driver.current_url().await {
            Ok(url) => Url::parse(&url).unwrap_or_else(|_| self.library_url.clone()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(_) => self.library_url.clone()
        };

        if let Some(sink) = &self.sink {
            let key = if tab.is_empty() { "current" } else { tab };
            match sink.write_html(RawType::ListingPage, key, &html) {
                Ok(path) => debug!(path = %path.display(), "scrape.raw.saved"),
                Err(e) => warn!(error = %e, "scrape.raw.failed")
            }
        }

        let mut records = parse_listing(&html, &base);
        records.iter_mut().for_each(|r| r.source_tab = tab.to_string());
        let found = records.len();
        let kept = collector.extend(records);

        info!(tab, found, kept, total = collector.len(), "scrape.tab.done");
        Ok( TabReport { tab: tab.to_string(), scroll: Some(scroll), found, kept, error: None } )
    }

    async fn scrape_tab(
        &self,
        driver: &mut dyn PageDriver,
        collector: &mut SongCollector,
        tab: &str
    ) -> Result<TabReport, ArchiverError> {
        if !tab.is_empty() {
            driver.navigate(self.tab_url(tab).as_str()).await?;
        }
        self.scrape_current(driver, collector, tab).await
    }

    /// Every configured tab, or the current page when none are configured.
    /// A tab that fails is reported and skipped. A fatal error stops the
    /// run, but what was collected before it is still handed back.
    pub async fn scrape(&self, driver: &mut dyn PageDriver) -> ScrapeOutcome {
        info!(tabs = ?self.cfg.tabs, max_scrolls = self.cfg.max_scrolls, "scrape.start");
        let mut collector = SongCollector::new();
        let mut tabs = Vec::new();
        let mut fatal = None;

        let targets: Vec<String> = if self.cfg.tabs.is_empty() {
            vec![String::new()]
        } else {
            self.cfg.tabs.clone()
        };

        for tab in &targets {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.scrape_tab(driver, &mut collector, tab).await {
                Ok(report) => tabs.push(report),
                Err(e) if e.is_fatal() => {
                    error!(tab = %tab, error = %e, kept = collector.len(), "scrape.aborted");
                    fatal = Some(e);
                    break;
                },
                Err(e) => {
                    warn!(tab = %tab, error = %e, "scrape.tab.failed");
                    tabs.push(TabReport {
                        tab: tab.clone(), scroll: None, found: 0, kept: 0, error: Some(e.to_string())
                    });
                }
            }
        }

        if self.cfg.exclude_disliked {
            let before = collector.len();
            collector.retain(|r| !r.disliked);
            if before != collector.len() {
                info!(dropped = before - collector.len(), "scrape.disliked.excluded");
            }
        }

        info!(total = collector.len(), "scrape.done");
        ScrapeOutcome { collector, tabs, fatal }
    }
}

/// Everything a scrape produced. `fatal` is set when the run stopped early;
/// the collector still holds the songs gathered before that.
#[derive(Debug)]
pub struct ScrapeOutcome {
    pub collector: SongCollector,
    pub tabs: Vec<TabReport>,
    pub fatal: Option<ArchiverError>
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetailReport {
    pub attempted: usize,
    pub enriched: usize,
    pub failed: usize,
    pub skipped: usize
}

pub struct DetailFetcher {
    gate: RateGate,
    reveal_pause: Duration,
    sink: Option<Arc<DiskZstdSink>>,
    shutdown: CancellationToken
}

impl DetailFetcher {
    pub fn new(cfg: &ScrapeConfig, sink: Option<Arc<DiskZstdSink>>, shutdown: CancellationToken) -> Self {
        Self {
            gate: RateGate::new(cfg.detail_delay),
            reveal_pause: REVEAL_PAUSE.min(cfg.detail_delay),
            sink,
            shutdown
        }
    }

    async fn fetch_one(&self, driver: &mut dyn PageDriver, record: &mut SongRecord) -> Result<bool, ArchiverError> {
        driver.navigate(&record.url).await?;

        match driver.evaluate(REVEAL_LYRICS_JS).await {
            Ok(serde_json::Value::Bool(true)) => sleep(self.reveal_pause).await,
            Ok(_) => {},
            Err(e) => debug!(error = %e, "detail.reveal.failed")
        }

        let html = driver.content().await?;
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.write_html(RawType::DetailPage, &record.key(), &html) {
                warn!(error = %e, "detail.raw.failed");
            }
        }

        let base = Url::parse(&record.url)?;
        Ok(parse_detail(&html, &base).apply(record))
    }

    /// Visits every record with a url, one at a time. Failures leave the
    /// record as it was.
    pub async fn enrich(&self, driver: &mut dyn PageDriver, records: &mut [SongRecord]) -> DetailReport {
        let mut report = DetailReport::default();
        let total = records.len();
        info!(total, "detail.start");

        for (i, record) in records.iter_mut().enumerate() {
            if record.url.is_empty() {
                report.skipped += 1;
                continue;
            }
            if self.shutdown.is_cancelled() {
                report.skipped += total - i;
                warn!(remaining = total - i, "detail.cancelled");
                break;
            }

            self.gate.wait().await;
            report.attempted += 1;
            debug!(n = i + 1, total, title = %record.title, "detail.fetch");

            match self.fetch_one(driver, record).await {
                Ok(changed) => {
                    if changed {
                        report.enriched += 1;
                    }
                },
                Err(e) => {
                    report.failed += 1;
                    warn!(url = %record.url, error = %e, "detail.failed");
                }
            }
        }

        info!(
            attempted = report.attempted, enriched = report.enriched,
            failed = report.failed, "detail.done"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;

    const A: &str = "aaaaaaaa-1111-4111-8111-111111111111";
    const B: &str = "bbbbbbbb-2222-4222-8222-222222222222";

    /// Scripted stand-in for a browser tab
    #[derive(Default)]
    struct MockPage {
        samples: VecDeque<ScrollSample>,
        last_sample: Option<ScrollSample>,
        pages: HashMap<String, String>,
        current: String,
        measures: usize,
        scrolls: usize,
        navigations: Vec<String>,
        /// measure call (1-based) that times out
        failing_measure: Option<usize>,
        /// url whose navigation loses the browser
        dead_url: Option<String>
    }

    #[async_trait]
    impl PageDriver for MockPage {
        async fn evaluate(&mut self, expression: &str) -> Result<Value, ArchiverError> {
            if expression == MEASURE_JS {
                self.measures += 1;
                if self.failing_measure == Some(self.measures) {
                    return Err(ArchiverError::Timeout("Runtime.evaluate after 20s".into()));
                }
                let sample = self.samples.pop_front().or(self.last_sample)
                    .ok_or_else(|| ArchiverError::Navigation("no samples".into()))?;
                self.last_sample = Some(sample);
                return Ok(json!({ "height": sample.height, "count": sample.count }));
            }
            if expression == SCROLL_JS {
                self.scrolls += 1;
                return Ok(json!(0));
            }
            Ok(Value::Bool(false))
        }

        async fn navigate(&mut self, url: &str) -> Result<(), ArchiverError> {
            self.navigations.push(url.to_string());
            if self.dead_url.as_deref() == Some(url) {
                return Err(ArchiverError::Connection("devtools socket closed".into()));
            }
            if !self.pages.contains_key(url) {
                return Err(ArchiverError::Timeout(format!("{url} never loaded")));
            }
            self.current = url.to_string();
            Ok(())
        }

        async fn content(&mut self) -> Result<String, ArchiverError> {
            Ok(self.pages.get(&self.current).cloned().unwrap_or_default())
        }

        async fn current_url(&mut self) -> Result<String, ArchiverError> {
            Ok(self.current.clone())
        }
    }

    fn sample(height: u64, count: u64) -> ScrollSample {
        ScrollSample { height, count }
    }

    fn fast_config() -> ScrapeConfig {
        ScrapeConfig {
            scroll_pause: Duration::ZERO,
            detail_delay: Duration::ZERO,
            max_scrolls: 20,
            ..ScrapeConfig::default()
        }
    }

    fn scraper(cfg: &ScrapeConfig) -> PageScraper {
        PageScraper::new(cfg, Url::parse("https://suno.com/me").unwrap(), None, CancellationToken::new())
    }

    #[test]
    fn tracker_needs_identical_consecutive_samples() {
        let mut tracker = ConvergenceTracker::new(1);
        assert!(!tracker.observe(sample(100, 1)));
        assert!(!tracker.observe(sample(200, 1)));
        assert!(!tracker.observe(sample(200, 2)));
        assert!(tracker.observe(sample(200, 2)));
        assert!(!tracker.observe(sample(300, 2)));

        let mut strict = ConvergenceTracker::new(2);
        strict.observe(sample(1, 1));
        assert!(!strict.observe(sample(1, 1)));
        assert!(strict.observe(sample(1, 1)));
    }

    #[tokio::test]
    async fn scrolling_stops_after_two_identical_samples() {
        let cfg = fast_config();
        let mut page = MockPage {
            samples: VecDeque::from(vec![sample(1000, 10), sample(2000, 20), sample(2000, 20)]),
            ..Default::default()
        };
        let report = scraper(&cfg).scroll_to_end(&mut page).await.unwrap();
        assert!(report.converged);
        assert_eq!(report.iterations, 2);
        assert_eq!(page.scrolls, 2);
        assert_eq!(report.last, sample(2000, 20));
    }

    #[tokio::test]
    async fn scrolling_cap_is_a_success() {
        let cfg = ScrapeConfig { max_scrolls: 5, ..fast_config() };
        let mut page = MockPage {
            samples: (0..100).map(|i| sample(i * 100, i)).collect(),
            ..Default::default()
        };
        let report = scraper(&cfg).scroll_to_end(&mut page).await.unwrap();
        assert!(!report.converged);
        assert_eq!(report.iterations, 5);
        assert_eq!(page.scrolls, 5);
    }

    fn listing(ids: &[&str]) -> String {
        let cards: String = ids.iter()
            .map(|id| format!(r#"<div class="song-card"><a href="/song/{id}">t</a><h3>Song {id}</h3></div>"#))
            .collect();
        format!(r#"<html><body><div role="list">{cards}</div></body></html>"#)
    }

    #[tokio::test]
    async fn tabs_are_navigated_and_merged_without_repeats() {
        let cfg = ScrapeConfig {
            tabs: vec!["creations".into(), "likes".into(), "broken".into()],
            ..fast_config()
        };
        let s = scraper(&cfg);
        let mut page = MockPage {
            samples: VecDeque::from(vec![sample(1, 1)]),
            ..Default::default()
        };
        page.pages.insert(s.tab_url("creations").to_string(), listing(&[A]));
        page.pages.insert(s.tab_url("likes").to_string(), listing(&[A, B]));

        let ScrapeOutcome { collector, tabs: reports, fatal } = s.scrape(&mut page).await;
        assert!(fatal.is_none());
        assert_eq!(collector.len(), 2);
        assert_eq!(collector.records()[0].source_tab, "creations");
        assert_eq!(collector.records()[1].source_tab, "likes");
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[1].found, 2);
        assert_eq!(reports[1].kept, 1);
        assert!(reports[2].error.is_some());
        assert_eq!(page.navigations[0], "https://suno.com/me?tab=creations");
    }

    #[tokio::test]
    async fn evaluate_timeout_mid_scroll_keeps_loaded_songs() {
        let cfg = fast_config();
        let s = scraper(&cfg);
        let mut page = MockPage {
            samples: VecDeque::from(vec![sample(100, 1), sample(200, 1), sample(300, 2)]),
            failing_measure: Some(3),
            current: "https://suno.com/me".into(),
            ..Default::default()
        };
        page.pages.insert("https://suno.com/me".into(), listing(&[A]));

        let outcome = s.scrape(&mut page).await;
        assert!(outcome.fatal.is_none());
        assert_eq!(outcome.collector.len(), 1);
        assert_eq!(outcome.tabs.len(), 1);
        let scroll = outcome.tabs[0].scroll.unwrap();
        assert!(scroll.interrupted);
        assert!(!scroll.converged);
        assert_eq!(scroll.iterations, 1);
        assert!(outcome.tabs[0].error.is_none());
    }

    #[tokio::test]
    async fn unmeasurable_page_is_still_parsed() {
        let cfg = fast_config();
        let mut page = MockPage {
            failing_measure: Some(1),
            current: "https://suno.com/me".into(),
            ..Default::default()
        };
        page.pages.insert("https://suno.com/me".into(), listing(&[A, B]));

        let outcome = scraper(&cfg).scrape(&mut page).await;
        assert!(outcome.fatal.is_none());
        assert_eq!(outcome.collector.len(), 2);
        assert_eq!(page.scrolls, 0);
    }

    #[tokio::test]
    async fn fatal_error_keeps_earlier_tabs() {
        let cfg = ScrapeConfig {
            tabs: vec!["creations".into(), "likes".into(), "uploads".into()],
            ..fast_config()
        };
        let s = scraper(&cfg);
        let mut page = MockPage {
            samples: VecDeque::from(vec![sample(1, 1)]),
            dead_url: Some(s.tab_url("likes").to_string()),
            ..Default::default()
        };
        page.pages.insert(s.tab_url("creations").to_string(), listing(&[A]));
        page.pages.insert(s.tab_url("uploads").to_string(), listing(&[B]));

        let outcome = s.scrape(&mut page).await;
        assert!(matches!(outcome.fatal, Some(ArchiverError::Connection(_))));
        assert_eq!(outcome.collector.len(), 1);
        assert_eq!(outcome.collector.records()[0].source_tab, "creations");
        assert_eq!(outcome.tabs.len(), 1);
        assert_eq!(page.navigations.len(), 2);
    }

    #[tokio::test]
    async fn detail_failures_keep_the_record() {
        let cfg = fast_config();
        let good = format!("https://suno.com/song/{A}");
        let bad = format!("https://suno.com/song/{B}");
        let lyrics = "[Verse]\nsomething long enough to count as real lyrics for sure\n[Chorus]\nla";

        let mut page = MockPage::default();
        page.pages.insert(good.clone(), format!(r#"<html><body><pre class="lyrics">{lyrics}</pre></body></html>"#));

        let mut records = vec![
            SongRecord { title: "Good".into(), url: good, ..Default::default() },
            SongRecord { title: "Bad".into(), url: bad, description: "kept".into(), ..Default::default() },
            SongRecord { title: "No url".into(), ..Default::default() },
        ];
        let fetcher = DetailFetcher::new(&cfg, None, CancellationToken::new());
        let report = fetcher.enrich(&mut page, &mut records).await;

        assert_eq!(report, DetailReport { attempted: 2, enriched: 1, failed: 1, skipped: 1 });
        assert!(records[0].lyrics.starts_with("[Verse]"));
        assert_eq!(records[1].description, "kept");
        assert_eq!(records.len(), 3);
    }

    #[tokio::test]
    async fn rate_gate_spaces_calls() {
        let gate = RateGate::new(Duration::from_millis(30));
        let start = Instant::now();
        for _ in 0..3 {
            gate.wait().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(60));
    }
}
