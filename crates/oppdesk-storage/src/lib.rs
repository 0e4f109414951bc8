//! HTTP fetch utilities + snapshot storage for the Opportunity Desk scraper.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use oppdesk_core::{Opportunity, RunResult, ScrapeDate};
use rand::seq::IndexedRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONNECTION, USER_AGENT};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppdesk-storage";

/// Realistic desktop browser strings; one is picked per request attempt.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:123.0) Gecko/20100101 Firefox/123.0",
];

pub const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";

/// Suspension point for backoff and politeness waits.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested waits and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn total(&self) -> Duration {
        self.recorded().into_iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
    }
}

/// Inclusive range a random wait is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn from_secs(min: u64, max: u64) -> Self {
        Self::new(Duration::from_secs(min), Duration::from_secs(max))
    }

    pub fn sample(&self) -> Duration {
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        if lo >= hi {
            return self.min;
        }
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }

    pub fn contains(&self, duration: Duration) -> bool {
        duration >= self.min && duration <= self.max
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub jitter: DelayRange,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            jitter: DelayRange::from_secs(2, 4),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl BackoffPolicy {
    /// Exponential part of the wait after the failed attempt `attempt_index` (0-based).
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Full wait before the next attempt: exponential part plus jitter.
    pub fn wait_before_retry(&self, attempt_index: usize) -> Duration {
        self.delay_for_attempt(attempt_index) + self.jitter.sample()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agents: Vec<String>,
    pub accept_language: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agents: USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("gave up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: usize,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// HTTP status of the (last) failed attempt, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Exhausted { last, .. } => last.status(),
            Self::Request { .. } => None,
        }
    }
}

/// The single I/O primitive the parsers depend on.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    user_agents: Vec<String>,
    accept_language: String,
    backoff: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("user_agents", &self.user_agents.len())
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        let user_agents = if config.user_agents.is_empty() {
            USER_AGENTS.iter().map(|ua| ua.to_string()).collect()
        } else {
            config.user_agents
        };

        Ok(Self {
            client,
            user_agents,
            accept_language: config.accept_language,
            backoff: config.backoff,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    fn pick_user_agent(&self) -> &str {
        self.user_agents
            .choose(&mut rand::rng())
            .map(String::as_str)
            .unwrap_or(USER_AGENTS[0])
    }

    /// Header set for one attempt, with a freshly drawn `User-Agent`.
    pub fn request_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let user_agent = HeaderValue::from_str(self.pick_user_agent())
            .unwrap_or_else(|_| HeaderValue::from_static(USER_AGENTS[0]));
        headers.insert(USER_AGENT, user_agent);
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        let language = HeaderValue::from_str(&self.accept_language)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_ACCEPT_LANGUAGE));
        headers.insert(ACCEPT_LANGUAGE, language);
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers
    }

    async fn attempt_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .headers(self.request_headers())
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.text().await.map_err(|source| FetchError::Request {
            url: final_url.clone(),
            source,
        })?;
        Ok(FetchedResponse {
            status: status.as_u16(),
            final_url,
            body,
        })
    }

    /// GET `url`, retrying every failure until the policy's attempts run out.
    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let attempts = self.backoff.max_attempts.max(1);
        let span = info_span!("http_fetch", url);

        async move {
            let mut attempt = 0usize;
            loop {
                match self.attempt_once(url).await {
                    Ok(resp) => {
                        debug!(status = resp.status, bytes = resp.body.len(), "fetched");
                        return Ok(resp);
                    }
                    Err(err) if attempt + 1 < attempts => {
                        warn!(attempt = attempt + 1, attempts, error = %err, "fetch attempt failed");
                        let wait = self.backoff.wait_before_retry(attempt);
                        debug!(wait_ms = wait.as_millis() as u64, "backing off");
                        self.sleeper.sleep(wait).await;
                        attempt += 1;
                    }
                    Err(err) => {
                        warn!(attempt = attempt + 1, attempts, error = %err, "fetch attempt failed; giving up");
                        return Err(FetchError::Exhausted {
                            url: url.to_string(),
                            attempts,
                            last: Box::new(err),
                        });
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_text(url).await
    }
}

/// In-memory pages keyed by URL, for replaying captured HTML.
///
/// Unknown URLs and URLs registered with [`FixturePages::fail`] answer with an
/// exhausted fetch carrying the given status.
#[derive(Debug, Default)]
pub struct FixturePages {
    pages: HashMap<String, String>,
    failures: HashMap<String, u16>,
    requested: Mutex<Vec<String>>,
}

impl FixturePages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.pages.insert(url.into(), body.into());
        self
    }

    pub fn fail(mut self, url: impl Into<String>, status: u16) -> Self {
        self.failures.insert(url.into(), status);
        self
    }

    /// URLs requested so far, in order.
    pub fn requested(&self) -> Vec<String> {
        self.requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl PageFetcher for FixturePages {
    async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(url.to_string());

        if let Some(body) = self.pages.get(url) {
            return Ok(FetchedResponse {
                status: 200,
                final_url: url.to_string(),
                body: body.clone(),
            });
        }
        let status = self.failures.get(url).copied().unwrap_or(404);
        Err(FetchError::Exhausted {
            url: url.to_string(),
            attempts: 1,
            last: Box::new(FetchError::HttpStatus {
                status,
                url: url.to_string(),
            }),
        })
    }
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Dated JSON documents for audit and replay.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn opportunities_relative_path(date: ScrapeDate) -> PathBuf {
        PathBuf::from(format!("opportunities_{}.json", date.file_stamp()))
    }

    pub fn run_report_relative_path(run_id: Uuid) -> PathBuf {
        PathBuf::from("runs").join(format!("{run_id}.json"))
    }

    /// Ordered JSON array of everything collected for `date`.
    pub async fn write_opportunities(
        &self,
        date: ScrapeDate,
        opportunities: &[Opportunity],
    ) -> anyhow::Result<StoredSnapshot> {
        self.write_json(&Self::opportunities_relative_path(date), &opportunities)
            .await
    }

    pub async fn write_run_report(&self, run: &RunResult) -> anyhow::Result<StoredSnapshot> {
        self.write_json(&Self::run_report_relative_path(run.run_id), run)
            .await
    }

    /// Pretty-print `value` to `relative_path`, replacing any previous file via
    /// temp-file rename.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        relative_path: &Path,
        value: &T,
    ) -> anyhow::Result<StoredSnapshot> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {}", relative_path.display()))?;
        let absolute_path = self.root.join(relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredSnapshot {
            content_hash: Self::sha256_hex(&bytes),
            relative_path: relative_path.to_path_buf(),
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use oppdesk_core::{DetailFields, ListingEntry};
    use tempfile::tempdir;

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fetcher(sleeper: Arc<RecordingSleeper>) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap()
        .with_sleeper(sleeper)
    }

    async fn flaky(State(hits): State<Arc<AtomicUsize>>) -> (StatusCode, &'static str) {
        let n = hits.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            (StatusCode::SERVICE_UNAVAILABLE, "busy")
        } else {
            (StatusCode::OK, "<html>listing</html>")
        }
    }

    async fn always_down(State(hits): State<Arc<AtomicUsize>>) -> StatusCode {
        hits.fetch_add(1, Ordering::SeqCst);
        StatusCode::SERVICE_UNAVAILABLE
    }

    async fn echo_headers(headers: AxumHeaders) -> String {
        format!(
            "{}\n{}\n{}",
            headers
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default(),
            headers
                .get("accept")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default(),
            headers
                .get("accept-language")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default(),
        )
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            jitter: DelayRange::from_secs(2, 4),
            max_delay: Duration::from_secs(6),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(6));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(6));
    }

    #[test]
    fn retry_wait_adds_two_to_four_seconds_of_jitter() {
        let policy = BackoffPolicy::default();
        for attempt in 0..4 {
            let exp = policy.delay_for_attempt(attempt);
            for _ in 0..50 {
                let wait = policy.wait_before_retry(attempt);
                assert!(wait >= exp + Duration::from_secs(2), "{wait:?} too short");
                assert!(wait <= exp + Duration::from_secs(4), "{wait:?} too long");
            }
        }
    }

    #[test]
    fn delay_range_normalizes_and_samples_inside() {
        let range = DelayRange::from_secs(10, 5);
        assert_eq!(range.min, Duration::from_secs(5));
        for _ in 0..100 {
            assert!(range.contains(range.sample()));
        }
        let fixed = DelayRange::from_secs(3, 3);
        assert_eq!(fixed.sample(), Duration::from_secs(3));
    }

    #[test]
    fn request_headers_draw_user_agent_from_pool() {
        let fetcher = fetcher(Arc::new(RecordingSleeper::new()));
        for _ in 0..20 {
            let headers = fetcher.request_headers();
            let ua = headers.get(USER_AGENT).unwrap().to_str().unwrap();
            assert!(USER_AGENTS.contains(&ua));
            assert_eq!(headers.get(ACCEPT).unwrap(), ACCEPT_HTML);
            assert_eq!(headers.get(CONNECTION).unwrap(), "keep-alive");
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/flaky", get(flaky))
            .with_state(Arc::clone(&hits));
        let base = spawn_server(app).await;
        let sleeper = Arc::new(RecordingSleeper::new());

        let resp = fetcher(Arc::clone(&sleeper))
            .fetch_text(&format!("{base}/flaky"))
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "<html>listing</html>");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        let waits = sleeper.recorded();
        assert_eq!(waits.len(), 2);
        assert!(waits[0] >= Duration::from_secs(3) && waits[0] <= Duration::from_secs(5));
        assert!(waits[1] >= Duration::from_secs(4) && waits[1] <= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn gives_up_after_five_attempts() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/down", get(always_down))
            .with_state(Arc::clone(&hits));
        let base = spawn_server(app).await;
        let sleeper = Arc::new(RecordingSleeper::new());

        let err = fetcher(Arc::clone(&sleeper))
            .fetch_text(&format!("{base}/down"))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Exhausted { attempts: 5, .. }));
        assert_eq!(err.status(), Some(503));
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        // no wait after the last attempt
        assert_eq!(sleeper.recorded().len(), 4);
    }

    #[tokio::test]
    async fn connection_errors_are_retried() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let sleeper = Arc::new(RecordingSleeper::new());

        let err = fetcher(Arc::clone(&sleeper))
            .fetch_text(&format!("http://{addr}/gone"))
            .await
            .unwrap_err();

        match err {
            FetchError::Exhausted { last, attempts, .. } => {
                assert_eq!(attempts, 5);
                assert!(matches!(*last, FetchError::Request { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(sleeper.recorded().len(), 4);
    }

    #[tokio::test]
    async fn sends_browser_headers() {
        let app = Router::new().route("/echo", get(echo_headers));
        let base = spawn_server(app).await;
        let resp = fetcher(Arc::new(RecordingSleeper::new()))
            .fetch_text(&format!("{base}/echo"))
            .await
            .unwrap();
        let lines: Vec<&str> = resp.body.lines().collect();
        assert!(USER_AGENTS.contains(&lines[0]));
        assert_eq!(lines[1], ACCEPT_HTML);
        assert_eq!(lines[2], DEFAULT_ACCEPT_LANGUAGE);
    }

    #[tokio::test]
    async fn fixture_pages_serve_known_urls_and_fail_others() {
        let pages = FixturePages::new()
            .page("https://site.test/a", "<p>a</p>")
            .fail("https://site.test/b", 503);

        assert_eq!(pages.fetch_page("https://site.test/a").await.unwrap().body, "<p>a</p>");
        assert_eq!(
            pages.fetch_page("https://site.test/b").await.unwrap_err().status(),
            Some(503)
        );
        assert_eq!(
            pages.fetch_page("https://site.test/c").await.unwrap_err().status(),
            Some(404)
        );
        assert_eq!(pages.requested().len(), 3);
    }

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = SnapshotStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn writes_dated_opportunity_snapshot_and_overwrites() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let date = ScrapeDate::from_ymd(2024, 1, 15).unwrap();
        let entry = ListingEntry {
            position: 1,
            title: "Grant A".into(),
            detail_url: "https://site.test/a".into(),
        };
        let opp = Opportunity::assemble(&entry, DetailFields::default()).unwrap();

        let first = store.write_opportunities(date, &[opp.clone()]).await.unwrap();
        assert_eq!(first.relative_path, PathBuf::from("opportunities_2024-01-15.json"));
        let written: Vec<Opportunity> =
            serde_json::from_str(&std::fs::read_to_string(&first.absolute_path).unwrap()).unwrap();
        assert_eq!(written, vec![opp.clone()]);

        let second = store
            .write_opportunities(date, &[opp.clone(), opp])
            .await
            .unwrap();
        assert_eq!(first.absolute_path, second.absolute_path);
        assert_ne!(first.content_hash, second.content_hash);
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn run_report_lands_under_runs_dir() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let date = ScrapeDate::from_ymd(2024, 1, 15).unwrap();
        let run = RunResult::begin(date, "https://site.test/2024/01/15/");
        let stored = store.write_run_report(&run).await.unwrap();
        assert!(stored.absolute_path.starts_with(dir.path().join("runs")));
        let back: RunResult =
            serde_json::from_str(&std::fs::read_to_string(&stored.absolute_path).unwrap()).unwrap();
        assert_eq!(back.run_id, run.run_id);
    }
}
