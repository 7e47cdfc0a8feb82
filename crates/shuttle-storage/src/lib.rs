//! Page fetching (plain HTTP and headless render) and schedule persistence.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub mod store;

pub use store::{MemoryScheduleStore, PgScheduleStore, ScheduleStore, StoreError};

pub const CRATE_NAME: &str = "shuttle-storage";

/// A plain fetch with fewer time-like strings than this was rendered client
/// side and needs the headless browser.
pub const MIN_TIME_PATTERNS: usize = 3;

static TIME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,2}\s*[:;]\s*\d{2}").expect("static regex"));

pub fn count_time_patterns(text: &str) -> usize {
    TIME_PATTERN.find_iter(text).count()
}

/// Rendered DOM that already shows a table with at least one time in it.
pub fn has_rendered_timetable(dom: &str) -> bool {
    dom.to_ascii_lowercase().contains("<table") && count_time_patterns(dom) > 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("render failed for {url}: {message}")]
    Render { url: String, message: String },
    #[error("fetch limiter closed")]
    Closed,
}

/// Lightweight fetch: returns the response body as served.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_text(&self, run_id: Uuid, page_id: &str, url: &str) -> Result<String, FetchError>;
}

/// Rendered fetch: returns the DOM after scripts ran for roughly `budget`.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, page_id: &str, url: &str, budget: Duration) -> Result<String, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<String, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    let final_url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, status = status.as_u16(), "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_text(&self, run_id: Uuid, page_id: &str, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", %run_id, page_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }
}

/// Drives a headless Chromium binary with `--dump-dom`.
#[derive(Debug, Clone)]
pub struct HeadlessChromeRenderer {
    binary: PathBuf,
    user_agent: Option<String>,
}

impl HeadlessChromeRenderer {
    pub fn new(binary: impl Into<PathBuf>, user_agent: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            user_agent,
        }
    }

    fn args(&self, url: &str, budget: Duration) -> Vec<String> {
        let mut args = vec![
            "--headless=new".to_string(),
            "--disable-gpu".to_string(),
            "--no-sandbox".to_string(),
            "--hide-scrollbars".to_string(),
            format!("--virtual-time-budget={}", budget.as_millis()),
        ];
        if let Some(user_agent) = &self.user_agent {
            args.push(format!("--user-agent={user_agent}"));
        }
        args.push("--dump-dom".to_string());
        args.push(url.to_string());
        args
    }
}

#[async_trait]
impl PageRenderer for HeadlessChromeRenderer {
    async fn render(&self, page_id: &str, url: &str, budget: Duration) -> Result<String, FetchError> {
        let span = info_span!("render_fetch", page_id, url, budget_ms = budget.as_millis() as u64);
        async {
            let output = Command::new(&self.binary)
                .args(self.args(url, budget))
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|err| FetchError::Render {
                    url: url.to_string(),
                    message: err.to_string(),
                })?;
            if !output.status.success() {
                return Err(FetchError::Render {
                    url: url.to_string(),
                    message: format!(
                        "{}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        .instrument(span)
        .await
    }
}

/// Wait bounds for the rendered fallback: the budget doubles per attempt
/// until the DOM shows a timetable or `max_budget` was tried.
#[derive(Debug, Clone, Copy)]
pub struct RenderPolicy {
    pub initial_budget: Duration,
    pub max_budget: Duration,
}

impl Default for RenderPolicy {
    fn default() -> Self {
        Self {
            initial_budget: Duration::from_millis(8_000),
            max_budget: Duration::from_millis(32_000),
        }
    }
}

/// Plain fetch first, rendered fetch when the plain body shows too few times.
pub struct AdaptiveFetcher {
    plain: Arc<dyn PageSource>,
    renderer: Option<Arc<dyn PageRenderer>>,
    policy: RenderPolicy,
}

impl AdaptiveFetcher {
    pub fn new(
        plain: Arc<dyn PageSource>,
        renderer: Option<Arc<dyn PageRenderer>>,
        policy: RenderPolicy,
    ) -> Self {
        Self {
            plain,
            renderer,
            policy,
        }
    }

    /// `None` only when neither strategy produced a body.
    pub async fn fetch(&self, run_id: Uuid, page_id: &str, url: &str) -> Option<String> {
        let plain = match self.plain.fetch_text(run_id, page_id, url).await {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(%run_id, page_id, error = %err, "plain fetch failed");
                None
            }
        };
        if let Some(text) = &plain {
            let found = count_time_patterns(text);
            if found >= MIN_TIME_PATTERNS {
                return plain;
            }
            debug!(page_id, found, "plain body lacks time patterns");
        }

        let Some(renderer) = &self.renderer else {
            return plain;
        };
        let mut budget = self.policy.initial_budget;
        let mut rendered = None;
        loop {
            match renderer.render(page_id, url, budget).await {
                Ok(dom) => {
                    let ready = has_rendered_timetable(&dom);
                    rendered = Some(dom);
                    if ready {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%run_id, page_id, error = %err, "rendered fetch failed");
                    break;
                }
            }
            if budget >= self.policy.max_budget {
                debug!(page_id, "render wait bound spent without a timetable");
                break;
            }
            budget = budget.saturating_mul(2).min(self.policy.max_budget);
        }
        // Whichever body shows more times; the rendered one on a tie.
        match (rendered, plain) {
            (Some(dom), Some(text)) if count_time_patterns(&text) > count_time_patterns(&dom) => {
                Some(text)
            }
            (rendered, plain) => rendered.or(plain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubSource(Result<&'static str, u16>);

    #[async_trait]
    impl PageSource for StubSource {
        async fn fetch_text(&self, _: Uuid, _: &str, url: &str) -> Result<String, FetchError> {
            self.0.map(str::to_string).map_err(|status| FetchError::HttpStatus {
                status,
                url: url.to_string(),
            })
        }
    }

    /// Returns a timetable only once the budget reaches `ready_at`.
    struct StubRenderer {
        ready_at: Duration,
        calls: Mutex<Vec<Duration>>,
        failures: AtomicUsize,
    }

    impl StubRenderer {
        fn new(ready_at: Duration) -> Self {
            Self {
                ready_at,
                calls: Mutex::new(Vec::new()),
                failures: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageRenderer for StubRenderer {
        async fn render(&self, _: &str, url: &str, budget: Duration) -> Result<String, FetchError> {
            self.calls.lock().unwrap().push(budget);
            if self.failures.load(Ordering::SeqCst) > 0 {
                return Err(FetchError::Render {
                    url: url.into(),
                    message: "crashed".into(),
                });
            }
            if budget >= self.ready_at {
                Ok("<table><tr><td>08:00</td></tr></table>".into())
            } else {
                Ok("<div id=\"app\"></div>".into())
            }
        }
    }

    fn policy() -> RenderPolicy {
        RenderPolicy {
            initial_budget: Duration::from_millis(100),
            max_budget: Duration::from_millis(800),
        }
    }

    const STATIC_PAGE: &str = "<table><tr><td>08:00</td><td>09:00</td><td>10:00</td></tr></table>";

    #[tokio::test]
    async fn static_page_skips_the_renderer() {
        let renderer = Arc::new(StubRenderer::new(Duration::ZERO));
        let fetcher = AdaptiveFetcher::new(
            Arc::new(StubSource(Ok(STATIC_PAGE))),
            Some(renderer.clone() as Arc<dyn PageRenderer>),
            policy(),
        );
        let body = fetcher.fetch(Uuid::new_v4(), "p", "http://x").await;
        assert_eq!(body.as_deref(), Some(STATIC_PAGE));
        assert!(renderer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn client_rendered_page_doubles_the_wait_until_a_table_shows() {
        let renderer = Arc::new(StubRenderer::new(Duration::from_millis(400)));
        let fetcher = AdaptiveFetcher::new(
            Arc::new(StubSource(Ok("<div id=\"app\"></div>"))),
            Some(renderer.clone() as Arc<dyn PageRenderer>),
            policy(),
        );
        let body = fetcher.fetch(Uuid::new_v4(), "p", "http://x").await.unwrap();
        assert!(body.contains("08:00"));
        assert_eq!(
            *renderer.calls.lock().unwrap(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[tokio::test]
    async fn render_wait_is_bounded() {
        let renderer = Arc::new(StubRenderer::new(Duration::from_secs(60)));
        let fetcher = AdaptiveFetcher::new(
            Arc::new(StubSource(Err(503))),
            Some(renderer.clone() as Arc<dyn PageRenderer>),
            policy(),
        );
        let body = fetcher.fetch(Uuid::new_v4(), "p", "http://x").await;
        assert_eq!(body.as_deref(), Some("<div id=\"app\"></div>"));
        assert_eq!(renderer.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn sparse_plain_table_beats_an_empty_render() {
        let sparse = "<table><tr><td>08:00</td><td>09:00</td></tr></table>";
        let renderer = Arc::new(StubRenderer::new(Duration::from_secs(60)));
        let fetcher = AdaptiveFetcher::new(
            Arc::new(StubSource(Ok(sparse))),
            Some(renderer.clone() as Arc<dyn PageRenderer>),
            policy(),
        );
        let body = fetcher.fetch(Uuid::new_v4(), "p", "http://x").await;
        assert_eq!(body.as_deref(), Some(sparse));
        assert_eq!(renderer.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn both_strategies_failing_yields_none() {
        let renderer = Arc::new(StubRenderer::new(Duration::ZERO));
        renderer.failures.store(1, Ordering::SeqCst);
        let fetcher = AdaptiveFetcher::new(
            Arc::new(StubSource(Err(500))),
            Some(renderer as Arc<dyn PageRenderer>),
            policy(),
        );
        assert!(fetcher.fetch(Uuid::new_v4(), "p", "http://x").await.is_none());

        let plain_only = AdaptiveFetcher::new(Arc::new(StubSource(Err(404))), None, policy());
        assert!(plain_only.fetch(Uuid::new_v4(), "p", "http://x").await.is_none());
    }

    #[tokio::test]
    async fn sparse_plain_body_is_kept_without_a_renderer() {
        let fetcher = AdaptiveFetcher::new(
            Arc::new(StubSource(Ok("<p>운행 없음</p>"))),
            None,
            policy(),
        );
        assert_eq!(
            fetcher.fetch(Uuid::new_v4(), "p", "http://x").await.as_deref(),
            Some("<p>운행 없음</p>")
        );
    }

    #[test]
    fn time_patterns_accept_loose_separators() {
        assert_eq!(count_time_patterns("08:00 9;30 11 : 45 소요 5~20분"), 3);
        assert!(!has_rendered_timetable("08:00"));
        assert!(has_rendered_timetable("<TABLE><td>08:00</td></TABLE>"));
    }

    #[test]
    fn chrome_args_carry_budget_and_url_last() {
        let renderer = HeadlessChromeRenderer::new("chromium", Some("shuttle-bot/0.1".into()));
        let args = renderer.args("https://example.ac.kr/bus", Duration::from_millis(8000));
        assert!(args.contains(&"--virtual-time-budget=8000".to_string()));
        assert!(args.contains(&"--user-agent=shuttle-bot/0.1".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://example.ac.kr/bus"));
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
