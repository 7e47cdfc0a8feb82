//! Crawl orchestration: source registry, crawl session, reconciliation and
//! run reports.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shuttle_adapters::PageContext;
use shuttle_core::{DayType, RouteFamily, ScheduleRecord};
use shuttle_storage::{
    AdaptiveFetcher, HeadlessChromeRenderer, HttpClientConfig, HttpFetcher, MemoryScheduleStore,
    PageRenderer, PgScheduleStore, RenderPolicy, ScheduleStore,
};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub mod reconcile;
pub mod session;

pub use reconcile::{CandidateSet, ReconcileCounts, ReconcileEngine};
pub use session::{CrawlSession, PageOutcome, PageStatus, SessionBudget, SessionOutput};

pub const CRATE_NAME: &str = "shuttle-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourcePage>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> Vec<SourcePage> {
        self.sources.iter().filter(|s| s.enabled).cloned().collect()
    }

    pub fn find(&self, page_id: &str) -> Option<&SourcePage> {
        self.sources.iter().find(|s| s.page_id == page_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePage {
    pub page_id: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub url: String,
    pub family: RouteFamily,
    pub home: String,
    pub terminus: String,
    #[serde(default)]
    pub default_day_type: Option<DayType>,
}

fn enabled_by_default() -> bool {
    true
}

impl SourcePage {
    pub fn context(&self) -> PageContext {
        PageContext {
            page_id: self.page_id.clone(),
            family: self.family,
            home: self.home.clone(),
            terminus: self.terminus.clone(),
            default_day_type: self.default_day_type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub database_url: Option<String>,
    pub sources_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub page_timeout_secs: u64,
    pub session_deadline_secs: u64,
    pub page_concurrency: usize,
    pub reconcile_batch: usize,
    pub chrome_bin: Option<PathBuf>,
    pub render_budget_ms: u64,
    pub reports_dir: Option<PathBuf>,
}

impl CrawlConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let number = |name: &str, default: u64| {
            text(name)
                .and_then(|v| u64::from_str(v.trim()).ok())
                .unwrap_or(default)
        };
        Self {
            database_url: text("DATABASE_URL"),
            sources_path: text("SHUTTLE_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.yaml")),
            user_agent: text("SHUTTLE_USER_AGENT").unwrap_or_else(|| "shuttle-bot/0.1".to_string()),
            http_timeout_secs: number("SHUTTLE_HTTP_TIMEOUT_SECS", 20),
            page_timeout_secs: number("SHUTTLE_PAGE_TIMEOUT_SECS", 45),
            session_deadline_secs: number("SHUTTLE_SESSION_DEADLINE_SECS", 240),
            page_concurrency: number("SHUTTLE_PAGE_CONCURRENCY", 5) as usize,
            reconcile_batch: number("SHUTTLE_RECONCILE_BATCH", 50) as usize,
            chrome_bin: text("SHUTTLE_CHROME_BIN").map(PathBuf::from),
            render_budget_ms: number("SHUTTLE_RENDER_BUDGET_MS", 8_000),
            reports_dir: text("SHUTTLE_REPORTS_DIR").map(PathBuf::from),
        }
    }

    pub fn session_budget(&self) -> SessionBudget {
        SessionBudget {
            page_timeout: Duration::from_secs(self.page_timeout_secs),
            session_deadline: Duration::from_secs(self.session_deadline_secs),
            concurrency: self.page_concurrency.max(1),
        }
    }

    pub fn render_policy(&self) -> RenderPolicy {
        let initial = Duration::from_millis(self.render_budget_ms.max(1));
        RenderPolicy {
            initial_budget: initial,
            max_budget: initial.saturating_mul(4),
        }
    }
}

/// Result of one `crawl_and_reconcile` call; failures are reported here,
/// never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlReport {
    pub success: bool,
    pub schedules_found: usize,
    pub saved: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CrawlReport {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct CrawlSummary<'a> {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    deadline_hit: bool,
    report: &'a CrawlReport,
    pages: &'a [PageOutcome],
}

pub struct CrawlPipeline {
    config: CrawlConfig,
    store: Arc<dyn ScheduleStore>,
    fetcher: Arc<AdaptiveFetcher>,
}

impl CrawlPipeline {
    /// PostgreSQL when `DATABASE_URL` is set, otherwise an in-memory dry run.
    pub async fn from_config(config: CrawlConfig) -> Result<Self> {
        let store: Arc<dyn ScheduleStore> = match &config.database_url {
            Some(url) => Arc::new(
                PgScheduleStore::connect(url)
                    .await
                    .context("connecting to DATABASE_URL")?,
            ),
            None => {
                info!("DATABASE_URL not set, reconciling into an in-memory store");
                Arc::new(MemoryScheduleStore::new())
            }
        };
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            concurrency: config.page_concurrency.max(1),
            ..Default::default()
        })?;
        let renderer = config.chrome_bin.as_ref().map(|bin| {
            Arc::new(HeadlessChromeRenderer::new(bin, Some(config.user_agent.clone())))
                as Arc<dyn PageRenderer>
        });
        let fetcher = AdaptiveFetcher::new(Arc::new(http), renderer, config.render_policy());
        Ok(Self::with_parts(config, store, Arc::new(fetcher)))
    }

    pub fn with_parts(
        config: CrawlConfig,
        store: Arc<dyn ScheduleStore>,
        fetcher: Arc<AdaptiveFetcher>,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
        }
    }

    pub fn store(&self) -> Arc<dyn ScheduleStore> {
        self.store.clone()
    }

    /// Safe to call repeatedly; never fails, every error lands in the report.
    pub async fn crawl_and_reconcile(&self) -> CrawlReport {
        match self.run_once().await {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "crawl run failed");
                CrawlReport::failure(format!("{err:#}"))
            }
        }
    }

    async fn run_once(&self) -> Result<CrawlReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let registry = SourceRegistry::load(&self.config.sources_path).await?;
        let pages = registry.enabled();
        info!(%run_id, pages = pages.len(), "crawl started");

        let session = CrawlSession::new(self.fetcher.clone(), self.config.session_budget());
        let output = session.run(run_id, &pages, started_at).await;
        let schedules_found = output.candidates.len();

        let report = if schedules_found == 0 {
            CrawlReport::failure(format!(
                "no schedule candidates extracted from {} page(s) ({} fetch failures, {} timeouts)",
                pages.len(),
                output.pages_with(PageStatus::FetchFailed),
                output.pages_with(PageStatus::TimedOut),
            ))
        } else {
            let set = CandidateSet::from_candidates(output.candidates.iter().cloned());
            let engine = ReconcileEngine::new(self.store.clone(), self.config.reconcile_batch);
            let counts = engine.reconcile_set(&set).await;
            info!(
                %run_id,
                found = schedules_found,
                unique = set.len(),
                filtered = set.filtered(),
                created = counts.created,
                updated = counts.updated,
                failed = counts.failed,
                "reconcile finished"
            );
            CrawlReport {
                success: true,
                schedules_found,
                saved: counts.created,
                updated: counts.updated,
                skipped: counts.skipped,
                failed: counts.failed,
                error: None,
            }
        };

        if let Some(dir) = &self.config.reports_dir {
            let summary = CrawlSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                deadline_hit: output.deadline_hit,
                report: &report,
                pages: &output.pages,
            };
            if let Err(err) = write_run_report(dir, &summary, &output.candidates).await {
                warn!(%run_id, error = %format!("{err:#}"), "writing run report failed");
            }
        }
        Ok(report)
    }
}

async fn write_run_report(
    dir: &Path,
    summary: &CrawlSummary<'_>,
    candidates: &[ScheduleRecord],
) -> Result<PathBuf> {
    let run_dir = dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing crawl summary")?;
    fs::write(run_dir.join("crawl_summary.json"), summary_json)
        .await
        .context("writing crawl_summary.json")?;

    let candidates_json =
        serde_json::to_vec_pretty(candidates).context("serializing candidate schedules")?;
    fs::write(run_dir.join("candidates.json"), candidates_json)
        .await
        .context("writing candidates.json")?;
    Ok(run_dir)
}

/// Entry point for the CLI: configuration from the environment, one crawl.
pub async fn crawl_and_reconcile_from_env() -> CrawlReport {
    match CrawlPipeline::from_config(CrawlConfig::from_env()).await {
        Ok(pipeline) => pipeline.crawl_and_reconcile().await,
        Err(err) => CrawlReport::failure(format!("{err:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    use async_trait::async_trait;
    use shuttle_storage::{FetchError, PageSource};
    use tempfile::tempdir;

    const STATION_PAGE: &str = r#"
        <h4>평일</h4>
        <table>
          <tr><th>순번</th><th>아산캠퍼스 출발</th><th>천안아산역 도착</th><th>천안아산역 출발</th><th>아산캠퍼스 도착</th></tr>
          <tr><td>1</td><td>08:00</td><td>08:20</td><td>08:30</td><td>08:50</td></tr>
          <tr><td>2</td><td>09:00</td><td>09:20</td><td>X</td><td>X</td></tr>
        </table>"#;

    const REGISTRY: &str = r#"
sources:
  - page_id: cheonan-asan-station
    display_name: 천안아산역 셔틀
    url: https://shuttle.example.ac.kr/station
    family: station
    home: 아산캠퍼스
    terminus: 천안아산역
  - page_id: retired
    display_name: 폐지 노선
    enabled: false
    url: https://shuttle.example.ac.kr/retired
    family: commuter
    home: 아산캠퍼스
    terminus: 온양온천역
    default_day_type: weekday
"#;

    struct StaticSource(HashMap<&'static str, &'static str>);

    #[async_trait]
    impl PageSource for StaticSource {
        async fn fetch_text(&self, _: Uuid, _: &str, url: &str) -> Result<String, FetchError> {
            self.0
                .get(url)
                .map(|body| body.to_string())
                .ok_or_else(|| FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                })
        }
    }

    fn config(sources_path: PathBuf, reports_dir: Option<PathBuf>) -> CrawlConfig {
        CrawlConfig {
            sources_path,
            reports_dir,
            ..CrawlConfig::from_lookup(|_| None)
        }
    }

    fn pipeline(config: CrawlConfig, pages: &[(&'static str, &'static str)]) -> CrawlPipeline {
        let source = StaticSource(pages.iter().copied().collect());
        let fetcher = AdaptiveFetcher::new(Arc::new(source), None, RenderPolicy::default());
        CrawlPipeline::with_parts(config, Arc::new(MemoryScheduleStore::new()), Arc::new(fetcher))
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = CrawlConfig::from_lookup(|_| None);
        assert_eq!(defaults.database_url, None);
        assert_eq!(defaults.sources_path, PathBuf::from("./sources.yaml"));
        assert_eq!(defaults.user_agent, "shuttle-bot/0.1");
        assert_eq!(defaults.session_budget(), SessionBudget::default());
        assert_eq!(defaults.reconcile_batch, 50);
        assert!(defaults.chrome_bin.is_none());

        let env: HashMap<&str, &str> = [
            ("SHUTTLE_PAGE_CONCURRENCY", "2"),
            ("SHUTTLE_SESSION_DEADLINE_SECS", "not-a-number"),
            ("SHUTTLE_CHROME_BIN", "/usr/bin/chromium"),
            ("DATABASE_URL", " "),
        ]
        .into_iter()
        .collect();
        let cfg = CrawlConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.page_concurrency, 2);
        assert_eq!(cfg.session_deadline_secs, 240);
        assert_eq!(cfg.chrome_bin, Some(PathBuf::from("/usr/bin/chromium")));
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.render_policy().max_budget, Duration::from_millis(32_000));
    }

    #[test]
    fn registry_parses_and_filters_disabled_pages() {
        let registry: SourceRegistry = serde_yaml::from_str(REGISTRY).unwrap();
        assert_eq!(registry.sources.len(), 2);
        let enabled = registry.enabled();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].family, RouteFamily::Station);
        let retired = registry.find("retired").unwrap();
        assert_eq!(retired.context().default_day_type, Some(DayType::Weekday));
    }

    #[tokio::test]
    async fn shipped_registry_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let registry = SourceRegistry::load(&path).await.unwrap();
        assert_eq!(registry.enabled().len(), registry.sources.len());
        let hub = registry.find("station-hub").unwrap().context();
        assert_eq!(hub.terminus, "천안터미널");
        let ids: HashSet<_> = registry.sources.iter().map(|s| s.page_id.as_str()).collect();
        assert_eq!(ids.len(), registry.sources.len());
    }

    #[tokio::test]
    async fn crawl_reconciles_and_writes_a_run_report() {
        let dir = tempdir().unwrap();
        let sources = dir.path().join("sources.yaml");
        std::fs::write(&sources, REGISTRY).unwrap();
        let reports = dir.path().join("reports");

        let pipeline = pipeline(
            config(sources, Some(reports.clone())),
            &[("https://shuttle.example.ac.kr/station", STATION_PAGE)],
        );
        let report = pipeline.crawl_and_reconcile().await;
        assert_eq!(
            report,
            CrawlReport {
                success: true,
                schedules_found: 3,
                saved: 3,
                updated: 0,
                skipped: 0,
                failed: 0,
                error: None,
            }
        );

        let again = pipeline.crawl_and_reconcile().await;
        assert_eq!((again.saved, again.updated), (0, 3));

        let runs = std::fs::read_dir(&reports).unwrap().count();
        assert_eq!(runs, 2);
        let run_dir = std::fs::read_dir(&reports)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let summary: serde_json::Value =
            serde_json::from_slice(&std::fs::read(run_dir.join("crawl_summary.json")).unwrap())
                .unwrap();
        assert_eq!(summary["report"]["success"], serde_json::Value::Bool(true));
        assert_eq!(summary["pages"][0]["status"], "decoded");
        let candidates: Vec<ScheduleRecord> =
            serde_json::from_slice(&std::fs::read(run_dir.join("candidates.json")).unwrap())
                .unwrap();
        assert_eq!(candidates.len(), 3);
    }

    #[tokio::test]
    async fn every_page_failing_is_reported_not_raised() {
        let dir = tempdir().unwrap();
        let sources = dir.path().join("sources.yaml");
        std::fs::write(&sources, REGISTRY).unwrap();

        let report = pipeline(config(sources, None), &[]).crawl_and_reconcile().await;
        assert!(!report.success);
        assert_eq!(report.schedules_found, 0);
        assert!(report.error.unwrap().contains("1 fetch failures"));
    }

    #[tokio::test]
    async fn missing_registry_is_reported_not_raised() {
        let dir = tempdir().unwrap();
        let report = pipeline(config(dir.path().join("absent.yaml"), None), &[])
            .crawl_and_reconcile()
            .await;
        assert!(!report.success);
        assert!(report.error.unwrap().contains("absent.yaml"));
    }

    #[test]
    fn report_serializes_with_camel_case_keys() {
        let json = serde_json::to_value(CrawlReport {
            success: true,
            schedules_found: 4,
            saved: 1,
            updated: 3,
            ..CrawlReport::default()
        })
        .unwrap();
        assert_eq!(json["schedulesFound"], 4);
        assert!(json.get("error").is_none());
    }
}
