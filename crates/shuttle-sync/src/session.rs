//! Crawl session: fetch + decode every source page in bounded batches under a
//! per-page budget and a hard session deadline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use shuttle_adapters::decode_page;
use shuttle_core::ScheduleRecord;
use shuttle_storage::AdaptiveFetcher;
use tokio::time::{timeout_at, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::SourcePage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBudget {
    pub page_timeout: Duration,
    pub session_deadline: Duration,
    pub concurrency: usize,
}

impl Default for SessionBudget {
    fn default() -> Self {
        Self {
            page_timeout: Duration::from_secs(45),
            session_deadline: Duration::from_secs(240),
            concurrency: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Decoded,
    FetchFailed,
    DecodeFailed,
    TimedOut,
    /// The session deadline passed before the page's batch started.
    NotStarted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageOutcome {
    pub page_id: String,
    pub status: PageStatus,
    pub candidates: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SessionOutput {
    pub candidates: Vec<ScheduleRecord>,
    pub pages: Vec<PageOutcome>,
    pub deadline_hit: bool,
}

impl SessionOutput {
    pub fn pages_with(&self, status: PageStatus) -> usize {
        self.pages.iter().filter(|p| p.status == status).count()
    }
}

pub struct CrawlSession {
    fetcher: Arc<AdaptiveFetcher>,
    budget: SessionBudget,
}

impl CrawlSession {
    pub fn new(fetcher: Arc<AdaptiveFetcher>, budget: SessionBudget) -> Self {
        Self { fetcher, budget }
    }

    pub async fn run(
        &self,
        run_id: Uuid,
        pages: &[SourcePage],
        crawled_at: DateTime<Utc>,
    ) -> SessionOutput {
        let session_deadline = Instant::now() + self.budget.session_deadline;
        let mut out = SessionOutput::default();

        for (batch_no, batch) in pages.chunks(self.budget.concurrency.max(1)).enumerate() {
            if Instant::now() >= session_deadline {
                out.deadline_hit = true;
                break;
            }
            let results = join_all(
                batch
                    .iter()
                    .map(|page| self.run_page(run_id, page, session_deadline, crawled_at)),
            )
            .await;
            for (outcome, records) in results {
                out.candidates.extend(records);
                out.pages.push(outcome);
            }
            info!(%run_id, batch_no, candidates = out.candidates.len(), "batch finished");
        }

        let done = out.pages.len();
        for page in &pages[done..] {
            out.pages.push(PageOutcome {
                page_id: page.page_id.clone(),
                status: PageStatus::NotStarted,
                candidates: 0,
                elapsed_ms: 0,
            });
        }
        if done < pages.len() {
            warn!(%run_id, skipped = pages.len() - done, "session deadline reached, returning partial results");
        }
        out
    }

    async fn run_page(
        &self,
        run_id: Uuid,
        page: &SourcePage,
        session_deadline: Instant,
        crawled_at: DateTime<Utc>,
    ) -> (PageOutcome, Vec<ScheduleRecord>) {
        let started = Instant::now();
        let page_deadline = (started + self.budget.page_timeout).min(session_deadline);
        let span = info_span!("crawl_page", %run_id, page_id = %page.page_id);
        let ctx = page.context();

        let work = async {
            let Some(html) = self.fetcher.fetch(run_id, &page.page_id, &page.url).await else {
                return (PageStatus::FetchFailed, Vec::new());
            };
            match decode_page(&html, &ctx, crawled_at) {
                Ok(records) => (PageStatus::Decoded, records),
                Err(err) => {
                    warn!(error = %err, "page decode failed");
                    (PageStatus::DecodeFailed, Vec::new())
                }
            }
        }
        .instrument(span);

        let (status, records) = match timeout_at(page_deadline, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%run_id, page_id = %page.page_id, "page budget exhausted");
                (PageStatus::TimedOut, Vec::new())
            }
        };
        let outcome = PageOutcome {
            page_id: page.page_id.clone(),
            status,
            candidates: records.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        (outcome, records)
    }
}
