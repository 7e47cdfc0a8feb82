//! Candidate de-duplication and store reconciliation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use shuttle_adapters::stops::is_non_terminal;
use shuttle_core::{NaturalKey, ScheduleFilter, ScheduleRecord, ScheduleUpdate};
use shuttle_storage::{ScheduleStore, StoreError};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileCounts {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Unique candidates of one run, first occurrence per natural key kept.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    records: Vec<ScheduleRecord>,
    index: HashMap<NaturalKey, usize>,
    skipped: usize,
    filtered: usize,
}

impl CandidateSet {
    pub fn from_candidates(candidates: impl IntoIterator<Item = ScheduleRecord>) -> Self {
        let mut set = Self::default();
        for record in candidates {
            set.push(record);
        }
        set
    }

    /// Adds `record` unless it is not persistable or its key was already seen.
    pub fn push(&mut self, record: ScheduleRecord) {
        if record.is_no_service()
            || record.departure == record.arrival
            || is_non_terminal(&record.arrival)
        {
            self.filtered += 1;
            return;
        }
        let key = record.natural_key();
        if self.index.contains_key(&key) {
            self.skipped += 1;
            return;
        }
        self.index.insert(key, self.records.len());
        self.records.push(record);
    }

    pub fn records(&self) -> &[ScheduleRecord] {
        &self.records
    }

    pub fn contains(&self, key: &NaturalKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Later duplicates dropped within the run.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// No-service, self-loop and way-point arrivals; never counted.
    pub fn filtered(&self) -> usize {
        self.filtered
    }

    pub fn keys(&self) -> HashSet<NaturalKey> {
        self.index.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    Updated,
}

pub struct ReconcileEngine {
    store: Arc<dyn ScheduleStore>,
    batch_size: usize,
}

impl ReconcileEngine {
    pub fn new(store: Arc<dyn ScheduleStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn reconcile(&self, candidates: Vec<ScheduleRecord>) -> ReconcileCounts {
        self.reconcile_set(&CandidateSet::from_candidates(candidates))
            .await
    }

    /// Records of one batch run concurrently; keys are unique by construction.
    pub async fn reconcile_set(&self, set: &CandidateSet) -> ReconcileCounts {
        let current = set.keys();
        let mut counts = ReconcileCounts {
            skipped: set.skipped(),
            ..ReconcileCounts::default()
        };
        for batch in set.records().chunks(self.batch_size) {
            let outcomes = join_all(batch.iter().map(|record| self.reconcile_one(record, &current))).await;
            for (record, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    Ok(Outcome::Created) => counts.created += 1,
                    Ok(Outcome::Updated) => counts.updated += 1,
                    Err(err) => {
                        warn!(key = %record.natural_key(), error = %err, "store operation failed");
                        counts.failed += 1;
                    }
                }
            }
        }
        counts
    }

    async fn reconcile_one(
        &self,
        record: &ScheduleRecord,
        current: &HashSet<NaturalKey>,
    ) -> Result<Outcome, StoreError> {
        let key = record.natural_key();
        if let Some(existing) = self.store.find_one(&ScheduleFilter::Key(key)).await? {
            self.store
                .update_one(
                    &ScheduleFilter::Id(existing.id),
                    &ScheduleUpdate::from_record(record),
                )
                .await?;
            return Ok(Outcome::Updated);
        }

        // Same slot from the same page with another arrival: an earlier run
        // resolved the arrival wrongly. Siblings produced by this run stay.
        if let Some(stale) = self
            .store
            .find_one(&ScheduleFilter::misrouted_arrival(record))
            .await?
        {
            if !current.contains(&stale.record.natural_key()) {
                debug!(
                    stale = %stale.record.natural_key(),
                    replacement = %record.natural_key(),
                    "replacing misrouted schedule"
                );
                self.store.delete_one(&ScheduleFilter::Id(stale.id)).await?;
            }
        }

        self.store.insert_one(record).await?;
        Ok(Outcome::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use shuttle_core::{ClockTime, DayType, SlotTime, StoredSchedule};
    use shuttle_storage::MemoryScheduleStore;
    use uuid::Uuid;

    fn record(dep: &str, arr: &str, time: &str) -> ScheduleRecord {
        ScheduleRecord {
            departure: dep.into(),
            arrival: arr.into(),
            departure_time: time.parse().unwrap(),
            arrival_time: None,
            direction: None,
            day_type: DayType::Weekday,
            friday_operates: true,
            via_stops: Vec::new(),
            note: String::new(),
            source_ref: "P".into(),
            crawled_at: Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap(),
        }
    }

    fn engine(store: Arc<MemoryScheduleStore>) -> ReconcileEngine {
        ReconcileEngine::new(store, 2)
    }

    #[tokio::test]
    async fn second_identical_run_only_updates() {
        let store = Arc::new(MemoryScheduleStore::new());
        let candidates = vec![
            record("A", "B", "08:00"),
            record("A", "B", "09:00"),
            record("B", "A", "08:30"),
        ];
        let first = engine(store.clone()).reconcile(candidates.clone()).await;
        assert_eq!(first.created, 3);
        let second = engine(store.clone()).reconcile(candidates).await;
        assert_eq!(
            second,
            ReconcileCounts {
                created: 0,
                updated: 3,
                skipped: 0,
                failed: 0
            }
        );
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn mutable_fields_follow_the_latest_run() {
        let store = Arc::new(MemoryScheduleStore::with_records([record("A", "B", "08:00")]));
        let mut fresh = record("A", "B", "08:00");
        fresh.note = "금요일 미운행".into();
        fresh.friday_operates = false;
        engine(store.clone()).reconcile(vec![fresh.clone()]).await;
        let rows = store.snapshot().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record, fresh);
    }

    #[tokio::test]
    async fn misrouted_arrival_is_replaced() {
        let store = Arc::new(MemoryScheduleStore::with_records([record("A", "B", "08:00")]));
        let counts = engine(store.clone())
            .reconcile(vec![record("A", "C", "08:00")])
            .await;
        assert_eq!(counts.created, 1);
        let rows = store.snapshot().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.arrival, "C");
    }

    #[tokio::test]
    async fn sibling_from_the_current_run_is_not_treated_as_misrouted() {
        let store = Arc::new(MemoryScheduleStore::with_records([record("A", "B", "08:00")]));
        let counts = engine(store.clone())
            .reconcile(vec![record("A", "C", "08:00"), record("A", "B", "08:00")])
            .await;
        assert_eq!((counts.created, counts.updated), (1, 1));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn other_pages_are_never_repaired() {
        let mut other_page = record("A", "B", "08:00");
        other_page.source_ref = "Q".into();
        let store = Arc::new(MemoryScheduleStore::with_records([other_page]));
        engine(store.clone())
            .reconcile(vec![record("A", "C", "08:00")])
            .await;
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn duplicates_and_unpersistable_candidates() {
        let store = Arc::new(MemoryScheduleStore::new());
        let mut no_service = record("A", "B", "10:00");
        no_service.departure_time = SlotTime::NoService;
        let counts = engine(store.clone())
            .reconcile(vec![
                record("A", "B", "08:00"),
                record("A", "B", "08:00"),
                record("A", "용암마을", "08:10"),
                record("A", "A", "08:20"),
                no_service,
            ])
            .await;
        assert_eq!(
            counts,
            ReconcileCounts {
                created: 1,
                updated: 0,
                skipped: 1,
                failed: 0
            }
        );

        let keys = store
            .snapshot()
            .await
            .iter()
            .map(|row| row.record.natural_key())
            .collect::<HashSet<_>>();
        assert_eq!(keys.len(), store.len().await);
    }

    #[test]
    fn candidate_set_keeps_the_first_occurrence() {
        let mut first = record("A", "B", "08:00");
        first.note = "first".into();
        let set = CandidateSet::from_candidates([first, record("A", "B", "08:00")]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.records()[0].note, "first");
        assert_eq!(set.skipped(), 1);
        assert!(set.contains(&record("A", "B", "08:00").natural_key()));
        assert_eq!(
            set.records()[0].departure_time,
            SlotTime::At(ClockTime::from_hm(8, 0).unwrap())
        );
    }

    /// Rejects inserts for one arrival, delegates everything else.
    struct FlakyStore {
        inner: MemoryScheduleStore,
        broken_arrival: &'static str,
    }

    #[async_trait]
    impl ScheduleStore for FlakyStore {
        async fn find_one(&self, filter: &ScheduleFilter) -> Result<Option<StoredSchedule>, StoreError> {
            self.inner.find_one(filter).await
        }

        async fn update_one(
            &self,
            filter: &ScheduleFilter,
            update: &ScheduleUpdate,
        ) -> Result<bool, StoreError> {
            self.inner.update_one(filter, update).await
        }

        async fn insert_one(&self, record: &ScheduleRecord) -> Result<Uuid, StoreError> {
            if record.arrival == self.broken_arrival {
                return Err(StoreError::Malformed("write rejected".into()));
            }
            self.inner.insert_one(record).await
        }

        async fn delete_one(&self, filter: &ScheduleFilter) -> Result<bool, StoreError> {
            self.inner.delete_one(filter).await
        }
    }

    #[tokio::test]
    async fn store_failures_are_counted_and_do_not_abort_the_batch() {
        let store = Arc::new(FlakyStore {
            inner: MemoryScheduleStore::new(),
            broken_arrival: "C",
        });
        let counts = ReconcileEngine::new(store.clone(), 2)
            .reconcile(vec![
                record("A", "B", "08:00"),
                record("A", "C", "09:00"),
                record("B", "A", "08:30"),
            ])
            .await;
        assert_eq!((counts.created, counts.failed), (2, 1));
        assert_eq!(store.inner.len().await, 2);
    }
}
