//! Schedule persistence behind four operations: find, update, insert, delete.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shuttle_core::{
    DayType, Direction, NaturalKey, ScheduleFilter, ScheduleRecord, ScheduleUpdate, SlotTime,
    StoredSchedule, ViaStop,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("natural key already stored: {0}")]
    DuplicateKey(NaturalKey),
    #[error("stored row is malformed: {0}")]
    Malformed(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn find_one(&self, filter: &ScheduleFilter) -> Result<Option<StoredSchedule>, StoreError>;

    /// Applies `update` to the first match; `false` when nothing matched.
    async fn update_one(
        &self,
        filter: &ScheduleFilter,
        update: &ScheduleUpdate,
    ) -> Result<bool, StoreError>;

    /// Fails with [`StoreError::DuplicateKey`] when the natural key is taken.
    async fn insert_one(&self, record: &ScheduleRecord) -> Result<Uuid, StoreError>;

    async fn delete_one(&self, filter: &ScheduleFilter) -> Result<bool, StoreError>;
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    rows: Mutex<Vec<StoredSchedule>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ScheduleRecord>) -> Self {
        let rows = records
            .into_iter()
            .map(|record| StoredSchedule {
                id: Uuid::new_v4(),
                record,
            })
            .collect();
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub async fn snapshot(&self) -> Vec<StoredSchedule> {
        self.rows.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn find_one(&self, filter: &ScheduleFilter) -> Result<Option<StoredSchedule>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().find(|row| filter.matches(row)).cloned())
    }

    async fn update_one(
        &self,
        filter: &ScheduleFilter,
        update: &ScheduleUpdate,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        match rows.iter_mut().find(|row| filter.matches(row)) {
            Some(row) => {
                update.apply_to(&mut row.record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_one(&self, record: &ScheduleRecord) -> Result<Uuid, StoreError> {
        let mut rows = self.rows.lock().await;
        let key = record.natural_key();
        if rows.iter().any(|row| row.record.natural_key() == key) {
            return Err(StoreError::DuplicateKey(key));
        }
        let id = Uuid::new_v4();
        rows.push(StoredSchedule {
            id,
            record: record.clone(),
        });
        Ok(id)
    }

    async fn delete_one(&self, filter: &ScheduleFilter) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        match rows.iter().position(|row| filter.matches(row)) {
            Some(index) => {
                rows.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

const SELECT_COLUMNS: &str = "SELECT id, departure, arrival, departure_time, arrival_time, direction, \
     day_type, friday_operates, via_stops, note, source_ref, crawled_at FROM schedules";

/// PostgreSQL store over the `schedules` table from `migrations/`.
#[derive(Debug, Clone)]
pub struct PgScheduleStore {
    pool: PgPool,
}

impl PgScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn push_where<'a>(qb: &mut QueryBuilder<'a, Postgres>, filter: &'a ScheduleFilter) {
    match filter {
        ScheduleFilter::Id(id) => {
            qb.push(" WHERE id = ").push_bind(*id);
        }
        ScheduleFilter::Key(key) => {
            qb.push(" WHERE departure = ")
                .push_bind(key.departure.as_str())
                .push(" AND arrival = ")
                .push_bind(key.arrival.as_str())
                .push(" AND departure_time = ")
                .push_bind(key.departure_time.to_string())
                .push(" AND arrival_time IS NOT DISTINCT FROM ")
                .push_bind(key.arrival_time.map(|t| t.to_string()))
                .push(" AND day_type = ")
                .push_bind(key.day_type.as_str())
                .push(" AND direction IS NOT DISTINCT FROM ")
                .push_bind(key.direction.map(Direction::as_str));
        }
        ScheduleFilter::MisroutedArrival {
            departure,
            departure_time,
            day_type,
            source_ref,
            arrival,
        } => {
            qb.push(" WHERE departure = ")
                .push_bind(departure.as_str())
                .push(" AND departure_time = ")
                .push_bind(departure_time.to_string())
                .push(" AND day_type = ")
                .push_bind(day_type.as_str())
                .push(" AND source_ref = ")
                .push_bind(source_ref.as_str())
                .push(" AND arrival <> ")
                .push_bind(arrival.as_str());
        }
    }
}

/// `SELECT ... WHERE <filter> LIMIT 1`, also used as the target of the
/// single-row update and delete.
fn first_match<'a>(filter: &'a ScheduleFilter, columns: &str) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(columns);
    push_where(&mut qb, filter);
    qb.push(" ORDER BY crawled_at, id LIMIT 1");
    qb
}

fn parse_column<T: FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|err: T::Err| StoreError::Malformed(format!("{column}={raw:?}: {err}")))
}

fn parse_optional<T: FromStr>(row: &PgRow, column: &str) -> Result<Option<T>, StoreError>
where
    T::Err: std::fmt::Display,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|raw| {
        raw.parse()
            .map_err(|err: T::Err| StoreError::Malformed(format!("{column}={raw:?}: {err}")))
    })
    .transpose()
}

fn row_to_stored(row: &PgRow) -> Result<StoredSchedule, StoreError> {
    let via_stops: Json<Vec<ViaStop>> = row.try_get("via_stops")?;
    let crawled_at: DateTime<Utc> = row.try_get("crawled_at")?;
    Ok(StoredSchedule {
        id: row.try_get("id")?,
        record: ScheduleRecord {
            departure: row.try_get("departure")?,
            arrival: row.try_get("arrival")?,
            departure_time: parse_column::<SlotTime>(row, "departure_time")?,
            arrival_time: parse_optional::<SlotTime>(row, "arrival_time")?,
            direction: parse_optional::<Direction>(row, "direction")?,
            day_type: parse_column::<DayType>(row, "day_type")?,
            friday_operates: row.try_get("friday_operates")?,
            via_stops: via_stops.0,
            note: row.try_get("note")?,
            source_ref: row.try_get("source_ref")?,
            crawled_at,
        },
    })
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn find_one(&self, filter: &ScheduleFilter) -> Result<Option<StoredSchedule>, StoreError> {
        let row = first_match(filter, SELECT_COLUMNS)
            .build()
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_stored).transpose()
    }

    async fn update_one(
        &self,
        filter: &ScheduleFilter,
        update: &ScheduleUpdate,
    ) -> Result<bool, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE schedules SET via_stops = ");
        qb.push_bind(Json(&update.via_stops))
            .push(", note = ")
            .push_bind(update.note.as_str())
            .push(", friday_operates = ")
            .push_bind(update.friday_operates)
            .push(", crawled_at = ")
            .push_bind(update.crawled_at)
            .push(" WHERE id IN (SELECT id FROM schedules");
        push_where(&mut qb, filter);
        qb.push(" ORDER BY crawled_at, id LIMIT 1)");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_one(&self, record: &ScheduleRecord) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let inserted = sqlx::query(
            r#"
            INSERT INTO schedules
                (id, departure, arrival, departure_time, arrival_time, direction,
                 day_type, friday_operates, via_stops, note, source_ref, crawled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(id)
        .bind(&record.departure)
        .bind(&record.arrival)
        .bind(record.departure_time.to_string())
        .bind(record.arrival_time.map(|t| t.to_string()))
        .bind(record.direction.map(Direction::as_str))
        .bind(record.day_type.as_str())
        .bind(record.friday_operates)
        .bind(Json(&record.via_stops))
        .bind(&record.note)
        .bind(&record.source_ref)
        .bind(record.crawled_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(id),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                debug!(key = %record.natural_key(), "insert hit the natural key index");
                Err(StoreError::DuplicateKey(record.natural_key()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_one(&self, filter: &ScheduleFilter) -> Result<bool, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM schedules WHERE id IN (SELECT id FROM schedules");
        push_where(&mut qb, filter);
        qb.push(" ORDER BY crawled_at, id LIMIT 1)");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}
