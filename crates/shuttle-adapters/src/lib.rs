//! Timetable page adapters: HTML tables in, candidate schedule records out.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use shuttle_core::ScheduleRecord;
use thiserror::Error;

pub mod columns;
pub mod decoder;
pub mod profiles;
pub mod stops;
pub mod table;
pub mod time_cell;
pub mod via;

pub use columns::{classify_columns, ColumnMap, ColumnRole, ColumnRule, DEFAULT_RULE_ORDER};
pub use decoder::{decode_grid, decode_page, infer_day_type, PageContext};
pub use profiles::{profile_for, ArrivalSource, PageProfile};
pub use stops::{normalize_stop, StopRole};
pub use table::{extract_grids, TimetableGrid};
pub use time_cell::{parse_time_cell, TimeCell};
pub use via::{estimate_via_time, retain_travel_order, ViaChain};

pub const CRATE_NAME: &str = "shuttle-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Read a saved page from disk and decode it as if it had just been fetched.
pub fn decode_page_file(
    path: impl AsRef<Path>,
    ctx: &PageContext,
    crawled_at: DateTime<Utc>,
) -> Result<Vec<ScheduleRecord>> {
    let path = path.as_ref();
    let html = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    decode_page(&html, ctx, crawled_at).with_context(|| format!("decoding {}", path.display()))
}
