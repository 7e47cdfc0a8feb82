//! Single-cell time parsing.

use std::sync::LazyLock;

use regex::Regex;
use shuttle_core::ClockTime;

static NO_SERVICE_GLYPHS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[XxΧχ]+$").expect("static regex"));

static TIME_CANDIDATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*[:;]\s*(\d+)").expect("static regex"));

/// What a timetable cell holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeCell {
    Time(ClockTime),
    /// Only non-operating glyphs (`X`, Greek `Χ`, any case, repeated).
    Sentinel,
    /// Non-empty text without a valid time: a duration hint or noise.
    Text(String),
    Empty,
}

impl TimeCell {
    pub fn time(&self) -> Option<ClockTime> {
        match self {
            Self::Time(t) => Some(*t),
            _ => None,
        }
    }
}

pub fn parse_time_cell(cell_text: &str) -> TimeCell {
    let cleaned: String = cell_text.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return TimeCell::Empty;
    }
    if NO_SERVICE_GLYPHS.is_match(&cleaned) {
        return TimeCell::Sentinel;
    }
    find_clock_time(cell_text)
        .map(TimeCell::Time)
        .unwrap_or_else(|| TimeCell::Text(cell_text.trim().to_string()))
}

/// First `H:MM`/`HH:MM` (colon or semicolon) in `text` with an in-range value.
pub fn find_clock_time(text: &str) -> Option<ClockTime> {
    TIME_CANDIDATE.captures_iter(text).find_map(|caps| {
        let hour = caps.get(1)?.as_str();
        let minute = caps.get(2)?.as_str();
        if hour.len() > 2 || minute.len() != 2 {
            return None;
        }
        ClockTime::from_hm(hour.parse().ok()?, minute.parse().ok()?)
    })
}
