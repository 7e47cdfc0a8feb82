//! Core schedule model for the shuttle timetable crawler.
//!
//! Every value that crosses a crate boundary (decoded candidates, store rows,
//! store filters) is defined here so the adapters, storage and sync crates agree
//! on one shape.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shuttle-core";

pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Glyph persisted for "does not operate on this day-type".
pub const NO_SERVICE: &str = "X";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeParseError {
    #[error("not a clock time: {0:?}")]
    Malformed(String),
    #[error("clock time out of range: {0:?}")]
    OutOfRange(String),
    #[error("unknown day type: {0:?}")]
    UnknownDayType(String),
}

/// Wall-clock time of day with minute resolution, rendered as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ClockTime(u16);

impl ClockTime {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self((hour * 60 + minute) as u16))
        } else {
            None
        }
    }

    pub fn hour(self) -> u32 {
        u32::from(self.0 / 60)
    }

    pub fn minute(self) -> u32 {
        u32::from(self.0 % 60)
    }

    pub fn minutes_since_midnight(self) -> u16 {
        self.0
    }

    /// Shift by `minutes` (may be negative), wrapping modulo 24h.
    pub fn add_minutes(self, minutes: i64) -> Self {
        let day = i64::from(MINUTES_PER_DAY);
        Self((i64::from(self.0) + minutes).rem_euclid(day) as u16)
    }

    /// Forward distance from `self` to `later`, wrapping past midnight.
    pub fn minutes_until(self, later: Self) -> u16 {
        (later.0 + MINUTES_PER_DAY - self.0) % MINUTES_PER_DAY
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for ClockTime {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (hour, minute) = trimmed
            .split_once(':')
            .ok_or_else(|| TimeParseError::Malformed(s.to_string()))?;
        let well_formed = (1..=2).contains(&hour.len())
            && minute.len() == 2
            && hour.bytes().all(|b| b.is_ascii_digit())
            && minute.bytes().all(|b| b.is_ascii_digit());
        if !well_formed {
            return Err(TimeParseError::Malformed(s.to_string()));
        }
        let hour: u32 = hour
            .parse()
            .map_err(|_| TimeParseError::Malformed(s.to_string()))?;
        let minute: u32 = minute
            .parse()
            .map_err(|_| TimeParseError::Malformed(s.to_string()))?;
        Self::from_hm(hour, minute).ok_or_else(|| TimeParseError::OutOfRange(s.to_string()))
    }
}

impl From<ClockTime> for String {
    fn from(value: ClockTime) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for ClockTime {
    type Error = TimeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Departure/arrival slot: an exact time or the no-service sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SlotTime {
    At(ClockTime),
    NoService,
}

impl SlotTime {
    pub fn clock(self) -> Option<ClockTime> {
        match self {
            Self::At(t) => Some(t),
            Self::NoService => None,
        }
    }

    pub fn is_no_service(self) -> bool {
        matches!(self, Self::NoService)
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::At(t) => t.fmt(f),
            Self::NoService => f.write_str(NO_SERVICE),
        }
    }
}

impl FromStr for SlotTime {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case(NO_SERVICE) {
            Ok(Self::NoService)
        } else {
            s.parse().map(Self::At)
        }
    }
}

impl From<SlotTime> for String {
    fn from(value: SlotTime) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for SlotTime {
    type Error = TimeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Passage time of a via-stop. `Window` is an estimated `HH:MM~HH:MM` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ViaTime {
    At(ClockTime),
    Window(ClockTime, ClockTime),
    NoService,
}

impl ViaTime {
    pub fn start(self) -> Option<ClockTime> {
        match self {
            Self::At(t) | Self::Window(t, _) => Some(t),
            Self::NoService => None,
        }
    }

    pub fn end(self) -> Option<ClockTime> {
        match self {
            Self::At(t) | Self::Window(_, t) => Some(t),
            Self::NoService => None,
        }
    }
}

impl fmt::Display for ViaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::At(t) => t.fmt(f),
            Self::Window(lo, hi) => write!(f, "{lo}~{hi}"),
            Self::NoService => f.write_str(NO_SERVICE),
        }
    }
}

impl FromStr for ViaTime {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case(NO_SERVICE) {
            return Ok(Self::NoService);
        }
        match trimmed.split_once('~') {
            Some((lo, hi)) => Ok(Self::Window(lo.parse()?, hi.parse()?)),
            None => trimmed.parse().map(Self::At),
        }
    }
}

impl From<ViaTime> for String {
    fn from(value: ViaTime) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for ViaTime {
    type Error = TimeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Service-calendar category. Campus routes use `MonThu`/`Friday`; station
/// and commuter routes use the weekday/Saturday-holiday/Sunday split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayType {
    Weekday,
    SaturdayHoliday,
    Sunday,
    MonThu,
    Friday,
}

impl DayType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weekday => "weekday",
            Self::SaturdayHoliday => "saturday_holiday",
            Self::Sunday => "sunday",
            Self::MonThu => "mon_thu",
            Self::Friday => "friday",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Weekday => "평일",
            Self::SaturdayHoliday => "토요일/공휴일",
            Self::Sunday => "일요일",
            Self::MonThu => "월~목",
            Self::Friday => "금요일",
        }
    }
}

impl FromStr for DayType {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "weekday" => Ok(Self::Weekday),
            "saturday_holiday" => Ok(Self::SaturdayHoliday),
            "sunday" => Ok(Self::Sunday),
            "mon_thu" => Ok(Self::MonThu),
            "friday" => Ok(Self::Friday),
            other => Err(TimeParseError::UnknownDayType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Towards campus (등교).
    Boarding,
    /// Away from campus (하교).
    Returning,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boarding => "boarding",
            Self::Returning => "returning",
        }
    }
}

impl FromStr for Direction {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "boarding" => Ok(Self::Boarding),
            "returning" => Ok(Self::Returning),
            other => Err(TimeParseError::Malformed(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteFamily {
    Campus,
    Station,
    Commuter,
}

impl RouteFamily {
    pub fn default_day_type(self) -> DayType {
        match self {
            Self::Campus => DayType::MonThu,
            Self::Station | Self::Commuter => DayType::Weekday,
        }
    }

    /// Only commuter routes carry a direction; it is derived from whether the
    /// trip ends at the route's campus end.
    pub fn direction_for(self, arrival: &str, home: &str) -> Option<Direction> {
        match self {
            Self::Commuter if arrival == home => Some(Direction::Boarding),
            Self::Commuter => Some(Direction::Returning),
            Self::Campus | Self::Station => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViaSource {
    /// Read from a dedicated timetable column.
    Column,
    /// Inferred from free-text notes.
    Note,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViaStop {
    pub name: String,
    pub time: Option<ViaTime>,
    pub source: ViaSource,
}

/// Canonical schedule entry produced by the decoder and persisted by the
/// reconciliation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRecord {
    pub departure: String,
    pub arrival: String,
    pub departure_time: SlotTime,
    /// `None` means "not determinable from the source", which is not the same
    /// as `Some(SlotTime::NoService)`.
    pub arrival_time: Option<SlotTime>,
    pub direction: Option<Direction>,
    pub day_type: DayType,
    pub friday_operates: bool,
    pub via_stops: Vec<ViaStop>,
    pub note: String,
    pub source_ref: String,
    pub crawled_at: DateTime<Utc>,
}

impl ScheduleRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            departure: self.departure.clone(),
            arrival: self.arrival.clone(),
            departure_time: self.departure_time,
            arrival_time: self.arrival_time,
            day_type: self.day_type,
            direction: self.direction,
        }
    }

    pub fn is_no_service(&self) -> bool {
        self.departure_time.is_no_service()
    }
}

/// Upsert identity of a persisted schedule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub departure: String,
    pub arrival: String,
    pub departure_time: SlotTime,
    pub arrival_time: Option<SlotTime>,
    pub day_type: DayType,
    pub direction: Option<Direction>,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}@{}/{}/{}",
            self.departure,
            self.arrival,
            self.departure_time,
            self.arrival_time
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.day_type.as_str()
        )?;
        if let Some(direction) = self.direction {
            write!(f, "/{}", direction.as_str())?;
        }
        Ok(())
    }
}

/// Fields an update may touch on an already persisted schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    pub via_stops: Vec<ViaStop>,
    pub note: String,
    pub friday_operates: bool,
    pub crawled_at: DateTime<Utc>,
}

impl ScheduleUpdate {
    pub fn from_record(record: &ScheduleRecord) -> Self {
        Self {
            via_stops: record.via_stops.clone(),
            note: record.note.clone(),
            friday_operates: record.friday_operates,
            crawled_at: record.crawled_at,
        }
    }

    pub fn apply_to(&self, record: &mut ScheduleRecord) {
        record.via_stops = self.via_stops.clone();
        record.note = self.note.clone();
        record.friday_operates = self.friday_operates;
        record.crawled_at = self.crawled_at;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSchedule {
    pub id: Uuid,
    pub record: ScheduleRecord,
}

/// Store lookup predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleFilter {
    Id(Uuid),
    Key(NaturalKey),
    /// Same departure slot from the same page, but a different arrival.
    MisroutedArrival {
        departure: String,
        departure_time: SlotTime,
        day_type: DayType,
        source_ref: String,
        arrival: String,
    },
}

impl ScheduleFilter {
    pub fn misrouted_arrival(record: &ScheduleRecord) -> Self {
        Self::MisroutedArrival {
            departure: record.departure.clone(),
            departure_time: record.departure_time,
            day_type: record.day_type,
            source_ref: record.source_ref.clone(),
            arrival: record.arrival.clone(),
        }
    }

    pub fn matches(&self, stored: &StoredSchedule) -> bool {
        let record = &stored.record;
        match self {
            Self::Id(id) => stored.id == *id,
            Self::Key(key) => record.natural_key() == *key,
            Self::MisroutedArrival {
                departure,
                departure_time,
                day_type,
                source_ref,
                arrival,
            } => {
                record.departure == *departure
                    && record.departure_time == *departure_time
                    && record.day_type == *day_type
                    && record.source_ref == *source_ref
                    && record.arrival != *arrival
            }
        }
    }
}
