//! Row-to-schedule decoding.
//!
//! One generic walk for every page: find the data rows, classify the header
//! (or take the page's fixed columns), then emit one candidate per departure
//! column holding an exact time. The page profile only changes how the
//! arrival is resolved.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shuttle_core::{
    ClockTime, DayType, RouteFamily, ScheduleRecord, SlotTime, ViaSource, ViaStop, ViaTime,
};
use tracing::debug;

use crate::columns::{
    classify_columns, is_data_row, locate_header_row, ColumnMap, StopColumn,
};
use crate::profiles::{profile_for, ArrivalSource, PageProfile};
use crate::stops::{contains_place_fragment, normalize_stop, StopRole};
use crate::table::{extract_grids, TimetableGrid};
use crate::time_cell::{parse_time_cell, TimeCell};
use crate::via::{retain_travel_order, ViaChain};
use crate::AdapterError;

const NOTE_MARKERS: &[&str] = &["미운행", "노선변경", "노선 변경", "경유", "운행"];
const NO_FRIDAY_MARKERS: &[&str] = &[
    "금요일미운행",
    "금미운행",
    "금요일운행안함",
    "금요일운휴",
    "금요일제외",
];
const VIA_MARKER: &str = "경유";
const NOTE_CLAUSE_BREAKS: &[char] = &['/', '(', ')', '※', '[', ']', '\n'];
const NOTE_NAME_BREAKS: &[char] = &[',', '·', '→', '、'];

/// What the decoder needs to know about the page a table came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContext {
    pub page_id: String,
    pub family: RouteFamily,
    /// Campus end of the route.
    pub home: String,
    /// Default arrival for trips leaving `home`.
    pub terminus: String,
    #[serde(default)]
    pub default_day_type: Option<DayType>,
}

impl PageContext {
    /// Trips from the terminus head home; everything else heads to the terminus.
    pub fn contextual_arrival(&self, departure: &str) -> &str {
        if departure == self.terminus {
            &self.home
        } else {
            &self.terminus
        }
    }

    fn fallback_day_type(&self) -> DayType {
        self.default_day_type
            .unwrap_or_else(|| self.family.default_day_type())
    }
}

pub fn decode_page(
    html: &str,
    ctx: &PageContext,
    crawled_at: DateTime<Utc>,
) -> Result<Vec<ScheduleRecord>, AdapterError> {
    let profile = profile_for(&ctx.page_id);
    let grids = extract_grids(html)?;
    let mut out = Vec::new();
    for grid in &grids {
        out.extend(decode_grid(grid, ctx, profile, crawled_at));
    }
    debug!(page_id = %ctx.page_id, tables = grids.len(), candidates = out.len(), "page decoded");
    Ok(out)
}

pub fn decode_grid(
    grid: &TimetableGrid,
    ctx: &PageContext,
    profile: &PageProfile,
    crawled_at: DateTime<Utc>,
) -> Vec<ScheduleRecord> {
    let order_column = profile.fixed_order_column();
    let Some(first_data) = grid
        .rows
        .iter()
        .position(|row| is_data_row(row, order_column))
    else {
        return Vec::new();
    };

    let (map, header_row) = match profile.fixed_column_map() {
        Some(map) => (map, first_data.checked_sub(1)),
        None => {
            let Some(header_row) = locate_header_row(grid, first_data) else {
                debug!(page_id = %ctx.page_id, "no header row above the data rows");
                return Vec::new();
            };
            (
                classify_columns(grid, header_row, profile.rule_order),
                Some(header_row),
            )
        }
    };
    if !map.has_departures() {
        debug!(page_id = %ctx.page_id, "no departure column recognised");
        return Vec::new();
    }

    // Rows above the data, then caption and headings, nearest first.
    let mut day_type = grid.rows[..header_row.map_or(0, |h| h + 1)]
        .iter()
        .rev()
        .map(|row| row.join(" "))
        .chain(grid.context.iter().cloned())
        .find_map(|part| infer_day_type(&part, ctx.family))
        .unwrap_or_else(|| ctx.fallback_day_type());

    let decoder = RowDecoder {
        map: &map,
        ctx,
        profile,
        crawled_at,
    };
    let mut out = Vec::new();
    for row in &grid.rows[first_data..] {
        if is_data_row(row, map.order.or(order_column)) {
            out.extend(decoder.decode_row(row, day_type));
        } else if let Some(section) =
            section_banner(row).and_then(|text| infer_day_type(text, ctx.family))
        {
            day_type = section;
        }
    }
    out
}

const CAMPUS_DAY_KEYWORDS: &[(&str, DayType)] = &[
    ("월~목", DayType::MonThu),
    ("월-목", DayType::MonThu),
    ("월요일~목요일", DayType::MonThu),
    ("금요일", DayType::Friday),
];
const ROUTE_DAY_KEYWORDS: &[(&str, DayType)] = &[
    ("평일", DayType::Weekday),
    ("토요일", DayType::SaturdayHoliday),
    ("주말", DayType::SaturdayHoliday),
    ("공휴일", DayType::SaturdayHoliday),
    ("일요일", DayType::Sunday),
];
const NEGATIONS: &[&str] = &["미운행", "운휴", "휴무", "제외", "운행안함"];
const REMARK_GLYPHS: &[char] = &['※', '*', '☞', '▶'];
const MAX_BANNER_CHARS: usize = 16;

/// Day type named first in `context`. A keyword directly followed by a
/// negation ("토요일 미운행") names a day without service and is ignored.
pub fn infer_day_type(context: &str, family: RouteFamily) -> Option<DayType> {
    let squeezed: String = context
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '(' | ')' | '[' | ']'))
        .collect();
    let text = squeezed.as_str();
    let keywords = match family {
        RouteFamily::Campus => CAMPUS_DAY_KEYWORDS,
        RouteFamily::Station | RouteFamily::Commuter => ROUTE_DAY_KEYWORDS,
    };
    keywords
        .iter()
        .flat_map(|&(keyword, day_type)| {
            text.match_indices(keyword)
                .filter(move |(at, _)| {
                    let rest = &text[at + keyword.len()..];
                    !NEGATIONS.iter().any(|n| rest.starts_with(n))
                })
                .map(move |(at, _)| (at, day_type))
        })
        .min_by_key(|&(at, _)| at)
        .map(|(_, day_type)| day_type)
}

/// Text of a body row that only carries one short label (a spanned "토요일"
/// row). Rows holding times, several distinct cells or a `※` remark are
/// never banners.
fn section_banner(row: &[String]) -> Option<&str> {
    let mut texts = row.iter().map(|c| c.trim()).filter(|c| !c.is_empty());
    let first = texts.next()?;
    if texts.any(|other| other != first)
        || first.starts_with(REMARK_GLYPHS)
        || first.chars().filter(|c| !c.is_whitespace()).count() > MAX_BANNER_CHARS
    {
        return None;
    }
    match parse_time_cell(first) {
        TimeCell::Text(_) => Some(first),
        _ => None,
    }
}

struct ResolvedArrival {
    stop: String,
    column: Option<usize>,
    time: Option<SlotTime>,
}

struct RowDecoder<'a> {
    map: &'a ColumnMap,
    ctx: &'a PageContext,
    profile: &'a PageProfile,
    crawled_at: DateTime<Utc>,
}

impl RowDecoder<'_> {
    fn decode_row(&self, row: &[String], day_type: DayType) -> Vec<ScheduleRecord> {
        let note = self.row_note(row);
        let friday_operates = friday_operates(row, &note);
        let mut out = Vec::new();

        for dep_col in &self.map.departure {
            let cell = row.get(dep_col.index).map(String::as_str).unwrap_or("");
            let departure_time = match parse_time_cell(cell) {
                TimeCell::Time(t) => t,
                // Sentinel, blank and unparsed departures emit nothing.
                _ => continue,
            };
            let arrival = self.resolve_arrival(row, dep_col);
            if arrival.stop == dep_col.stop {
                continue;
            }

            let mut via_stops = self.column_vias(row, dep_col, &arrival, departure_time);
            let known: HashSet<String> = via_stops.iter().map(|v| v.name.clone()).collect();
            let mut chain = ViaChain::new(
                Some(departure_time),
                arrival.time.and_then(SlotTime::clock),
            );
            for name in note_via_names(&note) {
                if name == dep_col.stop || name == arrival.stop || known.contains(&name) {
                    continue;
                }
                via_stops.push(ViaStop {
                    name,
                    time: chain.estimate(None),
                    source: ViaSource::Note,
                });
            }
            let via_stops = retain_travel_order(
                via_stops,
                departure_time,
                arrival.time.and_then(SlotTime::clock),
            );

            out.push(ScheduleRecord {
                direction: self.ctx.family.direction_for(&arrival.stop, &self.ctx.home),
                departure: dep_col.stop.clone(),
                arrival: arrival.stop,
                departure_time: SlotTime::At(departure_time),
                arrival_time: arrival.time,
                day_type,
                friday_operates,
                via_stops,
                note: note.clone(),
                source_ref: self.ctx.page_id.clone(),
                crawled_at: self.crawled_at,
            });
        }
        out
    }

    /// Walk the page's arrival sources; the first exact time wins. When none
    /// lands, a source holding unparsed text makes the arrival unknown,
    /// otherwise it is recorded as not operating.
    fn resolve_arrival(&self, row: &[String], dep_col: &StopColumn) -> ResolvedArrival {
        let contextual = self.ctx.contextual_arrival(&dep_col.stop).to_string();
        let bound = self
            .map
            .next_departure_after(dep_col.index)
            .unwrap_or(row.len());
        let cell = |index: usize| parse_time_cell(row.get(index).map(String::as_str).unwrap_or(""));
        let in_trip = |index: usize| index > dep_col.index && index < bound;

        let mut fallback_column = None;
        let mut saw_text = false;
        for source in self.profile.arrival_resolution {
            let candidate = match *source {
                ArrivalSource::NamedArrival => self
                    .map
                    .arrival_named(&contextual, dep_col.index)
                    .map(|c| (contextual.clone(), c.index)),
                ArrivalSource::BareArrival => self
                    .map
                    .bare_arrival_after(dep_col.index)
                    .map(|i| (contextual.clone(), i)),
                ArrivalSource::AnyArrival => self
                    .map
                    .arrival
                    .iter()
                    .find(|c| in_trip(c.index) && cell(c.index).time().is_some())
                    .map(|c| (contextual.clone(), c.index)),
                ArrivalSource::FinalPopulatedArrival => self
                    .map
                    .arrival
                    .iter()
                    .rev()
                    .find(|c| in_trip(c.index) && cell(c.index).time().is_some())
                    .map(|c| (c.stop.clone(), c.index)),
                ArrivalSource::ForkTerminus(stop) => self
                    .map
                    .intermediate_named(stop, dep_col.index)
                    .filter(|c| cell(c.index).time().is_some())
                    .map(|c| (c.stop.clone(), c.index)),
            };
            let Some((stop, index)) = candidate else {
                continue;
            };
            match cell(index) {
                TimeCell::Time(t) => {
                    return ResolvedArrival {
                        stop,
                        column: Some(index),
                        time: Some(SlotTime::At(t)),
                    }
                }
                TimeCell::Text(_) => saw_text = true,
                TimeCell::Sentinel | TimeCell::Empty => {}
            }
            fallback_column.get_or_insert(index);
        }

        ResolvedArrival {
            stop: contextual,
            column: fallback_column,
            time: if saw_text {
                None
            } else {
                Some(SlotTime::NoService)
            },
        }
    }

    /// Intermediate columns (and, on hub pages, passed arrival columns)
    /// strictly between the departure and arrival columns, in travel order.
    fn column_vias(
        &self,
        row: &[String],
        dep_col: &StopColumn,
        arrival: &ResolvedArrival,
        departure_time: ClockTime,
    ) -> Vec<ViaStop> {
        let end = arrival.column.unwrap_or_else(|| {
            self.map
                .next_departure_after(dep_col.index)
                .unwrap_or(row.len())
        });
        let (lo, hi) = if end >= dep_col.index {
            (dep_col.index, end)
        } else {
            (end, dep_col.index)
        };

        let mut columns: Vec<&StopColumn> = self
            .map
            .intermediate
            .iter()
            .chain(
                self.map
                    .arrival
                    .iter()
                    .filter(|_| self.profile.arrivals_as_vias),
            )
            .filter(|c| c.index > lo && c.index < hi)
            .filter(|c| c.stop != dep_col.stop && c.stop != arrival.stop)
            .collect();
        columns.sort_by_key(|c| c.index);
        if end < dep_col.index {
            columns.reverse();
        }

        let mut chain = ViaChain::new(Some(departure_time), arrival.time.and_then(SlotTime::clock));
        columns
            .into_iter()
            .map(|column| {
                let text = row.get(column.index).map(String::as_str).unwrap_or("");
                let time = match parse_time_cell(text) {
                    TimeCell::Time(t) => Some(chain.exact(t)),
                    TimeCell::Sentinel => Some(ViaTime::NoService),
                    TimeCell::Text(hint) => chain.estimate(Some(hint.as_str())),
                    TimeCell::Empty => chain.estimate(None),
                };
                ViaStop {
                    name: column.stop.clone(),
                    time,
                    source: ViaSource::Column,
                }
            })
            .collect()
    }

    fn row_note(&self, row: &[String]) -> String {
        if let Some(index) = self.map.note {
            return row.get(index).map(|s| s.trim().to_string()).unwrap_or_default();
        }
        let mut seen = Vec::<&str>::new();
        for (index, text) in row.iter().enumerate() {
            let text = text.trim();
            if Some(index) == self.map.order || text.is_empty() || seen.contains(&text) {
                continue;
            }
            if matches!(parse_time_cell(text), TimeCell::Time(_) | TimeCell::Sentinel) {
                continue;
            }
            if NOTE_MARKERS.iter().any(|m| text.contains(m)) {
                seen.push(text);
            }
        }
        seen.join(" / ")
    }
}

fn friday_operates(row: &[String], note: &str) -> bool {
    let mut text: String = row.concat();
    text.push_str(note);
    let squashed: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    !NO_FRIDAY_MARKERS.iter().any(|m| squashed.contains(m))
}

/// Place names a note lists before `경유` ("두정역, 천안역 경유").
pub fn note_via_names(note: &str) -> Vec<String> {
    let mut names = Vec::new();
    for clause in note.split(NOTE_CLAUSE_BREAKS) {
        let Some((before, after)) = clause.split_once(VIA_MARKER) else {
            continue;
        };
        let listed = if before.trim().is_empty() { after } else { before };
        for raw in listed.split(NOTE_NAME_BREAKS).flat_map(str::split_whitespace) {
            if !contains_place_fragment(raw) {
                continue;
            }
            let name = normalize_stop(raw, StopRole::Departure);
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}
