//! Header-row column role classification.
//!
//! Each header cell is run through an ordered list of [`ColumnRule`]s; the
//! first rule that fires decides the column's role. Pages with a layout the
//! rules cannot read supply fixed columns instead (see `profiles`).

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::stops::{contains_place_fragment, normalize_stop, StopRole};
use crate::table::TimetableGrid;

pub const DEPART_WORD: &str = "출발";
pub const ARRIVE_WORD: &str = "도착";

/// Rows above the header scanned for a banner stating 출발/도착.
pub const BANNER_LOOKBACK: usize = 5;

const NOTE_WORDS: &[&str] = &["비고", "참고", "특이사항", "안내"];
const ORDER_WORDS: &[&str] = &["순번", "번호", "회차", "운행순서", "no", "no."];
const NAME_NOISE: &[&str] = &[DEPART_WORD, ARRIVE_WORD, "시간", "시각", "()", "[]"];

static SEQUENCE_CELL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}\s*(회|번|\.)?$").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRule {
    Order,
    Note,
    /// Place + 출발, no 도착.
    Departure,
    /// Place + 도착, no 출발.
    Arrival,
    /// 도착 without a place name: the arrival time at the page's default stop.
    BareArrival,
    /// Place with neither qualifier.
    Intermediate,
    /// Place with both qualifiers, read as a departure.
    ThroughAsDeparture,
    /// Place with both qualifiers, read as an arrival.
    ThroughAsArrival,
}

pub const DEFAULT_RULE_ORDER: &[ColumnRule] = &[
    ColumnRule::Order,
    ColumnRule::Note,
    ColumnRule::Departure,
    ColumnRule::Arrival,
    ColumnRule::BareArrival,
    ColumnRule::Intermediate,
    ColumnRule::ThroughAsDeparture,
    ColumnRule::ThroughAsArrival,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRole {
    Order,
    Note,
    Departure(String),
    Arrival(String),
    BareArrival,
    Intermediate(String),
}

/// A header cell with its qualifiers resolved (own text first, banner second).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderCell<'a> {
    pub text: &'a str,
    pub place: bool,
    pub depart: bool,
    pub arrive: bool,
}

impl<'a> HeaderCell<'a> {
    pub fn new(text: &'a str, banner: Option<&str>) -> Self {
        let own_depart = text.contains(DEPART_WORD);
        let own_arrive = text.contains(ARRIVE_WORD);
        let (depart, arrive) = match banner {
            Some(banner) if !own_depart && !own_arrive => {
                (banner.contains(DEPART_WORD), banner.contains(ARRIVE_WORD))
            }
            _ => (own_depart, own_arrive),
        };
        Self {
            text,
            place: contains_place_fragment(text),
            depart,
            arrive,
        }
    }
}

impl ColumnRule {
    pub fn apply(self, cell: &HeaderCell<'_>) -> Option<ColumnRole> {
        let HeaderCell {
            text,
            place,
            depart,
            arrive,
        } = *cell;
        match self {
            Self::Order if !place && is_order_header(text) => Some(ColumnRole::Order),
            Self::Note if NOTE_WORDS.iter().any(|w| text.contains(w)) => Some(ColumnRole::Note),
            Self::Departure if place && depart && !arrive => {
                Some(ColumnRole::Departure(stop_name(text, StopRole::Departure)))
            }
            Self::Arrival if place && arrive && !depart => {
                Some(ColumnRole::Arrival(stop_name(text, StopRole::Arrival)))
            }
            Self::BareArrival if !place && arrive && !depart => Some(ColumnRole::BareArrival),
            Self::Intermediate if place && !depart && !arrive => {
                Some(ColumnRole::Intermediate(stop_name(text, StopRole::Departure)))
            }
            Self::ThroughAsDeparture if place && depart && arrive => {
                Some(ColumnRole::Departure(stop_name(text, StopRole::Departure)))
            }
            Self::ThroughAsArrival if place && depart && arrive => {
                Some(ColumnRole::Arrival(stop_name(text, StopRole::Arrival)))
            }
            _ => None,
        }
    }
}

fn is_order_header(text: &str) -> bool {
    let squashed: String = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    ORDER_WORDS
        .iter()
        .any(|w| if w.is_ascii() { squashed == *w } else { squashed.contains(w) })
}

/// Strip qualifiers and time words from a header cell, then canonicalize.
pub fn stop_name(header_text: &str, role: StopRole) -> String {
    let mut name = header_text.to_string();
    for noise in NAME_NOISE {
        name = name.replace(noise, " ");
    }
    let name = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| matches!(c, '/' | '·' | '-' | ':'))
        .trim()
        .to_string();
    normalize_stop(&name, role)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopColumn {
    pub stop: String,
    pub index: usize,
}

/// Column roles for one table, each namespace ordered by column index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMap {
    pub departure: Vec<StopColumn>,
    pub arrival: Vec<StopColumn>,
    pub intermediate: Vec<StopColumn>,
    pub bare_arrival: Vec<usize>,
    pub note: Option<usize>,
    pub order: Option<usize>,
}

impl ColumnMap {
    pub fn assign(&mut self, index: usize, role: ColumnRole) {
        match role {
            ColumnRole::Order => {
                self.order.get_or_insert(index);
            }
            ColumnRole::Note => {
                self.note.get_or_insert(index);
            }
            ColumnRole::Departure(stop) => self.departure.push(StopColumn { stop, index }),
            ColumnRole::Arrival(stop) => self.arrival.push(StopColumn { stop, index }),
            ColumnRole::BareArrival => self.bare_arrival.push(index),
            ColumnRole::Intermediate(stop) => self.intermediate.push(StopColumn { stop, index }),
        }
    }

    pub fn has_departures(&self) -> bool {
        !self.departure.is_empty()
    }

    /// Arrival column for `stop`, preferring the first one right of `after`.
    pub fn arrival_named(&self, stop: &str, after: usize) -> Option<&StopColumn> {
        let mut named = self.arrival.iter().filter(|c| c.stop == stop);
        let first = named.clone().next();
        named.find(|c| c.index > after).or(first)
    }

    pub fn bare_arrival_after(&self, after: usize) -> Option<usize> {
        self.bare_arrival
            .iter()
            .copied()
            .find(|&i| i > after)
            .or_else(|| self.bare_arrival.first().copied())
    }

    pub fn intermediate_named(&self, stop: &str, after: usize) -> Option<&StopColumn> {
        self.intermediate
            .iter()
            .find(|c| c.stop == stop && c.index > after)
    }

    /// First departure column right of `index`, used to bound a trip whose
    /// arrival column is unknown.
    pub fn next_departure_after(&self, index: usize) -> Option<usize> {
        self.departure.iter().map(|c| c.index).find(|&i| i > index)
    }
}

pub fn is_sequence_cell(text: &str) -> bool {
    SEQUENCE_CELL.is_match(text.trim())
}

pub fn is_data_row(row: &[String], order_column: Option<usize>) -> bool {
    row.get(order_column.unwrap_or(0))
        .is_some_and(|cell| is_sequence_cell(cell))
}

/// Nearest row above the first data row that names at least one place.
pub fn locate_header_row(grid: &TimetableGrid, first_data_row: usize) -> Option<usize> {
    (0..first_data_row)
        .rev()
        .find(|&r| grid.rows[r].iter().any(|cell| contains_place_fragment(cell)))
}

/// 출발/도착 stated in a banner row above the header at the same column.
pub fn banner_qualifier(grid: &TimetableGrid, header_row: usize, col: usize) -> Option<&str> {
    (header_row.saturating_sub(BANNER_LOOKBACK)..header_row)
        .rev()
        .map(|r| grid.cell(r, col))
        .find(|text| text.contains(DEPART_WORD) != text.contains(ARRIVE_WORD))
}

pub fn classify_columns(grid: &TimetableGrid, header_row: usize, rules: &[ColumnRule]) -> ColumnMap {
    let mut map = ColumnMap::default();
    let Some(header) = grid.rows.get(header_row) else {
        return map;
    };
    for (index, text) in header.iter().enumerate() {
        let cell = HeaderCell::new(text, banner_qualifier(grid, header_row, index));
        match rules.iter().find_map(|rule| rule.apply(&cell)) {
            Some(role) => map.assign(index, role),
            None => debug!(index, header = %text, "header cell left unclassified"),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stops::{ASAN_CAMPUS, CHEONAN_ASAN_STATION};

    fn grid(rows: &[&[&str]]) -> TimetableGrid {
        TimetableGrid::new(
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
            [""],
        )
    }

    #[test]
    fn each_rule_fires_on_its_own_shape() {
        let dep = HeaderCell::new("아산캠퍼스 출발", None);
        let arr = HeaderCell::new("천안아산역 도착", None);
        let via = HeaderCell::new("배방역", None);
        let bare = HeaderCell::new("도착시간", None);
        assert_eq!(
            ColumnRule::Departure.apply(&dep),
            Some(ColumnRole::Departure(ASAN_CAMPUS.into()))
        );
        assert_eq!(ColumnRule::Arrival.apply(&dep), None);
        assert_eq!(
            ColumnRule::Arrival.apply(&arr),
            Some(ColumnRole::Arrival(CHEONAN_ASAN_STATION.into()))
        );
        assert_eq!(
            ColumnRule::Intermediate.apply(&via),
            Some(ColumnRole::Intermediate("배방역".into()))
        );
        assert_eq!(ColumnRule::BareArrival.apply(&bare), Some(ColumnRole::BareArrival));
        assert_eq!(ColumnRule::Order.apply(&HeaderCell::new("No", None)), Some(ColumnRole::Order));
    }

    #[test]
    fn cells_with_both_qualifiers_follow_rule_order() {
        let cell = HeaderCell::new("천안역 도착/출발", None);
        let as_departure = DEFAULT_RULE_ORDER.iter().find_map(|r| r.apply(&cell));
        assert_eq!(as_departure, Some(ColumnRole::Departure("천안역".into())));

        let arrival_first = [ColumnRule::ThroughAsArrival, ColumnRule::ThroughAsDeparture];
        let as_arrival = arrival_first.iter().find_map(|r| r.apply(&cell));
        assert_eq!(as_arrival, Some(ColumnRole::Arrival("천안역".into())));
    }

    #[test]
    fn banner_row_supplies_missing_qualifiers() {
        let g = grid(&[
            &["", "출발", "도착"],
            &["순번", "아산캠퍼스", "천안아산역"],
            &["1", "08:00", "08:20"],
        ]);
        let header = locate_header_row(&g, 2).unwrap();
        assert_eq!(header, 1);
        let map = classify_columns(&g, header, DEFAULT_RULE_ORDER);
        assert_eq!(map.order, Some(0));
        assert_eq!(
            map.departure,
            vec![StopColumn { stop: ASAN_CAMPUS.into(), index: 1 }]
        );
        assert_eq!(
            map.arrival,
            vec![StopColumn { stop: CHEONAN_ASAN_STATION.into(), index: 2 }]
        );
    }

    #[test]
    fn banner_lookback_is_bounded() {
        let mut rows: Vec<&[&str]> = vec![&["출발"]];
        rows.extend(std::iter::repeat(&[""][..]).take(BANNER_LOOKBACK));
        rows.push(&["아산캠퍼스"]);
        let g = grid(&rows);
        let header = rows.len() - 1;
        assert_eq!(banner_qualifier(&g, header, 0), None);
        let map = classify_columns(&g, header, DEFAULT_RULE_ORDER);
        assert_eq!(map.intermediate.len(), 1);
    }

    #[test]
    fn arrival_lookup_prefers_columns_right_of_departure() {
        let mut map = ColumnMap::default();
        map.assign(1, ColumnRole::Arrival(ASAN_CAMPUS.into()));
        map.assign(5, ColumnRole::Arrival(ASAN_CAMPUS.into()));
        assert_eq!(map.arrival_named(ASAN_CAMPUS, 3).map(|c| c.index), Some(5));
        assert_eq!(map.arrival_named(ASAN_CAMPUS, 6).map(|c| c.index), Some(1));
    }

    #[test]
    fn sequence_cells_mark_data_rows() {
        assert!(is_sequence_cell("12"));
        assert!(is_sequence_cell("3회"));
        assert!(!is_sequence_cell("08:00"));
        assert!(!is_sequence_cell("순번"));
    }
}
