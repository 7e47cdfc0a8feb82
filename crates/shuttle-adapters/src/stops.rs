//! Stop-name vocabulary.
//!
//! Raw spellings are matched with all whitespace removed, so `아산 캠퍼스` and
//! `아산캠퍼스` hit the same alias. Departure-side and arrival-side tables are
//! kept apart: a stop can be a mid-route via on one side and be folded into a
//! fixed terminal name when it is the final arrival.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopRole {
    Departure,
    Arrival,
}

pub const ASAN_CAMPUS: &str = "아산캠퍼스";
pub const CHEONAN_CAMPUS: &str = "천안캠퍼스";
pub const CHEONAN_ASAN_STATION: &str = "천안아산역";
pub const CHEONAN_STATION: &str = "천안역";
pub const CHEONAN_TERMINAL: &str = "천안터미널";
pub const ONYANG_STATION: &str = "온양온천역";

const DEPARTURE_ALIASES: &[(&str, &str)] = &[
    ("아산캠", ASAN_CAMPUS),
    ("아산캠퍼스", ASAN_CAMPUS),
    ("본교", ASAN_CAMPUS),
    ("아산캠퍼스(본교)", ASAN_CAMPUS),
    ("천안캠", CHEONAN_CAMPUS),
    ("천안캠퍼스", CHEONAN_CAMPUS),
    ("천안아산역", CHEONAN_ASAN_STATION),
    ("천안아산역(KTX)", CHEONAN_ASAN_STATION),
    ("KTX천안아산역", CHEONAN_ASAN_STATION),
    ("KTX역", CHEONAN_ASAN_STATION),
    ("천안역", CHEONAN_STATION),
    ("천안역(동부광장)", CHEONAN_STATION),
    ("천안터미널", CHEONAN_TERMINAL),
    ("천안종합터미널", CHEONAN_TERMINAL),
    ("천안버스터미널", CHEONAN_TERMINAL),
    ("온양온천역", ONYANG_STATION),
    ("온양역", ONYANG_STATION),
    ("두정역", "두정역"),
    ("쌍용동", "쌍용동"),
    ("쌍용동(이마트앞)", "쌍용동"),
];

const ARRIVAL_ALIASES: &[(&str, &str)] = &[
    ("아산캠", ASAN_CAMPUS),
    ("아산캠퍼스", ASAN_CAMPUS),
    ("본교", ASAN_CAMPUS),
    ("아산캠퍼스(본교)", ASAN_CAMPUS),
    ("천안캠", CHEONAN_CAMPUS),
    ("천안캠퍼스", CHEONAN_CAMPUS),
    ("천안아산역", CHEONAN_ASAN_STATION),
    ("천안아산역(KTX)", CHEONAN_ASAN_STATION),
    ("KTX천안아산역", CHEONAN_ASAN_STATION),
    ("KTX역", CHEONAN_ASAN_STATION),
    // As a final arrival the shuttle always terminates at the KTX side.
    ("아산역", CHEONAN_ASAN_STATION),
    ("배방역", CHEONAN_ASAN_STATION),
    ("천안역", CHEONAN_STATION),
    ("천안역(동부광장)", CHEONAN_STATION),
    ("천안터미널", CHEONAN_TERMINAL),
    ("천안종합터미널", CHEONAN_TERMINAL),
    ("천안버스터미널", CHEONAN_TERMINAL),
    ("온양온천역", ONYANG_STATION),
    ("온양역", ONYANG_STATION),
];

/// Way-points that are never a trip's final destination. A candidate ending at
/// one of these comes from a known header misclassification.
pub const NON_TERMINAL_STOPS: &[&str] = &["용암마을", "권곡초등학교", "탕정삼성트라팰리스"];

/// Suffixes/fragments that mark a header cell as naming a physical place.
pub const PLACE_FRAGMENTS: &[&str] = &[
    "역",
    "터미널",
    "캠퍼스",
    "캠",
    "아파트",
    "초등학교",
    "초교",
    "정류장",
    "정류소",
    "마을",
    "쌍용동",
    "본교",
];

fn squash(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Map a raw stop spelling to its canonical name; unknown names come back
/// unchanged.
pub fn normalize_stop(raw: &str, role: StopRole) -> String {
    let table = match role {
        StopRole::Departure => DEPARTURE_ALIASES,
        StopRole::Arrival => ARRIVAL_ALIASES,
    };
    let key = squash(raw);
    table
        .iter()
        .find(|(alias, _)| squash(alias).eq_ignore_ascii_case(&key))
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or_else(|| raw.to_string())
}

pub fn contains_place_fragment(text: &str) -> bool {
    PLACE_FRAGMENTS.iter().any(|frag| text.contains(frag))
}

pub fn is_non_terminal(stop: &str) -> bool {
    NON_TERMINAL_STOPS.contains(&stop)
}
