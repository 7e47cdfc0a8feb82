//! Via-stop passage time estimation.
//!
//! Duration hints such as `5분~20분 소요예상` chain along the route: the
//! window of each via-stop is the previous via-stop's window shifted by the
//! hint (`start + N`, `end + M`), starting from the departure time. Without a
//! hint the via-stop is placed around the midpoint of the trip.

use std::sync::LazyLock;

use regex::Regex;
use shuttle_core::{ClockTime, ViaStop, ViaTime};
use tracing::debug;

static DURATION_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,3})\s*분?\s*[~～\-]\s*(\d{1,3})\s*분").expect("static regex")
});

static DURATION_SINGLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})\s*분").expect("static regex"));

/// Trips longer than this are not plausible for a shuttle leg; offsets past it
/// are read as "before departure" when the arrival is unknown.
const MAX_TRIP_MINUTES: u16 = 6 * 60;

/// `(N, M)` minutes from a hint, `N <= M`. A single `N분` yields `(N, N)`.
pub fn parse_duration_hint(text: &str) -> Option<(u16, u16)> {
    if let Some(caps) = DURATION_RANGE.captures(text) {
        let lo: u16 = caps.get(1)?.as_str().parse().ok()?;
        let hi: u16 = caps.get(2)?.as_str().parse().ok()?;
        return Some((lo.min(hi), lo.max(hi)));
    }
    let caps = DURATION_SINGLE.captures(text)?;
    let n: u16 = caps.get(1)?.as_str().parse().ok()?;
    Some((n, n))
}

fn span(lo: ClockTime, hi: ClockTime) -> ViaTime {
    if lo == hi {
        ViaTime::At(lo)
    } else {
        ViaTime::Window(lo, hi)
    }
}

/// Midpoint of the trip with a ±10% window (at least one minute), clipped to
/// `[departure, arrival]`.
pub fn proportional_window(departure: ClockTime, arrival: ClockTime) -> Option<ViaTime> {
    let total = departure.minutes_until(arrival);
    if total == 0 {
        return None;
    }
    let half = ((f64::from(total) * 0.1).round() as u16).max(1);
    let mid = total / 2;
    let lo = mid.saturating_sub(half);
    let hi = (mid + half).min(total);
    Some(span(
        departure.add_minutes(i64::from(lo)),
        departure.add_minutes(i64::from(hi)),
    ))
}

/// Walks the via-stops of one trip in travel order.
#[derive(Debug, Clone)]
pub struct ViaChain {
    departure: Option<ClockTime>,
    arrival: Option<ClockTime>,
    cursor: Option<(ClockTime, ClockTime)>,
}

impl ViaChain {
    pub fn new(departure: Option<ClockTime>, arrival: Option<ClockTime>) -> Self {
        Self {
            departure,
            arrival,
            cursor: departure.map(|t| (t, t)),
        }
    }

    /// A via-stop whose time was printed in its own column.
    pub fn exact(&mut self, time: ClockTime) -> ViaTime {
        self.cursor = Some((time, time));
        ViaTime::At(time)
    }

    pub fn estimate(&mut self, hint: Option<&str>) -> Option<ViaTime> {
        let resolved = match hint.and_then(parse_duration_hint) {
            Some((n, m)) => self.cursor.map(|(lo, hi)| {
                span(lo.add_minutes(i64::from(n)), hi.add_minutes(i64::from(m)))
            }),
            None => match (self.departure, self.arrival) {
                (Some(dep), Some(arr)) => proportional_window(dep, arr),
                _ => None,
            },
        };
        if let Some(time) = resolved {
            if let (Some(lo), Some(hi)) = (time.start(), time.end()) {
                self.cursor = Some((lo, hi));
            }
        }
        resolved
    }
}

/// One-shot estimate: duration hint anchored at `anchor`, or the proportional
/// window between `anchor` and `next_anchor`.
pub fn estimate_via_time(
    hint: Option<&str>,
    anchor: Option<ClockTime>,
    next_anchor: Option<ClockTime>,
) -> Option<ViaTime> {
    ViaChain::new(anchor, next_anchor).estimate(hint)
}

/// Keep via-stops whose start times are non-decreasing from `departure` and
/// inside the trip. A window running past a known arrival is clipped to it;
/// a via-stop starting past it is dropped. Untimed via-stops always stay.
pub fn retain_travel_order(
    vias: Vec<ViaStop>,
    departure: ClockTime,
    arrival: Option<ClockTime>,
) -> Vec<ViaStop> {
    let limit = arrival
        .map(|a| departure.minutes_until(a))
        .unwrap_or(MAX_TRIP_MINUTES);
    let mut last = 0u16;
    let mut kept = Vec::with_capacity(vias.len());
    for mut via in vias {
        let (Some(start), Some(end)) = (
            via.time.and_then(ViaTime::start),
            via.time.and_then(ViaTime::end),
        ) else {
            kept.push(via);
            continue;
        };
        let start_offset = departure.minutes_until(start);
        if start_offset < last || start_offset > limit {
            debug!(stop = %via.name, time = ?via.time, "via-stop out of travel order, dropped");
            continue;
        }
        if let Some(arrival) = arrival {
            if departure.minutes_until(end) > limit {
                via.time = Some(span(start, arrival));
            }
        }
        last = start_offset;
        kept.push(via);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use shuttle_core::ViaSource;

    fn hm(h: u32, m: u32) -> ClockTime {
        ClockTime::from_hm(h, m).unwrap()
    }

    fn via(name: &str, time: Option<ViaTime>) -> ViaStop {
        ViaStop {
            name: name.into(),
            time,
            source: ViaSource::Column,
        }
    }

    #[test]
    fn hint_formats() {
        assert_eq!(parse_duration_hint("5분~20분 소요예상"), Some((5, 20)));
        assert_eq!(parse_duration_hint("5~20분"), Some((5, 20)));
        assert_eq!(parse_duration_hint("약 10분"), Some((10, 10)));
        assert_eq!(parse_duration_hint("수시운행"), None);
    }

    #[test]
    fn hint_window_chains_from_previous_window() {
        let mut chain = ViaChain::new(Some(hm(8, 0)), None);
        let first = chain.estimate(Some("5분~20분 소요예상"));
        assert_eq!(first.map(|t| t.to_string()).as_deref(), Some("08:05~08:20"));
        let second = chain.estimate(Some("5분~20분 소요예상"));
        assert_eq!(second.map(|t| t.to_string()).as_deref(), Some("08:10~08:40"));
    }

    #[test]
    fn one_shot_estimate_matches_chain_start() {
        assert_eq!(
            estimate_via_time(Some("5분~20분 소요예상"), Some(hm(8, 0)), None),
            Some(ViaTime::Window(hm(8, 5), hm(8, 20)))
        );
    }

    #[test]
    fn exact_column_time_re_anchors_the_chain() {
        let mut chain = ViaChain::new(Some(hm(8, 0)), None);
        chain.exact(hm(8, 30));
        assert_eq!(
            chain.estimate(Some("10분")),
            Some(ViaTime::At(hm(8, 40)))
        );
    }

    #[test]
    fn hint_wraps_past_midnight() {
        assert_eq!(
            estimate_via_time(Some("5~20분"), Some(hm(23, 50)), None),
            Some(ViaTime::Window(hm(23, 55), hm(0, 10)))
        );
    }

    #[test]
    fn proportional_fallback_centres_on_midpoint() {
        assert_eq!(
            estimate_via_time(None, Some(hm(8, 0)), Some(hm(8, 40))),
            Some(ViaTime::Window(hm(8, 16), hm(8, 24)))
        );
        // Short trips still get a one-minute window.
        assert_eq!(
            estimate_via_time(None, Some(hm(8, 0)), Some(hm(8, 4))),
            Some(ViaTime::Window(hm(8, 1), hm(8, 3)))
        );
    }

    #[test]
    fn no_anchor_means_no_guess() {
        assert_eq!(estimate_via_time(Some("5~20분"), None, None), None);
        assert_eq!(estimate_via_time(None, Some(hm(8, 0)), None), None);
    }

    #[test]
    fn out_of_order_vias_are_dropped_and_untimed_kept() {
        let vias = vec![
            via("배방역", Some(ViaTime::At(hm(8, 10)))),
            via("용암마을", Some(ViaTime::At(hm(8, 5)))),
            via("두정역", None),
            via("천안역", Some(ViaTime::Window(hm(8, 20), hm(8, 50)))),
            via("천안터미널", Some(ViaTime::At(hm(9, 10)))),
        ];
        let kept = retain_travel_order(vias, hm(8, 0), Some(hm(8, 40)));
        let names = kept.iter().map(|v| v.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["배방역", "두정역", "천안역"]);
        assert_eq!(kept[2].time, Some(ViaTime::Window(hm(8, 20), hm(8, 40))));
    }
}
