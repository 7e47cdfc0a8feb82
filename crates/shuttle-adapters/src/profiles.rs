//! Per-page decoding overrides.
//!
//! Every page goes through the same decoder; the handful of pages whose tables
//! carry more than a departure/arrival pair are described here as data: which
//! header rules apply in which order, where the arrival time is looked up, and
//! (for layouts the classifier cannot read) the column roles outright.

use crate::columns::{ColumnMap, ColumnRole, ColumnRule, DEFAULT_RULE_ORDER};
use crate::stops::{ASAN_CAMPUS, CHEONAN_CAMPUS, CHEONAN_STATION};

/// One step of a page's arrival-time lookup. Steps are tried in order and the
/// first one landing on an exact time wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalSource {
    /// Arrival column named after the trip's contextual arrival stop.
    NamedArrival,
    /// Unnamed `도착` column; the contextual stop is kept.
    BareArrival,
    /// First arrival column holding a time, whatever stop it names; the
    /// contextual stop is kept.
    AnyArrival,
    /// Last arrival column of the trip holding a time; its stop becomes the
    /// arrival.
    FinalPopulatedArrival,
    /// Intermediate column for the named stop; a time there means the trip
    /// forks off and ends at that stop.
    ForkTerminus(&'static str),
}

pub const DEFAULT_ARRIVAL_RESOLUTION: &[ArrivalSource] = &[
    ArrivalSource::NamedArrival,
    ArrivalSource::BareArrival,
    ArrivalSource::AnyArrival,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Order,
    Note,
    Departure,
    Arrival,
    BareArrival,
    Intermediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedColumn {
    pub index: usize,
    pub kind: ColumnKind,
    pub stop: &'static str,
}

impl FixedColumn {
    const fn new(index: usize, kind: ColumnKind, stop: &'static str) -> Self {
        Self { index, kind, stop }
    }

    fn role(&self) -> ColumnRole {
        match self.kind {
            ColumnKind::Order => ColumnRole::Order,
            ColumnKind::Note => ColumnRole::Note,
            ColumnKind::Departure => ColumnRole::Departure(self.stop.to_string()),
            ColumnKind::Arrival => ColumnRole::Arrival(self.stop.to_string()),
            ColumnKind::BareArrival => ColumnRole::BareArrival,
            ColumnKind::Intermediate => ColumnRole::Intermediate(self.stop.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageProfile {
    pub page_id: &'static str,
    pub rule_order: &'static [ColumnRule],
    pub arrival_resolution: &'static [ArrivalSource],
    /// Bypasses the header classifier entirely.
    pub fixed_columns: Option<&'static [FixedColumn]>,
    /// Arrival columns passed before the resolved arrival are recorded as
    /// via-stops with their printed times.
    pub arrivals_as_vias: bool,
}

impl PageProfile {
    pub fn fixed_column_map(&self) -> Option<ColumnMap> {
        let columns = self.fixed_columns?;
        let mut map = ColumnMap::default();
        for column in columns {
            map.assign(column.index, column.role());
        }
        Some(map)
    }

    pub fn fixed_order_column(&self) -> Option<usize> {
        self.fixed_columns?
            .iter()
            .find(|c| c.kind == ColumnKind::Order)
            .map(|c| c.index)
    }
}

pub const DEFAULT_PROFILE: PageProfile = PageProfile {
    page_id: "default",
    rule_order: DEFAULT_RULE_ORDER,
    arrival_resolution: DEFAULT_ARRIVAL_RESOLUTION,
    fixed_columns: None,
    arrivals_as_vias: false,
};

// Hub headers such as "천안역 도착/출발" name a stop the bus passes through;
// on this page they are read as arrivals so the trip can continue past them.
const HUB_RULE_ORDER: &[ColumnRule] = &[
    ColumnRule::Order,
    ColumnRule::Note,
    ColumnRule::Departure,
    ColumnRule::Arrival,
    ColumnRule::BareArrival,
    ColumnRule::Intermediate,
    ColumnRule::ThroughAsArrival,
    ColumnRule::ThroughAsDeparture,
];

const DUJEONG_COLUMNS: &[FixedColumn] = &[
    FixedColumn::new(0, ColumnKind::Order, ""),
    FixedColumn::new(1, ColumnKind::Departure, CHEONAN_CAMPUS),
    FixedColumn::new(2, ColumnKind::Intermediate, "두정역"),
    FixedColumn::new(3, ColumnKind::Intermediate, CHEONAN_STATION),
    FixedColumn::new(4, ColumnKind::Arrival, ASAN_CAMPUS),
    FixedColumn::new(5, ColumnKind::Note, ""),
];

pub const PAGE_PROFILES: &[PageProfile] = &[
    PageProfile {
        page_id: "station-hub",
        rule_order: HUB_RULE_ORDER,
        arrival_resolution: &[ArrivalSource::FinalPopulatedArrival],
        fixed_columns: None,
        arrivals_as_vias: true,
    },
    PageProfile {
        page_id: "spoke-dujeong",
        rule_order: DEFAULT_RULE_ORDER,
        arrival_resolution: &[
            ArrivalSource::NamedArrival,
            ArrivalSource::ForkTerminus(CHEONAN_STATION),
        ],
        fixed_columns: Some(DUJEONG_COLUMNS),
        arrivals_as_vias: false,
    },
    PageProfile {
        page_id: "spoke-ssangyong",
        rule_order: DEFAULT_RULE_ORDER,
        arrival_resolution: &[
            ArrivalSource::NamedArrival,
            ArrivalSource::ForkTerminus("쌍용동"),
            ArrivalSource::BareArrival,
        ],
        fixed_columns: None,
        arrivals_as_vias: false,
    },
];

pub fn profile_for(page_id: &str) -> &'static PageProfile {
    PAGE_PROFILES
        .iter()
        .find(|p| p.page_id == page_id)
        .unwrap_or(&DEFAULT_PROFILE)
}
