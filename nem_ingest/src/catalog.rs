use crate::error::{IngestError, Result};
use crate::models::{Cadence, TableTag};
use chrono::Weekday;
use serde::Serialize;

/// Regions kept for price and rooftop series
pub const MAIN_REGIONS: [&str; 5] = ["NSW1", "QLD1", "SA1", "TAS1", "VIC1"];

/// How an unparsable or empty numeric field is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MissingPolicy {
    /// Store 0.0
    Zero,
    /// Store null
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SeriesKind {
    Price,
    UnitOutput,
    InterconnectorFlow,
    Curtailment,
    DistributedSolar,
}

impl SeriesKind {
    pub fn key_column(&self) -> &'static str {
        match self {
            SeriesKind::Price | SeriesKind::DistributedSolar => "regionid",
            SeriesKind::UnitOutput | SeriesKind::Curtailment => "duid",
            SeriesKind::InterconnectorFlow => "interconnectorid",
        }
    }

    pub fn value_columns(&self) -> &'static [&'static str] {
        match self {
            SeriesKind::Price => &["rrp"],
            SeriesKind::UnitOutput => &["scadavalue"],
            SeriesKind::InterconnectorFlow => {
                &["meteredmwflow", "mwflow", "exportlimit", "importlimit"]
            }
            SeriesKind::Curtailment => {
                &["availability", "totalcleared", "semidispatchcap", "curtailment"]
            }
            SeriesKind::DistributedSolar => &["power"],
        }
    }

    /// Coercion policy per canonical value column.
    ///
    /// Flow, limit and dispatch-target columns zero-fill; price and output stay null.
    pub fn missing_policy(&self, column: &str) -> MissingPolicy {
        match (self, column) {
            (SeriesKind::Price, _) => MissingPolicy::Missing,
            (SeriesKind::UnitOutput, _) => MissingPolicy::Missing,
            (SeriesKind::DistributedSolar, _) => MissingPolicy::Missing,
            (SeriesKind::InterconnectorFlow, _) => MissingPolicy::Zero,
            (SeriesKind::Curtailment, _) => MissingPolicy::Zero,
        }
    }

    /// Unit-output series track newly commissioned units
    pub fn has_entity_registry(&self) -> bool {
        matches!(self, SeriesKind::UnitOutput)
    }

    /// Restrict which entity keys are kept at all
    pub fn accepts_key(&self, key: &str) -> bool {
        match self {
            SeriesKind::Price | SeriesKind::DistributedSolar => MAIN_REGIONS.contains(&key),
            SeriesKind::Curtailment => is_wind_or_solar(key),
            _ => !key.is_empty(),
        }
    }
}

pub fn is_wind_or_solar(duid: &str) -> bool {
    let upper = duid.to_ascii_uppercase();
    ["WF", "SF", "SOLAR", "WIND", "PV"]
        .iter()
        .any(|marker| upper.contains(marker))
}

/// How the CURRENT directory publishes files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CurrentPeriod {
    /// One file per interval, named by the interval timestamp in `stamp_format`
    PerInterval { stamp_format: &'static str },
    /// One file per day, named by date `name_offset_days` after the data day
    Daily { name_offset_days: i64 },
}

/// Granularity of the ARCHIVE directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArchivePeriod {
    Day,
    /// Weekly bundles starting on the given weekday
    Week(Weekday),
    Month,
}

/// Where a primary series comes from on NEMWEB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrimarySource {
    pub category: &'static str,
    pub table: &'static str,
    pub current_dir: &'static str,
    pub current_prefix: &'static str,
    pub current_period: CurrentPeriod,
    pub archive_dir: &'static str,
    pub archive_prefix: &'static str,
    pub archive_period: ArchivePeriod,
    pub archive_depth: u8,
    /// Table name inside the MMSDM monthly archives
    pub mmsdm_table: &'static str,
}

impl PrimarySource {
    pub fn tag(&self) -> TableTag {
        TableTag::new(self.category, self.table)
    }
}

/// Window reduction used by the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Reduce {
    /// Sum of present values over present count
    Mean,
    /// Sum of present values over the nominal sub-interval count
    NominalMean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Derivation {
    Aggregate { source: &'static str, reduce: Reduce },
    Interpolate { source: &'static str },
}

impl Derivation {
    pub fn source(&self) -> &'static str {
        match self {
            Derivation::Aggregate { source, .. } | Derivation::Interpolate { source } => *source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SeriesOrigin {
    Primary(PrimarySource),
    Derived(Derivation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeriesSpec {
    pub name: &'static str,
    pub kind: SeriesKind,
    pub cadence: Cadence,
    pub origin: SeriesOrigin,
}

impl SeriesSpec {
    pub fn key_column(&self) -> &'static str {
        self.kind.key_column()
    }

    pub fn value_columns(&self) -> &'static [&'static str] {
        self.kind.value_columns()
    }

    pub fn primary(&self) -> Option<&PrimarySource> {
        match &self.origin {
            SeriesOrigin::Primary(source) => Some(source),
            SeriesOrigin::Derived(_) => None,
        }
    }

    pub fn derivation(&self) -> Option<&Derivation> {
        match &self.origin {
            SeriesOrigin::Derived(derivation) => Some(derivation),
            SeriesOrigin::Primary(_) => None,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.primary().is_some()
    }
}

const DISPATCH_IS_PRICE: PrimarySource = PrimarySource {
    category: "DISPATCH",
    table: "PRICE",
    current_dir: "/Reports/CURRENT/DispatchIS_Reports/",
    current_prefix: "PUBLIC_DISPATCHIS_",
    current_period: CurrentPeriod::PerInterval { stamp_format: "%Y%m%d%H%M" },
    archive_dir: "/Reports/ARCHIVE/DispatchIS_Reports/",
    archive_prefix: "PUBLIC_DISPATCHIS_",
    archive_period: ArchivePeriod::Day,
    archive_depth: 1,
    mmsdm_table: "DISPATCHPRICE",
};

const DISPATCH_SCADA: PrimarySource = PrimarySource {
    category: "DISPATCH",
    table: "UNIT_SCADA",
    current_dir: "/Reports/CURRENT/Dispatch_SCADA/",
    current_prefix: "PUBLIC_DISPATCHSCADA_",
    current_period: CurrentPeriod::PerInterval { stamp_format: "%Y%m%d%H%M" },
    archive_dir: "/Reports/ARCHIVE/Dispatch_SCADA/",
    archive_prefix: "PUBLIC_DISPATCHSCADA_",
    archive_period: ArchivePeriod::Day,
    archive_depth: 1,
    mmsdm_table: "DISPATCH_UNIT_SCADA",
};

const DISPATCH_IS_INTERCONNECTOR: PrimarySource = PrimarySource {
    category: "DISPATCH",
    table: "INTERCONNECTORRES",
    mmsdm_table: "DISPATCHINTERCONNECTORRES",
    ..DISPATCH_IS_PRICE
};

const NEXT_DAY_DISPATCH: PrimarySource = PrimarySource {
    category: "DISPATCH",
    table: "UNIT_SOLUTION",
    current_dir: "/Reports/Current/Next_Day_Dispatch/",
    current_prefix: "PUBLIC_NEXT_DAY_DISPATCH_",
    current_period: CurrentPeriod::Daily { name_offset_days: 1 },
    archive_dir: "/Reports/ARCHIVE/Next_Day_Dispatch/",
    archive_prefix: "PUBLIC_NEXT_DAY_DISPATCH_",
    archive_period: ArchivePeriod::Month,
    archive_depth: 1,
    mmsdm_table: "DISPATCHLOAD",
};

const ROOFTOP_ACTUAL: PrimarySource = PrimarySource {
    category: "ROOFTOP",
    table: "ACTUAL",
    current_dir: "/Reports/CURRENT/ROOFTOP_PV/ACTUAL/",
    current_prefix: "PUBLIC_ROOFTOP_PV_ACTUAL_MEASUREMENT_",
    current_period: CurrentPeriod::PerInterval { stamp_format: "%Y%m%d%H%M%S" },
    archive_dir: "/Reports/ARCHIVE/ROOFTOP_PV/ACTUAL/",
    archive_prefix: "PUBLIC_ROOFTOP_PV_ACTUAL_MEASUREMENT_",
    archive_period: ArchivePeriod::Week(Weekday::Thu),
    archive_depth: 1,
    mmsdm_table: "ROOFTOP_PV_ACTUAL",
};

/// The fixed set of series the engine maintains
#[derive(Debug, Clone)]
pub struct Catalog {
    series: Vec<SeriesSpec>,
}

impl Catalog {
    pub fn nem() -> Self {
        let series = vec![
            SeriesSpec {
                name: "prices5",
                kind: SeriesKind::Price,
                cadence: Cadence::FiveMinute,
                origin: SeriesOrigin::Primary(DISPATCH_IS_PRICE),
            },
            SeriesSpec {
                name: "scada5",
                kind: SeriesKind::UnitOutput,
                cadence: Cadence::FiveMinute,
                origin: SeriesOrigin::Primary(DISPATCH_SCADA),
            },
            SeriesSpec {
                name: "transmission5",
                kind: SeriesKind::InterconnectorFlow,
                cadence: Cadence::FiveMinute,
                origin: SeriesOrigin::Primary(DISPATCH_IS_INTERCONNECTOR),
            },
            SeriesSpec {
                name: "curtailment5",
                kind: SeriesKind::Curtailment,
                cadence: Cadence::FiveMinute,
                origin: SeriesOrigin::Primary(NEXT_DAY_DISPATCH),
            },
            SeriesSpec {
                name: "rooftop30",
                kind: SeriesKind::DistributedSolar,
                cadence: Cadence::ThirtyMinute,
                origin: SeriesOrigin::Primary(ROOFTOP_ACTUAL),
            },
            SeriesSpec {
                name: "prices30",
                kind: SeriesKind::Price,
                cadence: Cadence::ThirtyMinute,
                origin: SeriesOrigin::Derived(Derivation::Aggregate {
                    source: "prices5",
                    reduce: Reduce::Mean,
                }),
            },
            SeriesSpec {
                name: "scada30",
                kind: SeriesKind::UnitOutput,
                cadence: Cadence::ThirtyMinute,
                origin: SeriesOrigin::Derived(Derivation::Aggregate {
                    source: "scada5",
                    reduce: Reduce::NominalMean,
                }),
            },
            SeriesSpec {
                name: "transmission30",
                kind: SeriesKind::InterconnectorFlow,
                cadence: Cadence::ThirtyMinute,
                origin: SeriesOrigin::Derived(Derivation::Aggregate {
                    source: "transmission5",
                    reduce: Reduce::NominalMean,
                }),
            },
            SeriesSpec {
                name: "rooftop5",
                kind: SeriesKind::DistributedSolar,
                cadence: Cadence::FiveMinute,
                origin: SeriesOrigin::Derived(Derivation::Interpolate { source: "rooftop30" }),
            },
        ];
        Self { series }
    }

    pub fn from_specs(series: Vec<SeriesSpec>) -> Self {
        Self { series }
    }

    pub fn get(&self, name: &str) -> Result<&SeriesSpec> {
        self.series
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| IngestError::UnknownSeries(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.series.iter().map(|s| s.name).collect()
    }

    pub fn all(&self) -> &[SeriesSpec] {
        &self.series
    }

    pub fn primaries(&self) -> impl Iterator<Item = &SeriesSpec> {
        self.series.iter().filter(|s| s.is_primary())
    }

    pub fn derived(&self) -> impl Iterator<Item = &SeriesSpec> {
        self.series.iter().filter(|s| !s.is_primary())
    }

    /// Derived series fed by `source`
    pub fn dependents_of<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a SeriesSpec> + 'a {
        self.derived()
            .filter(move |s| s.derivation().map(|d| d.source()) == Some(source))
    }
}
