use chrono::{Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage name of the timestamp column, shared by every series
pub const TIMESTAMP_COLUMN: &str = "settlementdate";

/// Nominal sampling interval of a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cadence {
    FiveMinute,
    ThirtyMinute,
}

impl Cadence {
    pub fn minutes(&self) -> i64 {
        match self {
            Cadence::FiveMinute => 5,
            Cadence::ThirtyMinute => 30,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }

    /// Round down to the most recent interval mark
    pub fn floor(&self, ts: NaiveDateTime) -> NaiveDateTime {
        let minute_of_day = ts.hour() as i64 * 60 + ts.minute() as i64;
        let aligned = minute_of_day - minute_of_day % self.minutes();
        ts.date().and_hms_opt(0, 0, 0).unwrap_or(ts) + Duration::minutes(aligned)
    }

    /// Round up to the next interval mark (identity on aligned timestamps)
    pub fn ceil(&self, ts: NaiveDateTime) -> NaiveDateTime {
        let floor = self.floor(ts);
        if floor == ts {
            ts
        } else {
            floor + self.duration()
        }
    }

    pub fn is_aligned(&self, ts: NaiveDateTime) -> bool {
        ts.second() == 0 && ts.nanosecond() == 0 && self.floor(ts) == ts
    }

    /// How many of `self` fit in one `coarser` interval
    pub fn per(&self, coarser: Cadence) -> i64 {
        coarser.minutes() / self.minutes()
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}min", self.minutes())
    }
}

/// Half-open `[start, end)` interval of market time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeWindow {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn intersect(&self, other: &TimeWindow) -> Option<TimeWindow> {
        let w = TimeWindow::new(self.start.max(other.start), self.end.min(other.end));
        if w.is_empty() {
            None
        } else {
            Some(w)
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// One measurement for one entity at one interval.
///
/// `values` is positional against the owning series' value columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: NaiveDateTime,
    pub key: String,
    pub values: Vec<Option<f64>>,
}

impl Record {
    pub fn new(timestamp: NaiveDateTime, key: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Self {
            timestamp,
            key: key.into(),
            values,
        }
    }

    pub fn identity(&self) -> (NaiveDateTime, &str) {
        (self.timestamp, self.key.as_str())
    }
}

/// Category + table pair carried in column 2 and 3 of every MMS row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableTag {
    pub category: String,
    pub table: String,
}

impl TableTag {
    pub fn new(category: &str, table: &str) -> Self {
        Self {
            category: category.to_string(),
            table: table.to_string(),
        }
    }

    pub fn matches(&self, category: &str, table: &str) -> bool {
        self.category.eq_ignore_ascii_case(category.trim())
            && self.table.eq_ignore_ascii_case(table.trim())
    }
}

impl fmt::Display for TableTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.category, self.table)
    }
}

/// Historical monthly archive layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonthlyVintage {
    /// `PUBLIC_DVD_<TABLE>_<YYYYMM>010000.zip`, CSV at the top level
    Dvd,
    /// `PUBLIC_ARCHIVE#<TABLE>#FILE01#<YYYYMM>010000.zip`, CSV one container down
    Archive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// Live feed, one small archive per interval (or per day for daily reports)
    Current,
    /// Consolidated archive of nested per-interval archives
    PeriodArchive,
    /// MMSDM historical monthly archive
    Monthly(MonthlyVintage),
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Current => write!(f, "current"),
            SourceKind::PeriodArchive => write!(f, "archive"),
            SourceKind::Monthly(MonthlyVintage::Dvd) => write!(f, "monthly-dvd"),
            SourceKind::Monthly(MonthlyVintage::Archive) => write!(f, "monthly-archive"),
        }
    }
}

/// Where the bytes live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveLocation {
    /// Fully known URL
    Direct(String),
    /// File name carries an opaque id suffix; resolve by prefix from the directory listing
    Listed { directory: String, prefix: String },
}

impl fmt::Display for ArchiveLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveLocation::Direct(url) => write!(f, "{}", url),
            ArchiveLocation::Listed { directory, prefix } => write!(f, "{}{}*", directory, prefix),
        }
    }
}

/// A resolved fetch target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    pub series: String,
    pub source: SourceKind,
    pub location: ArchiveLocation,
    /// Container levels below the fetched archive before text payloads appear (0..=2)
    pub depth: u8,
    pub table: TableTag,
    /// Only records inside this window are taken from this archive
    pub window: TimeWindow,
}

impl ArchiveDescriptor {
    pub fn url(&self) -> String {
        self.location.to_string()
    }
}

/// A contiguous run of expected-but-absent timestamps, inclusive on both ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub series: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub missing_intervals: usize,
}

impl Gap {
    /// Half-open window covering the gap at the given cadence
    pub fn window(&self, cadence: Cadence) -> TimeWindow {
        TimeWindow::new(self.start, self.end + cadence.duration())
    }
}

/// Outcome counts of one merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub added: usize,
    pub superseded: usize,
    pub unchanged: usize,
    /// Duplicate identities already present in the stored table, folded into one row
    #[serde(default)]
    pub collapsed: usize,
    pub total: usize,
}

impl MergeStats {
    pub fn absorb(&mut self, other: MergeStats) {
        self.added += other.added;
        self.superseded += other.superseded;
        self.unchanged += other.unchanged;
        self.collapsed += other.collapsed;
        self.total = other.total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 10, 9).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_cadence_alignment() {
        assert_eq!(Cadence::FiveMinute.floor(ts(10, 7)), ts(10, 5));
        assert_eq!(Cadence::ThirtyMinute.floor(ts(10, 59)), ts(10, 30));
        assert_eq!(Cadence::ThirtyMinute.ceil(ts(10, 1)), ts(10, 30));
        assert_eq!(Cadence::ThirtyMinute.ceil(ts(10, 30)), ts(10, 30));
        assert!(Cadence::FiveMinute.is_aligned(ts(23, 55)));
        assert!(!Cadence::ThirtyMinute.is_aligned(ts(23, 55)));
        assert_eq!(Cadence::FiveMinute.per(Cadence::ThirtyMinute), 6);
    }

    #[test]
    fn test_window_intersection() {
        let a = TimeWindow::new(ts(10, 0), ts(12, 0));
        let b = TimeWindow::new(ts(11, 0), ts(13, 0));
        assert_eq!(a.intersect(&b), Some(TimeWindow::new(ts(11, 0), ts(12, 0))));

        let c = TimeWindow::new(ts(12, 0), ts(13, 0));
        assert_eq!(a.intersect(&c), None);
        assert!(a.contains(ts(10, 0)));
        assert!(!a.contains(ts(12, 0)));
    }

    #[test]
    fn test_table_tag_matching() {
        let tag = TableTag::new("DISPATCH", "PRICE");
        assert!(tag.matches("dispatch", " PRICE"));
        assert!(!tag.matches("DISPATCH", "UNIT_SCADA"));
    }
}
