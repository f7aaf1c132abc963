use crate::catalog::{ArchivePeriod, CurrentPeriod, PrimarySource, SeriesSpec};
use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::models::{
    ArchiveDescriptor, ArchiveLocation, MonthlyVintage, SourceKind, TimeWindow,
};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use log::debug;

const MMSDM_ROOT: &str = "/Data_Archive/Wholesale_Electricity/MMSDM";

/// Earliest month published in the MMSDM DVD layout
const DVD_FIRST_MONTH: (i32, u32) = (2009, 7);
/// First month published in the `PUBLIC_ARCHIVE#` layout
const ARCHIVE_FIRST_MONTH: (i32, u32) = (2024, 8);

impl MonthlyVintage {
    /// Layout used by the monthly archive for `year`/`month`
    pub fn for_month(year: i32, month: u32) -> Result<Self> {
        let ym = (year, month);
        if ym >= ARCHIVE_FIRST_MONTH {
            Ok(MonthlyVintage::Archive)
        } else if ym >= DVD_FIRST_MONTH {
            Ok(MonthlyVintage::Dvd)
        } else {
            Err(IngestError::FormatUnrecognized {
                context: format!("MMSDM {}-{:02}", year, month),
                detail: "month predates every known monthly archive layout".to_string(),
            })
        }
    }

    pub fn depth(&self) -> u8 {
        match self {
            MonthlyVintage::Dvd => 0,
            MonthlyVintage::Archive => 1,
        }
    }
}

impl ArchivePeriod {
    /// Midnight starting the next archive period strictly after `ts`
    pub fn next_start(&self, ts: NaiveDateTime) -> NaiveDateTime {
        let day = ts.date();
        let next = match self {
            ArchivePeriod::Day => Some(day + Duration::days(1)),
            ArchivePeriod::Week(anchor) => {
                let ahead = (7 + anchor.num_days_from_monday() as i64
                    - day.weekday().num_days_from_monday() as i64)
                    % 7;
                Some(day + Duration::days(if ahead == 0 { 7 } else { ahead }))
            }
            ArchivePeriod::Month if day.month() == 12 => NaiveDate::from_ymd_opt(day.year() + 1, 1, 1),
            ArchivePeriod::Month => NaiveDate::from_ymd_opt(day.year(), day.month() + 1, 1),
        };
        next.and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or(ts + Duration::days(1))
    }
}

/// Decides which NEMWEB archives hold a series' records for a window
#[derive(Debug, Clone)]
pub struct SourceLocator {
    base_url: String,
    current_horizon: Duration,
    archive_retention: Duration,
}

impl SourceLocator {
    pub fn new(base_url: &str, current_horizon: Duration, archive_retention: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            current_horizon,
            archive_retention,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.base_url, config.current_horizon(), config.archive_retention())
    }

    /// Cut-over points relative to `as_of`: (monthly → period archive, period archive → current)
    pub fn boundaries(&self, as_of: NaiveDateTime) -> (NaiveDateTime, NaiveDateTime) {
        let current_cutoff = as_of - self.current_horizon;
        let archive_cutoff = (as_of - self.archive_retention)
            .date()
            .and_hms_opt(0, 0, 0)
            .unwrap_or(as_of - self.archive_retention);
        (archive_cutoff.min(current_cutoff), current_cutoff)
    }

    /// Ordered (oldest first) fetch targets for `window`.
    ///
    /// The window is split at the source boundaries; each descriptor's own window is the
    /// part of the request its source kind owns, so no timestamp is taken from two kinds.
    pub fn locate(
        &self,
        spec: &SeriesSpec,
        window: TimeWindow,
        as_of: NaiveDateTime,
    ) -> Result<Vec<ArchiveDescriptor>> {
        let source = spec.primary().ok_or_else(|| {
            IngestError::UnknownSeries(format!("{} is derived and has no archive source", spec.name))
        })?;
        if window.is_empty() {
            return Ok(Vec::new());
        }

        let (archive_cutoff, current_cutoff) = self.boundaries(as_of);
        let lookback = spec.cadence.duration();
        let mut descriptors = Vec::new();

        if let Some(seg) = window.intersect(&TimeWindow::new(NaiveDateTime::MIN, archive_cutoff)) {
            for (year, month) in month_span(seg.start - lookback, seg.end) {
                descriptors.push(self.monthly(spec, source, seg, year, month)?);
            }
        }

        if let Some(seg) = window.intersect(&TimeWindow::new(archive_cutoff, current_cutoff)) {
            for period_start in period_starts(source.archive_period, seg.start - lookback, seg.end) {
                let stamp = match source.archive_period {
                    ArchivePeriod::Month => format!("{}01", period_start.format("%Y%m")),
                    _ => period_start.format("%Y%m%d").to_string(),
                };
                descriptors.push(ArchiveDescriptor {
                    series: spec.name.to_string(),
                    source: SourceKind::PeriodArchive,
                    location: ArchiveLocation::Direct(format!(
                        "{}{}{}{}.zip",
                        self.base_url, source.archive_dir, source.archive_prefix, stamp
                    )),
                    depth: source.archive_depth,
                    table: source.tag(),
                    window: seg,
                });
            }
        }

        if let Some(seg) = window.intersect(&TimeWindow::new(current_cutoff, NaiveDateTime::MAX)) {
            let directory = format!("{}{}", self.base_url, source.current_dir);
            match source.current_period {
                CurrentPeriod::PerInterval { stamp_format } => {
                    let mut tick = spec.cadence.ceil(seg.start);
                    while tick < seg.end {
                        descriptors.push(self.current(
                            spec,
                            source,
                            &directory,
                            format!("{}{}", source.current_prefix, tick.format(stamp_format)),
                            seg,
                        ));
                        tick += spec.cadence.duration();
                    }
                }
                CurrentPeriod::Daily { name_offset_days } => {
                    for day in period_starts(ArchivePeriod::Day, seg.start - lookback, seg.end) {
                        let named = day + Duration::days(name_offset_days);
                        descriptors.push(self.current(
                            spec,
                            source,
                            &directory,
                            format!("{}{}", source.current_prefix, named.format("%Y%m%d")),
                            seg,
                        ));
                    }
                }
            }
        }

        debug!(
            "{}: {} descriptor(s) for {} as of {}",
            spec.name,
            descriptors.len(),
            window,
            as_of
        );
        Ok(descriptors)
    }

    fn current(
        &self,
        spec: &SeriesSpec,
        source: &PrimarySource,
        directory: &str,
        prefix: String,
        window: TimeWindow,
    ) -> ArchiveDescriptor {
        ArchiveDescriptor {
            series: spec.name.to_string(),
            source: SourceKind::Current,
            location: ArchiveLocation::Listed {
                directory: directory.to_string(),
                prefix,
            },
            depth: 0,
            table: source.tag(),
            window,
        }
    }

    fn monthly(
        &self,
        spec: &SeriesSpec,
        source: &PrimarySource,
        window: TimeWindow,
        year: i32,
        month: u32,
    ) -> Result<ArchiveDescriptor> {
        let vintage = MonthlyVintage::for_month(year, month)?;
        let data_dir = format!(
            "{}{}/{}/MMSDM_{}_{:02}/MMSDM_Historical_Data_SQLLoader/DATA/",
            self.base_url, MMSDM_ROOT, year, year, month
        );
        let file = match vintage {
            MonthlyVintage::Dvd => format!(
                "PUBLIC_DVD_{}_{}{:02}010000.zip",
                source.mmsdm_table, year, month
            ),
            MonthlyVintage::Archive => format!(
                "PUBLIC_ARCHIVE%23{}%23FILE01%23{}{:02}010000.zip",
                source.mmsdm_table, year, month
            ),
        };
        Ok(ArchiveDescriptor {
            series: spec.name.to_string(),
            source: SourceKind::Monthly(vintage),
            location: ArchiveLocation::Direct(format!("{}{}", data_dir, file)),
            depth: vintage.depth(),
            table: source.tag(),
            window,
        })
    }
}

/// (year, month) pairs touched by `[from, to)`
fn month_span(from: NaiveDateTime, to: NaiveDateTime) -> Vec<(i32, u32)> {
    let mut months = Vec::new();
    let last = last_instant_date(from, to);
    let (mut year, mut month) = (from.year(), from.month());
    while (year, month) <= (last.year(), last.month()) {
        months.push((year, month));
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    months
}

/// Period start dates covering `[from, to)`
fn period_starts(period: ArchivePeriod, from: NaiveDateTime, to: NaiveDateTime) -> Vec<NaiveDate> {
    let last = last_instant_date(from, to);
    let mut starts: Vec<NaiveDate> = Vec::new();
    let mut day = from.date();
    while day <= last {
        let start = match period {
            ArchivePeriod::Day => day,
            ArchivePeriod::Week(anchor) => {
                let back = (7 + day.weekday().num_days_from_monday() as i64
                    - anchor.num_days_from_monday() as i64)
                    % 7;
                day - Duration::days(back)
            }
            ArchivePeriod::Month => day.with_day(1).unwrap_or(day),
        };
        if starts.last() != Some(&start) {
            starts.push(start);
        }
        day += Duration::days(1);
    }
    starts
}

fn last_instant_date(from: NaiveDateTime, to: NaiveDateTime) -> NaiveDate {
    if to > from {
        (to - Duration::seconds(1)).date()
    } else {
        from.date()
    }
}
