use crate::catalog::ArchivePeriod;
use crate::engine::Engine;
use crate::error::Result;
use crate::models::{Gap, MergeStats, TimeWindow};
use crate::pipeline::ArchiveCache;
use log::{error, info};
use serde::Serialize;

/// What to backfill
#[derive(Debug, Clone)]
pub enum BackfillTarget {
    Range(TimeWindow),
    Gaps(Vec<Gap>),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    pub series: String,
    pub chunks: usize,
    pub chunks_done: usize,
    pub records: usize,
    pub absent_archives: usize,
    pub merge: MergeStats,
    /// Set when a chunk failed and the run stopped early
    pub error: Option<String>,
}

/// Drives the regular ingestion path over historical windows, one archive period at a time
pub struct BackfillOrchestrator<'a> {
    engine: &'a Engine,
}

impl<'a> BackfillOrchestrator<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Pieces of every target window, oldest first.
    ///
    /// Cuts fall where the archive holding the data changes: monthly MMSDM files before the
    /// archive cutoff, the series' archive period up to the current feed, then whole days.
    /// Derived series are cut by day.
    pub fn plan(&self, series: &str, target: &BackfillTarget) -> Result<Vec<TimeWindow>> {
        let spec = self.engine.catalog().get(series)?;
        let mut windows: Vec<TimeWindow> = match target {
            BackfillTarget::Range(window) => vec![*window],
            BackfillTarget::Gaps(gaps) => gaps
                .iter()
                .map(|g| TimeWindow::new(g.start, g.end + spec.cadence.duration()))
                .collect(),
        };
        windows.sort_by_key(|w| w.start);

        let (archive_cutoff, current_cutoff) = self.engine.locator().boundaries(self.engine.config().market_now());
        let mut chunks = Vec::new();
        for window in windows.into_iter().filter(|w| !w.is_empty()) {
            let mut start = window.start;
            while start < window.end {
                let boundary = match spec.primary() {
                    Some(_) if start < archive_cutoff => ArchivePeriod::Month.next_start(start).min(archive_cutoff),
                    Some(source) if start < current_cutoff => {
                        source.archive_period.next_start(start).min(current_cutoff)
                    }
                    _ => ArchivePeriod::Day.next_start(start),
                };
                let end = boundary.min(window.end);
                chunks.push(TimeWindow::new(start, end));
                start = end;
            }
        }
        Ok(chunks)
    }

    /// Run sequentially; stops at the first failing chunk and reports progress so far.
    ///
    /// Primary series go through the same fetch and merge path as live polling.
    /// Derived series are re-derived from their source for each chunk.
    pub async fn run(
        &self,
        series: &str,
        target: BackfillTarget,
        mut on_chunk: impl FnMut(usize, usize),
    ) -> Result<BackfillReport> {
        let spec = self.engine.catalog().get(series)?;
        let chunks = self.plan(series, &target)?;
        let cache = ArchiveCache::new();
        let mut report = BackfillReport {
            series: series.to_string(),
            chunks: chunks.len(),
            ..BackfillReport::default()
        };
        info!("🔄 {}: backfilling {} chunk(s)", series, chunks.len());

        for (i, chunk) in chunks.iter().enumerate() {
            let outcome = if spec.is_primary() {
                self.engine.ingest_window_cached(series, *chunk, &cache).await.map(|r| {
                    report.records += r.records;
                    report.absent_archives += r.absent;
                    r.merge
                })
            } else {
                self.engine.derive_window(series, *chunk)
            };

            match outcome {
                Ok(stats) => {
                    report.merge.absorb(stats);
                    report.chunks_done += 1;
                }
                Err(e) => {
                    error!("❌ {}: backfill stopped at {}: {}", series, chunk, e);
                    report.error = Some(e.to_string());
                    break;
                }
            }
            on_chunk(i + 1, chunks.len());
        }

        if spec.is_primary() && report.chunks_done > 0 {
            self.rederive_dependents(series, &chunks[..report.chunks_done]);
        }

        info!(
            "✅ {}: backfill {}/{} chunks, +{} added, {} superseded",
            series, report.chunks_done, report.chunks, report.merge.added, report.merge.superseded
        );
        Ok(report)
    }

    /// Derived series follow their source over the backfilled span
    fn rederive_dependents(&self, series: &str, done: &[TimeWindow]) {
        let (Some(first), Some(last)) = (done.first(), done.last()) else {
            return;
        };
        let span = TimeWindow::new(first.start, last.end);
        for dependent in self.engine.catalog().dependents_of(series) {
            match self.engine.derive_window(dependent.name, span) {
                Ok(stats) => info!(
                    "♻️  {}: re-derived {} (+{} added, {} superseded)",
                    dependent.name, span, stats.added, stats.superseded
                ),
                Err(e) => error!("❌ {}: re-derive failed: {}", dependent.name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::Config;
    use crate::error::IngestError;
    use crate::fetcher::ArchiveSource;
    use crate::models::ArchiveDescriptor;
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct NothingPublished;

    #[async_trait]
    impl ArchiveSource for NothingPublished {
        async fn fetch(&self, descriptor: &ArchiveDescriptor) -> Result<Vec<u8>> {
            Err(IngestError::NotPublished { url: descriptor.url() })
        }
    }

    fn engine(dir: &TempDir) -> Engine {
        let config = Config::default().with_storage_root(dir.path());
        Engine::with_source(config, Catalog::nem(), Arc::new(NothingPublished)).unwrap()
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn test_plan_follows_daily_archives() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let orchestrator = BackfillOrchestrator::new(&engine);
        let day = (engine.config().market_now() - Duration::days(10))
            .date()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let at = |d: i64, h: i64| day + Duration::days(d) + Duration::hours(h);

        let chunks = orchestrator
            .plan("prices5", &BackfillTarget::Range(TimeWindow::new(at(0, 18), at(2, 6))))
            .unwrap();
        assert_eq!(
            chunks,
            vec![
                TimeWindow::new(at(0, 18), at(1, 0)),
                TimeWindow::new(at(1, 0), at(2, 0)),
                TimeWindow::new(at(2, 0), at(2, 6)),
            ]
        );

        let gaps = vec![Gap {
            series: "prices5".into(),
            start: at(5, 10),
            end: at(5, 10) + Duration::minutes(10),
            missing_intervals: 3,
        }];
        let chunks = orchestrator.plan("prices5", &BackfillTarget::Gaps(gaps)).unwrap();
        assert_eq!(
            chunks,
            vec![TimeWindow::new(at(5, 10), at(5, 10) + Duration::minutes(15))]
        );
    }

    #[test]
    fn test_plan_follows_monthly_archives() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let orchestrator = BackfillOrchestrator::new(&engine);

        let range = TimeWindow::new(ymd(2023, 1, 20), ymd(2023, 3, 3));
        let chunks = orchestrator.plan("scada5", &BackfillTarget::Range(range)).unwrap();
        assert_eq!(
            chunks,
            vec![
                TimeWindow::new(ymd(2023, 1, 20), ymd(2023, 2, 1)),
                TimeWindow::new(ymd(2023, 2, 1), ymd(2023, 3, 1)),
                TimeWindow::new(ymd(2023, 3, 1), ymd(2023, 3, 3)),
            ]
        );

        // derived series have no archives and go by day
        let chunks = orchestrator.plan("scada30", &BackfillTarget::Range(range)).unwrap();
        assert_eq!(chunks.len(), 42);
        assert!(matches!(
            orchestrator.plan("nope", &BackfillTarget::Range(range)),
            Err(IngestError::UnknownSeries(_))
        ));
    }
}
