//! Authoritative per-series parquet tables and the merge that keeps them duplicate free.
//!
//! Merge rule: the newest batch wins for every `(settlementdate, key)` it re-reports;
//! existing rows the batch does not mention are never lost. Applying the same batch
//! twice leaves the file unchanged.

use crate::catalog::SeriesSpec;
use crate::error::{IngestError, Result};
use crate::models::{MergeStats, Record, TIMESTAMP_COLUMN};
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{error, info, warn};
use parking_lot::Mutex;
use polars::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// A lock file older than this is assumed abandoned by a crashed writer
pub const STALE_LOCK_AFTER: Duration = Duration::from_secs(30 * 60);

/// Keep the last occurrence of every identity, ordered by timestamp then key
fn dedup_keep_last(records: Vec<Record>) -> Vec<Record> {
    let mut records: Vec<Record> = records.into_iter().rev().collect();
    // stable: among equal identities the latest arrival now comes first
    records.sort_by(|a, b| a.identity().cmp(&b.identity()));
    records.dedup_by(|a, b| a.identity() == b.identity());
    records
}

/// Pure merge of `batch` into `existing`. Returns the new table and outcome counts.
pub fn reconcile(series: &str, existing: Vec<Record>, batch: Vec<Record>) -> Result<(Vec<Record>, MergeStats)> {
    let batch = dedup_keep_last(batch);
    let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
        let total = existing.len();
        return Ok((existing, MergeStats { total, ..MergeStats::default() }));
    };
    let (span_start, span_end) = (first.timestamp, last.timestamp);

    let incoming: HashMap<(NaiveDateTime, &str), &Record> =
        batch.iter().map(|r| (r.identity(), r)).collect();

    let mut stats = MergeStats::default();
    let mut matched: HashSet<(NaiveDateTime, &str)> = HashSet::with_capacity(batch.len());
    let mut kept = Vec::with_capacity(existing.len() + batch.len());
    for record in existing {
        let inside = record.timestamp >= span_start && record.timestamp <= span_end;
        let hit = if inside {
            incoming.get_key_value(&record.identity())
        } else {
            None
        };
        match hit {
            // a stored table written without deduplication can hold one identity twice
            Some((_, r)) if !matched.insert(r.identity()) => stats.collapsed += 1,
            Some((_, r)) if r.values == record.values => stats.unchanged += 1,
            Some(_) => stats.superseded += 1,
            None => kept.push(record),
        }
    }
    stats.added = batch.len() - matched.len();
    drop(matched);
    drop(incoming);

    kept.extend(batch);
    let before = kept.len();
    let merged = dedup_keep_last(kept);
    stats.collapsed += before - merged.len();
    if stats.collapsed > 0 {
        warn!("{}: folded {} duplicate stored row(s)", series, stats.collapsed);
    }

    if let Some(pair) = merged.windows(2).find(|w| w[0].identity() == w[1].identity()) {
        let e = IngestError::MergeConflict {
            series: series.to_string(),
            key: format!("{}|{}", pair[0].timestamp, pair[0].key),
        };
        error!("{}", e);
        return Err(e);
    }

    stats.total = merged.len();
    Ok((merged, stats))
}

/// Row count and time range of a persisted series
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub record_count: usize,
    pub first_timestamp: Option<NaiveDateTime>,
    pub latest_timestamp: Option<NaiveDateTime>,
    /// Distinct timestamps, ascending
    pub timestamps: Vec<NaiveDateTime>,
}

/// Integrity findings for one persisted series
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub series: String,
    pub record_count: usize,
    pub duplicate_keys: usize,
    pub out_of_order: usize,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.duplicate_keys == 0 && self.out_of_order == 0
    }
}

/// Exclusive marker file held for the read-merge-write of one series
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(root: &Path, series: &str) -> Result<Self> {
        let path = root.join(format!(".{}.lock", series));
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let age = std::fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|t| SystemTime::now().duration_since(t).ok());
                    match age {
                        Some(age) if age > STALE_LOCK_AFTER => {
                            warn!("removing stale lock {} ({}s old)", path.display(), age.as_secs());
                            let _ = std::fs::remove_file(&path);
                        }
                        _ => {
                            return Err(IngestError::storage(
                                &path,
                                "series is being written by another process",
                            ))
                        }
                    }
                }
                Err(e) => return Err(IngestError::io(&path, e)),
            }
        }
        Err(IngestError::storage(&path, "could not take the series lock"))
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("failed to release {}: {}", self.path.display(), e);
        }
    }
}

/// One parquet file per series under a storage root
pub struct ReconciliationStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ReconciliationStore {
    /// Open the storage root, creating it; fails if it cannot be written
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| IngestError::io(&root, e))?;
        tempfile::NamedTempFile::new_in(&root).map_err(|e| IngestError::io(&root, e))?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, series: &str) -> PathBuf {
        self.root.join(format!("{}.parquet", series))
    }

    pub fn exists(&self, series: &str) -> bool {
        self.path_for(series).exists()
    }

    /// Run `f` holding both the in-process and the cross-process lock for `series`
    fn with_lock<T>(&self, series: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let mutex = self
            .locks
            .lock()
            .entry(series.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = mutex.lock();
        let _file = LockFile::acquire(&self.root, series)?;
        f()
    }

    /// Whole series in memory; a missing file is an empty series
    pub fn load(&self, spec: &SeriesSpec) -> Result<Vec<Record>> {
        let path = self.path_for(spec.name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(|e| IngestError::io(&path, e))?;
        let df = ParquetReader::new(file)
            .finish()
            .map_err(|e| IngestError::storage(&path, e))?;
        frame_to_records(&df, spec).map_err(|e| IngestError::storage(&path, e))
    }

    /// Read-merge-write under the series lock
    pub fn merge(&self, spec: &SeriesSpec, batch: Vec<Record>) -> Result<MergeStats> {
        if batch.is_empty() {
            return Ok(MergeStats::default());
        }
        self.with_lock(spec.name, || {
            let existing = self.load(spec)?;
            let (merged, stats) = reconcile(spec.name, existing, batch)?;
            if stats.added + stats.superseded > 0 {
                self.write(spec, &merged)?;
            }
            info!(
                "✅ {}: +{} added, {} superseded, {} unchanged ({} total)",
                spec.name, stats.added, stats.superseded, stats.unchanged, stats.total
            );
            Ok(stats)
        })
    }

    /// Replace the whole series atomically; used by the derived recompute path
    pub fn replace(&self, spec: &SeriesSpec, records: Vec<Record>) -> Result<MergeStats> {
        self.with_lock(spec.name, || {
            let records = dedup_keep_last(records);
            self.write(spec, &records)?;
            info!("♻️  {}: replaced with {} records", spec.name, records.len());
            Ok(MergeStats {
                added: records.len(),
                total: records.len(),
                ..MergeStats::default()
            })
        })
    }

    /// Write via a temporary file in the same directory, then rename over the target
    fn write(&self, spec: &SeriesSpec, records: &[Record]) -> Result<()> {
        let path = self.path_for(spec.name);
        let mut df = records_to_frame(records, spec).map_err(|e| IngestError::storage(&path, e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root).map_err(|e| IngestError::io(&self.root, e))?;
        ParquetWriter::new(tmp.as_file_mut())
            .with_compression(ParquetCompression::Snappy)
            .finish(&mut df)
            .map_err(|e| IngestError::storage(&path, e))?;
        tmp.persist(&path).map_err(|e| IngestError::io(&path, e.error))?;
        Ok(())
    }

    /// Count and distinct timestamps, scanning only the timestamp column
    pub fn summary(&self, spec: &SeriesSpec) -> Result<StoreSummary> {
        let path = self.path_for(spec.name);
        if !path.exists() {
            return Ok(StoreSummary::default());
        }
        let df = LazyFrame::scan_parquet(&path, Default::default())
            .and_then(|lf| lf.select([col(TIMESTAMP_COLUMN)]).collect())
            .map_err(|e| IngestError::storage(&path, e))?;
        let stamps = timestamp_column(&df).map_err(|e| IngestError::storage(&path, e))?;

        let distinct: BTreeSet<NaiveDateTime> = stamps.into_iter().flatten().collect();
        Ok(StoreSummary {
            record_count: df.height(),
            first_timestamp: distinct.first().copied(),
            latest_timestamp: distinct.last().copied(),
            timestamps: distinct.into_iter().collect(),
        })
    }

    pub fn latest_timestamp(&self, spec: &SeriesSpec) -> Result<Option<NaiveDateTime>> {
        Ok(self.summary(spec)?.latest_timestamp)
    }

    /// Duplicate-key and sort-order check over the persisted file
    pub fn verify(&self, spec: &SeriesSpec) -> Result<VerifyReport> {
        let path = self.path_for(spec.name);
        let mut report = VerifyReport {
            series: spec.name.to_string(),
            ..VerifyReport::default()
        };
        if !path.exists() {
            return Ok(report);
        }

        let key = spec.key_column();
        let df = LazyFrame::scan_parquet(&path, Default::default())
            .and_then(|lf| lf.select([col(TIMESTAMP_COLUMN), col(key)]).collect())
            .map_err(|e| IngestError::storage(&path, e))?;
        report.record_count = df.height();

        let duplicates = df
            .clone()
            .lazy()
            .group_by([col(TIMESTAMP_COLUMN), col(key)])
            .agg([col(TIMESTAMP_COLUMN).count().alias("count")])
            .filter(col("count").gt(lit(1)))
            .collect()
            .map_err(|e| IngestError::storage(&path, e))?;
        report.duplicate_keys = duplicates.height();

        let stamps = timestamp_column(&df).map_err(|e| IngestError::storage(&path, e))?;
        let keys = df
            .column(key)
            .and_then(|s| s.utf8().map(|ca| ca.into_iter().map(|k| k.map(str::to_string)).collect::<Vec<_>>()))
            .map_err(|e| IngestError::storage(&path, e))?;
        let rows: Vec<_> = stamps.into_iter().zip(keys).collect();
        report.out_of_order = rows.windows(2).filter(|w| w[0] > w[1]).count();

        Ok(report)
    }
}

fn to_naive(ms: i64) -> Option<NaiveDateTime> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

fn timestamp_column(df: &DataFrame) -> PolarsResult<Vec<Option<NaiveDateTime>>> {
    let millis = df
        .column(TIMESTAMP_COLUMN)?
        .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?
        .cast(&DataType::Int64)?;
    let stamps = millis.i64()?.into_iter().map(|v| v.and_then(to_naive)).collect();
    Ok(stamps)
}

/// Stable on-disk layout: settlementdate (ms), key column, then value columns in order
pub fn records_to_frame(records: &[Record], spec: &SeriesSpec) -> PolarsResult<DataFrame> {
    let stamps: Vec<i64> = records
        .iter()
        .map(|r| r.timestamp.and_utc().timestamp_millis())
        .collect();
    let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();

    let mut columns = vec![
        Series::new(TIMESTAMP_COLUMN, stamps).cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?,
        Series::new(spec.key_column(), keys),
    ];
    for (i, name) in spec.value_columns().iter().enumerate() {
        let values: Vec<Option<f64>> = records
            .iter()
            .map(|r| r.values.get(i).copied().flatten())
            .collect();
        columns.push(Series::new(name, values));
    }
    DataFrame::new(columns)
}

pub fn frame_to_records(df: &DataFrame, spec: &SeriesSpec) -> PolarsResult<Vec<Record>> {
    let stamps = timestamp_column(df)?;
    let keys = df.column(spec.key_column())?.utf8()?;

    let mut values = Vec::with_capacity(spec.value_columns().len());
    for name in spec.value_columns() {
        let column = df.column(name)?.cast(&DataType::Float64)?;
        let column: Vec<Option<f64>> = column.f64()?.into_iter().collect();
        values.push(column);
    }

    let records = stamps
        .into_iter()
        .zip(keys.into_iter())
        .enumerate()
        .filter_map(|(row, (ts, key))| {
            Some(Record::new(
                ts?,
                key?,
                values.iter().map(|column| column[row]).collect(),
            ))
        })
        .collect();
    Ok(records)
}
