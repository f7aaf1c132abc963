use crate::catalog::SeriesSpec;
use crate::error::{IngestError, Result};
use crate::extractor::ArchiveExtractor;
use crate::fetcher::ArchiveSource;
use crate::known_entities::KnownEntitySet;
use crate::models::{ArchiveDescriptor, ArchiveLocation, MergeStats, Record};
use crate::normalizer::{NormalizedBatch, Normalizer};
use crate::parser::TableParser;
use crate::schema::SchemaRegistry;
use crate::store::ReconciliationStore;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Records held before an intermediate merge during long ranges
const FLUSH_RECORDS: usize = 250_000;

/// What one pass over a list of descriptors did
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub series: String,
    pub descriptors: usize,
    pub fetched: usize,
    /// Not published yet, empty, or carrying no rows for the table
    pub absent: usize,
    /// Descriptors whose layout was not recognised; each is logged with its URL
    pub unrecognized: Vec<String>,
    pub records: usize,
    pub rows_skipped: usize,
    pub merge: MergeStats,
    pub discovered: Vec<String>,
}

/// A pass stopped by a fatal error, after merging what it had already collected
#[derive(Debug)]
pub struct Aborted {
    pub report: IngestReport,
    pub error: IngestError,
}

/// Most recent archive fetched by URL, shared by the chunks of one backfill run.
///
/// Consecutive chunks meet at an archive boundary, so the archive a chunk ends in is the
/// one the next chunk looks back into. Listed current-feed files are never held.
#[derive(Default)]
pub struct ArchiveCache {
    last: Mutex<Option<(String, Vec<u8>)>>,
}

impl ArchiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fetch(&self, source: &dyn ArchiveSource, descriptor: &ArchiveDescriptor) -> Result<Vec<u8>> {
        let url = descriptor.url();
        let hit = self
            .last
            .lock()
            .as_ref()
            .filter(|(cached, _)| *cached == url)
            .map(|(_, bytes)| bytes.clone());
        if let Some(bytes) = hit {
            debug!("reusing {}", url);
            return Ok(bytes);
        }

        let bytes = source.fetch(descriptor).await?;
        if matches!(descriptor.location, ArchiveLocation::Direct(_)) {
            *self.last.lock() = Some((url, bytes.clone()));
        }
        Ok(bytes)
    }
}

/// Fetch, unpack, parse and normalize archives, then merge into the series store
pub struct Pipeline {
    source: Arc<dyn ArchiveSource>,
    registry: SchemaRegistry,
}

impl Pipeline {
    pub fn new(source: Arc<dyn ArchiveSource>, registry: SchemaRegistry) -> Self {
        Self { source, registry }
    }

    /// Turn archive bytes into records inside the descriptor's window
    pub fn decode(
        &self,
        spec: &SeriesSpec,
        descriptor: &ArchiveDescriptor,
        bytes: Vec<u8>,
        mut entities: Option<&mut KnownEntitySet>,
    ) -> Result<NormalizedBatch> {
        let url = descriptor.url();
        let leaves = ArchiveExtractor::extract_all(&url, bytes, descriptor.depth)?;
        let normalizer = Normalizer::new(spec, &self.registry);

        let mut out = NormalizedBatch::default();
        for (member, text) in leaves {
            let parsed = TableParser::parse(&text, &descriptor.table);
            if parsed.is_empty() {
                debug!("{}: {} has no {} rows", spec.name, member, descriptor.table);
                continue;
            }
            let batch = normalizer.normalize(&descriptor.table, &parsed, entities.as_deref_mut())?;
            out.skipped += batch.skipped;
            out.discovered.extend(batch.discovered);
            out.records.extend(
                batch
                    .records
                    .into_iter()
                    .filter(|r| descriptor.window.contains(r.timestamp)),
            );
        }

        if out.records.is_empty() {
            return Err(IngestError::EmptyArchive { name: url });
        }
        Ok(out)
    }

    async fn fetch_and_decode(
        &self,
        spec: &SeriesSpec,
        descriptor: &ArchiveDescriptor,
        entities: Option<&Mutex<KnownEntitySet>>,
        cache: Option<&ArchiveCache>,
    ) -> Result<NormalizedBatch> {
        let bytes = match cache {
            Some(cache) => cache.fetch(self.source.as_ref(), descriptor).await?,
            None => self.source.fetch(descriptor).await?,
        };
        let mut guard = entities.map(|m| m.lock());
        self.decode(spec, descriptor, bytes, guard.as_deref_mut())
    }

    /// Ingest `descriptors` in order, merging through the store.
    ///
    /// Absent archives and unrecognised layouts are logged and skipped; a fetch that
    /// exhausts its retries aborts the series after merging what was already collected.
    /// The partial report travels with the error so discovered keys are never lost.
    pub async fn ingest(
        &self,
        spec: &SeriesSpec,
        descriptors: &[ArchiveDescriptor],
        store: &ReconciliationStore,
        entities: Option<&Mutex<KnownEntitySet>>,
        cache: Option<&ArchiveCache>,
    ) -> std::result::Result<IngestReport, Aborted> {
        let mut report = IngestReport {
            series: spec.name.to_string(),
            descriptors: descriptors.len(),
            ..IngestReport::default()
        };
        let mut pending: Vec<Record> = Vec::new();

        for descriptor in descriptors {
            match self.fetch_and_decode(spec, descriptor, entities, cache).await {
                Ok(batch) => {
                    report.fetched += 1;
                    report.rows_skipped += batch.skipped;
                    report.records += batch.records.len();
                    report.discovered.extend(batch.discovered);
                    pending.extend(batch.records);
                }
                Err(e) if e.is_skippable() => {
                    report.absent += 1;
                    debug!("{}: {}", spec.name, e);
                }
                Err(e @ IngestError::FormatUnrecognized { .. }) => {
                    error!("❌ {}: {} ({})", spec.name, e, descriptor.url());
                    report.unrecognized.push(descriptor.url());
                }
                Err(e @ IngestError::CorruptArchive { .. }) => {
                    warn!("⚠️  {}: {}", spec.name, e);
                    report.absent += 1;
                }
                Err(e) => {
                    error!("❌ {}: giving up on {}: {}", spec.name, descriptor.url(), e);
                    if let Err(merge_error) = self.flush(spec, store, &mut pending, &mut report) {
                        error!("❌ {}: collected records not merged: {}", spec.name, merge_error);
                    }
                    return Err(Aborted { report, error: e });
                }
            }

            if pending.len() >= FLUSH_RECORDS {
                if let Err(error) = self.flush(spec, store, &mut pending, &mut report) {
                    return Err(Aborted { report, error });
                }
            }
        }

        if let Err(error) = self.flush(spec, store, &mut pending, &mut report) {
            return Err(Aborted { report, error });
        }
        if report.fetched > 0 {
            info!(
                "📊 {}: {}/{} archives, {} records, {} absent",
                spec.name, report.fetched, report.descriptors, report.records, report.absent
            );
        }
        Ok(report)
    }

    fn flush(
        &self,
        spec: &SeriesSpec,
        store: &ReconciliationStore,
        pending: &mut Vec<Record>,
        report: &mut IngestReport,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let stats = store.merge(spec, std::mem::take(pending))?;
        report.merge.absorb(stats);
        Ok(())
    }
}
