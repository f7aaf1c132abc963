use crate::aggregate::{aggregate, window_end};
use crate::catalog::{Catalog, Derivation, SeriesSpec};
use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::fetcher::{ArchiveFetcher, ArchiveSource};
use crate::gaps::GapDetector;
use crate::interpolate::interpolate;
use crate::known_entities::KnownEntitySet;
use crate::locator::SourceLocator;
use crate::models::{Gap, MergeStats, Record, TimeWindow};
use crate::pipeline::{Aborted, ArchiveCache, IngestReport, Pipeline};
use crate::schema::SchemaRegistry;
use crate::status::{SeriesStatus, StatusBoard};
use crate::store::{ReconciliationStore, VerifyReport};
use chrono::NaiveDateTime;
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Notifications for collaborators such as alerting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EngineEvent {
    NewEntityDiscovered { series: String, keys: Vec<String> },
    SeriesFailed { series: String, error: String },
}

/// Ingestion-reconciliation engine: one instance per storage root
pub struct Engine {
    config: Config,
    catalog: Catalog,
    locator: SourceLocator,
    pipeline: Pipeline,
    store: ReconciliationStore,
    entities: HashMap<&'static str, Mutex<KnownEntitySet>>,
    status: StatusBoard,
    events: broadcast::Sender<EngineEvent>,
}

impl Engine {
    /// Engine over NEMWEB with the standard catalog
    pub fn new(config: Config) -> Result<Self> {
        let fetcher = ArchiveFetcher::new(config.fetch.clone())?;
        Self::with_source(config, Catalog::nem(), Arc::new(fetcher))
    }

    /// Engine with an injected archive source; fails on invalid config or unusable storage
    pub fn with_source(config: Config, catalog: Catalog, source: Arc<dyn ArchiveSource>) -> Result<Self> {
        config.validate(&catalog.names())?;
        let store = ReconciliationStore::open(&config.storage_root)?;

        let mut entities = HashMap::new();
        for spec in catalog.primaries().filter(|s| s.kind.has_entity_registry()) {
            let path = store.root().join(KnownEntitySet::file_name(spec.name));
            let set = KnownEntitySet::load(path)?;
            info!("📋 {}: {} known entities", spec.name, set.len());
            entities.insert(spec.name, Mutex::new(set));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            locator: SourceLocator::from_config(&config),
            pipeline: Pipeline::new(source, SchemaRegistry::nem()),
            catalog,
            store,
            entities,
            status: StatusBoard::new(),
            events,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn locator(&self) -> &SourceLocator {
        &self.locator
    }

    pub fn store(&self) -> &ReconciliationStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn fail(&self, series: &str, e: &IngestError) {
        self.status.record_failure(series, &e.to_string());
        let _ = self.events.send(EngineEvent::SeriesFailed {
            series: series.to_string(),
            error: e.to_string(),
        });
    }

    /// The single ingestion path shared by live polling and backfill
    pub async fn ingest_window(&self, series: &str, window: TimeWindow) -> Result<IngestReport> {
        self.ingest_window_with(series, window, None).await
    }

    /// As `ingest_window`, reusing archives already fetched into `cache`
    pub async fn ingest_window_cached(
        &self,
        series: &str,
        window: TimeWindow,
        cache: &ArchiveCache,
    ) -> Result<IngestReport> {
        self.ingest_window_with(series, window, Some(cache)).await
    }

    async fn ingest_window_with(
        &self,
        series: &str,
        window: TimeWindow,
        cache: Option<&ArchiveCache>,
    ) -> Result<IngestReport> {
        let spec = self.catalog.get(series)?;
        let result = self.ingest_spec(spec, window, cache).await;
        match &result {
            Ok(report) if report.unrecognized.is_empty() => self.status.record_success(series),
            Ok(report) => self.status.record_failure(
                series,
                &format!("{} archive(s) in an unrecognized format", report.unrecognized.len()),
            ),
            Err(e) => self.fail(series, e),
        }
        result
    }

    async fn ingest_spec(
        &self,
        spec: &SeriesSpec,
        window: TimeWindow,
        cache: Option<&ArchiveCache>,
    ) -> Result<IngestReport> {
        let descriptors = self.locator.locate(spec, window, self.config.market_now())?;
        let entities = self.entities.get(spec.name);
        match self.pipeline.ingest(spec, &descriptors, &self.store, entities, cache).await {
            Ok(report) => {
                self.announce(spec, entities, &report.discovered)?;
                Ok(report)
            }
            Err(Aborted { report, error }) => {
                // keys observed before the abort are already in the registry
                if let Err(e) = self.announce(spec, entities, &report.discovered) {
                    error!("❌ {}: {}", spec.name, e);
                }
                Err(error)
            }
        }
    }

    /// One `NewEntityDiscovered` per batch of fresh keys, then persist the registry
    fn announce(&self, spec: &SeriesSpec, entities: Option<&Mutex<KnownEntitySet>>, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let _ = self.events.send(EngineEvent::NewEntityDiscovered {
            series: spec.name.to_string(),
            keys: keys.to_vec(),
        });
        match entities {
            Some(set) => set.lock().persist(),
            None => Ok(()),
        }
    }

    /// Window a live poll should request: the newest ticks not yet stored, plus
    /// `catchup_ticks` of recent history, never reaching past the current-feed horizon
    pub fn poll_window(&self, spec: &SeriesSpec, latest: Option<NaiveDateTime>, now: NaiveDateTime) -> Option<TimeWindow> {
        let cadence = spec.cadence;
        let tick = cadence.floor(now);
        let recent = tick - cadence.duration() * (self.config.catchup_ticks.max(1) as i32 - 1);
        let start = match latest {
            Some(latest) => (latest + cadence.duration()).min(recent),
            None => recent,
        };
        let start = start.max(cadence.ceil(now - self.config.current_horizon()));
        let window = TimeWindow::new(start, tick + cadence.duration());
        (!window.is_empty()).then_some(window)
    }

    /// One live poll of a primary series
    pub async fn poll(&self, series: &str) -> Result<IngestReport> {
        let spec = self.catalog.get(series)?;
        let latest = match self.store.latest_timestamp(spec) {
            Ok(latest) => latest,
            Err(e) => {
                self.fail(series, &e);
                return Err(e);
            }
        };
        match self.poll_window(spec, latest, self.config.market_now()) {
            Some(window) => self.ingest_window(series, window).await,
            None => Ok(IngestReport {
                series: series.to_string(),
                ..IngestReport::default()
            }),
        }
    }

    fn derivation_of(&self, series: &str) -> Result<(&SeriesSpec, &SeriesSpec, Derivation)> {
        let spec = self.catalog.get(series)?;
        let derivation = *spec.derivation().ok_or_else(|| {
            IngestError::InvalidConfig(format!("{} is not a derived series", series))
        })?;
        let source = self.catalog.get(derivation.source())?;
        Ok((spec, source, derivation))
    }

    /// Derived records for the part of the source affecting `[from, to)`; open ends are unbounded
    fn derive_range(
        &self,
        spec: &SeriesSpec,
        source: &SeriesSpec,
        derivation: Derivation,
        from: Option<NaiveDateTime>,
        to: Option<NaiveDateTime>,
    ) -> Result<Vec<Record>> {
        let records = self.store.load(source)?;
        let width = spec.value_columns().len();

        let derived = match derivation {
            Derivation::Aggregate { reduce, .. } => {
                // whole windows only: (end of window holding `from` - one window, end of window holding `to`]
                let lower = from.map(|f| window_end(f, spec.cadence) - spec.cadence.duration());
                let upper = to.map(|t| window_end(t, spec.cadence));
                let selected: Vec<Record> = records
                    .into_iter()
                    .filter(|r| lower.map_or(true, |l| r.timestamp > l))
                    .filter(|r| upper.map_or(true, |u| r.timestamp <= u))
                    .collect();
                aggregate(&selected, source.cadence, spec.cadence, reduce, width)
            }
            Derivation::Interpolate { .. } => {
                // each coarse sample needs its successor to avoid a flat hold
                let lower = from.map(|f| source.cadence.floor(f));
                let upper = to.map(|t| source.cadence.ceil(t) + source.cadence.duration());
                let selected: Vec<Record> = records
                    .into_iter()
                    .filter(|r| lower.map_or(true, |l| r.timestamp >= l))
                    .filter(|r| upper.map_or(true, |u| r.timestamp <= u))
                    .collect();
                interpolate(&selected, source.cadence, spec.cadence)
                    .into_iter()
                    .filter(|r| upper.map_or(true, |u| r.timestamp < u))
                    .collect()
            }
        };
        Ok(derived)
    }

    /// Re-derive `[window.start, window.end)` of a derived series and merge it
    pub fn derive_window(&self, series: &str, window: TimeWindow) -> Result<MergeStats> {
        let (spec, source, derivation) = self.derivation_of(series)?;
        let records = self.derive_range(spec, source, derivation, Some(window.start), Some(window.end))?;
        self.store.merge(spec, records)
    }

    /// Incremental derive from the derived store's latest timestamp, reaching back over
    /// the poll catch-up span so late publications re-aggregate their windows
    pub fn refresh_derived(&self, series: &str) -> Result<MergeStats> {
        let result = self.derivation_of(series).and_then(|(spec, source, derivation)| {
            let catchup = source.cadence.duration() * self.config.catchup_ticks.max(1) as i32;
            let from = self.store.latest_timestamp(spec)?.map(|latest| latest - catchup);
            let records = self.derive_range(spec, source, derivation, from, None)?;
            self.store.merge(spec, records)
        });
        match &result {
            Ok(_) => self.status.record_success(series),
            Err(e) => {
                error!("❌ {}: derive failed: {}", series, e);
                self.fail(series, e);
            }
        }
        result
    }

    /// Rebuild a derived series from scratch and atomically replace its file
    pub fn recompute_derived(&self, series: &str) -> Result<MergeStats> {
        let (spec, source, derivation) = self.derivation_of(series)?;
        let records = self.derive_range(spec, source, derivation, None, None)?;
        if records.is_empty() {
            warn!("{}: source {} is empty, nothing to recompute", series, source.name);
            return Ok(MergeStats::default());
        }
        let stats = self.store.replace(spec, records)?;
        self.status.record_success(series);
        Ok(stats)
    }

    pub fn gaps(&self, series: &str) -> Result<Vec<Gap>> {
        let spec = self.catalog.get(series)?;
        let summary = self.store.summary(spec)?;
        Ok(GapDetector::new(spec.cadence).detect(spec.name, &summary.timestamps))
    }

    pub fn status(&self, series: &str) -> Result<SeriesStatus> {
        let spec = self.catalog.get(series)?;
        let summary = self.store.summary(spec)?;
        Ok(SeriesStatus {
            series: spec.name.to_string(),
            cadence: spec.cadence,
            enabled: self.config.is_enabled(spec.name),
            record_count: summary.record_count,
            latest_timestamp: summary.latest_timestamp,
            gaps: GapDetector::new(spec.cadence).detect(spec.name, &summary.timestamps),
            health: self.status.health(spec.name),
        })
    }

    /// Status of every series; unreadable stores are reported as degraded rather than omitted
    pub fn status_all(&self) -> Vec<SeriesStatus> {
        self.catalog
            .all()
            .iter()
            .map(|spec| {
                self.status(spec.name).unwrap_or_else(|e| SeriesStatus {
                    series: spec.name.to_string(),
                    cadence: spec.cadence,
                    enabled: self.config.is_enabled(spec.name),
                    record_count: 0,
                    latest_timestamp: None,
                    gaps: Vec::new(),
                    health: {
                        let mut health = self.status.health(spec.name);
                        health.last_error = Some(e.to_string());
                        health.consecutive_failures = health.consecutive_failures.max(1);
                        health
                    },
                })
            })
            .collect()
    }

    pub fn verify(&self, series: &str) -> Result<VerifyReport> {
        let spec = self.catalog.get(series)?;
        self.store.verify(spec)
    }
}
