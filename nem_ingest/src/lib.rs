pub mod aggregate;
pub mod backfill;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod gaps;
pub mod interpolate;
pub mod known_entities;
pub mod locator;
pub mod models;
pub mod normalizer;
pub mod parser;
pub mod pipeline;
pub mod scheduler;
pub mod schema;
pub mod status;
pub mod store;

pub use backfill::{BackfillOrchestrator, BackfillReport, BackfillTarget};
pub use catalog::{Catalog, SeriesKind, SeriesSpec};
pub use config::{Config, FetchPolicy};
pub use engine::{Engine, EngineEvent};
pub use error::{IngestError, Result};
pub use fetcher::{ArchiveFetcher, ArchiveSource};
pub use models::{ArchiveDescriptor, Cadence, Gap, MergeStats, Record, TimeWindow};
pub use pipeline::{ArchiveCache, IngestReport};
pub use scheduler::{CycleReport, Scheduler};
pub use status::{SeriesHealth, SeriesStatus};
pub use store::{ReconciliationStore, VerifyReport};
