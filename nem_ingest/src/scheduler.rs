use crate::engine::Engine;
use crate::models::MergeStats;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{info, warn};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Serialize)]
pub struct SeriesOutcome {
    pub series: String,
    pub merge: MergeStats,
    pub error: Option<String>,
}

/// Result of one polling cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u128,
    pub primaries: Vec<SeriesOutcome>,
    pub derived: Vec<SeriesOutcome>,
}

impl CycleReport {
    pub fn failures(&self) -> usize {
        self.primaries
            .iter()
            .chain(&self.derived)
            .filter(|o| o.error.is_some())
            .count()
    }

    pub fn added(&self) -> usize {
        self.primaries.iter().chain(&self.derived).map(|o| o.merge.added).sum()
    }
}

/// Fixed-interval loop: poll every enabled primary concurrently, then refresh derived series
pub struct Scheduler {
    engine: Arc<Engine>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// One cycle. A failing series is recorded and never stops the others.
    pub async fn run_cycle(&self) -> CycleReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let engine = &self.engine;
        let config = engine.config();

        let polls = engine
            .catalog()
            .primaries()
            .filter(|s| config.is_enabled(s.name))
            .map(|spec| async move {
                let result = engine.poll(spec.name).await;
                SeriesOutcome {
                    series: spec.name.to_string(),
                    merge: result.as_ref().map(|r| r.merge).unwrap_or_default(),
                    error: result.err().map(|e| e.to_string()),
                }
            });
        let primaries = join_all(polls).await;

        let derived = engine
            .catalog()
            .derived()
            .filter(|s| config.is_enabled(s.name))
            .map(|spec| {
                let result = engine.refresh_derived(spec.name);
                SeriesOutcome {
                    series: spec.name.to_string(),
                    merge: result.as_ref().copied().unwrap_or_default(),
                    error: result.err().map(|e| e.to_string()),
                }
            })
            .collect();

        CycleReport {
            started_at,
            elapsed_ms: clock.elapsed().as_millis(),
            primaries,
            derived,
        }
    }

    /// Run cycles until `shutdown` resolves. Cancellation is checked between cycles only.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.engine.config().poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("🛑 shutdown requested, stopping after the last completed cycle");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.run_cycle().await;
                    if report.failures() > 0 {
                        warn!(
                            "⚠️  cycle finished in {}ms with {} failing series, {} records added",
                            report.elapsed_ms,
                            report.failures(),
                            report.added()
                        );
                    } else {
                        info!("✅ cycle finished in {}ms, {} records added", report.elapsed_ms, report.added());
                    }
                }
            }
        }
    }
}
