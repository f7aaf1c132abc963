use crate::models::{Cadence, Gap};
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

/// Outcome history of the most recent ingestion attempts for one series
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesHealth {
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl SeriesHealth {
    /// A failed attempt that has not since succeeded
    pub fn degraded(&self) -> bool {
        self.consecutive_failures > 0
    }
}

/// Read interface for the dashboard and freshness alerting
#[derive(Debug, Clone, Serialize)]
pub struct SeriesStatus {
    pub series: String,
    pub cadence: Cadence,
    pub enabled: bool,
    pub record_count: usize,
    pub latest_timestamp: Option<NaiveDateTime>,
    pub gaps: Vec<Gap>,
    pub health: SeriesHealth,
}

impl SeriesStatus {
    pub fn degraded(&self) -> bool {
        self.health.degraded()
    }

    pub fn missing_intervals(&self) -> usize {
        self.gaps.iter().map(|g| g.missing_intervals).sum()
    }

    /// Minutes since the latest stored interval, measured in market time
    pub fn minutes_behind(&self, market_now: NaiveDateTime) -> Option<i64> {
        self.latest_timestamp.map(|ts| (market_now - ts).num_minutes())
    }
}

#[derive(Debug, Default)]
pub struct StatusBoard {
    health: RwLock<HashMap<String, SeriesHealth>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, series: &str) {
        let now = Utc::now();
        let mut health = self.health.write();
        let entry = health.entry(series.to_string()).or_default();
        entry.last_attempt = Some(now);
        entry.last_success = Some(now);
        entry.last_error = None;
        entry.consecutive_failures = 0;
    }

    pub fn record_failure(&self, series: &str, error: &str) {
        let mut health = self.health.write();
        let entry = health.entry(series.to_string()).or_default();
        entry.last_attempt = Some(Utc::now());
        entry.last_error = Some(error.to_string());
        entry.consecutive_failures += 1;
    }

    pub fn health(&self, series: &str) -> SeriesHealth {
        self.health.read().get(series).cloned().unwrap_or_default()
    }
}
