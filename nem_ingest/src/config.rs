use crate::error::{IngestError, Result};
use chrono::{Duration, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Retry, spacing and identification policy for every outbound request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: u32,
    /// Minimum gap between the start of two consecutive requests
    pub min_spacing_ms: u64,
    pub timeout_secs: u64,
    /// NEMWEB rejects requests without an identifying User-Agent
    pub user_agent: String,
    /// Listing cache lifetime for current-feed directories
    pub listing_ttl_secs: u64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 2_000,
            backoff_multiplier: 2,
            min_spacing_ms: 200,
            timeout_secs: 60,
            user_agent: "AEMO Dashboard Data Collector".to_string(),
            listing_ttl_secs: 60,
        }
    }
}

impl FetchPolicy {
    /// Delay before attempt `attempt` (1-based; the first attempt has none)
    pub fn backoff_for(&self, attempt: u32) -> std::time::Duration {
        if attempt <= 1 {
            return std::time::Duration::ZERO;
        }
        let factor = (self.backoff_multiplier.max(1) as u64).saturating_pow(attempt - 2);
        std::time::Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }
}

/// Static configuration handed to the engine at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage_root: PathBuf,
    pub poll_interval_secs: u64,
    /// Per-series enable flags; series missing from the map are enabled
    pub enabled: HashMap<String, bool>,
    pub base_url: String,
    /// NEM market time is UTC+10 all year
    pub market_utc_offset_hours: i32,
    /// How far back the CURRENT directories reach
    pub current_horizon_hours: i64,
    /// How far back the ARCHIVE directories reach before only MMSDM remains
    pub archive_retention_days: i64,
    /// Intervals re-requested by each live poll, bounded below by the store's latest timestamp
    pub catchup_ticks: i64,
    pub fetch: FetchPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("data"),
            poll_interval_secs: 270,
            enabled: HashMap::new(),
            base_url: "http://nemweb.com.au".to_string(),
            market_utc_offset_hours: 10,
            current_horizon_hours: 48,
            archive_retention_days: 395,
            catchup_ticks: 6,
            fetch: FetchPolicy::default(),
        }
    }
}

impl Config {
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    pub fn is_enabled(&self, series: &str) -> bool {
        self.enabled.get(series).copied().unwrap_or(true)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }

    pub fn current_horizon(&self) -> Duration {
        Duration::hours(self.current_horizon_hours)
    }

    pub fn archive_retention(&self) -> Duration {
        Duration::days(self.archive_retention_days)
    }

    /// Wall-clock now expressed in naive market time
    pub fn market_now(&self) -> NaiveDateTime {
        match FixedOffset::east_opt(self.market_utc_offset_hours * 3600) {
            Some(offset) => Utc::now().with_timezone(&offset).naive_local(),
            None => Utc::now().naive_utc(),
        }
    }

    /// Reject values that would make the engine misbehave; `known_series` guards the enable map
    pub fn validate(&self, known_series: &[&str]) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(IngestError::InvalidConfig("poll interval must be positive".into()));
        }
        if self.fetch.max_attempts == 0 {
            return Err(IngestError::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if self.fetch.user_agent.trim().is_empty() {
            return Err(IngestError::InvalidConfig(
                "an identifying user agent is required by NEMWEB".into(),
            ));
        }
        if !(-12..=14).contains(&self.market_utc_offset_hours) {
            return Err(IngestError::InvalidConfig(format!(
                "market UTC offset {}h out of range",
                self.market_utc_offset_hours
            )));
        }
        if self.current_horizon_hours <= 0 || self.archive_retention_days <= 0 {
            return Err(IngestError::InvalidConfig("source horizons must be positive".into()));
        }
        if self.catchup_ticks <= 0 {
            return Err(IngestError::InvalidConfig("catchup_ticks must be positive".into()));
        }
        if let Some(unknown) = self.enabled.keys().find(|k| !known_series.contains(&k.as_str())) {
            return Err(IngestError::InvalidConfig(format!(
                "enable flag for unknown series '{}'",
                unknown
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate(&["prices5"]).is_ok());
        assert_eq!(config.poll_interval().as_secs(), 270);
        assert!(config.is_enabled("prices5"));
    }

    #[test]
    fn test_rejects_unknown_series_flag() {
        let mut config = Config::default();
        config.enabled.insert("nonsense".into(), false);
        assert!(matches!(
            config.validate(&["prices5"]),
            Err(IngestError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_missing_user_agent() {
        let mut config = Config::default();
        config.fetch.user_agent = "  ".into();
        assert!(config.validate(&[]).is_err());
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = FetchPolicy::default();
        assert_eq!(policy.backoff_for(1).as_millis(), 0);
        assert_eq!(policy.backoff_for(2).as_millis(), 2_000);
        assert_eq!(policy.backoff_for(3).as_millis(), 4_000);
    }
}
