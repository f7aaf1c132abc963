use anyhow::{bail, Context, Result};
use nem_ingest::Config;
use std::path::PathBuf;

const DEFAULT_DATA_PATH: &str = "data";

/// Engine configuration from the process environment (after `.env` has been loaded)
pub fn from_env(data_path: Option<PathBuf>) -> Result<Config> {
    from_vars(|name| std::env::var(name).ok(), data_path)
}

/// `lookup` resolves one variable name; a set `data_path` wins over `NEM_DATA_PATH`
pub fn from_vars(lookup: impl Fn(&str) -> Option<String>, data_path: Option<PathBuf>) -> Result<Config> {
    let mut config = Config::default();

    config.storage_root = match data_path {
        Some(path) => path,
        None => lookup("NEM_DATA_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_PATH)),
    };

    if let Some(minutes) = lookup("UPDATE_INTERVAL_MINUTES") {
        let minutes: f64 = minutes
            .trim()
            .parse()
            .with_context(|| format!("UPDATE_INTERVAL_MINUTES is not a number: {:?}", minutes))?;
        if !minutes.is_finite() || minutes <= 0.0 {
            bail!("UPDATE_INTERVAL_MINUTES must be positive, got {}", minutes);
        }
        config.poll_interval_secs = (minutes * 60.0).round() as u64;
    }

    if let Some(agent) = lookup("NEM_USER_AGENT") {
        config.fetch.user_agent = agent;
    }

    if let Some(base) = lookup("NEM_BASE_URL") {
        config.base_url = base.trim().trim_end_matches('/').to_string();
    }

    if let Some(disabled) = lookup("NEM_DISABLE_SERIES") {
        for series in disabled.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            config.enabled.insert(series.to_string(), false);
        }
    }

    Ok(config)
}
