mod common;

use chrono::{Duration, NaiveDateTime};
use common::{scada_csv, zip_of, ScriptedSource};
use nem_ingest::models::ArchiveLocation;
use nem_ingest::{Cadence, Catalog, Config, Engine, EngineEvent, IngestError, Scheduler, TimeWindow};
use std::sync::Arc;
use tempfile::TempDir;

/// Interval timestamp carried at the end of a live-feed prefix
fn tick_of(prefix: &str) -> Option<NaiveDateTime> {
    let stamp = prefix.get(prefix.len().checked_sub(12)?..)?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M").ok()
}

fn config(dir: &TempDir) -> Config {
    let mut config = Config::default().with_storage_root(dir.path());
    for series in ["transmission5", "curtailment5", "rooftop30", "transmission30", "rooftop5"] {
        config.enabled.insert(series.to_string(), false);
    }
    config
}

#[tokio::test]
async fn test_failing_series_does_not_stop_the_cycle() {
    let dir = TempDir::new().unwrap();

    // prices feed is down; scada answers every interval with two units
    let source = Arc::new(ScriptedSource::new(|d| match &d.location {
        ArchiveLocation::Listed { prefix, .. } if prefix.starts_with("PUBLIC_DISPATCHSCADA_") => {
            let tick = tick_of(prefix).ok_or_else(|| IngestError::NotPublished { url: d.url() })?;
            let csv = scada_csv(&[(tick, "BANN1", 12.5), (tick, "ARWF1", 80.0)]);
            Ok(zip_of(&[(format!("{}.CSV", prefix), csv.into_bytes())]))
        }
        _ => Err(IngestError::FetchFailed {
            url: d.url(),
            attempts: 3,
            reason: "503 Service Unavailable".into(),
        }),
    }));

    let engine = Arc::new(Engine::with_source(config(&dir), Catalog::nem(), source).unwrap());
    let mut events = engine.subscribe();

    let report = Scheduler::new(engine.clone()).run_cycle().await;

    let outcome = |name: &str| report.primaries.iter().find(|o| o.series == name).unwrap().clone();
    assert_eq!(report.primaries.len(), 2);
    assert!(outcome("prices5").error.is_some());
    assert!(outcome("scada5").error.is_none());
    assert_eq!(outcome("scada5").merge.added, 2 * engine.config().catchup_ticks as usize);

    let prices = engine.status("prices5").unwrap();
    assert!(prices.degraded());
    assert_eq!(prices.record_count, 0);
    let scada = engine.status("scada5").unwrap();
    assert!(!scada.degraded());
    assert_eq!(scada.record_count, 2 * engine.config().catchup_ticks as usize);

    let mut discovered = Vec::new();
    let mut failed = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::NewEntityDiscovered { series, keys } => discovered.push((series, keys)),
            EngineEvent::SeriesFailed { series, .. } => failed.push(series),
        }
    }
    assert_eq!(failed, vec!["prices5".to_string()]);
    assert_eq!(
        discovered,
        vec![("scada5".to_string(), vec!["ARWF1".to_string(), "BANN1".to_string()])]
    );

    // units seen once are remembered across cycles
    let known = dir.path().join("scada5_known_entities.txt");
    assert!(known.exists());
    Scheduler::new(engine.clone()).run_cycle().await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, EngineEvent::NewEntityDiscovered { .. }));
    }
}

#[tokio::test]
async fn test_units_seen_before_a_failed_fetch_are_announced() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let first = Cadence::FiveMinute.floor(config.market_now()) - Duration::minutes(20);

    // the first interval carries a new unit, the next one is unreachable
    let source = Arc::new(ScriptedSource::new(move |d| match &d.location {
        ArchiveLocation::Listed { prefix, .. } if tick_of(prefix) == Some(first) => {
            let csv = scada_csv(&[(first, "NEWUNIT1", 42.0)]);
            Ok(zip_of(&[(format!("{}.CSV", prefix), csv.into_bytes())]))
        }
        _ => Err(IngestError::FetchFailed {
            url: d.url(),
            attempts: 3,
            reason: "connection reset".into(),
        }),
    }));
    let engine = Engine::with_source(config, Catalog::nem(), source).unwrap();
    let mut events = engine.subscribe();

    let window = TimeWindow::new(first, first + Duration::minutes(10));
    let result = engine.ingest_window("scada5", window).await;
    assert!(matches!(result, Err(IngestError::FetchFailed { .. })));
    assert_eq!(engine.status("scada5").unwrap().record_count, 1);

    let mut announced = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::NewEntityDiscovered { keys, .. } = event {
            announced.extend(keys);
        }
    }
    assert_eq!(announced, vec!["NEWUNIT1".to_string()]);

    let known = std::fs::read_to_string(dir.path().join("scada5_known_entities.txt")).unwrap();
    assert_eq!(known.lines().collect::<Vec<_>>(), vec!["NEWUNIT1"]);

    // the retry sees the unit again but does not announce it twice
    assert!(engine.ingest_window("scada5", window).await.is_err());
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, EngineEvent::NewEntityDiscovered { .. }));
    }
}
