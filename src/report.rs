use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use nem_ingest::{BackfillReport, CycleReport, Engine, Gap, SeriesStatus};
use serde::Serialize;

const RULE_WIDTH: usize = 60;

const BACKFILL_TEMPLATE: &str =
    "{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({eta})";

fn rule() -> String {
    "=".repeat(RULE_WIDTH)
}

/// Backfill progress, one tick per completed chunk (an archive period)
pub fn progress_bar(series: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template(BACKFILL_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(series.to_string());
    pb
}

/// "12m", "3h 05m", "2d 4h"
pub fn format_lag(minutes: i64) -> String {
    match minutes {
        m if m < 0 => "ahead".to_string(),
        m if m < 60 => format!("{}m", m),
        m if m < 24 * 60 => format!("{}h {:02}m", m / 60, m % 60),
        m => format!("{}d {}h", m / (24 * 60), (m % (24 * 60)) / 60),
    }
}

pub fn print_cycle(report: &CycleReport) {
    println!("\n🔄 Update cycle at {}", report.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("{}", rule());
    for outcome in report.primaries.iter().chain(&report.derived) {
        match &outcome.error {
            None => println!(
                "  ✅ {:<16} +{:<6} added  {:<6} superseded  {:<6} unchanged",
                outcome.series, outcome.merge.added, outcome.merge.superseded, outcome.merge.unchanged
            ),
            Some(e) => println!("  ❌ {:<16} {}", outcome.series, e),
        }
    }
    println!("{}", rule());
    println!(
        "⏱️  {}ms, {} records added, {} failing series",
        report.elapsed_ms,
        report.added(),
        report.failures()
    );
}

pub fn print_backfill(report: &BackfillReport) {
    println!("\n📦 Backfill {}", report.series);
    println!("{}", rule());
    println!("  Chunks:            {}/{}", report.chunks_done, report.chunks);
    println!("  Records parsed:    {}", report.records);
    println!("  Absent archives:   {}", report.absent_archives);
    println!("  Added:             {}", report.merge.added);
    println!("  Superseded:        {}", report.merge.superseded);
    println!("  Unchanged:         {}", report.merge.unchanged);
    if report.merge.collapsed > 0 {
        println!("  Stored duplicates: {} folded", report.merge.collapsed);
    }
    println!("  Stored total:      {}", report.merge.total);
    if let Some(e) = &report.error {
        println!("  ❌ Stopped early:  {}", e);
    }
}

pub fn print_gaps(series: &str, gaps: &[Gap]) {
    if gaps.is_empty() {
        println!("✅ {}: no gaps", series);
        return;
    }
    println!("\n🕳️  {} gap(s) in {}", gaps.len(), series);
    println!("{}", rule());
    for gap in gaps {
        println!(
            "  {} → {}  ({} interval(s))",
            gap.start.format("%Y-%m-%d %H:%M"),
            gap.end.format("%Y-%m-%d %H:%M"),
            gap.missing_intervals
        );
    }
    let total: usize = gaps.iter().map(|g| g.missing_intervals).sum();
    println!("{}", rule());
    println!("  Missing intervals: {}", total);
}

pub fn print_status(statuses: &[SeriesStatus], market_now: NaiveDateTime) {
    println!("\n📊 NEM series status (market time {})", market_now.format("%Y-%m-%d %H:%M"));
    println!("{}", rule());
    println!(
        "  {:<3}{:<16}{:>10}  {:<17}{:>10}{:>8}",
        "", "series", "records", "latest", "behind", "gaps"
    );
    for status in statuses {
        let icon = if !status.enabled {
            "⏸️ "
        } else if status.degraded() {
            "⚠️ "
        } else {
            "✅"
        };
        let latest = status
            .latest_timestamp
            .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let behind = status
            .minutes_behind(market_now)
            .map(format_lag)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<3}{:<16}{:>10}  {:<17}{:>10}{:>8}",
            icon,
            status.series,
            status.record_count,
            latest,
            behind,
            status.missing_intervals()
        );
        if let Some(e) = &status.health.last_error {
            println!(
                "       last error ({} in a row): {}",
                status.health.consecutive_failures, e
            );
        }
    }
}

#[derive(Serialize)]
struct StatusDump<'a> {
    generated_at: DateTime<Utc>,
    market_now: NaiveDateTime,
    series: &'a [SeriesStatus],
}

pub fn status_json(statuses: &[SeriesStatus], market_now: NaiveDateTime) -> Result<String> {
    Ok(serde_json::to_string_pretty(&StatusDump {
        generated_at: Utc::now(),
        market_now,
        series: statuses,
    })?)
}

/// Integrity pass over every stored series; returns the number of issues found
pub fn verify_all(engine: &Engine) -> Result<usize> {
    println!("\n🔍 Data Quality Verification");
    println!("{}", rule());

    let mut total_issues = 0;
    for spec in engine.catalog().all() {
        if !engine.store().exists(spec.name) {
            println!("\n  ⏭️  {}: no store yet", spec.name);
            continue;
        }
        println!("\n  Verifying: {}", engine.store().path_for(spec.name).display());

        let report = engine.verify(spec.name)?;
        println!("    📊 {} records", report.record_count);

        if report.duplicate_keys > 0 {
            println!("    ❌ Found {} duplicate keys", report.duplicate_keys);
            total_issues += report.duplicate_keys;
        } else {
            println!("    ✅ No duplicates found");
        }

        if report.out_of_order > 0 {
            println!("    ❌ {} records out of order", report.out_of_order);
            total_issues += report.out_of_order;
        } else {
            println!("    ✅ Sorted by timestamp and key");
        }

        // gaps are reported, not counted as issues: some intervals were never published
        let gaps = engine.gaps(spec.name)?;
        if gaps.is_empty() {
            println!("    ✅ No gaps in time series");
        } else {
            let missing: usize = gaps.iter().map(|g| g.missing_intervals).sum();
            println!("    ⚠️  Found {} gaps ({} missing intervals)", gaps.len(), missing);
        }
    }

    println!("\n{}", rule());
    if total_issues == 0 {
        println!("✅ All stores passed verification");
    } else {
        println!("❌ Found {} issues", total_issues);
    }
    Ok(total_issues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_lag() {
        assert_eq!(format_lag(-3), "ahead");
        assert_eq!(format_lag(12), "12m");
        assert_eq!(format_lag(185), "3h 05m");
        assert_eq!(format_lag(2 * 24 * 60 + 4 * 60 + 10), "2d 4h");
    }

    #[test]
    fn test_backfill_template_counts_chunks() {
        assert!(ProgressStyle::default_bar().template(BACKFILL_TEMPLATE).is_ok());
        assert!(BACKFILL_TEMPLATE.contains("{pos}/{len} chunks"));
        assert!(!BACKFILL_TEMPLATE.contains("days"));
    }
}
