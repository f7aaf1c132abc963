use chrono::{Duration, NaiveDate, NaiveDateTime};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nem_ingest::aggregate::aggregate;
use nem_ingest::catalog::Reduce;
use nem_ingest::store::reconcile;
use nem_ingest::{Cadence, Record};

const UNITS: usize = 400;

fn start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 1, 1)
        .unwrap()
        .and_hms_opt(0, 5, 0)
        .unwrap()
}

/// `intervals` five-minute intervals for every unit, starting `offset` intervals in
fn scada(offset: i64, intervals: i64, value: f64) -> Vec<Record> {
    let mut records = Vec::with_capacity(intervals as usize * UNITS);
    for i in offset..offset + intervals {
        let ts = start() + Duration::minutes(5 * i);
        for unit in 0..UNITS {
            records.push(Record::new(ts, format!("UNIT{:03}", unit), vec![Some(value)]));
        }
    }
    records
}

fn benchmark_merge_overlapping_day(c: &mut Criterion) {
    // a week in the store, the last day re-fetched with an hour of new data
    let existing = scada(0, 7 * 288, 1.0);
    let batch = scada(6 * 288, 288 + 12, 2.0);

    c.bench_function("reconcile_week_with_day_refetch", |b| {
        b.iter(|| {
            let _merged = black_box(reconcile("scada5", existing.clone(), batch.clone()));
        });
    });
}

fn benchmark_merge_live_tick(c: &mut Criterion) {
    let existing = scada(0, 7 * 288, 1.0);
    let tick = scada(7 * 288, 1, 1.0);

    c.bench_function("reconcile_week_with_one_tick", |b| {
        b.iter(|| {
            let _merged = black_box(reconcile("scada5", existing.clone(), tick.clone()));
        });
    });
}

fn benchmark_aggregate_day(c: &mut Criterion) {
    let day = scada(0, 288, 60.0);

    c.bench_function("aggregate_day_to_30min", |b| {
        b.iter(|| {
            let _coarse = black_box(aggregate(
                &day,
                Cadence::FiveMinute,
                Cadence::ThirtyMinute,
                Reduce::NominalMean,
                1,
            ));
        });
    });
}

criterion_group!(
    benches,
    benchmark_merge_overlapping_day,
    benchmark_merge_live_tick,
    benchmark_aggregate_day
);
criterion_main!(benches);
