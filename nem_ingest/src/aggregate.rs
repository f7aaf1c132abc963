use crate::catalog::Reduce;
use crate::models::{Cadence, Record};
use chrono::NaiveDateTime;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
struct Accumulator {
    sums: Vec<f64>,
    present: Vec<usize>,
}

impl Accumulator {
    fn new(width: usize) -> Self {
        Self {
            sums: vec![0.0; width],
            present: vec![0; width],
        }
    }

    fn add(&mut self, values: &[Option<f64>]) {
        for (i, value) in values.iter().enumerate().take(self.sums.len()) {
            if let Some(v) = value {
                self.sums[i] += v;
                self.present[i] += 1;
            }
        }
    }

    fn finish(&self, reduce: Reduce, nominal: usize) -> Vec<Option<f64>> {
        self.sums
            .iter()
            .zip(&self.present)
            .map(|(&sum, &present)| match (present, reduce) {
                (0, _) => None,
                (_, Reduce::NominalMean) => Some(sum / nominal as f64),
                (n, Reduce::Mean) => Some(sum / n as f64),
            })
            .collect()
    }
}

/// Window label for a fine timestamp: the coarse mark that ends its interval.
///
/// AEMO stamps intervals by their end, so `(10:00, 10:30]` is labelled 10:30.
pub fn window_end(ts: NaiveDateTime, coarse: Cadence) -> NaiveDateTime {
    coarse.ceil(ts)
}

/// Derive a coarser series: one record per `(window, key)` with at least one contributor.
///
/// `Reduce::NominalMean` divides by the nominal sub-interval count even when samples are
/// missing; three samples of 2.0 in a 30-minute window give 1.0, not 2.0.
pub fn aggregate(records: &[Record], fine: Cadence, coarse: Cadence, reduce: Reduce, width: usize) -> Vec<Record> {
    let nominal = fine.per(coarse).max(1) as usize;

    let mut by_key: HashMap<&str, Vec<&Record>> = HashMap::new();
    for record in records {
        by_key.entry(record.key.as_str()).or_default().push(record);
    }

    let mut out: Vec<Record> = by_key
        .into_par_iter()
        .flat_map_iter(|(key, group)| {
            let mut windows: BTreeMap<NaiveDateTime, Accumulator> = BTreeMap::new();
            for record in group {
                windows
                    .entry(window_end(record.timestamp, coarse))
                    .or_insert_with(|| Accumulator::new(width))
                    .add(&record.values);
            }
            windows
                .into_iter()
                .map(move |(end, acc)| Record::new(end, key, acc.finish(reduce, nominal)))
        })
        .collect();

    out.sort_by(|a, b| a.identity().cmp(&b.identity()));
    out
}
