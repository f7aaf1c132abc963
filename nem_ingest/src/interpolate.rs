use crate::models::{Cadence, Record};
use std::collections::BTreeMap;

/// Synthesize a finer series from a coarser one by weighted linear interpolation.
///
/// For coarse samples `(t, v0)` and `(t + coarse, v1)` of one entity, point `j` at
/// `t + j * fine` takes `((n - j) * v0 + j * v1) / n` with `n = fine.per(coarse)`.
/// When the successor is absent (end of data or a gap) the last value is held flat.
pub fn interpolate(records: &[Record], coarse: Cadence, fine: Cadence) -> Vec<Record> {
    let steps = fine.per(coarse).max(1);
    let step = fine.duration();

    let mut by_key: BTreeMap<&str, Vec<&Record>> = BTreeMap::new();
    for record in records {
        by_key.entry(record.key.as_str()).or_default().push(record);
    }

    let mut out = Vec::with_capacity(records.len() * steps as usize);
    for (key, mut samples) in by_key {
        samples.sort_by_key(|r| r.timestamp);
        for (i, current) in samples.iter().enumerate() {
            let next = samples
                .get(i + 1)
                .filter(|n| n.timestamp == current.timestamp + coarse.duration());

            for j in 0..steps {
                let values = match next {
                    Some(next) => current
                        .values
                        .iter()
                        .zip(&next.values)
                        .map(|(v0, v1)| match (v0, v1) {
                            (Some(v0), Some(v1)) => {
                                Some(((steps - j) as f64 * v0 + j as f64 * v1) / steps as f64)
                            }
                            (v0, _) => *v0,
                        })
                        .collect(),
                    None => current.values.clone(),
                };
                out.push(Record::new(current.timestamp + step * j as i32, key, values));
            }
        }
    }

    out.sort_by(|a, b| a.identity().cmp(&b.identity()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 10, 9).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn values(records: &[Record]) -> Vec<f64> {
        records.iter().map(|r| r.values[0].unwrap()).collect()
    }

    #[test]
    fn test_weighted_pair() {
        let coarse = vec![
            Record::new(ts(10, 0), "NSW1", vec![Some(10.0)]),
            Record::new(ts(10, 30), "NSW1", vec![Some(16.0)]),
        ];
        let fine = interpolate(&coarse, Cadence::ThirtyMinute, Cadence::FiveMinute);
        assert_eq!(fine.len(), 12);
        assert_eq!(values(&fine[..6]), vec![10.0, 11.0, 12.0, 13.0, 14.0, 15.0]);
        assert_eq!(fine[5].timestamp, ts(10, 25));
    }

    #[test]
    fn test_last_sample_held_flat() {
        let coarse = vec![
            Record::new(ts(10, 0), "NSW1", vec![Some(10.0)]),
            Record::new(ts(10, 30), "NSW1", vec![Some(16.0)]),
        ];
        let fine = interpolate(&coarse, Cadence::ThirtyMinute, Cadence::FiveMinute);
        assert_eq!(values(&fine[6..]), vec![16.0; 6]);
        assert_eq!(fine[11].timestamp, ts(10, 55));
    }

    #[test]
    fn test_gap_is_not_bridged() {
        let coarse = vec![
            Record::new(ts(10, 0), "QLD1", vec![Some(10.0)]),
            Record::new(ts(11, 0), "QLD1", vec![Some(40.0)]),
        ];
        let fine = interpolate(&coarse, Cadence::ThirtyMinute, Cadence::FiveMinute);
        assert_eq!(values(&fine[..6]), vec![10.0; 6]);
    }

    #[test]
    fn test_entities_interpolated_independently() {
        let coarse = vec![
            Record::new(ts(10, 0), "NSW1", vec![Some(0.0)]),
            Record::new(ts(10, 0), "VIC1", vec![Some(60.0)]),
            Record::new(ts(10, 30), "NSW1", vec![Some(6.0)]),
            Record::new(ts(10, 30), "VIC1", vec![Some(0.0)]),
        ];
        let fine = interpolate(&coarse, Cadence::ThirtyMinute, Cadence::FiveMinute);
        let nsw: Vec<_> = fine.iter().filter(|r| r.key == "NSW1").cloned().collect();
        let vic: Vec<_> = fine.iter().filter(|r| r.key == "VIC1").cloned().collect();
        assert_eq!(values(&nsw[..6]), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(values(&vic[..6]), vec![60.0, 50.0, 40.0, 30.0, 20.0, 10.0]);
    }
}
