use crate::models::{Cadence, Gap};
use chrono::NaiveDateTime;

/// Finds runs of expected timestamps with no records between a series' first and last
pub struct GapDetector {
    cadence: Cadence,
}

impl GapDetector {
    pub fn new(cadence: Cadence) -> Self {
        Self { cadence }
    }

    /// `timestamps` are the distinct timestamps of the series, ascending.
    ///
    /// Every absence is reported; some intervals were simply never published upstream.
    pub fn detect(&self, series: &str, timestamps: &[NaiveDateTime]) -> Vec<Gap> {
        let step = self.cadence.duration();
        timestamps
            .windows(2)
            .filter_map(|pair| {
                let (prev, next) = (pair[0], pair[1]);
                let missing = (next - prev).num_minutes() / self.cadence.minutes() - 1;
                (missing > 0).then(|| Gap {
                    series: series.to_string(),
                    start: prev + step,
                    end: prev + step * missing as i32,
                    missing_intervals: missing as usize,
                })
            })
            .collect()
    }

    pub fn missing_total(gaps: &[Gap]) -> usize {
        gaps.iter().map(|g| g.missing_intervals).sum()
    }
}
