//! Daily event-volume trend checks.
//!
//! Works on the day buckets produced by `storage::daily_event_counts`. A day
//! is compared against the buckets before it; a day with no bucket counts as
//! zero events, so a total outage scores as the anomaly it is instead of
//! being skipped.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrendError {
    #[error("not enough baseline days: need {needed}, have {have}")]
    InsufficientBaseline { needed: usize, have: usize },
}

/// Judges whether one day's event volume is out of line with the days
/// preceding it.
#[derive(Debug, Clone, Copy)]
pub struct VolumeTrend {
    baseline_days: usize,
    z_threshold: f64,
}

/// Verdict on a single day's volume.
#[derive(Debug, Clone)]
pub struct VolumeAssessment {
    pub day: String,
    pub count: u64,
    pub z_score: f64,
    pub anomalous: bool,
}

impl Default for VolumeTrend {
    fn default() -> Self {
        Self {
            baseline_days: 14,
            z_threshold: 2.0,
        }
    }
}

impl VolumeTrend {
    /// Fewer baseline days than this and a z-score is meaningless.
    const MIN_BASELINE: usize = 3;

    pub fn new(baseline_days: usize, z_threshold: f64) -> Self {
        Self {
            baseline_days: baseline_days.max(Self::MIN_BASELINE),
            z_threshold,
        }
    }

    pub fn baseline_days(&self) -> usize {
        self.baseline_days
    }

    /// Score `day` against the most recent baseline buckets, excluding the
    /// day itself. `counts` is (YYYY-MM-DD, events) ordered oldest first;
    /// `day` missing from it means zero events that day.
    pub fn assess(
        &self,
        counts: &[(String, u64)],
        day: &str,
    ) -> Result<VolumeAssessment, TrendError> {
        let count = counts
            .iter()
            .find(|(d, _)| d.as_str() == day)
            .map(|(_, c)| *c)
            .unwrap_or(0);
        let baseline: Vec<f64> = counts
            .iter()
            .rev()
            .filter(|(d, _)| d.as_str() != day)
            .take(self.baseline_days)
            .map(|(_, c)| *c as f64)
            .collect();
        if baseline.len() < Self::MIN_BASELINE {
            return Err(TrendError::InsufficientBaseline {
                needed: Self::MIN_BASELINE,
                have: baseline.len(),
            });
        }

        let mean = baseline.iter().sum::<f64>() / baseline.len() as f64;
        let variance = baseline
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / baseline.len() as f64;
        let std_dev = variance.sqrt();

        let delta = count as f64 - mean;
        let z_score = if std_dev == 0.0 {
            // A flat baseline makes any departure from it infinitely odd.
            if delta.abs() < f64::EPSILON {
                0.0
            } else if delta > 0.0 {
                f64::INFINITY
            } else {
                f64::NEG_INFINITY
            }
        } else {
            delta / std_dev
        };

        Ok(VolumeAssessment {
            day: day.to_string(),
            count,
            z_score,
            anomalous: z_score.abs() > self.z_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buckets(counts: &[u64]) -> Vec<(String, u64)> {
        counts
            .iter()
            .enumerate()
            .map(|(i, &c)| (format!("2026-03-{:02}", i + 1), c))
            .collect()
    }

    #[test]
    fn test_steady_volume_is_normal() {
        let trend = VolumeTrend::default();
        let counts = buckets(&[10, 12, 11, 9, 10]);
        let a = trend.assess(&counts, "2026-03-05").unwrap();
        assert!(!a.anomalous);
        assert_eq!(a.count, 10);
    }

    #[test]
    fn test_spike_is_anomalous() {
        let trend = VolumeTrend::default();
        let counts = buckets(&[10, 12, 11, 9, 80]);
        let a = trend.assess(&counts, "2026-03-05").unwrap();
        assert!(a.anomalous);
        assert!(a.z_score > 2.0);
    }

    #[test]
    fn test_missing_day_scores_as_zero_events() {
        let trend = VolumeTrend::default();
        let counts = buckets(&[10, 12, 11, 9]);
        // A day with no bucket at all -- e.g. a full outage stopped ingestion.
        let a = trend.assess(&counts, "2026-03-05").unwrap();
        assert_eq!(a.count, 0);
        assert!(a.z_score < -2.0);
        assert!(a.anomalous);
    }

    #[test]
    fn test_flat_baseline_departure_is_infinite() {
        let trend = VolumeTrend::default();
        let counts = buckets(&[5, 5, 5, 5, 20]);
        let a = trend.assess(&counts, "2026-03-05").unwrap();
        assert!(a.z_score.is_infinite() && a.z_score > 0.0);
        assert!(a.anomalous);

        let same = trend
            .assess(&buckets(&[5, 5, 5, 5, 5]), "2026-03-05")
            .unwrap();
        assert_eq!(same.z_score, 0.0);
        assert!(!same.anomalous);
    }

    #[test]
    fn test_short_history_is_rejected() {
        let trend = VolumeTrend::default();
        let counts = buckets(&[4, 6, 5]);
        let err = trend.assess(&counts, "2026-03-03").unwrap_err();
        assert!(matches!(
            err,
            TrendError::InsufficientBaseline { needed: 3, have: 2 }
        ));
    }

    #[test]
    fn test_baseline_uses_only_most_recent_days() {
        // Old quiet days beyond the baseline span must not drag the mean.
        let trend = VolumeTrend::new(3, 2.0);
        let counts = buckets(&[0, 0, 0, 50, 52, 48, 50]);
        let a = trend.assess(&counts, "2026-03-07").unwrap();
        assert!(!a.anomalous);
    }
}
